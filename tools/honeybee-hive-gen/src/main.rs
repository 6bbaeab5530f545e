use std::{fs::File, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::ProgressBar;

/// Build a Honeybee hive from an ELF binary.
///
/// The hive is the precomputed control-flow index the online decoder
/// walks; build it once per binary. Set the environment variable
/// `RUST_LOG=debug` for logging.
#[derive(Parser)]
struct Cmdline {
    /// Path of the ELF binary to index
    #[arg(short, long)]
    input: PathBuf,
    /// Path to write the hive to
    #[arg(short, long)]
    output: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();

    let Cmdline { input, output } = Cmdline::parse();

    let file = File::open(&input).context("Failed to open input binary")?;
    // SAFETY: check the safety requirements of memmap2 documentation
    let buf = unsafe { memmap2::Mmap::map(&file).context("Failed to mmap input binary")? };

    let progress = ProgressBar::new_spinner();
    progress.enable_steady_tick(Duration::from_millis(100));

    progress.set_message("Disassembling executable sections");
    let blocks =
        honeybee_hive::extract_blocks(&buf).context("Failed to extract basic blocks")?;
    log::info!("Extracted {} basic blocks", blocks.len());

    progress.set_message(format!("Packing {} blocks", blocks.len()));
    honeybee_hive::write_hive_file(&output, &blocks).context("Failed to write hive")?;

    progress.finish_with_message(format!(
        "{} blocks -> {}",
        blocks.len(),
        output.display(),
    ));

    Ok(())
}

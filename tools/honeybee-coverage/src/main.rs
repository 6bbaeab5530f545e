use std::{
    convert::Infallible,
    ffi::{CString, OsString},
    os::unix::ffi::OsStrExt,
    path::PathBuf,
    ptr,
};

use anyhow::{Context, Result, bail, ensure};
use clap::Parser;
use hashbrown::HashSet;
use honeybee_analyzer::{
    ReportBlock, Session,
    capture::{CaptureSession, RANGE_FILTER_COUNT, RangeFilter},
};
use honeybee_hive::Hive;

/// Trace one run of a program and report its block and edge coverage.
///
/// The target is spawned suspended, pinned to CPU 0, traced through the
/// Honeybee driver with a single address-range filter, and decoded
/// against the hive once it exits. Output is `block_count`, `edge_count`,
/// then each block and each edge in first-seen order, one per line.
#[derive(Parser)]
struct Cmdline {
    /// Path of the hive built from the target binary
    hive: PathBuf,
    /// Start of the traced address range (inclusive), hex
    #[arg(value_parser = parse_hex)]
    filter_start: u64,
    /// End of the traced address range (exclusive), hex
    #[arg(value_parser = parse_hex)]
    filter_stop: u64,
    /// Target binary and its arguments
    #[arg(last = true, required = true)]
    target: Vec<OsString>,
}

fn parse_hex(value: &str) -> Result<u64, String> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    u64::from_str_radix(digits, 16).map_err(|err| err.to_string())
}

/// Collects unique blocks and AFL-style edges in first-seen order.
struct CoverageSink {
    hive_slide: u64,
    last_block: u64,
    blocks: Vec<u64>,
    block_set: HashSet<u64>,
    edges: Vec<u64>,
    edge_set: HashSet<u64>,
}

impl CoverageSink {
    fn new(hive_slide: u64) -> Self {
        Self {
            hive_slide,
            last_block: 0,
            blocks: Vec::new(),
            block_set: HashSet::new(),
            edges: Vec::new(),
            edge_set: HashSet::new(),
        }
    }
}

impl ReportBlock for CoverageSink {
    type Error = Infallible;

    #[inline]
    fn on_block(&mut self, unslid_ip: u64) -> Result<(), Self::Error> {
        let uvip = unslid_ip.wrapping_sub(self.hive_slide);
        let edge = (self.last_block << 1) ^ uvip;
        self.last_block = uvip;

        if self.edge_set.insert(edge) {
            self.edges.push(edge);
            // A repeated edge implies a repeated block, so the block set
            // only needs attention on fresh edges
            if self.block_set.insert(uvip) {
                self.blocks.push(uvip);
            }
        }

        Ok(())
    }
}

/// Fork the target with `PTRACE_TRACEME` set; the exec raises SIGTRAP and
/// leaves the child suspended until we continue it.
fn spawn_suspended(path: &CString, argv: &[CString]) -> Result<libc::pid_t> {
    let mut argv_ptrs: Vec<*const libc::c_char> =
        argv.iter().map(|arg| arg.as_ptr()).collect();
    argv_ptrs.push(ptr::null());

    // SAFETY: the child performs only async-signal-safe calls before exec
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        bail!("fork failed: {}", std::io::Error::last_os_error());
    }
    if pid == 0 {
        // Child
        unsafe {
            libc::ptrace(
                libc::PTRACE_TRACEME,
                0,
                ptr::null_mut::<libc::c_void>(),
                ptr::null_mut::<libc::c_void>(),
            );
            libc::execv(path.as_ptr(), argv_ptrs.as_ptr());
            // Only reached when exec fails
            libc::_exit(127);
        }
    }

    // Wait for the exec SIGTRAP
    let mut status = 0;
    // SAFETY: pid is our own child
    let waited = unsafe { libc::waitpid(pid, &raw mut status, 0) };
    ensure!(waited == pid, "waitpid failed while spawning");
    ensure!(
        libc::WIFSTOPPED(status),
        "target exited before tracing could be configured",
    );

    Ok(pid)
}

fn pin_to_cpu(pid: libc::pid_t, cpu: usize) -> Result<()> {
    // SAFETY: cpu_set_t is plain data; zeroed is a valid empty set
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(pid, size_of::<libc::cpu_set_t>(), &raw const set) != 0 {
            bail!(
                "could not pin target to CPU {cpu}: {}",
                std::io::Error::last_os_error(),
            );
        }
    }
    Ok(())
}

fn resume(pid: libc::pid_t) {
    // SAFETY: pid is our stopped child
    unsafe {
        libc::ptrace(
            libc::PTRACE_CONT,
            pid,
            ptr::null_mut::<libc::c_void>(),
            ptr::null_mut::<libc::c_void>(),
        );
    }
}

fn wait_for_exit(pid: libc::pid_t) -> Result<()> {
    loop {
        let mut status = 0;
        // SAFETY: pid is our own child
        let waited = unsafe { libc::waitpid(pid, &raw mut status, 0) };
        ensure!(waited == pid, "waitpid failed while tracing");
        if libc::WIFEXITED(status) || libc::WIFSIGNALED(status) {
            return Ok(());
        }
        // Forward any intermediate stop
        resume(pid);
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let Cmdline {
        hive,
        filter_start,
        filter_stop,
        target,
    } = Cmdline::parse();
    ensure!(filter_start < filter_stop, "empty filter range");

    let hive = Hive::load(&hive).context("Failed to load hive")?;
    log::info!(
        "Loaded hive: {} blocks, slide {:#x}",
        hive.block_count(),
        hive.uvip_slide(),
    );

    let mut capture = CaptureSession::new(0).context("Failed to open the Honeybee driver")?;
    capture
        .configure_buffers(400, 5)
        .context("Failed to configure trace buffers")?;

    let argv: Vec<CString> = target
        .iter()
        .map(|arg| CString::new(arg.as_bytes()).context("Argument contains a NUL byte"))
        .collect::<Result<_>>()?;
    let pid = spawn_suspended(&argv[0], &argv)?;
    pin_to_cpu(pid, 0)?;

    let mut filters = [RangeFilter::default(); RANGE_FILTER_COUNT];
    filters[0] = RangeFilter {
        start: filter_start,
        stop: filter_stop,
        enabled: 1,
    };
    #[expect(clippy::cast_sign_loss)]
    capture
        .configure_tracing(pid as u32, filters)
        .context("Failed to configure tracing")?;
    capture
        .set_enabled(true, true)
        .context("Failed to start tracing")?;

    resume(pid);
    wait_for_exit(pid)?;

    capture
        .set_enabled(false, false)
        .context("Failed to stop tracing")?;
    let trace = capture
        .terminated_trace()
        .context("Failed to fetch the trace buffer")?;
    log::info!("Captured {} trace bytes", trace.len());

    // Runtime addresses are unslid by the filter start, which is where
    // the traced image begins
    let mut session =
        Session::new(&hive, trace, filter_start).context("Failed to sync to the trace")?;
    let mut sink = CoverageSink::new(hive.uvip_slide());
    if let Err(err) = session.decode(&mut sink) {
        bail!("Decoder error: {err}");
    }

    println!("{}", sink.blocks.len());
    println!("{}", sink.edges.len());
    for block in &sink.blocks {
        println!("{block}");
    }
    for edge in &sink.edges {
        println!("{edge}");
    }

    Ok(())
}

//! Linear-sweep basic-block extraction from ELF images.

use derive_more::Display;
use iced_x86::{Decoder as InsnDecoder, DecoderOptions as InsnDecoderOptions, Instruction};
use object::{Object, ObjectSection, SectionFlags, elf};

use crate::error::HiveError;

/// Category of a block's terminator instruction.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum BlockCategory {
    /// Jcc / LOOP / LOOPcc
    #[display("conditional")]
    Conditional,
    /// Direct JMP or direct CALL with a literal PC-relative target
    #[display("direct")]
    Direct,
    /// Indirect JMP/CALL, RET, interrupts, syscalls, far transfers
    #[display("indirect")]
    IndirectOrUnknown,
}

/// A maximal instruction run ending at exactly one control-flow terminator.
#[derive(Debug, Clone, Copy)]
pub struct BasicBlock {
    /// Virtual address of the first instruction
    pub start: u64,
    /// Bytes up to but not including the terminator
    pub length: u32,
    /// Encoded length of the terminator instruction
    pub terminator_size: u16,
    /// What kind of terminator ends the block
    pub category: BlockCategory,
    /// The terminator's literal target, if it has one
    pub direct_target: Option<u64>,
}

impl BasicBlock {
    /// First address past the terminator.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.start + u64::from(self.length) + u64::from(self.terminator_size)
    }
}

/// Extract the ordered basic blocks of every executable section in an ELF
/// image.
///
/// Sections a decode failure cuts short still contribute the blocks swept
/// before the failure; other sections are unaffected. The returned list is
/// sorted by start address and covers no byte twice unless the section
/// table itself overlaps (which the hive builder rejects).
pub fn extract_blocks(image: &[u8]) -> Result<Vec<BasicBlock>, HiveError> {
    let file = object::File::parse(image)?;

    let mut blocks = Vec::with_capacity(0x1000);
    for section in file.sections() {
        let executable = match section.flags() {
            SectionFlags::Elf { sh_flags } => sh_flags & u64::from(elf::SHF_EXECINSTR) != 0,
            _ => false,
        };
        if !executable {
            continue;
        }
        let data = section.data()?;
        let swept = sweep_section(section.address(), data, &mut blocks);
        log::debug!(
            "Swept {} blocks from section {} at {:#x}",
            swept,
            section.name().unwrap_or("?"),
            section.address(),
        );
    }

    if blocks.is_empty() {
        return Err(HiveError::NoBlocks);
    }
    // Section table order is not address order
    blocks.sort_unstable_by_key(|block| block.start);

    Ok(blocks)
}

/// Sweep one executable region, appending a record per terminator found.
///
/// Returns the number of blocks appended.
#[expect(clippy::cast_possible_truncation)]
pub(crate) fn sweep_section(address: u64, data: &[u8], blocks: &mut Vec<BasicBlock>) -> usize {
    let mut decoder = InsnDecoder::with_ip(64, data, address, InsnDecoderOptions::NONE);
    let mut instruction = Instruction::default();
    let mut block_start = address;
    let mut swept = 0;

    while decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        if instruction.is_invalid() {
            // The rest of this section cannot be swept; a trailing
            // partial run is dropped just like one at section end
            log::warn!(
                "Undecodable instruction at {:#x}, ending sweep of this section",
                instruction.ip(),
            );
            break;
        }

        let Some((category, direct_target)) = classify_terminator(&instruction) else {
            continue;
        };

        blocks.push(BasicBlock {
            start: block_start,
            length: (instruction.ip() - block_start) as u32,
            terminator_size: instruction.len() as u16,
            category,
            direct_target,
        });
        swept += 1;
        block_start = instruction.next_ip();
    }

    swept
}

/// Classify an instruction as a block terminator, with its literal target
/// where one exists.
///
/// Returns [`None`] if the instruction does not change control flow.
fn classify_terminator(instruction: &Instruction) -> Option<(BlockCategory, Option<u64>)> {
    if instruction.is_jcc_short_or_near() || instruction.is_loop() || instruction.is_loopcc() {
        Some((
            BlockCategory::Conditional,
            Some(instruction.near_branch_target()),
        ))
    } else if instruction.is_jmp_short_or_near() || instruction.is_call_near() {
        Some((BlockCategory::Direct, Some(instruction.near_branch_target())))
    } else if instruction.is_jmp_near_indirect() || instruction.is_call_near_indirect() {
        Some((BlockCategory::IndirectOrUnknown, None))
    } else if !matches!(instruction.flow_control(), iced_x86::FlowControl::Next) {
        // RET, interrupts, syscalls, far transfers
        Some((BlockCategory::IndirectOrUnknown, None))
    } else {
        None
    }
}

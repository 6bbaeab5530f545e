//! Packing an ordered block list into the on-disk hive.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use zerocopy::{IntoBytes, byteorder::little_endian::U64};

use crate::{
    error::HiveError,
    extract::{BasicBlock, BlockCategory},
    format::{HIVE_MAGIC, INDIRECT_INDEX, RawBlockRecord, RawHiveHeader},
};

const LO31: u64 = INDIRECT_INDEX as u64;
const LO32: u64 = u32::MAX as u64;

/// Pack the successor-index field: `[{31 bits not-taken}, {zero},
/// {31 bits taken}, {conditional flag}]`.
fn packed_indices(not_taken: u64, taken: u64, conditional: bool) -> u64 {
    ((not_taken & LO31) << 33) | ((taken & LO31) << 1) | u64::from(conditional)
}

/// Pack the successor-uVIP field: `[{32 bits not-taken}, {32 bits taken}]`.
fn packed_uvips(not_taken: u64, taken: u64) -> u64 {
    (not_taken << 32) | (taken & LO32)
}

/// Find the id of the block containing `target`, if any.
///
/// The terminator's own address still counts as inside the block.
#[expect(clippy::cast_possible_truncation)]
fn lookup_block(sorted_blocks: &[BasicBlock], target: u64) -> Option<u32> {
    let upper = sorted_blocks.partition_point(|block| block.start <= target);
    let candidate = upper.checked_sub(1)?;
    let block = &sorted_blocks[candidate];
    (target <= block.start + u64::from(block.length)).then_some(candidate as u32)
}

fn write_u32_times<W: Write>(writer: &mut W, value: u32, times: u64) -> std::io::Result<()> {
    let bytes = value.to_le_bytes();
    for _ in 0..times {
        writer.write_all(&bytes)?;
    }
    Ok(())
}

/// Write a hive for `blocks` (sorted by start address, non-overlapping)
/// to `writer`.
///
/// Every failure mode is checked before the first byte is written, so a
/// failed build leaves nothing behind on a fresh stream.
#[expect(clippy::cast_possible_truncation)]
pub fn write_hive<W: Write>(writer: &mut W, blocks: &[BasicBlock]) -> Result<(), HiveError> {
    let (Some(first), Some(last)) = (blocks.first(), blocks.last()) else {
        return Err(HiveError::NoBlocks);
    };
    if blocks.len() as u64 >= u64::from(INDIRECT_INDEX) {
        return Err(HiveError::TooManyBlocks(blocks.len()));
    }
    for window in blocks.windows(2) {
        if window[1].start < window[0].end() {
            return Err(HiveError::OverlappingBlocks(window[1].start));
        }
    }

    let uvip_slide = first.start;
    let direct_map_count = last.end() - uvip_slide;
    if direct_map_count > LO32 {
        return Err(HiveError::ImageTooLarge(direct_map_count));
    }

    let header = RawHiveHeader {
        magic: U64::new(HIVE_MAGIC),
        block_count: U64::new(blocks.len() as u64),
        uvip_slide: U64::new(uvip_slide),
        direct_map_count: U64::new(direct_map_count),
    };
    writer.write_all(header.as_bytes())?;

    // Records: resolve each literal target against the sorted list; a
    // target that hits no block decodes like an indirect branch
    for (index, block) in blocks.iter().enumerate() {
        let resolved = block
            .direct_target
            .and_then(|target| lookup_block(blocks, target));
        let (taken_id, taken_uvip) = match resolved {
            Some(id) => (u64::from(id), blocks[id as usize].start - uvip_slide),
            None => (u64::from(INDIRECT_INDEX), 0),
        };

        let record = if block.category == BlockCategory::Conditional {
            RawBlockRecord {
                successor_indices: U64::new(packed_indices(
                    index as u64 + 1,
                    taken_id,
                    true,
                )),
                successor_ips: U64::new(packed_uvips(block.end() - uvip_slide, taken_uvip)),
            }
        } else {
            RawBlockRecord {
                successor_indices: U64::new(packed_indices(0, taken_id, false)),
                successor_ips: U64::new(packed_uvips(0, taken_uvip)),
            }
        };
        writer.write_all(record.as_bytes())?;
    }

    // Direct map: zeros for the gap before each block, then the block's
    // id for every byte it covers
    let mut cursor = uvip_slide;
    for (index, block) in blocks.iter().enumerate() {
        write_u32_times(writer, 0, block.start - cursor)?;
        write_u32_times(writer, index as u32, block.end() - block.start)?;
        cursor = block.end();
    }

    Ok(())
}

/// Build a hive file at `path` from `blocks`.
pub fn write_hive_file(path: impl AsRef<Path>, blocks: &[BasicBlock]) -> Result<(), HiveError> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_hive(&mut writer, blocks)?;
    writer.flush()?;
    Ok(())
}

//! On-disk hive layout and the loaded, queryable form.

use std::{fmt::Write as _, fs::File, path::Path};

use memmap2::Mmap;
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::little_endian::{U32, U64},
};

use crate::error::HiveError;

/// The file magic: `HONEYBEE`, read as a little-endian `u64`.
pub const HIVE_MAGIC: u64 = 0x4545_4259_454E_4F48;

/// Bit 0 of [`BlockRecord::successor_indices`]: the block ends in a
/// conditional branch and both successor lobes are meaningful.
pub const CONDITIONAL_FLAG: u64 = 1;

/// The 31-bit sentinel block id meaning "indirect or unknown successor,
/// ask the packet decoder for the target".
pub const INDIRECT_INDEX: u32 = (1 << 31) - 1;

/// The fixed-size hive file header, exactly as it appears on disk.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct RawHiveHeader {
    pub magic: U64,
    /// Number of 16-byte records in the blocks table
    pub block_count: U64,
    /// Bias subtracted from unslid virtual IPs to index the direct map
    pub uvip_slide: U64,
    /// Number of 32-bit slots in the direct map
    pub direct_map_count: U64,
}

/// One block record, exactly as it appears on disk.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct RawBlockRecord {
    pub successor_indices: U64,
    pub successor_ips: U64,
}

/// A single block's packed successor information.
///
/// `successor_indices` holds `[{31 bits not-taken id}, {zero}, {31 bits
/// taken id}, {conditional flag}]` from high to low; `successor_ips` holds
/// `[{32 bits not-taken uVIP}, {32 bits taken uVIP}]`. uVIPs are virtual
/// addresses slid down by the hive-wide [`Hive::uvip_slide`].
///
/// The layout is engineered so the walker selects the taken or not-taken
/// lobe with a single right-shift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRecord {
    /// Packed successor block ids plus the conditional flag
    pub successor_indices: u64,
    /// Packed successor uVIPs
    pub successor_ips: u64,
}

#[expect(clippy::cast_possible_truncation)]
impl BlockRecord {
    /// Does this block end in a conditional branch?
    #[must_use]
    pub fn is_conditional(&self) -> bool {
        self.successor_indices & CONDITIONAL_FLAG != 0
    }

    /// Block id of the taken successor, [`INDIRECT_INDEX`] if unknown
    #[must_use]
    pub fn taken_index(&self) -> u32 {
        ((self.successor_indices >> 1) as u32) & INDIRECT_INDEX
    }

    /// Block id of the not-taken successor; meaningful only for
    /// conditional blocks
    #[must_use]
    pub fn not_taken_index(&self) -> u32 {
        (self.successor_indices >> 33) as u32
    }

    /// uVIP of the taken successor
    #[must_use]
    pub fn taken_uvip(&self) -> u32 {
        self.successor_ips as u32
    }

    /// uVIP of the not-taken successor; meaningful only for conditional
    /// blocks
    #[must_use]
    pub fn not_taken_uvip(&self) -> u32 {
        (self.successor_ips >> 32) as u32
    }
}

/// A loaded hive.
///
/// Immutable after loading; walkers on different threads may share one
/// hive freely.
pub struct Hive {
    records: Box<[BlockRecord]>,
    uvip_slide: u64,
    direct_map: Box<[u32]>,
}

impl Hive {
    /// Load a hive file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, HiveError> {
        let file = File::open(path)?;
        // SAFETY: check the safety requirements of memmap2 documentation
        let map = unsafe { Mmap::map(&file)? };
        Self::parse(&map)
    }

    /// Parse a hive from raw bytes.
    ///
    /// Both tables are copied out; the input buffer is not retained.
    pub fn parse(bytes: &[u8]) -> Result<Self, HiveError> {
        let (header, rest) =
            RawHiveHeader::read_from_prefix(bytes).map_err(|_| HiveError::Truncated)?;
        let magic = header.magic.get();
        if magic != HIVE_MAGIC {
            return Err(HiveError::BadMagic { found: magic });
        }

        let records_size = usize::try_from(header.block_count.get())
            .ok()
            .and_then(|count| count.checked_mul(size_of::<RawBlockRecord>()))
            .ok_or(HiveError::HazardousCounts)?;
        let map_size = usize::try_from(header.direct_map_count.get())
            .ok()
            .and_then(|count| count.checked_mul(size_of::<U32>()))
            .ok_or(HiveError::HazardousCounts)?;
        let Some(records_bytes) = rest.get(..records_size) else {
            return Err(HiveError::Truncated);
        };
        let Some(map_bytes) = rest.get(records_size..).and_then(|rest| rest.get(..map_size))
        else {
            return Err(HiveError::Truncated);
        };

        let raw_records =
            <[RawBlockRecord]>::ref_from_bytes(records_bytes).map_err(|_| HiveError::Truncated)?;
        let records = raw_records
            .iter()
            .map(|record| BlockRecord {
                successor_indices: record.successor_indices.get(),
                successor_ips: record.successor_ips.get(),
            })
            .collect();

        let raw_map = <[U32]>::ref_from_bytes(map_bytes).map_err(|_| HiveError::Truncated)?;
        let direct_map = raw_map.iter().map(|v| v.get()).collect();

        Ok(Self {
            records,
            uvip_slide: header.uvip_slide.get(),
            direct_map,
        })
    }

    /// The block records, indexed by block id.
    #[must_use]
    pub fn records(&self) -> &[BlockRecord] {
        &self.records
    }

    /// Number of blocks in this hive.
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.records.len() as u64
    }

    /// The bias subtracted from unslid virtual IPs to form uVIPs and
    /// direct-map indices. This is the lowest block start in the binary.
    #[must_use]
    pub fn uvip_slide(&self) -> u64 {
        self.uvip_slide
    }

    /// Get the block id containing a given unslid virtual address, or
    /// [`None`] if the address is outside the executable extent.
    ///
    /// Addresses below the slide wrap to huge map indices and fall out of
    /// range, so no signed arithmetic is needed.
    #[must_use]
    pub fn block_index_for_unslid(&self, unslid_ip: u64) -> Option<u32> {
        let map_index = unslid_ip.wrapping_sub(self.uvip_slide);
        self.direct_map
            .get(usize::try_from(map_index).ok()?)
            .copied()
    }

    /// Render a human-readable description of one block record.
    #[must_use]
    pub fn describe_block(&self, index: u64) -> Option<String> {
        let record = self.records.get(usize::try_from(index).ok()?)?;
        let mut description = String::new();
        let _ = writeln!(
            description,
            "Block {index}: conditional={}",
            u8::from(record.is_conditional()),
        );
        let _ = writeln!(
            description,
            "Taken index = {}, Not-taken index = {}",
            record.taken_index(),
            record.not_taken_index(),
        );
        let _ = write!(
            description,
            "Taken uVIP = {:#x}, Not-taken uVIP = {:#x}",
            record.taken_uvip(),
            record.not_taken_uvip(),
        );
        Some(description)
    }

    #[cfg(test)]
    pub(crate) fn direct_map(&self) -> &[u32] {
        &self.direct_map
    }
}

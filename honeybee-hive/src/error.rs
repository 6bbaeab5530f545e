//! This module contains definition of errors made when building or loading hives

use thiserror::Error;

/// Error for hive extraction, construction and loading
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HiveError {
    /// I/O error
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    /// The binary image could not be parsed
    #[error("Unparsable binary image")]
    Image(#[from] object::read::Error),
    /// The file is not a hive
    #[error("Bad hive magic: {found:#018x}")]
    BadMagic {
        /// The first eight bytes actually found
        found: u64,
    },
    /// The file ended before the tables it declares
    #[error("Hive file truncated")]
    Truncated,
    /// A declared table size overflows
    #[error("Hazardous hive counts (table size overflows)")]
    HazardousCounts,
    /// The binary contains no decodable basic blocks
    #[error("Binary produced no basic blocks")]
    NoBlocks,
    /// Two blocks cover the same byte
    #[error("Basic blocks overlap at address {0:#x}")]
    OverlappingBlocks(u64),
    /// More blocks than 31-bit ids can name
    #[error("Too many basic blocks ({0}) for 31-bit block ids")]
    TooManyBlocks(usize),
    /// The executable extent does not fit the 32-bit indexed direct map
    #[error("Executable extent of {0:#x} bytes exceeds the direct map limit")]
    ImageTooLarge(u64),
}

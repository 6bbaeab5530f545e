//! This module contains definition of errors made when walking a trace

use honeybee_decoder::DecoderError;
use perfect_derive::perfect_derive;
use thiserror::Error;

use crate::walker::ReportBlock;

/// Error for a block walk
#[derive(Error)]
#[perfect_derive(Debug)]
#[non_exhaustive]
pub enum WalkError<S: ReportBlock> {
    /// Block sink error
    #[error("Block sink error")]
    Sink(#[source] S::Error),
    /// Decoder error
    #[error(transparent)]
    Decoder(#[from] DecoderError),
    /// The trace landed on an address the hive has no block for
    #[error("No block mapping for unslid address {0:#x}")]
    NoMap(u64),
}

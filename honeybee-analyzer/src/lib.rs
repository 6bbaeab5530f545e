//! Block-level trace analysis.
//!
//! A [`Session`] binds an immutable [`Hive`] to a [`PtDecoder`] over one
//! captured trace and walks the executed basic blocks: at each conditional
//! block it consumes one taken/not-taken bit, at each indirect block one
//! target IP, and it reports every block it passes through to a
//! caller-supplied [`ReportBlock`] sink.

#[cfg(target_os = "linux")]
pub mod capture;
mod error;
mod walker;

use honeybee_decoder::{DecoderError, PtDecoder};
use honeybee_hive::Hive;

pub use crate::{error::WalkError, walker::ReportBlock};

/// One trace decode in progress: a borrowed hive, an owned decoder over
/// the borrowed trace bytes, and the trace slide.
///
/// The slide is subtracted from every address the trace reports to get the
/// unslid address the hive was built against (for a range-filtered
/// capture, the filter start).
pub struct Session<'a> {
    hive: &'a Hive,
    decoder: PtDecoder<'a>,
    trace_slide: u64,
}

impl<'a> Session<'a> {
    /// Bind a hive to a codon-terminated trace buffer and sync the
    /// decoder to the first PSB.
    pub fn new(hive: &'a Hive, trace: &'a [u8], trace_slide: u64) -> Result<Self, DecoderError> {
        let mut decoder = PtDecoder::new(trace);
        decoder.sync_forward()?;
        Ok(Self {
            hive,
            decoder,
            trace_slide,
        })
    }

    /// Walk every block the trace executed, reporting each to `sink`.
    ///
    /// Returns normally when the stream ends; a sink error cancels the
    /// walk.
    pub fn decode<S: ReportBlock>(&mut self, sink: &mut S) -> Result<(), WalkError<S>> {
        walker::walk(self, sink)
    }
}

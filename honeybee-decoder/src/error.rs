//! This module contains definition of decoder status codes

use thiserror::Error;

/// Error (and terminal status) kinds for the PT decoder.
///
/// [`EndOfStream`][DecoderError::EndOfStream] is the expected way for a
/// decode to finish; everything else is a genuine failure.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum DecoderError {
    /// The stop codon was consumed; the trace is exhausted
    #[error("End of trace stream")]
    EndOfStream,
    /// No PSB packet found in the remaining buffer
    #[error("No PSB packet found")]
    CouldNotSync,
    /// A branch answer was requested that the stream does not have.
    ///
    /// This almost always means the hive and the traced binary disagree
    /// (wrong image or wrong slide), not that the stream is corrupt.
    #[error("Trace and hive disagree (trace desync)")]
    TraceDesync,
    /// A well-formed but unimplemented packet appeared in the stream
    #[error("Unsupported trace packet (byte {byte:#04x})")]
    UnsupportedPacket {
        /// The dispatch byte that selected the packet
        byte: u8,
    },
    /// The buffer ended without a stop codon.
    ///
    /// The capture layer broke the termination contract; treat this as an
    /// internal invariant violation.
    #[error("Trace buffer ended without a stop codon")]
    UnexpectedEof,
}

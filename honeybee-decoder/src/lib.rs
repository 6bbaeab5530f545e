//! Pull-based Intel PT packet decoder.
//!
//! The decoder advances through raw PT bytes and distills them into two
//! streams of branch answers: a FIFO ring of taken/not-taken bits (from
//! TNT packets) and single-slot indirect/override targets (from TIP-class
//! packets). Callers do not see packets at all; they ask
//! [`PtDecoder::query_tnt`] at each conditional branch and
//! [`PtDecoder::query_indirect`] at each indirect branch, and the decoder
//! consumes exactly as much of the stream as those questions require.
//!
//! Time packets (TSC, MTC, CYC, TMA), VMX packets, and PTWRITE/power
//! events are out of scope and reported as unsupported.

#![no_std]

extern crate alloc;

mod cache;
mod dispatch;
pub mod error;

use crate::cache::DecoderCache;
pub use crate::error::DecoderError;

/// The byte the capture layer places immediately after the last valid
/// trace byte. Dispatch-wise this is a short-TNT pattern the hardware can
/// emit but the Honeybee driver's packet stream never produces bare, so it
/// doubles as an unambiguous end-of-stream marker.
pub const STOP_CODON: u8 = 0x55;

/// The 16-byte PSB synchronization pattern.
pub const PSB_BYTES: [u8; 16] = [
    0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82,
];

/// Outcome of asking for the next conditional-branch answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TntQuery {
    /// The branch was taken
    Taken,
    /// The branch was not taken
    NotTaken,
    /// An event redirected the flow; resume decoding at this IP instead
    /// of following either edge
    Override(u64),
}

/// Outcome of asking for the next indirect-branch target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndirectQuery {
    /// The indirect branch lands here
    Branch(u64),
    /// An event redirected the flow before the branch; resume here
    Override(u64),
}

/// A stateful decoder over one borrowed trace buffer.
///
/// The buffer's final byte must be the [`STOP_CODON`] placed by the
/// capture layer (see [`terminate_trace_buffer`]); the codon is what lets
/// the dispatch loop run without a length check per packet.
pub struct PtDecoder<'a> {
    pub(crate) buf: &'a [u8],
    pub(crate) pos: usize,
    /// Accumulator for compressed IPs: the last reconstructed IP,
    /// sign-extended from bit 47
    pub(crate) last_tip: u64,
    /// Set by OVF; makes the next FUP an override instead of a no-op
    pub(crate) in_overflow: bool,
    pub(crate) cache: DecoderCache,
}

impl<'a> PtDecoder<'a> {
    /// Bind a decoder to a codon-terminated trace buffer.
    #[must_use]
    pub fn new(trace: &'a [u8]) -> Self {
        Self {
            buf: trace,
            pos: 0,
            last_tip: 0,
            in_overflow: false,
            cache: DecoderCache::new(),
        }
    }

    /// Clear all decode state but keep the buffer binding.
    pub fn reset(&mut self) {
        self.pos = 0;
        self.last_tip = 0;
        self.in_overflow = false;
        self.cache.clear();
    }

    /// Advance the cursor to the next PSB at or after it.
    pub fn sync_forward(&mut self) -> Result<(), DecoderError> {
        let tail = self.buf.get(self.pos..).unwrap_or_default();
        let Some(offset) = memchr::memmem::find(tail, &PSB_BYTES) else {
            return Err(DecoderError::CouldNotSync);
        };
        self.pos += offset;
        log::trace!("Synced forward to PSB at trace offset {:#x}", self.pos);
        Ok(())
    }

    /// Run the decode loop until a cache is near-full, a TIP-class packet
    /// must be consumed, or the stream ends.
    ///
    /// Most callers want the query methods instead; they invoke this on
    /// demand.
    pub fn decode_until_caches_filled(&mut self) -> Result<(), DecoderError> {
        dispatch::run(self)
    }

    /// Answer for the next conditional branch.
    ///
    /// Refills the TNT ring from the stream if it is empty. If the stream
    /// has no more TNT bits but a pending override, the override is
    /// returned (the packet that raised it preceded any later TNTs in the
    /// stream, so it is always handed out first); otherwise an empty
    /// refill is a desync.
    pub fn query_tnt(&mut self) -> Result<TntQuery, DecoderError> {
        if self.cache.tnt.is_empty() {
            match self.decode_until_caches_filled() {
                Ok(()) | Err(DecoderError::EndOfStream) => {}
                Err(err) => return Err(err),
            }
            if self.cache.tnt.is_empty() {
                if let Some(target) = self.cache.override_target.take() {
                    return Ok(TntQuery::Override(target));
                }
                return Err(DecoderError::TraceDesync);
            }
        }

        Ok(if self.cache.tnt.pop_front() {
            TntQuery::Taken
        } else {
            TntQuery::NotTaken
        })
    }

    /// Target of the next indirect branch.
    ///
    /// A pending override always wins over a queued indirect target. If
    /// neither is available the decoder runs until one is; a decode pass
    /// that produces neither is a desync, and end-of-stream propagates to
    /// the caller as the normal termination signal.
    pub fn query_indirect(&mut self) -> Result<IndirectQuery, DecoderError> {
        loop {
            if let Some(target) = self.cache.override_target.take() {
                return Ok(IndirectQuery::Override(target));
            }
            if let Some(target) = self.cache.next_indirect_target.take() {
                return Ok(IndirectQuery::Branch(target));
            }

            self.decode_until_caches_filled()?;
            if self.cache.override_target.is_none() && self.cache.next_indirect_target.is_none() {
                return Err(DecoderError::TraceDesync);
            }
        }
    }
}

/// Stamp the stop codon after the last valid packet byte and return the
/// codon-terminated prefix.
///
/// When the trace exactly filled the buffer the codon lands on the final
/// byte instead, truncating one packet; the ring-buffer contract accepts
/// this so the dispatch loop never needs a length check.
#[must_use]
pub fn terminate_trace_buffer(buffer: &mut [u8], packet_bytes: usize) -> &[u8] {
    if buffer.is_empty() {
        return buffer;
    }
    let codon_at = packet_bytes.min(buffer.len() - 1);
    buffer[codon_at] = STOP_CODON;
    &buffer[..=codon_at]
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;

    fn psb(stream: &mut Vec<u8>) {
        stream.extend_from_slice(&PSB_BYTES);
    }

    fn tip_class(stream: &mut Vec<u8>, pattern: u8, ip: u64) {
        // Six-byte form; the decoder sign-extends from bit 47
        stream.push((0b011 << 5) | pattern);
        stream.extend_from_slice(&ip.to_le_bytes()[..6]);
    }

    fn tip(stream: &mut Vec<u8>, ip: u64) {
        tip_class(stream, 0b0_1101, ip);
    }

    fn tip_pge(stream: &mut Vec<u8>, ip: u64) {
        tip_class(stream, 0b1_0001, ip);
    }

    fn tip_pgd(stream: &mut Vec<u8>, ip: u64) {
        tip_class(stream, 0b0_0001, ip);
    }

    fn fup(stream: &mut Vec<u8>, ip: u64) {
        tip_class(stream, 0b1_1101, ip);
    }

    fn ovf(stream: &mut Vec<u8>) {
        stream.extend_from_slice(&[0x02, 0xF3]);
    }

    fn short_tnt(stream: &mut Vec<u8>, bits: &[bool]) {
        assert!(!bits.is_empty() && bits.len() <= 6);
        let mut byte = 1u8;
        for &taken in bits {
            byte = (byte << 1) | u8::from(taken);
        }
        stream.push(byte << 1);
    }

    fn long_tnt(stream: &mut Vec<u8>, bits: &[bool]) {
        assert!(!bits.is_empty() && bits.len() <= 47);
        let mut payload = 1u64;
        for &taken in bits {
            payload = (payload << 1) | u64::from(taken);
        }
        stream.extend_from_slice(&((payload << 16) | 0xA302).to_le_bytes());
    }

    fn stop(stream: &mut Vec<u8>) {
        stream.push(STOP_CODON);
    }

    #[test]
    fn test_sync_forward_finds_psb_past_garbage() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        psb(&mut stream);
        tip(&mut stream, 0x1000);
        stop(&mut stream);

        let mut decoder = PtDecoder::new(&stream);
        decoder.sync_forward().unwrap();
        assert_eq!(decoder.query_indirect(), Ok(IndirectQuery::Branch(0x1000)));
    }

    #[test]
    fn test_sync_forward_without_psb_fails() {
        let stream = [0xDE, 0xAD, STOP_CODON];
        let mut decoder = PtDecoder::new(&stream);
        assert_eq!(decoder.sync_forward(), Err(DecoderError::CouldNotSync));
    }

    #[test]
    fn test_short_tnt_bits_drain_oldest_first() {
        let mut stream = Vec::new();
        psb(&mut stream);
        short_tnt(&mut stream, &[true, false, true, true]);
        stop(&mut stream);

        let mut decoder = PtDecoder::new(&stream);
        decoder.sync_forward().unwrap();
        assert_eq!(decoder.query_tnt(), Ok(TntQuery::Taken));
        assert_eq!(decoder.query_tnt(), Ok(TntQuery::NotTaken));
        assert_eq!(decoder.query_tnt(), Ok(TntQuery::Taken));
        assert_eq!(decoder.query_tnt(), Ok(TntQuery::Taken));
        assert_eq!(decoder.query_tnt(), Err(DecoderError::TraceDesync));
    }

    #[test]
    fn test_long_tnt_carries_up_to_47_bits() {
        let bits: Vec<bool> = (0..47).map(|index| index % 3 != 0).collect();
        let mut stream = Vec::new();
        psb(&mut stream);
        long_tnt(&mut stream, &bits);
        stop(&mut stream);

        let mut decoder = PtDecoder::new(&stream);
        decoder.sync_forward().unwrap();
        for &expected in &bits {
            let expected = if expected {
                TntQuery::Taken
            } else {
                TntQuery::NotTaken
            };
            assert_eq!(decoder.query_tnt(), Ok(expected));
        }
        assert_eq!(decoder.query_tnt(), Err(DecoderError::TraceDesync));
    }

    #[test]
    fn test_ip_compression_identity() {
        // Re-encoding the current IP with 1..=4 words must decompress to
        // the same IP
        let ip = 0xFFFF_8000_1234_5678u64;
        for words in 1u8..=4 {
            let mut stream = Vec::new();
            psb(&mut stream);
            tip(&mut stream, ip);
            stream.push((words << 5) | 0b0_1101);
            stream.extend_from_slice(&ip.to_le_bytes()[..usize::from(words) * 2]);
            stop(&mut stream);

            let mut decoder = PtDecoder::new(&stream);
            decoder.sync_forward().unwrap();
            assert_eq!(decoder.query_indirect(), Ok(IndirectQuery::Branch(ip)));
            assert_eq!(
                decoder.query_indirect(),
                Ok(IndirectQuery::Branch(ip)),
                "identity failed for {words} words",
            );
        }
    }

    #[test]
    fn test_pge_with_unchanged_ip_is_ignored() {
        let mut stream = Vec::new();
        psb(&mut stream);
        tip(&mut stream, 0x4000);
        tip_pge(&mut stream, 0x4000);
        stop(&mut stream);

        let mut decoder = PtDecoder::new(&stream);
        decoder.sync_forward().unwrap();
        assert_eq!(decoder.query_indirect(), Ok(IndirectQuery::Branch(0x4000)));
        assert_eq!(decoder.query_indirect(), Err(DecoderError::EndOfStream));
    }

    #[test]
    fn test_pge_with_new_ip_raises_override() {
        let mut stream = Vec::new();
        psb(&mut stream);
        tip(&mut stream, 0x4000);
        tip_pge(&mut stream, 0x5000);
        stop(&mut stream);

        let mut decoder = PtDecoder::new(&stream);
        decoder.sync_forward().unwrap();
        assert_eq!(decoder.query_indirect(), Ok(IndirectQuery::Branch(0x4000)));
        assert_eq!(
            decoder.query_indirect(),
            Ok(IndirectQuery::Override(0x5000))
        );
    }

    #[test]
    fn test_pgd_produces_no_answer() {
        let mut stream = Vec::new();
        psb(&mut stream);
        tip_pgd(&mut stream, 0x6000);
        stop(&mut stream);

        let mut decoder = PtDecoder::new(&stream);
        decoder.sync_forward().unwrap();
        assert_eq!(decoder.query_indirect(), Err(DecoderError::EndOfStream));
    }

    #[test]
    fn test_fup_outside_overflow_is_ignored() {
        let mut stream = Vec::new();
        psb(&mut stream);
        fup(&mut stream, 0x7000);
        stop(&mut stream);

        let mut decoder = PtDecoder::new(&stream);
        decoder.sync_forward().unwrap();
        assert_eq!(decoder.query_indirect(), Err(DecoderError::EndOfStream));
    }

    #[test]
    fn test_overflow_fup_overrides_and_clears_flag() {
        let mut stream = Vec::new();
        psb(&mut stream);
        tip(&mut stream, 0x1000);
        ovf(&mut stream);
        fup(&mut stream, 0x00DE_ADBE_EF00);
        // A second FUP after recovery must be ignored again
        fup(&mut stream, 0x9999);
        stop(&mut stream);

        let mut decoder = PtDecoder::new(&stream);
        decoder.sync_forward().unwrap();
        assert_eq!(decoder.query_indirect(), Ok(IndirectQuery::Branch(0x1000)));
        assert_eq!(
            decoder.query_indirect(),
            Ok(IndirectQuery::Override(0x00DE_ADBE_EF00))
        );
        assert_eq!(decoder.query_indirect(), Err(DecoderError::EndOfStream));
    }

    #[test]
    fn test_override_precedes_queued_tnt_bits() {
        // OVF + FUP followed by TNTs: the empty-ring query path must hand
        // out the override before touching later TNT bits is possible
        let mut stream = Vec::new();
        psb(&mut stream);
        ovf(&mut stream);
        fup(&mut stream, 0x8000);
        short_tnt(&mut stream, &[true]);
        stop(&mut stream);

        let mut decoder = PtDecoder::new(&stream);
        decoder.sync_forward().unwrap();
        assert_eq!(decoder.query_tnt(), Ok(TntQuery::Override(0x8000)));
        assert_eq!(decoder.query_tnt(), Ok(TntQuery::Taken));
    }

    #[test]
    fn test_skippable_packets_are_skipped() {
        let mut stream = Vec::new();
        psb(&mut stream);
        // PAD run
        stream.extend_from_slice(&[0x00; 5]);
        // MODE
        stream.extend_from_slice(&[0x99, 0x01]);
        // CBR
        stream.extend_from_slice(&[0x02, 0x03, 0x2A, 0x00]);
        // PSBEND
        stream.extend_from_slice(&[0x02, 0x23]);
        // MNT
        stream.extend_from_slice(&[0x02, 0xC3, 0x88, 1, 2, 3, 4, 5, 6, 7, 8]);
        tip(&mut stream, 0x2000);
        stop(&mut stream);

        let mut decoder = PtDecoder::new(&stream);
        decoder.sync_forward().unwrap();
        assert_eq!(decoder.query_indirect(), Ok(IndirectQuery::Branch(0x2000)));
    }

    #[test]
    fn test_unsupported_packets_are_reported() {
        // PIP
        let mut stream = Vec::new();
        psb(&mut stream);
        stream.extend_from_slice(&[0x02, 0x43]);
        stop(&mut stream);
        let mut decoder = PtDecoder::new(&stream);
        decoder.sync_forward().unwrap();
        assert_eq!(
            decoder.query_indirect(),
            Err(DecoderError::UnsupportedPacket { byte: 0x43 })
        );

        // CYC
        let mut stream = Vec::new();
        psb(&mut stream);
        stream.push(0x03);
        stop(&mut stream);
        let mut decoder = PtDecoder::new(&stream);
        decoder.sync_forward().unwrap();
        assert_eq!(
            decoder.query_indirect(),
            Err(DecoderError::UnsupportedPacket { byte: 0x03 })
        );
    }

    #[test]
    fn test_missing_codon_is_an_eof_error() {
        let mut stream = Vec::new();
        psb(&mut stream);
        tip(&mut stream, 0x3000);

        let mut decoder = PtDecoder::new(&stream);
        decoder.sync_forward().unwrap();
        assert_eq!(decoder.query_indirect(), Ok(IndirectQuery::Branch(0x3000)));
        assert_eq!(decoder.query_indirect(), Err(DecoderError::UnexpectedEof));
    }

    #[test]
    fn test_near_full_ring_yields_and_resumes() {
        // 1500 long TNTs of 47 bits = 70500 bits, more than the ring
        // holds at once; drained in lockstep they must all come back in
        // order
        let bits: Vec<bool> = (0..47).map(|index| index % 5 < 2).collect();
        let mut stream = Vec::new();
        psb(&mut stream);
        for _ in 0..1500 {
            long_tnt(&mut stream, &bits);
        }
        stop(&mut stream);

        let mut decoder = PtDecoder::new(&stream);
        decoder.sync_forward().unwrap();
        for round in 0..1500 {
            for (index, &expected) in bits.iter().enumerate() {
                let expected = if expected {
                    TntQuery::Taken
                } else {
                    TntQuery::NotTaken
                };
                assert_eq!(
                    decoder.query_tnt(),
                    Ok(expected),
                    "round {round}, bit {index}",
                );
            }
        }
        assert_eq!(decoder.query_tnt(), Err(DecoderError::TraceDesync));
    }

    #[test]
    fn test_decode_is_deterministic() {
        fn drain(stream: &[u8]) -> (Vec<TntQuery>, Vec<IndirectQuery>) {
            let mut decoder = PtDecoder::new(stream);
            decoder.sync_forward().unwrap();
            let mut targets = Vec::new();
            let mut bits = Vec::new();
            while let Ok(target) = decoder.query_indirect() {
                targets.push(target);
                while let Ok(bit) = decoder.query_tnt() {
                    bits.push(bit);
                }
            }
            (bits, targets)
        }

        let mut stream = Vec::new();
        psb(&mut stream);
        tip(&mut stream, 0x1000);
        short_tnt(&mut stream, &[true, true, false]);
        tip(&mut stream, 0x2000);
        long_tnt(&mut stream, &[false, true, false, true]);
        tip_pge(&mut stream, 0x3000);
        stop(&mut stream);

        let first = drain(&stream);
        let second = drain(&stream);
        assert_eq!(first, second);
    }

    #[test]
    fn test_reset_rewinds_to_the_buffer_start() {
        let mut stream = Vec::new();
        psb(&mut stream);
        tip(&mut stream, 0x1000);
        stop(&mut stream);

        let mut decoder = PtDecoder::new(&stream);
        decoder.sync_forward().unwrap();
        assert_eq!(decoder.query_indirect(), Ok(IndirectQuery::Branch(0x1000)));
        decoder.reset();
        decoder.sync_forward().unwrap();
        assert_eq!(decoder.query_indirect(), Ok(IndirectQuery::Branch(0x1000)));
    }

    #[test]
    fn test_terminate_trace_buffer_stamps_codon() {
        let mut buffer = [1, 2, 3, 4];
        let trace = terminate_trace_buffer(&mut buffer, 2);
        assert_eq!(trace, &[1, 2, STOP_CODON]);
    }

    #[test]
    fn test_terminate_trace_buffer_truncates_when_full() {
        let mut buffer = [1, 2, 3, 4];
        let trace = terminate_trace_buffer(&mut buffer, 4);
        assert_eq!(trace, &[1, 2, 3, STOP_CODON]);
    }
}

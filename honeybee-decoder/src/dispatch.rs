//! Level-1 and level-2 packet dispatch for the pull-based decode loop.
//!
//! The first byte of every packet selects a handler through a 256-entry
//! classification table built at compile time. Packets whose encodings
//! share the `0x02` escape byte are resolved by a second match on the
//! following byte.

use crate::{PtDecoder, STOP_CODON, error::DecoderError};

/// What a packet's first byte means.
#[derive(Clone, Copy)]
enum Level1 {
    Pad,
    ShortTnt,
    Tip,
    TipPge,
    TipPgd,
    Fup,
    Level2,
    Mode,
    StopCodon,
    Unsupported,
}

const LEVEL1_KINDS: [Level1; 256] = const {
    let mut kinds = [Level1::Unsupported; 256];

    let mut index = 0;
    loop {
        if index >= 256 {
            break;
        }
        let byte = index as u8;
        index += 1;

        let kind = if byte == 0b0000_0000 {
            // 00000000
            Level1::Pad
        } else if byte == 0b0000_0010 {
            // 00000010, escape to the two-byte encodings
            Level1::Level2
        } else if byte == STOP_CODON {
            // 01010101, repurposed as end-of-stream
            Level1::StopCodon
        } else if byte & 0b0000_0001 == 0b0000_0000 {
            // xxxxxxx0 but not PAD and not the escape
            Level1::ShortTnt
        } else if byte & 0b0001_1111 == 0b0000_1101 {
            // xxx01101
            Level1::Tip
        } else if byte & 0b0001_1111 == 0b0001_0001 {
            // xxx10001
            Level1::TipPge
        } else if byte & 0b0001_1111 == 0b0000_0001 {
            // xxx00001
            Level1::TipPgd
        } else if byte & 0b0001_1111 == 0b0001_1101 {
            // xxx11101
            Level1::Fup
        } else if byte == 0b1001_1001 {
            // 10011001
            Level1::Mode
        } else {
            // CYC, MTC, TSC and everything undefined
            Level1::Unsupported
        };

        kinds[byte as usize] = kind;
    }

    kinds
};

const MODE_LEN: usize = 2;
const CBR_LEN: usize = 4;
const PSB_LEN: usize = 16;
const PSBEND_LEN: usize = 2;
const OVF_LEN: usize = 2;
const MNT_LEN: usize = 11;
const LONG_TNT_LEN: usize = 8;

/// Advance through packets until a cache is near-full, a TIP-class packet
/// hands control back, or the stream ends.
pub(crate) fn run(decoder: &mut PtDecoder<'_>) -> Result<(), DecoderError> {
    loop {
        let Some(&byte) = decoder.buf.get(decoder.pos) else {
            return Err(DecoderError::UnexpectedEof);
        };

        match LEVEL1_KINDS[usize::from(byte)] {
            Level1::Pad => {
                decoder.pos += 1;
                // Fast path for continuous PAD packets
                while let Some(&0) = decoder.buf.get(decoder.pos) {
                    decoder.pos += 1;
                }
            }
            Level1::ShortTnt => {
                push_short_tnt(decoder, byte);
                decoder.pos += 1;
                if decoder.cache.tnt.is_near_full() {
                    return Ok(());
                }
            }
            Level1::Tip => {
                if let Some(ip) = reconstruct_ip(decoder, byte)? {
                    decoder.cache.next_indirect_target = Some(ip);
                }
                // The walker must consume the target before we go on
                return Ok(());
            }
            Level1::TipPge => {
                let previous = decoder.last_tip;
                let ip = reconstruct_ip(decoder, byte)?;
                // Generation is (re)starting at a fresh address, so a
                // pending overflow FUP no longer applies
                decoder.in_overflow = false;
                if let Some(ip) = ip {
                    if ip != previous {
                        decoder.cache.override_target = Some(ip);
                        return Ok(());
                    }
                }
            }
            Level1::TipPgd => {
                // Updates last_tip only; disabling produces no answer
                reconstruct_ip(decoder, byte)?;
            }
            Level1::Fup => {
                // Outside overflow recovery, FUPs are bound to events we
                // do not model and carry no branch answer
                let ip = reconstruct_ip(decoder, byte)?;
                if decoder.in_overflow {
                    if let Some(ip) = ip {
                        decoder.in_overflow = false;
                        decoder.cache.override_target = Some(ip);
                        return Ok(());
                    }
                }
            }
            Level1::Mode => {
                decoder.pos += MODE_LEN;
            }
            Level1::Level2 => {
                if level2(decoder)? {
                    return Ok(());
                }
            }
            Level1::StopCodon => {
                return Err(DecoderError::EndOfStream);
            }
            Level1::Unsupported => {
                return Err(DecoderError::UnsupportedPacket { byte });
            }
        }
    }
}

/// Handle a packet behind the `0x02` escape byte. Returns `true` when the
/// caller must yield (a TNT append left the ring near-full).
fn level2(decoder: &mut PtDecoder<'_>) -> Result<bool, DecoderError> {
    let Some(&byte) = decoder.buf.get(decoder.pos + 1) else {
        return Err(DecoderError::UnexpectedEof);
    };

    match byte {
        0b0000_0011 => {
            // CBR
            decoder.pos += CBR_LEN;
        }
        0b0010_0011 => {
            // PSBEND
            decoder.pos += PSBEND_LEN;
        }
        0b1000_0010 => {
            // PSB
            decoder.pos += PSB_LEN;
        }
        0b1100_0011 => {
            // MNT
            decoder.pos += MNT_LEN;
        }
        0b1010_0011 => {
            // Long TNT
            return push_long_tnt(decoder);
        }
        0b1111_0011 => {
            // OVF: the next FUP is an override rather than ignorable
            decoder.in_overflow = true;
            decoder.pos += OVF_LEN;
        }
        _ => {
            // PIP, TraceStop, VMCS, TMA and everything undefined
            return Err(DecoderError::UnsupportedPacket { byte });
        }
    }

    Ok(false)
}

/// Append the 1..=6 bits of a short TNT byte, oldest branch first.
///
/// The highest set bit is the stop bit; bit 0 is the header zero.
fn push_short_tnt(decoder: &mut PtDecoder<'_>, byte: u8) {
    debug_assert!(byte != 0 && byte & 1 == 0, "Not a short TNT byte");
    let stop_bit = 7 - byte.leading_zeros();
    let mut bit = stop_bit;
    while bit > 1 {
        bit -= 1;
        decoder.cache.tnt.push_back((byte >> bit) & 1 != 0);
    }
}

/// Append the 1..=47 bits of a long TNT packet, oldest branch first.
///
/// Returns `true` when the ring is near-full afterwards and the caller
/// must yield before the next packet.
fn push_long_tnt(decoder: &mut PtDecoder<'_>) -> Result<bool, DecoderError> {
    let Some(bytes) = decoder
        .buf
        .get(decoder.pos..)
        .and_then(|buf| buf.first_chunk::<8>())
    else {
        return Err(DecoderError::UnexpectedEof);
    };
    // Strip the two header bytes; the stop bit lives in the 48-bit payload
    let payload = u64::from_le_bytes(*bytes) >> 16;
    decoder.pos += LONG_TNT_LEN;
    if payload == 0 {
        // No stop bit; the hardware never emits this
        return Err(DecoderError::UnsupportedPacket { byte: 0b1010_0011 });
    }

    let stop_bit = 63 - payload.leading_zeros();
    let mut bit = stop_bit;
    while bit > 0 {
        bit -= 1;
        decoder.cache.tnt.push_back((payload >> bit) & 1 != 0);
    }

    Ok(decoder.cache.tnt.is_near_full())
}

/// Decompress the IP payload of a TIP-class packet against `last_tip`.
///
/// The cursor must still be at the header byte; on success it has advanced
/// past the whole packet. The header's top three bits give the number of
/// low 16-bit words supplied; zero means the IP is out of context, which
/// must not update `last_tip` and yields [`None`]. The composed value is
/// sign-extended from bit 47 and becomes the new `last_tip`.
#[expect(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn reconstruct_ip(
    decoder: &mut PtDecoder<'_>,
    header: u8,
) -> Result<Option<u64>, DecoderError> {
    let words = header >> 5;
    decoder.pos += 1;
    if words == 0 {
        return Ok(None);
    }
    if words > 4 {
        return Err(DecoderError::UnsupportedPacket { byte: header });
    }

    let byte_count = usize::from(words) * 2;
    let Some(payload) = decoder
        .buf
        .get(decoder.pos..)
        .and_then(|buf| buf.get(..byte_count))
    else {
        return Err(DecoderError::UnexpectedEof);
    };
    let mut raw = [0u8; 8];
    raw[..byte_count].copy_from_slice(payload);
    let supplied = u64::from_le_bytes(raw);

    let low_mask = u64::MAX >> (64 - 16 * u32::from(words));
    let composed = (supplied & low_mask) | (decoder.last_tip & !low_mask);
    let ip = (((composed << 16) as i64) >> 16) as u64;

    decoder.pos += byte_count;
    decoder.last_tip = ip;

    Ok(Some(ip))
}

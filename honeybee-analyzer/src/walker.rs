//! The hot block-walk loop.

use honeybee_decoder::{DecoderError, IndirectQuery, TntQuery};
use honeybee_hive::{Hive, INDIRECT_INDEX};

use crate::{Session, error::WalkError};

/// Sink for decoded blocks.
///
/// Implementations should be cheap; the walker calls
/// [`on_block`][Self::on_block] once per executed basic block.
pub trait ReportBlock {
    /// Error of the block sink
    type Error: std::error::Error;

    /// Called with each block's unslid start address, in execution order.
    ///
    /// Returning an error cancels the walk; the walker surfaces it as
    /// [`WalkError::Sink`].
    fn on_block(&mut self, unslid_ip: u64) -> Result<(), Self::Error>;
}

const INDIRECT_SENTINEL: u64 = INDIRECT_INDEX as u64;
const LO32: u64 = u32::MAX as u64;

/// Re-anchor at an address the decoder handed us: unslide it and find its
/// block through the direct map.
///
/// Returns `(block id, uvip)`.
fn resolve(hive: &Hive, trace_slide: u64, traced_ip: u64) -> Result<(u64, u64), u64> {
    let unslid = traced_ip.wrapping_sub(trace_slide);
    match hive.block_index_for_unslid(unslid) {
        Some(index) => Ok((u64::from(index), unslid.wrapping_sub(hive.uvip_slide()))),
        None => Err(unslid),
    }
}

/// Walk the trace bound to `session`, reporting each block to `sink`.
///
/// Each iteration reports the current block, fetches its packed record,
/// and selects the successor lobes with a single right-shift so the TNT
/// answer never becomes an unpredictable branch on the record data itself.
/// Both lobes are fetched regardless of the answer; the shift discards the
/// unused half.
pub(crate) fn walk<S: ReportBlock>(
    session: &mut Session<'_>,
    sink: &mut S,
) -> Result<(), WalkError<S>> {
    let hive = session.hive;
    let records = hive.records();
    let uvip_slide = hive.uvip_slide();
    let trace_slide = session.trace_slide;

    // The stream's first PSB+TIP seeds the walk
    let seed = match session.decoder.query_indirect() {
        Ok(IndirectQuery::Branch(ip) | IndirectQuery::Override(ip)) => ip,
        Err(DecoderError::EndOfStream) => return Ok(()),
        Err(err) => return Err(WalkError::Decoder(err)),
    };
    let (mut index, mut vip) =
        resolve(hive, trace_slide, seed).map_err(WalkError::NoMap)?;

    loop {
        sink.on_block(uvip_slide + (vip & LO32)).map_err(WalkError::Sink)?;

        // Ids are at most 31 bits, so the cast is lossless
        #[expect(clippy::cast_possible_truncation)]
        let Some(record) = records.get(index as usize) else {
            return Err(WalkError::NoMap(uvip_slide + (vip & LO32)));
        };
        let mut next_index = record.successor_indices;
        let mut next_vip = record.successor_ips;

        if next_index & 1 == 1 {
            match session.decoder.query_tnt() {
                Ok(TntQuery::Taken) => {
                    next_index >>= 1;
                }
                Ok(TntQuery::NotTaken) => {
                    next_index >>= 33;
                    next_vip >>= 32;
                }
                Ok(TntQuery::Override(ip)) => {
                    (index, vip) =
                        resolve(hive, trace_slide, ip).map_err(WalkError::NoMap)?;
                    continue;
                }
                Err(err) => return Err(WalkError::Decoder(err)),
            }
        } else {
            next_index >>= 1;
        }

        let mut selected = next_index & INDIRECT_SENTINEL;
        if selected == INDIRECT_SENTINEL {
            let target = match session.decoder.query_indirect() {
                Ok(IndirectQuery::Branch(ip) | IndirectQuery::Override(ip)) => ip,
                Err(DecoderError::EndOfStream) => return Ok(()),
                Err(err) => return Err(WalkError::Decoder(err)),
            };
            (selected, next_vip) =
                resolve(hive, trace_slide, target).map_err(WalkError::NoMap)?;
        }

        index = selected;
        vip = next_vip;
    }
}

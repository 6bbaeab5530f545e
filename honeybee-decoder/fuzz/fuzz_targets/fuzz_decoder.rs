#![no_main]

use honeybee_decoder::PtDecoder;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut decoder = PtDecoder::new(data);
    if decoder.sync_forward().is_err() {
        return;
    }

    // Drain both query surfaces until the stream errors out or ends.
    // Every successful indirect query consumes at least one packet, so
    // this terminates on arbitrary input.
    loop {
        match decoder.query_indirect() {
            Ok(target) => {
                let _ = std::hint::black_box(target);
            }
            Err(_) => break,
        }
        while let Ok(answer) = decoder.query_tnt() {
            let _ = std::hint::black_box(answer);
        }
    }
});

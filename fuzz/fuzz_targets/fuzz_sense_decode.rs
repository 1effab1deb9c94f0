#![no_main]

use libfuzzer_sys::fuzz_target;
use mediascan::codec::SenseData;

fuzz_target!(|data: &[u8]| {
    if let Ok(sense) = SenseData::decode(data) {
        for descriptor in sense.descriptors() {
            let _ = descriptor.len();
        }
    }
});

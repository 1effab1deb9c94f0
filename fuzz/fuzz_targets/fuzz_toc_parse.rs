#![no_main]

use libfuzzer_sys::fuzz_target;
use mediascan::codec::mmc::{self, Toc};

fuzz_target!(|data: &[u8]| {
    if let Ok(toc) = Toc::parse(data) {
        let _ = toc.user_tracks().count();
    }
    let _ = mmc::current_profile(data);
});

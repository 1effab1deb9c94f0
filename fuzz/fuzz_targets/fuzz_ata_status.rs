#![no_main]

use libfuzzer_sys::fuzz_target;
use mediascan::codec::{AddressingMode, AtaErrorRegisters};

fuzz_target!(|data: &[u8]| {
    for mode in [AddressingMode::Chs, AddressingMode::Lba28, AddressingMode::Lba48] {
        if let Ok(regs) = AtaErrorRegisters::from_return_descriptor(data, mode) {
            let _ = regs.lba();
        }
        let _ = AtaErrorRegisters::from_fixed_sense(data, mode);
    }
});

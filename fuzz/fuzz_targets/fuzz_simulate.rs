#![no_main]

use libfuzzer_sys::fuzz_target;

use ethosu_backend_core::command::words_from_bytes;
use ethosu_backend_core::{AcceleratorVariant, Device, LoweredProgram, MemoryArea, PoolAllocation};
use ethosu_sim::Simulator;

fuzz_target!(|data: &[u8]| {
    let Ok(command_stream) = words_from_bytes(data) else {
        return;
    };
    // A hostile command stream over a small pool must be rejected, not
    // crash the simulator.
    let program = LoweredProgram {
        variant: AcceleratorVariant::EthosU55_32,
        command_stream,
        constants: vec![0; 64],
        constants_pool: 1,
        pools: vec![
            PoolAllocation {
                area: MemoryArea::Sram,
                capacity: 4096,
                used: 4096,
            },
            PoolAllocation {
                area: MemoryArea::Flash,
                capacity: 64,
                used: 64,
            },
        ],
        inputs: vec![],
        outputs: vec![],
        diagnostics: vec![],
    };
    let _ = Simulator.execute(&program, &[]);
});

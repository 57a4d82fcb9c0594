//! Flood: rewrite a 10 000-byte block with fresh random content at a high
//! rate and verify (a) the mirror converges to the last written pattern
//! and (b) the send-credit invariant holds at every single tick.

use std::time::Duration;

use blockwire_core::{
    env::Environment,
    mblk::{MblkFlags, MemoryBlockParams},
};
use blockwire_harness::{device_controller_pair, PairOptions};

const BLOCK_SIZE: usize = 10_000;

#[test]
fn flood_converges_and_credit_never_overshoots() {
    let mut pair = device_controller_pair(&PairOptions { seed: 9, ..PairOptions::default() });
    let exp = pair
        .device
        .create_memory_block(&MemoryBlockParams {
            mblk_name: "exp",
            nbytes: BLOCK_SIZE,
            flags: MblkFlags::from_bits(MblkFlags::UP | MblkFlags::AUTO_SYNC),
            ..MemoryBlockParams::default()
        })
        .unwrap();

    pair.settle(50);
    pair.step(80); // initial key frame for the whole block

    let mirror = pair
        .controller
        .find_block("cafenet", "gina", 1, "exp")
        .expect("exp mirror");

    let mut pattern = vec![0u8; BLOCK_SIZE];
    for _round in 0..60 {
        pair.env.random_bytes(&mut pattern);
        pair.device.write(exp, 0, &pattern).unwrap();

        for _ in 0..30 {
            pair.step(1);
            let stats = pair
                .device
                .connection_stats(pair.device_conn)
                .expect("device connection");
            assert!(
                stats.in_air <= stats.max_in_air,
                "credit invariant violated: {} in air, window {}",
                stats.in_air,
                stats.max_in_air
            );
        }
        pair.env.advance(Duration::from_millis(20));
    }

    // Let the tail drain, then the mirror must hold the last pattern.
    pair.step(400);
    let mut mirrored = vec![0u8; BLOCK_SIZE];
    pair.controller.read(mirror, 0, &mut mirrored);
    assert_eq!(mirrored, pattern);
}

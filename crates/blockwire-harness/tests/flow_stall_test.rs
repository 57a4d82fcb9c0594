//! Flow stall: a receiver that stops acknowledging must throttle the
//! sender to its credit window; when acknowledgements resume, the very
//! next sender tick emits again, and nothing is lost or duplicated.

use blockwire_core::{
    env::Environment,
    mblk::{MblkFlags, MemoryBlockParams},
};
use blockwire_harness::{device_controller_pair, PairOptions};

const BLOCK_SIZE: usize = 4096;

#[test]
fn sender_stalls_on_missing_acks_and_resumes_promptly() {
    let mut pair = device_controller_pair(&PairOptions { seed: 11, ..PairOptions::default() });
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
    pair.step(80);

    let mirror = pair
        .controller
        .find_block("cafenet", "gina", 1, "exp")
        .expect("exp mirror");

    // Incompressible content so the snapshot spans several frames.
    let mut pattern = vec![0u8; BLOCK_SIZE];
    pair.env.random_bytes(&mut pattern);
    pair.device.write(exp, 0, &pattern).unwrap();

    // Only the device runs: the controller reads nothing and acks nothing.
    for _ in 0..100 {
        pair.device.run();
        let stats = pair.device.connection_stats(pair.device_conn).expect("device conn");
        assert!(stats.in_air <= stats.max_in_air, "sender overshot its window");
    }
    let stalled = pair.device.connection_stats(pair.device_conn).expect("device conn");
    assert!(stalled.in_air > 0, "sender never started");

    // Fully stalled: more sender ticks move nothing.
    for _ in 0..50 {
        pair.device.run();
    }
    let still = pair.device.connection_stats(pair.device_conn).expect("device conn");
    assert_eq!(still.bytes_sent, stalled.bytes_sent, "sender emitted without credit");

    // The receiver catches up and acknowledges promptly once it runs.
    let controller_conn = pair.controller.connection_ids()[0];
    let ctrl_before = pair.controller.connection_stats(controller_conn).expect("ctrl conn");
    for _ in 0..20 {
        pair.controller.run();
    }
    let ctrl_after = pair.controller.connection_stats(controller_conn).expect("ctrl conn");
    assert!(
        ctrl_after.bytes_received != ctrl_before.bytes_received,
        "receiver consumed nothing"
    );
    assert!(
        ctrl_after.bytes_sent != ctrl_before.bytes_sent,
        "receiver never acknowledged"
    );

    // One sender tick is enough to resume emission.
    pair.device.run();
    let resumed = pair.device.connection_stats(pair.device_conn).expect("device conn");
    assert!(
        resumed.bytes_sent != still.bytes_sent,
        "sender did not resume within one tick of the acknowledge"
    );

    // And the transfer completes exactly.
    pair.step(200);
    let mut mirrored = vec![0u8; BLOCK_SIZE];
    pair.controller.read(mirror, 0, &mut mirrored);
    assert_eq!(mirrored, pattern);
}

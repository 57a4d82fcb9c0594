//! Keepalives and inactivity timeouts on an otherwise idle connection.

use std::time::Duration;

use blockwire_harness::{device_controller_pair, PairOptions};

#[test]
fn idle_connection_heartbeats_every_keepalive_interval() {
    let mut pair = device_controller_pair(&PairOptions::default());
    pair.settle(50);
    pair.step(20);

    let controller_conn = pair.controller.connection_ids()[0];

    // Three keepalive periods (socket keepalive is 20 s); each one must
    // produce exactly one heartbeat acknowledge from the idle device.
    for period in 0..3 {
        let before = pair
            .controller
            .connection_stats(controller_conn)
            .expect("controller conn");
        pair.advance_and_step(Duration::from_secs(21), 6);
        let after = pair
            .controller
            .connection_stats(controller_conn)
            .expect("controller conn");
        let received = after.bytes_received.wrapping_sub(before.bytes_received);
        assert!(
            received > 0,
            "no keepalive observed in period {period}"
        );
        assert!(
            received <= 24,
            "more than a lone acknowledge frame in period {period}: {received} bytes"
        );
    }
}

#[test]
fn silent_peer_times_out_and_the_connection_dies() {
    let mut pair = device_controller_pair(&PairOptions::default());
    pair.settle(50);
    pair.step(20);
    assert_eq!(pair.controller.connection_ids().len(), 1);

    // The device falls silent entirely; past the 50 s socket timeout the
    // controller's accepted connection is failed and reaped.
    pair.env.advance(Duration::from_secs(51));
    for _ in 0..5 {
        pair.controller.run();
    }
    assert!(
        pair.controller.connection_ids().is_empty(),
        "timed-out connection was not reaped"
    );
}

//! Device/controller fixtures: two roots wired through a [`SimHub`].

use std::time::Duration;

use blockwire_core::{
    connection::{ConnId, ConnectionConfig, TransportTuning},
    link::Link,
    proto::Transport,
    root::{Root, RootConfig, RootEvent},
};

use crate::sim::{SimEnv, SimHub};

/// Options for [`device_controller_pair`].
#[derive(Debug, Clone)]
pub struct PairOptions {
    /// Framing flavor for the simulated wire
    pub transport: Transport,
    /// Device reconnects automatically after failures
    pub reopen: bool,
    /// Device number the device presents (sentinel requests automatic)
    pub device_nr: u32,
    /// Hardware unique id the device presents
    pub unique_id: Option<[u8; 16]>,
    /// RNG/clock seed
    pub seed: u64,
}

impl Default for PairOptions {
    fn default() -> Self {
        Self {
            transport: Transport::Tcp,
            reopen: false,
            device_nr: 1,
            unique_id: None,
            seed: 7,
        }
    }
}

/// A device root and a controller root sharing one virtual clock.
pub struct Pair {
    /// Shared simulated environment
    pub env: SimEnv,
    /// The IO-board side
    pub device: Root<SimEnv>,
    /// The controller side (dynamic discovery enabled)
    pub controller: Root<SimEnv>,
    /// Meeting point carrying the wire
    pub hub: SimHub,
    /// The device's connection id
    pub device_conn: ConnId,
}

/// Wire up a "gina" device and a discovering controller.
#[must_use]
pub fn device_controller_pair(opts: &PairOptions) -> Pair {
    let env = SimEnv::new(opts.seed);
    let hub = SimHub::new();

    let mut controller = Root::with_env(
        RootConfig {
            network_name: "cafenet".to_string(),
            user_name: "controller".to_string(),
            dynamic_mblks: true,
            ..RootConfig::default()
        },
        env.clone(),
    );
    controller.listen(
        ConnectionConfig {
            transport: opts.transport,
            connect_up: false,
            reopen: false,
            cloud_network: None,
            request_trust_cert: false,
            tuning: TransportTuning::for_transport(opts.transport),
        },
        Box::new(hub.acceptor()),
    );

    let mut device = Root::with_env(
        RootConfig {
            device_name: "gina".to_string(),
            device_nr: opts.device_nr,
            network_name: "cafenet".to_string(),
            user_name: "gina".to_string(),
            unique_id: opts.unique_id,
            ..RootConfig::default()
        },
        env.clone(),
    );

    let device_cfg = ConnectionConfig {
        transport: opts.transport,
        connect_up: true,
        reopen: opts.reopen,
        cloud_network: None,
        request_trust_cert: false,
        tuning: TransportTuning::for_transport(opts.transport),
    };
    let device_conn = if opts.reopen {
        let dial = hub.clone();
        match device.connect_with(
            device_cfg,
            Box::new(move || Ok(Box::new(dial.connect()) as Box<dyn Link>)),
        ) {
            Ok(id) => id,
            Err(_) => unreachable!("sim connector cannot fail"),
        }
    } else {
        device.connect(device_cfg, Box::new(hub.connect()))
    };

    Pair { env, device, controller, hub, device_conn }
}

impl Pair {
    /// Tick both roots `times` times.
    pub fn step(&mut self, times: usize) {
        for _ in 0..times {
            self.device.run();
            self.controller.run();
        }
    }

    /// Advance virtual time, then tick both roots.
    pub fn advance_and_step(&mut self, delta: Duration, times: usize) {
        self.env.advance(delta);
        self.step(times);
    }

    /// Step until both sides report an established connection (or panic
    /// after `limit` ticks).
    pub fn settle(&mut self, limit: usize) {
        for _ in 0..limit {
            self.step(1);
            let device_up = self
                .device
                .connection_ids()
                .iter()
                .filter_map(|&id| self.device.connection_stats(id))
                .any(|stats| stats.state == blockwire_core::ConnState::Established);
            let controller_up = self
                .controller
                .connection_ids()
                .iter()
                .filter_map(|&id| self.controller.connection_stats(id))
                .any(|stats| stats.state == blockwire_core::ConnState::Established);
            if device_up && controller_up {
                return;
            }
        }
        panic!("connection did not establish within {limit} ticks");
    }

    /// Drain all pending events from one root.
    pub fn drain_events(root: &mut Root<SimEnv>) -> Vec<RootEvent> {
        let mut events = Vec::new();
        while let Some(event) = root.poll_event() {
            events.push(event);
        }
        events
    }
}

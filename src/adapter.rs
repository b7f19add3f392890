//! # Adapter Run Loop
//!
//! Cooperative loop over the two buses:
//!
//! ```text
//!  external master            adapter                    charger
//!  ---------------    +-------------------------+    ---------------
//!   requests  ------> | RtuServer -> Controller |
//!                     |     | forwarded         |
//!                     |     v                   |
//!                     | RtuClient  ------------------>  requests
//!   responses <------ |  raw responses <------------   responses
//!                     |                         |
//!  meter samples ---> | LoadBalancer -> limiter ----->  limit writes
//!                     +-------------------------+
//! ```
//!
//! Every [`Adapter::step`] drains received bytes, answers or forwards the
//! external master's requests, runs the load balancer when its interval
//! has passed and services the charger bus. Nothing in a step blocks on the
//! bus; deadlines are evaluated against the `now_ms` passed in.

use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

use crate::charger::AbbTerraAcLimiter;
use crate::client::{ClientObserver, ClientStatus, RequestInfo, ResponseData, RtuClient};
use crate::loadbalancer::Phase;
use crate::meter::GridSample;
use crate::protocol::SlaveId;
use crate::registers::{Controller, DeviceCommand};
use crate::server::{RtuServer, ServerEvent};
use crate::transport::{BusLink, Clock};
use crate::utils::format::registers_to_hex;

/// Period of the run loop
pub const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Client observer feeding statuses into the register table and collecting
/// gateway responses for the external master
struct Relay<'a> {
    controller: &'a mut Controller,
    raw_responses: Vec<Vec<u8>>,
}

impl ClientObserver for Relay<'_> {
    fn on_response(&mut self, request: &RequestInfo, data: &ResponseData) {
        match data {
            ResponseData::Registers(values) => debug!(
                "Slave {} registers at {}: {}",
                request.address,
                request.start,
                registers_to_hex(values)
            ),
            other => debug!(
                "Slave {} answered 0x{:02X} at {}: {:?}",
                request.address, request.function, request.start, other
            ),
        }
    }

    fn on_status(&mut self, request: &RequestInfo, status: ClientStatus) {
        warn!(
            "Request 0x{:02X} to slave {} failed: {:?}",
            request.function, request.address, status
        );
        self.controller.record_client_status(status);
    }

    fn on_raw_response(&mut self, frame: &[u8]) {
        self.raw_responses.push(frame.to_vec());
    }
}

/// EV charger load balancing adapter
pub struct Adapter<S: BusLink, C: BusLink> {
    server: RtuServer<S>,
    client: RtuClient<C>,
    controller: Controller,
    charger_address: SlaveId,
    samples: Option<mpsc::Receiver<GridSample>>,
}

impl<S: BusLink, C: BusLink> Adapter<S, C> {
    pub fn new(
        server: RtuServer<S>,
        client: RtuClient<C>,
        controller: Controller,
        charger_address: SlaveId,
    ) -> Self {
        info!(
            "🚀 Adapter at slave address {}, charger at {}",
            server.address(),
            charger_address
        );
        Self {
            server,
            client,
            controller,
            charger_address,
            samples: None,
        }
    }

    /// Take grid samples from `samples` at the start of every step
    pub fn with_samples(mut self, samples: mpsc::Receiver<GridSample>) -> Self {
        self.samples = Some(samples);
        self
    }

    pub fn server(&self) -> &RtuServer<S> {
        &self.server
    }

    pub fn client(&self) -> &RtuClient<C> {
        &self.client
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut Controller {
        &mut self.controller
    }

    /// Feed one grid current sample to the load balancer
    pub fn set_grid_current(&mut self, phase: Phase, current_ma: u16) {
        self.controller.load_balancer_mut().set_grid_current(phase, current_ma);
    }

    /// One loop iteration at `now_ms`
    ///
    /// Returns the device command raised through the register table, if any.
    pub async fn step(&mut self, now_ms: u64) -> Option<DeviceCommand> {
        self.drain_samples();

        let events = self.server.poll(now_ms, &mut self.controller).await;
        for event in events {
            if let ServerEvent::Forwarded(frame) = event {
                if let Err(e) = self.client.send_raw(&frame) {
                    if e.is_protocol_error() {
                        debug!("Dropping malformed frame for slave {}: {}", frame[0], e);
                    } else {
                        warn!("Cannot forward frame for slave {}: {}", frame[0], e);
                    }
                }
            }
        }

        let mut limiter = AbbTerraAcLimiter::new(&mut self.client, self.charger_address);
        self.controller.load_balancer_mut().task(now_ms, &mut limiter);

        let mut relay = Relay {
            controller: &mut self.controller,
            raw_responses: Vec::new(),
        };
        self.client.poll(now_ms, &mut relay).await;

        for frame in relay.raw_responses {
            if let Err(e) = self.server.send_raw(&frame).await {
                if e.is_transport_error() {
                    error!("Master bus lost while relaying a response: {}", e);
                } else {
                    warn!("Cannot relay response to the master: {}", e);
                }
            }
        }

        self.controller.take_command()
    }

    /// Run until the register table requests a device command
    pub async fn run(&mut self, clock: &dyn Clock) -> DeviceCommand {
        let mut ticker = interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Some(command) = self.step(clock.now_ms()).await {
                info!("Leaving run loop for {:?}", command);
                return command;
            }
        }
    }

    /// Release both buses
    ///
    /// Serial ports can be reopened once this returns.
    pub async fn close(&mut self) {
        self.server.close().await;
        self.client.close().await;
        self.samples = None;
        info!("Adapter buses released");
    }

    fn drain_samples(&mut self) {
        let Some(samples) = self.samples.as_mut() else {
            return;
        };
        while let Ok(sample) = samples.try_recv() {
            self.controller
                .load_balancer_mut()
                .set_grid_current(sample.phase, sample.current_ma);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, MemoryConfigStore};
    use crate::protocol::append_crc;
    use crate::transport::{rx_channel, MemoryLink, RxProducer};

    struct Rig {
        adapter: Adapter<MemoryLink, MemoryLink>,
        master_link: MemoryLink,
        master_rx: RxProducer,
        charger_link: MemoryLink,
        charger_rx: RxProducer,
    }

    fn rig() -> Rig {
        let config = DeviceConfig::default();
        let (master_rx, server_rx) = rx_channel(512);
        let (charger_rx, client_rx) = rx_channel(512);
        let master_link = MemoryLink::new();
        let charger_link = MemoryLink::new();
        let server = RtuServer::new(config.address, master_link.clone(), server_rx);
        let client = RtuClient::new(charger_link.clone(), client_rx);
        let controller = Controller::new(&config, Box::new(MemoryConfigStore::new()));
        Rig {
            adapter: Adapter::new(server, client, controller, 1),
            master_link,
            master_rx,
            charger_link,
            charger_rx,
        }
    }

    fn frame(bytes: &[u8]) -> Vec<u8> {
        let mut frame = bytes.to_vec();
        append_crc(&mut frame);
        frame
    }

    #[tokio::test]
    async fn test_first_step_limits_charger() {
        let mut rig = rig();
        rig.adapter.step(0).await;

        let sent = rig.charger_link.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0][..7], &[0x01, 0x10, 0x41, 0x00, 0x00, 0x02, 0x04]);
    }

    #[tokio::test]
    async fn test_samples_reach_load_balancer() {
        let mut rig = rig();
        let (tx, rx) = mpsc::channel(8);
        rig.adapter = rig.adapter.with_samples(rx);

        tx.send(GridSample { phase: Phase::L3, current_ma: 9000, at_ms: 0 })
            .await
            .unwrap();
        rig.adapter.step(0).await;

        let lb = rig.adapter.controller().load_balancer();
        assert_eq!(lb.grid_current(Phase::L3), 9000);
        assert_eq!(lb.grid_current_age(), 0);
    }

    #[tokio::test]
    async fn test_gateway_round_trip() {
        let mut rig = rig();
        rig.adapter.step(0).await;
        rig.charger_link.take_sent();
        rig.charger_rx.push_all(&frame(&[0x01, 0x10, 0x41, 0x00, 0x00, 0x02]), 10);
        rig.adapter.step(10).await;

        let request = frame(&[0x07, 0x03, 0x00, 0x00, 0x00, 0x01]);
        rig.master_rx.push_all(&request, 20);
        rig.adapter.step(20).await;
        assert_eq!(rig.charger_link.take_sent(), vec![request]);

        let response = frame(&[0x07, 0x03, 0x02, 0x12, 0x34]);
        rig.charger_rx.push_all(&response, 40);
        rig.adapter.step(40).await;
        assert_eq!(rig.master_link.take_sent(), vec![response]);
    }

    #[tokio::test]
    async fn test_close_releases_both_buses() {
        let mut rig = rig();
        rig.adapter.step(0).await;
        rig.adapter.close().await;

        assert!(rig.master_link.is_closed());
        assert!(rig.charger_link.is_closed());
        assert_eq!(rig.adapter.client().link().stats().frames_sent, 1);
    }

    #[tokio::test]
    async fn test_timeout_sets_system_error() {
        let mut rig = rig();
        rig.adapter.step(0).await;
        rig.adapter.step(1001).await;
        assert_eq!(rig.adapter.controller().system_error(), 0xF0);
    }
}

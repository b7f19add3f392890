//! ABB Terra AC charger control
//!
//! The charging current limit is a 32-bit value in mA at holding register
//! 0x4100, most significant word first. A limit that has not reached the
//! bus yet is overwritten by the next one.

use log::{debug, warn};

use crate::client::RtuClient;
use crate::loadbalancer::LimitSink;
use crate::protocol::{data_utils, SlaveId};
use crate::transport::BusLink;

/// Factory slave address of the charger
pub const ABB_TERRA_AC_ADDRESS: SlaveId = 1;

/// Register holding the charging current limit
pub const SET_CHARGING_CURRENT_LIMIT: u16 = 0x4100;

/// Highest limit written. The charger misbehaves above it and already
/// delivers 16 A at this setting.
pub const MAX_CHARGING_CURRENT: u16 = 15650;

/// Forwards load balancer limits to the charger as client write requests
pub struct AbbTerraAcLimiter<'a, L: BusLink> {
    client: &'a mut RtuClient<L>,
    address: SlaveId,
}

impl<'a, L: BusLink> AbbTerraAcLimiter<'a, L> {
    pub fn new(client: &'a mut RtuClient<L>, address: SlaveId) -> Self {
        Self { client, address }
    }
}

impl<L: BusLink> LimitSink for AbbTerraAcLimiter<'_, L> {
    fn limit_charger(&mut self, current_ma: u16) {
        let value = current_ma.min(MAX_CHARGING_CURRENT);
        let registers = data_utils::u32_to_registers(value as u32);

        match self
            .client
            .replace_multiple_registers(self.address, SET_CHARGING_CURRENT_LIMIT, &registers)
        {
            Ok(()) => debug!("Limit charger {} to {} mA", self.address, value),
            Err(e) => warn!("Cannot queue charger limit {} mA: {}", value, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientObserver, ClientStatus, RequestInfo, ResponseData};
    use crate::protocol::append_crc;
    use crate::transport::{rx_channel, MemoryLink};

    struct Ignore;

    impl ClientObserver for Ignore {
        fn on_response(&mut self, _: &RequestInfo, _: &ResponseData) {}
        fn on_status(&mut self, _: &RequestInfo, _: ClientStatus) {}
    }

    fn expected_frame(value: u32) -> Vec<u8> {
        let mut frame = vec![0x01, 0x10, 0x41, 0x00, 0x00, 0x02, 0x04];
        frame.extend_from_slice(&value.to_be_bytes());
        append_crc(&mut frame);
        frame
    }

    #[tokio::test]
    async fn test_limit_is_written_as_u32() {
        let link = MemoryLink::new();
        let (_tx, rx) = rx_channel(64);
        let mut client = RtuClient::new(link.clone(), rx);

        AbbTerraAcLimiter::new(&mut client, ABB_TERRA_AC_ADDRESS).limit_charger(10000);
        client.poll(0, &mut Ignore).await;

        assert_eq!(link.take_sent(), vec![expected_frame(10000)]);
    }

    #[tokio::test]
    async fn test_limit_is_capped() {
        let link = MemoryLink::new();
        let (_tx, rx) = rx_channel(64);
        let mut client = RtuClient::new(link.clone(), rx);

        AbbTerraAcLimiter::new(&mut client, ABB_TERRA_AC_ADDRESS).limit_charger(16000);
        client.poll(0, &mut Ignore).await;

        assert_eq!(link.take_sent(), vec![expected_frame(15650)]);
    }

    #[tokio::test]
    async fn test_silent_charger_keeps_one_limit_queued() {
        let link = MemoryLink::new();
        let (_tx, rx) = rx_channel(64);
        let mut client = RtuClient::new(link.clone(), rx);

        // One limit per check interval while every write times out
        for tick in 0..crate::CLIENT_QUEUE_SIZE as u64 + 2 {
            let now = tick * 1000;
            AbbTerraAcLimiter::new(&mut client, ABB_TERRA_AC_ADDRESS).limit_charger(6000 + tick as u16);
            client.poll(now, &mut Ignore).await;
            assert!(client.pending() <= 2);
        }

        let written: Vec<Vec<u8>> = (0..=10).step_by(2).map(|tick| expected_frame(6000 + tick)).collect();
        assert_eq!(link.sent(), written);
        assert!(client.send_raw(&expected_frame(1)).is_ok());
    }

    #[test]
    fn test_full_queue_is_not_fatal() {
        let (_tx, rx) = rx_channel(64);
        let mut client = RtuClient::new(MemoryLink::new(), rx);
        for i in 0..crate::CLIENT_QUEUE_SIZE as u16 {
            client.write_single_register(2, i, i).unwrap();
        }

        AbbTerraAcLimiter::new(&mut client, ABB_TERRA_AC_ADDRESS).limit_charger(6000);
        assert_eq!(client.pending(), crate::CLIENT_QUEUE_SIZE);
    }
}

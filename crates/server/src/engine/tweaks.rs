//! Special-request tweaks
//!
//! A few standard control requests cannot be passed through the host
//! controller as-is; they are intercepted here and mapped onto
//! adapter-native calls, with a synthetic RET_SUBMIT sent in place of a
//! real transfer completion. Class and vendor requests always pass
//! through untouched.

use protocol::{RequestKind, RetSubmit, SetupPacket};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::dispatcher::UrbDispatcher;
use crate::usb::TransferStatus;

const CLEAR_FEATURE: u8 = 0x01;
const SET_CONFIGURATION: u8 = 0x09;
const SET_INTERFACE: u8 = 0x0b;

/// wValue of CLEAR_FEATURE selecting the endpoint-halt feature.
const FEATURE_ENDPOINT_HALT: u16 = 0;

/// Intercept `setup` if it needs tweaking. Returns `true` when the
/// request was claimed and a reply has been enqueued; `false` sends the
/// request down the regular control-transfer path.
pub(crate) async fn apply(
    dispatcher: &Arc<UrbDispatcher>,
    seqnum: u32,
    setup: &SetupPacket,
) -> bool {
    if setup.kind() != RequestKind::Standard {
        return false;
    }

    match setup.request {
        CLEAR_FEATURE if setup.value == FEATURE_ENDPOINT_HALT => {
            clear_halt(dispatcher, seqnum, setup).await;
            true
        }
        SET_CONFIGURATION if setup.value == 1 => {
            // The controller configured the device at attach time; a
            // repeated SET_CONFIGURATION(1) would fail with device-busy.
            // Acknowledge without touching the bus.
            info!(seqnum, "SET_CONFIGURATION(1) acknowledged without controller call");
            dispatcher.enqueue(RetSubmit::with_data(seqnum, Vec::new()).to_bytes()).await;
            true
        }
        SET_INTERFACE => {
            set_interface(dispatcher, seqnum, setup).await;
            true
        }
        // GET_STATUS, SET_FEATURE, SET_ADDRESS, GET_DESCRIPTOR,
        // GET_CONFIGURATION, GET_INTERFACE and SET_CONFIGURATION with
        // other values go through the regular control pipe.
        _ => false,
    }
}

/// CLEAR_FEATURE(ENDPOINT_HALT) maps onto the adapter's endpoint clear.
async fn clear_halt(dispatcher: &Arc<UrbDispatcher>, seqnum: u32, setup: &SetupPacket) {
    let endpoint = setup.index as u8;
    debug!(seqnum, endpoint = format_args!("{endpoint:#04x}"), "tweaking CLEAR_FEATURE(ENDPOINT_HALT)");
    let frame = match dispatcher.controller().endpoint_clear(endpoint) {
        Ok(()) => RetSubmit::with_data(seqnum, Vec::new()),
        Err(e) => {
            warn!(seqnum, "endpoint clear for halt tweak failed: {e}");
            RetSubmit::epipe(seqnum)
        }
    };
    dispatcher.enqueue(frame.to_bytes()).await;
}

/// SET_INTERFACE runs as a synchronous control transfer through the
/// default pipe. Some devices are known to want plain pass-through
/// instead; if an interface refuses to switch alternate settings this
/// tweak is the first place to look.
async fn set_interface(dispatcher: &Arc<UrbDispatcher>, seqnum: u32, setup: &SetupPacket) {
    info!(seqnum, interface = setup.index, alternate = setup.value, "tweaking SET_INTERFACE");
    let frame = match dispatcher.sync_control(setup).await {
        Ok(TransferStatus::Completed) => RetSubmit::with_data(seqnum, Vec::new()),
        Ok(status) => {
            warn!(seqnum, "SET_INTERFACE transfer ended with {status:?}");
            RetSubmit::with_status(seqnum, status.to_urb_status().code(), Vec::new())
        }
        Err(()) => RetSubmit::epipe(seqnum),
    };
    dispatcher.enqueue(frame.to_bytes()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::dispatcher::UrbDispatcher;
    use crate::usb::mock::{MockController, MockReply};
    use crate::usb::{AttachedDevice, EndpointInfo, EndpointKind};
    use protocol::{BusId, CmdSubmit, DeviceRecord, DeviceSpeed, Direction, UrbStatus};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn harness() -> (Arc<UrbDispatcher>, Arc<MockController>, async_channel::Receiver<Vec<u8>>) {
        let mock = Arc::new(MockController::new(vec![EndpointInfo {
            address: 0x81,
            max_packet_size: 512,
            kind: EndpointKind::Bulk,
        }]));
        let (tx, rx) = async_channel::bounded(16);
        let record = DeviceRecord {
            path: "/sys/bus/usb/devices/1-1".to_string(),
            busid: BusId::new("1-1").unwrap(),
            busnum: 1,
            devnum: 1,
            speed: DeviceSpeed::High,
            id_vendor: 1,
            id_product: 2,
            bcd_device: 0,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            configuration_value: 1,
            num_configurations: 1,
            interfaces: Vec::new(),
        };
        let device = AttachedDevice { record, controller: mock.clone() };
        (UrbDispatcher::new(device, tx), mock, rx)
    }

    fn control_cmd(seqnum: u32, setup: [u8; 8]) -> CmdSubmit {
        let direction =
            if setup[0] & 0x80 != 0 { Direction::In } else { Direction::Out };
        CmdSubmit {
            seqnum,
            devid: 0x0001_0001,
            direction,
            ep: 0,
            transfer_flags: 0,
            transfer_buffer_length: u16::from_le_bytes([setup[6], setup[7]]) as u32,
            start_frame: 0,
            number_of_packets: 0,
            interval: 0,
            setup,
            data: Vec::new(),
            iso_descriptors: Vec::new(),
        }
    }

    async fn next_status(rx: &async_channel::Receiver<Vec<u8>>) -> (u32, i32) {
        let frame = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        let seqnum = u32::from_be_bytes(frame[4..8].try_into().unwrap());
        let status = i32::from_be_bytes(frame[20..24].try_into().unwrap());
        (seqnum, status)
    }

    #[tokio::test]
    async fn clear_halt_maps_to_endpoint_clear() {
        let (dispatcher, mock, rx) = harness();
        // CLEAR_FEATURE(ENDPOINT_HALT) on endpoint 0x81
        let setup = [0x02, 0x01, 0x00, 0x00, 0x81, 0x00, 0x00, 0x00];
        dispatcher.submit(control_cmd(1, setup)).await;

        assert_eq!(next_status(&rx).await, (1, 0));
        assert_eq!(mock.cleared(), vec![0x81]);
        assert_eq!(mock.submitted_count(), 0);
    }

    #[tokio::test]
    async fn set_configuration_one_is_acknowledged_locally() {
        let (dispatcher, mock, rx) = harness();
        let setup = [0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00];
        dispatcher.submit(control_cmd(2, setup)).await;

        assert_eq!(next_status(&rx).await, (2, 0));
        assert_eq!(mock.submitted_count(), 0);
    }

    #[tokio::test]
    async fn set_configuration_other_values_pass_through() {
        let (dispatcher, mock, rx) = harness();
        mock.script(0x00, MockReply::ok(Vec::new()));
        let setup = [0x00, 0x09, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00];
        dispatcher.submit(control_cmd(3, setup)).await;

        assert_eq!(next_status(&rx).await, (3, 0));
        assert_eq!(mock.submitted_count(), 1);
    }

    #[tokio::test]
    async fn set_interface_runs_synchronous_control_transfer() {
        let (dispatcher, mock, rx) = harness();
        mock.script(0x00, MockReply::ok(Vec::new()));
        let setup = [0x01, 0x0b, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00];
        dispatcher.submit(control_cmd(4, setup)).await;

        assert_eq!(next_status(&rx).await, (4, 0));
        assert_eq!(mock.submitted_count(), 1);
    }

    #[tokio::test]
    async fn set_interface_surfaces_controller_error() {
        let (dispatcher, mock, rx) = harness();
        mock.script(0x00, MockReply::status(crate::usb::TransferStatus::Stall));
        let setup = [0x01, 0x0b, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00];
        dispatcher.submit(control_cmd(5, setup)).await;

        assert_eq!(next_status(&rx).await, (5, UrbStatus::Epipe.code()));
    }

    #[tokio::test]
    async fn class_requests_pass_through() {
        let (dispatcher, mock, rx) = harness();
        // Class request (mass-storage Get Max LUN shape)
        mock.script(0x80, MockReply::ok(vec![0x00]));
        let setup = [0xa1, 0xfe, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00];
        dispatcher.submit(control_cmd(6, setup)).await;

        assert_eq!(next_status(&rx).await, (6, 0));
        assert_eq!(mock.submitted_count(), 1);
    }

    #[tokio::test]
    async fn clear_halt_error_surfaces_epipe() {
        let (dispatcher, mock, rx) = harness();
        mock.fail_clears(1);
        let setup = [0x02, 0x01, 0x00, 0x00, 0x81, 0x00, 0x00, 0x00];
        dispatcher.submit(control_cmd(7, setup)).await;

        assert_eq!(next_status(&rx).await, (7, UrbStatus::Epipe.code()));
    }
}

//! Wire-level protocol tests
//!
//! Byte-exact checks of the op-phase handshake frames against captures of
//! what the Linux usbip client sends, plus full-frame reply layout checks.

use protocol::{
    BusId, DeviceRecord, DeviceSpeed, InterfaceRecord, OpRequest, ProtocolError, op_rep_devlist,
    op_rep_import_fail, op_rep_import_ok, read_op_request,
};

fn storage_device() -> DeviceRecord {
    DeviceRecord {
        path: "/sys/bus/usb/devices/1-1".to_string(),
        busid: BusId::new("1-1").unwrap(),
        busnum: 1,
        devnum: 1,
        speed: DeviceSpeed::High,
        id_vendor: 0x0951,
        id_product: 0x1666,
        bcd_device: 0x0110,
        device_class: 0,
        device_subclass: 0,
        device_protocol: 0,
        configuration_value: 1,
        num_configurations: 1,
        interfaces: vec![InterfaceRecord { class: 0x08, subclass: 0x06, protocol: 0x50 }],
    }
}

#[tokio::test]
async fn devlist_request_is_eight_bytes() {
    let wire = [0x01u8, 0x11, 0x80, 0x05, 0x00, 0x00, 0x00, 0x00];
    assert_eq!(read_op_request(&mut &wire[..]).await.unwrap(), OpRequest::Devlist);
}

#[test]
fn devlist_reply_on_empty_registry_is_twelve_bytes() {
    let reply = op_rep_devlist(&[]);
    assert_eq!(reply, [0x01, 0x11, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
}

#[test]
fn devlist_reply_carries_record_and_interfaces() {
    let device = storage_device();
    let reply = op_rep_devlist(std::slice::from_ref(&device));
    assert_eq!(reply.len(), 12 + 312 + 4);
    // device count
    assert_eq!(&reply[8..12], &[0x00, 0x00, 0x00, 0x01]);
    // busid field starts after the 256-byte path
    assert_eq!(&reply[12 + 256..12 + 256 + 3], b"1-1");
    // interface triplet at the tail
    assert_eq!(&reply[12 + 312..], &[0x08, 0x06, 0x50, 0x00]);
}

#[tokio::test]
async fn import_request_parses_nul_padded_busid() {
    let mut wire = vec![0x01, 0x11, 0x80, 0x03, 0x00, 0x00, 0x00, 0x00];
    wire.extend_from_slice(BusId::new("2-1").unwrap().as_bytes());
    let request = read_op_request(&mut wire.as_slice()).await.unwrap();
    let OpRequest::Import { busid } = request else {
        panic!("expected import request, got {:?}", request);
    };
    assert_eq!(busid.to_string(), "2-1");
}

#[test]
fn import_miss_reply_is_header_only() {
    // Scenario: import of an unknown busid replies with status 1, no record.
    assert_eq!(op_rep_import_fail(), [0x01, 0x11, 0x00, 0x03, 0x00, 0x00, 0x00, 0x01]);
}

#[test]
fn import_hit_reply_carries_bare_record() {
    let reply = op_rep_import_ok(&storage_device());
    // No interface entries after the 312-byte record in an import reply.
    assert_eq!(reply.len(), 8 + 312);
    assert_eq!(&reply[0..8], &[0x01, 0x11, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00]);
}

#[tokio::test]
async fn eof_mid_header_is_an_error() {
    let wire = [0x01u8, 0x11];
    let err = read_op_request(&mut &wire[..]).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Io(_)));
}

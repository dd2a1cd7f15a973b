// Jackson Coxson
//! Seed scenario: the mux daemon reports no attached devices.

#![cfg(feature = "usbmuxd")]

use idevice::usbmuxd::UsbmuxdConnection;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Reads one usbmuxd-framed (16-byte little-endian header + XML plist)
/// request and returns its body.
async fn read_mux_request(peer: &mut tokio::io::DuplexStream) -> plist::Dictionary {
    let mut header = [0u8; 16];
    peer.read_exact(&mut header).await.unwrap();
    let total_size = u32::from_le_bytes(header[0..4].try_into().unwrap());
    let mut body = vec![0u8; total_size as usize - 16];
    peer.read_exact(&mut body).await.unwrap();
    plist::from_bytes(&body).unwrap()
}

async fn write_mux_response(peer: &mut tokio::io::DuplexStream, dict: plist::Dictionary) {
    let mut body = Vec::new();
    plist::Value::Dictionary(dict)
        .to_writer_xml(&mut body)
        .unwrap();
    let total_size = (16 + body.len()) as u32;
    let mut out = Vec::with_capacity(16 + body.len());
    out.extend_from_slice(&total_size.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes()); // XML_PLIST_VERSION
    out.extend_from_slice(&8u32.to_le_bytes()); // PLIST_MESSAGE_TYPE
    out.extend_from_slice(&0u32.to_le_bytes()); // tag
    out.extend_from_slice(&body);
    peer.write_all(&out).await.unwrap();
    peer.flush().await.unwrap();
}

#[tokio::test]
async fn list_devices_returns_empty_when_mux_daemon_reports_none() {
    let (client, mut peer) = tokio::io::duplex(64 * 1024);
    let mut conn = UsbmuxdConnection::new(Box::new(client), 0).await;

    let call = tokio::spawn(async move { conn.get_devices().await });

    let request = read_mux_request(&mut peer).await;
    assert_eq!(
        request.get("MessageType").and_then(|v| v.as_string()),
        Some("ListDevices")
    );

    let mut response = plist::Dictionary::new();
    response.insert("DeviceList".to_string(), plist::Value::Array(Vec::new()));
    write_mux_response(&mut peer, response).await;

    let devices = call.await.unwrap().unwrap();
    assert!(devices.is_empty());
}

// Jackson Coxson
//! Seed scenarios: a plain `StartSession` happy path, and the silent
//! re-pair-and-retry that's supposed to follow an `InvalidHostID` reply.

#![cfg(all(feature = "xcuitest", feature = "pair"))]

mod common;

use common::{read_request, test_pairing_file, write_response, MockProvider};
use idevice::services::lockdown::LockdownClient;
use idevice::{DeviceHandle, IdeviceService};
use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::pkcs8::LineEnding;
use rsa::{RsaPrivateKey, RsaPublicKey};

#[tokio::test]
async fn pair_and_start_session_happy_path() {
    let pairing_file = test_pairing_file();
    let (provider, mut peers, _saved) = MockProvider::new(pairing_file.clone());

    let call = tokio::spawn(async move { LockdownClient::connect(&provider).await });

    // handle QueryType-less StartSession directly via the connected socket.
    let mut peer = peers.recv().await.unwrap();
    let request = read_request(&mut peer).await;
    assert_eq!(
        request.get("Request").and_then(|v| v.as_string()),
        Some("StartSession")
    );
    assert_eq!(
        request.get("HostID").and_then(|v| v.as_string()),
        Some(pairing_file.host_id.as_str())
    );

    let mut response = plist::Dictionary::new();
    response.insert(
        "SessionID".to_string(),
        plist::Value::String("abc".to_string()),
    );
    write_response(&mut peer, response).await;

    let mut lockdown = call.await.unwrap().unwrap();
    let session_id = lockdown.start_session(&pairing_file).await.unwrap();
    assert_eq!(session_id, "abc");
}

#[tokio::test]
async fn invalid_host_id_triggers_exactly_one_repair_then_succeeds() {
    let pairing_file = test_pairing_file();
    let (provider, mut peers, saved) = MockProvider::new(pairing_file.clone());
    let device = DeviceHandle::new(Box::new(provider));

    let call = tokio::spawn(async move { device.start_session().await });

    // First LockdownClient::connect + StartSession: device reports a stale host id.
    let mut peer = peers.recv().await.unwrap();
    let request = read_request(&mut peer).await;
    assert_eq!(
        request.get("Request").and_then(|v| v.as_string()),
        Some("StartSession")
    );
    let mut error = plist::Dictionary::new();
    error.insert(
        "Error".to_string(),
        plist::Value::String("InvalidHostID".to_string()),
    );
    write_response(&mut peer, error).await;

    // Still on the same connection: LockdownClient::pair() fetches the
    // device's public key and WiFi MAC, then submits the new pair record.
    let request = read_request(&mut peer).await;
    assert_eq!(
        request.get("Request").and_then(|v| v.as_string()),
        Some("GetValue")
    );
    assert_eq!(
        request.get("Key").and_then(|v| v.as_string()),
        Some("DevicePublicKey")
    );

    let mut rng = rsa::rand_core::OsRng;
    let device_private_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
    let device_public_key = RsaPublicKey::from(&device_private_key);
    let device_public_key_pem = device_public_key.to_pkcs1_pem(LineEnding::LF).unwrap();

    let mut value_response = plist::Dictionary::new();
    value_response.insert(
        "Value".to_string(),
        plist::Value::Data(device_public_key_pem.as_bytes().to_vec()),
    );
    write_response(&mut peer, value_response).await;

    let request = read_request(&mut peer).await;
    assert_eq!(
        request.get("Key").and_then(|v| v.as_string()),
        Some("WiFiAddress")
    );
    let mut value_response = plist::Dictionary::new();
    value_response.insert(
        "Value".to_string(),
        plist::Value::String("aa:bb:cc:dd:ee:ff".to_string()),
    );
    write_response(&mut peer, value_response).await;

    let request = read_request(&mut peer).await;
    assert_eq!(
        request.get("Request").and_then(|v| v.as_string()),
        Some("Pair")
    );
    let mut pair_response = plist::Dictionary::new();
    pair_response.insert(
        "EscrowBag".to_string(),
        plist::Value::Data(vec![1, 2, 3, 4]),
    );
    write_response(&mut peer, pair_response).await;

    // DeviceHandle::start_session re-connects for the retried StartSession.
    let mut peer = peers.recv().await.unwrap();
    let request = read_request(&mut peer).await;
    assert_eq!(
        request.get("Request").and_then(|v| v.as_string()),
        Some("StartSession")
    );
    let mut response = plist::Dictionary::new();
    response.insert(
        "SessionID".to_string(),
        plist::Value::String("xyz".to_string()),
    );
    write_response(&mut peer, response).await;

    let (_lockdown, session_id) = call.await.unwrap().unwrap();
    assert_eq!(session_id, "xyz");
    assert_eq!(saved.lock().unwrap().len(), 1);
}

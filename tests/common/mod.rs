// Jackson Coxson
//! Shared scaffolding for the seed end-to-end scenario tests: a mock
//! provider that hands out a fresh `tokio::io::duplex` pair per connection
//! (mirroring how a real device opens a new socket per lockdownd/service
//! request) plus the idevice wire framing helpers needed to script the
//! device side of the conversation by hand.

use std::sync::{Arc, Mutex as StdMutex};

use idevice::pairing_file::PairingFile;
use idevice::provider::IdeviceProvider;
use idevice::{Idevice, IdeviceError};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

/// Reads one idevice-framed (4-byte big-endian length + XML plist) request
/// off the device side of a mocked connection.
pub async fn read_request(peer: &mut DuplexStream) -> plist::Dictionary {
    let mut len_buf = [0u8; 4];
    peer.read_exact(&mut len_buf).await.unwrap();
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    peer.read_exact(&mut body).await.unwrap();
    plist::from_bytes(&body).unwrap()
}

/// Writes one idevice-framed plist response.
pub async fn write_response(peer: &mut DuplexStream, dict: plist::Dictionary) {
    let mut body = Vec::new();
    plist::Value::Dictionary(dict)
        .to_writer_xml(&mut body)
        .unwrap();
    peer.write_all(&(body.len() as u32).to_be_bytes())
        .await
        .unwrap();
    peer.write_all(&body).await.unwrap();
    peer.flush().await.unwrap();
}

/// An [`IdeviceProvider`] backed by an in-process duplex stream instead of a
/// real usbmuxd tunnel. Every `connect()` call hands out a fresh pair and
/// pushes the device-side half down `peer_tx`, in call order, so the test
/// can drive each connection as it's opened.
pub struct MockProvider {
    pairing_file: PairingFile,
    peer_tx: AsyncMutex<mpsc::UnboundedSender<DuplexStream>>,
    saved_records: Arc<StdMutex<Vec<PairingFile>>>,
}

impl std::fmt::Debug for MockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockProvider").finish_non_exhaustive()
    }
}

impl MockProvider {
    pub fn new(
        pairing_file: PairingFile,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<DuplexStream>,
        Arc<StdMutex<Vec<PairingFile>>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let saved_records = Arc::new(StdMutex::new(Vec::new()));
        (
            Self {
                pairing_file,
                peer_tx: AsyncMutex::new(tx),
                saved_records: saved_records.clone(),
            },
            rx,
            saved_records,
        )
    }
}

impl IdeviceProvider for MockProvider {
    async fn connect(&self, _port: u16) -> Result<Idevice, IdeviceError> {
        let (client, peer) = tokio::io::duplex(256 * 1024);
        self.peer_tx.lock().await.send(peer).ok();
        Ok(Idevice::new(Box::new(client), "mock".to_string()))
    }

    fn label(&self) -> &str {
        "mock"
    }

    async fn get_pairing_file(&self) -> Result<PairingFile, IdeviceError> {
        Ok(self.pairing_file.clone())
    }

    async fn save_pairing_file(&self, record: &PairingFile) -> Result<(), IdeviceError> {
        self.saved_records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// A pairing file with placeholder cryptographic material; fine for tests
/// that never touch `EnableSessionSSL=true` (the mock peers below never set
/// it, so the TLS upgrade path in `Idevice::start_session` is never hit).
pub fn test_pairing_file() -> PairingFile {
    PairingFile {
        device_certificate: Vec::new(),
        host_private_key: Vec::new(),
        host_certificate: Vec::new(),
        root_private_key: Vec::new(),
        root_certificate: Vec::new(),
        device_public_key: Vec::new(),
        system_buid: "11111111-2222-3333-4444-555555555555".to_string(),
        host_id: "AAAAAAAA-BBBB-CCCC-DDDD-EEEEEEEEEEEE".to_string(),
        escrow_bag: Vec::new(),
        wifi_mac_address: "aa:bb:cc:dd:ee:ff".to_string(),
        udid: Some("deadbeef00112233deadbeef00112233deadbeef".to_string()),
    }
}

// Jackson Coxson

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::{Idevice, IdeviceError, ReadWrite, pairing_file::PairingFile};

mod raw_packet;

/// Where to find the mux daemon's control socket, overridable by the
/// `USBMUXD_SOCKET_ADDRESS` environment variable (`unix:<path>` or
/// `tcp:<host>:<port>`).
#[derive(Debug, Clone)]
pub enum UsbmuxdAddr {
    #[cfg(unix)]
    Unix(String),
    Tcp(IpAddr, u16),
}

impl UsbmuxdAddr {
    pub const ENV_VAR: &'static str = "USBMUXD_SOCKET_ADDRESS";

    /// Reads `USBMUXD_SOCKET_ADDRESS`, falling back to the platform default
    /// (`/var/run/usbmuxd` on Unix, `127.0.0.1:27015` on Windows) if unset
    /// or unparsable.
    pub fn from_env() -> Self {
        match std::env::var(Self::ENV_VAR) {
            Ok(v) => Self::parse(&v).unwrap_or_else(|| Self::default_addr()),
            Err(_) => Self::default_addr(),
        }
    }

    fn parse(s: &str) -> Option<Self> {
        #[cfg(unix)]
        if let Some(path) = s.strip_prefix("unix:") {
            return Some(Self::Unix(path.to_string()));
        }
        if let Some(rest) = s.strip_prefix("tcp:") {
            let (host, port) = rest.rsplit_once(':')?;
            let addr: IpAddr = host.parse().ok()?;
            let port: u16 = port.parse().ok()?;
            return Some(Self::Tcp(addr, port));
        }
        None
    }

    #[cfg(unix)]
    fn default_addr() -> Self {
        Self::Unix(UsbmuxdConnection::SOCKET_FILE.to_string())
    }

    #[cfg(not(unix))]
    fn default_addr() -> Self {
        Self::Tcp(
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            UsbmuxdConnection::DEFAULT_PORT,
        )
    }

    pub async fn connect(&self, tag: u32) -> Result<UsbmuxdConnection, IdeviceError> {
        let socket: Box<dyn ReadWrite> = match self {
            #[cfg(unix)]
            Self::Unix(path) => Box::new(tokio::net::UnixStream::connect(path).await?),
            Self::Tcp(addr, port) => {
                Box::new(tokio::net::TcpStream::connect(SocketAddr::new(*addr, *port)).await?)
            }
        };
        Ok(UsbmuxdConnection::new(socket, tag).await)
    }
}

#[derive(Debug, Clone)]
pub enum Connection {
    Usb,
    Network(IpAddr),
    Unknown(String),
}

#[derive(Debug, Clone)]
pub struct UsbmuxdDevice {
    pub connection_type: Connection,
    pub udid: String,
    pub device_id: u32,
}

/// A frame from a `Listen` stream.
#[derive(Debug, Clone)]
pub enum MuxEvent {
    Attached(UsbmuxdDevice),
    Detached(u32),
}

pub struct UsbmuxdConnection {
    socket: Box<dyn ReadWrite>,
    tag: u32,
}

#[derive(Deserialize)]
struct ListDevicesResponse {
    #[serde(rename = "DeviceList")]
    device_list: Vec<DeviceListResponse>,
}

#[derive(Deserialize)]
struct DeviceListResponse {
    #[serde(rename = "DeviceID")]
    device_id: u32,
    #[serde(rename = "Properties")]
    properties: DevicePropertiesResponse,
}

#[derive(Deserialize)]
struct DevicePropertiesResponse {
    #[serde(rename = "ConnectionType")]
    connection_type: String,
    #[serde(rename = "NetworkAddress")]
    network_address: Option<plist::Data>,
    #[serde(rename = "SerialNumber")]
    serial_number: String,
}

impl UsbmuxdConnection {
    pub const DEFAULT_PORT: u16 = 27015;
    #[cfg(unix)]
    pub const SOCKET_FILE: &str = "/var/run/usbmuxd";

    pub const BINARY_PLIST_VERSION: u32 = 0;
    pub const XML_PLIST_VERSION: u32 = 1;

    pub const RESULT_MESSAGE_TYPE: u32 = 1;
    pub const PLIST_MESSAGE_TYPE: u32 = 8;

    /// Connects using the platform default / `USBMUXD_SOCKET_ADDRESS`
    /// address, with tag 0.
    pub async fn default() -> Result<Self, IdeviceError> {
        UsbmuxdAddr::from_env().connect(0).await
    }

    pub async fn new(socket: Box<dyn ReadWrite>, tag: u32) -> Self {
        Self { socket, tag }
    }

    pub async fn get_devices(&mut self) -> Result<Vec<UsbmuxdDevice>, IdeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ListDevices".into());
        req.insert("ClientVersionString".into(), "idevice-rs".into());
        req.insert("kLibUSBMuxVersion".into(), 3.into());
        self.write_plist(req).await?;
        let res = self.read_plist().await?;
        let res = plist::to_value(&res)?;
        let res = plist::from_value::<ListDevicesResponse>(&res)?;

        res.device_list.into_iter().map(device_from_response).collect()
    }

    /// Sends `Listen` and returns a stream of `Attached`/`Detached` events.
    /// The connection is consumed: once listening, the mux daemon only
    /// sends attach/detach frames on this socket.
    pub async fn listen(mut self) -> Result<UsbmuxdListener, IdeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "Listen".into());
        self.write_plist(req).await?;
        self.read_plist().await?; // initial Result frame, discarded
        Ok(UsbmuxdListener { conn: self })
    }

    pub async fn get_pair_record(&mut self, udid: &str) -> Result<PairingFile, IdeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ReadPairRecord".into());
        req.insert("PairRecordID".into(), udid.into());
        self.write_plist(req).await?;
        let res = self.read_plist().await?;

        match res.get("PairRecordData") {
            Some(plist::Value::Data(d)) => PairingFile::from_bytes(d),
            _ => Err(IdeviceError::UnexpectedResponse),
        }
    }

    /// Persists a pairing record under `udid` so future connections skip
    /// re-pairing.
    pub async fn save_pair_record(
        &mut self,
        udid: &str,
        device_id: u32,
        record: &PairingFile,
    ) -> Result<(), IdeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "SavePairRecord".into());
        req.insert("PairRecordID".into(), udid.into());
        req.insert("DeviceID".into(), device_id.into());
        req.insert(
            "PairRecordData".into(),
            plist::Value::Data(record.serialize()?),
        );
        self.write_plist(req).await?;
        self.expect_success().await
    }

    pub async fn delete_pair_record(&mut self, udid: &str) -> Result<(), IdeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "DeletePairRecord".into());
        req.insert("PairRecordID".into(), udid.into());
        self.write_plist(req).await?;
        self.expect_success().await
    }

    pub async fn get_buid(&mut self) -> Result<String, IdeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ReadBUID".into());
        self.write_plist(req).await?;
        let mut res = self.read_plist().await?;

        match res.remove("BUID") {
            Some(plist::Value::String(s)) => Ok(s),
            _ => Err(IdeviceError::UnexpectedResponse),
        }
    }

    /// Requests a tunnel to `port` on `device_id` and wraps it as a labeled
    /// [`Idevice`] connection.
    pub async fn connect_to_device(
        mut self,
        device_id: u32,
        port: u16,
        label: &str,
    ) -> Result<Idevice, IdeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "Connect".into());
        req.insert("DeviceID".into(), device_id.into());
        // The mux daemon expects the port byte-swapped from host order.
        req.insert("PortNumber".into(), (port.to_be() as i64).into());
        self.write_plist(req).await?;
        match self.read_plist().await?.get("Number") {
            Some(plist::Value::Integer(i)) => match i.as_unsigned() {
                Some(0) => Ok(Idevice::new(self.socket, label.to_string())),
                Some(n) => Err(IdeviceError::MuxReplyError(n as i64)),
                None => Err(IdeviceError::UnexpectedResponse),
            },
            _ => Err(IdeviceError::UnexpectedResponse),
        }
    }

    async fn expect_success(&mut self) -> Result<(), IdeviceError> {
        match self.read_plist().await?.get("Number") {
            Some(plist::Value::Integer(i)) => match i.as_unsigned() {
                Some(0) => Ok(()),
                Some(n) => Err(IdeviceError::MuxReplyError(n as i64)),
                None => Err(IdeviceError::UnexpectedResponse),
            },
            _ => Err(IdeviceError::UnexpectedResponse),
        }
    }

    async fn write_plist(&mut self, req: plist::Dictionary) -> Result<(), IdeviceError> {
        let raw = raw_packet::RawPacket::new(
            req,
            Self::XML_PLIST_VERSION,
            Self::PLIST_MESSAGE_TYPE,
            self.tag,
        );

        let raw: Vec<u8> = raw.into();
        self.socket.write_all(&raw).await?;

        Ok(())
    }

    async fn read_plist(&mut self) -> Result<plist::Dictionary, IdeviceError> {
        let mut header_buffer = [0; 16];
        self.socket.read_exact(&mut header_buffer).await?;

        // We are safe to unwrap as it only panics if the buffer isn't 4
        let packet_size = u32::from_le_bytes(header_buffer[..4].try_into().unwrap()) - 16;
        debug!("Reading {packet_size} bytes from muxer");

        let mut body_buffer = vec![0; packet_size as usize];
        self.socket.read_exact(&mut body_buffer).await?;

        let res = plist::from_bytes(&body_buffer)?;

        Ok(res)
    }
}

fn device_from_response(dev: DeviceListResponse) -> Result<UsbmuxdDevice, IdeviceError> {
    let connection_type = match dev.properties.connection_type.as_str() {
        "Network" => {
            if let Some(addr) = dev.properties.network_address {
                let addr = &Into::<Vec<u8>>::into(addr);
                if addr.len() < 8 {
                    return Err(IdeviceError::UnexpectedResponse);
                }

                let addr = match addr[0] {
                    0x02 => {
                        // ipv4
                        IpAddr::V4(Ipv4Addr::new(addr[4], addr[5], addr[6], addr[7]))
                    }
                    0x1E => {
                        // ipv6
                        if addr.len() < 24 {
                            return Err(IdeviceError::UnexpectedResponse);
                        }

                        IpAddr::V6(Ipv6Addr::new(
                            u16::from_le_bytes([addr[8], addr[9]]),
                            u16::from_le_bytes([addr[10], addr[11]]),
                            u16::from_le_bytes([addr[12], addr[13]]),
                            u16::from_le_bytes([addr[14], addr[15]]),
                            u16::from_le_bytes([addr[16], addr[17]]),
                            u16::from_le_bytes([addr[18], addr[19]]),
                            u16::from_le_bytes([addr[20], addr[21]]),
                            u16::from_le_bytes([addr[22], addr[23]]),
                        ))
                    }
                    _ => {
                        return Err(IdeviceError::UnexpectedResponse);
                    }
                };
                Connection::Network(addr)
            } else {
                return Err(IdeviceError::UnexpectedResponse);
            }
        }
        "USB" => Connection::Usb,
        _ => Connection::Unknown(dev.properties.connection_type),
    };

    Ok(UsbmuxdDevice {
        connection_type,
        udid: dev.properties.serial_number,
        device_id: dev.device_id,
    })
}

/// Wraps a [`UsbmuxdConnection`] that has sent `Listen`, decoding
/// subsequent frames into [`MuxEvent`]s.
pub struct UsbmuxdListener {
    conn: UsbmuxdConnection,
}

impl UsbmuxdListener {
    pub async fn next(&mut self) -> Result<MuxEvent, IdeviceError> {
        let res = self.conn.read_plist().await?;
        match res.get("MessageType").and_then(|v| v.as_string()) {
            Some("Attached") => {
                let props: DeviceListResponse = plist::from_value(&plist::to_value(&res)?)?;
                Ok(MuxEvent::Attached(device_from_response(props)?))
            }
            Some("Detached") => {
                let device_id = res
                    .get("DeviceID")
                    .and_then(|v| v.as_unsigned_integer())
                    .ok_or(IdeviceError::UnexpectedResponse)? as u32;
                Ok(MuxEvent::Detached(device_id))
            }
            _ => Err(IdeviceError::UnexpectedResponse),
        }
    }
}

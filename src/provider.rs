// Jackson Coxson

use std::net::{IpAddr, SocketAddr};

use tokio::net::TcpStream;

use crate::{pairing_file::PairingFile, usbmuxd::UsbmuxdAddr, Idevice, IdeviceError};

pub trait IdeviceProvider: Unpin + Send + Sync + std::fmt::Debug {
    // https://blog.rust-lang.org/2023/12/21/async-fn-rpit-in-traits.html#is-it-okay-to-use-async-fn-in-traits-what-are-the-limitations
    fn connect(
        &self,
        port: u16,
    ) -> impl std::future::Future<Output = Result<Idevice, IdeviceError>> + Send;
    fn label(&self) -> &str;
    fn get_pairing_file(
        &self,
    ) -> impl std::future::Future<Output = Result<PairingFile, IdeviceError>> + Send;

    /// Persists a freshly re-paired record so the next connection skips
    /// re-pairing. Providers with nowhere to persist to (e.g. a pairing file
    /// handed in directly over TCP) no-op.
    fn save_pairing_file(
        &self,
        _record: &PairingFile,
    ) -> impl std::future::Future<Output = Result<(), IdeviceError>> + Send {
        async { Ok(()) }
    }

    /// The developer disk image and its signature, if this provider has one
    /// configured. Directory discovery is a command-line-front-end concern,
    /// not this crate's, so providers that don't carry one default to `None`
    /// and `StartService`'s `InvalidService` mount-and-retry is skipped.
    fn developer_disk_image(
        &self,
    ) -> impl std::future::Future<Output = Result<Option<(Vec<u8>, Vec<u8>)>, IdeviceError>> + Send
    {
        async { Ok(None) }
    }
}

#[derive(Debug)]
pub struct TcpProvider {
    addr: IpAddr,
    pairing_file: PairingFile,
    label: String,
}

impl TcpProvider {
    pub fn new(addr: IpAddr, pairing_file: PairingFile, label: impl Into<String>) -> Self {
        Self {
            addr,
            pairing_file,
            label: label.into(),
        }
    }
}

impl IdeviceProvider for TcpProvider {
    async fn connect(&self, port: u16) -> Result<Idevice, IdeviceError> {
        let socket_addr = SocketAddr::new(self.addr, port);
        let stream = TcpStream::connect(socket_addr).await?;
        Ok(Idevice::new(Box::new(stream), self.label.to_owned()))
    }
    fn label(&self) -> &str {
        self.label.as_str()
    }

    async fn get_pairing_file(&self) -> Result<PairingFile, IdeviceError> {
        Ok(self.pairing_file.clone())
    }
}

#[cfg(feature = "usbmuxd")]
#[derive(Debug)]
pub struct UsbmuxdProvider {
    addr: UsbmuxdAddr,
    tag: u32,
    udid: String,
    device_id: u32,
    label: String,
}

#[cfg(feature = "usbmuxd")]
impl UsbmuxdProvider {
    pub fn new(addr: UsbmuxdAddr, tag: u32, udid: impl Into<String>, device_id: u32, label: impl Into<String>) -> Self {
        Self {
            addr,
            tag,
            udid: udid.into(),
            device_id,
            label: label.into(),
        }
    }
}

#[cfg(feature = "usbmuxd")]
impl UsbmuxdProvider {
    /// `connect_to_device` without the `MuxReplyError(6)` retry, so the
    /// retry path itself can open lockdownd/device connections without
    /// recursing into itself.
    async fn raw_connect(&self, port: u16) -> Result<Idevice, IdeviceError> {
        let usbmuxd = self.addr.connect(self.tag).await?;
        usbmuxd
            .connect_to_device(self.device_id, port, &self.label)
            .await
    }

    /// A `MuxReplyError(6)` (`BadDevice`) means the device no longer
    /// recognizes this host's pair record. Deletes it, re-pairs over a
    /// fresh lockdownd connection, persists the new record, and retries
    /// the original connection once.
    #[cfg(feature = "pair")]
    async fn repair_and_retry(&self, port: u16) -> Result<Idevice, IdeviceError> {
        let pairing_file = self.get_pairing_file().await?;

        let idevice = self
            .raw_connect(crate::services::lockdown::LockdownClient::LOCKDOWND_PORT)
            .await?;
        let mut lockdown = crate::services::lockdown::LockdownClient::new(idevice);
        let new_record = lockdown
            .pair(pairing_file.host_id.clone(), pairing_file.system_buid.clone())
            .await?;

        let mut usbmuxd = self.addr.connect(self.tag).await?;
        usbmuxd.delete_pair_record(&self.udid).await.ok();
        usbmuxd
            .save_pair_record(&self.udid, self.device_id, &new_record)
            .await?;

        self.raw_connect(port).await
    }

    #[cfg(not(feature = "pair"))]
    async fn repair_and_retry(&self, _port: u16) -> Result<Idevice, IdeviceError> {
        Err(IdeviceError::MuxReplyError(6))
    }
}

#[cfg(feature = "usbmuxd")]
impl IdeviceProvider for UsbmuxdProvider {
    async fn connect(&self, port: u16) -> Result<Idevice, IdeviceError> {
        match self.raw_connect(port).await {
            Err(IdeviceError::MuxReplyError(6)) => self.repair_and_retry(port).await,
            other => other,
        }
    }

    fn label(&self) -> &str {
        self.label.as_str()
    }

    async fn get_pairing_file(&self) -> Result<PairingFile, IdeviceError> {
        let mut usbmuxd = self.addr.connect(self.tag).await?;
        usbmuxd.get_pair_record(&self.udid).await
    }

    async fn save_pairing_file(&self, record: &PairingFile) -> Result<(), IdeviceError> {
        let mut usbmuxd = self.addr.connect(self.tag).await?;
        usbmuxd
            .save_pair_record(&self.udid, self.device_id, record)
            .await
    }
}

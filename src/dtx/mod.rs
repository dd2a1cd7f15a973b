// Jackson Coxson
//! The DTX ("Distributed Objects") channel multiplexer used by
//! `instruments` and `testmanagerd`.
//!
//! This module is transport-agnostic: callers open a `lockdownd` service
//! (or a raw socket, for the secure `testmanagerd` variant that doesn't
//! route through `StartService`) and hand the resulting stream to
//! [`DtxConnection::connect`].

pub mod connection;
pub mod message;

pub use connection::{Channel, DtxConnection, FINISHED, NOTIFICATION};
pub use message::{AuxBuffer, AuxValue, DtxMessage, PayloadKind};

use crate::provider::IdeviceProvider;
use crate::services::lockdown::LockdownClient;
use crate::{IdeviceError, ReadWrite};

/// Opens `service_name` through `lockdownd` and establishes a DTX connection
/// over it, upgrading to TLS first if the service requires it.
pub async fn connect_via_lockdown(
    provider: &dyn IdeviceProvider,
    service_name: impl Into<String>,
) -> Result<DtxConnection, IdeviceError> {
    let service_name = service_name.into();
    let mut lockdown = LockdownClient::connect(provider).await?;
    lockdown
        .start_session(&provider.get_pairing_file().await?)
        .await?;

    let (port, ssl) = match lockdown.start_service(service_name.clone()).await {
        Ok(r) => r,
        Err(IdeviceError::InvalidService) => {
            #[cfg(feature = "mobile_image_mounter")]
            {
                crate::services::mobile_image_mounter::mount_via_provider(provider).await?;
                lockdown.start_service(service_name).await?
            }
            #[cfg(not(feature = "mobile_image_mounter"))]
            {
                return Err(IdeviceError::InvalidService);
            }
        }
        Err(e) => return Err(e),
    };
    let mut idevice = provider.connect(port).await?;
    if ssl {
        idevice
            .start_session(&provider.get_pairing_file().await?, false)
            .await?;
    }

    let socket: Box<dyn ReadWrite> = idevice
        .get_socket()
        .ok_or(IdeviceError::NoEstablishedConnection)?;
    DtxConnection::connect(socket).await
}

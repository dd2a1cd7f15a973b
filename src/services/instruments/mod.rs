// Jackson Coxson
//! Instruments service: process launch/kill/listing over the DTX
//! `com.apple.instruments.server.services.processcontrol` channel.

pub mod process_control;

pub use process_control::{ProcessControlClient, ProcessInfo};

use crate::dtx::DtxConnection;
use crate::provider::IdeviceProvider;
use crate::IdeviceError;

// iOS version support notes:
// - com.apple.instruments.remoteserver is used pre-iOS 17 and reached directly
//   through lockdownd's StartService.
// - com.apple.instruments.remoteserver.DVTSecureSocketProxy is seen on some
//   iOS 14 builds in place of the name above.
// - iOS 17+ moves Instruments behind com.apple.instruments.dtservicehub,
//   which is only reachable over the RemoteXPC tunnel; that transport is out
//   of scope here, so this client targets pre-17 devices.
const SERVICE_NAMES: &[&str] = &[
    "com.apple.instruments.remoteserver",
    "com.apple.instruments.remoteserver.DVTSecureSocketProxy",
];

/// Opens a DTX connection to the Instruments remote server.
pub async fn connect(provider: &dyn IdeviceProvider) -> Result<DtxConnection, IdeviceError> {
    let mut last_err = None;
    for name in SERVICE_NAMES {
        match crate::dtx::connect_via_lockdown(provider, *name).await {
            Ok(conn) => return Ok(conn),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or(IdeviceError::ServiceNotFound))
}

//! Bundles the various device services into a single module.

#[cfg(feature = "afc")]
pub mod afc;
#[cfg(feature = "amfi")]
pub mod amfi;
#[cfg(feature = "house_arrest")]
pub mod house_arrest;
#[cfg(feature = "installation_proxy")]
pub mod installation_proxy;
#[cfg(feature = "dtx")]
pub mod instruments;
pub mod lockdown;
#[cfg(feature = "mobile_image_mounter")]
pub mod mobile_image_mounter;
#[cfg(feature = "xcuitest")]
pub mod xcuitest;

#[cfg(feature = "afc")]
pub use afc::AfcClient;
#[cfg(feature = "amfi")]
pub use amfi::AmfiClient;
#[cfg(feature = "house_arrest")]
pub use house_arrest::HouseArrestClient;
#[cfg(feature = "installation_proxy")]
pub use installation_proxy::InstallationProxyClient;
#[cfg(feature = "dtx")]
pub use instruments::{ProcessControlClient, ProcessInfo};
pub use lockdown::LockdownClient;
#[cfg(feature = "mobile_image_mounter")]
pub use mobile_image_mounter::ImageMounter;
#[cfg(feature = "xcuitest")]
pub use xcuitest::{XCTestResult, XcuiTestOptions};

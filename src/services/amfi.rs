//! Abstraction for Apple Mobile File Integrity
//!
//! Unlike most lockdown services, `amfi.lockdown` replies with a bare 4-byte
//! response code instead of a plist: `0xD9` means Developer Mode needs to be
//! enabled in Settings, `0xE6` (only after `action: 1`) means the device is
//! rebooting to show the enable dialog.

use crate::{Idevice, IdeviceError, IdeviceService, obf};

const DEVELOPER_MODE_REQUIRED: u32 = 0xD9;
const DEVELOPER_MODE_REBOOTING: u32 = 0xE6;

/// Client for interacting with the AMFI service on the device
pub struct AmfiClient {
    /// The underlying device connection with established amfi service
    pub idevice: Idevice,
}

impl IdeviceService for AmfiClient {
    /// Returns the amfi service name as registered with lockdownd
    fn service_name() -> std::borrow::Cow<'static, str> {
        obf!("com.apple.amfi.lockdown")
    }

    async fn from_stream(idevice: Idevice) -> Result<Self, crate::IdeviceError> {
        Ok(Self::new(idevice))
    }
}

impl AmfiClient {
    /// Creates a new amfi client from an existing device connection
    ///
    /// # Arguments
    /// * `idevice` - Pre-established device connection
    pub fn new(idevice: Idevice) -> Self {
        Self { idevice }
    }

    async fn send_action(&mut self, action: i64, uuid: Option<String>) -> Result<u32, IdeviceError> {
        let request = crate::plist!({
            "action": action,
            "input_profile_uuid":? uuid,
        });
        self.idevice.send_plist(request).await?;

        let res = self.idevice.read_raw(4).await?;
        let code = u32::from_be_bytes(res.try_into().map_err(|_| IdeviceError::UnexpectedResponse)?);
        Ok(code)
    }

    /// Shows the developer mode option in settings in iOS 18+
    /// Settings -> Privacy & Security -> Developer Mode
    ///
    /// A response of `0xD9` means the user still needs to enable Developer
    /// Mode by hand; this is surfaced verbatim rather than treated as an
    /// error, since the caller is best placed to decide what to do about it.
    pub async fn reveal_developer_mode_option_in_ui(&mut self) -> Result<u32, IdeviceError> {
        self.send_action(0, None).await
    }

    /// Enables developer mode, triggering a reboot on devices without a
    /// passcode set. A response of `0xE6` means the device is rebooting to
    /// show the enable dialog; this only happens in response to this call.
    pub async fn enable_developer_mode(&mut self) -> Result<u32, IdeviceError> {
        let code = self.send_action(1, None).await?;
        if code != 0 && code != DEVELOPER_MODE_REBOOTING && code != DEVELOPER_MODE_REQUIRED {
            return Err(IdeviceError::UnexpectedResponse);
        }
        Ok(code)
    }

    /// Shows the accept dialogue for enabling developer mode
    pub async fn accept_developer_mode(&mut self) -> Result<(), IdeviceError> {
        let code = self.send_action(2, None).await?;
        if code == 0 {
            Ok(())
        } else {
            Err(IdeviceError::UnexpectedResponse)
        }
    }

    /// Trusts an app signer by profile UUID
    pub async fn trust_app_signer(
        &mut self,
        uuid: impl Into<String>,
    ) -> Result<(), IdeviceError> {
        let code = self.send_action(4, Some(uuid.into())).await?;
        if code == 0 {
            Ok(())
        } else {
            Err(IdeviceError::UnexpectedResponse)
        }
    }
}

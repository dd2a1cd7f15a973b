//! iOS Image Mounter Client
//!
//! Provides functionality for mounting developer disk images on iOS devices,
//! from uploading the image and its signature to mounting it with
//! `MountImage`. Personalization queries (manifest, nonce, identifiers) are
//! exposed for devices that require them, but fetching a manifest from
//! Apple's personalization server is out of scope here.

use tracing::debug;

use crate::{Idevice, IdeviceError, IdeviceService, obf};

/// Client for interacting with the iOS mobile image mounter service
///
/// Manages mounted images on the device.
///
/// # Important Note
/// A lockdown client must be established and queried after establishing a mounter client,
/// or the device will stop responding to requests.
pub struct ImageMounter {
    /// The underlying device connection with established image mounter service
    idevice: Idevice,
}

impl IdeviceService for ImageMounter {
    /// Returns the image mounter service name as registered with lockdownd
    fn service_name() -> std::borrow::Cow<'static, str> {
        obf!("com.apple.mobile.mobile_image_mounter")
    }

    async fn from_stream(idevice: Idevice) -> Result<Self, crate::IdeviceError> {
        Ok(Self::new(idevice))
    }
}

impl ImageMounter {
    /// Creates a new image mounter client from an existing device connection
    ///
    /// # Arguments
    /// * `idevice` - Pre-established device connection
    pub fn new(idevice: Idevice) -> Self {
        Self { idevice }
    }

    /// Retrieves a list of currently mounted devices
    ///
    /// # Returns
    /// A vector of plist values describing mounted devices
    ///
    /// # Errors
    /// Returns `IdeviceError` if communication fails or response is malformed
    pub async fn copy_devices(&mut self) -> Result<Vec<plist::Value>, IdeviceError> {
        let req = crate::plist!({
            "Command": "CopyDevices"
        });
        self.idevice.send_plist(req).await?;
        let mut res = self.idevice.read_plist().await?;

        match res.remove("EntryList") {
            Some(plist::Value::Array(i)) => Ok(i),
            _ => Err(IdeviceError::UnexpectedResponse),
        }
    }

    /// Looks up an image by type and returns its signature
    ///
    /// # Arguments
    /// * `image_type` - The type of image to lookup (e.g., "Developer")
    ///
    /// # Returns
    /// The image signature if found
    ///
    /// # Errors
    /// Returns `IdeviceError::NotFound` if image doesn't exist
    pub async fn lookup_image(
        &mut self,
        image_type: impl Into<&str>,
    ) -> Result<Vec<u8>, IdeviceError> {
        let image_type = image_type.into();
        let req = crate::plist!({
            "Command": "LookupImage",
            "ImageType": image_type
        });
        self.idevice.send_plist(req).await?;

        let res = self.idevice.read_plist().await?;
        match res.get("ImageSignature") {
            Some(plist::Value::Data(signature)) => Ok(signature.clone()),
            _ => Err(IdeviceError::NotFound),
        }
    }

    /// Uploads an image to the device
    ///
    /// # Arguments
    /// * `image_type` - Type of image being uploaded
    /// * `image` - The image data
    /// * `signature` - Signature for the image
    ///
    /// # Errors
    /// Returns `IdeviceError` if upload fails
    pub async fn upload_image(
        &mut self,
        image_type: impl Into<String>,
        image: &[u8],
        signature: Vec<u8>,
    ) -> Result<(), IdeviceError> {
        self.upload_image_with_progress(image_type, image, signature, |_| async {}, ())
            .await
    }

    /// Uploads an image with progress callbacks
    ///
    /// # Arguments
    /// * `image_type` - Type of image being uploaded
    /// * `image` - The image data
    /// * `signature` - Signature for the image
    /// * `callback` - Progress callback
    /// * `state` - State to pass to callback
    ///
    /// # Type Parameters
    /// * `Fut` - Future type returned by callback
    /// * `S` - Type of state passed to callback
    ///
    /// # Errors
    /// Returns `IdeviceError` if upload fails
    pub async fn upload_image_with_progress<Fut, S>(
        &mut self,
        image_type: impl Into<String>,
        image: &[u8],
        signature: Vec<u8>,
        callback: impl Fn(((usize, usize), S)) -> Fut,
        state: S,
    ) -> Result<(), IdeviceError>
    where
        Fut: std::future::Future<Output = ()>,
        S: Clone,
    {
        let image_type = image_type.into();
        let image_size = match u64::try_from(image.len()) {
            Ok(i) => i,
            Err(e) => {
                tracing::error!("Could not parse image size as u64: {e:?}");
                return Err(IdeviceError::UnexpectedResponse);
            }
        };

        let req = crate::plist!({
            "Command": "ReceiveBytes",
            "ImageType": image_type,
            "ImageSize": image_size,
            "ImageSignature": signature,
        });
        self.idevice.send_plist(req).await?;

        let res = self.idevice.read_plist().await?;
        match res.get("Status") {
            Some(plist::Value::String(s)) => {
                if s.as_str() != "ReceiveBytesAck" {
                    tracing::error!("Received bad response to SendBytes: {s:?}");
                    return Err(IdeviceError::UnexpectedResponse);
                }
            }
            _ => return Err(IdeviceError::UnexpectedResponse),
        }

        debug!("Sending image bytes");
        self.idevice
            .send_raw_with_progress(image, callback, state)
            .await?;

        let res = self.idevice.read_plist().await?;
        match res.get("Status") {
            Some(plist::Value::String(s)) => {
                if s.as_str() != "Complete" {
                    tracing::error!("Image send failure: {s:?}");
                    return Err(IdeviceError::UnexpectedResponse);
                }
            }
            _ => return Err(IdeviceError::UnexpectedResponse),
        }

        Ok(())
    }

    /// Mounts an image on the device
    ///
    /// # Arguments
    /// * `image_type` - Type of image to mount
    /// * `signature` - Signature for the image
    /// * `trust_cache` - Optional trust cache data
    /// * `info_plist` - Optional info plist for the image
    ///
    /// # Errors
    /// Returns `IdeviceError` if mounting fails
    pub async fn mount_image(
        &mut self,
        image_type: impl Into<String>,
        signature: Vec<u8>,
        trust_cache: Option<Vec<u8>>,
        info_plist: Option<plist::Value>,
    ) -> Result<(), IdeviceError> {
        let image_type = image_type.into();

        let req = crate::plist!({
            "Command": "MountImage",
            "ImageType": image_type,
            "ImageSignature": signature,
            "ImageTrustCache":? trust_cache,
            "ImageInfoPlist":? info_plist,
        });
        self.idevice.send_plist(req).await?;

        let res = self.idevice.read_plist().await?;

        match res.get("Status") {
            Some(plist::Value::String(s)) => {
                if s.as_str() != "Complete" {
                    tracing::error!("Image send failure: {s:?}");
                    return Err(IdeviceError::UnexpectedResponse);
                }
            }
            _ => return Err(IdeviceError::UnexpectedResponse),
        }

        Ok(())
    }

    /// Unmounts an image at the specified path
    ///
    /// # Arguments
    /// * `mount_path` - Path where image is mounted:
    ///   - `/Developer` for pre-iOS 17 developer images
    ///   - `/System/Developer` for personalized images
    ///
    /// # Errors
    /// Returns `IdeviceError` if unmounting fails
    pub async fn unmount_image(
        &mut self,
        mount_path: impl Into<String>,
    ) -> Result<(), IdeviceError> {
        let mount_path = mount_path.into();
        let req = crate::plist!({
            "Command": "UnmountImage",
            "MountPath": mount_path,
        });
        self.idevice.send_plist(req).await?;

        let res = self.idevice.read_plist().await?;
        match res.get("Status") {
            Some(plist::Value::String(s)) if s.as_str() == "Complete" => Ok(()),
            _ => Err(IdeviceError::UnexpectedResponse),
        }
    }

    /// Queries the personalization manifest from the device
    ///
    /// # Important
    /// On failure, the socket must be closed and reestablished.
    ///
    /// # Arguments
    /// * `image_type` - Type of image to query manifest for
    /// * `signature` - Signature of the image
    ///
    /// # Returns
    /// The personalization manifest data
    ///
    /// # Errors
    /// Returns `IdeviceError` if query fails
    pub async fn query_personalization_manifest(
        &mut self,
        image_type: impl Into<String>,
        signature: Vec<u8>,
    ) -> Result<Vec<u8>, IdeviceError> {
        let image_type = image_type.into();

        let req = crate::plist!({
            "Command": "QueryPersonalizationManifest",
            "PersonalizedImageType": image_type.clone(),
            "ImageType": image_type,
            "ImageSignature": signature
        });
        self.idevice.send_plist(req).await?;

        let mut res = self.idevice.read_plist().await?;
        match res.remove("ImageSignature") {
            Some(plist::Value::Data(i)) => Ok(i),
            _ => Err(IdeviceError::NotFound),
        }
    }

    /// Queries the developer mode status of the device
    ///
    /// # Returns
    /// `true` if developer mode is enabled, `false` otherwise
    ///
    /// # Errors
    /// Returns `IdeviceError` if query fails
    pub async fn query_developer_mode_status(&mut self) -> Result<bool, IdeviceError> {
        let req = crate::plist!({
            "Command": "QueryDeveloperModeStatus"
        });
        self.idevice.send_plist(req).await?;

        let res = self.idevice.read_plist().await?;
        match res.get("DeveloperModeStatus") {
            Some(plist::Value::Boolean(status)) => Ok(*status),
            _ => Err(IdeviceError::UnexpectedResponse),
        }
    }

    /// Queries the nonce value from the device
    ///
    /// # Arguments
    /// * `personalized_image_type` - Optional image type to get nonce for
    ///
    /// # Returns
    /// The nonce value
    ///
    /// # Errors
    /// Returns `IdeviceError` if query fails
    pub async fn query_nonce(
        &mut self,
        personalized_image_type: Option<&str>,
    ) -> Result<Vec<u8>, IdeviceError> {
        let req = crate::plist!({
            "Command": "QueryNonce",
            "PersonalizedImageType":? personalized_image_type,
        });
        self.idevice.send_plist(req).await?;

        let res = self.idevice.read_plist().await?;
        match res.get("PersonalizationNonce") {
            Some(plist::Value::Data(nonce)) => Ok(nonce.clone()),
            _ => Err(IdeviceError::UnexpectedResponse),
        }
    }

    /// Queries personalization identifiers from the device
    ///
    /// # Arguments
    /// * `image_type` - Optional image type to get identifiers for
    ///
    /// # Returns
    /// Dictionary of personalization identifiers
    ///
    /// # Errors
    /// Returns `IdeviceError` if query fails
    pub async fn query_personalization_identifiers(
        &mut self,
        image_type: Option<&str>,
    ) -> Result<plist::Dictionary, IdeviceError> {
        let req = crate::plist!({
            "Command": "QueryPersonalizationIdentifiers",
            "PersonalizedImageType":? image_type,
        });
        self.idevice.send_plist(req).await?;

        let res = self.idevice.read_plist().await?;
        match res.get("PersonalizationIdentifiers") {
            Some(plist::Value::Dictionary(identifiers)) => Ok(identifiers.clone()),
            _ => Err(IdeviceError::UnexpectedResponse),
        }
    }

    /// Rolls the personalization nonce on the device
    ///
    /// # Errors
    /// Returns `IdeviceError` if operation fails
    pub async fn roll_personalization_nonce(&mut self) -> Result<(), IdeviceError> {
        let req = crate::plist!({
            "Command": "RollPersonalizationNonce"
        });
        self.idevice.send_plist(req).await?;

        Ok(())
    }

    /// Rolls the cryptex nonce on the device
    ///
    /// # Errors
    /// Returns `IdeviceError` if operation fails
    pub async fn roll_cryptex_nonce(&mut self) -> Result<(), IdeviceError> {
        let req = crate::plist!({
            "Command": "RollCryptexNonce"
        });
        self.idevice.send_plist(req).await?;

        Ok(())
    }

    /// Mounts a developer disk image, unless `LookupImage` already reports
    /// one present.
    ///
    /// # Arguments
    /// * `image` - The developer disk image data
    /// * `signature` - Signature for the image
    ///
    /// # Errors
    /// Returns `IdeviceError` if mounting fails
    pub async fn mount_developer(
        &mut self,
        image: &[u8],
        signature: Vec<u8>,
    ) -> Result<(), IdeviceError> {
        if matches!(self.lookup_image("Developer").await, Ok(existing) if !existing.is_empty()) {
            return Ok(());
        }

        self.upload_image("Developer", image, signature.clone())
            .await?;
        self.mount_image("Developer", signature, None, None).await?;

        Ok(())
    }
}

/// Mounts the developer disk image through whatever `provider` has
/// configured via [`crate::provider::IdeviceProvider::developer_disk_image`],
/// or propagates `InvalidService` unchanged if it has none. Used by
/// lockdown service-start call sites to satisfy `StartService`'s
/// `InvalidService` mount-and-retry.
pub async fn mount_via_provider(
    provider: &dyn crate::provider::IdeviceProvider,
) -> Result<(), IdeviceError> {
    let Some((image, signature)) = provider.developer_disk_image().await? else {
        return Err(IdeviceError::InvalidService);
    };

    let mut mounter = ImageMounter::connect(provider).await?;
    mounter.mount_developer(&image, signature).await
}

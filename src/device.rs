// Jackson Coxson
//! A small convenience facade bundling a provider with state worth caching
//! across calls instead of re-querying lockdownd every time: the device's
//! major iOS version, and the installed-app lookup `xcuitest()` needs to
//! resolve a fuzzy bundle id before launching a runner.

use tokio::sync::OnceCell;

use crate::provider::IdeviceProvider;
use crate::services::installation_proxy::InstallationProxyClient;
use crate::services::lockdown::LockdownClient;
use crate::services::xcuitest::{self, XCTestResult, XcuiTestOptions};
use crate::{IdeviceError, IdeviceService};

#[cfg(feature = "pair")]
use crate::pairing_file::PairingFile;

/// Wraps a provider plus state derived from it that's worth caching across
/// several calls (the device's major iOS version, in particular, since
/// several xcuitest selectors are gated on it).
pub struct DeviceHandle {
    provider: Box<dyn IdeviceProvider>,
    ios_major_version: OnceCell<u32>,
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

impl DeviceHandle {
    pub fn new(provider: Box<dyn IdeviceProvider>) -> Self {
        Self {
            provider,
            ios_major_version: OnceCell::new(),
        }
    }

    pub fn provider(&self) -> &dyn IdeviceProvider {
        self.provider.as_ref()
    }

    /// The device's major `ProductVersion` component, queried once over
    /// lockdownd and cached for the life of this handle.
    pub async fn ios_major_version(&self) -> Result<u32, IdeviceError> {
        self.ios_major_version
            .get_or_try_init(|| async {
                let mut lockdown = LockdownClient::connect(self.provider.as_ref()).await?;
                let version = lockdown.get_value(Some("ProductVersion"), None).await?;
                version
                    .as_string()
                    .and_then(|s| s.split('.').next())
                    .and_then(|s| s.parse::<u32>().ok())
                    .ok_or(IdeviceError::UnexpectedResponse)
            })
            .await
            .map(|v| *v)
    }

    /// Resolves `pattern` against the installed-app list if it looks like a
    /// glob (contains `*` or `?`); an exact id is returned unchanged without
    /// any installation_proxy round trip.
    pub async fn resolve_bundle_id(&self, pattern: &str) -> Result<Option<String>, IdeviceError> {
        if !pattern.contains('*') && !pattern.contains('?') {
            return Ok(Some(pattern.to_string()));
        }

        let mut installation = InstallationProxyClient::connect(self.provider.as_ref()).await?;
        let apps = installation.get_apps(None, None).await?;
        Ok(apps.keys().find(|id| fnmatch(pattern, id)).cloned())
    }

    /// Connects to lockdownd and starts a session, silently re-pairing and
    /// retrying once if the device reports `InvalidHostID` (a stale pair
    /// record on the device, e.g. after a factory reset or pair-record
    /// wipe). Returns the now-session-established client plus its session id.
    #[cfg(feature = "pair")]
    pub async fn start_session(&self) -> Result<(LockdownClient, String), IdeviceError> {
        let pairing_file = self.provider.get_pairing_file().await?;
        let mut lockdown = LockdownClient::connect(self.provider.as_ref()).await?;

        match lockdown.start_session(&pairing_file).await {
            Ok(session_id) => Ok((lockdown, session_id)),
            Err(IdeviceError::InvalidHostID) => {
                let new_record: PairingFile = lockdown
                    .pair(pairing_file.host_id.clone(), pairing_file.system_buid.clone())
                    .await?;
                self.provider.save_pairing_file(&new_record).await?;

                let mut lockdown = LockdownClient::connect(self.provider.as_ref()).await?;
                let session_id = lockdown.start_session(&new_record).await?;
                Ok((lockdown, session_id))
            }
            Err(e) => Err(e),
        }
    }

    /// Resolves `bundle_id` (see [`Self::resolve_bundle_id`]) and drives a
    /// full `XCUITest` run against it.
    pub async fn xcuitest(
        &self,
        bundle_id: &str,
        options: XcuiTestOptions,
    ) -> Result<Vec<XCTestResult>, IdeviceError> {
        let resolved = self
            .resolve_bundle_id(bundle_id)
            .await?
            .ok_or(IdeviceError::NotFound)?;
        xcuitest::run(self.provider.as_ref(), &resolved, options).await
    }
}

/// Shell-style glob match supporting `*` (any run of characters) and `?`
/// (exactly one character); no character classes, matching the subset of
/// `fnmatch` actually used for bundle-id prefix/glob matching.
fn fnmatch(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    fnmatch_inner(&pattern, &text)
}

fn fnmatch_inner(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') => {
            fnmatch_inner(&pattern[1..], text)
                || (!text.is_empty() && fnmatch_inner(pattern, &text[1..]))
        }
        Some('?') => !text.is_empty() && fnmatch_inner(&pattern[1..], &text[1..]),
        Some(c) => text.first() == Some(c) && fnmatch_inner(&pattern[1..], &text[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_pattern_matches_exact_text_only() {
        assert!(fnmatch("com.example.app", "com.example.app"));
        assert!(!fnmatch("com.example.app", "com.example.app2"));
    }

    #[test]
    fn star_matches_any_suffix() {
        assert!(fnmatch("com.example.*", "com.example.app"));
        assert!(fnmatch("com.example.*", "com.example."));
        assert!(!fnmatch("com.example.*", "com.other.app"));
    }

    #[test]
    fn question_mark_matches_exactly_one_character() {
        assert!(fnmatch("com.example.app?", "com.example.app1"));
        assert!(!fnmatch("com.example.app?", "com.example.app"));
        assert!(!fnmatch("com.example.app?", "com.example.app12"));
    }
}

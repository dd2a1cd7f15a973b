// Jackson Coxson
//! Process control: launch, kill, list and locate processes through the
//! Instruments `processcontrol` DTX channel.

use std::time::Duration;

use plist::{Dictionary, Value};
use tracing::warn;

use crate::dtx::{AuxBuffer, AuxValue, Channel, DtxConnection};
use crate::IdeviceError;

const CHANNEL_IDENTIFIER: &str = "com.apple.instruments.server.services.processcontrol";
const LAUNCH_RETRY_ATTEMPTS: u32 = 3;
const LAUNCH_RETRY_BASE_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u64,
    pub bundle_id: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ProcessControlClient {
    connection: DtxConnection,
    channel: Channel,
}

impl ProcessControlClient {
    pub async fn new(connection: DtxConnection) -> Result<Self, IdeviceError> {
        let channel = connection.make_channel(CHANNEL_IDENTIFIER).await?;
        Ok(Self { connection, channel })
    }

    /// Launches an app, retrying a transient broken-pipe write failure up to
    /// three times with a 5-second-plus-jitter backoff; other errors (and a
    /// non-integer pid in the reply) propagate as `LaunchError` immediately.
    pub async fn launch_app(
        &mut self,
        bundle_id: impl Into<String>,
        env_vars: Option<Dictionary>,
        arguments: Option<Dictionary>,
        start_suspended: bool,
        kill_existing: bool,
    ) -> Result<u64, IdeviceError> {
        let bundle_id = bundle_id.into();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .try_launch_app(
                    &bundle_id,
                    env_vars.clone(),
                    arguments.clone(),
                    start_suspended,
                    kill_existing,
                )
                .await
            {
                Ok(pid) => return Ok(pid),
                Err(IdeviceError::Socket(e))
                    if e.kind() == std::io::ErrorKind::BrokenPipe
                        && attempt < LAUNCH_RETRY_ATTEMPTS =>
                {
                    let jitter = Duration::from_millis((attempt as u64 * 137) % 500);
                    warn!(
                        "broken pipe launching {bundle_id}, retrying ({attempt}/{LAUNCH_RETRY_ATTEMPTS})"
                    );
                    tokio::time::sleep(LAUNCH_RETRY_BASE_DELAY + jitter).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_launch_app(
        &mut self,
        bundle_id: &str,
        env_vars: Option<Dictionary>,
        arguments: Option<Dictionary>,
        start_suspended: bool,
        kill_existing: bool,
    ) -> Result<u64, IdeviceError> {
        let options = crate::plist!(dict {
            "StartSuspendedKey": start_suspended,
            "KillExisting": kill_existing
        });

        let aux = AuxBuffer::new()
            .push(AuxValue::archived("/private/".to_string())?)
            .push(AuxValue::archived(bundle_id.to_string())?)
            .push(AuxValue::archived(Value::Dictionary(
                env_vars.unwrap_or_default(),
            ))?)
            .push(AuxValue::archived(Value::Dictionary(
                arguments.unwrap_or_default(),
            ))?)
            .push(AuxValue::archived(options)?);

        let reply = self
            .connection
            .call(
                self.channel.id,
                "launchSuspendedProcessWithDevicePath:bundleIdentifier:environment:arguments:options:",
                aux,
                true,
            )
            .await?;

        let pid = reply
            .and_then(|m| m.aux.values.first().cloned())
            .and_then(|v| match v {
                AuxValue::I32(n) => Some(n as i64),
                AuxValue::I64(n) => Some(n),
                _ => None,
            });

        match pid {
            Some(pid) if pid > 0 => Ok(pid as u64),
            _ => Err(IdeviceError::LaunchError(format!(
                "device did not return a pid for {bundle_id}"
            ))),
        }
    }

    pub async fn kill_app(&mut self, pid: u64) -> Result<(), IdeviceError> {
        let aux = AuxBuffer::new().push(AuxValue::I64(pid as i64));
        self.connection
            .call(self.channel.id, "killPid:", aux, false)
            .await?;
        Ok(())
    }

    pub async fn disable_memory_limit(&mut self, pid: u64) -> Result<(), IdeviceError> {
        let aux = AuxBuffer::new().push(AuxValue::I64(pid as i64));
        let reply = self
            .connection
            .call(
                self.channel.id,
                "requestDisableMemoryLimitsForPid:",
                aux,
                true,
            )
            .await?;

        let ok = match reply {
            Some(msg) if !msg.payload.is_empty() => {
                let archive = crate::keyed_archive::Archive::decode(&msg.payload)?;
                matches!(
                    archive.root_object(),
                    Some(crate::keyed_archive::Node::Bool(true))
                )
            }
            _ => false,
        };

        if ok {
            Ok(())
        } else {
            Err(IdeviceError::DisableMemoryLimitFailed)
        }
    }

    /// Lists running processes, cross-referenced against the device's
    /// installed-app list to resolve bundle identifiers and display names.
    pub async fn running_processes(
        &mut self,
        installed_apps: &std::collections::HashMap<String, Value>,
    ) -> Result<Vec<ProcessInfo>, IdeviceError> {
        let reply = self
            .connection
            .call(self.channel.id, "runningProcesses", AuxBuffer::new(), true)
            .await?;

        let Some(msg) = reply else {
            return Ok(Vec::new());
        };
        let archive = crate::keyed_archive::Archive::decode(&msg.payload)?;
        let Some(crate::keyed_archive::Node::Object(root)) = archive.root_object() else {
            return Ok(Vec::new());
        };
        let Some(crate::keyed_archive::FieldValue::RefArray(elements)) = root.field("NS.objects")
        else {
            return Ok(Vec::new());
        };

        let mut processes = Vec::new();
        for &idx in elements {
            let Some(crate::keyed_archive::Node::Object(entry)) = archive.get(idx) else {
                continue;
            };
            let Some(crate::keyed_archive::FieldValue::Int(pid)) = entry.field("pid") else {
                continue;
            };
            let name = match entry.field("name") {
                Some(crate::keyed_archive::FieldValue::String(s)) => s.clone(),
                _ => continue,
            };

            let bundle_id = installed_apps
                .iter()
                .find(|(_, info)| {
                    info.as_dictionary()
                        .and_then(|d| d.get("CFBundleExecutable"))
                        .and_then(|v| v.as_string())
                        == Some(name.as_str())
                })
                .map(|(id, _)| id.clone());

            if let Some(bundle_id) = bundle_id {
                processes.push(ProcessInfo {
                    pid: *pid as u64,
                    bundle_id,
                    name,
                });
            }
        }

        Ok(processes)
    }

    /// Returns the pid of a running process for `bundle_id`, or `0` if it
    /// isn't currently running.
    pub async fn process_identifier_for_bundle_identifier(
        &mut self,
        bundle_id: impl Into<String>,
    ) -> Result<u64, IdeviceError> {
        let aux = AuxBuffer::new().push(AuxValue::archived(bundle_id.into())?);
        let reply = self
            .connection
            .call(
                self.channel.id,
                "processIdentifierForBundleIdentifier:",
                aux,
                true,
            )
            .await?;

        let pid = reply
            .and_then(|m| m.aux.values.first().cloned())
            .and_then(|v| match v {
                AuxValue::I32(n) => Some(n as u64),
                AuxValue::I64(n) => Some(n as u64),
                _ => None,
            })
            .unwrap_or(0);

        Ok(pid)
    }

    /// Subscribes to the device's process-died notifications, invoking
    /// `on_exit` exactly once when `pid` terminates.
    pub fn observe_pid(&self, pid: u64, on_exit: impl Fn(u64) + Send + Sync + 'static) {
        self.connection.on("_XCT_applicationDidExit:", move |msg| {
            let Ok(archive) = crate::keyed_archive::Archive::decode(&msg.payload) else {
                return;
            };
            let Some(crate::keyed_archive::Node::Object(obj)) = archive.root_object() else {
                return;
            };
            if let Some(crate::keyed_archive::FieldValue::Int(died_pid)) = obj.field("pid") {
                if *died_pid as u64 == pid {
                    on_exit(pid);
                }
            }
        });
    }
}

// Jackson Coxson
//! Orchestrates an `XCUITest` / `WebDriverAgent` run by driving
//! `testmanagerd` over two independent DTX connections and launching the
//! runner app through the Instruments process-control channel.

mod configuration;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Notify;
use uuid::Uuid;

use crate::dtx::{self, AuxBuffer, AuxValue, DtxConnection};
use crate::keyed_archive::{Archive, FieldValue, Node};
use crate::provider::IdeviceProvider;
use crate::services::house_arrest::HouseArrestClient;
use crate::services::installation_proxy::InstallationProxyClient;
use crate::services::instruments::{self, ProcessControlClient};
use crate::services::lockdown::LockdownClient;
use crate::{IdeviceError, IdeviceService};

const PROTOCOL_VERSION: i32 = 29;
const DAEMON_CHANNEL: &str =
    "dtxproxy:XCTestManager_IDEInterface:XCTestManager_DaemonConnectionInterface";
const TESTMANAGERD_SERVICE_NAMES: &[&str] = &[
    "com.apple.testmanagerd.lockdown.secure",
    "com.apple.testmanagerd.lockdown",
];

/// The final tally of one `_XCT_testSuite:didFinishAt:...` notification.
#[derive(Debug, Clone)]
pub struct XCTestResult {
    pub test_suite: String,
    pub finished_at: String,
    pub run_count: i64,
    pub failure_count: i64,
    pub unexpected_count: i64,
    pub test_duration: f64,
    pub total_duration: f64,
}

/// Extra knobs for [`run`]; all default to empty/absent.
#[derive(Debug, Clone, Default)]
pub struct XcuiTestOptions {
    pub target_application_bundle_id: Option<String>,
    pub test_runner_env: plist::Dictionary,
    pub test_runner_args: Vec<String>,
    pub target_application_env: plist::Dictionary,
    pub target_application_args: Vec<String>,
    pub tests_to_run: Vec<String>,
}

async fn connect_testmanagerd(provider: &dyn IdeviceProvider) -> Result<DtxConnection, IdeviceError> {
    let mut last_err = None;
    for name in TESTMANAGERD_SERVICE_NAMES {
        match dtx::connect_via_lockdown(provider, *name).await {
            Ok(conn) => return Ok(conn),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or(IdeviceError::ServiceNotFound))
}

/// Decodes an aux-buffer entry to a string, whether it arrived as an
/// archived `NSString` or as the root of an archived container.
fn aux_as_string(value: &AuxValue) -> Option<String> {
    match value.as_object().ok()??.root_object()? {
        Node::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn aux_as_f64(value: &AuxValue) -> Option<f64> {
    match value {
        AuxValue::I32(v) => Some(*v as f64),
        AuxValue::I64(v) => Some(*v as f64),
        AuxValue::Archived(_) => match value.as_object().ok()??.root_object()? {
            Node::Real(r) => Some(*r),
            Node::Int(i) => Some(*i as f64),
            _ => None,
        },
    }
}

fn aux_as_i64(value: &AuxValue) -> Option<i64> {
    match value {
        AuxValue::I32(v) => Some(*v as i64),
        AuxValue::I64(v) => Some(*v),
        AuxValue::Archived(_) => match value.as_object().ok()??.root_object()? {
            Node::Int(i) => Some(*i),
            Node::Real(r) => Some(*r as i64),
            _ => None,
        },
    }
}

/// Joins every string found in a notification's aux values, including the
/// contents of an archived `NSArray` of strings (used by
/// `_XCT_logDebugMessage:`, whose argument is an array of log lines).
fn aux_all_strings_joined(values: &[AuxValue]) -> String {
    let mut out = String::new();
    for value in values {
        let AuxValue::Archived(_) = value else { continue };
        let Ok(Some(archive)) = value.as_object() else { continue };
        collect_strings(&archive, archive.root_object(), &mut out);
    }
    out
}

fn collect_strings(archive: &Archive, node: Option<&Node>, out: &mut String) {
    match node {
        Some(Node::String(s)) => {
            out.push_str(s);
            out.push('\n');
        }
        Some(Node::Object(obj)) => {
            if let Some(FieldValue::RefArray(refs)) = obj.field("NS.objects") {
                for &r in refs {
                    collect_strings(archive, archive.get(r), out);
                }
            }
        }
        _ => {}
    }
}

fn start_executing_test_plan(x2: DtxConnection, channel_id: i32, started: Arc<AtomicBool>) {
    if started.swap(true, Ordering::SeqCst) {
        return;
    }
    tokio::spawn(async move {
        let aux = AuxBuffer::new().push(AuxValue::I32(PROTOCOL_VERSION));
        let _ = x2
            .call(
                channel_id,
                "_IDE_startExecutingTestPlanWithProtocolVersion:",
                aux,
                false,
            )
            .await;
    });
}

/// Which selector authorizes the test session's target pid; gated on the
/// device's major iOS version the way the runner app itself gates it.
async fn authorize_test_session(
    x1: &DtxConnection,
    channel_id: i32,
    ios_major: u8,
    pid: u64,
) -> Result<(), IdeviceError> {
    if ios_major >= 14 {
        let aux = AuxBuffer::new()
            .push(AuxValue::I64(pid as i64))
            .push(AuxValue::I32(PROTOCOL_VERSION));
        x1.call(
            channel_id,
            "_IDE_initiateControlSessionForTestProcessID:protocolVersion:",
            aux,
            true,
        )
        .await?;
    } else if ios_major >= 12 {
        let aux = AuxBuffer::new().push(AuxValue::I64(pid as i64));
        x1.call(channel_id, "_IDE_initiateControlSessionForTestProcessID:", aux, true)
            .await?;
    } else {
        let aux = AuxBuffer::new().push(AuxValue::I64(pid as i64));
        x1.call(channel_id, "_IDE_authorizeTestSessionWithProcessID:", aux, true)
            .await?;
    }
    Ok(())
}

async fn device_major_version(provider: &dyn IdeviceProvider) -> Result<u8, IdeviceError> {
    let mut lockdown = LockdownClient::connect(provider).await?;
    let version = lockdown.get_value(Some("ProductVersion"), None).await?;
    version
        .as_string()
        .and_then(|s| s.split('.').next())
        .and_then(|s| s.parse::<u8>().ok())
        .ok_or(IdeviceError::UnexpectedResponse)
}

/// Launches `bundle_id`'s `-Runner` app and drives it through a complete
/// `XCUITest` session, blocking until either `testmanagerd` connection's
/// `FINISHED` event fires. Returns the recorded suite results, or
/// [`IdeviceError::TestFailure`] if any suite reported a failure.
pub async fn run(
    provider: &dyn IdeviceProvider,
    bundle_id: &str,
    options: XcuiTestOptions,
) -> Result<Vec<XCTestResult>, IdeviceError> {
    let session_id = Uuid::new_v4();
    let ios_major = device_major_version(provider).await.unwrap_or(17);

    let mut installation = InstallationProxyClient::connect(provider).await?;
    let apps = installation
        .get_apps(None, Some(vec![bundle_id.to_string()]))
        .await?;
    let app_info = apps
        .get(bundle_id)
        .and_then(|v| v.as_dictionary())
        .ok_or(IdeviceError::NotFound)?;
    let app_path = app_info
        .get("Path")
        .and_then(|v| v.as_string())
        .ok_or(IdeviceError::NotFound)?
        .to_string();
    let app_container = app_info
        .get("Container")
        .and_then(|v| v.as_string())
        .ok_or(IdeviceError::NotFound)?
        .to_string();
    let exec_name = app_info
        .get("CFBundleExecutable")
        .and_then(|v| v.as_string())
        .ok_or(IdeviceError::NotFound)?;
    let target_name = exec_name
        .strip_suffix("-Runner")
        .ok_or_else(|| IdeviceError::ProtocolError(format!("{exec_name} is not a -Runner bundle")))?
        .to_string();

    let quit = Arc::new(Notify::new());

    let x1 = connect_testmanagerd(provider).await?;
    let x1_channel = x1.make_channel(DAEMON_CHANNEL).await?;
    x1.call(
        x1_channel.id,
        "_IDE_initiateControlSessionWithProtocolVersion:",
        AuxBuffer::new().push(AuxValue::I32(PROTOCOL_VERSION)),
        true,
    )
    .await?;
    {
        let quit = quit.clone();
        x1.on(dtx::FINISHED, move |_| quit.notify_one());
    }

    let x2 = connect_testmanagerd(provider).await?;
    let x2_channel = x2.make_channel(DAEMON_CHANNEL).await?;
    {
        let quit = quit.clone();
        x2.on(dtx::FINISHED, move |_| quit.notify_one());
    }

    let started = Arc::new(AtomicBool::new(false));
    {
        let x2 = x2.clone();
        let started = started.clone();
        let channel_id = x2_channel.id;
        x2.on(
            "_XCT_testBundleReadyWithProtocolVersion:minimumVersion:",
            move |_| start_executing_test_plan(x2.clone(), channel_id, started.clone()),
        );
    }
    {
        let x2 = x2.clone();
        let started = started.clone();
        let channel_id = x2_channel.id;
        x2.on("_XCT_logDebugMessage:", move |msg| {
            let text = aux_all_strings_joined(&msg.aux.values);
            if text.contains("Received test runner ready reply") {
                start_executing_test_plan(x2.clone(), channel_id, started.clone());
            }
        });
    }

    let xctest_configuration = configuration::build(
        session_id,
        &app_path,
        &target_name,
        options.target_application_bundle_id.as_deref(),
        &options.target_application_args,
        &options.target_application_env,
        &options.tests_to_run,
    )?;

    {
        let x2 = x2.clone();
        let config = xctest_configuration.clone();
        x2.on("_XCT_testRunnerReadyWithCapabilities:", move |msg| {
            let x2 = x2.clone();
            let config = config.clone();
            tokio::spawn(async move {
                let _ = x2
                    .reply_with_raw_archive(msg.channel_id, msg.message_id, config)
                    .await;
            });
        });
    }

    let results: Arc<StdMutex<Vec<XCTestResult>>> = Arc::new(StdMutex::new(Vec::new()));
    {
        let results = results.clone();
        x2.on(
            "_XCT_testSuite:didFinishAt:runCount:withFailures:unexpected:testDuration:totalDuration:",
            move |msg| {
                let values = &msg.aux.values;
                if values.len() < 7 {
                    return;
                }
                let result = XCTestResult {
                    test_suite: aux_as_string(&values[0]).unwrap_or_default(),
                    finished_at: aux_as_string(&values[1]).unwrap_or_default(),
                    run_count: aux_as_i64(&values[2]).unwrap_or_default(),
                    failure_count: aux_as_i64(&values[3]).unwrap_or_default(),
                    unexpected_count: aux_as_i64(&values[4]).unwrap_or_default(),
                    test_duration: aux_as_f64(&values[5]).unwrap_or_default(),
                    total_duration: aux_as_f64(&values[6]).unwrap_or_default(),
                };
                results.lock().unwrap().push(result);
            },
        );
    }

    let client_id = format!("{session_id}-6722-000247F15966B083");
    let session_aux = AuxBuffer::new()
        .push(AuxValue::archived(session_id.to_string())?)
        .push(AuxValue::archived(client_id)?)
        .push(AuxValue::archived(
            "/Applications/Xcode.app/Contents/Developer/usr/bin/xcodebuild".to_string(),
        )?)
        .push(AuxValue::I32(PROTOCOL_VERSION));
    x2.call(
        x2_channel.id,
        "_IDE_initiateSessionWithIdentifier:forClient:atPath:protocolVersion:",
        session_aux,
        true,
    )
    .await?;

    let house_arrest = HouseArrestClient::connect(provider).await?;
    let mut runner_afc = house_arrest.vend_container(bundle_id).await?;
    configuration::write_to_container(
        &mut runner_afc,
        &target_name,
        session_id,
        &xctest_configuration,
    )
    .await?;
    drop(runner_afc);

    let mut process_control = ProcessControlClient::new(instruments::connect(provider).await?).await?;

    let mut launch_env = options.test_runner_env.clone();
    launch_env.insert(
        "DYLD_FRAMEWORK_PATH".to_string(),
        plist::Value::String(format!("{app_path}/Frameworks:")),
    );
    launch_env.insert(
        "DYLD_LIBRARY_PATH".to_string(),
        plist::Value::String(format!("{app_path}/Frameworks")),
    );
    launch_env.insert(
        "XCTestBundlePath".to_string(),
        plist::Value::String(format!("{app_path}/PlugIns/{target_name}.xctest")),
    );
    launch_env.insert(
        "XCTestConfigurationFilePath".to_string(),
        plist::Value::String(format!(
            "{app_container}/tmp/{target_name}-{}.xctestconfiguration",
            session_id.to_string().to_uppercase()
        )),
    );
    if ios_major >= 11 {
        launch_env.insert(
            "DYLD_INSERT_LIBRARIES".to_string(),
            plist::Value::String("/Developer/usr/lib/libMainThreadChecker.dylib".to_string()),
        );
        launch_env.insert(
            "OS_ACTIVITY_DT_MODE".to_string(),
            plist::Value::String("YES".to_string()),
        );
    }

    let mut arguments = plist::Dictionary::new();
    let mut launch_args = vec![
        "-NSTreatUnknownArgumentsAsOpen".to_string(),
        "NO".to_string(),
        "-ApplePersistenceIgnoreState".to_string(),
        "YES".to_string(),
    ];
    launch_args.extend(options.test_runner_args.iter().cloned());
    arguments.insert(
        "args".to_string(),
        plist::Value::Array(launch_args.into_iter().map(plist::Value::String).collect()),
    );

    let pid = process_control
        .launch_app(
            bundle_id,
            Some(launch_env),
            Some(arguments),
            ios_major >= 12,
            true,
        )
        .await?;

    {
        let quit = quit.clone();
        process_control.observe_pid(pid, move |_| quit.notify_one());
    }

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    authorize_test_session(&x1, x1_channel.id, ios_major, pid).await?;

    quit.notified().await;
    x1.close();
    x2.close();

    let results = results.lock().unwrap().clone();
    if results.iter().any(|r| r.failure_count > 0) {
        return Err(IdeviceError::TestFailure(results));
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_archived_string() {
        let value = AuxValue::archived("hello".to_string()).unwrap();
        assert_eq!(aux_as_string(&value).as_deref(), Some("hello"));
    }

    #[test]
    fn decodes_native_and_archived_integers() {
        assert_eq!(aux_as_i64(&AuxValue::I32(7)), Some(7));
        assert_eq!(aux_as_i64(&AuxValue::I64(-9)), Some(-9));
        let archived = AuxValue::archived(3i64).unwrap();
        assert_eq!(aux_as_i64(&archived), Some(3));
    }

    #[test]
    fn decodes_native_and_archived_reals() {
        assert_eq!(aux_as_f64(&AuxValue::I32(2)), Some(2.0));
        let archived = AuxValue::archived(1.5f64).unwrap();
        assert_eq!(aux_as_f64(&archived), Some(1.5));
    }

    #[test]
    fn joins_strings_from_an_archived_array() {
        let mut builder = crate::keyed_archive::ArchiveBuilder::new();
        let array_class = builder.push_class("NSArray", &["NSArray", "NSObject"]);
        let a = builder.push_string("first line");
        let b = builder.push_string("second line");
        let array = builder.push_array_object(array_class, vec![a, b]);
        let bytes = builder.finish(array).unwrap();

        let value = AuxValue::Archived(bytes);
        let joined = aux_all_strings_joined(&[value]);
        assert_eq!(joined, "first line\nsecond line\n");
    }

    #[test]
    fn joined_strings_empty_for_non_archived_values() {
        let joined = aux_all_strings_joined(&[AuxValue::I32(1)]);
        assert_eq!(joined, "");
    }
}

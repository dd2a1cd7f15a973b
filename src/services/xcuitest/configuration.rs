// Jackson Coxson
//! Builds the `XCTestConfiguration` keyed archive handed to the test runner
//! process, and writes it into the runner app's container.

use uuid::Uuid;

use crate::keyed_archive::{ArchiveBuilder, FieldValue};
use crate::services::afc::{opcode::AfcFopenMode, AfcClient};
use crate::IdeviceError;

/// A plain `file://` `NSURL` is enough here; `NS.base` stays nil.
fn push_nsurl(builder: &mut ArchiveBuilder, absolute_path: &str) -> usize {
    let class = builder.push_class("NSURL", &["NSURL", "NSObject"]);
    let relative = builder.push_string(format!("file://{absolute_path}"));
    builder.push_object(
        class,
        vec![
            ("NS.relative", FieldValue::Ref(relative)),
            ("NS.base", FieldValue::Ref(0)),
        ],
    )
}

fn push_nsuuid(builder: &mut ArchiveBuilder, uuid: Uuid) -> usize {
    let class = builder.push_class("NSUUID", &["NSUUID", "NSObject"]);
    let bytes = builder.push_data(uuid.as_bytes().to_vec());
    builder.push_object(class, vec![("NS.uuidbytes", FieldValue::Ref(bytes))])
}

/// Builds the `XCTestConfiguration` archive for a `-Runner` bundle whose
/// `.xctest` plugin lives at `<app_path>/PlugIns/<target_name>.xctest`.
#[allow(clippy::too_many_arguments)]
pub fn build(
    session_id: Uuid,
    app_path: &str,
    target_name: &str,
    target_application_bundle_id: Option<&str>,
    target_application_args: &[String],
    target_application_env: &plist::Dictionary,
    tests_to_run: &[String],
) -> Result<Vec<u8>, IdeviceError> {
    let mut b = ArchiveBuilder::new();
    let class = b.push_class("XCTestConfiguration", &["XCTestConfiguration", "NSObject"]);

    let test_bundle_url = push_nsurl(
        &mut b,
        &format!("{app_path}/PlugIns/{target_name}.xctest"),
    );
    let session_identifier = push_nsuuid(&mut b, session_id);

    let target_bundle_id = match target_application_bundle_id {
        Some(s) => FieldValue::Ref(b.push_string(s.to_string())),
        None => FieldValue::Ref(0),
    };

    let args_class = b.push_class("NSArray", &["NSArray", "NSObject"]);
    let arg_refs = target_application_args
        .iter()
        .map(|a| b.push_string(a.clone()))
        .collect();
    let args = b.push_array_object(args_class, arg_refs);

    let dict_class = b.push_class("NSDictionary", &["NSDictionary", "NSObject"]);
    let mut keys = Vec::with_capacity(target_application_env.len());
    let mut values = Vec::with_capacity(target_application_env.len());
    for (k, v) in target_application_env {
        keys.push(b.push_string(k.clone()));
        values.push(b.push_plist_value(v));
    }
    let env = b.push_dict_object(dict_class, keys, values);

    let set_class = b.push_class("NSSet", &["NSSet", "NSObject"]);
    let test_refs = tests_to_run.iter().map(|t| b.push_string(t.clone())).collect();
    let tests = b.push_object(set_class, vec![("NS.objects", FieldValue::RefArray(test_refs))]);

    let automation_framework_path = b.push_string(
        "/Developer/Library/PrivateFrameworks/XCTAutomationSupport.framework",
    );

    let root = b.push_object(
        class,
        vec![
            ("testBundleURL", FieldValue::Ref(test_bundle_url)),
            ("sessionIdentifier", FieldValue::Ref(session_identifier)),
            ("targetApplicationBundleID", target_bundle_id),
            ("targetApplicationArguments", FieldValue::Ref(args)),
            ("targetApplicationEnvironment", FieldValue::Ref(env)),
            ("testsToRun", FieldValue::Ref(tests)),
            ("testsMustRunOnMainThread", FieldValue::Bool(true)),
            ("reportResultsToIDE", FieldValue::Bool(true)),
            ("reportActivities", FieldValue::Bool(true)),
            (
                "automationFrameworkPath",
                FieldValue::Ref(automation_framework_path),
            ),
        ],
    );

    b.finish(root)
}

/// Writes the `.xctestconfiguration` file into the runner's container,
/// first deleting any stale ones left over from a previous run.
///
/// Returns the path written, relative to the container's `/tmp`.
pub async fn write_to_container(
    afc: &mut AfcClient,
    target_name: &str,
    session_id: Uuid,
    bytes: &[u8],
) -> Result<String, IdeviceError> {
    for entry in afc.list_dir("/tmp").await.unwrap_or_default() {
        if entry.ends_with(".xctestconfiguration") {
            let _ = afc.remove(format!("/tmp/{entry}")).await;
        }
    }

    let remote_path = format!(
        "/tmp/{target_name}-{}.xctestconfiguration",
        session_id.to_string().to_uppercase()
    );
    let mut fd = afc.open(&remote_path, AfcFopenMode::WrOnly).await?;
    fd.write(bytes).await?;
    fd.close().await?;

    Ok(remote_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyed_archive::{Archive, Node};

    #[test]
    fn builds_a_decodable_configuration() {
        let session_id = Uuid::parse_str("11111111-2222-3333-4444-555555555555").unwrap();
        let mut env = plist::Dictionary::new();
        env.insert("FOO".to_string(), plist::Value::String("bar".to_string()));

        let bytes = build(
            session_id,
            "/private/var/containers/Bundle/Application/ABC/App.app",
            "AppUITests",
            Some("com.example.app"),
            &["-x".to_string()],
            &env,
            &["AppUITests/testExample".to_string()],
        )
        .unwrap();

        let archive = Archive::decode(&bytes).unwrap();
        let Some(Node::Object(obj)) = archive.root_object() else {
            panic!("expected root object");
        };
        assert_eq!(obj.field("testsMustRunOnMainThread"), Some(&FieldValue::Bool(true)));
        assert_eq!(obj.field("reportResultsToIDE"), Some(&FieldValue::Bool(true)));

        let Some(FieldValue::Ref(url_ref)) = obj.field("testBundleURL") else {
            panic!("expected testBundleURL ref");
        };
        let Some(Node::Object(url_obj)) = archive.get(*url_ref) else {
            panic!("expected NSURL object");
        };
        let Some(FieldValue::Ref(rel_ref)) = url_obj.field("NS.relative") else {
            panic!("expected NS.relative ref");
        };
        assert_eq!(
            archive.get(*rel_ref),
            Some(&Node::String(
                "file:///private/var/containers/Bundle/Application/ABC/App.app/PlugIns/AppUITests.xctest"
                    .to_string()
            ))
        );
    }

    #[test]
    fn omits_target_bundle_id_when_absent() {
        let session_id = Uuid::parse_str("11111111-2222-3333-4444-555555555555").unwrap();
        let env = plist::Dictionary::new();
        let bytes = build(session_id, "/app", "AppUITests", None, &[], &env, &[]).unwrap();

        let archive = Archive::decode(&bytes).unwrap();
        let Some(Node::Object(obj)) = archive.root_object() else {
            panic!("expected root object");
        };
        assert_eq!(obj.field("targetApplicationBundleID"), Some(&FieldValue::Ref(0)));
    }
}

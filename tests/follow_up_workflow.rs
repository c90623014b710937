use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_edunityd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn edunityd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn error_code(resp: &serde_json::Value) -> &str {
    resp.get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn record_status(resp: &serde_json::Value) -> &str {
    resp.get("result")
        .and_then(|v| v.get("record"))
        .and_then(|v| v.get("status"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn setup_with_lead() -> (Child, ChildStdin, BufReader<ChildStdout>, PathBuf, String) {
    let workspace = temp_dir("edunity-follow-up");
    let (child, mut stdin, mut reader) = spawn_sidecar();
    let resp = request(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(true));
    let created = request(
        &mut stdin,
        &mut reader,
        "seed",
        "teacherLeads.create",
        json!({ "fullName": "Docs Teacher", "email": "docs@x.com", "phone": "0801" }),
    );
    let edunity_id = created
        .get("result")
        .and_then(|v| v.get("edunityId"))
        .and_then(|v| v.as_str())
        .expect("edunityId")
        .to_string();
    (child, stdin, reader, workspace, edunity_id)
}

fn complete_documents() -> serde_json::Value {
    json!({
        "cvPdf": { "downloadUrl": "https://files/cv.pdf" },
        "passportPhoto": { "downloadUrl": "https://files/photo.jpg" },
        "validId": { "downloadUrl": "https://files/id.pdf" },
        "highestQualificationCertificate": { "downloadUrl": "https://files/cert.pdf" }
    })
}

fn all_consents() -> serde_json::Value {
    json!({
        "backgroundCheckConsent": true,
        "safeguardingPolicyAcknowledgement": true,
        "dataProcessingConsent": true
    })
}

#[test]
fn record_moves_from_partial_to_complete_to_pushed() {
    let (mut child, mut stdin, mut reader, workspace, edunity_id) = setup_with_lead();

    // Before any save there is no record, but the lead is echoed back.
    let fresh = request(
        &mut stdin,
        &mut reader,
        "1",
        "followUp.get",
        json!({ "edunityId": edunity_id }),
    );
    assert!(fresh
        .get("result")
        .and_then(|v| v.get("record"))
        .map(|v| v.is_null())
        .unwrap_or(false));
    assert_eq!(
        fresh
            .get("result")
            .and_then(|v| v.get("lead"))
            .and_then(|v| v.get("fullName"))
            .and_then(|v| v.as_str()),
        Some("Docs Teacher")
    );

    // A single upload makes the record partial.
    let partial = request(
        &mut stdin,
        &mut reader,
        "2",
        "followUp.save",
        json!({
            "edunityId": edunity_id,
            "documents": { "cvPdf": { "downloadUrl": "https://files/cv.pdf" } }
        }),
    );
    assert_eq!(record_status(&partial), "partial");

    // Pushing an incomplete record is refused with the missing keys.
    let early_push = request(
        &mut stdin,
        &mut reader,
        "3",
        "followUp.pushToSales",
        json!({ "edunityId": edunity_id, "byUserId": "admin-1" }),
    );
    assert_eq!(error_code(&early_push), "conflict");
    let missing = early_push
        .get("error")
        .and_then(|e| e.get("details"))
        .and_then(|d| d.get("missingRequiredKeys"))
        .and_then(|v| v.as_array())
        .expect("missing keys");
    assert_eq!(missing.len(), 3);

    // Every document plus every consent completes it.
    let complete = request(
        &mut stdin,
        &mut reader,
        "4",
        "followUp.save",
        json!({
            "edunityId": edunity_id,
            "documents": complete_documents(),
            "consents": all_consents()
        }),
    );
    assert_eq!(record_status(&complete), "complete");

    let pushed = request(
        &mut stdin,
        &mut reader,
        "5",
        "followUp.pushToSales",
        json!({
            "edunityId": edunity_id,
            "byUserId": "admin-1",
            "byName": "The Admin",
            "salesNote": "ready for outreach"
        }),
    );
    assert_eq!(record_status(&pushed), "pushed_to_sales");
    assert_eq!(
        pushed
            .get("result")
            .and_then(|v| v.get("record"))
            .and_then(|v| v.get("salesNote"))
            .and_then(|v| v.as_str()),
        Some("ready for outreach")
    );

    // A second push is a conflict, and later saves keep the pushed status.
    let again = request(
        &mut stdin,
        &mut reader,
        "6",
        "followUp.pushToSales",
        json!({ "edunityId": edunity_id }),
    );
    assert_eq!(error_code(&again), "conflict");

    let resave = request(
        &mut stdin,
        &mut reader,
        "7",
        "followUp.save",
        json!({
            "edunityId": edunity_id,
            "documents": { "cvPdf": { "downloadUrl": "https://files/cv-v2.pdf" } }
        }),
    );
    assert_eq!(record_status(&resave), "pushed_to_sales");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn nysc_applicable_adds_a_fifth_required_document() {
    let (mut child, mut stdin, mut reader, workspace, edunity_id) = setup_with_lead();

    // Complete for the base set, but NYSC applies.
    let saved = request(
        &mut stdin,
        &mut reader,
        "1",
        "followUp.save",
        json!({
            "edunityId": edunity_id,
            "nyscApplicable": true,
            "documents": complete_documents(),
            "consents": all_consents()
        }),
    );
    assert_eq!(record_status(&saved), "partial");
    let progress = saved
        .get("result")
        .and_then(|v| v.get("progress"))
        .expect("progress");
    assert_eq!(
        progress.get("requiredTotal").and_then(|v| v.as_i64()),
        Some(5)
    );
    assert_eq!(
        progress
            .get("missingRequiredKeys")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(1)
    );

    let mut documents = complete_documents();
    documents["nyscCertificate"] = json!({ "downloadUrl": "https://files/nysc.pdf" });
    let done = request(
        &mut stdin,
        &mut reader,
        "2",
        "followUp.save",
        json!({ "edunityId": edunity_id, "documents": documents }),
    );
    assert_eq!(record_status(&done), "complete");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn push_without_a_record_and_get_of_unknown_lead_fail() {
    let (mut child, mut stdin, mut reader, workspace, edunity_id) = setup_with_lead();

    let push = request(
        &mut stdin,
        &mut reader,
        "1",
        "followUp.pushToSales",
        json!({ "edunityId": edunity_id }),
    );
    assert_eq!(error_code(&push), "not_found");

    let get = request(
        &mut stdin,
        &mut reader,
        "2",
        "followUp.get",
        json!({ "edunityId": "EDU-ON-T-09999" }),
    );
    assert_eq!(error_code(&get), "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn document_path_is_keyed_by_lead_and_document() {
    let (mut child, mut stdin, mut reader, workspace, edunity_id) = setup_with_lead();

    let resp = request(
        &mut stdin,
        &mut reader,
        "1",
        "followUp.documentPath",
        json!({
            "edunityId": edunity_id,
            "key": "cvPdf",
            "fileName": "My CV (final).pdf"
        }),
    );
    let path = resp
        .get("result")
        .and_then(|v| v.get("storagePath"))
        .and_then(|v| v.as_str())
        .expect("storagePath");
    assert!(path.starts_with("teacher-follow-up/edu-on-t-00101/cvPdf/"));
    assert!(path.ends_with("-my-cv-final-.pdf"));

    let no_key = request(
        &mut stdin,
        &mut reader,
        "2",
        "followUp.documentPath",
        json!({ "edunityId": edunity_id, "fileName": "cv.pdf" }),
    );
    assert_eq!(error_code(&no_key), "bad_params");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

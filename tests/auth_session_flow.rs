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
    let exe = env!("CARGO_BIN_EXE_attendd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn attendd");
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
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err_code(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string()
}

#[test]
fn sign_in_resolves_role_and_refresh_keeps_profile() {
    let workspace = temp_dir("attendd-auth-flow");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    assert_eq!(
        request_err_code(&mut stdin, &mut reader, "2", "me.profile", json!({})),
        "not_authenticated"
    );
    assert_eq!(
        request_err_code(
            &mut stdin,
            &mut reader,
            "3",
            "auth.signUp",
            json!({ "email": "sarah@college.edu", "password": "short" }),
        ),
        "bad_params"
    );

    let identity = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "auth.signUp",
        json!({ "email": " Sarah@College.edu ", "password": "s3cret-pass" }),
    );
    let user_id = identity["userId"].as_str().expect("userId").to_string();
    assert_eq!(identity["email"], "sarah@college.edu");

    assert_eq!(
        request_err_code(
            &mut stdin,
            &mut reader,
            "5",
            "auth.signUp",
            json!({ "email": "sarah@college.edu", "password": "another-pass" }),
        ),
        "conflict"
    );
    assert_eq!(
        request_err_code(
            &mut stdin,
            &mut reader,
            "6",
            "auth.signIn",
            json!({ "email": "sarah@college.edu", "password": "wrong-pass" }),
        ),
        "invalid_credentials"
    );
    assert_eq!(
        request_err_code(
            &mut stdin,
            &mut reader,
            "7",
            "auth.signIn",
            json!({ "email": "nobody@college.edu", "password": "s3cret-pass" }),
        ),
        "invalid_credentials"
    );

    // No profile yet: an empty onboarding state, not an error.
    let signed = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "auth.signIn",
        json!({ "email": "sarah@college.edu", "password": "s3cret-pass" }),
    );
    assert!(signed["session"]["role"].is_null());
    assert_eq!(signed["session"]["profile"]["kind"], "none");
    assert_eq!(
        request_err_code(&mut stdin, &mut reader, "9", "me.attendance", json!({})),
        "profile_not_found"
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "faculty.create",
        json!({
            "fullName": "Dr. Sarah Johnson",
            "email": "sarah@college.edu",
            "department": "CSE",
            "userId": user_id
        }),
    );

    // The existing session is a snapshot until the next sign-in.
    let refreshed = request_ok(&mut stdin, &mut reader, "11", "auth.refresh", json!({}));
    assert_eq!(refreshed["resolved"], false);
    assert_eq!(refreshed["session"]["profile"]["kind"], "none");
    assert_ne!(refreshed["session"]["token"], signed["session"]["token"]);

    let signed = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "auth.signIn",
        json!({ "email": "sarah@college.edu", "password": "s3cret-pass" }),
    );
    assert_eq!(signed["resolved"], true);
    assert_eq!(signed["session"]["role"], "faculty");
    assert_eq!(signed["session"]["profile"]["fullName"], "Dr. Sarah Johnson");
    assert_eq!(
        request_err_code(&mut stdin, &mut reader, "13", "me.classmates", json!({})),
        "forbidden"
    );

    let _ = request_ok(&mut stdin, &mut reader, "14", "auth.signOut", json!({}));
    let _ = request_ok(&mut stdin, &mut reader, "15", "auth.signOut", json!({}));
    let session = request_ok(&mut stdin, &mut reader, "16", "auth.session", json!({}));
    assert!(session["session"].is_null());
    assert_eq!(
        request_err_code(&mut stdin, &mut reader, "17", "auth.refresh", json!({})),
        "not_authenticated"
    );
}

#[test]
fn identity_cannot_link_to_both_profile_tables() {
    let workspace = temp_dir("attendd-auth-link");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "year": 2024, "section": "A", "department": "CSE" }),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();
    let identity = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "auth.signUp",
        json!({ "email": "asha@college.edu", "password": "s3cret-pass" }),
    );
    let user_id = identity["userId"].as_str().expect("userId").to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({
            "fullName": "Asha Rao",
            "rollNumber": "21CS001",
            "classId": class_id,
            "userId": user_id
        }),
    );
    assert_eq!(
        request_err_code(
            &mut stdin,
            &mut reader,
            "5",
            "faculty.create",
            json!({ "fullName": "Asha Rao", "email": "asha@college.edu", "userId": user_id }),
        ),
        "conflict"
    );
    assert_eq!(
        request_err_code(
            &mut stdin,
            &mut reader,
            "6",
            "students.create",
            json!({
                "fullName": "Asha R",
                "rollNumber": "21CS002",
                "classId": class_id,
                "userId": "missing",
            }),
        ),
        "not_found"
    );

    let signed = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "auth.signIn",
        json!({ "email": "asha@college.edu", "password": "s3cret-pass" }),
    );
    assert_eq!(signed["session"]["role"], "student");
    assert_eq!(signed["session"]["profile"]["rollNumber"], "21CS001");
    assert_eq!(signed["session"]["profile"]["class"]["id"], class_id);

    // Switching workspaces drops the session.
    let other = temp_dir("attendd-auth-link-other");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "workspace.select",
        json!({ "path": other.to_string_lossy() }),
    );
    let session = request_ok(&mut stdin, &mut reader, "9", "auth.session", json!({}));
    assert!(session["session"].is_null());
}

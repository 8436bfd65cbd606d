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

fn assert_dispatched(value: &serde_json::Value, method: &str) {
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(code, "not_implemented", "unexpected unknown method for {}", method);
    }
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("attendd-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health.get("workspacePath").map(|v| v.is_null()).unwrap_or(false));

    assert_eq!(
        request_err_code(&mut stdin, &mut reader, "2", "classes.get", json!({ "classId": "x" })),
        "no_workspace"
    );
    assert_eq!(
        request_err_code(&mut stdin, &mut reader, "2b", "classes.list", json!({})),
        "no_workspace"
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert!(workspace.join("attendd.sqlite3").exists());

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "classes.create",
        json!({ "year": 2024, "section": "a", "department": "cse" }),
    );
    let class_id = created["classId"].as_str().expect("classId").to_string();
    assert_eq!(created["className"], "2024 CSE A");

    let calls: Vec<(&str, serde_json::Value)> = vec![
        ("setup.get", json!({})),
        ("auth.session", json!({})),
        ("me.profile", json!({})),
        ("classes.list", json!({})),
        ("students.list", json!({ "classId": class_id })),
        ("faculty.list", json!({})),
        ("timetable.forClass", json!({ "classId": class_id })),
        ("attendance.stats", json!({ "classId": class_id })),
        ("substitutions.active", json!({ "classId": class_id })),
        ("advisor.effective", json!({ "classId": class_id })),
        ("reports.classAttendanceModel", json!({ "classId": class_id })),
    ];
    for (i, (method, params)) in calls.into_iter().enumerate() {
        let id = format!("smoke-{}", i);
        let value = request(&mut stdin, &mut reader, &id, method, params);
        assert_dispatched(&value, method);
    }

    let unknown = request(&mut stdin, &mut reader, "5", "grades.list", json!({}));
    assert_eq!(unknown["error"]["code"], "not_implemented");

    // A malformed line gets an error but the loop keeps serving.
    writeln!(stdin, "{{not json").expect("write garbage");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read bad_json response");
    let bad: serde_json::Value = serde_json::from_str(line.trim()).expect("parse");
    assert_eq!(bad["error"]["code"], "bad_json");

    let _ = request_ok(&mut stdin, &mut reader, "6", "health", json!({}));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn class_create_rejects_duplicates_and_delete_cascades() {
    let workspace = temp_dir("attendd-classes");
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
        json!({ "year": 2023, "section": "B", "department": "ECE", "className": "ECE II-B" }),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();
    assert_eq!(
        request_err_code(
            &mut stdin,
            &mut reader,
            "3",
            "classes.create",
            json!({ "year": 2023, "section": "b", "department": "ece" }),
        ),
        "conflict"
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "fullName": "Asha Rao", "rollNumber": "23ec001", "classId": class_id }),
    );
    let got = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "classes.get",
        json!({ "classId": class_id }),
    );
    assert_eq!(got["class"]["studentCount"], 1);
    assert_eq!(got["class"]["className"], "ECE II-B");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "classes.delete",
        json!({ "classId": class_id }),
    );
    let students = request_ok(&mut stdin, &mut reader, "7", "students.list", json!({}));
    assert_eq!(students["students"].as_array().map(|a| a.len()), Some(0));
    assert_eq!(
        request_err_code(
            &mut stdin,
            &mut reader,
            "8",
            "classes.get",
            json!({ "classId": class_id }),
        ),
        "not_found"
    );
}

fn sign_in_marking_faculty(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
) {
    let identity = request_ok(
        stdin,
        reader,
        "fac-up",
        "auth.signUp",
        json!({ "email": "sarah@college.edu", "password": "s3cret-pass" }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "fac-create",
        "faculty.create",
        json!({
            "fullName": "Dr. Sarah Johnson",
            "email": "sarah@college.edu",
            "userId": identity["userId"]
        }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "fac-in",
        "auth.signIn",
        json!({ "email": "sarah@college.edu", "password": "s3cret-pass" }),
    );
}

fn mark_one(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    class_id: &str,
    student_id: &str,
    date: &str,
) {
    let _ = request_ok(
        stdin,
        reader,
        id,
        "attendance.mark",
        json!({
            "classId": class_id,
            "date": date,
            "periodNumber": 1,
            "subject": "Mathematics",
            "entries": [{ "studentId": student_id, "status": "present" }]
        }),
    );
}

#[test]
fn class_delete_removes_marks_a_transferred_student_earned_elsewhere() {
    let workspace = temp_dir("attendd-classes-transfer");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let mut class_ids = Vec::new();
    for (i, section) in ["A", "B"].into_iter().enumerate() {
        let created = request_ok(
            &mut stdin,
            &mut reader,
            &format!("c{}", i),
            "classes.create",
            json!({ "year": 2024, "section": section, "department": "CSE" }),
        );
        class_ids.push(created["classId"].as_str().expect("classId").to_string());
    }
    let student_id = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "fullName": "Asha Rao", "rollNumber": "21CS001", "classId": class_ids[1] }),
    )["studentId"]
        .as_str()
        .expect("studentId")
        .to_string();
    sign_in_marking_faculty(&mut stdin, &mut reader);
    mark_one(&mut stdin, &mut reader, "3", &class_ids[1], &student_id, "2024-03-04");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.update",
        json!({ "studentId": student_id, "patch": { "classId": class_ids[0] } }),
    );
    mark_one(&mut stdin, &mut reader, "5", &class_ids[0], &student_id, "2024-03-11");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "classes.delete",
        json!({ "classId": class_ids[0] }),
    );
    assert_eq!(
        request_err_code(
            &mut stdin,
            &mut reader,
            "7",
            "students.get",
            json!({ "studentId": student_id }),
        ),
        "not_found"
    );
    let stats = request_ok(&mut stdin, &mut reader, "8", "attendance.stats", json!({}));
    assert_eq!(stats["stats"]["total"], 0);

    let remaining = request_ok(&mut stdin, &mut reader, "9", "classes.list", json!({}));
    let classes = remaining["classes"].as_array().expect("classes");
    assert_eq!(classes.len(), 1);
    assert_eq!(classes[0]["id"], class_ids[1]);
}

#[test]
fn student_delete_takes_their_marks_along() {
    let workspace = temp_dir("attendd-students-delete");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_id = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "year": 2024, "section": "A", "department": "CSE" }),
    )["classId"]
        .as_str()
        .expect("classId")
        .to_string();
    let mut students = Vec::new();
    for (i, (name, roll)) in [("Asha Rao", "21CS001"), ("Vikram Shah", "21CS002")]
        .into_iter()
        .enumerate()
    {
        let created = request_ok(
            &mut stdin,
            &mut reader,
            &format!("s{}", i),
            "students.create",
            json!({ "fullName": name, "rollNumber": roll, "classId": class_id }),
        );
        students.push(created["studentId"].as_str().expect("studentId").to_string());
    }
    sign_in_marking_faculty(&mut stdin, &mut reader);
    for (i, date) in ["2024-03-04", "2024-03-05"].into_iter().enumerate() {
        mark_one(&mut stdin, &mut reader, &format!("m0-{}", i), &class_id, &students[0], date);
    }
    mark_one(&mut stdin, &mut reader, "m1", &class_id, &students[1], "2024-03-04");

    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.delete",
        json!({ "studentId": students[0] }),
    );
    assert_eq!(deleted["removedMarks"], 2);

    let stats = request_ok(&mut stdin, &mut reader, "4", "attendance.stats", json!({}));
    assert_eq!(stats["stats"]["total"], 1);
    let day = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.forClassDate",
        json!({ "classId": class_id, "date": "2024-03-04" }),
    );
    let records = day["records"].as_array().expect("records");
    assert_eq!(records.len(), 1);
    assert_ne!(records[0]["studentId"], students[0]);
    assert_eq!(
        request_err_code(
            &mut stdin,
            &mut reader,
            "6",
            "students.delete",
            json!({ "studentId": students[0] }),
        ),
        "not_found"
    );
}

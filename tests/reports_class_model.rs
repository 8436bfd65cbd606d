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

fn created_id(value: &serde_json::Value, key: &str) -> String {
    value[key].as_str().expect(key).to_string()
}

#[test]
fn class_and_student_models_use_aggregated_numbers() {
    let workspace = temp_dir("attendd-reports");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_id = created_id(
        &request_ok(
            &mut stdin,
            &mut reader,
            "2",
            "classes.create",
            json!({ "year": 2024, "section": "A", "department": "CSE" }),
        ),
        "classId",
    );
    let asha = created_id(
        &request_ok(
            &mut stdin,
            &mut reader,
            "3",
            "students.create",
            json!({ "fullName": "Asha Rao", "rollNumber": "21CS001", "classId": class_id }),
        ),
        "studentId",
    );
    let vikram = created_id(
        &request_ok(
            &mut stdin,
            &mut reader,
            "4",
            "students.create",
            json!({ "fullName": "Vikram Shah", "rollNumber": "21CS002", "classId": class_id }),
        ),
        "studentId",
    );
    let identity = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "auth.signUp",
        json!({ "email": "sarah@college.edu", "password": "s3cret-pass" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "faculty.create",
        json!({
            "fullName": "Dr. Sarah Johnson",
            "email": "sarah@college.edu",
            "userId": identity["userId"],
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "auth.signIn",
        json!({ "email": "sarah@college.edu", "password": "s3cret-pass" }),
    );

    // Asha: 4 of 5 present (80%). Vikram: 3 of 5 present (60%).
    let days = ["2024-03-04", "2024-03-05", "2024-03-06", "2024-03-07", "2024-03-08"];
    for (i, day) in days.iter().enumerate() {
        let asha_status = if i == 4 { "absent" } else { "present" };
        let vikram_status = if i >= 3 { "absent" } else { "present" };
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("mark-{}", i),
            "attendance.mark",
            json!({
                "classId": class_id,
                "date": day,
                "periodNumber": 1,
                "subject": "Mathematics",
                "entries": [
                    { "studentId": asha, "status": asha_status },
                    { "studentId": vikram, "status": vikram_status }
                ]
            }),
        );
    }

    let model = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "reports.classAttendanceModel",
        json!({ "classId": class_id }),
    );
    assert_eq!(model["class"]["className"], "2024 CSE A");
    assert_eq!(model["threshold"], 75.0);
    assert_eq!(model["studentCount"], 2);
    assert_eq!(model["classAverage"], 70.0);
    assert_eq!(model["aboveThresholdCount"], 1);
    assert_eq!(model["belowThresholdCount"], 1);
    assert!(model["generatedAt"].is_string());
    let students = model["students"].as_array().expect("students");
    assert_eq!(students[0]["rollNumber"], "21CS001");
    assert_eq!(students[0]["percentage"], 80.0);
    assert_eq!(students[0]["band"], "above");
    assert_eq!(students[1]["band"], "below");

    let ranged = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "reports.classAttendanceModel",
        json!({ "classId": class_id, "startDate": "2024-03-04", "endDate": "2024-03-06" }),
    );
    assert_eq!(ranged["classAverage"], 100.0);
    assert_eq!(ranged["range"]["endDate"], "2024-03-06");

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "reports.studentAttendanceModel",
        json!({ "studentId": vikram }),
    );
    assert_eq!(student["student"]["fullName"], "Vikram Shah");
    assert_eq!(student["class"]["id"], class_id);
    assert_eq!(student["overall"]["percentage"], 60.0);
    assert_eq!(student["band"], "below");
    assert_eq!(student["groups"][0]["subject"], "Mathematics");

    let flat = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "reports.studentAttendanceModel",
        json!({ "studentId": vikram, "groupBy": "none" }),
    );
    assert_eq!(flat["groups"].as_array().map(|g| g.len()), Some(1));
    assert_eq!(flat["groups"][0]["subject"], "All");
}

#[test]
fn empty_roster_reports_zero_average() {
    let workspace = temp_dir("attendd-reports-empty");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_id = created_id(
        &request_ok(
            &mut stdin,
            &mut reader,
            "2",
            "classes.create",
            json!({ "year": 2022, "section": "C", "department": "MECH" }),
        ),
        "classId",
    );
    let model = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "reports.classAttendanceModel",
        json!({ "classId": class_id }),
    );
    assert_eq!(model["studentCount"], 0);
    assert_eq!(model["classAverage"], 0.0);
    assert_eq!(
        request_err_code(
            &mut stdin,
            &mut reader,
            "4",
            "reports.classAttendanceModel",
            json!({ "classId": "missing" }),
        ),
        "not_found"
    );
}

#[test]
fn advisor_model_follows_assignment_and_substitution() {
    let workspace = temp_dir("attendd-reports-advisor");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_id = created_id(
        &request_ok(
            &mut stdin,
            &mut reader,
            "2",
            "classes.create",
            json!({ "year": 2024, "section": "A", "department": "CSE" }),
        ),
        "classId",
    );

    let mut faculty = Vec::new();
    for (i, (name, email)) in [
        ("Dr. Sarah Johnson", "sarah@college.edu"),
        ("Prof. Ravi Kumar", "ravi@college.edu"),
    ]
    .into_iter()
    .enumerate()
    {
        let identity = request_ok(
            &mut stdin,
            &mut reader,
            &format!("signup-{}", i),
            "auth.signUp",
            json!({ "email": email, "password": "s3cret-pass" }),
        );
        faculty.push(created_id(
            &request_ok(
                &mut stdin,
                &mut reader,
                &format!("faculty-{}", i),
                "faculty.create",
                json!({ "fullName": name, "email": email, "userId": identity["userId"] }),
            ),
            "facultyId",
        ));
    }

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "auth.signIn",
        json!({ "email": "sarah@college.edu", "password": "s3cret-pass" }),
    );
    assert_eq!(
        request_err_code(&mut stdin, &mut reader, "4", "reports.advisorClassModel", json!({})),
        "forbidden"
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "faculty.update",
        json!({
            "facultyId": faculty[0],
            "patch": { "advisorClassId": class_id, "isClassAdvisor": true },
        }),
    );
    let model = request_ok(&mut stdin, &mut reader, "6", "reports.advisorClassModel", json!({}));
    assert_eq!(model["class"]["id"], class_id);
    assert_eq!(model["advisor"]["isSubstitute"], false);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "substitutions.create",
        json!({
            "classId": class_id,
            "originalAdvisorId": faculty[0],
            "substituteAdvisorId": faculty[1],
            "fromDate": "2000-01-01",
            "toDate": "2999-12-31",
            "reason": "conference leave"
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "auth.signIn",
        json!({ "email": "ravi@college.edu", "password": "s3cret-pass" }),
    );
    let model = request_ok(&mut stdin, &mut reader, "9", "reports.advisorClassModel", json!({}));
    assert_eq!(model["class"]["id"], class_id);
    assert_eq!(model["advisor"]["fullName"], "Prof. Ravi Kumar");
    assert_eq!(model["advisor"]["isSubstitute"], true);
}

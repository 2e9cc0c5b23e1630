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

fn spawn_daemon() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_schoolerpd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoolerpd");
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
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
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
    assert!(
        !value.get("ok").and_then(|v| v.as_bool()).unwrap_or(true),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .expect("error code")
        .to_string()
}

struct Seed {
    class_id: String,
    section_id: String,
    students: Vec<String>,
}

fn seed_school(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    prefix: &str,
    student_count: usize,
) -> Seed {
    let workspace = temp_dir(prefix);
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "sess",
        "session.begin",
        json!({ "userId": "admin-1", "role": "admin" }),
    );
    let class = request_ok(
        stdin,
        reader,
        "cls",
        "classes.create",
        json!({ "name": "1st", "level": 1 }),
    );
    let class_id = class.get("id").and_then(|v| v.as_str()).expect("class id").to_string();
    let section = request_ok(
        stdin,
        reader,
        "sec",
        "sections.create",
        json!({ "classId": class_id, "name": "A" }),
    );
    let section_id = section
        .get("id")
        .and_then(|v| v.as_str())
        .expect("section id")
        .to_string();

    let mut students = Vec::new();
    for i in 0..student_count {
        let stu = request_ok(
            stdin,
            reader,
            &format!("stu{}", i),
            "students.create",
            json!({
                "classId": class_id,
                "sectionId": section_id,
                "admissionNo": format!("ADM-{:03}", i + 1),
                "firstName": format!("Student{}", i + 1),
                "lastName": "Test",
            }),
        );
        students.push(
            stu.get("id")
                .and_then(|v| v.as_str())
                .expect("student id")
                .to_string(),
        );
    }
    Seed {
        class_id,
        section_id,
        students,
    }
}

fn day_statuses(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    seed: &Seed,
    date: &str,
) -> Vec<(String, String)> {
    let res = request_ok(
        stdin,
        reader,
        "byclass",
        "attendance.byClass",
        json!({ "classId": seed.class_id, "sectionId": seed.section_id, "date": date }),
    );
    res.get("records")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(|r| {
            (
                r.get("studentId").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                r.get("status").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            )
        })
        .collect()
}

#[test]
fn mark_reconciles_roster_with_default_absent_and_idempotent_remark() {
    let (_child, mut stdin, mut reader) = spawn_daemon();
    let seed = seed_school(&mut stdin, &mut reader, "schoolerp-mark", 3);
    let (s1, s2, s3) = (&seed.students[0], &seed.students[1], &seed.students[2]);

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "mark1",
        "attendance.mark",
        json!({
            "classId": seed.class_id,
            "sectionId": seed.section_id,
            "date": "2024-04-15",
            "attendance": { (s1.as_str()): "present", (s2.as_str()): "late" },
        }),
    );
    assert_eq!(res.get("written").and_then(|v| v.as_u64()), Some(3));

    let statuses = day_statuses(&mut stdin, &mut reader, &seed, "2024-04-15");
    assert_eq!(statuses.len(), 3);
    let status_of = |sid: &str| {
        statuses
            .iter()
            .find(|(id, _)| id == sid)
            .map(|(_, st)| st.clone())
            .expect("student row present")
    };
    assert_eq!(status_of(s1), "present");
    assert_eq!(status_of(s2), "late");
    assert_eq!(status_of(s3), "absent", "omitted student defaults to absent");

    // Re-mark the same day with only S1: it flips, S2 and S3 keep their
    // existing statuses, and no duplicate rows appear.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "mark2",
        "attendance.mark",
        json!({
            "classId": seed.class_id,
            "sectionId": seed.section_id,
            "date": "2024-04-15",
            "attendance": { (s1.as_str()): "absent" },
        }),
    );
    let statuses = day_statuses(&mut stdin, &mut reader, &seed, "2024-04-15");
    assert_eq!(statuses.len(), 3, "re-mark must not duplicate live rows");
    let status_of = |sid: &str| {
        statuses
            .iter()
            .find(|(id, _)| id == sid)
            .map(|(_, st)| st.clone())
            .expect("student row present")
    };
    assert_eq!(status_of(s1), "absent");
    assert_eq!(status_of(s2), "late", "omitted on re-mark is left unchanged");
    assert_eq!(status_of(s3), "absent");
}

#[test]
fn mark_requires_an_admin_session() {
    let (_child, mut stdin, mut reader) = spawn_daemon();
    let seed = seed_school(&mut stdin, &mut reader, "schoolerp-mark-auth", 1);

    let params = json!({
        "classId": seed.class_id,
        "sectionId": seed.section_id,
        "date": "2024-04-15",
        "attendance": {},
    });

    let _ = request_ok(&mut stdin, &mut reader, "end", "session.end", json!({}));
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "noauth",
        "attendance.mark",
        params.clone(),
    );
    assert_eq!(code, "unauthenticated");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "sess2",
        "session.begin",
        json!({ "userId": "teacher-1", "role": "teacher" }),
    );
    let code = request_err_code(&mut stdin, &mut reader, "noadmin", "attendance.mark", params);
    assert_eq!(code, "forbidden");
}

#[test]
fn mark_validates_map_and_date_before_writing() {
    let (_child, mut stdin, mut reader) = spawn_daemon();
    let seed = seed_school(&mut stdin, &mut reader, "schoolerp-mark-validate", 2);
    let s1 = &seed.students[0];

    // Unknown student id in the map.
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "unknown-sid",
        "attendance.mark",
        json!({
            "classId": seed.class_id,
            "sectionId": seed.section_id,
            "date": "2024-04-15",
            "attendance": { "not-a-student": "present" },
        }),
    );
    assert_eq!(code, "validation");

    // Unknown status value.
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "bad-status",
        "attendance.mark",
        json!({
            "classId": seed.class_id,
            "sectionId": seed.section_id,
            "date": "2024-04-15",
            "attendance": { (s1.as_str()): "asleep" },
        }),
    );
    assert_eq!(code, "validation");

    // Malformed date.
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "bad-date",
        "attendance.mark",
        json!({
            "classId": seed.class_id,
            "sectionId": seed.section_id,
            "date": "15/04/2024",
            "attendance": { (s1.as_str()): "present" },
        }),
    );
    assert_eq!(code, "validation");

    // None of the rejected calls wrote anything.
    let statuses = day_statuses(&mut stdin, &mut reader, &seed, "2024-04-15");
    assert!(statuses.is_empty(), "rejected marks must not write records");
}

#[test]
fn mark_with_empty_roster_fails_and_writes_nothing() {
    let (_child, mut stdin, mut reader) = spawn_daemon();
    let seed = seed_school(&mut stdin, &mut reader, "schoolerp-mark-empty", 0);

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "empty",
        "attendance.mark",
        json!({
            "classId": seed.class_id,
            "sectionId": seed.section_id,
            "date": "2024-04-15",
            "attendance": {},
        }),
    );
    assert_eq!(code, "no_roster_found");

    let statuses = day_statuses(&mut stdin, &mut reader, &seed, "2024-04-15");
    assert!(statuses.is_empty());
}

#[test]
fn soft_deleted_student_leaves_roster_but_keeps_history() {
    let (_child, mut stdin, mut reader) = spawn_daemon();
    let seed = seed_school(&mut stdin, &mut reader, "schoolerp-mark-softdel", 2);
    let s2 = &seed.students[1];

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "mark1",
        "attendance.mark",
        json!({
            "classId": seed.class_id,
            "sectionId": seed.section_id,
            "date": "2024-04-15",
            "attendance": {},
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "del",
        "students.delete",
        json!({ "studentId": s2 }),
    );

    // The next day only the remaining student is marked...
    let res = request_ok(
        &mut stdin,
        &mut reader,
        "mark2",
        "attendance.mark",
        json!({
            "classId": seed.class_id,
            "sectionId": seed.section_id,
            "date": "2024-04-16",
            "attendance": {},
        }),
    );
    assert_eq!(res.get("written").and_then(|v| v.as_u64()), Some(1));

    // ...but the earlier day still shows both records.
    let statuses = day_statuses(&mut stdin, &mut reader, &seed, "2024-04-15");
    assert_eq!(statuses.len(), 2);
}

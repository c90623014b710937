use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

use edunityd::db;
use edunityd::ids;

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

fn run_repair(workspace: &Path, apply: bool) -> String {
    let exe = env!("CARGO_BIN_EXE_repair-lead-ids");
    let mut cmd = Command::new(exe);
    cmd.arg(workspace);
    if apply {
        cmd.arg("--apply");
    }
    let output = cmd.current_dir(workspace).output().expect("run repair cli");
    assert!(
        output.status.success(),
        "repair cli failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).expect("stdout utf-8")
}

fn seed_lead(
    conn: &rusqlite::Connection,
    doc_id: &str,
    edunity_id: Option<&str>,
    serial: Option<i64>,
    email: &str,
    phone: &str,
    created_at: &str,
) {
    conn.execute(
        "INSERT INTO teacher_interests(id, edunity_id, edunity_id_serial, full_name,
                                       email, email_normalized, phone, phone_normalized,
                                       created_at)
         VALUES(?, ?, ?, 'Seeded', ?, ?, ?, ?, ?)",
        (
            doc_id,
            edunity_id,
            serial,
            email,
            ids::normalize_email(email),
            phone,
            ids::normalize_phone(phone),
            created_at,
        ),
    )
    .expect("seed lead");
}

/// A transitive duplicate group plus one clean legacy-prefixed row.
/// Returns the opaque doc IDs of the two duplicates.
fn seed_workspace(workspace: &Path) -> (String, String) {
    let conn = db::open_db(workspace).expect("open workspace db");
    let dup_b = uuid::Uuid::new_v4().to_string();
    let dup_c = uuid::Uuid::new_v4().to_string();

    // a-b share an email, b-c share a phone: one component of three.
    seed_lead(
        &conn,
        "canonical-a",
        Some("EDU-ON-T-00101"),
        Some(101),
        "shared@x.com",
        "0801",
        "2024-01-01T00:00:00+00:00",
    );
    seed_lead(
        &conn,
        &dup_b,
        None,
        None,
        "shared@x.com",
        "0802",
        "2024-01-02T00:00:00+00:00",
    );
    seed_lead(
        &conn,
        &dup_c,
        None,
        None,
        "other@x.com",
        "0802",
        "2024-01-03T00:00:00+00:00",
    );
    seed_lead(
        &conn,
        "legacy-solo",
        Some("ED-ON-T-00104"),
        Some(104),
        "solo@x.com",
        "0899",
        "2024-01-04T00:00:00+00:00",
    );
    (dup_b, dup_c)
}

fn lead_count(workspace: &Path) -> i64 {
    let conn = db::open_db(workspace).expect("reopen workspace db");
    conn.query_row("SELECT COUNT(*) FROM teacher_interests", [], |r| r.get(0))
        .expect("count leads")
}

#[test]
fn dry_run_reports_the_plan_and_writes_nothing() {
    let workspace = temp_dir("edunity-repair-dry");
    let (dup_b, dup_c) = seed_workspace(&workspace);

    let out = run_repair(&workspace, false);
    assert!(out.contains("[scan] collection=teacher_interests mode=DRY_RUN"));
    assert!(out.contains("[scan] total_docs=4"));
    assert!(out.contains("[summary] duplicate_email_groups=1"));
    assert!(out.contains("[summary] duplicate_phone_groups=1"));
    assert!(out.contains("[summary] duplicate_contact_components=1"));
    assert!(out.contains("[summary] docs_to_archive_and_delete=2"));
    assert!(out.contains("[summary] canonical_docs=2"));
    assert!(out.contains("[id] legacy-solo: ED-ON-T-00104 -> EDU-ON-T-00104"));
    assert!(out.contains(&format!("[delete] {} duplicate_of=canonical-a", dup_b)));
    assert!(out.contains(&format!("[delete] {} duplicate_of=canonical-a", dup_c)));
    assert!(out.contains("[dry-run] No writes made. Run with --apply to execute."));
    assert!(!out.contains("[apply]"));

    // Nothing was written: all four rows survive and no archive exists.
    assert_eq!(lead_count(&workspace), 4);
    let conn = db::open_db(&workspace).expect("reopen");
    assert!(
        !db::table_exists(&conn, "teacher_interests_dedup_archive").expect("probe archive")
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn apply_merges_the_group_and_a_second_run_is_clean() {
    let workspace = temp_dir("edunity-repair-apply");
    let (dup_b, dup_c) = seed_workspace(&workspace);

    let out = run_repair(&workspace, true);
    assert!(out.contains("[scan] collection=teacher_interests mode=APPLY"));
    assert!(out.contains("[apply] completed."));
    assert!(out.contains("archive_collection=teacher_interests_dedup_archive"));

    let conn = db::open_db(&workspace).expect("reopen workspace db");
    let live: i64 = conn
        .query_row("SELECT COUNT(*) FROM teacher_interests", [], |r| r.get(0))
        .expect("count live");
    assert_eq!(live, 2);

    // Both duplicates landed in the archive, pointing at the canonical.
    for dup in [&dup_b, &dup_c] {
        let canonical: String = conn
            .query_row(
                "SELECT _canonical_doc_id FROM teacher_interests_dedup_archive WHERE id = ?",
                [dup.as_str()],
                |r| r.get(0),
            )
            .expect("archived duplicate");
        assert_eq!(canonical, "canonical-a");
    }

    // The legacy prefix was rewritten in place, keeping the serial.
    let (rewritten, reassigned_from): (String, String) = conn
        .query_row(
            "SELECT edunity_id, id_reassigned_from FROM teacher_interests WHERE id = 'legacy-solo'",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .expect("legacy row");
    assert_eq!(rewritten, "EDU-ON-T-00104");
    assert_eq!(reassigned_from, "ED-ON-T-00104");

    // The counter landed on the highest surviving serial.
    let counter: i64 = conn
        .query_row(
            "SELECT current FROM counters WHERE name = 'teacher_onboard_serial'",
            [],
            |r| r.get(0),
        )
        .expect("counter");
    assert_eq!(counter, 104);
    drop(conn);

    // Running again finds a clean collection.
    let again = run_repair(&workspace, true);
    assert!(again.contains("[summary] duplicate_contact_components=0"));
    assert!(again.contains("[summary] docs_to_archive_and_delete=0"));
    assert!(again.contains("[summary] docs_with_id_reassignments=0"));
    assert_eq!(lead_count(&workspace), 2);

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn empty_workspace_is_reported_and_left_alone() {
    let workspace = temp_dir("edunity-repair-empty");
    {
        let _ = db::open_db(&workspace).expect("init empty workspace");
    }

    let out = run_repair(&workspace, true);
    assert!(out.contains("[scan] total_docs=0"));
    assert!(out.contains("[result] Collection is empty, nothing to dedupe."));
    assert!(!out.contains("[apply]"));

    let _ = std::fs::remove_dir_all(workspace);
}

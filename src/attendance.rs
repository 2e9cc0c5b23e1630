//! Attendance core: roster resolution, per-day reconciliation, aggregate
//! statistics and filtered report queries. All functions take the store
//! connection explicitly so they stay testable against a scratch database.

use chrono::{Datelike, NaiveDate};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use uuid::Uuid;

use crate::db;

pub const STATUS_PRESENT: &str = "present";
pub const STATUS_ABSENT: &str = "absent";
pub const STATUS_LATE: &str = "late";
pub const STATUS_EXCUSED: &str = "excused";

pub const STATUSES: [&str; 4] = [STATUS_PRESENT, STATUS_ABSENT, STATUS_LATE, STATUS_EXCUSED];

pub fn is_valid_status(s: &str) -> bool {
    STATUSES.contains(&s)
}

/// Attendance identity is day-granular: `YYYY-MM-DD` only, time of day never
/// enters the picture. Stored as text, so equality and range comparison stay
/// exact.
pub fn parse_day(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

/// First and last day of the month containing `day`. Used as the default
/// reporting window.
pub fn month_bounds(day: NaiveDate) -> (NaiveDate, NaiveDate) {
    let first = day.with_day(1).unwrap_or(day);
    let next_first = if first.month() == 12 {
        NaiveDate::from_ymd_opt(first.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(first.year(), first.month() + 1, 1)
    };
    let last = next_first.and_then(|d| d.pred_opt()).unwrap_or(first);
    (first, last)
}

/// Ordered student ids currently enrolled in a class+section. Order is
/// stable (insertion order, then id) and doubles as the reconciliation
/// iteration order.
pub fn resolve_roster(
    conn: &Connection,
    class_id: &str,
    section_id: &str,
) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM students
         WHERE class_id = ? AND section_id = ? AND deleted_at IS NULL
         ORDER BY sort_order, id",
    )?;
    let rows = stmt
        .query_map((class_id, section_id), |r| r.get::<_, String>(0))?
        .collect();
    rows
}

pub struct MarkContext<'a> {
    pub class_id: &'a str,
    pub section_id: &'a str,
    pub date: &'a str,
    pub marked_by: &'a str,
}

/// Merge a requested status map against the live records for one day.
///
/// Per student in roster order: a supplied status inserts a new row or
/// overwrites the existing live row for that day; an omitted student gets
/// `absent` on first marking and is left untouched afterwards. Both cases
/// ride the (student_id, date) unique index, and the whole pass is one
/// transaction, so re-marking the same day never duplicates rows and a
/// failed mark leaves nothing half-written.
pub fn reconcile(
    conn: &Connection,
    ctx: &MarkContext,
    roster: &[String],
    requested: &HashMap<String, String>,
) -> rusqlite::Result<usize> {
    let now = db::now_ts();
    let tx = conn.unchecked_transaction()?;
    let mut written = 0usize;
    {
        let mut upsert = tx.prepare(
            "INSERT INTO attendance(id, student_id, class_id, section_id, date, status, marked_by, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(student_id, date) WHERE deleted_at IS NULL DO UPDATE SET
               status = excluded.status,
               marked_by = excluded.marked_by,
               updated_at = excluded.updated_at",
        )?;
        let mut insert_if_absent = tx.prepare(
            "INSERT INTO attendance(id, student_id, class_id, section_id, date, status, marked_by, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(student_id, date) WHERE deleted_at IS NULL DO NOTHING",
        )?;
        for student_id in roster {
            let row_id = Uuid::new_v4().to_string();
            written += match requested.get(student_id) {
                Some(status) => upsert.execute((
                    &row_id,
                    student_id,
                    ctx.class_id,
                    ctx.section_id,
                    ctx.date,
                    status,
                    ctx.marked_by,
                    &now,
                    &now,
                ))?,
                None => insert_if_absent.execute((
                    &row_id,
                    student_id,
                    ctx.class_id,
                    ctx.section_id,
                    ctx.date,
                    STATUS_ABSENT,
                    ctx.marked_by,
                    &now,
                    &now,
                ))?,
            };
        }
    }
    tx.commit()?;
    Ok(written)
}

pub enum StatsSubject<'a> {
    Student(&'a str),
    Class {
        class_id: &'a str,
        section_id: Option<&'a str>,
    },
}

#[derive(Debug, PartialEq)]
pub struct Stats {
    pub total: i64,
    pub present: i64,
    pub absent: i64,
    pub late: i64,
    pub excused: i64,
    pub percentage: f64,
}

/// Status counts plus presence percentage over an optional inclusive
/// [start, end] window. An empty window means all records for the subject.
pub fn statistics(
    conn: &Connection,
    subject: StatsSubject,
    start: Option<&str>,
    end: Option<&str>,
) -> rusqlite::Result<Stats> {
    let mut sql = String::from(
        "SELECT COUNT(*),
                SUM(status = 'present'),
                SUM(status = 'absent'),
                SUM(status = 'late'),
                SUM(status = 'excused')
         FROM attendance WHERE deleted_at IS NULL",
    );
    let mut args: Vec<Value> = Vec::new();
    match subject {
        StatsSubject::Student(id) => {
            sql.push_str(" AND student_id = ?");
            args.push(Value::from(id.to_string()));
        }
        StatsSubject::Class {
            class_id,
            section_id,
        } => {
            sql.push_str(" AND class_id = ?");
            args.push(Value::from(class_id.to_string()));
            if let Some(sid) = section_id {
                sql.push_str(" AND section_id = ?");
                args.push(Value::from(sid.to_string()));
            }
        }
    }
    if let Some(s) = start {
        sql.push_str(" AND date >= ?");
        args.push(Value::from(s.to_string()));
    }
    if let Some(e) = end {
        sql.push_str(" AND date <= ?");
        args.push(Value::from(e.to_string()));
    }

    let (total, present, absent, late, excused) =
        conn.query_row(&sql, params_from_iter(args), |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, Option<i64>>(1)?.unwrap_or(0),
                r.get::<_, Option<i64>>(2)?.unwrap_or(0),
                r.get::<_, Option<i64>>(3)?.unwrap_or(0),
                r.get::<_, Option<i64>>(4)?.unwrap_or(0),
            ))
        })?;

    let percentage = if total > 0 {
        present as f64 / total as f64 * 100.0
    } else {
        0.0
    };
    Ok(Stats {
        total,
        present,
        absent,
        late,
        excused,
        percentage,
    })
}

#[derive(Debug, Clone)]
pub struct AttendanceRow {
    pub id: String,
    pub student_id: String,
    pub class_id: String,
    pub section_id: String,
    pub date: String,
    pub status: String,
    pub marked_by: String,
    pub created_at: String,
    pub updated_at: String,
}

impl AttendanceRow {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "studentId": self.student_id,
            "classId": self.class_id,
            "sectionId": self.section_id,
            "date": self.date,
            "status": self.status,
            "markedBy": self.marked_by,
            "createdAt": self.created_at,
            "updatedAt": self.updated_at,
        })
    }
}

const ROW_COLS: &str =
    "id, student_id, class_id, section_id, date, status, marked_by, created_at, updated_at";

fn map_row(r: &Row) -> rusqlite::Result<AttendanceRow> {
    Ok(AttendanceRow {
        id: r.get(0)?,
        student_id: r.get(1)?,
        class_id: r.get(2)?,
        section_id: r.get(3)?,
        date: r.get(4)?,
        status: r.get(5)?,
        marked_by: r.get(6)?,
        created_at: r.get(7)?,
        updated_at: r.get(8)?,
    })
}

/// Live records for a class, optionally narrowed to a section and a single
/// day, in student order.
pub fn find_by_class(
    conn: &Connection,
    class_id: &str,
    section_id: Option<&str>,
    day: Option<&str>,
) -> rusqlite::Result<Vec<AttendanceRow>> {
    let mut sql = format!(
        "SELECT {} FROM attendance WHERE deleted_at IS NULL AND class_id = ?",
        ROW_COLS
    );
    let mut args: Vec<Value> = vec![Value::from(class_id.to_string())];
    if let Some(sid) = section_id {
        sql.push_str(" AND section_id = ?");
        args.push(Value::from(sid.to_string()));
    }
    if let Some(d) = day {
        sql.push_str(" AND date = ?");
        args.push(Value::from(d.to_string()));
    }
    sql.push_str(" ORDER BY student_id ASC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(args), |r| map_row(r))?
        .collect();
    rows
}

/// Live records for one student over an optional inclusive window, newest
/// day first.
pub fn find_by_student(
    conn: &Connection,
    student_id: &str,
    start: Option<&str>,
    end: Option<&str>,
) -> rusqlite::Result<Vec<AttendanceRow>> {
    let mut sql = format!(
        "SELECT {} FROM attendance WHERE deleted_at IS NULL AND student_id = ?",
        ROW_COLS
    );
    let mut args: Vec<Value> = vec![Value::from(student_id.to_string())];
    if let Some(s) = start {
        sql.push_str(" AND date >= ?");
        args.push(Value::from(s.to_string()));
    }
    if let Some(e) = end {
        sql.push_str(" AND date <= ?");
        args.push(Value::from(e.to_string()));
    }
    sql.push_str(" ORDER BY date DESC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(args), |r| map_row(r))?
        .collect();
    rows
}

/// Report query: live records inside [start, end], optionally narrowed to a
/// class and section. Newest day first; student id breaks ties within a day
/// so the output is deterministic.
pub fn report(
    conn: &Connection,
    class_id: Option<&str>,
    section_id: Option<&str>,
    start: &str,
    end: &str,
) -> rusqlite::Result<Vec<AttendanceRow>> {
    let mut sql = format!(
        "SELECT {} FROM attendance
         WHERE deleted_at IS NULL AND date >= ? AND date <= ?",
        ROW_COLS
    );
    let mut args: Vec<Value> = vec![
        Value::from(start.to_string()),
        Value::from(end.to_string()),
    ];
    if let Some(cid) = class_id {
        sql.push_str(" AND class_id = ?");
        args.push(Value::from(cid.to_string()));
    }
    if let Some(sid) = section_id {
        sql.push_str(" AND section_id = ?");
        args.push(Value::from(sid.to_string()));
    }
    sql.push_str(" ORDER BY date DESC, student_id ASC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(args), |r| map_row(r))?
        .collect();
    rows
}

pub fn find_by_id(conn: &Connection, id: &str) -> rusqlite::Result<Option<AttendanceRow>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM attendance WHERE id = ? AND deleted_at IS NULL",
            ROW_COLS
        ),
        [id],
        |r| map_row(r),
    )
    .optional()
}

/// Overwrite the status of one live record. Returns the updated row, or
/// None when the id is unknown or soft-deleted.
pub fn update_status(
    conn: &Connection,
    id: &str,
    status: &str,
) -> rusqlite::Result<Option<AttendanceRow>> {
    let changed = conn.execute(
        "UPDATE attendance SET status = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        (status, &db::now_ts(), id),
    )?;
    if changed == 0 {
        return Ok(None);
    }
    find_by_id(conn, id)
}

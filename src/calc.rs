use crate::error::{AppError, AppResult};
use chrono::{Months, NaiveDate};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Value, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Group label for records whose subject is missing or blank.
pub const UNKNOWN_SUBJECT: &str = "Unknown";
/// Group label used when records are not partitioned.
pub const ALL_GROUP: &str = "All";
pub const DEFAULT_THRESHOLD_PERCENT: f64 = 75.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Leave,
    OnDuty,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
            AttendanceStatus::Leave => "leave",
            AttendanceStatus::OnDuty => "onduty",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "present" => Some(AttendanceStatus::Present),
            "absent" => Some(AttendanceStatus::Absent),
            "leave" => Some(AttendanceStatus::Leave),
            "onduty" | "on_duty" => Some(AttendanceStatus::OnDuty),
            _ => None,
        }
    }
}

impl FromSql for AttendanceStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        AttendanceStatus::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown attendance status: {s}").into()))
    }
}

impl ToSql for AttendanceStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupBy {
    Subject,
    None,
}

impl GroupBy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "subject" => Some(GroupBy::Subject),
            "none" => Some(GroupBy::None),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GroupBy::Subject => "subject",
            GroupBy::None => "none",
        }
    }
}

/// One stored attendance mark, reduced to what aggregation needs.
#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceRow {
    pub student_id: String,
    pub date: String,
    pub period_number: i64,
    pub subject: Option<String>,
    pub status: AttendanceStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttendanceTally {
    pub total: usize,
    pub present: usize,
    pub absent: usize,
    pub leave: usize,
    pub onduty: usize,
}

impl AttendanceTally {
    pub fn record(&mut self, status: AttendanceStatus) {
        self.total += 1;
        match status {
            AttendanceStatus::Present => self.present += 1,
            AttendanceStatus::Absent => self.absent += 1,
            AttendanceStatus::Leave => self.leave += 1,
            AttendanceStatus::OnDuty => self.onduty += 1,
        }
    }

    /// On-duty counts toward attendance; leave stays in the denominator only.
    pub fn effective_present(&self) -> usize {
        self.present + self.onduty
    }

    pub fn percentage(&self) -> f64 {
        ratio_percent(self.effective_present(), self.total)
    }

    pub fn present_rate(&self) -> f64 {
        ratio_percent(self.present, self.total)
    }
}

fn ratio_percent(num: usize, denom: usize) -> f64 {
    if denom > 0 {
        (num as f64 / denom as f64) * 100.0
    } else {
        0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceStats {
    pub total: usize,
    pub present: usize,
    pub absent: usize,
    pub leave: usize,
    pub onduty: usize,
    pub effective_present: usize,
    pub percentage: f64,
    pub present_rate: f64,
}

impl From<AttendanceTally> for AttendanceStats {
    fn from(t: AttendanceTally) -> Self {
        AttendanceStats {
            total: t.total,
            present: t.present,
            absent: t.absent,
            leave: t.leave,
            onduty: t.onduty,
            effective_present: t.effective_present(),
            percentage: t.percentage(),
            present_rate: t.present_rate(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupStats {
    pub subject: String,
    #[serde(flatten)]
    pub stats: AttendanceStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult {
    pub group_by: GroupBy,
    pub groups: Vec<GroupStats>,
    pub overall: AttendanceStats,
}

fn subject_key(subject: Option<&str>) -> &str {
    match subject.map(str::trim) {
        Some(s) if !s.is_empty() => s,
        _ => UNKNOWN_SUBJECT,
    }
}

/// Rolls raw marks into per-group and overall counts in a single pass.
///
/// Groups come back ordered by subject name. With [`GroupBy::None`] there is
/// always exactly one group, even for an empty input.
pub fn aggregate<'a, I>(rows: I, group_by: GroupBy) -> AggregateResult
where
    I: IntoIterator<Item = &'a AttendanceRow>,
{
    let mut overall = AttendanceTally::default();
    let mut groups = rows
        .into_iter()
        .fold(BTreeMap::<String, AttendanceTally>::new(), |mut acc, row| {
            overall.record(row.status);
            let key = match group_by {
                GroupBy::Subject => subject_key(row.subject.as_deref()),
                GroupBy::None => ALL_GROUP,
            };
            acc.entry(key.to_string()).or_default().record(row.status);
            acc
        });
    if group_by == GroupBy::None {
        groups.entry(ALL_GROUP.to_string()).or_default();
    }

    AggregateResult {
        group_by,
        groups: groups
            .into_iter()
            .map(|(subject, tally)| GroupStats {
                subject,
                stats: tally.into(),
            })
            .collect(),
        overall: overall.into(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdBand {
    Above,
    Below,
}

pub fn classify(percentage: f64, threshold_percent: f64) -> ThresholdBand {
    if percentage >= threshold_percent {
        ThresholdBand::Above
    } else {
        ThresholdBand::Below
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterStudent {
    pub id: String,
    pub roll_number: String,
    pub full_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAttendance {
    pub student_id: String,
    pub roll_number: String,
    pub full_name: String,
    #[serde(flatten)]
    pub stats: AttendanceStats,
    pub band: ThresholdBand,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassRollup {
    pub threshold_percent: f64,
    pub student_count: usize,
    pub class_average: f64,
    pub above_threshold_count: usize,
    pub below_threshold_count: usize,
    pub students: Vec<StudentAttendance>,
}

/// Mean of the given percentages; 0 for an empty roster.
pub fn class_average<I>(percentages: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    let (sum, n) = percentages
        .into_iter()
        .fold((0.0_f64, 0_usize), |(sum, n), p| (sum + p, n + 1));
    if n > 0 {
        sum / n as f64
    } else {
        0.0
    }
}

/// Per-student report rows for a roster, in roster order.
///
/// Students without any marks stay in the roster at 0% and pull the class
/// average down. Rows for students outside the roster are ignored.
pub fn class_rollup(
    roster: &[RosterStudent],
    rows: &[AttendanceRow],
    threshold_percent: f64,
) -> ClassRollup {
    let mut by_student: HashMap<&str, AttendanceTally> = HashMap::new();
    for row in rows {
        by_student
            .entry(row.student_id.as_str())
            .or_default()
            .record(row.status);
    }

    let students: Vec<StudentAttendance> = roster
        .iter()
        .map(|s| {
            let tally = by_student.get(s.id.as_str()).copied().unwrap_or_default();
            let stats = AttendanceStats::from(tally);
            let band = classify(stats.percentage, threshold_percent);
            StudentAttendance {
                student_id: s.id.clone(),
                roll_number: s.roll_number.clone(),
                full_name: s.full_name.clone(),
                stats,
                band,
            }
        })
        .collect();

    let above = students
        .iter()
        .filter(|s| s.band == ThresholdBand::Above)
        .count();
    ClassRollup {
        threshold_percent,
        student_count: students.len(),
        class_average: class_average(students.iter().map(|s| s.stats.percentage)),
        above_threshold_count: above,
        below_threshold_count: students.len() - above,
        students,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailySummary {
    pub date: String,
    pub total: usize,
    pub present: usize,
    pub absent: usize,
}

pub fn daily_summary(rows: &[AttendanceRow]) -> Vec<DailySummary> {
    let mut by_date: BTreeMap<&str, AttendanceTally> = BTreeMap::new();
    for row in rows {
        by_date.entry(row.date.as_str()).or_default().record(row.status);
    }
    by_date
        .into_iter()
        .map(|(date, t)| DailySummary {
            date: date.to_string(),
            total: t.total,
            present: t.present,
            absent: t.absent,
        })
        .collect()
}

/// Inclusive date bounds; either side may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn new(start: Option<NaiveDate>, end: Option<NaiveDate>) -> AppResult<Self> {
        if let (Some(s), Some(e)) = (start, end) {
            if s > e {
                return Err(AppError::bad_params("startDate must not be after endDate"));
            }
        }
        Ok(DateRange { start, end })
    }

    pub fn month(year: i32, month: u32) -> AppResult<Self> {
        let first = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| AppError::bad_params("year/month out of range"))?;
        let last = first
            .checked_add_months(Months::new(1))
            .and_then(|d| d.pred_opt())
            .ok_or_else(|| AppError::bad_params("year/month out of range"))?;
        Ok(DateRange {
            start: Some(first),
            end: Some(last),
        })
    }

    pub fn push_sql(&self, column: &str, sql: &mut String, binds: &mut Vec<Value>) {
        if let Some(s) = self.start {
            sql.push_str(&format!(" AND {} >= ?", column));
            binds.push(Value::Text(format_date(s)));
        }
        if let Some(e) = self.end {
            sql.push_str(&format!(" AND {} <= ?", column));
            binds.push(Value::Text(format_date(e)));
        }
    }
}

pub fn format_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

pub fn parse_date(raw: &str, key: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| AppError::bad_params(format!("{} must be YYYY-MM-DD", key)))
}

pub fn optional_date(params: &serde_json::Value, key: &str) -> AppResult<Option<NaiveDate>> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(AppError::bad_params(format!("{} must be string or null", key)));
            };
            if s.trim().is_empty() {
                return Ok(None);
            }
            parse_date(s, key).map(Some)
        }
    }
}

pub fn parse_date_range(params: &serde_json::Value) -> AppResult<DateRange> {
    DateRange::new(
        optional_date(params, "startDate")?,
        optional_date(params, "endDate")?,
    )
}

#[derive(Debug, Clone, Copy)]
pub enum RecordScope<'a> {
    Student(&'a str),
    Class(&'a str),
    All,
}

pub fn load_rows(
    conn: &Connection,
    scope: RecordScope<'_>,
    range: &DateRange,
) -> AppResult<Vec<AttendanceRow>> {
    let mut sql = String::from(
        "SELECT student_id, date, period_number, subject, status
         FROM attendance_records
         WHERE 1 = 1",
    );
    let mut binds: Vec<Value> = Vec::new();
    match scope {
        RecordScope::Student(id) => {
            sql.push_str(" AND student_id = ?");
            binds.push(Value::Text(id.to_string()));
        }
        RecordScope::Class(id) => {
            sql.push_str(" AND class_id = ?");
            binds.push(Value::Text(id.to_string()));
        }
        RecordScope::All => {}
    }
    range.push_sql("date", &mut sql, &mut binds);
    sql.push_str(" ORDER BY date DESC, period_number");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(AttendanceRow {
                student_id: r.get(0)?,
                date: r.get(1)?,
                period_number: r.get(2)?,
                subject: r.get(3)?,
                status: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_roster(conn: &Connection, class_id: &str) -> AppResult<Vec<RosterStudent>> {
    let mut stmt = conn.prepare(
        "SELECT id, roll_number, full_name
         FROM students
         WHERE class_id = ?
         ORDER BY roll_number",
    )?;
    let roster = stmt
        .query_map([class_id], |r| {
            Ok(RosterStudent {
                id: r.get(0)?,
                roll_number: r.get(1)?,
                full_name: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(roster)
}

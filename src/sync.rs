//! Row-by-row synchronisation of CSV data into the table-store.

use std::collections::BTreeSet;
use std::io::{BufRead, Write};

use anyhow::Context;
use indicatif::ProgressBar;
use serde_json::{Number, Value};
use tracing::{info, warn};

use crate::models::{Record, ADMISSION_YEAR, CONSOLIDATED_FLAG, REGN_NO, SUBJECT_CODE, YEAR_FLAG};
use crate::nocodb::{count_matching, integral_text, upsert, FilterSyntax, KeyFilter, TableStore, UpsertOutcome};
use crate::reshape::LongRow;
use crate::table::WideTable;

/// Student-detail columns renamed before upload.
const STUDENT_RENAMES: [(&str, &str); 2] = [
    ("SESSION", "YEAR_OF_COMPLETION"),
    ("Cumulative credits", "CUMULATIVE_CREDITS"),
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InputError {
    #[error("YEAR_FLAG must be at least {min} (got {got})")]
    YearFlagTooLow { min: i64, got: i64 },
    #[error("consolidated records must use YEAR_FLAG 0 (got {0})")]
    ConsolidatedYearFlag(i64),
    #[error("consolidated sync requires a '{CONSOLIDATED_FLAG}' column in the CSV")]
    MissingConsolidatedColumn,
    #[error("{rows} row(s) have '{CONSOLIDATED_FLAG}' other than 1")]
    ConsolidatedMismatch { rows: usize },
}

/// Values stamped onto every synced record.
#[derive(Debug, Clone, Copy)]
pub struct SyncContext {
    pub year_flag: i64,
    pub admission_year: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub total: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl SyncReport {
    fn record(&mut self, outcome: &UpsertOutcome) {
        match outcome {
            UpsertOutcome::Created => self.created += 1,
            UpsertOutcome::Updated { .. } => self.updated += 1,
            UpsertOutcome::Skipped { .. } | UpsertOutcome::Unfilterable { .. } => self.skipped += 1,
            UpsertOutcome::Failed { .. } => self.failed += 1,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.created + self.updated
    }
}

pub trait ProgressSink {
    fn advance(&self, done: usize, total: usize);
}

impl ProgressSink for ProgressBar {
    fn advance(&self, done: usize, total: usize) {
        self.set_length(total as u64);
        self.set_position(done as u64);
    }
}

pub trait Confirm {
    fn confirm(&mut self, prompt: &str) -> bool;
}

/// Asks on stdin; anything but `y`/`yes` declines.
pub struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&mut self, prompt: &str) -> bool {
        print!("{prompt} [y/N] ");
        if std::io::stdout().flush().is_err() {
            return false;
        }

        let mut answer = String::new();
        match std::io::stdin().lock().read_line(&mut answer) {
            Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            Err(_) => false,
        }
    }
}

/// Confirmation state for one invocation.
pub struct SyncSession<C: Confirm> {
    confirmer: C,
    assume_yes: bool,
    confirmed: BTreeSet<String>,
}

impl<C: Confirm> SyncSession<C> {
    pub fn new(confirmer: C, assume_yes: bool) -> Self {
        Self {
            confirmer,
            assume_yes,
            confirmed: BTreeSet::new(),
        }
    }

    /// A scope approved once stays approved for the rest of the session.
    pub fn approve(&mut self, scope: &str, prompt: &str) -> bool {
        if self.assume_yes || self.confirmed.contains(scope) {
            return true;
        }

        let approved = self.confirmer.confirm(prompt);
        if approved {
            self.confirmed.insert(scope.to_string());
        }
        approved
    }
}

pub fn validate_year_flag(year_flag: i64, consolidated: bool) -> Result<(), InputError> {
    if consolidated {
        if year_flag != 0 {
            return Err(InputError::ConsolidatedYearFlag(year_flag));
        }
    } else if year_flag < 1 {
        return Err(InputError::YearFlagTooLow {
            min: 1,
            got: year_flag,
        });
    }
    Ok(())
}

/// Validates and renames a student-details table, returning one row per CSV row.
pub fn prepare_student_rows(
    mut table: WideTable,
    consolidated: bool,
) -> Result<Vec<LongRow>, InputError> {
    if consolidated {
        let flags = table
            .column(CONSOLIDATED_FLAG)
            .ok_or(InputError::MissingConsolidatedColumn)?;
        let mismatched = flags
            .iter()
            .filter(|flag| flag.map(integral_text).as_deref() != Some("1"))
            .count();
        if mismatched > 0 {
            return Err(InputError::ConsolidatedMismatch { rows: mismatched });
        }
    }

    for (from, to) in STUDENT_RENAMES {
        table.rename_column(from, to);
    }

    Ok(table
        .rows
        .iter()
        .map(|cells| {
            table
                .headers
                .iter()
                .zip(cells.iter())
                .filter_map(|(header, cell)| cell.as_ref().map(|value| (header.clone(), value.clone())))
                .collect()
        })
        .collect())
}

/// Integer, then float, then text.
pub fn infer_value(raw: &str) -> Value {
    if let Ok(integer) = raw.parse::<i64>() {
        return Value::from(integer);
    }
    if let Some(number) = raw.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(number);
    }
    Value::String(raw.to_string())
}

/// Builds the wire record for one row, with keys in their canonical types.
pub fn coerce_record(row: &LongRow, ctx: &SyncContext) -> Record {
    let mut record = Record::new();
    for (field, raw) in row {
        let value = match field.as_str() {
            REGN_NO | SUBJECT_CODE => Value::String(integral_text(raw)),
            _ => infer_value(raw),
        };
        record.insert(field.clone(), value);
    }

    record.insert(YEAR_FLAG.to_string(), Value::from(ctx.year_flag));
    if let Some(year) = ctx.admission_year {
        record
            .entry(ADMISSION_YEAR.to_string())
            .or_insert_with(|| Value::from(year));
    }
    record
}

/// Counts rows already stored for this context and, when there are any,
/// asks the session whether to continue.
pub async fn preflight<S: TableStore, C: Confirm>(
    store: &S,
    table: &str,
    ctx: &SyncContext,
    session: &mut SyncSession<C>,
) -> anyhow::Result<bool> {
    let mut filter = KeyFilter::new().eq(YEAR_FLAG, ctx.year_flag.to_string());
    if let Some(year) = ctx.admission_year {
        filter = filter.eq(ADMISSION_YEAR, year.to_string());
    }

    let existing = count_matching(store, table, &filter)
        .await
        .with_context(|| format!("failed to check existing rows in {table}"))?;
    if existing == 0 {
        return Ok(true);
    }

    warn!(table, existing, year_flag = ctx.year_flag, "rows already exist for this sync");
    let scope = format!("{table}:{}", filter.render(FilterSyntax::Legacy));
    let prompt = format!(
        "{existing} record(s) already exist in {table} for YEAR_FLAG={}. Concurrent or repeated syncs may duplicate rows. Proceed anyway?",
        ctx.year_flag
    );
    Ok(session.approve(&scope, &prompt))
}

/// Upserts every row, continuing past skips and failures.
pub async fn sync_rows<S, P>(
    store: &S,
    table: &str,
    rows: &[LongRow],
    key_fields: &[&str],
    ctx: &SyncContext,
    progress: &P,
) -> SyncReport
where
    S: TableStore,
    P: ProgressSink + ?Sized,
{
    let total = rows.len();
    let mut report = SyncReport {
        total,
        ..SyncReport::default()
    };

    if total == 0 {
        warn!(table, "no records to process; check that the CSV matches the expected layout");
        return report;
    }

    info!(table, total, "syncing records");
    for (index, row) in rows.iter().enumerate() {
        let record = coerce_record(row, ctx);
        let outcome = upsert(store, table, &record, key_fields).await;
        report.record(&outcome);
        progress.advance(index + 1, total);
    }

    info!(
        table,
        created = report.created,
        updated = report.updated,
        skipped = report.skipped,
        failed = report.failed,
        "sync complete"
    );
    report
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use serde_json::json;

    use super::*;
    use crate::models::{COURSE_KEYS, STUDENT_KEYS};
    use crate::nocodb::fake::MemoryStore;
    use crate::reshape::reshape;

    const COURSES: &str = "student_courses_details";
    const STUDENTS: &str = "student_details";

    #[derive(Default)]
    struct RecordingProgress {
        steps: RefCell<Vec<(usize, usize)>>,
    }

    impl ProgressSink for RecordingProgress {
        fn advance(&self, done: usize, total: usize) {
            self.steps.borrow_mut().push((done, total));
        }
    }

    struct ScriptedConfirm {
        answer: bool,
        asked: usize,
    }

    impl Confirm for ScriptedConfirm {
        fn confirm(&mut self, _prompt: &str) -> bool {
            self.asked += 1;
            self.answer
        }
    }

    fn row(pairs: &[(&str, &str)]) -> LongRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn ctx(year_flag: i64) -> SyncContext {
        SyncContext {
            year_flag,
            admission_year: None,
        }
    }

    fn course_rows(csv: &str) -> Vec<LongRow> {
        reshape(&WideTable::from_reader(csv.as_bytes()).unwrap())
            .unwrap()
            .rows
    }

    #[test]
    fn keys_are_strings_and_metrics_are_typed() {
        let record = coerce_record(
            &row(&[
                ("REGN_NO", "1001"),
                ("SUBJECT_CODE", "101.0"),
                ("Marks", "88"),
                ("GRADE_POINTS", "8.5"),
                ("Grade", "A+"),
                ("YEAR_FLAG", "9"),
            ]),
            &SyncContext {
                year_flag: 2,
                admission_year: Some(2021),
            },
        );

        assert_eq!(record["REGN_NO"], json!("1001"));
        assert_eq!(record["SUBJECT_CODE"], json!("101"));
        assert_eq!(record["Marks"], json!(88));
        assert_eq!(record["GRADE_POINTS"], json!(8.5));
        assert_eq!(record["Grade"], json!("A+"));
        assert_eq!(record["YEAR_FLAG"], json!(2));
        assert_eq!(record["ADMISSION_YEAR"], json!(2021));
    }

    #[tokio::test]
    async fn course_csv_lands_as_one_row_per_subject() {
        let store = MemoryStore::default();
        let rows = course_rows(
            "REGN_NO,SUB1,SUB1NM,SUB1_TOT,SUB1_GRADE,SUB2,SUB2NM,SUB2_TOT,SUB2_GRADE\n\
             AU21UG-001,101,Maths,88,A,102,Physics,75,B\n",
        );
        let progress = RecordingProgress::default();

        let report = sync_rows(&store, COURSES, &rows, &COURSE_KEYS, &ctx(1), &progress).await;
        assert_eq!(report.created, 2);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(*progress.steps.borrow(), vec![(1, 2), (2, 2)]);

        let stored = store.rows(COURSES);
        assert!(stored
            .iter()
            .all(|row| row["REGN_NO"].is_string() && row["SUBJECT_CODE"].is_string()));
        assert_eq!(stored[1]["SUBJECT_NAME"], json!("Physics"));
        assert_eq!(stored[1]["Marks"], json!(75));

        let regraded = course_rows(
            "REGN_NO,SUB1,SUB1NM,SUB1_TOT,SUB1_GRADE,SUB2,SUB2NM,SUB2_TOT,SUB2_GRADE\n\
             AU21UG-001,101,Maths,91,O,102,Physics,75,B\n",
        );
        let report =
            sync_rows(&store, COURSES, &regraded, &COURSE_KEYS, &ctx(1), &progress).await;
        assert_eq!(report.updated, 2);

        let stored = store.rows(COURSES);
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0]["Grade"], json!("O"));
    }

    #[tokio::test]
    async fn keyless_rows_are_skipped_and_failures_do_not_stop_the_batch() {
        let store = MemoryStore::default();
        store.fail_for("AU21UG-002");
        let rows = vec![
            row(&[("REGN_NO", "AU21UG-001"), ("SUBJECT_NAME", "Seminar")]),
            row(&[("REGN_NO", "AU21UG-002"), ("SUBJECT_CODE", "101")]),
            row(&[("REGN_NO", "AU21UG-003"), ("SUBJECT_CODE", "101")]),
            row(&[("REGN_NO", "AU21UG-004"), ("SUBJECT_CODE", "CS101,CS102")]),
        ];

        let report = sync_rows(
            &store,
            COURSES,
            &rows,
            &COURSE_KEYS,
            &ctx(1),
            &ProgressBar::hidden(),
        )
        .await;

        assert_eq!(
            report,
            SyncReport {
                total: 4,
                created: 1,
                updated: 0,
                skipped: 2,
                failed: 1,
            }
        );
        assert_eq!(store.rows(COURSES).len(), 1);
    }

    #[tokio::test]
    async fn zero_rows_is_a_no_op() {
        let store = MemoryStore::default();
        let report = sync_rows(
            &store,
            STUDENTS,
            &[],
            &STUDENT_KEYS,
            &ctx(1),
            &ProgressBar::hidden(),
        )
        .await;

        assert_eq!(report.total, 0);
        assert_eq!(store.call_count(), 0);
    }

    #[tokio::test]
    async fn preflight_asks_only_when_rows_exist() {
        let store = MemoryStore::default();
        let mut session = SyncSession::new(
            ScriptedConfirm {
                answer: false,
                asked: 0,
            },
            false,
        );

        assert!(preflight(&store, STUDENTS, &ctx(1), &mut session).await.unwrap());
        assert_eq!(session.confirmer.asked, 0);

        store.insert(
            STUDENTS,
            json!({"REGN_NO": "AU21UG-001", "YEAR_FLAG": 1})
                .as_object()
                .cloned()
                .unwrap(),
        );
        assert!(!preflight(&store, STUDENTS, &ctx(1), &mut session).await.unwrap());
        assert_eq!(session.confirmer.asked, 1);

        let mut assumed = SyncSession::new(
            ScriptedConfirm {
                answer: false,
                asked: 0,
            },
            true,
        );
        assert!(preflight(&store, STUDENTS, &ctx(1), &mut assumed).await.unwrap());
        assert_eq!(assumed.confirmer.asked, 0);
    }

    #[test]
    fn approved_scope_is_remembered() {
        let mut session = SyncSession::new(
            ScriptedConfirm {
                answer: true,
                asked: 0,
            },
            false,
        );
        assert!(session.approve("student_details:1", "proceed?"));
        assert!(session.approve("student_details:1", "proceed?"));
        assert_eq!(session.confirmer.asked, 1);
    }

    #[test]
    fn year_flag_rules() {
        assert!(validate_year_flag(1, false).is_ok());
        assert_eq!(
            validate_year_flag(0, false),
            Err(InputError::YearFlagTooLow { min: 1, got: 0 })
        );
        assert!(validate_year_flag(0, true).is_ok());
        assert_eq!(
            validate_year_flag(2, true),
            Err(InputError::ConsolidatedYearFlag(2))
        );
    }

    #[test]
    fn consolidated_csv_must_flag_every_row() {
        let missing = WideTable::from_reader("REGN_NO\nAU21UG-001\n".as_bytes()).unwrap();
        assert_eq!(
            prepare_student_rows(missing, true),
            Err(InputError::MissingConsolidatedColumn)
        );

        let mixed = WideTable::from_reader(
            "REGN_NO,consolidated_grade_card_flag\nAU21UG-001,1\nAU21UG-002,0\nAU21UG-003,\n"
                .as_bytes(),
        )
        .unwrap();
        assert_eq!(
            prepare_student_rows(mixed, true),
            Err(InputError::ConsolidatedMismatch { rows: 2 })
        );

        let ok = WideTable::from_reader(
            "REGN_NO,consolidated_grade_card_flag\nAU21UG-001,1.0\n".as_bytes(),
        )
        .unwrap();
        assert_eq!(prepare_student_rows(ok, true).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn student_rows_are_renamed_and_stamped() {
        let table = WideTable::from_reader(
            "REGN_NO,CNAME,SESSION,Cumulative credits,CGPA\nAU21UG-001,Avery,2025,120,8.21\n,Nobody,,,\n"
                .as_bytes(),
        )
        .unwrap();
        let rows = prepare_student_rows(table, false).unwrap();
        assert_eq!(rows[0]["YEAR_OF_COMPLETION"], "2025");
        assert_eq!(rows[0]["CUMULATIVE_CREDITS"], "120");

        let store = MemoryStore::default();
        let report = sync_rows(
            &store,
            STUDENTS,
            &rows,
            &STUDENT_KEYS,
            &ctx(3),
            &ProgressBar::hidden(),
        )
        .await;
        assert_eq!(report.created, 1);
        assert_eq!(report.skipped, 1);

        let stored = store.rows(STUDENTS);
        assert_eq!(stored[0]["YEAR_FLAG"], json!(3));
        assert_eq!(stored[0]["CGPA"], json!(8.21));
    }
}

use std::cmp::Ordering;

use anyhow::Context;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, warn};

use crate::config::{STUDENT_COURSES_TABLE, STUDENT_DETAILS_TABLE};
use crate::models::{CourseRow, StudentFilter, StudentRow};

pub async fn connect(database_url: &str) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

/// Double-quoted identifier with embedded quotes doubled.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn table_ref(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

#[derive(Debug, Clone, PartialEq)]
enum Bind {
    Int(i64),
    Text(String),
}

/// Columns are read through `to_jsonb` so optional columns may be absent
/// and every value arrives as text.
fn student_query(schema: &str, filter: &StudentFilter) -> (String, Vec<Bind>) {
    let mut query = format!(
        "SELECT to_jsonb(s) ->> 'REGN_NO' AS regn_no, \
         to_jsonb(s) ->> 'CNAME' AS name, \
         to_jsonb(s) ->> 'ACADEMIC_COURSE_ID' AS program_code, \
         to_jsonb(s) ->> 'COURSE_NAME' AS course_name, \
         to_jsonb(s) ->> 'ADMISSION_YEAR' AS admission_year, \
         to_jsonb(s) ->> 'YEAR_OF_COMPLETION' AS year_of_completion, \
         to_jsonb(s) ->> 'TOT_CREDIT' AS total_credit, \
         to_jsonb(s) ->> 'CUMULATIVE_CREDITS' AS cumulative_credits, \
         to_jsonb(s) ->> 'CGPA' AS cgpa \
         FROM {} s WHERE TRUE",
        table_ref(schema, STUDENT_DETAILS_TABLE)
    );
    let mut binds = Vec::new();

    if let Some(year_flag) = filter.year_flag {
        binds.push(Bind::Int(year_flag));
        query.push_str(&format!(" AND s.\"YEAR_FLAG\"::bigint = ${}", binds.len()));
    }
    if let Some(admission_year) = filter.admission_year {
        binds.push(Bind::Int(admission_year));
        query.push_str(&format!(" AND s.\"ADMISSION_YEAR\"::bigint = ${}", binds.len()));
    }
    if let Some(regn_no) = filter.regn_no.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        binds.push(Bind::Text(regn_no.to_string()));
        query.push_str(&format!(" AND s.\"REGN_NO\"::text = ${}", binds.len()));
    }
    if let Some(program) = filter.program_code.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        binds.push(Bind::Text(program.to_string()));
        query.push_str(&format!(" AND s.\"ACADEMIC_COURSE_ID\"::text = ${}", binds.len()));
    }
    if filter.consolidated_only {
        query.push_str(" AND s.\"consolidated_grade_card_flag\"::numeric = 1");
    }

    query.push_str(" ORDER BY regn_no");
    (query, binds)
}

const COURSE_COLUMNS: &str = "to_jsonb(c) ->> 'SUBJECT_CODE' AS subject_code, \
     to_jsonb(c) ->> 'SUBJECT_NAME' AS subject_name, \
     to_jsonb(c) ->> 'CREDIT' AS credit, \
     to_jsonb(c) ->> 'Grade' AS grade, \
     to_jsonb(c) ->> 'Month_Year_Completion' AS month_year_completion, \
     to_jsonb(c) ->> 'Academic_Year' AS academic_year, \
     to_jsonb(c) ->> 'Academic_Month' AS academic_month";

fn student_from_row(row: &PgRow) -> Result<Option<StudentRow>, sqlx::Error> {
    let Some(regn_no) = row.try_get::<Option<String>, _>("regn_no")? else {
        return Ok(None);
    };

    Ok(Some(StudentRow {
        regn_no,
        name: row.try_get("name")?,
        program_code: row.try_get("program_code")?,
        course_name: row.try_get("course_name")?,
        admission_year: row.try_get("admission_year")?,
        year_of_completion: row.try_get("year_of_completion")?,
        total_credit: row.try_get("total_credit")?,
        cumulative_credits: row.try_get("cumulative_credits")?,
        cgpa: row.try_get("cgpa")?,
    }))
}

fn course_from_row(row: &PgRow) -> Result<CourseRow, sqlx::Error> {
    Ok(CourseRow {
        subject_code: row.try_get("subject_code")?,
        subject_name: row.try_get("subject_name")?,
        credit: row.try_get("credit")?,
        grade: row.try_get("grade")?,
        month_year_completion: row.try_get("month_year_completion")?,
        academic_year: row.try_get("academic_year")?,
        academic_month: row.try_get("academic_month")?,
    })
}

pub async fn fetch_students(
    pool: &PgPool,
    schema: &str,
    filter: &StudentFilter,
) -> anyhow::Result<Vec<StudentRow>> {
    let (query, binds) = student_query(schema, filter);
    debug!(%query, "fetching students");

    let mut rows = sqlx::query(&query);
    for bind in binds {
        rows = match bind {
            Bind::Int(value) => rows.bind(value),
            Bind::Text(value) => rows.bind(value),
        };
    }

    let records = rows
        .fetch_all(pool)
        .await
        .context("failed to fetch student details")?;

    let mut students = Vec::new();
    for row in &records {
        match student_from_row(row)? {
            Some(student) => students.push(student),
            None => warn!("skipping student record without REGN_NO"),
        }
    }
    Ok(students)
}

/// Courses for one semester, ordered by subject code.
pub async fn fetch_semester_courses(
    pool: &PgPool,
    schema: &str,
    regn_no: &str,
    year_flag: i64,
) -> anyhow::Result<Vec<CourseRow>> {
    let query = format!(
        "SELECT {COURSE_COLUMNS} FROM {} c \
         WHERE c.\"REGN_NO\"::text = $1 AND c.\"YEAR_FLAG\"::bigint = $2 \
         ORDER BY subject_code",
        table_ref(schema, STUDENT_COURSES_TABLE)
    );

    let records = sqlx::query(&query)
        .bind(regn_no)
        .bind(year_flag)
        .fetch_all(pool)
        .await
        .with_context(|| format!("failed to fetch courses for {regn_no}"))?;

    records
        .iter()
        .map(course_from_row)
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .map_err(Into::into)
}

/// Every distinct course the student has taken, in chronological order.
pub async fn fetch_transcript_courses(
    pool: &PgPool,
    schema: &str,
    regn_no: &str,
) -> anyhow::Result<Vec<CourseRow>> {
    let query = format!(
        "SELECT DISTINCT {COURSE_COLUMNS} FROM {} c \
         JOIN {} s ON c.\"REGN_NO\" = s.\"REGN_NO\" \
         WHERE s.\"REGN_NO\"::text = $1",
        table_ref(schema, STUDENT_COURSES_TABLE),
        table_ref(schema, STUDENT_DETAILS_TABLE)
    );

    let records = sqlx::query(&query)
        .bind(regn_no)
        .fetch_all(pool)
        .await
        .with_context(|| format!("failed to fetch transcript courses for {regn_no}"))?;

    let mut courses = records
        .iter()
        .map(course_from_row)
        .collect::<Result<Vec<_>, _>>()?;
    sort_chronologically(&mut courses);
    Ok(courses)
}

/// Student and course rows for rendering.
pub trait RecordSource {
    async fn students(&self, filter: &StudentFilter) -> anyhow::Result<Vec<StudentRow>>;

    async fn semester_courses(&self, regn_no: &str, year_flag: i64) -> anyhow::Result<Vec<CourseRow>>;

    async fn transcript_courses(&self, regn_no: &str) -> anyhow::Result<Vec<CourseRow>>;
}

/// The Postgres database behind the table-store.
pub struct PgRecords<'a> {
    pool: &'a PgPool,
    schema: &'a str,
}

impl<'a> PgRecords<'a> {
    pub fn new(pool: &'a PgPool, schema: &'a str) -> Self {
        Self { pool, schema }
    }
}

impl RecordSource for PgRecords<'_> {
    async fn students(&self, filter: &StudentFilter) -> anyhow::Result<Vec<StudentRow>> {
        fetch_students(self.pool, self.schema, filter).await
    }

    async fn semester_courses(&self, regn_no: &str, year_flag: i64) -> anyhow::Result<Vec<CourseRow>> {
        fetch_semester_courses(self.pool, self.schema, regn_no, year_flag).await
    }

    async fn transcript_courses(&self, regn_no: &str) -> anyhow::Result<Vec<CourseRow>> {
        fetch_transcript_courses(self.pool, self.schema, regn_no).await
    }
}

fn numeric(value: Option<&str>) -> Option<f64> {
    value.and_then(|text| text.trim().parse::<f64>().ok())
}

/// Academic year then month, numerically; rows without a parseable value go last.
pub fn sort_chronologically(courses: &mut [CourseRow]) {
    fn key(course: &CourseRow) -> (Option<f64>, Option<f64>) {
        (
            numeric(course.academic_year.as_deref()),
            numeric(course.academic_month.as_deref()),
        )
    }

    fn compare(a: Option<f64>, b: Option<f64>) -> Ordering {
        match (a, b) {
            (Some(a), Some(b)) => a.total_cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }

    courses.sort_by(|a, b| {
        let (a_year, a_month) = key(a);
        let (b_year, b_month) = key(b);
        compare(a_year, b_year)
            .then_with(|| compare(a_month, b_month))
            .then_with(|| a.subject_code.cmp(&b.subject_code))
    });
}

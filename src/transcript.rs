//! Consolidated transcripts: HTML from a template, converted to PDF by an
//! external engine.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{Local, NaiveDate};
use minijinja::{context, AutoEscape, Environment};
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::archive::ObjectStore;
use crate::config::Config;
use crate::db::RecordSource;
use crate::models::{
    compute_cgpa, program_display, transcript_number, CourseRow, DocumentKind, RenderSummary,
    StudentFilter, StudentRow,
};
use crate::nocodb::{integral_text, TableStore};
use crate::photo::{self, Photo};
use crate::render::{bounded_bar, output_path, RenderError, Uploader};

pub const DEFAULT_TEMPLATE: &str = include_str!("../templates/transcript.html");
pub const DEFAULT_STYLES: &str = include_str!("../templates/transcript.css");

const PROGRAM_DURATION_YEARS: u32 = 4;
const MEDIUM_OF_INSTRUCTION: &str = "English";

#[derive(Debug, Clone, Serialize)]
pub struct Institution {
    pub name: &'static str,
    pub address: &'static str,
    pub established: &'static str,
    pub logo_url: String,
}

impl Institution {
    pub fn new(logo_url: String) -> Self {
        Self {
            name: "ATRIA UNIVERSITY",
            address: "ASKB Campus, 1st Main Road, Anandnagar, Hebbal, Bengaluru-560024",
            established: "(Established Under Karnataka Act No. 22 of 2021)",
            logo_url,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TranscriptCourse {
    pub sl_no: usize,
    pub code: String,
    pub title: String,
    pub credits: String,
    pub grade: String,
    pub completed: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CourseRowPair {
    pub left: Option<TranscriptCourse>,
    pub right: Option<TranscriptCourse>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptStudent {
    pub name: String,
    pub regn_no: String,
    pub transcript_number: String,
    pub year_of_admission: String,
    pub year_of_completion: String,
    pub program_of_study: String,
    pub duration_of_program: u32,
    pub medium_of_instruction: &'static str,
    pub date_of_issue: String,
    pub cgpa: String,
    pub total_credits: String,
    pub photo_url: String,
}

/// Left column gets the extra course when the count is odd.
pub fn split_columns<T>(items: &[T]) -> (&[T], &[T]) {
    items.split_at(items.len().div_ceil(2))
}

pub fn number_courses(courses: &[CourseRow]) -> Vec<TranscriptCourse> {
    courses
        .iter()
        .enumerate()
        .map(|(index, course)| TranscriptCourse {
            sl_no: index + 1,
            code: course.subject_code.clone().unwrap_or_default(),
            title: course.subject_name.clone().unwrap_or_default(),
            credits: course.credit.as_deref().map(integral_text).unwrap_or_default(),
            grade: course.grade.clone().unwrap_or_default(),
            completed: course.month_year_completion.clone().unwrap_or_default(),
        })
        .collect()
}

/// Pairs the two columns row by row for the table body.
pub fn paired_rows(courses: &[TranscriptCourse]) -> Vec<CourseRowPair> {
    let (left, right) = split_columns(courses);
    (0..left.len())
        .map(|row| CourseRowPair {
            left: left.get(row).cloned(),
            right: right.get(row).cloned(),
        })
        .collect()
}

fn or_na(value: Option<&str>) -> String {
    value.map(integral_text).unwrap_or_else(|| "N/A".into())
}

pub fn transcript_student(
    student: &StudentRow,
    courses: &[CourseRow],
    issued_on: NaiveDate,
    photo_url: String,
) -> TranscriptStudent {
    let (computed_cgpa, computed_credits) = compute_cgpa(courses);
    TranscriptStudent {
        name: student.display_name().to_string(),
        regn_no: student.regn_no.clone(),
        transcript_number: transcript_number(&student.regn_no),
        year_of_admission: or_na(student.admission_year.as_deref()),
        year_of_completion: or_na(student.year_of_completion.as_deref()),
        program_of_study: program_display(student, DocumentKind::Transcript),
        duration_of_program: PROGRAM_DURATION_YEARS,
        medium_of_instruction: MEDIUM_OF_INSTRUCTION,
        date_of_issue: issued_on.format("%B %d, %Y").to_string(),
        cgpa: student
            .cgpa
            .clone()
            .unwrap_or_else(|| format!("{computed_cgpa:.2}")),
        total_credits: student
            .total_credit
            .as_deref()
            .map(integral_text)
            .unwrap_or_else(|| format!("{computed_credits}")),
        photo_url,
    }
}

pub struct TranscriptTemplate {
    env: Environment<'static>,
    source: String,
}

impl TranscriptTemplate {
    pub fn new(source: String) -> Self {
        let mut env = Environment::new();
        env.set_auto_escape_callback(|_| AutoEscape::Html);
        Self { env, source }
    }

    pub fn render(
        &self,
        institution: &Institution,
        student: &TranscriptStudent,
        courses: &[TranscriptCourse],
    ) -> Result<String, RenderError> {
        Ok(self.env.render_str(
            &self.source,
            context! {
                institution => institution,
                student => student,
                rows => paired_rows(courses),
            },
        )?)
    }
}

/// HTML-to-PDF conversion.
pub trait PdfEngine {
    async fn convert(&self, html: &Path, styles: &Path, output: &Path) -> Result<(), RenderError>;
}

/// Runs `<program> <html> <output> -s <styles>` (the weasyprint command line).
pub struct CommandEngine {
    program: String,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl PdfEngine for CommandEngine {
    async fn convert(&self, html: &Path, styles: &Path, output: &Path) -> Result<(), RenderError> {
        let result = Command::new(&self.program)
            .arg(html)
            .arg(output)
            .arg("-s")
            .arg(styles)
            .output()
            .await
            .map_err(|err| RenderError::Engine {
                engine: self.program.clone(),
                detail: err.to_string(),
            })?;

        if result.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&result.stderr);
            Err(RenderError::Engine {
                engine: self.program.clone(),
                detail: format!("{}: {}", result.status, stderr.trim()),
            })
        }
    }
}

fn file_url(path: &Path) -> Option<String> {
    std::fs::canonicalize(path)
        .ok()
        .map(|absolute| format!("file://{}", absolute.display()))
}

async fn read_override(path: Option<&PathBuf>, default: &str, label: &str) -> anyhow::Result<String> {
    match path {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {label} {}", path.display())),
        None => Ok(default.to_string()),
    }
}

async fn write_photo(photo: &Photo, path: &Path) -> Result<(), RenderError> {
    let png = {
        let mut bytes = std::io::Cursor::new(Vec::new());
        image::write_buffer_with_format(
            &mut bytes,
            &photo.rgb,
            photo.width,
            photo.height,
            image::ColorType::Rgb8,
            image::ImageOutputFormat::Png,
        )
        .map_err(|err| RenderError::io(path, std::io::Error::other(err)))?;
        bytes.into_inner()
    };
    tokio::fs::write(path, png)
        .await
        .map_err(|err| RenderError::io(path, err))
}

#[derive(Debug, Clone, Default)]
pub struct TranscriptRequest {
    pub regn_no: Option<String>,
    pub program: Option<String>,
    pub admission_year: Option<i64>,
}

impl TranscriptRequest {
    fn filter(&self) -> StudentFilter {
        StudentFilter {
            year_flag: None,
            admission_year: self.admission_year,
            regn_no: self.regn_no.clone(),
            program_code: self.program.clone(),
            consolidated_only: true,
        }
    }
}

/// Generates one transcript per consolidated student.
pub async fn generate_transcripts<R, S, E, O>(
    records: &R,
    config: &Config,
    store: &S,
    engine: &E,
    uploader: Option<&Uploader<'_, O>>,
    request: &TranscriptRequest,
) -> anyhow::Result<RenderSummary>
where
    R: RecordSource,
    S: TableStore,
    E: PdfEngine,
    O: ObjectStore,
{
    let template = TranscriptTemplate::new(
        read_override(config.assets.transcript_template.as_ref(), DEFAULT_TEMPLATE, "transcript template").await?,
    );
    let styles = read_override(config.assets.transcript_styles.as_ref(), DEFAULT_STYLES, "transcript styles").await?;

    let logo_url = file_url(&config.assets.university_logo).unwrap_or_else(|| {
        warn!(path = %config.assets.university_logo.display(), "university logo not found");
        String::new()
    });
    let institution = Institution::new(logo_url);

    let mut summary = RenderSummary {
        batch: uploader.map(|u| u.batch().to_string()),
        ..RenderSummary::default()
    };

    let students = records.students(&request.filter()).await?;
    summary.students = students.len();
    if students.is_empty() {
        info!("no data: no consolidated students match the filters");
        return Ok(summary);
    }

    tokio::fs::create_dir_all(&config.transcript_out_dir)
        .await
        .with_context(|| format!("failed to create {}", config.transcript_out_dir.display()))?;
    let workdir = tempfile::tempdir().context("failed to create a working directory")?;
    let styles_path = workdir.path().join("transcript.css");
    tokio::fs::write(&styles_path, styles)
        .await
        .with_context(|| format!("failed to write {}", styles_path.display()))?;

    let http = photo::http_client()?;
    let issued_on = Local::now().date_naive();
    let progress = bounded_bar(students.len() as u64, "transcripts");

    for student in &students {
        let span = info_span!("transcript", regn_no = %student.regn_no);
        let outcome = async {
            let courses = records.transcript_courses(&student.regn_no).await?;
            anyhow::ensure!(!courses.is_empty(), "no course data");

            let stem = student.regn_no.replace('/', "_");
            let url = photo::photo_url(store, &config.nocodb.photo_field, &student.regn_no).await;
            let photo = photo::load_photo(&http, url.as_deref(), &config.assets.photo_dir, &student.regn_no).await;
            debug!(source = ?photo.source, "photo resolved");
            let photo_path = workdir.path().join(format!("{stem}.png"));
            write_photo(&photo, &photo_path).await?;

            let details = transcript_student(
                student,
                &courses,
                issued_on,
                file_url(&photo_path).unwrap_or_default(),
            );
            let html = template.render(&institution, &details, &number_courses(&courses))?;
            let html_path = workdir.path().join(format!("{stem}.html"));
            tokio::fs::write(&html_path, html)
                .await
                .map_err(|err| RenderError::io(&html_path, err))?;

            let path = output_path(&config.transcript_out_dir, student, DocumentKind::Transcript);
            engine.convert(&html_path, &styles_path, &path).await?;
            debug!(courses = courses.len(), "transcript converted");
            Ok::<_, anyhow::Error>(path)
        }
        .instrument(span)
        .await;

        match outcome {
            Ok(path) => {
                info!(regn_no = %student.regn_no, path = %path.display(), "transcript generated");
                summary.generated += 1;
                if let Some(uploader) = uploader {
                    uploader
                        .archive(DocumentKind::Transcript, &path, student, &mut summary)
                        .await;
                }
            }
            Err(err) => {
                warn!(regn_no = %student.regn_no, error = %err, "transcript skipped");
                summary.skipped += 1;
            }
        }
        progress.inc(1);
    }

    progress.finish_and_clear();
    Ok(summary)
}

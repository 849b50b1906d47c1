use clap::ValueEnum;
use serde::Serialize;
use tracing::warn;

pub const REGN_NO: &str = "REGN_NO";
pub const YEAR_FLAG: &str = "YEAR_FLAG";
pub const ADMISSION_YEAR: &str = "ADMISSION_YEAR";
pub const SUBJECT_CODE: &str = "SUBJECT_CODE";
pub const SUBJECT_NAME: &str = "SUBJECT_NAME";
pub const CONSOLIDATED_FLAG: &str = "consolidated_grade_card_flag";

pub const STUDENT_KEYS: [&str; 2] = [REGN_NO, YEAR_FLAG];
pub const COURSE_KEYS: [&str; 3] = [REGN_NO, YEAR_FLAG, SUBJECT_CODE];

/// A table-store row as sent over the wire.
pub type Record = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DocumentKind {
    #[value(name = "gradecards")]
    GradeCard,
    #[value(name = "transcripts")]
    Transcript,
}

impl DocumentKind {
    pub fn folder(self) -> &'static str {
        match self {
            DocumentKind::GradeCard => "gradecards",
            DocumentKind::Transcript => "transcripts",
        }
    }

    pub fn file_label(self) -> &'static str {
        match self {
            DocumentKind::GradeCard => "GradeCard",
            DocumentKind::Transcript => "Transcript",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StudentRow {
    pub regn_no: String,
    pub name: Option<String>,
    pub program_code: Option<String>,
    pub course_name: Option<String>,
    pub admission_year: Option<String>,
    pub year_of_completion: Option<String>,
    pub total_credit: Option<String>,
    pub cumulative_credits: Option<String>,
    pub cgpa: Option<String>,
}

impl StudentRow {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("N/A")
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CourseRow {
    pub subject_code: Option<String>,
    pub subject_name: Option<String>,
    pub credit: Option<String>,
    pub grade: Option<String>,
    pub month_year_completion: Option<String>,
    pub academic_year: Option<String>,
    pub academic_month: Option<String>,
}

/// Filters shared by both renderers; `None` means unfiltered.
#[derive(Debug, Clone, Default)]
pub struct StudentFilter {
    pub year_flag: Option<i64>,
    pub admission_year: Option<i64>,
    pub regn_no: Option<String>,
    pub program_code: Option<String>,
    pub consolidated_only: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RenderSummary {
    pub batch: Option<String>,
    pub students: usize,
    pub generated: usize,
    pub skipped: usize,
    pub uploaded: usize,
    pub upload_failures: usize,
}

/// `AU21UG-001` becomes `AU/21/UG/001`.
pub fn transcript_number(regn_no: &str) -> String {
    let chars: Vec<char> = regn_no.chars().collect();
    let cohort: String = chars.iter().skip(2).take(2).collect();
    let serial: String = chars[chars.len().saturating_sub(3)..].iter().collect();
    format!("AU/{cohort}/UG/{serial}")
}

pub fn program_name(code: &str, kind: DocumentKind) -> Option<&'static str> {
    let name = match (code, kind) {
        ("FOU", DocumentKind::GradeCard) => "Foundation Year",
        ("FOU", DocumentKind::Transcript) => "Undergraduate Degree",
        ("BDes", DocumentKind::GradeCard) => "B-Design",
        ("BDes", DocumentKind::Transcript) => "BDesign",
        ("LS", _) => "Life Sciences",
        ("ES", _) => "Energy Sciences",
        ("eMob" | "eMobility", _) => "e-Mobility",
        ("IT", _) => "Interactive Technologies",
        ("DT", DocumentKind::GradeCard) => "Digital Transformation",
        ("DT", DocumentKind::Transcript) => "BTech Digital Transformation",
        ("BBA", _) => "BBA",
        _ => return None,
    };
    Some(name)
}

/// Program display name, falling back to `COURSE_NAME` and then the raw code.
pub fn program_display(student: &StudentRow, kind: DocumentKind) -> String {
    let code = student.program_code.as_deref().unwrap_or_default();
    if let Some(name) = program_name(code, kind) {
        return name.to_string();
    }

    warn!(regn_no = %student.regn_no, program_code = code, "unmapped program code");
    student
        .course_name
        .clone()
        .filter(|name| !name.is_empty())
        .or_else(|| (!code.is_empty()).then(|| code.to_string()))
        .unwrap_or_else(|| "N/A".to_string())
}

pub fn grade_point(grade: &str) -> Option<f64> {
    let points = match grade.trim() {
        "O" => 10.0,
        "A+" => 9.0,
        "A" => 8.0,
        "B+" => 7.0,
        "B" => 6.0,
        "C+" => 5.0,
        "C" => 4.0,
        "D" => 3.0,
        "F" => 0.0,
        "S" => 10.0,
        "AP" => 8.0,
        _ => return None,
    };
    Some(points)
}

/// Credit-weighted grade point average over courses with a known grade.
/// Returns `(cgpa rounded to 2 places, credits counted)`.
pub fn compute_cgpa(courses: &[CourseRow]) -> (f64, f64) {
    let mut total_credits = 0.0;
    let mut total_points = 0.0;

    for course in courses {
        let credits = course
            .credit
            .as_deref()
            .and_then(|value| value.trim().parse::<f64>().ok());
        let points = course.grade.as_deref().and_then(grade_point);
        if let (Some(credits), Some(points)) = (credits, points) {
            total_credits += credits;
            total_points += credits * points;
        }
    }

    if total_credits > 0.0 {
        (((total_points / total_credits) * 100.0).round() / 100.0, total_credits)
    } else {
        (0.0, 0.0)
    }
}

/// Safe form of a name for file names and object keys.
pub fn safe_name(name: &str) -> String {
    name.replace(' ', "_").replace('.', "").replace('/', "_")
}

pub fn output_file_name(regn_no: &str, name: &str, kind: DocumentKind) -> String {
    format!(
        "{}_{}_{}.pdf",
        regn_no.replace('/', "_"),
        safe_name(name),
        kind.file_label()
    )
}

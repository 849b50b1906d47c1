use std::path::PathBuf;

use anyhow::Context;

use crate::nocodb::FilterSyntax;

pub const STUDENT_DETAILS_TABLE: &str = "student_details";
pub const STUDENT_COURSES_TABLE: &str = "student_courses_details";

#[derive(Debug, Clone)]
pub struct NocoDbConfig {
    pub api_base: String,
    pub api_token: String,
    pub schema: String,
    pub filter_syntax: FilterSyntax,
    pub photo_field: String,
}

#[derive(Debug, Clone)]
pub struct R2Config {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
}

#[derive(Debug, Clone)]
pub struct AssetPaths {
    pub photo_dir: PathBuf,
    pub grade_card_template: PathBuf,
    pub grade_point_table: PathBuf,
    pub transcript_template: Option<PathBuf>,
    pub transcript_styles: Option<PathBuf>,
    pub university_logo: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub nocodb: NocoDbConfig,
    pub assets: AssetPaths,
    pub pdf_engine: String,
    pub gradecard_out_dir: PathBuf,
    pub transcript_out_dir: PathBuf,
}

impl Config {
    /// Reads every setting that does not require a remote connection.
    ///
    /// Database and object-storage credentials are read by
    /// [`database_url`] and [`R2Config::from_env`] only when an action needs them.
    pub fn from_env() -> anyhow::Result<Self> {
        let filter_syntax = match optional("NOCODB_FILTER_SYNTAX") {
            Some(value) => value.parse()?,
            None => FilterSyntax::Legacy,
        };

        let nocodb = NocoDbConfig {
            api_base: required("NOCODB_API_BASE")?
                .trim_end_matches('/')
                .to_string(),
            api_token: required("NOCODB_API_TOKEN")?,
            schema: optional("NOCODB_SCHEMA").unwrap_or_else(|| "public".to_string()),
            filter_syntax,
            photo_field: optional("NOCODB_PHOTO_FIELD").unwrap_or_else(|| "PHOTO".to_string()),
        };

        let assets_dir = PathBuf::from(optional("ASSETS_DIR").unwrap_or_else(|| "assets".into()));
        let assets = AssetPaths {
            photo_dir: optional("PHOTO_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| assets_dir.join("student_photos")),
            grade_card_template: optional("GRADE_CARD_TEMPLATE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("Grade Card Template.pdf")),
            grade_point_table: optional("GRADE_POINT_TABLE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("Grade Point Table.pdf")),
            transcript_template: optional("TRANSCRIPT_TEMPLATE").map(PathBuf::from),
            transcript_styles: optional("TRANSCRIPT_STYLES").map(PathBuf::from),
            university_logo: assets_dir.join("AU logo.png"),
        };

        Ok(Self {
            nocodb,
            assets,
            pdf_engine: optional("PDF_ENGINE").unwrap_or_else(|| "weasyprint".to_string()),
            gradecard_out_dir: PathBuf::from(
                optional("GRADECARD_OUT_DIR").unwrap_or_else(|| "gradecards".into()),
            ),
            transcript_out_dir: PathBuf::from(
                optional("TRANSCRIPT_OUT_DIR").unwrap_or_else(|| "transcripts".into()),
            ),
        })
    }
}

#[cfg(test)]
impl Config {
    /// Every path under `root`; the table-store settings are placeholders.
    pub fn rooted_at(root: &std::path::Path) -> Self {
        Self {
            nocodb: NocoDbConfig {
                api_base: "http://localhost:8080/api/v1/db/data/noco/p1".into(),
                api_token: "test-token".into(),
                schema: "public".into(),
                filter_syntax: FilterSyntax::Legacy,
                photo_field: "PHOTO".into(),
            },
            assets: AssetPaths {
                photo_dir: root.join("photos"),
                grade_card_template: root.join("template.pdf"),
                grade_point_table: root.join("grade_points.pdf"),
                transcript_template: None,
                transcript_styles: None,
                university_logo: root.join("logo.png"),
            },
            pdf_engine: "weasyprint".into(),
            gradecard_out_dir: root.join("gradecards"),
            transcript_out_dir: root.join("transcripts"),
        }
    }
}

impl R2Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            endpoint: required("R2_ENDPOINT_URL")?,
            access_key: required("R2_ACCESS_KEY_ID")?,
            secret_key: required("R2_SECRET_ACCESS_KEY")?,
            bucket: required("R2_BUCKET_NAME")?,
        })
    }
}

/// `DATABASE_URL` wins; otherwise the URL is assembled from the `DB_*` parts.
pub fn database_url() -> anyhow::Result<String> {
    if let Some(url) = optional("DATABASE_URL") {
        return Ok(url);
    }

    let host = required("DB_HOST").context("set DATABASE_URL or the DB_* variables")?;
    let port = optional("DB_PORT").unwrap_or_else(|| "5432".to_string());
    let name = required("DB_NAME")?;
    let user = optional("DB_USER").unwrap_or_else(|| "postgres".to_string());
    let password = optional("DB_PASSWORD").unwrap_or_default();

    Ok(format!(
        "postgres://{}:{}@{host}:{port}/{name}",
        urlencoding::encode(&user),
        urlencoding::encode(&password)
    ))
}

fn required(name: &str) -> anyhow::Result<String> {
    optional(name).with_context(|| format!("{name} must be set"))
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

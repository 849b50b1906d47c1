//! Pieces shared by the grade-card and transcript generators.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::archive::{batch_timestamp, upload, ObjectStore};
use crate::models::{output_file_name, DocumentKind, RenderSummary, StudentRow};

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("PDF error: {0}")]
    Pdf(#[from] lopdf::Error),
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),
    #[error("{0} has no pages")]
    EmptyDocument(String),
    #[error("PDF engine `{engine}` failed: {detail}")]
    Engine { engine: String, detail: String },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

impl RenderError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        RenderError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Uploads every generated file of one run under a single batch id.
pub struct Uploader<'a, O> {
    store: &'a O,
    batch: String,
}

impl<'a, O: ObjectStore> Uploader<'a, O> {
    pub fn new(store: &'a O) -> Self {
        Self::with_batch(store, batch_timestamp())
    }

    pub fn with_batch(store: &'a O, batch: String) -> Self {
        Self { store, batch }
    }

    pub fn batch(&self) -> &str {
        &self.batch
    }

    /// Upload failures are counted, never fatal.
    pub async fn archive(
        &self,
        kind: DocumentKind,
        file: &Path,
        student: &StudentRow,
        summary: &mut RenderSummary,
    ) {
        match upload(
            self.store,
            file,
            kind,
            &self.batch,
            &student.regn_no,
            student.display_name(),
        )
        .await
        {
            Ok(key) => {
                info!(regn_no = %student.regn_no, %key, "archived");
                summary.uploaded += 1;
            }
            Err(err) => {
                warn!(regn_no = %student.regn_no, error = %err, "upload failed");
                summary.upload_failures += 1;
            }
        }
    }
}

pub fn output_path(dir: &Path, student: &StudentRow, kind: DocumentKind) -> PathBuf {
    dir.join(output_file_name(&student.regn_no, student.display_name(), kind))
}

pub fn bounded_bar(total: u64, message: &str) -> ProgressBar {
    if !std::io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.cyan} {prefix} [{bar:40.cyan/blue}] {pos}/{len} ({percent:>3}%) | {msg}",
    ) {
        pb.set_style(style);
    }
    pb.set_prefix(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

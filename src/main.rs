use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, info_span, Instrument};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod archive;
mod config;
mod db;
mod gradecard;
mod models;
mod nocodb;
mod photo;
mod render;
mod reshape;
mod sync;
mod table;
mod transcript;

use crate::archive::R2Store;
use crate::config::{Config, R2Config, STUDENT_COURSES_TABLE, STUDENT_DETAILS_TABLE};
use crate::models::{DocumentKind, RenderSummary, COURSE_KEYS, STUDENT_KEYS};
use crate::nocodb::NocoDbClient;
use crate::render::{bounded_bar, Uploader};
use crate::sync::{SyncContext, SyncReport, SyncSession, StdinConfirm};
use crate::table::WideTable;

#[derive(Parser)]
#[command(name = "academic-records")]
#[command(about = "Student record sync, grade cards, transcripts and their archive", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reshape a wide course CSV and upsert one row per subject
    SyncCourses {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long)]
        year_flag: i64,
        #[arg(long)]
        admission_year: Option<i64>,
        /// Skip the confirmation when rows already exist
        #[arg(long)]
        yes: bool,
    },
    /// Upsert student details from a CSV
    SyncStudents {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long)]
        year_flag: i64,
        /// Every row is a consolidated record (YEAR_FLAG 0)
        #[arg(long)]
        consolidated: bool,
        #[arg(long)]
        admission_year: Option<i64>,
        #[arg(long)]
        yes: bool,
    },
    /// Render semester grade cards
    GradeCards {
        #[arg(long)]
        year_flag: i64,
        #[arg(long)]
        admission_year: i64,
        #[arg(long)]
        regn_no: Option<String>,
        #[arg(long)]
        program: Option<String>,
        /// Printed instead of the stored year of completion
        #[arg(long)]
        year_of_completion: Option<String>,
        /// Archive each card to object storage under a new batch
        #[arg(long)]
        upload: bool,
    },
    /// Render consolidated transcripts
    Transcripts {
        #[arg(long)]
        regn_no: Option<String>,
        #[arg(long)]
        program: Option<String>,
        #[arg(long)]
        admission_year: Option<i64>,
        #[arg(long)]
        upload: bool,
    },
    /// List archived batches, newest first
    Batches {
        #[arg(long, value_enum)]
        kind: DocumentKind,
    },
    /// Download a batch (the latest by default) as a ZIP
    Download {
        #[arg(long, value_enum)]
        kind: DocumentKind,
        #[arg(long)]
        batch: Option<String>,
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Print a time-limited download link for one archived file
    Presign {
        #[arg(long)]
        key: String,
        #[arg(long, default_value_t = archive::DEFAULT_PRESIGN_EXPIRY.as_secs())]
        expires_secs: u64,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::SyncCourses { .. } => "sync-courses",
            Commands::SyncStudents { .. } => "sync-students",
            Commands::GradeCards { .. } => "grade-cards",
            Commands::Transcripts { .. } => "transcripts",
            Commands::Batches { .. } => "batches",
            Commands::Download { .. } => "download",
            Commands::Presign { .. } => "presign",
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let run_id = Uuid::new_v4();
    let span = info_span!("run", %run_id, command = cli.command.name());
    run(cli.command).instrument(span).await
}

async fn run(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::SyncCourses {
            csv,
            year_flag,
            admission_year,
            yes,
        } => {
            sync::validate_year_flag(year_flag, false)?;
            let config = Config::from_env()?;
            let table = WideTable::from_path(&csv)?;
            let outcome = reshape::reshape(&table)
                .with_context(|| format!("cannot reshape {}", csv.display()))?;
            info!(
                subjects = outcome.report.positions.len(),
                rows = outcome.rows.len(),
                blank_slots = outcome.report.blank_slots,
                "course CSV reshaped"
            );

            let ctx = SyncContext {
                year_flag,
                admission_year,
            };
            let report = sync_table(
                &config,
                STUDENT_COURSES_TABLE,
                &outcome.rows,
                &COURSE_KEYS,
                &ctx,
                yes,
            )
            .await?;
            if let Some(report) = report {
                print_sync_report(STUDENT_COURSES_TABLE, &report);
            }
        }
        Commands::SyncStudents {
            csv,
            year_flag,
            consolidated,
            admission_year,
            yes,
        } => {
            sync::validate_year_flag(year_flag, consolidated)?;
            let config = Config::from_env()?;
            let table = WideTable::from_path(&csv)?;
            let rows = sync::prepare_student_rows(table, consolidated)
                .with_context(|| format!("{} failed validation", csv.display()))?;

            let ctx = SyncContext {
                year_flag,
                admission_year,
            };
            let report = sync_table(&config, STUDENT_DETAILS_TABLE, &rows, &STUDENT_KEYS, &ctx, yes).await?;
            if let Some(report) = report {
                print_sync_report(STUDENT_DETAILS_TABLE, &report);
            }
        }
        Commands::GradeCards {
            year_flag,
            admission_year,
            regn_no,
            program,
            year_of_completion,
            upload,
        } => {
            let config = Config::from_env()?;
            let client = NocoDbClient::new(&config.nocodb)?;
            let r2 = upload_store(upload)?;
            let uploader = r2.as_ref().map(Uploader::new);
            let request = gradecard::GradeCardRequest {
                year_flag,
                admission_year,
                regn_no,
                program,
                year_of_completion,
            };

            let pool = db::connect(&config::database_url()?).await?;
            let records = db::PgRecords::new(&pool, &config.nocodb.schema);
            let result =
                gradecard::generate_grade_cards(&records, &config, &client, uploader.as_ref(), &request).await;
            pool.close().await;
            print_render_summary(DocumentKind::GradeCard, &result?);
        }
        Commands::Transcripts {
            regn_no,
            program,
            admission_year,
            upload,
        } => {
            let config = Config::from_env()?;
            let client = NocoDbClient::new(&config.nocodb)?;
            let engine = transcript::CommandEngine::new(config.pdf_engine.clone());
            let r2 = upload_store(upload)?;
            let uploader = r2.as_ref().map(Uploader::new);
            let request = transcript::TranscriptRequest {
                regn_no,
                program,
                admission_year,
            };

            let pool = db::connect(&config::database_url()?).await?;
            let records = db::PgRecords::new(&pool, &config.nocodb.schema);
            let result = transcript::generate_transcripts(
                &records,
                &config,
                &client,
                &engine,
                uploader.as_ref(),
                &request,
            )
            .await;
            pool.close().await;
            print_render_summary(DocumentKind::Transcript, &result?);
        }
        Commands::Batches { kind } => {
            let store = R2Store::new(&R2Config::from_env()?);
            let batches = archive::list_batches(&store, kind).await?;
            if batches.is_empty() {
                println!("No {} batches found.", kind.folder());
            }
            for batch in batches {
                let files = archive::list_files(&store, kind, &batch).await?;
                println!("{batch}  ({} files)", files.len());
            }
        }
        Commands::Download { kind, batch, out } => {
            let store = R2Store::new(&R2Config::from_env()?);
            let bundle = archive::download_batch_as_archive(&store, kind, batch.as_deref()).await?;
            tokio::fs::create_dir_all(&out)
                .await
                .with_context(|| format!("failed to create {}", out.display()))?;
            let path = out.join(&bundle.file_name);
            tokio::fs::write(&path, &bundle.bytes)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!(
                "Batch {} ({} files) written to {}.",
                bundle.batch,
                bundle.files,
                path.display()
            );
        }
        Commands::Presign { key, expires_secs } => {
            let store = R2Store::new(&R2Config::from_env()?);
            let url = archive::presigned_url(&store, &key, Duration::from_secs(expires_secs)).await?;
            println!("{url}");
        }
    }

    Ok(())
}

fn upload_store(upload: bool) -> anyhow::Result<Option<R2Store>> {
    if upload {
        Ok(Some(R2Store::new(&R2Config::from_env()?)))
    } else {
        Ok(None)
    }
}

/// Runs the pre-flight gate and the upsert loop; `None` when the user declines.
async fn sync_table(
    config: &Config,
    table: &str,
    rows: &[reshape::LongRow],
    keys: &[&str],
    ctx: &SyncContext,
    assume_yes: bool,
) -> anyhow::Result<Option<SyncReport>> {
    let client = NocoDbClient::new(&config.nocodb)?;
    let mut session = SyncSession::new(StdinConfirm, assume_yes);
    if !sync::preflight(&client, table, ctx, &mut session).await? {
        println!("Sync cancelled; nothing was written.");
        return Ok(None);
    }

    let progress = bounded_bar(rows.len() as u64, table);
    let report = sync::sync_rows(&client, table, rows, keys, ctx, &progress).await;
    progress.finish_and_clear();
    Ok(Some(report))
}

fn print_sync_report(table: &str, report: &SyncReport) {
    if report.total == 0 {
        println!("No records to sync into {table}.");
        return;
    }
    println!(
        "{table}: {} of {} records synced ({} created, {} updated), {} skipped, {} failed.",
        report.succeeded(),
        report.total,
        report.created,
        report.updated,
        report.skipped,
        report.failed
    );
}

fn print_render_summary(kind: DocumentKind, summary: &RenderSummary) {
    if summary.students == 0 {
        println!("No data: no students matched, nothing was generated.");
        return;
    }
    println!(
        "Generated {} {} for {} students ({} skipped).",
        summary.generated,
        kind.folder(),
        summary.students,
        summary.skipped
    );
    if let Some(batch) = &summary.batch {
        println!(
            "Uploaded {} to batch {batch} ({} failed).",
            summary.uploaded, summary.upload_failures
        );
    }
}

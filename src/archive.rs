//! Object-storage archive of generated documents, grouped by batch.

use std::collections::BTreeSet;
use std::io::{Cursor, Write};
use std::path::Path;
use std::time::Duration;

use aws_sdk_s3::config::{Credentials, Region, SharedCredentialsProvider};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::{Client, Config};
use chrono::Local;
use tracing::{debug, info};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::config::R2Config;
use crate::models::{safe_name, DocumentKind};

pub const DEFAULT_PRESIGN_EXPIRY: Duration = Duration::from_secs(3600);
const PDF_CONTENT_TYPE: &str = "application/pdf";

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("object storage request failed: {0}")]
    Remote(String),
    #[error("could not read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("no batches found under {0}/")]
    NoBatch(String),
    #[error("batch {batch} under {folder}/ contains no files")]
    NoFiles { folder: String, batch: String },
    #[error("could not build archive: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("could not write archive entry: {0}")]
    Write(#[from] std::io::Error),
}

/// Flat key/value object storage.
pub trait ObjectStore {
    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), ArchiveError>;

    async fn get_object(&self, key: &str) -> Result<Vec<u8>, ArchiveError>;

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, ArchiveError>;

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, ArchiveError>;
}

/// Cloudflare R2 (or any S3-compatible endpoint) addressed path-style.
pub struct R2Store {
    client: Client,
    bucket: String,
}

impl R2Store {
    pub fn new(config: &R2Config) -> Self {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "static",
        );

        let s3_config = Config::builder()
            .credentials_provider(SharedCredentialsProvider::new(credentials))
            .region(Region::new("auto"))
            .endpoint_url(&config.endpoint)
            .force_path_style(true)
            .behavior_version_latest()
            .build();

        Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
        }
    }
}

fn remote<E: std::error::Error>(action: &str, key: &str, err: E) -> ArchiveError {
    ArchiveError::Remote(format!("{action} {key}: {}", DisplayErrorContext(&err)))
}

impl ObjectStore for R2Store {
    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), ArchiveError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| remote("put", key, err))?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>, ArchiveError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| remote("get", key, err))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|err| remote("read", key, err))?
            .into_bytes();
        Ok(data.to_vec())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, ArchiveError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket).prefix(prefix);
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            }
            let output = request.send().await.map_err(|err| remote("list", prefix, err))?;

            keys.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(keys)
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, ArchiveError> {
        let presigning = PresigningConfig::expires_in(expires_in)
            .map_err(|err| remote("presign", key, err))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|err| remote("presign", key, err))?;
        Ok(request.uri().to_string())
    }
}

/// Batch id for one generation run: local time as `YYYYMMDD_HHMMSS`.
pub fn batch_timestamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// `{folder}/{batch}/{safe_regn}_{safe_name}.pdf`
pub fn object_key(kind: DocumentKind, batch: &str, regn_no: &str, name: &str) -> String {
    format!(
        "{}/{}/{}_{}.pdf",
        kind.folder(),
        batch,
        regn_no.replace('/', "_"),
        safe_name(name)
    )
}

pub async fn upload<O: ObjectStore>(
    store: &O,
    file: &Path,
    kind: DocumentKind,
    batch: &str,
    regn_no: &str,
    name: &str,
) -> Result<String, ArchiveError> {
    let body = tokio::fs::read(file).await.map_err(|source| ArchiveError::Io {
        path: file.display().to_string(),
        source,
    })?;
    let key = object_key(kind, batch, regn_no, name);
    store.put_object(&key, body, PDF_CONTENT_TYPE).await?;
    debug!(%key, "uploaded");
    Ok(key)
}

/// Batch ids under the kind's folder, most recent first.
pub async fn list_batches<O: ObjectStore>(store: &O, kind: DocumentKind) -> Result<Vec<String>, ArchiveError> {
    let keys = store.list_keys(&format!("{}/", kind.folder())).await?;
    let batches: BTreeSet<String> = keys
        .iter()
        .filter_map(|key| {
            let mut parts = key.split('/');
            let _folder = parts.next()?;
            let batch = parts.next()?;
            parts.next()?;
            (!batch.is_empty()).then(|| batch.to_string())
        })
        .collect();
    Ok(batches.into_iter().rev().collect())
}

pub async fn list_files<O: ObjectStore>(
    store: &O,
    kind: DocumentKind,
    batch: &str,
) -> Result<Vec<String>, ArchiveError> {
    let mut keys = store
        .list_keys(&format!("{}/{}/", kind.folder(), batch))
        .await?;
    keys.sort();
    Ok(keys)
}

pub async fn presigned_url<O: ObjectStore>(
    store: &O,
    key: &str,
    expires_in: Duration,
) -> Result<String, ArchiveError> {
    store.presign_get(key, expires_in).await
}

#[derive(Debug)]
pub struct BatchArchive {
    pub batch: String,
    pub file_name: String,
    pub files: usize,
    pub bytes: Vec<u8>,
}

/// Zips every object of a batch (the latest when `batch` is `None`) in memory.
pub async fn download_batch_as_archive<O: ObjectStore>(
    store: &O,
    kind: DocumentKind,
    batch: Option<&str>,
) -> Result<BatchArchive, ArchiveError> {
    let batch = match batch {
        Some(batch) => batch.to_string(),
        None => list_batches(store, kind)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ArchiveError::NoBatch(kind.folder().to_string()))?,
    };

    let keys = list_files(store, kind, &batch).await?;
    if keys.is_empty() {
        return Err(ArchiveError::NoFiles {
            folder: kind.folder().to_string(),
            batch,
        });
    }

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for key in &keys {
        let content = store.get_object(key).await?;
        let entry = key.rsplit('/').next().unwrap_or(key.as_str());
        zip.start_file(entry, options)?;
        zip.write_all(&content)?;
    }
    let bytes = zip.finish()?.into_inner();

    info!(folder = kind.folder(), %batch, files = keys.len(), "batch archived");
    Ok(BatchArchive {
        file_name: format!("{}_{}.zip", kind.folder(), batch),
        files: keys.len(),
        batch,
        bytes,
    })
}

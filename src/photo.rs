//! Student photo lookup and preparation for the grade card.

use std::path::Path;
use std::time::Duration;

use image::{imageops, DynamicImage, Rgb, RgbImage};
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::STUDENT_DETAILS_TABLE;
use crate::models::REGN_NO;
use crate::nocodb::{KeyFilter, TableStore};

pub const PHOTO_WIDTH: u32 = 68;
pub const PHOTO_HEIGHT: u32 = 85;
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

const PLACEHOLDER: Rgb<u8> = Rgb([0xcc, 0xcc, 0xcc]);
const BACKGROUND: Rgb<u8> = Rgb([0xff, 0xff, 0xff]);

#[derive(Debug, thiserror::Error)]
pub enum PhotoError {
    #[error("photo request failed: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("photo server returned {0}")]
    Status(u16),
    #[error("could not read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("could not decode photo: {0}")]
    Decode(#[from] image::ImageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotoSource {
    Remote,
    Local,
    Placeholder,
}

/// Uncompressed 8-bit RGB pixels, ready to embed.
#[derive(Debug, Clone)]
pub struct Photo {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
    pub source: PhotoSource,
}

impl Photo {
    pub fn placeholder() -> Self {
        let canvas = RgbImage::from_pixel(PHOTO_WIDTH, PHOTO_HEIGHT, PLACEHOLDER);
        Self::from_canvas(canvas, PhotoSource::Placeholder)
    }

    fn from_canvas(canvas: RgbImage, source: PhotoSource) -> Self {
        Self {
            width: canvas.width(),
            height: canvas.height(),
            rgb: canvas.into_raw(),
            source,
        }
    }
}

pub fn http_client() -> Result<Client, PhotoError> {
    Ok(Client::builder().timeout(FETCH_TIMEOUT).build()?)
}

/// Scales the image to fit the photo box, centres it on white and sharpens it.
pub fn fit_photo(image: &DynamicImage) -> RgbImage {
    let scaled = image.thumbnail(PHOTO_WIDTH, PHOTO_HEIGHT).to_rgb8();
    let mut canvas = RgbImage::from_pixel(PHOTO_WIDTH, PHOTO_HEIGHT, BACKGROUND);
    let x = (PHOTO_WIDTH - scaled.width()) / 2;
    let y = (PHOTO_HEIGHT - scaled.height()) / 2;
    imageops::overlay(&mut canvas, &scaled, i64::from(x), i64::from(y));
    imageops::unsharpen(&canvas, 0.8, 2)
}

/// Photo link from a table-store cell: a plain URL, or an attachment list
/// (possibly JSON-encoded) whose first entry has `signedUrl` or `url`.
pub fn attachment_url(cell: &Value) -> Option<String> {
    match cell {
        Value::String(text) => {
            let text = text.trim();
            if text.starts_with('[') || text.starts_with('{') {
                serde_json::from_str::<Value>(text)
                    .ok()
                    .and_then(|parsed| attachment_url(&parsed))
            } else if text.starts_with("http://") || text.starts_with("https://") {
                Some(text.to_string())
            } else {
                None
            }
        }
        Value::Array(items) => items.first().and_then(attachment_url),
        Value::Object(fields) => ["signedUrl", "url"]
            .iter()
            .find_map(|key| fields.get(*key).and_then(Value::as_str))
            .map(str::to_string),
        _ => None,
    }
}

/// Looks up the student's photo link; lookup failures fall through to `None`.
pub async fn photo_url<S: TableStore>(store: &S, photo_field: &str, regn_no: &str) -> Option<String> {
    let filter = KeyFilter::new().eq(REGN_NO, regn_no);
    match store.find(STUDENT_DETAILS_TABLE, &filter, Some(1)).await {
        Ok(page) => page
            .rows
            .first()
            .and_then(|row| row.get(photo_field))
            .and_then(attachment_url),
        Err(err) => {
            warn!(regn_no, error = %err, "photo lookup failed");
            None
        }
    }
}

async fn fetch_remote(http: &Client, url: &str) -> Result<DynamicImage, PhotoError> {
    let response = http.get(url).send().await?;
    if !response.status().is_success() {
        return Err(PhotoError::Status(response.status().as_u16()));
    }
    let bytes = response.bytes().await?;
    Ok(image::load_from_memory(&bytes)?)
}

async fn read_local(path: &Path) -> Result<DynamicImage, PhotoError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| PhotoError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(image::load_from_memory(&bytes)?)
}

/// Remote URL first, then `<photo_dir>/<REGN_NO>.png`, then the grey placeholder.
pub async fn load_photo(http: &Client, url: Option<&str>, photo_dir: &Path, regn_no: &str) -> Photo {
    if let Some(url) = url {
        match fetch_remote(http, url).await {
            Ok(image) => {
                debug!(regn_no, "photo fetched from table-store link");
                return Photo::from_canvas(fit_photo(&image), PhotoSource::Remote);
            }
            Err(err) => warn!(regn_no, error = %err, "could not fetch photo"),
        }
    }

    let local = photo_dir.join(format!("{regn_no}.png"));
    if local.exists() {
        match read_local(&local).await {
            Ok(image) => return Photo::from_canvas(fit_photo(&image), PhotoSource::Local),
            Err(err) => warn!(regn_no, error = %err, "could not open local photo"),
        }
    } else {
        warn!(regn_no, path = %local.display(), "photo not found; using placeholder");
    }

    Photo::placeholder()
}

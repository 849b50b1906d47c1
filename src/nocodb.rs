//! Table-store access and the composite-key upsert.

use std::str::FromStr;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::config::NocoDbConfig;
use crate::models::{Record, REGN_NO, SUBJECT_CODE};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const ROW_ID_FIELD: &str = "Id";

/// Keys compared by their text form whatever their source type.
const STRING_KEYS: [&str; 2] = [REGN_NO, SUBJECT_CODE];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("response is not valid JSON: {0}")]
    Decode(String),
    #[error("invalid client configuration: {0}")]
    Config(String),
}

/// How equality predicates are joined on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterSyntax {
    /// `` `A`,eq,1,AND,`B`,eq,2 `` in the `filter` parameter.
    #[default]
    Legacy,
    /// `(A,eq,1)~and(B,eq,2)` in the `where` parameter.
    Where,
}

impl FromStr for FilterSyntax {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "legacy" | "filter" => Ok(FilterSyntax::Legacy),
            "where" => Ok(FilterSyntax::Where),
            other => anyhow::bail!("unknown filter syntax {other:?} (expected legacy or where)"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFilter {
    predicates: Vec<(String, String)>,
}

impl KeyFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.predicates.push((field.into(), value.into()));
        self
    }

    #[cfg(test)]
    pub fn predicates(&self) -> &[(String, String)] {
        &self.predicates
    }

    pub fn render(&self, syntax: FilterSyntax) -> String {
        match syntax {
            FilterSyntax::Legacy => self
                .predicates
                .iter()
                .map(|(field, value)| format!("`{field}`,eq,{value}"))
                .collect::<Vec<_>>()
                .join(",AND,"),
            FilterSyntax::Where => self
                .predicates
                .iter()
                .map(|(field, value)| format!("({field},eq,{value})"))
                .collect::<Vec<_>>()
                .join("~and"),
        }
    }

    pub fn query_param(&self, syntax: FilterSyntax) -> String {
        let name = match syntax {
            FilterSyntax::Legacy => "filter",
            FilterSyntax::Where => "where",
        };
        format!("{name}={}", urlencoding::encode(&self.render(syntax)))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RowPage {
    pub rows: Vec<Record>,
    pub total_rows: Option<u64>,
}

/// Access to table-store rows.
pub trait TableStore {
    async fn find(
        &self,
        table: &str,
        filter: &KeyFilter,
        limit: Option<usize>,
    ) -> Result<RowPage, StoreError>;

    async fn update(&self, table: &str, row_id: &str, record: &Record) -> Result<(), StoreError>;

    async fn create(&self, table: &str, record: &Record) -> Result<(), StoreError>;
}

pub struct NocoDbClient {
    http: Client,
    api_base: String,
    syntax: FilterSyntax,
}

impl NocoDbClient {
    pub fn new(config: &NocoDbConfig) -> Result<Self, StoreError> {
        let mut headers = HeaderMap::new();
        let token = HeaderValue::from_str(&config.api_token)
            .map_err(|err| StoreError::Config(format!("NOCODB_API_TOKEN: {err}")))?;
        headers.insert("xc-token", token);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            syntax: config.filter_syntax,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.api_base, table)
    }

    async fn checked(response: reqwest::Response) -> Result<String, StoreError> {
        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(StoreError::Status {
                status: status.as_u16(),
                body: truncate(&body, 200),
            })
        }
    }
}

impl TableStore for NocoDbClient {
    async fn find(
        &self,
        table: &str,
        filter: &KeyFilter,
        limit: Option<usize>,
    ) -> Result<RowPage, StoreError> {
        let mut url = format!("{}?{}", self.table_url(table), filter.query_param(self.syntax));
        if let Some(limit) = limit {
            url.push_str(&format!("&limit={limit}"));
        }
        debug!(%url, "table-store lookup");

        let response = self.http.get(&url).send().await?;
        let body = Self::checked(response).await?;
        parse_page(&body)
    }

    async fn update(&self, table: &str, row_id: &str, record: &Record) -> Result<(), StoreError> {
        let url = format!("{}/{}", self.table_url(table), urlencoding::encode(row_id));
        let response = self.http.patch(&url).json(record).send().await?;
        Self::checked(response).await.map(|_| ())
    }

    async fn create(&self, table: &str, record: &Record) -> Result<(), StoreError> {
        let response = self.http.post(self.table_url(table)).json(record).send().await?;
        Self::checked(response).await.map(|_| ())
    }
}

pub fn parse_page(body: &str) -> Result<RowPage, StoreError> {
    let value: Value = serde_json::from_str(body).map_err(|_| {
        StoreError::Decode(truncate(body, 200))
    })?;

    let rows = value
        .get("list")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|row| row.as_object().cloned())
                .collect()
        })
        .unwrap_or_default();
    let total_rows = value
        .pointer("/pageInfo/totalRows")
        .and_then(Value::as_u64);

    Ok(RowPage { rows, total_rows })
}

/// Text of a numeric cell with an integral float form reduced, e.g. `101.0` to `101`.
pub fn integral_text(raw: &str) -> String {
    match raw.split_once('.') {
        Some((whole, fraction))
            if is_integer(whole) && !fraction.is_empty() && fraction.bytes().all(|b| b == b'0') =>
        {
            whole.to_string()
        }
        _ => raw.to_string(),
    }
}

/// An optional leading `-` followed by at least one digit.
fn is_integer(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Text used in an equality predicate; `None` for a missing or null value.
pub fn key_text(field: &str, value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        other => other.to_string(),
    };

    if STRING_KEYS.contains(&field) {
        Some(integral_text(&text))
    } else {
        Some(text)
    }
}

/// Characters that end a predicate in either filter syntax.
const FILTER_DELIMITERS: [char; 4] = [',', '(', ')', '~'];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyProblem {
    Missing(String),
    Unfilterable { field: String, value: String },
}

/// Builds the conjunction for `key_fields`, or names the first key that
/// is missing or cannot be expressed as an equality predicate.
pub fn key_filter(record: &Record, key_fields: &[&str]) -> Result<KeyFilter, KeyProblem> {
    let mut filter = KeyFilter::new();
    for field in key_fields {
        let text = record
            .get(*field)
            .and_then(|value| key_text(field, value))
            .ok_or_else(|| KeyProblem::Missing(field.to_string()))?;
        if text.contains(&FILTER_DELIMITERS[..]) {
            return Err(KeyProblem::Unfilterable {
                field: field.to_string(),
                value: text,
            });
        }
        filter = filter.eq(*field, text);
    }
    Ok(filter)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated { id: String },
    Skipped { missing_key: String },
    /// A key value would split the lookup filter, so the row could match the wrong record.
    Unfilterable { field: String, value: String },
    Failed { reason: String },
}

/// Updates the row matching every key field, or creates one.
///
/// Lookup and write are separate calls, so two writers racing on the same key
/// can both create. Store errors come back as [`UpsertOutcome::Failed`].
pub async fn upsert<S: TableStore>(
    store: &S,
    table: &str,
    record: &Record,
    key_fields: &[&str],
) -> UpsertOutcome {
    let filter = match key_filter(record, key_fields) {
        Ok(filter) => filter,
        Err(KeyProblem::Missing(missing_key)) => {
            warn!(table, key = %missing_key, "record skipped: missing key field");
            return UpsertOutcome::Skipped { missing_key };
        }
        Err(KeyProblem::Unfilterable { field, value }) => {
            warn!(table, key = %field, %value, "record skipped: key value contains a filter delimiter");
            return UpsertOutcome::Unfilterable { field, value };
        }
    };

    let page = match store.find(table, &filter, None).await {
        Ok(page) => page,
        Err(err) => {
            error!(table, filter = %filter.render(FilterSyntax::Legacy), error = %err, "lookup failed");
            return UpsertOutcome::Failed {
                reason: err.to_string(),
            };
        }
    };

    if page.rows.len() > 1 {
        warn!(
            table,
            matches = page.rows.len(),
            filter = %filter.render(FilterSyntax::Legacy),
            "duplicate rows already exist; updating the first"
        );
    }

    let existing_id = page
        .rows
        .first()
        .and_then(|row| row.get(ROW_ID_FIELD))
        .and_then(|id| key_text(ROW_ID_FIELD, id));

    let result = match &existing_id {
        Some(id) => store.update(table, id, record).await,
        None => store.create(table, record).await,
    };

    match (result, existing_id) {
        (Ok(()), Some(id)) => UpsertOutcome::Updated { id },
        (Ok(()), None) => UpsertOutcome::Created,
        (Err(err), id) => {
            let action = if id.is_some() { "update" } else { "create" };
            error!(table, action, error = %err, "write failed");
            UpsertOutcome::Failed {
                reason: err.to_string(),
            }
        }
    }
}

/// Number of rows matching `filter`, preferring the store's own total.
pub async fn count_matching<S: TableStore>(
    store: &S,
    table: &str,
    filter: &KeyFilter,
) -> Result<u64, StoreError> {
    let page = store.find(table, filter, Some(1)).await?;
    Ok(page.total_rows.unwrap_or(page.rows.len() as u64))
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut cut: String = text.chars().take(max_chars).collect();
        cut.push_str("...");
        cut
    }
}

//! Supabase PostgREST client for SmartMark
//!
//! A small query builder over the PostgREST HTTP interface: select with
//! filters and ordering, insert returning the stored rows, and filtered
//! delete.

use log::{debug, trace};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use url::Url;

/// PostgREST APIエラーの詳細情報
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PostgrestApiErrorDetails {
    pub code: Option<String>,
    pub message: Option<String>,
    pub details: Option<String>,
    pub hint: Option<String>,
}

// エラー詳細を整形して表示するための Display 実装
impl fmt::Display for PostgrestApiErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = [
            ("Code", &self.code),
            ("Message", &self.message),
            ("Details", &self.details),
            ("Hint", &self.hint),
        ]
        .iter()
        .filter_map(|(label, value)| value.as_deref().map(|v| format!("{}: {}", label, v)))
        .collect();
        write!(f, "{}", parts.join(", "))
    }
}

/// エラー型
#[derive(Error, Debug)]
pub enum PostgrestError {
    #[error("API error: {details} (Status: {status})")]
    ApiError {
        details: PostgrestApiErrorDetails,
        status: reqwest::StatusCode,
    },

    #[error("API error (unparsed): {message} (Status: {status})")]
    UnparsedApiError {
        message: String,
        status: reqwest::StatusCode,
    },

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

impl PostgrestError {
    /// HTTP status of an API error, if the server answered at all.
    pub fn status(&self) -> Option<reqwest::StatusCode> {
        match self {
            PostgrestError::ApiError { status, .. } | PostgrestError::UnparsedApiError { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

/// ソート方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// PostgREST クライアント
///
/// One instance describes one request against one table. Builder methods
/// consume and return `self`; the terminal methods (`execute`, `insert`,
/// `delete`) borrow it so a configured query can be reused.
#[derive(Debug, Clone)]
pub struct PostgrestClient {
    base_url: String,
    api_key: String,
    table: String,
    http_client: Client,
    headers: Vec<(String, String)>,
    query_params: Vec<(String, String)>,
}

impl PostgrestClient {
    /// 新しい PostgREST クライアントを作成
    pub fn new(base_url: &str, api_key: &str, table: &str, http_client: Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            table: table.to_string(),
            http_client,
            headers: Vec::new(),
            query_params: Vec::new(),
        }
    }

    /// ヘッダーを追加
    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
        self.headers.push((key.to_string(), value.to_string()));
        self
    }

    /// 認証トークンを設定
    pub fn with_auth(self, token: &str) -> Self {
        self.with_header("Authorization", &format!("Bearer {}", token))
    }

    fn set_param(mut self, key: &str, value: String) -> Self {
        self.query_params.retain(|(k, _)| k != key);
        self.query_params.push((key.to_string(), value));
        self
    }

    /// 取得するカラムを指定
    pub fn select(self, columns: &str) -> Self {
        self.set_param("select", columns.to_string())
    }

    /// 等価フィルター
    pub fn eq(self, column: &str, value: &str) -> Self {
        self.set_param(column, format!("eq.{}", value))
    }

    /// ソート順を指定
    pub fn order(self, column: &str, order: SortOrder) -> Self {
        let order_str = match order {
            SortOrder::Ascending => "asc",
            SortOrder::Descending => "desc",
        };
        self.set_param("order", format!("{}.{}", column, order_str))
    }

    fn build_url(&self) -> Result<Url, PostgrestError> {
        let mut url = Url::parse(&format!("{}/rest/v1/{}", self.base_url, self.table))?;
        if !self.query_params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &self.query_params {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn build_headers(&self, prefer: Option<&'static str>) -> Result<HeaderMap, PostgrestError> {
        let mut headers = HeaderMap::new();
        headers.insert("apikey", header_value(&self.api_key)?);
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        for (key, value) in &self.headers {
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|_| {
                PostgrestError::InvalidParameters(format!("Invalid header name: {}", key))
            })?;
            headers.insert(name, header_value(value)?);
        }
        if let Some(prefer) = prefer {
            headers.insert(HeaderName::from_static("prefer"), HeaderValue::from_static(prefer));
        }
        Ok(headers)
    }

    /// データを取得
    pub async fn execute<T: DeserializeOwned>(&self) -> Result<Vec<T>, PostgrestError> {
        let url = self.build_url()?;
        debug!("GET {}", url);

        let response = self
            .http_client
            .get(url)
            .headers(self.build_headers(None)?)
            .send()
            .await?;

        check_response(response)
            .await?
            .json::<Vec<T>>()
            .await
            .map_err(|e| PostgrestError::DeserializationError(e.to_string()))
    }

    /// データを挿入し、保存された行を返す
    pub async fn insert<T: Serialize, R: DeserializeOwned>(
        &self,
        values: &T,
    ) -> Result<Vec<R>, PostgrestError> {
        let url = self.build_url()?;
        debug!("POST {}", url);

        let response = self
            .http_client
            .post(url)
            .headers(self.build_headers(Some("return=representation"))?)
            .json(values)
            .send()
            .await?;

        let body_text = check_response(response).await?.text().await?;
        trace!("insert response: {}", body_text);

        // PostgREST returns an array, or a single object when the request asked for one
        match serde_json::from_str::<serde_json::Value>(&body_text)
            .map_err(|e| PostgrestError::DeserializationError(e.to_string()))?
        {
            serde_json::Value::Array(rows) => rows
                .into_iter()
                .map(|row| {
                    serde_json::from_value(row)
                        .map_err(|e| PostgrestError::DeserializationError(e.to_string()))
                })
                .collect(),
            row => serde_json::from_value(row)
                .map(|r| vec![r])
                .map_err(|e| PostgrestError::DeserializationError(e.to_string())),
        }
    }

    /// データを削除
    ///
    /// Requires at least one filter so a bare `delete()` cannot empty the table.
    pub async fn delete(&self) -> Result<(), PostgrestError> {
        if !self
            .query_params
            .iter()
            .any(|(key, _)| key != "select" && key != "order")
        {
            return Err(PostgrestError::InvalidParameters(
                "delete requires a filter".to_string(),
            ));
        }

        let url = self.build_url()?;
        debug!("DELETE {}", url);

        let response = self
            .http_client
            .delete(url)
            .headers(self.build_headers(Some("return=minimal"))?)
            .send()
            .await?;

        check_response(response).await?;
        Ok(())
    }
}

fn header_value(value: &str) -> Result<HeaderValue, PostgrestError> {
    HeaderValue::from_str(value)
        .map_err(|_| PostgrestError::InvalidParameters(format!("Invalid header value: {}", value)))
}

async fn check_response(response: Response) -> Result<Response, PostgrestError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| "Failed to read error response".to_string());

    // Attempt to parse specific error details
    match serde_json::from_str::<PostgrestApiErrorDetails>(&error_text) {
        Ok(details) => Err(PostgrestError::ApiError { details, status }),
        Err(_) => Err(PostgrestError::UnparsedApiError {
            message: error_text,
            status,
        }),
    }
}

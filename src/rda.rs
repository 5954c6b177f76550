use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::domain::{Credentials, DatasetQuery, RequestId, format_timestamp};
use crate::envelope::{interpret_status, parse_result};
use crate::error::RdaError;
use crate::retry::RetryingClient;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestPayload {
    pub dataset: String,
    pub product: String,
    pub date: String,
    pub param: String,
    pub nlat: f64,
    pub slat: f64,
    pub wlon: f64,
    pub elon: f64,
}

impl From<&DatasetQuery> for RequestPayload {
    fn from(query: &DatasetQuery) -> Self {
        let bbox = query.bbox();
        Self {
            dataset: query.dataset().to_string(),
            product: query.product().to_string(),
            date: format!(
                "{}/to/{}",
                format_timestamp(&query.start()),
                format_timestamp(&query.end())
            ),
            param: query.params().join("/"),
            nlat: bbox.north,
            slat: bbox.south,
            wlon: bbox.west,
            elon: bbox.east,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FileList {
    web_files: Vec<WebFile>,
}

#[derive(Debug, Deserialize)]
struct WebFile {
    web_path: String,
}

pub trait RdaClient: Send + Sync {
    /// Creates a job. Never retried.
    fn submit(
        &self,
        payload: &RequestPayload,
        credentials: &Credentials,
    ) -> Result<RequestId, RdaError>;
    fn check_status(&self, id: &RequestId, credentials: &Credentials) -> Result<String, RdaError>;
    fn file_list(&self, id: &RequestId, credentials: &Credentials)
    -> Result<Vec<String>, RdaError>;
    fn purge(&self, id: &RequestId, credentials: &Credentials) -> Result<(), RdaError>;
}

#[derive(Clone)]
pub struct RdaHttpClient {
    http: RetryingClient,
    base_url: String,
}

impl RdaHttpClient {
    pub fn new(config: &PipelineConfig) -> Result<Self, RdaError> {
        let client = Client::builder()
            .default_headers(default_headers()?)
            .timeout(config.timeout)
            .build()
            .map_err(|err| RdaError::Http(err.to_string()))?;
        Ok(Self {
            http: RetryingClient::new(client, config.retry.clone()),
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn request_url(&self, id: &RequestId) -> String {
        format!("{}/request/{}", self.base_url, id.as_str())
    }
}

pub(crate) fn default_headers() -> Result<HeaderMap, RdaError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("rda-met/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| RdaError::Http(err.to_string()))?,
    );
    Ok(headers)
}

impl RdaClient for RdaHttpClient {
    fn submit(
        &self,
        payload: &RequestPayload,
        credentials: &Credentials,
    ) -> Result<RequestId, RdaError> {
        let url = format!("{}/request", self.base_url);
        debug!(%url, dataset = %payload.dataset, "submitting request");
        let request = self
            .http
            .client()
            .post(&url)
            .basic_auth(credentials.identifier(), Some(credentials.secret()))
            .json(payload);
        let response = self.http.send_once(request)?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|err| RdaError::Http(err.to_string()))?;
        let result = parse_result(status, &body)?;
        let id = extract_request_id(&result)?;
        info!(request_id = %id, "request submitted");
        Ok(id)
    }

    fn check_status(&self, id: &RequestId, credentials: &Credentials) -> Result<String, RdaError> {
        let url = self.request_url(id);
        // No status check on purpose: proxies answer with HTML during hiccups and
        // that text becomes the status string.
        let response = self.http.send_with_retries(|client| {
            client
                .get(&url)
                .basic_auth(credentials.identifier(), Some(credentials.secret()))
        })?;
        let body = response
            .text()
            .map_err(|err| RdaError::Http(err.to_string()))?;
        Ok(interpret_status(&body))
    }

    fn file_list(
        &self,
        id: &RequestId,
        credentials: &Credentials,
    ) -> Result<Vec<String>, RdaError> {
        let url = format!("{}/filelist_json", self.request_url(id));
        let response = self.http.send_with_retries(|client| {
            client
                .get(&url)
                .basic_auth(credentials.identifier(), Some(credentials.secret()))
        })?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|err| RdaError::Http(err.to_string()))?;
        let result = parse_result(status, &body)?;
        parse_file_list(result, &body)
    }

    fn purge(&self, id: &RequestId, credentials: &Credentials) -> Result<(), RdaError> {
        let url = self.request_url(id);
        let response = self.http.send_with_retries(|client| {
            client
                .delete(&url)
                .basic_auth(credentials.identifier(), Some(credentials.secret()))
        })?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "purge request failed".to_string());
            return Err(RdaError::Status { status, message });
        }
        info!(request_id = %id, "request purged");
        Ok(())
    }
}

pub fn extract_request_id(result: &Value) -> Result<RequestId, RdaError> {
    match result.get("request_id") {
        Some(Value::String(id)) if !id.trim().is_empty() => Ok(RequestId::new(id.trim())),
        Some(Value::Number(id)) => Ok(RequestId::new(id.to_string())),
        _ => Err(RdaError::MissingRequestId(result.to_string())),
    }
}

pub fn parse_file_list(result: Value, raw_body: &str) -> Result<Vec<String>, RdaError> {
    let list: FileList =
        serde_json::from_value(result).map_err(|_| RdaError::Provider(raw_body.to_string()))?;
    Ok(list.web_files.into_iter().map(|file| file.web_path).collect())
}

pub fn filter_web_paths(paths: Vec<String>, ignore_suffixes: &[String]) -> Vec<String> {
    paths
        .into_iter()
        .filter(|path| {
            !ignore_suffixes
                .iter()
                .any(|suffix| path.ends_with(suffix.as_str()))
        })
        .collect()
}

pub fn resolve_file_list<C: RdaClient + ?Sized>(
    client: &C,
    id: &RequestId,
    credentials: &Credentials,
    ignore_suffixes: &[String],
) -> Result<Vec<String>, RdaError> {
    let paths = client.file_list(id, credentials)?;
    let total = paths.len();
    let kept = filter_web_paths(paths, ignore_suffixes);
    debug!(request_id = %id, total, kept = kept.len(), "resolved file list");
    Ok(kept)
}

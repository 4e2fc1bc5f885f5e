//! HTTP probe client
//!
//! A thin `reqwest` wrapper for talking to the service under test. It keeps
//! no per-request state, so one client can be shared between concurrent
//! scenarios. Polling helpers turn "eventually Finished" into a bounded
//! wait with a convergence diagnostic.

use crate::cancel::{run_cancellable, sleep_cancellable, CancellationToken};
use crate::error::{HarnessError, Result};
use crate::models::{CreateReportRequest, OutputFormat, ReportList, ReportProbe, ReportStatus};
use crate::resilience::{RetryConfigBuilder, RetryExecutor};
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use http::{Method, StatusCode};
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

/// Statuses that `request_with_retry` treats as transient
pub const RETRYABLE_STATUSES: [u16; 4] = [429, 502, 503, 504];

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Per-request deadline
    pub timeout: Duration,
    pub max_attempts: u32,
    /// Retry `n` waits `base_backoff * 2^n`
    pub base_backoff: Duration,
    /// Cadence of status and health polling
    pub poll_interval: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Status, headers and the fully read body of one response
#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub elapsed: Duration,
}

impl ProbeResponse {
    pub fn status_code(&self) -> u16 {
        self.status.as_u16()
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_server_error(&self) -> bool {
        self.status.is_server_error()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Non-2xx becomes `UnexpectedStatus`
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(HarnessError::UnexpectedStatus {
                status: self.status_code(),
                body: self.text(),
            })
        }
    }
}

/// One file part of a multipart upload
#[derive(Debug, Clone)]
pub struct MultipartFile {
    pub field: String,
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl MultipartFile {
    pub fn new(field: impl Into<String>, file_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            field: field.into(),
            file_name: file_name.into(),
            content_type: None,
            data: data.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Whether a probe outcome is worth another attempt
pub fn is_retryable(outcome: &Result<ProbeResponse>) -> bool {
    match outcome {
        Err(HarnessError::Transport(_)) => true,
        Ok(resp) => RETRYABLE_STATUSES.contains(&resp.status_code()),
        Err(_) => false,
    }
}

#[derive(Debug, Clone)]
pub struct HttpProbeClient {
    client: reqwest::Client,
    base_url: Url,
    default_headers: HeaderMap,
    config: ProbeConfig,
}

impl HttpProbeClient {
    pub fn new(base_url: &str, config: ProbeConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            base_url: Url::parse(base_url)?,
            default_headers: HeaderMap::new(),
            config,
        })
    }

    /// Send `Authorization: Bearer <token>` on every request
    pub fn with_bearer_token(mut self, token: &str) -> Result<Self> {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))?;
        self.default_headers.insert(AUTHORIZATION, value);
        Ok(self)
    }

    pub fn with_default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    fn url(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    // caller headers win over defaults
    fn merged_headers(&self, headers: &HeaderMap) -> HeaderMap {
        let mut merged = self.default_headers.clone();
        for name in headers.keys() {
            merged.remove(name);
            for value in headers.get_all(name) {
                merged.append(name.clone(), value.clone());
            }
        }
        merged
    }

    async fn send(&self, builder: reqwest::RequestBuilder, cancel: &CancellationToken) -> Result<ProbeResponse> {
        run_cancellable(cancel, async move {
            let started = Instant::now();
            let resp = builder.send().await?;
            let status = resp.status();
            let headers = resp.headers().clone();
            let body = resp.bytes().await?;
            Ok(ProbeResponse {
                status,
                headers,
                body,
                elapsed: started.elapsed(),
            })
        })
        .await
    }

    /// Issue one request. A JSON body gets `Content-Type: application/json`
    /// unless the caller already chose a content type.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        headers: &HeaderMap,
        body: Option<&Value>,
        cancel: &CancellationToken,
    ) -> Result<ProbeResponse> {
        let mut headers = self.merged_headers(headers);
        let mut builder = self.client.request(method, self.url(path)?);
        if let Some(body) = body {
            if !headers.contains_key(CONTENT_TYPE) {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
            builder = builder.body(serde_json::to_vec(body)?);
        }
        self.send(builder.headers(headers), cancel).await
    }

    /// Send arbitrary bytes as the body, untouched
    pub async fn request_raw(
        &self,
        method: Method,
        path: &str,
        headers: &HeaderMap,
        body: Bytes,
        cancel: &CancellationToken,
    ) -> Result<ProbeResponse> {
        let builder = self
            .client
            .request(method, self.url(path)?)
            .headers(self.merged_headers(headers))
            .body(body);
        self.send(builder, cancel).await
    }

    pub async fn get(&self, path: &str, cancel: &CancellationToken) -> Result<ProbeResponse> {
        self.request(Method::GET, path, &HeaderMap::new(), None, cancel).await
    }

    /// `request` with exponential backoff on transport errors and 429/502/503/504.
    /// When attempts run out the last response is returned as is.
    pub async fn request_with_retry(
        &self,
        method: Method,
        path: &str,
        headers: &HeaderMap,
        body: Option<&Value>,
        cancel: &CancellationToken,
    ) -> Result<ProbeResponse> {
        let retry = RetryConfigBuilder::new()
            .max_attempts(self.config.max_attempts)
            .exponential_backoff(self.config.base_backoff, Duration::from_secs(3600))
            .no_max_duration()
            .build();
        RetryExecutor::new(retry)
            .execute(
                cancel,
                |attempt| {
                    if attempt > 0 {
                        tracing::debug!(%path, attempt, "retrying probe");
                    }
                    self.request(method.clone(), path, headers, body, cancel)
                },
                is_retryable,
            )
            .await
    }

    /// Multipart upload. The body's own `Content-Type` (with boundary) always
    /// replaces one supplied by the caller.
    pub async fn upload_multipart(
        &self,
        path: &str,
        headers: &HeaderMap,
        fields: &[(&str, &str)],
        files: Vec<MultipartFile>,
        cancel: &CancellationToken,
    ) -> Result<ProbeResponse> {
        let mut form = Form::new();
        for (name, value) in fields {
            form = form.text(name.to_string(), value.to_string());
        }
        for file in files {
            let mut part = Part::bytes(file.data.to_vec()).file_name(file.file_name);
            if let Some(content_type) = &file.content_type {
                part = part.mime_str(content_type)?;
            }
            form = form.part(file.field, part);
        }

        let mut headers = self.merged_headers(headers);
        headers.remove(CONTENT_TYPE);
        let builder = self
            .client
            .request(Method::POST, self.url(path)?)
            .headers(headers)
            .multipart(form);
        self.send(builder, cancel).await
    }

    /// `POST /v1/templates` with the fields the service expects
    pub async fn upload_template(
        &self,
        template: impl Into<Bytes>,
        format: OutputFormat,
        description: &str,
        cancel: &CancellationToken,
    ) -> Result<ProbeResponse> {
        let file = MultipartFile::new("template", "template.tpl", template).with_content_type("text/plain");
        self.upload_multipart(
            "/v1/templates",
            &HeaderMap::new(),
            &[("outputFormat", format.as_str()), ("description", description)],
            vec![file],
            cancel,
        )
        .await
    }

    /// `POST /v1/reports`; anything but 2xx is an error
    pub async fn create_report(&self, request: &CreateReportRequest, cancel: &CancellationToken) -> Result<ReportProbe> {
        let body = serde_json::to_value(request)?;
        self.request(Method::POST, "/v1/reports", &HeaderMap::new(), Some(&body), cancel)
            .await?
            .error_for_status()?
            .json()
    }

    pub async fn get_report_status(
        &self,
        id: &str,
        headers: &HeaderMap,
        cancel: &CancellationToken,
    ) -> Result<ReportProbe> {
        let path = format!("/v1/reports/{}", id);
        self.request(Method::GET, &path, headers, None, cancel)
            .await?
            .error_for_status()?
            .json()
    }

    pub async fn list_reports(
        &self,
        headers: &HeaderMap,
        query: &[(&str, &str)],
        cancel: &CancellationToken,
    ) -> Result<Vec<ReportProbe>> {
        let mut path = String::from("/v1/reports");
        if !query.is_empty() {
            let encoded = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(query)
                .finish();
            path.push('?');
            path.push_str(&encoded);
        }
        let list: ReportList = self
            .request(Method::GET, &path, headers, None, cancel)
            .await?
            .error_for_status()?
            .json()?;
        Ok(list.into_items())
    }

    /// Poll once per interval until the report reaches `expected`.
    ///
    /// Transport errors are tolerated while polling. Any other failure, a
    /// report leaving a terminal state, or reaching a different terminal
    /// state ends the wait early.
    pub async fn wait_for_report_status(
        &self,
        id: &str,
        headers: &HeaderMap,
        expected: ReportStatus,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ReportProbe> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut last: Option<ReportStatus> = None;

        loop {
            match self.get_report_status(id, headers, cancel).await {
                Ok(probe) => {
                    if let Some(previous) = last {
                        previous.check_transition(probe.status)?;
                    }
                    last = Some(probe.status);
                    if probe.status == expected {
                        return Ok(probe);
                    }
                    if probe.status.is_terminal() {
                        return Err(HarnessError::ConvergenceFailure {
                            stuck_ids: vec![id.to_string()],
                            last_status: probe.status.to_string(),
                            after: started.elapsed(),
                        });
                    }
                }
                Err(HarnessError::Transport(e)) => {
                    tracing::debug!(report = %id, error = %e, "status poll failed");
                }
                Err(e) => return Err(e),
            }

            if Instant::now() + self.config.poll_interval > deadline {
                let last_status = last.map_or_else(|| "unobserved".to_string(), |s| s.to_string());
                tracing::warn!(report = %id, %last_status, ?timeout, "report did not converge");
                return Err(HarnessError::ConvergenceFailure {
                    stuck_ids: vec![id.to_string()],
                    last_status,
                    after: timeout,
                });
            }
            sleep_cancellable(cancel, self.config.poll_interval).await?;
        }
    }

    /// One health observation: `/health == 200`, or `/v1/templates?limit=1`
    /// answering 200 or 401
    pub async fn is_system_healthy(&self, cancel: &CancellationToken) -> Result<bool> {
        match self.get("/health", cancel).await {
            Ok(resp) if resp.status == StatusCode::OK => return Ok(true),
            Err(HarnessError::Cancelled) => return Err(HarnessError::Cancelled),
            _ => {}
        }
        match self.get("/v1/templates?limit=1", cancel).await {
            Ok(resp) => Ok(matches!(resp.status_code(), 200 | 401)),
            Err(HarnessError::Cancelled) => Err(HarnessError::Cancelled),
            Err(_) => Ok(false),
        }
    }

    /// Poll health until it holds or `timeout` passes
    pub async fn wait_for_system_health(&self, timeout: Duration, cancel: &CancellationToken) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_system_healthy(cancel).await? {
                return Ok(());
            }
            if Instant::now() + self.config.poll_interval > deadline {
                return Err(HarnessError::ConvergenceFailure {
                    stuck_ids: Vec::new(),
                    last_status: "unhealthy".to_string(),
                    after: timeout,
                });
            }
            sleep_cancellable(cancel, self.config.poll_interval).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16) -> Result<ProbeResponse> {
        Ok(ProbeResponse {
            status: StatusCode::from_u16(status).unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            elapsed: Duration::ZERO,
        })
    }

    #[test]
    fn test_retry_classification() {
        for status in RETRYABLE_STATUSES {
            assert!(is_retryable(&response(status)));
        }
        assert!(!is_retryable(&response(500)));
        assert!(!is_retryable(&response(404)));
        assert!(!is_retryable(&response(201)));
        assert!(is_retryable(&Err(HarnessError::Transport("reset".into()))));
        assert!(!is_retryable(&Err(HarnessError::Cancelled)));
    }

    #[test]
    fn test_error_for_status() {
        let err = response(422).unwrap().error_for_status().unwrap_err();
        assert!(matches!(err, HarnessError::UnexpectedStatus { status: 422, .. }));
        assert!(response(204).unwrap().error_for_status().is_ok());
    }

    #[test]
    fn test_paths_join_base() {
        let client = HttpProbeClient::new("http://127.0.0.1:8080", ProbeConfig::default()).unwrap();
        assert_eq!(
            client.url("/v1/templates?limit=1").unwrap().as_str(),
            "http://127.0.0.1:8080/v1/templates?limit=1"
        );
    }

    #[test]
    fn test_bearer_token_is_default_header() {
        let client = HttpProbeClient::new("http://127.0.0.1:8080", ProbeConfig::default())
            .unwrap()
            .with_bearer_token("secret")
            .unwrap();
        let merged = client.merged_headers(&HeaderMap::new());
        assert_eq!(merged.get(AUTHORIZATION).unwrap(), "Bearer secret");
    }

    #[test]
    fn test_caller_headers_replace_defaults_and_keep_every_value() {
        let client = HttpProbeClient::new("http://127.0.0.1:8080", ProbeConfig::default())
            .unwrap()
            .with_bearer_token("secret")
            .unwrap();
        let mut headers = HeaderMap::new();
        headers.append(AUTHORIZATION, HeaderValue::from_static("Bearer caller"));
        headers.append("x-tenant", HeaderValue::from_static("a"));
        headers.append("x-tenant", HeaderValue::from_static("b"));

        let merged = client.merged_headers(&headers);
        let tenants: Vec<_> = merged.get_all("x-tenant").iter().collect();
        assert_eq!(tenants, vec!["a", "b"]);
        let auth: Vec<_> = merged.get_all(AUTHORIZATION).iter().collect();
        assert_eq!(auth, vec!["Bearer caller"]);
    }
}

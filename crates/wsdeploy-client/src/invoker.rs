//! Request invoker
//!
//! One logical API call in, one normalized response or classified
//! [`InvokeError`] out. Retry on throttling and server errors, a single
//! forced token refresh on 401/403, and long-running operation polling all
//! happen here so callers never see intermediate responses.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, info, instrument, Level};

use crate::error::InvokeError;
use crate::policy::{parse_retry_after, RetryPolicy};
use crate::token::{AccessToken, TokenManager};
use crate::transport::{Attachment, HttpRequest, HttpTransport, Method, RawResponse, TransportError};
use crate::Result;

/// Header the platform uses to carry a machine-readable error code
pub const API_ERROR_CODE_HEADER: &str = "x-ms-public-api-error-code";

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";
const LOGGED_BODY_LIMIT: usize = 2048;

/// A logical call, before authentication is attached
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    method: Method,
    url: String,
    headers: BTreeMap<String, String>,
    body: Option<Value>,
    attachments: Vec<Attachment>,
    max_retries: Option<u32>,
}

impl InvokeRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        InvokeRequest {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
            attachments: Vec::new(),
            max_retries: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn patch(url: impl Into<String>) -> Self {
        Self::new(Method::PATCH, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Override the policy's retry limits for this call only
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Like [`InvokeRequest::max_retries`] but a `None` leaves the policy untouched
    pub fn max_retries_opt(mut self, max_retries: Option<u32>) -> Self {
        if max_retries.is_some() {
            self.max_retries = max_retries;
        }
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn authorized(&self, token: &AccessToken) -> HttpRequest {
        let mut headers = self.headers.clone();
        headers.insert(
            "Authorization".to_string(),
            format!("Bearer {}", token.secret()),
        );
        if self.attachments.is_empty() && self.body.is_some() {
            headers
                .entry("Content-Type".to_string())
                .or_insert_with(|| JSON_CONTENT_TYPE.to_string());
        }
        HttpRequest {
            method: self.method.clone(),
            url: self.url.clone(),
            headers,
            body: self.body.clone(),
            attachments: self.attachments.clone(),
        }
    }
}

/// Parsed response body
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(Value),
    Bytes(Vec<u8>),
    Empty,
}

impl ResponseBody {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResponseBody::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_json(self) -> Option<Value> {
        match self {
            ResponseBody::Json(value) => Some(value),
            _ => None,
        }
    }
}

/// Normalized successful response
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeResponse {
    pub status_code: u16,
    /// Header names are lowercased
    pub headers: BTreeMap<String, String>,
    pub body: ResponseBody,
}

impl InvokeResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    fn from_raw(raw: RawResponse) -> Result<Self> {
        let body = if raw.body.iter().all(u8::is_ascii_whitespace) {
            ResponseBody::Empty
        } else if raw.is_json() {
            ResponseBody::Json(serde_json::from_slice(&raw.body)?)
        } else {
            ResponseBody::Bytes(raw.body)
        };
        Ok(InvokeResponse {
            status_code: raw.status,
            headers: raw.headers,
            body,
        })
    }
}

/// State reported by a long-running operation poll
#[derive(Debug, Clone, PartialEq)]
enum OperationState {
    Running,
    Succeeded,
    Failed { code: String, message: String },
    Undefined,
}

impl OperationState {
    fn of(response: &InvokeResponse) -> Self {
        let status = response
            .body
            .as_json()
            .and_then(|body| body.get("status"))
            .and_then(Value::as_str);
        match status {
            Some("Succeeded") => OperationState::Succeeded,
            Some("Failed") => {
                let error = response
                    .body
                    .as_json()
                    .and_then(|body| body.get("error"));
                let field = |name: &str| {
                    error
                        .and_then(|err| err.get(name))
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string()
                };
                OperationState::Failed {
                    code: field("errorCode"),
                    message: field("message"),
                }
            }
            Some("Undefined") => OperationState::Undefined,
            Some(_) => OperationState::Running,
            // A poll answered with the resource itself means the work is done,
            // unless the server is still saying "accepted".
            None if response.status_code == 202 => OperationState::Running,
            None => OperationState::Succeeded,
        }
    }
}

/// Issues logical API calls with retry, refresh and polling policy applied
pub struct RequestInvoker {
    transport: Arc<dyn HttpTransport>,
    tokens: Arc<TokenManager>,
    policy: RetryPolicy,
}

impl RequestInvoker {
    pub fn new(transport: Arc<dyn HttpTransport>, tokens: Arc<TokenManager>, policy: RetryPolicy) -> Self {
        RequestInvoker {
            transport,
            tokens,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// Perform one logical call.
    ///
    /// A 202 is followed to the end of its long-running operation and the
    /// terminal result is returned as if the original call produced it.
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    pub async fn invoke(&self, request: InvokeRequest) -> Result<InvokeResponse> {
        let policy = match request.max_retries {
            Some(max_retries) => self.policy.with_max_retries(max_retries),
            None => self.policy.clone(),
        };

        let raw = self.send_with_retry(&request, &policy).await?;
        if raw.status == 202 {
            return self.await_operation(&request, raw, &policy).await;
        }
        finish(&request, raw)
    }

    async fn send_with_retry(&self, request: &InvokeRequest, policy: &RetryPolicy) -> Result<RawResponse> {
        let mut attempts: u32 = 0;
        let mut throttled: u32 = 0;
        let mut transient: u32 = 0;
        let mut refreshed = false;
        let mut token = self.tokens.get_token().await?;

        loop {
            attempts += 1;
            let outgoing = request.authorized(&token);
            let result = self.transport.send(&outgoing).await;
            log_exchange(&outgoing, &result);

            match result {
                Err(err) if !err.is_retryable() => {
                    return Err(InvokeError::InvalidRequest(err.to_string()));
                }
                Err(err) => {
                    transient += 1;
                    if transient >= policy.max_transient_attempts {
                        return Err(exhausted(request, attempts, err.to_string()));
                    }
                    let delay = policy.backoff_delay(transient);
                    info!(
                        event = "transport_retry",
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transport failure; retrying"
                    );
                    sleep(delay).await;
                }
                Ok(raw) if raw.status == 429 => {
                    if throttled >= policy.max_throttle_retries {
                        return Err(InvokeError::Throttled {
                            method: request.method.to_string(),
                            url: request.url.clone(),
                            attempts,
                        });
                    }
                    throttled += 1;
                    let delay = policy.throttle_delay(retry_after(&raw));
                    info!(
                        event = "throttled",
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "API is throttled; waiting before retry"
                    );
                    sleep(delay).await;
                }
                Ok(raw) if raw.status >= 500 => {
                    transient += 1;
                    if transient >= policy.max_transient_attempts {
                        let detail = format!("status {}: {}", raw.status, truncate(&raw.text()));
                        return Err(exhausted(request, attempts, detail));
                    }
                    let delay = policy.backoff_delay(transient);
                    info!(
                        event = "server_retry",
                        attempt = attempts,
                        status = raw.status,
                        delay_ms = delay.as_millis() as u64,
                        "Server error; retrying"
                    );
                    sleep(delay).await;
                }
                Ok(raw) if is_retryable_client_error(&raw, policy) => {
                    transient += 1;
                    if transient >= policy.max_transient_attempts {
                        return Ok(raw);
                    }
                    let delay = policy.backoff_delay(transient);
                    info!(
                        event = "client_error_retry",
                        attempt = attempts,
                        status = raw.status,
                        delay_ms = delay.as_millis() as u64,
                        "Retryable API error; retrying"
                    );
                    sleep(delay).await;
                }
                Ok(raw) if raw.status == 401 || raw.status == 403 => {
                    if refreshed {
                        return Err(InvokeError::Auth {
                            method: request.method.to_string(),
                            url: request.url.clone(),
                            status: raw.status,
                        });
                    }
                    refreshed = true;
                    info!(
                        event = "auth_retry",
                        status = raw.status,
                        "Credentials rejected; refreshing token once"
                    );
                    token = self.tokens.invalidate(&token).await?;
                }
                Ok(raw) => return Ok(raw),
            }
        }
    }

    async fn await_operation(
        &self,
        origin: &InvokeRequest,
        accepted: RawResponse,
        policy: &RetryPolicy,
    ) -> Result<InvokeResponse> {
        let mut location = accepted
            .header("location")
            .map(str::to_string)
            .ok_or_else(|| InvokeError::MissingLocation {
                url: origin.url.clone(),
            })?;
        let mut delay = policy.poll_delay(retry_after(&accepted));
        let mut polls: u32 = 0;

        loop {
            if polls >= policy.max_poll_attempts {
                return Err(InvokeError::OperationTimedOut { polls });
            }
            sleep(delay).await;
            polls += 1;

            let poll = InvokeRequest::get(location.clone());
            let raw = self.send_with_retry(&poll, policy).await?;
            let next_delay = policy.poll_delay(retry_after(&raw));
            let response = finish(&poll, raw)?;

            match OperationState::of(&response) {
                OperationState::Running => {
                    debug!(polls, location = %location, "Operation in progress");
                    if let Some(next) = response.header("location") {
                        location = next.to_string();
                    }
                    delay = next_delay;
                }
                OperationState::Succeeded => {
                    info!(event = "operation_succeeded", polls, "Long-running operation completed");
                    return match response.header("location") {
                        Some(result_url) => {
                            let fetch = InvokeRequest::get(result_url);
                            let raw = self.send_with_retry(&fetch, policy).await?;
                            finish(&fetch, raw)
                        }
                        None => Ok(response),
                    };
                }
                OperationState::Failed { code, message } => {
                    return Err(InvokeError::OperationFailed { code, message });
                }
                OperationState::Undefined => {
                    let body = match &response.body {
                        ResponseBody::Json(value) => value.to_string(),
                        _ => String::new(),
                    };
                    return Err(InvokeError::OperationUndefined { body });
                }
            }
        }
    }
}

fn finish(request: &InvokeRequest, raw: RawResponse) -> Result<InvokeResponse> {
    match raw.status {
        200..=299 => InvokeResponse::from_raw(raw),
        400..=499 => Err(InvokeError::TerminalClient {
            method: request.method.to_string(),
            url: request.url.clone(),
            status: raw.status,
            api_error_code: raw.header(API_ERROR_CODE_HEADER).map(str::to_string),
            body: raw.text(),
        }),
        status => Err(InvokeError::UnexpectedStatus {
            method: request.method.to_string(),
            url: request.url.clone(),
            status,
        }),
    }
}

/// A 4xx whose API error code the policy opted into retrying.
///
/// The code comes from the error-code header, or `errorCode` in a JSON body.
fn is_retryable_client_error(raw: &RawResponse, policy: &RetryPolicy) -> bool {
    if !(400..500).contains(&raw.status) || policy.retryable_error_codes.is_empty() {
        return false;
    }
    if let Some(code) = raw.header(API_ERROR_CODE_HEADER) {
        return policy.retries_error_code(code);
    }
    serde_json::from_slice::<Value>(&raw.body)
        .ok()
        .and_then(|body| body.get("errorCode").and_then(Value::as_str).map(str::to_string))
        .is_some_and(|code| policy.retries_error_code(&code))
}

fn exhausted(request: &InvokeRequest, attempts: u32, detail: String) -> InvokeError {
    InvokeError::TransientServer {
        method: request.method.to_string(),
        url: request.url.clone(),
        attempts,
        detail,
    }
}

fn retry_after(raw: &RawResponse) -> Option<std::time::Duration> {
    raw.header("retry-after").and_then(parse_retry_after)
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(LOGGED_BODY_LIMIT) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn log_exchange(request: &HttpRequest, result: &std::result::Result<RawResponse, TransportError>) {
    if !tracing::enabled!(Level::DEBUG) {
        return;
    }
    let request_body = request
        .body
        .as_ref()
        .map(Value::to_string)
        .unwrap_or_default();
    match result {
        Ok(raw) => debug!(
            method = %request.method,
            url = %request.url,
            attachments = request.attachments.len(),
            request_body = truncate(&request_body),
            status = raw.status,
            response_body = truncate(&raw.text()),
            "HTTP exchange"
        ),
        Err(err) => debug!(
            method = %request.method,
            url = %request.url,
            error = %err,
            "HTTP exchange failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(status: u16, body: Value) -> InvokeResponse {
        InvokeResponse::from_raw(RawResponse::json(status, &body)).unwrap()
    }

    #[test]
    fn operation_state_from_status_field() {
        assert_eq!(
            OperationState::of(&response(200, json!({"status": "Running"}))),
            OperationState::Running
        );
        assert_eq!(
            OperationState::of(&response(200, json!({"status": "NotStarted"}))),
            OperationState::Running
        );
        assert_eq!(
            OperationState::of(&response(200, json!({"status": "Succeeded"}))),
            OperationState::Succeeded
        );
        assert_eq!(
            OperationState::of(&response(200, json!({"status": "Undefined"}))),
            OperationState::Undefined
        );
    }

    #[test]
    fn failed_operation_carries_error_payload() {
        let state = OperationState::of(&response(
            200,
            json!({"status": "Failed", "error": {"errorCode": "ItemNotFound", "message": "gone"}}),
        ));
        assert_eq!(
            state,
            OperationState::Failed {
                code: "ItemNotFound".into(),
                message: "gone".into()
            }
        );
    }

    #[test]
    fn statusless_body_means_done_unless_still_accepted() {
        assert_eq!(
            OperationState::of(&response(200, json!({"id": "abc"}))),
            OperationState::Succeeded
        );
        assert_eq!(
            OperationState::of(&response(202, json!({}))),
            OperationState::Running
        );
    }

    #[test]
    fn non_json_bodies_stay_bytes() {
        let raw = RawResponse::new(200)
            .with_header("content-type", "application/octet-stream")
            .with_body(vec![1, 2, 3]);
        let parsed = InvokeResponse::from_raw(raw).unwrap();
        assert_eq!(parsed.body, ResponseBody::Bytes(vec![1, 2, 3]));

        let empty = InvokeResponse::from_raw(RawResponse::new(204)).unwrap();
        assert_eq!(empty.body, ResponseBody::Empty);
    }

    #[test]
    fn json_content_type_only_set_for_json_bodies() {
        let token = AccessToken::new("tok", chrono::Utc::now());
        let plain = InvokeRequest::get("https://x").authorized(&token);
        assert_eq!(plain.header("authorization"), Some("Bearer tok"));
        assert_eq!(plain.header("content-type"), None);

        let with_body = InvokeRequest::post("https://x")
            .json(json!({"a": 1}))
            .authorized(&token);
        assert_eq!(with_body.header("content-type"), Some(JSON_CONTENT_TYPE));

        let multipart = InvokeRequest::post("https://x")
            .json(json!({"a": 1}))
            .attachment(Attachment::new("file", "a.bin", vec![0]))
            .authorized(&token);
        assert_eq!(multipart.header("content-type"), None);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let long = "é".repeat(LOGGED_BODY_LIMIT + 10);
        assert_eq!(truncate(&long).chars().count(), LOGGED_BODY_LIMIT);
        assert_eq!(truncate("short"), "short");
    }
}

//! Request invoker retry, refresh and long-running operation policy.
//!
//! Every test runs on a paused clock so throttle and backoff sleeps elapse
//! virtually; responses are scripted in arrival order.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wsdeploy_client::fakes::{FakeCredential, ScriptedTransport};
use wsdeploy_client::policy::ITEM_NAME_IN_USE;
use wsdeploy_client::token::DEFAULT_SCOPE;
use wsdeploy_client::{
    InvokeError, InvokeRequest, RawResponse, RequestInvoker, ResponseBody, RetryPolicy,
    TokenManager, TransportError,
};

const URL: &str = "https://api.test/v1/workspaces/ws/items";

struct Harness {
    transport: Arc<ScriptedTransport>,
    credential: Arc<FakeCredential>,
    invoker: RequestInvoker,
}

fn harness(responses: Vec<RawResponse>) -> Harness {
    harness_with(responses, RetryPolicy::default(), FakeCredential::default())
}

fn harness_with(responses: Vec<RawResponse>, policy: RetryPolicy, credential: FakeCredential) -> Harness {
    let transport = Arc::new(ScriptedTransport::with_responses(responses));
    let credential = Arc::new(credential);
    let tokens = Arc::new(TokenManager::new(credential.clone(), DEFAULT_SCOPE));
    let invoker = RequestInvoker::new(transport.clone(), tokens, policy);
    Harness {
        transport,
        credential,
        invoker,
    }
}

fn ok(body: serde_json::Value) -> RawResponse {
    RawResponse::json(200, &body)
}

fn accepted(location: &str) -> RawResponse {
    RawResponse::new(202)
        .with_header("Location", location)
        .with_header("Retry-After", "1")
}

#[tokio::test(start_paused = true)]
async fn throttled_calls_succeed_after_n_plus_one_attempts() {
    let n = 3;
    let mut responses: Vec<RawResponse> = (0..n).map(|_| RawResponse::new(429)).collect();
    responses.push(ok(json!({"value": []})));
    let h = harness(responses);

    let response = h.invoker.invoke(InvokeRequest::get(URL)).await.unwrap();

    assert_eq!(response.status_code, 200);
    assert_eq!(response.body, ResponseBody::Json(json!({"value": []})));
    assert_eq!(h.transport.call_count(), n + 1);
}

#[tokio::test(start_paused = true)]
async fn throttling_beyond_limit_is_terminal() {
    let policy = RetryPolicy::default();
    let limit = policy.max_throttle_retries as usize;
    let responses = (0..=limit).map(|_| RawResponse::new(429)).collect();
    let h = harness_with(responses, policy, FakeCredential::default());

    let err = h.invoker.invoke(InvokeRequest::get(URL)).await.unwrap_err();

    match err {
        InvokeError::Throttled { attempts, .. } => assert_eq!(attempts as usize, limit + 1),
        other => panic!("expected throttled, got {other:?}"),
    }
    assert_eq!(h.transport.call_count(), limit + 1);
}

#[tokio::test(start_paused = true)]
async fn retry_after_header_sets_throttle_wait() {
    let h = harness(vec![
        RawResponse::new(429).with_header("Retry-After", "7"),
        ok(json!({})),
    ]);

    let started = tokio::time::Instant::now();
    h.invoker.invoke(InvokeRequest::get(URL)).await.unwrap();
    let waited = started.elapsed();

    assert!(waited >= Duration::from_secs(7), "waited {waited:?}");
    assert!(waited < Duration::from_secs(8), "waited {waited:?}");
}

#[tokio::test(start_paused = true)]
async fn per_request_retry_override_limits_throttling() {
    let h = harness(vec![RawResponse::new(429), RawResponse::new(429), ok(json!({}))]);

    let err = h
        .invoker
        .invoke(InvokeRequest::get(URL).max_retries(1))
        .await
        .unwrap_err();

    assert!(matches!(err, InvokeError::Throttled { attempts: 2, .. }));
    assert_eq!(h.transport.remaining(), 1);
}

#[tokio::test(start_paused = true)]
async fn server_errors_exhaust_into_transient_failure() {
    let policy = RetryPolicy::default();
    let attempts = policy.max_transient_attempts as usize;
    let responses = (0..attempts).map(|_| RawResponse::new(503)).collect();
    let h = harness_with(responses, policy, FakeCredential::default());

    let err = h.invoker.invoke(InvokeRequest::get(URL)).await.unwrap_err();

    assert!(err.is_retryable());
    match err {
        InvokeError::TransientServer { attempts: seen, detail, .. } => {
            assert_eq!(seen as usize, attempts);
            assert!(detail.contains("503"));
        }
        other => panic!("expected transient failure, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn transport_failure_is_retried() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_error(TransportError::Connect("connection reset".into()));
    transport.push(ok(json!({"id": "1"})));
    let tokens = Arc::new(TokenManager::new(
        Arc::new(FakeCredential::default()),
        DEFAULT_SCOPE,
    ));
    let invoker = RequestInvoker::new(transport.clone(), tokens, RetryPolicy::default());

    let response = invoker.invoke(InvokeRequest::get(URL)).await.unwrap();

    assert_eq!(response.status_code, 200);
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn unauthorized_refreshes_token_exactly_once() {
    let h = harness(vec![RawResponse::new(401), ok(json!({}))]);

    h.invoker.invoke(InvokeRequest::get(URL)).await.unwrap();

    let calls = h.transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].header("authorization"), Some("Bearer token-1"));
    assert_eq!(calls[1].header("authorization"), Some("Bearer token-2"));
    assert_eq!(h.credential.fetch_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn repeated_auth_rejection_is_terminal() {
    let h = harness(vec![RawResponse::new(403), RawResponse::new(403), ok(json!({}))]);

    let err = h.invoker.invoke(InvokeRequest::get(URL)).await.unwrap_err();

    assert!(matches!(err, InvokeError::Auth { status: 403, .. }));
    assert!(err.is_auth());
    assert_eq!(h.transport.call_count(), 2);
    assert_eq!(h.credential.fetch_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn credential_failure_never_reaches_network() {
    let h = harness_with(vec![ok(json!({}))], RetryPolicy::default(), FakeCredential::failing());

    let err = h.invoker.invoke(InvokeRequest::get(URL)).await.unwrap_err();

    assert!(matches!(err, InvokeError::Token(_)));
    assert_eq!(h.transport.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn client_errors_are_terminal_with_api_code() {
    let h = harness(vec![RawResponse::json(
        400,
        &json!({"message": "bad display name"}),
    )
    .with_header("x-ms-public-api-error-code", "InvalidInput")]);

    let err = h
        .invoker
        .invoke(InvokeRequest::post(URL).json(json!({"displayName": ""})))
        .await
        .unwrap_err();

    match err {
        InvokeError::TerminalClient {
            status,
            api_error_code,
            body,
            ..
        } => {
            assert_eq!(status, 400);
            assert_eq!(api_error_code.as_deref(), Some("InvalidInput"));
            assert!(body.contains("bad display name"));
        }
        other => panic!("expected terminal client error, got {other:?}"),
    }
    assert_eq!(h.transport.call_count(), 1);
}

fn name_in_use() -> RawResponse {
    RawResponse::json(
        400,
        &json!({"errorCode": ITEM_NAME_IN_USE, "message": "name is reserved"}),
    )
}

#[tokio::test(start_paused = true)]
async fn opted_in_error_code_is_retried() {
    let policy = RetryPolicy::default().retrying_error_code(ITEM_NAME_IN_USE);
    let h = harness_with(
        vec![name_in_use(), name_in_use(), RawResponse::json(201, &json!({"id": "g-1"}))],
        policy,
        FakeCredential::default(),
    );

    let response = h
        .invoker
        .invoke(InvokeRequest::post(URL).json(json!({"displayName": "etl"})))
        .await
        .unwrap();

    assert_eq!(response.status_code, 201);
    assert_eq!(h.transport.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn error_codes_are_terminal_unless_opted_in() {
    let h = harness(vec![name_in_use(), RawResponse::new(201)]);

    let err = h.invoker.invoke(InvokeRequest::post(URL)).await.unwrap_err();

    assert!(matches!(err, InvokeError::TerminalClient { status: 400, .. }), "{err:?}");
    assert_eq!(h.transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn opted_in_error_code_gives_up_after_transient_limit() {
    let policy = RetryPolicy {
        max_transient_attempts: 3,
        ..RetryPolicy::default()
    }
    .retrying_error_code(ITEM_NAME_IN_USE);
    let h = harness_with(
        (0..5).map(|_| name_in_use()).collect(),
        policy,
        FakeCredential::default(),
    );

    let err = h.invoker.invoke(InvokeRequest::post(URL)).await.unwrap_err();

    assert!(matches!(err, InvokeError::TerminalClient { status: 400, .. }), "{err:?}");
    assert_eq!(h.transport.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn long_running_operation_returns_terminal_payload() {
    let n = 4;
    let operation = "https://api.test/v1/operations/op-1";
    let terminal = json!({"status": "Succeeded", "percentComplete": 100});

    let mut responses = vec![accepted(operation)];
    responses.extend((0..n).map(|_| ok(json!({"status": "Running"}))));
    responses.push(ok(terminal.clone()));
    let h = harness(responses);

    let response = h
        .invoker
        .invoke(InvokeRequest::post(URL).json(json!({"displayName": "nb"})))
        .await
        .unwrap();

    assert_eq!(response.body, ResponseBody::Json(terminal));
    assert_eq!(h.transport.call_count(), n + 2);
    assert!(h.transport.calls()[1..].iter().all(|call| call.url == operation));
}

#[tokio::test(start_paused = true)]
async fn succeeded_operation_with_location_fetches_result() {
    let result_url = "https://api.test/v1/operations/op-1/result";
    let h = harness(vec![
        accepted("https://api.test/v1/operations/op-1"),
        ok(json!({"status": "Succeeded"})).with_header("Location", result_url),
        ok(json!({"id": "guid-1", "displayName": "nb"})),
    ]);

    let response = h.invoker.invoke(InvokeRequest::post(URL)).await.unwrap();

    assert_eq!(
        response.body.as_json().and_then(|b| b.get("id")).cloned(),
        Some(json!("guid-1"))
    );
    let calls = h.transport.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[2].url, result_url);
}

#[tokio::test(start_paused = true)]
async fn polling_survives_throttling() {
    let h = harness(vec![
        accepted("https://api.test/v1/operations/op-1"),
        RawResponse::new(429).with_header("Retry-After", "1"),
        ok(json!({"status": "Succeeded"})),
    ]);

    let response = h.invoker.invoke(InvokeRequest::post(URL)).await.unwrap();

    assert_eq!(response.status_code, 200);
    assert_eq!(h.transport.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn failed_operation_surfaces_error_payload() {
    let h = harness(vec![
        accepted("https://api.test/v1/operations/op-1"),
        ok(json!({
            "status": "Failed",
            "error": {"errorCode": "ItemDisplayNameAlreadyInUse", "message": "name taken"}
        })),
    ]);

    let err = h.invoker.invoke(InvokeRequest::post(URL)).await.unwrap_err();

    match err {
        InvokeError::OperationFailed { code, message } => {
            assert_eq!(code, "ItemDisplayNameAlreadyInUse");
            assert_eq!(message, "name taken");
        }
        other => panic!("expected operation failure, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn undefined_operation_is_a_failure() {
    let h = harness(vec![
        accepted("https://api.test/v1/operations/op-1"),
        ok(json!({"status": "Undefined"})),
    ]);

    let err = h.invoker.invoke(InvokeRequest::post(URL)).await.unwrap_err();

    assert!(matches!(err, InvokeError::OperationUndefined { .. }));
}

#[tokio::test(start_paused = true)]
async fn polling_is_bounded() {
    let policy = RetryPolicy {
        max_poll_attempts: 3,
        ..RetryPolicy::default()
    };
    let mut responses = vec![accepted("https://api.test/v1/operations/op-1")];
    responses.extend((0..10).map(|_| ok(json!({"status": "Running"}))));
    let h = harness_with(responses, policy, FakeCredential::default());

    let err = h.invoker.invoke(InvokeRequest::post(URL)).await.unwrap_err();

    assert!(matches!(err, InvokeError::OperationTimedOut { polls: 3 }));
    assert_eq!(h.transport.call_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn accepted_without_location_is_an_error() {
    let h = harness(vec![RawResponse::new(202)]);

    let err = h.invoker.invoke(InvokeRequest::post(URL)).await.unwrap_err();

    assert!(matches!(err, InvokeError::MissingLocation { .. }));
}

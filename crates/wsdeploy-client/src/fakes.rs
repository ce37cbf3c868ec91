//! In-memory fakes for the invocation layer (for testing)
//!
//! Scripted transports record every request they see; the fake credential
//! counts refreshes and can be slowed down to widen race windows.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::token::{AccessToken, CredentialSource};
use crate::transport::{HttpRequest, HttpTransport, RawResponse, TransportError};

/// Transport that replays a fixed queue of responses in order
#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<RawResponse, TransportError>>>,
    calls: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: impl IntoIterator<Item = RawResponse>) -> Self {
        let transport = Self::new();
        for response in responses {
            transport.push(response);
        }
        transport
    }

    pub fn push(&self, response: RawResponse) {
        self.responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(Ok(response));
    }

    pub fn push_error(&self, error: TransportError) {
        self.responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(Err(error));
    }

    /// Every request sent so far, in order
    pub fn calls(&self) -> Vec<HttpRequest> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn remaining(&self) -> usize {
        self.responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: &HttpRequest) -> Result<RawResponse, TransportError> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.clone());
        self.responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Other("no scripted response left".to_string())))
    }
}

type Responder = dyn Fn(&HttpRequest) -> Result<RawResponse, TransportError> + Send + Sync;

/// Transport that answers each request with a closure
///
/// Suited to concurrent tests where arrival order is not deterministic.
pub struct FnTransport {
    responder: Box<Responder>,
    calls: Mutex<Vec<HttpRequest>>,
}

impl FnTransport {
    pub fn new(
        responder: impl Fn(&HttpRequest) -> Result<RawResponse, TransportError> + Send + Sync + 'static,
    ) -> Self {
        FnTransport {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<HttpRequest> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Requests whose URL contains `fragment`
    pub fn calls_matching(&self, fragment: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.url.contains(fragment))
            .count()
    }
}

#[async_trait]
impl HttpTransport for FnTransport {
    async fn send(&self, request: &HttpRequest) -> Result<RawResponse, TransportError> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.clone());
        (self.responder)(request)
    }
}

/// Credential source handing out `token-1`, `token-2`, ...
pub struct FakeCredential {
    lifetime: Duration,
    delay: Option<Duration>,
    fail: bool,
    fetches: AtomicU64,
}

impl FakeCredential {
    pub fn new(lifetime: Duration) -> Self {
        FakeCredential {
            lifetime,
            delay: None,
            fail: false,
            fetches: AtomicU64::new(0),
        }
    }

    /// Credential whose every fetch fails
    pub fn failing() -> Self {
        FakeCredential {
            fail: true,
            ..Self::new(Duration::from_secs(3600))
        }
    }

    /// Sleep this long inside every fetch
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl Default for FakeCredential {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

#[async_trait]
impl CredentialSource for FakeCredential {
    async fn fetch_token(&self, _scope: &str) -> anyhow::Result<AccessToken> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            anyhow::bail!("credential unavailable");
        }
        let lifetime = chrono::Duration::from_std(self.lifetime)?;
        Ok(AccessToken::new(format!("token-{n}"), Utc::now() + lifetime))
    }
}


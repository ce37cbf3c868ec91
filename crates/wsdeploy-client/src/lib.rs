//! wsdeploy-client: remote invocation layer for workspace deployments
//!
//! Turns a logical API call into a reliable network operation:
//!
//! - bearer tokens are cached and refreshed single-flight by [`TokenManager`]
//! - throttling (429), server errors and transport failures are retried by
//!   [`RequestInvoker`] under a [`RetryPolicy`]
//! - `202 Accepted` long-running operations are polled until they reach a
//!   terminal state
//!
//! [`WorkspaceApi`] layers the workspace item endpoints on top of the invoker.
//! The transport is a trait ([`HttpTransport`]) so the whole stack can be
//! driven from in-memory fakes in tests.

pub mod api;
pub mod error;
pub mod fakes;
pub mod invoker;
pub mod policy;
pub mod token;
pub mod transport;

pub use api::{DefinitionPart, ItemDefinition, NewItem, RemoteItem, WorkspaceApi};
pub use error::InvokeError;
pub use invoker::{InvokeRequest, InvokeResponse, RequestInvoker, ResponseBody};
pub use policy::{parse_retry_after, RetryPolicy};
pub use token::{AccessToken, CredentialSource, TokenError, TokenManager};
pub use transport::{
    Attachment, HttpRequest, HttpTransport, Method, RawResponse, ReqwestTransport, TransportError,
};

/// Result type for invocation operations
pub type Result<T> = std::result::Result<T, InvokeError>;

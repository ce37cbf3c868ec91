//! Error types for deployment orchestration.

use std::path::PathBuf;

use thiserror::Error;
use wsdeploy_client::InvokeError;

use crate::item::ItemType;
use crate::outcome::Operation;

/// Run-level failures. Any of these stops a run before or between stages.
#[derive(Debug, Error)]
pub enum DeployError {
    /// The dependency edges contain a cycle; nothing was published.
    #[error("dependency cycle detected involving: {nodes:?}")]
    DependencyCycle { nodes: Vec<String> },

    /// Items of a type with no registered publisher.
    #[error("no publisher registered for item type {item_type}")]
    NoPublisher { item_type: String },

    /// Two items of one type share a name.
    #[error("duplicate {item_type} item named {name:?}")]
    DuplicateItem { item_type: String, name: String },

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Repository content could not be turned into items.
    #[error("discovery failed at {path}: {reason}")]
    Discovery { path: PathBuf, reason: String },

    /// Remote call outside any single item (e.g. listing the workspace).
    #[error("remote call failed: {0}")]
    Invoke(#[from] InvokeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl DeployError {
    /// Whether retrying the whole run later could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeployError::Invoke(err) if err.is_retryable())
    }
}

/// Convenience result alias.
pub type DeployResult<T> = std::result::Result<T, DeployError>;

/// Why one item failed to publish or unpublish.
#[derive(Debug, Error)]
pub enum ItemFailure {
    #[error(transparent)]
    Invoke(#[from] InvokeError),

    /// A referenced item was not available.
    #[error("unresolved dependency: {0}")]
    Dependency(String),

    /// The item's own files are unusable.
    #[error("invalid item content: {0}")]
    Content(String),

    /// The publisher does not support this operation.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Failure raised by an externally supplied publisher.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ItemFailure {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ItemFailure::Invoke(err) if err.is_retryable())
    }
}

/// A failed attempt, tied to the item it belongs to.
#[derive(Debug, Error)]
#[error("{operation} of {item_type} {item_name:?} failed: {cause}")]
pub struct PublishError {
    pub item_type: ItemType,
    pub item_name: String,
    pub operation: Operation,
    #[source]
    pub cause: ItemFailure,
    pub retryable: bool,
}

impl PublishError {
    pub fn new(item_type: ItemType, item_name: impl Into<String>, operation: Operation, cause: ItemFailure) -> Self {
        let retryable = cause.is_retryable();
        PublishError {
            item_type,
            item_name: item_name.into(),
            operation,
            cause,
            retryable,
        }
    }
}

//! The per-type publishing capability.

use std::collections::BTreeSet;

use async_trait::async_trait;
use regex::Regex;

use crate::error::ItemFailure;
use crate::item::{Item, ItemFile, ItemType};

/// Result of publishing one item: the remote guid when known.
pub type PublishResult = Result<Option<String>, ItemFailure>;

/// How the orchestrator drives a publisher within its stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishMode {
    /// One `publish_one` call per item, fanned out up to `max_workers`.
    #[default]
    PerItem,
    /// A single `publish_all` call for the whole stage.
    Bulk,
}

/// Publishes and removes items of one type.
///
/// Only `item_type`, `publish_one` and `unpublish_one` are required; the rest
/// have defaults that suit most types.
#[async_trait]
pub trait Publisher: Send + Sync {
    fn item_type(&self) -> ItemType;

    fn mode(&self) -> PublishMode {
        PublishMode::PerItem
    }

    /// Files whose relative path matches are never uploaded.
    fn exclude_pattern(&self) -> Option<&Regex> {
        None
    }

    /// Outcomes of hidden publishers are kept out of the visible report
    /// but still decide whether the run succeeded.
    fn hidden_from_log(&self) -> bool {
        false
    }

    /// Names of peers (same type) that `item` must be published after.
    fn discover_references(&self, _item: &Item, _peers: &[&Item]) -> BTreeSet<String> {
        BTreeSet::new()
    }

    /// Whether `file` should be left out of the uploaded definition.
    fn excludes_file(&self, file: &ItemFile) -> bool {
        file.is_platform()
            || self
                .exclude_pattern()
                .map(|pattern| pattern.is_match(file.relative_path()))
                .unwrap_or(false)
    }

    async fn publish_one(&self, item: &Item) -> PublishResult;

    /// Publish a whole stage. Results are `(item name, result)` pairs.
    async fn publish_all(&self, items: &[&Item]) -> Vec<(String, PublishResult)> {
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            results.push((item.name().to_string(), self.publish_one(item).await));
        }
        results
    }

    async fn unpublish_one(&self, item: &Item) -> Result<(), ItemFailure>;
}

//! Item type → publisher registry.
//!
//! Populated once at startup and shared read-only (behind an `Arc`) by every
//! worker of a run.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use regex::Regex;
use wsdeploy_client::WorkspaceApi;

use crate::catalog::CATALOG;
use crate::item::ItemType;
use crate::items_api::ItemsApiPublisher;
use crate::publisher::Publisher;

/// Knobs applied to every catalog publisher.
#[derive(Debug, Clone, Default)]
pub struct CatalogSettings {
    /// Files matching this pattern are never uploaded
    pub exclude_files: Option<Regex>,
    /// Per-type retry limits replacing the policy default
    pub retry_overrides: HashMap<ItemType, u32>,
}

#[derive(Default, Clone)]
pub struct PublisherRegistry {
    publishers: BTreeMap<ItemType, Arc<dyn Publisher>>,
}

impl PublisherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding an items-API publisher for every catalog type.
    pub fn with_catalog(api: Arc<WorkspaceApi>, settings: &CatalogSettings) -> Self {
        let mut registry = Self::new();
        for entry in CATALOG {
            let publisher = ItemsApiPublisher::new(api.clone(), entry.item_type.clone())
                .shell_only(entry.shell_only)
                .scan_references(entry.scans_references)
                .max_retries(settings.retry_overrides.get(&entry.item_type).copied())
                .exclude(settings.exclude_files.clone());
            registry.register(Arc::new(publisher));
        }
        registry
    }

    /// Add or replace the publisher for its type; returns the one replaced.
    pub fn register(&mut self, publisher: Arc<dyn Publisher>) -> Option<Arc<dyn Publisher>> {
        self.publishers.insert(publisher.item_type(), publisher)
    }

    pub fn get(&self, item_type: &ItemType) -> Option<Arc<dyn Publisher>> {
        self.publishers.get(item_type).cloned()
    }

    pub fn contains(&self, item_type: &ItemType) -> bool {
        self.publishers.contains_key(item_type)
    }

    pub fn types(&self) -> impl Iterator<Item = &ItemType> {
        self.publishers.keys()
    }

    pub fn len(&self) -> usize {
        self.publishers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }
}

impl std::fmt::Debug for PublisherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherRegistry")
            .field("types", &self.publishers.keys().collect::<Vec<_>>())
            .finish()
    }
}

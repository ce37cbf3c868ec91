//! Matching repository items against what is already deployed.

use std::collections::{BTreeSet, HashMap};

use regex::Regex;
use tracing::{debug, info};
use wsdeploy_client::RemoteItem;

use crate::catalog;
use crate::item::{Item, ItemType};

/// Items as listed by the remote workspace. They carry a guid but no files.
pub fn deployed_items(remote: Vec<RemoteItem>) -> Vec<Item> {
    remote
        .into_iter()
        .map(|remote| {
            Item::new(
                ItemType::new(remote.item_type),
                remote.display_name,
                remote.description,
                "",
            )
            .with_guid(remote.id)
        })
        .collect()
}

/// Copy remote guids onto repository items matched by type and name.
///
/// Returns how many items were matched.
pub fn apply_remote_guids(items: &mut [Item], deployed: &[Item]) -> usize {
    let guids: HashMap<(&ItemType, &str), &str> = deployed
        .iter()
        .map(|item| ((item.item_type(), item.name()), item.guid()))
        .collect();

    let mut matched = 0;
    for item in items.iter_mut() {
        let guid = guids.get(&(item.item_type(), item.name())).map(|guid| guid.to_string());
        if let Some(guid) = guid {
            item.set_guid(guid);
            matched += 1;
        }
    }
    debug!(matched, total = items.len(), "Applied remote guids");
    matched
}

/// Which deployed items an orphan sweep may remove.
#[derive(Debug, Clone, Default)]
pub struct OrphanFilter {
    /// Deployed names matching this are kept
    pub exclude: Option<Regex>,
    /// Gated types (Lakehouse, Warehouse, SQLDatabase) that may still be removed
    pub allow_types: BTreeSet<ItemType>,
    /// When set, only these types are considered
    pub in_scope: Option<BTreeSet<ItemType>>,
}

impl OrphanFilter {
    fn keeps(&self, item: &Item) -> Option<&'static str> {
        if let Some(scope) = &self.in_scope {
            if !scope.contains(item.item_type()) {
                return Some("out of scope");
            }
        }
        if self
            .exclude
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(item.name()))
        {
            return Some("excluded by pattern");
        }
        let gated = catalog::gated_unpublish_types().any(|gated| gated == item.item_type());
        if gated && !self.allow_types.contains(item.item_type()) {
            return Some("type removal not enabled");
        }
        None
    }
}

/// Deployed items with no repository counterpart of the same type and name,
/// minus those the filter keeps.
pub fn find_orphans(repository: &[Item], deployed: Vec<Item>, filter: &OrphanFilter) -> Vec<Item> {
    let present: BTreeSet<(&ItemType, &str)> = repository
        .iter()
        .map(|item| (item.item_type(), item.name()))
        .collect();

    deployed
        .into_iter()
        .filter(|item| !present.contains(&(item.item_type(), item.name())))
        .filter(|item| match filter.keeps(item) {
            Some(reason) => {
                info!(item_type = %item.item_type(), item_name = item.name(), reason, "Keeping deployed item");
                false
            }
            None => true,
        })
        .collect()
}

//! Generic publisher backed by the workspace items API.
//!
//! Creates the item when it has no guid yet, otherwise replaces its
//! definition and then its metadata. Shell-only types skip the definition.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info};
use wsdeploy_client::{DefinitionPart, ItemDefinition, NewItem, WorkspaceApi};

use crate::error::ItemFailure;
use crate::item::{Item, ItemType};
use crate::publisher::{PublishResult, Publisher};

pub struct ItemsApiPublisher {
    api: Arc<WorkspaceApi>,
    item_type: ItemType,
    shell_only: bool,
    scan_references: bool,
    max_retries: Option<u32>,
    exclude: Option<Regex>,
}

impl ItemsApiPublisher {
    pub fn new(api: Arc<WorkspaceApi>, item_type: ItemType) -> Self {
        ItemsApiPublisher {
            api,
            item_type,
            shell_only: false,
            scan_references: false,
            max_retries: None,
            exclude: None,
        }
    }

    pub fn shell_only(mut self, shell_only: bool) -> Self {
        self.shell_only = shell_only;
        self
    }

    pub fn scan_references(mut self, scan: bool) -> Self {
        self.scan_references = scan;
        self
    }

    pub fn max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn exclude(mut self, pattern: Option<Regex>) -> Self {
        self.exclude = pattern;
        self
    }

    fn definition(&self, item: &Item) -> Result<Option<ItemDefinition>, ItemFailure> {
        if self.shell_only {
            return Ok(None);
        }
        let parts: Vec<DefinitionPart> = item
            .files()
            .iter()
            .filter(|file| !self.excludes_file(file))
            .map(|file| DefinitionPart::inline(file.relative_path(), file.payload()))
            .collect();
        if parts.is_empty() {
            return Err(ItemFailure::Content(format!(
                "{} {:?} has no definition files",
                item.item_type(),
                item.name()
            )));
        }
        Ok(Some(ItemDefinition { parts }))
    }
}

#[async_trait]
impl Publisher for ItemsApiPublisher {
    fn item_type(&self) -> ItemType {
        self.item_type.clone()
    }

    fn exclude_pattern(&self) -> Option<&Regex> {
        self.exclude.as_ref()
    }

    /// A peer is referenced when any text file mentions its logical id or guid.
    fn discover_references(&self, item: &Item, peers: &[&Item]) -> BTreeSet<String> {
        if !self.scan_references {
            return BTreeSet::new();
        }
        let texts: Vec<&str> = item.files().iter().filter_map(|file| file.text()).collect();
        peers
            .iter()
            .filter(|peer| peer.name() != item.name())
            .filter(|peer| {
                [peer.logical_id(), peer.guid()]
                    .into_iter()
                    .filter(|id| !id.is_empty())
                    .any(|id| texts.iter().any(|text| text.contains(id)))
            })
            .map(|peer| peer.name().to_string())
            .collect()
    }

    async fn publish_one(&self, item: &Item) -> PublishResult {
        let definition = self.definition(item)?;

        if item.guid().is_empty() {
            let guid = self
                .api
                .create_item(
                    &NewItem {
                        item_type: item.item_type().as_str(),
                        display_name: item.name(),
                        description: item.description(),
                        definition: definition.as_ref(),
                    },
                    self.max_retries,
                )
                .await?;
            info!(item_type = %self.item_type, item_name = item.name(), guid = %guid, "Created item");
            return Ok(Some(guid));
        }

        let guid = item.guid();
        if let Some(definition) = &definition {
            self.api
                .update_definition(guid, definition, self.max_retries)
                .await?;
        }
        self.api
            .update_metadata(guid, item.name(), item.description(), self.max_retries)
            .await?;
        debug!(item_type = %self.item_type, item_name = item.name(), guid, "Updated item");
        Ok(Some(guid.to_string()))
    }

    async fn unpublish_one(&self, item: &Item) -> Result<(), ItemFailure> {
        if item.guid().is_empty() {
            return Err(ItemFailure::Dependency(format!(
                "{} {:?} has no remote guid",
                item.item_type(),
                item.name()
            )));
        }
        self.api.delete_item(item.guid()).await?;
        info!(item_type = %self.item_type, item_name = item.name(), guid = item.guid(), "Deleted item");
        Ok(())
    }
}

//! Typed wrapper over the workspace items endpoints

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::InvokeError;
use crate::invoker::{InvokeRequest, RequestInvoker};
use crate::Result;

/// Payload type used for every definition part
pub const INLINE_BASE64: &str = "InlineBase64";

/// An item as the remote workspace lists it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteItem {
    pub id: String,
    #[serde(rename = "type")]
    pub item_type: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
}

/// One file of an item definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionPart {
    pub path: String,
    pub payload: String,
    pub payload_type: String,
}

impl DefinitionPart {
    /// Part whose payload is already base64 encoded
    pub fn inline(path: impl Into<String>, payload: impl Into<String>) -> Self {
        DefinitionPart {
            path: path.into(),
            payload: payload.into(),
            payload_type: INLINE_BASE64.to_string(),
        }
    }
}

/// Full item definition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDefinition {
    pub parts: Vec<DefinitionPart>,
}

/// Body of a create-item call
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewItem<'a> {
    #[serde(rename = "type")]
    pub item_type: &'a str,
    pub display_name: &'a str,
    #[serde(skip_serializing_if = "is_blank")]
    pub description: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definition: Option<&'a ItemDefinition>,
}

fn is_blank(value: &&str) -> bool {
    value.is_empty()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemPage {
    #[serde(default)]
    value: Vec<RemoteItem>,
    continuation_uri: Option<String>,
}

/// Workspace-scoped items API
pub struct WorkspaceApi {
    invoker: Arc<RequestInvoker>,
    base_url: String,
}

impl WorkspaceApi {
    pub fn new(invoker: Arc<RequestInvoker>, api_root: &str, workspace_id: &str) -> Self {
        WorkspaceApi {
            invoker,
            base_url: format!(
                "{}/v1/workspaces/{}",
                api_root.trim_end_matches('/'),
                workspace_id
            ),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn invoker(&self) -> &Arc<RequestInvoker> {
        &self.invoker
    }

    /// List every item in the workspace, following continuation links
    pub async fn list_items(&self) -> Result<Vec<RemoteItem>> {
        let mut items = Vec::new();
        let mut next = Some(format!("{}/items", self.base_url));

        while let Some(url) = next.take() {
            let response = self.invoker.invoke(InvokeRequest::get(url.clone())).await?;
            let body = response.body.into_json().ok_or_else(|| InvokeError::UnexpectedBody {
                url: url.clone(),
                detail: "expected a JSON item listing".to_string(),
            })?;
            let page: ItemPage = serde_json::from_value(body)?;
            items.extend(page.value);
            next = page.continuation_uri.filter(|uri| !uri.is_empty());
        }

        debug!(count = items.len(), "Listed workspace items");
        Ok(items)
    }

    /// Create an item and return its remote guid
    pub async fn create_item(&self, item: &NewItem<'_>, max_retries: Option<u32>) -> Result<String> {
        let url = format!("{}/items", self.base_url);
        let request = InvokeRequest::post(url.clone())
            .json(serde_json::to_value(item)?)
            .max_retries_opt(max_retries);
        let response = self.invoker.invoke(request).await?;

        response
            .body
            .as_json()
            .and_then(|body| body.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(InvokeError::UnexpectedBody {
                url,
                detail: "create response has no item id".to_string(),
            })
    }

    /// Replace the definition of an existing item
    pub async fn update_definition(
        &self,
        guid: &str,
        definition: &ItemDefinition,
        max_retries: Option<u32>,
    ) -> Result<()> {
        let request = InvokeRequest::post(format!(
            "{}/items/{}/updateDefinition?updateMetadata=True",
            self.base_url, guid
        ))
        .json(json!({ "definition": definition }))
        .max_retries_opt(max_retries);
        self.invoker.invoke(request).await?;
        Ok(())
    }

    /// Update display name and description of an existing item
    pub async fn update_metadata(
        &self,
        guid: &str,
        display_name: &str,
        description: &str,
        max_retries: Option<u32>,
    ) -> Result<()> {
        let request = InvokeRequest::patch(format!("{}/items/{}", self.base_url, guid))
            .json(json!({ "displayName": display_name, "description": description }))
            .max_retries_opt(max_retries);
        self.invoker.invoke(request).await?;
        Ok(())
    }

    pub async fn delete_item(&self, guid: &str) -> Result<()> {
        let request = InvokeRequest::delete(format!("{}/items/{}", self.base_url, guid));
        self.invoker.invoke(request).await?;
        Ok(())
    }
}

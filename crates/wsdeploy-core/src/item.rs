//! Item model: typed workspace artifacts and their files.
//!
//! An [`Item`] is built once when the repository is scanned. Its type, name
//! and description never change afterwards (there are no setters for them);
//! the remote guid and the file list are filled in later through explicit
//! setters.

use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Name of the metadata file that marks an item directory.
pub const PLATFORM_FILE: &str = ".platform";

/// Item type tag, e.g. `Notebook` or `SemanticModel`.
///
/// Catalog types are available as associated constants; types supplied by
/// extensions are built with [`ItemType::new`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemType(Cow<'static, str>);

impl ItemType {
    pub const VARIABLE_LIBRARY: ItemType = ItemType::from_static("VariableLibrary");
    pub const WAREHOUSE: ItemType = ItemType::from_static("Warehouse");
    pub const LAKEHOUSE: ItemType = ItemType::from_static("Lakehouse");
    pub const SQL_DATABASE: ItemType = ItemType::from_static("SQLDatabase");
    pub const MIRRORED_DATABASE: ItemType = ItemType::from_static("MirroredDatabase");
    pub const ENVIRONMENT: ItemType = ItemType::from_static("Environment");
    pub const NOTEBOOK: ItemType = ItemType::from_static("Notebook");
    pub const SPARK_JOB_DEFINITION: ItemType = ItemType::from_static("SparkJobDefinition");
    pub const SEMANTIC_MODEL: ItemType = ItemType::from_static("SemanticModel");
    pub const REPORT: ItemType = ItemType::from_static("Report");
    pub const COPY_JOB: ItemType = ItemType::from_static("CopyJob");
    pub const EVENTHOUSE: ItemType = ItemType::from_static("Eventhouse");
    pub const KQL_DATABASE: ItemType = ItemType::from_static("KQLDatabase");
    pub const KQL_QUERYSET: ItemType = ItemType::from_static("KQLQueryset");
    pub const REFLEX: ItemType = ItemType::from_static("Reflex");
    pub const EVENTSTREAM: ItemType = ItemType::from_static("Eventstream");
    pub const KQL_DASHBOARD: ItemType = ItemType::from_static("KQLDashboard");
    pub const DATAFLOW: ItemType = ItemType::from_static("Dataflow");
    pub const DATA_PIPELINE: ItemType = ItemType::from_static("DataPipeline");
    pub const GRAPHQL_API: ItemType = ItemType::from_static("GraphQLApi");
    pub const USER_DATA_FUNCTION: ItemType = ItemType::from_static("UserDataFunction");

    pub const fn from_static(tag: &'static str) -> Self {
        ItemType(Cow::Borrowed(tag))
    }

    pub fn new(tag: impl Into<String>) -> Self {
        ItemType(Cow::Owned(tag.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemType {
    fn from(tag: &str) -> Self {
        ItemType::new(tag)
    }
}

impl Serialize for ItemType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ItemType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(ItemType::new)
    }
}

/// `(type, name)` pair identifying an item within one workspace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    pub item_type: ItemType,
    pub name: String,
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.item_type)
    }
}

/// One file belonging to an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFile {
    name: String,
    path: PathBuf,
    relative_path: String,
    contents: Vec<u8>,
    payload: String,
}

impl ItemFile {
    /// Read `path`, which must live under `item_root`.
    pub fn read(item_root: &Path, path: &Path) -> std::io::Result<Self> {
        let contents = std::fs::read(path)?;
        let relative = path.strip_prefix(item_root).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not under {}", path.display(), item_root.display()),
            )
        })?;
        let relative_path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        Ok(Self::build(path.to_path_buf(), relative_path, contents))
    }

    /// Build a file from in-memory contents (absolute path is synthetic).
    pub fn from_contents(relative_path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        let relative_path = relative_path.into();
        Self::build(PathBuf::from(&relative_path), relative_path, contents.into())
    }

    fn build(path: PathBuf, relative_path: String, contents: Vec<u8>) -> Self {
        let name = relative_path
            .rsplit('/')
            .next()
            .unwrap_or(relative_path.as_str())
            .to_string();
        let payload = STANDARD.encode(&contents);
        ItemFile {
            name,
            path,
            relative_path,
            contents,
            payload,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Posix-style path relative to the item directory
    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    /// Contents as text, when they are valid UTF-8
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.contents).ok()
    }

    /// Base64 encoding of the contents
    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn is_platform(&self) -> bool {
        self.name == PLATFORM_FILE
    }
}

/// A typed workspace artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    item_type: ItemType,
    name: String,
    description: String,
    guid: String,
    logical_id: String,
    path: PathBuf,
    files: Vec<ItemFile>,
}

impl Item {
    pub fn new(
        item_type: ItemType,
        name: impl Into<String>,
        description: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Item {
            item_type,
            name: name.into(),
            description: description.into(),
            guid: String::new(),
            logical_id: String::new(),
            path: path.into(),
            files: Vec::new(),
        }
    }

    pub fn with_logical_id(mut self, logical_id: impl Into<String>) -> Self {
        self.logical_id = logical_id.into();
        self
    }

    pub fn with_guid(mut self, guid: impl Into<String>) -> Self {
        self.guid = guid.into();
        self
    }

    pub fn with_files(mut self, files: Vec<ItemFile>) -> Self {
        self.files = files;
        self
    }

    pub fn item_type(&self) -> &ItemType {
        &self.item_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Remote guid; empty until the item has been published once
    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn files(&self) -> &[ItemFile] {
        &self.files
    }

    pub fn key(&self) -> ItemKey {
        ItemKey {
            item_type: self.item_type.clone(),
            name: self.name.clone(),
        }
    }

    pub fn set_guid(&mut self, guid: impl Into<String>) {
        self.guid = guid.into();
    }

    pub fn set_files(&mut self, files: Vec<ItemFile>) {
        self.files = files;
    }
}

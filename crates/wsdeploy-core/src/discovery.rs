//! Turning a repository checkout into items.
//!
//! Every directory holding a `.platform` file is one item. Its metadata
//! names the type and display name; every file below the directory that is
//! not inside a nested item directory belongs to it.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{DeployError, DeployResult};
use crate::item::{Item, ItemFile, ItemType, PLATFORM_FILE};

/// Produces items, files included, from a repository root.
pub trait ItemDiscovery: Send + Sync {
    fn discover(&self, root: &Path) -> DeployResult<Vec<Item>>;
}

#[derive(Debug, Deserialize)]
struct PlatformFile {
    metadata: PlatformMetadata,
    #[serde(default)]
    config: PlatformConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlatformMetadata {
    #[serde(rename = "type", default)]
    item_type: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlatformConfig {
    #[serde(default)]
    logical_id: String,
}

/// Filesystem discovery driven by `.platform` metadata files.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlatformFileDiscovery;

impl ItemDiscovery for PlatformFileDiscovery {
    fn discover(&self, root: &Path) -> DeployResult<Vec<Item>> {
        if !root.is_dir() {
            return Err(DeployError::Discovery {
                path: root.to_path_buf(),
                reason: "repository directory does not exist".to_string(),
            });
        }
        let mut items = Vec::new();
        visit(root, &mut items)?;
        info!(root = %root.display(), items = items.len(), "Discovered repository items");
        Ok(items)
    }
}

enum Entry {
    Dir(PathBuf),
    File(PathBuf),
}

/// Directory entries sorted by path. Symlinked directories are skipped so a
/// link cycle cannot recurse forever; symlinked files are kept.
fn sorted_entries(dir: &Path) -> DeployResult<Vec<Entry>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            entries.push(Entry::Dir(path));
        } else if file_type.is_symlink() && path.is_dir() {
            debug!(path = %path.display(), "Skipping symlinked directory");
        } else {
            entries.push(Entry::File(path));
        }
    }
    entries.sort_by(|a, b| a.path().cmp(b.path()));
    Ok(entries)
}

impl Entry {
    fn path(&self) -> &Path {
        match self {
            Entry::Dir(path) | Entry::File(path) => path,
        }
    }
}

fn is_item_dir(dir: &Path) -> bool {
    dir.join(PLATFORM_FILE).is_file()
}

fn visit(dir: &Path, items: &mut Vec<Item>) -> DeployResult<()> {
    if is_item_dir(dir) {
        items.push(read_item(dir)?);
    }
    for entry in sorted_entries(dir)? {
        if let Entry::Dir(path) = entry {
            visit(&path, items)?;
        }
    }
    Ok(())
}

fn read_item(dir: &Path) -> DeployResult<Item> {
    let metadata_path = dir.join(PLATFORM_FILE);
    let raw = std::fs::read_to_string(&metadata_path)?;
    let platform: PlatformFile = serde_json::from_str(&raw).map_err(|err| DeployError::Discovery {
        path: metadata_path.clone(),
        reason: format!("malformed metadata: {err}"),
    })?;

    let PlatformMetadata {
        item_type,
        display_name,
        description,
    } = platform.metadata;
    if item_type.trim().is_empty() || display_name.trim().is_empty() {
        return Err(DeployError::Discovery {
            path: metadata_path,
            reason: "metadata.type and metadata.displayName are required".to_string(),
        });
    }

    let mut files = Vec::new();
    collect_files(dir, dir, &mut files)?;
    files.sort_by(|a, b| a.relative_path().cmp(b.relative_path()));

    debug!(
        item_type = %item_type,
        item_name = %display_name,
        files = files.len(),
        "Read item"
    );
    Ok(Item::new(
        ItemType::new(item_type),
        display_name,
        description.unwrap_or_default(),
        dir,
    )
    .with_logical_id(platform.config.logical_id)
    .with_files(files))
}

fn collect_files(item_root: &Path, dir: &Path, files: &mut Vec<ItemFile>) -> DeployResult<()> {
    for entry in sorted_entries(dir)? {
        match entry {
            Entry::Dir(path) if !is_item_dir(&path) => collect_files(item_root, &path, files)?,
            Entry::Dir(_) => {}
            Entry::File(path) => files.push(ItemFile::read(item_root, &path)?),
        }
    }
    Ok(())
}

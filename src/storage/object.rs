//! Catalog entities as seen by the autoscan core.

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::error::domain::CatalogError;

/// Catalog object identifier.
pub type ObjectId = i64;

/// Marker for "no object".
pub const INVALID_OBJECT_ID: ObjectId = -1;

/// The virtual root container.
pub const ROOT_ID: ObjectId = 0;

/// The container mirroring the filesystem root (`/`).
pub const FS_ROOT_ID: ObjectId = 1;

/// Kind of a catalog object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    /// A container holding other objects.
    Container,
    /// A plain media item backed by a file.
    Item,
    /// An item that triggers an action when requested.
    ActiveItem,
    /// An item pointing at a remote URL.
    ExternalUrlItem,
    /// An item pointing at a URL served by this server.
    InternalUrlItem,
}

impl ObjectKind {
    /// Returns `true` for containers.
    #[must_use]
    pub fn is_container(self) -> bool {
        self == Self::Container
    }

    /// Returns `true` for every item variant.
    #[must_use]
    pub fn is_item(self) -> bool {
        !self.is_container()
    }

    /// Returns `true` only for plain file-backed items.
    #[must_use]
    pub fn is_pure_item(self) -> bool {
        self == Self::Item
    }

    /// Returns `true` for active items.
    #[must_use]
    pub fn is_active_item(self) -> bool {
        self == Self::ActiveItem
    }

    /// Returns `true` for both URL item variants.
    #[must_use]
    pub fn is_url_item(self) -> bool {
        matches!(self, Self::ExternalUrlItem | Self::InternalUrlItem)
    }

    /// Returns `true` for remote URL items.
    #[must_use]
    pub fn is_external_url(self) -> bool {
        self == Self::ExternalUrlItem
    }

    /// Stable name used in persistent storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::Item => "item",
            Self::ActiveItem => "active_item",
            Self::ExternalUrlItem => "external_url",
            Self::InternalUrlItem => "internal_url",
        }
    }
}

impl Display for ObjectKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "container" => Ok(Self::Container),
            "item" => Ok(Self::Item),
            "active_item" => Ok(Self::ActiveItem),
            "external_url" => Ok(Self::ExternalUrlItem),
            "internal_url" => Ok(Self::InternalUrlItem),
            other => Err(CatalogError::InvalidData {
                reason: format!("unknown object kind '{other}'"),
            }),
        }
    }
}

/// A catalog object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdsObject {
    /// Object id, `INVALID_OBJECT_ID` until stored.
    pub id: ObjectId,
    /// Id of the parent container.
    pub parent_id: ObjectId,
    /// Object kind.
    pub kind: ObjectKind,
    /// Display title.
    pub title: String,
    /// Filesystem location; empty for virtual objects without one.
    pub location: PathBuf,
    /// Target URL for URL items.
    pub url: Option<String>,
    /// MIME type for items.
    pub mime_type: Option<String>,
    /// Modification time in seconds since the epoch.
    pub mtime: u64,
    /// File size in bytes.
    pub size: u64,
    /// Update generation, bumped by the update coalescer.
    pub update_id: u32,
    /// Whether the object lives outside the filesystem mirror.
    pub is_virtual: bool,
}

impl CdsObject {
    /// Creates a filesystem container.
    pub fn container(parent_id: ObjectId, title: impl Into<String>, location: &Path) -> Self {
        Self {
            id: INVALID_OBJECT_ID,
            parent_id,
            kind: ObjectKind::Container,
            title: title.into(),
            location: location.to_path_buf(),
            url: None,
            mime_type: None,
            mtime: 0,
            size: 0,
            update_id: 0,
            is_virtual: false,
        }
    }

    /// Creates a virtual container without filesystem location.
    pub fn virtual_container(parent_id: ObjectId, title: impl Into<String>) -> Self {
        Self {
            is_virtual: true,
            ..Self::container(parent_id, title, Path::new(""))
        }
    }

    /// Creates a file-backed item.
    pub fn item(
        parent_id: ObjectId,
        location: &Path,
        mime_type: impl Into<String>,
        mtime: u64,
        size: u64,
    ) -> Self {
        let title = location
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            id: INVALID_OBJECT_ID,
            parent_id,
            kind: ObjectKind::Item,
            title,
            location: location.to_path_buf(),
            url: None,
            mime_type: Some(mime_type.into()),
            mtime,
            size,
            update_id: 0,
            is_virtual: false,
        }
    }

    /// Creates a virtual item pointing at a remote URL.
    pub fn external_url(
        parent_id: ObjectId,
        title: impl Into<String>,
        url: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            id: INVALID_OBJECT_ID,
            parent_id,
            kind: ObjectKind::ExternalUrlItem,
            title: title.into(),
            location: PathBuf::new(),
            url: Some(url.into()),
            mime_type: Some(mime_type.into()),
            mtime: 0,
            size: 0,
            update_id: 0,
            is_virtual: true,
        }
    }

    /// Returns `true` if the object is a container.
    #[must_use]
    pub fn is_container(&self) -> bool {
        self.kind.is_container()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use crate::storage::object::{CdsObject, FS_ROOT_ID, ObjectKind};

    #[test]
    fn test_capability_queries() {
        assert!(ObjectKind::Container.is_container());
        assert!(!ObjectKind::Container.is_item());
        assert!(ObjectKind::Item.is_pure_item());
        assert!(ObjectKind::ActiveItem.is_item());
        assert!(!ObjectKind::ActiveItem.is_pure_item());
        assert!(ObjectKind::InternalUrlItem.is_url_item());
        assert!(!ObjectKind::InternalUrlItem.is_external_url());
        assert!(ObjectKind::ExternalUrlItem.is_external_url());
    }

    #[test]
    fn test_kind_names_parse_back() {
        for kind in [
            ObjectKind::Container,
            ObjectKind::Item,
            ObjectKind::ActiveItem,
            ObjectKind::ExternalUrlItem,
            ObjectKind::InternalUrlItem,
        ] {
            assert_eq!(kind.as_str().parse::<ObjectKind>().unwrap(), kind);
        }
        assert!("folder".parse::<ObjectKind>().is_err());
    }

    #[test]
    fn test_item_title_from_file_name() {
        let item = CdsObject::item(FS_ROOT_ID, Path::new("/media/a.mkv"), "video/x-matroska", 5, 10);
        assert_eq!(item.title, "a.mkv");
        assert!(!item.is_container());
        assert!(!item.is_virtual);
    }
}

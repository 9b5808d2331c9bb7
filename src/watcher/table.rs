//! Watch descriptor table.
//!
//! Each OS watch handle maps to a node holding the watched path, the handle
//! of its parent directory and the list of reasons the directory is
//! watched. The OS watch is dropped only when that list becomes empty.

use std::{
    cmp::Reverse,
    collections::HashMap,
    path::{Path, PathBuf},
};

use crate::{autoscan::AutoscanRef, watcher::events::WatchHandle};

/// Directory watched on behalf of an autoscan.
#[derive(Debug, Clone)]
pub struct WatchAutoscan {
    pub adir: AutoscanRef,
    /// Set on the root directory of the autoscan only.
    pub start_point: bool,
    /// Normalized autoscan location.
    pub normalized_root: PathBuf,
    /// Lost path this ancestor watch is waiting for, if any.
    pub nonexisting_path: Option<PathBuf>,
    /// Handles watched below a start point, for bulk teardown.
    pub descendants: Vec<WatchHandle>,
    /// Filesystem the start point lived on when it was watched.
    pub device: Option<u64>,
}

/// Ancestor watch that invalidates `remove_handle` when the ancestor moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchMove {
    pub remove_handle: WatchHandle,
}

#[derive(Debug, Clone)]
pub enum Watch {
    Autoscan(WatchAutoscan),
    Move(WatchMove),
}

impl Watch {
    pub fn as_autoscan(&self) -> Option<&WatchAutoscan> {
        match self {
            Self::Autoscan(watch) => Some(watch),
            Self::Move(_) => None,
        }
    }

    fn is_live_autoscan_of(&self, adir: &AutoscanRef) -> bool {
        self.as_autoscan()
            .is_some_and(|watch| watch.nonexisting_path.is_none() && watch.adir.ptr_eq(adir))
    }
}

#[derive(Debug, Clone)]
pub struct WatchNode {
    pub path: PathBuf,
    pub handle: WatchHandle,
    pub parent: WatchHandle,
    pub watches: Vec<Watch>,
}

impl WatchNode {
    pub fn new(path: impl Into<PathBuf>, handle: WatchHandle, parent: WatchHandle) -> Self {
        Self {
            path: path.into(),
            handle,
            parent,
            watches: Vec::new(),
        }
    }

    /// Index of the live (not waiting) watch of `adir`.
    pub fn autoscan_index(&self, adir: &AutoscanRef) -> Option<usize> {
        self.watches
            .iter()
            .position(|watch| watch.is_live_autoscan_of(adir))
    }

    /// Live autoscan watch whose root is the longest prefix of `path`.
    pub fn appropriate_autoscan(&self, path: &Path) -> Option<&WatchAutoscan> {
        self.watches
            .iter()
            .filter_map(Watch::as_autoscan)
            .filter(|watch| watch.nonexisting_path.is_none())
            .filter(|watch| path.starts_with(&watch.normalized_root))
            .max_by_key(|watch| watch.normalized_root.components().count())
    }

    /// Start-point watch attached to this node, if any.
    pub fn start_point(&self) -> Option<&WatchAutoscan> {
        self.watches
            .iter()
            .filter_map(Watch::as_autoscan)
            .find(|watch| watch.start_point)
    }

    /// Index of the move watch pointing at `remove_handle`.
    pub fn move_index(&self, remove_handle: WatchHandle) -> Option<usize> {
        self.watches
            .iter()
            .position(|watch| matches!(watch, Watch::Move(mv) if mv.remove_handle == remove_handle))
    }

    /// Index of the waiting watch for `lost`.
    pub fn nonexisting_index(&self, lost: &Path) -> Option<usize> {
        self.watches.iter().position(|watch| {
            watch
                .as_autoscan()
                .is_some_and(|watch| watch.nonexisting_path.as_deref() == Some(lost))
        })
    }
}

#[derive(Debug, Default)]
pub struct WatchTable {
    nodes: HashMap<WatchHandle, WatchNode>,
}

impl WatchTable {
    pub fn get(&self, handle: WatchHandle) -> Option<&WatchNode> {
        self.nodes.get(&handle)
    }

    pub fn get_mut(&mut self, handle: WatchHandle) -> Option<&mut WatchNode> {
        self.nodes.get_mut(&handle)
    }

    pub fn insert(&mut self, node: WatchNode) {
        self.nodes.insert(node.handle, node);
    }

    pub fn remove(&mut self, handle: WatchHandle) -> Option<WatchNode> {
        self.nodes.remove(&handle)
    }

    pub fn contains(&self, handle: WatchHandle) -> bool {
        self.nodes.contains_key(&handle)
    }

    /// Handle of the node watching exactly `path`.
    pub fn find_by_path(&self, path: &Path) -> Option<WatchHandle> {
        self.nodes
            .values()
            .find(|node| node.path == path)
            .map(|node| node.handle)
    }

    /// Handles of every node carrying a watch of `adir`, waiting ones included.
    pub fn handles_of(&self, adir: &AutoscanRef) -> Vec<WatchHandle> {
        let mut handles: Vec<WatchHandle> = self
            .nodes
            .values()
            .filter(|node| {
                node.watches.iter().any(|watch| {
                    watch
                        .as_autoscan()
                        .is_some_and(|watch| watch.adir.ptr_eq(adir))
                })
            })
            .map(|node| node.handle)
            .collect();
        handles.sort_unstable();
        handles
    }

    /// Handles of the nodes at or below `path`, deepest first.
    pub fn handles_under(&self, path: &Path) -> Vec<WatchHandle> {
        let mut nodes: Vec<&WatchNode> = self
            .nodes
            .values()
            .filter(|node| node.path.starts_with(path))
            .collect();
        nodes.sort_by_key(|node| (Reverse(node.path.components().count()), node.handle));
        nodes.into_iter().map(|node| node.handle).collect()
    }

    /// Live start-point watches with the handle carrying them.
    pub fn start_points(&self) -> Vec<(WatchHandle, WatchAutoscan)> {
        let mut starts: Vec<(WatchHandle, WatchAutoscan)> = self
            .nodes
            .values()
            .flat_map(|node| {
                node.watches
                    .iter()
                    .filter_map(Watch::as_autoscan)
                    .filter(|watch| watch.start_point && watch.nonexisting_path.is_none())
                    .map(|watch| (node.handle, watch.clone()))
            })
            .collect();
        starts.sort_by_key(|(handle, _)| *handle);
        starts
    }

    /// Handles of the nodes waiting for a lost root.
    pub fn waiting_handles(&self) -> Vec<WatchHandle> {
        let mut handles: Vec<WatchHandle> = self
            .nodes
            .values()
            .filter(|node| {
                node.watches.iter().any(|watch| {
                    watch
                        .as_autoscan()
                        .is_some_and(|watch| watch.nonexisting_path.is_some())
                })
            })
            .map(|node| node.handle)
            .collect();
        handles.sort_unstable();
        handles
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use crate::{
        autoscan::{AutoscanDirectory, AutoscanRef, ScanMode},
        watcher::{
            events::WatchHandle,
            table::{Watch, WatchAutoscan, WatchMove, WatchNode, WatchTable},
        },
    };

    fn autoscan_watch(adir: &AutoscanRef, root: &str, start_point: bool) -> Watch {
        Watch::Autoscan(WatchAutoscan {
            adir: adir.clone(),
            start_point,
            normalized_root: PathBuf::from(root),
            nonexisting_path: None,
            descendants: vec![],
            device: None,
        })
    }

    #[test]
    fn test_appropriate_autoscan_prefers_longest_root() {
        let outer = AutoscanRef::new(AutoscanDirectory::new("/media", ScanMode::INotify));
        let inner = AutoscanRef::new(AutoscanDirectory::new("/media/movies", ScanMode::INotify));

        let mut node = WatchNode::new("/media/movies", WatchHandle(3), WatchHandle::UNKNOWN_PARENT);
        node.watches.push(autoscan_watch(&outer, "/media", false));
        node.watches.push(autoscan_watch(&inner, "/media/movies", true));

        let best = node
            .appropriate_autoscan(Path::new("/media/movies/a.mkv"))
            .unwrap();
        assert!(best.adir.ptr_eq(&inner));
        assert!(node.start_point().unwrap().adir.ptr_eq(&inner));
        assert_eq!(node.autoscan_index(&outer), Some(0));
    }

    #[test]
    fn test_waiting_watches_are_not_live() {
        let adir = AutoscanRef::new(AutoscanDirectory::new("/media/movies", ScanMode::INotify));
        let mut node = WatchNode::new("/media", WatchHandle(1), WatchHandle::UNKNOWN_PARENT);
        node.watches.push(Watch::Autoscan(WatchAutoscan {
            adir: adir.clone(),
            start_point: false,
            normalized_root: PathBuf::from("/media/movies"),
            nonexisting_path: Some(PathBuf::from("/media/movies")),
            descendants: vec![],
            device: None,
        }));
        node.watches.push(Watch::Move(WatchMove {
            remove_handle: WatchHandle(2),
        }));

        assert!(node.appropriate_autoscan(Path::new("/media/movies")).is_none());
        assert_eq!(node.autoscan_index(&adir), None);
        assert_eq!(node.nonexisting_index(Path::new("/media/movies")), Some(0));
        assert_eq!(node.move_index(WatchHandle(2)), Some(1));

        let mut table = WatchTable::default();
        table.insert(node);
        assert_eq!(table.find_by_path(Path::new("/media")), Some(WatchHandle(1)));
        assert_eq!(table.handles_of(&adir), vec![WatchHandle(1)]);
        assert_eq!(table.waiting_handles(), vec![WatchHandle(1)]);
        assert!(table.start_points().is_empty());
    }

    #[test]
    fn test_handles_under_lists_subtree_deepest_first() {
        let adir = AutoscanRef::new(AutoscanDirectory::new("/media/movies", ScanMode::INotify));
        let mut table = WatchTable::default();
        for (path, handle) in [
            ("/media/movies", 1),
            ("/media/movies/sub", 2),
            ("/media/movies/sub/deeper", 3),
            ("/media/movies/subtitles", 4),
        ] {
            let mut node = WatchNode::new(path, WatchHandle(handle), WatchHandle::UNKNOWN_PARENT);
            node.watches
                .push(autoscan_watch(&adir, "/media/movies", handle == 1));
            table.insert(node);
        }

        assert_eq!(
            table.handles_under(Path::new("/media/movies/sub")),
            vec![WatchHandle(3), WatchHandle(2)]
        );
        let starts = table.start_points();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].0, WatchHandle(1));
    }
}

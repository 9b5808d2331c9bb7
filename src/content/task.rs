//! Units of catalog work executed by the content worker.

use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::{autoscan::AutoscanRef, content::online::OnlineService, storage::ObjectId};

/// Identifier assigned to a task when it is enqueued.
pub type TaskId = u64;

/// Task id that matches no task; used as "no parent".
pub const NO_TASK: TaskId = 0;

/// Class of the component that created a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskOwner {
    /// System tasks: imports, rescans, watch-engine work.
    ContentManager,
    /// User-initiated processing jobs.
    TaskProcessor,
}

/// Cooperative cancellation flag shared between a task and its submitter.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Import options carried by add-file work.
#[derive(Debug, Clone, Default)]
pub struct AutoscanSetting {
    /// Autoscan the import belongs to, if any; receives watermark updates.
    pub adir: Option<AutoscanRef>,
    pub recursive: bool,
    pub hidden: bool,
    pub follow_symlinks: bool,
}

/// What a task does when it runs.
#[derive(Clone)]
pub enum TaskKind {
    /// Import a file or a directory tree.
    AddFile {
        path: PathBuf,
        /// Autoscan root the path was discovered under; empty for user imports.
        root_path: PathBuf,
        setting: AutoscanSetting,
    },
    /// Remove an object (and its subtree) from the catalog.
    RemoveObject { object_id: ObjectId, all: bool },
    /// Reconcile one catalog container with the directory it mirrors.
    RescanDirectory {
        adir: AutoscanRef,
        object_id: ObjectId,
        desc_path: PathBuf,
    },
    /// A persistent autoscan root disappeared.
    PersistentRemoved { adir: AutoscanRef },
    /// A persistent autoscan root is back on disk.
    PersistentRecreated { adir: AutoscanRef },
    /// Refresh the items published by an online service.
    FetchOnlineContent { service: Arc<dyn OnlineService> },
}

impl Debug for TaskKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::AddFile { path, .. } => f.debug_struct("AddFile").field("path", path).finish(),
            Self::RemoveObject { object_id, all } => f
                .debug_struct("RemoveObject")
                .field("object_id", object_id)
                .field("all", all)
                .finish(),
            Self::RescanDirectory {
                object_id,
                desc_path,
                ..
            } => f
                .debug_struct("RescanDirectory")
                .field("object_id", object_id)
                .field("desc_path", desc_path)
                .finish(),
            Self::PersistentRemoved { adir } => f
                .debug_struct("PersistentRemoved")
                .field("location", &adir.location())
                .finish(),
            Self::PersistentRecreated { adir } => f
                .debug_struct("PersistentRecreated")
                .field("location", &adir.location())
                .finish(),
            Self::FetchOnlineContent { service } => f
                .debug_struct("FetchOnlineContent")
                .field("service", &service.name())
                .finish(),
        }
    }
}

/// One queued unit of work.
#[derive(Debug, Clone)]
pub struct Task {
    /// Assigned by the queue; `NO_TASK` until enqueued.
    pub id: TaskId,
    /// Task that spawned this one, or `NO_TASK`.
    pub parent_id: TaskId,
    pub owner: TaskOwner,
    pub cancellable: bool,
    pub description: String,
    pub kind: TaskKind,
    pub token: CancellationToken,
}

impl Task {
    /// Creates a system task.
    pub fn new(kind: TaskKind, description: impl Into<String>) -> Self {
        Self {
            id: NO_TASK,
            parent_id: NO_TASK,
            owner: TaskOwner::ContentManager,
            cancellable: true,
            description: description.into(),
            kind,
            token: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_parent(mut self, parent_id: TaskId) -> Self {
        self.parent_id = parent_id;
        self
    }

    #[must_use]
    pub fn with_owner(mut self, owner: TaskOwner) -> Self {
        self.owner = owner;
        self
    }

    #[must_use]
    pub fn with_cancellable(mut self, cancellable: bool) -> Self {
        self.cancellable = cancellable;
        self
    }

    /// Returns `true` once the task has been invalidated.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Status snapshot for reporting.
    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id,
            parent_id: self.parent_id,
            owner: self.owner,
            cancellable: self.cancellable,
            description: self.description.clone(),
        }
    }
}

/// Reporting view of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: TaskId,
    pub parent_id: TaskId,
    pub owner: TaskOwner,
    pub cancellable: bool,
    pub description: String,
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::content::task::{
        AutoscanSetting, CancellationToken, NO_TASK, Task, TaskKind, TaskOwner,
    };

    #[test]
    fn test_cancellation_token_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_task_builders_and_info() {
        let task = Task::new(
            TaskKind::AddFile {
                path: PathBuf::from("/media/a.mkv"),
                root_path: PathBuf::new(),
                setting: AutoscanSetting::default(),
            },
            "Importing /media/a.mkv",
        )
        .with_parent(7)
        .with_owner(TaskOwner::TaskProcessor)
        .with_cancellable(false);

        let info = task.info();
        assert_eq!(info.id, NO_TASK);
        assert_eq!(info.parent_id, 7);
        assert_eq!(info.owner, TaskOwner::TaskProcessor);
        assert!(!info.cancellable);
        assert_eq!(info.description, "Importing /media/a.mkv");
        assert!(format!("{:?}", task.kind).contains("a.mkv"));
    }
}

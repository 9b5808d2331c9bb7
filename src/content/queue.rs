//! Two-priority FIFO task queue with a current-task slot.
//!
//! All catalog mutations go through this queue and are executed by a single
//! worker thread, which serializes them without a lock around the storage.

use std::{collections::VecDeque, path::Path};

use {
    parking_lot::{Condvar, Mutex},
    tracing::debug,
};

use crate::content::task::{NO_TASK, Task, TaskId, TaskInfo, TaskKind, TaskOwner};

#[derive(Debug, Default)]
struct QueueState {
    high: VecDeque<Task>,
    low: VecDeque<Task>,
    current: Option<Task>,
    next_id: TaskId,
    shutdown: bool,
}

/// Queue shared by every task producer and the content worker.
#[derive(Debug, Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

fn matches_id(task: &Task, task_id: TaskId) -> bool {
    task.id == task_id || (task.parent_id != NO_TASK && task.parent_id == task_id)
}

fn is_add_under(task: &Task, path: &Path) -> bool {
    matches!(&task.kind, TaskKind::AddFile { path: add_path, .. } if add_path.starts_with(path))
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues `task` and wakes the worker.
    ///
    /// Returns the id assigned to the task. Ids increase monotonically
    /// across both priorities.
    pub fn add_task(&self, mut task: Task, low_priority: bool) -> TaskId {
        let mut state = self.state.lock();
        state.next_id += 1;
        task.id = state.next_id;
        let id = task.id;

        debug!("Queueing task {} ({}): {}", id, if low_priority { "low" } else { "high" }, task.description);
        if low_priority {
            state.low.push_back(task);
        } else {
            state.high.push_back(task);
        }
        drop(state);
        self.available.notify_one();
        id
    }

    /// Blocks until a task is available and makes it the current task.
    ///
    /// High-priority tasks are always taken first. Tasks invalidated while
    /// queued are dropped without being returned. Returns `None` after
    /// `shutdown`.
    pub fn pop_blocking(&self) -> Option<Task> {
        let mut state = self.state.lock();
        loop {
            state.current = None;
            if state.shutdown {
                return None;
            }

            let next = match state.high.pop_front() {
                Some(task) => Some(task),
                None => state.low.pop_front(),
            };

            match next {
                Some(task) if task.is_cancelled() => {
                    debug!("Skipping invalidated task {}: {}", task.id, task.description);
                }
                Some(task) => {
                    state.current = Some(task.clone());
                    return Some(task);
                }
                None => self.available.wait(&mut state),
            }
        }
    }

    /// Clears the current-task slot after the worker finished a task.
    pub fn finish_current(&self) {
        self.state.lock().current = None;
    }

    /// Task presently executing.
    pub fn current_task(&self) -> Option<TaskInfo> {
        self.state.lock().current.as_ref().map(Task::info)
    }

    /// Current task followed by all still-valid queued tasks, high first.
    pub fn task_list(&self) -> Vec<TaskInfo> {
        let state = self.state.lock();
        state
            .current
            .iter()
            .chain(state.high.iter())
            .chain(state.low.iter())
            .filter(|task| !task.is_cancelled())
            .map(Task::info)
            .collect()
    }

    /// Invalidates the task `task_id` and every task spawned by it.
    ///
    /// Queued tasks become no-ops; a running task notices the flag at its
    /// next checkpoint. Only system tasks are handled here.
    pub fn invalidate_task(&self, task_id: TaskId, owner: TaskOwner) {
        if owner != TaskOwner::ContentManager {
            debug!("No processor for tasks owned by {:?}", owner);
            return;
        }
        let state = self.state.lock();
        for task in state
            .current
            .iter()
            .chain(state.high.iter())
            .chain(state.low.iter())
            .filter(|task| matches_id(task, task_id))
        {
            debug!("Invalidating task {}: {}", task.id, task.description);
            task.token.cancel();
        }
    }

    /// Invalidates add-file tasks for paths at or below `path`.
    ///
    /// With `before` set, only tasks enqueued earlier than that task id are
    /// touched, so imports queued after a removal survive it.
    pub fn invalidate_add_tasks_under(&self, path: &Path, before: Option<TaskId>) {
        let state = self.state.lock();
        for task in state
            .current
            .iter()
            .chain(state.high.iter())
            .chain(state.low.iter())
            .filter(|task| before.is_none_or(|limit| task.id < limit))
            .filter(|task| is_add_under(task, path))
        {
            debug!("Invalidating add task {} below {:?}", task.id, path);
            task.token.cancel();
        }
    }

    /// Returns `true` if a valid add-file task for exactly `path` is queued.
    pub fn has_pending_add(&self, path: &Path) -> bool {
        let state = self.state.lock();
        state
            .high
            .iter()
            .chain(state.low.iter())
            .any(|task| {
                !task.is_cancelled()
                    && matches!(&task.kind, TaskKind::AddFile { path: add_path, .. } if add_path == path)
            })
    }

    /// Number of queued tasks, valid or not.
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.high.len() + state.low.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wakes the worker and makes every later `pop_blocking` return `None`.
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, sync::Arc, thread, time::Duration};

    use crate::content::{
        queue::TaskQueue,
        task::{AutoscanSetting, Task, TaskKind, TaskOwner},
    };

    fn add_task(path: &str) -> Task {
        Task::new(
            TaskKind::AddFile {
                path: PathBuf::from(path),
                root_path: PathBuf::new(),
                setting: AutoscanSetting::default(),
            },
            format!("Importing {path}"),
        )
    }

    fn remove_task(object_id: i64) -> Task {
        Task::new(
            TaskKind::RemoveObject {
                object_id,
                all: false,
            },
            format!("Removing {object_id}"),
        )
    }

    #[test]
    fn test_high_priority_drained_first_fifo_within_class() {
        let queue = TaskQueue::new();
        let low_a = queue.add_task(add_task("/a"), true);
        let high_a = queue.add_task(remove_task(5), false);
        let low_b = queue.add_task(add_task("/b"), true);
        let high_b = queue.add_task(remove_task(6), false);

        let order: Vec<u64> = (0..4)
            .map(|_| {
                let task = queue.pop_blocking().unwrap();
                queue.finish_current();
                task.id
            })
            .collect();
        assert_eq!(order, vec![high_a, high_b, low_a, low_b]);
        assert!(high_a < low_b);
    }

    #[test]
    fn test_invalidated_tasks_are_skipped_and_children_follow() {
        let queue = TaskQueue::new();
        let parent = queue.add_task(add_task("/media"), true);
        let child = queue.add_task(add_task("/media/sub").with_parent(parent), true);
        let other = queue.add_task(add_task("/other"), true);

        queue.invalidate_task(parent, TaskOwner::ContentManager);
        let listed: Vec<u64> = queue.task_list().iter().map(|info| info.id).collect();
        assert_eq!(listed, vec![other]);

        let task = queue.pop_blocking().unwrap();
        assert_eq!(task.id, other);
        assert_ne!(task.id, child);

        queue.invalidate_task(other, TaskOwner::TaskProcessor);
        assert!(!task.is_cancelled());
        queue.invalidate_task(other, TaskOwner::ContentManager);
        assert!(task.is_cancelled());
    }

    #[test]
    fn test_current_task_reported() {
        let queue = TaskQueue::new();
        assert!(queue.current_task().is_none());
        let id = queue.add_task(add_task("/a"), false);
        let _task = queue.pop_blocking().unwrap();
        assert_eq!(queue.current_task().unwrap().id, id);
        assert_eq!(queue.task_list().len(), 1);
        queue.finish_current();
        assert!(queue.current_task().is_none());
    }

    #[test]
    fn test_invalidate_add_tasks_under_respects_order() {
        let queue = TaskQueue::new();
        let inside = queue.add_task(add_task("/media/movies/a.mkv"), true);
        let outside = queue.add_task(add_task("/media/moviesx/b.mkv"), true);
        let remove = queue.add_task(remove_task(4), false);
        let later = queue.add_task(add_task("/media/movies/c.mkv"), true);

        queue.invalidate_add_tasks_under(&PathBuf::from("/media/movies"), Some(remove));
        let listed: Vec<u64> = queue.task_list().iter().map(|info| info.id).collect();
        assert_eq!(listed, vec![remove, outside, later]);
        assert!(!listed.contains(&inside));
    }

    #[test]
    fn test_has_pending_add() {
        let queue = TaskQueue::new();
        queue.add_task(add_task("/media/a.mkv"), true);
        assert!(queue.has_pending_add(&PathBuf::from("/media/a.mkv")));
        assert!(!queue.has_pending_add(&PathBuf::from("/media/b.mkv")));
    }

    #[test]
    fn test_shutdown_wakes_blocked_worker() {
        let queue = Arc::new(TaskQueue::new());
        let worker = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop_blocking().is_none())
        };
        thread::sleep(Duration::from_millis(50));
        queue.shutdown();
        assert!(worker.join().unwrap());
    }
}

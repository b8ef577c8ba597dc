use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use ibex_model::{AssignTask, ReportTask, TaskAction, TaskId, TaskStatus};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    error::TaskError,
    executor::Executor,
    task::{Task, TaskSnapshot},
};

/// All tasks this agent currently knows about, keyed by id.
///
/// The map lock may be held while taking a task lock, never the other way around.
pub struct LocalTasks {
    tasks: Mutex<HashMap<TaskId, Arc<Task>>>,
    executor: Arc<Executor>,
}

impl LocalTasks {
    pub fn new(executor: Arc<Executor>) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            executor,
        }
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: TaskId) -> Option<Arc<Task>> {
        self.tasks.lock().unwrap().get(&id).cloned()
    }

    /// Apply one entry of the server's assignment.
    ///
    /// Returns the handle of the spawned state-machine step, or `None` when the entry changes nothing.
    pub fn assign(&self, assigned: &AssignTask) -> Option<JoinHandle<()>> {
        let AssignTask { id, clock, action } = assigned.clone();

        let task = {
            let mut tasks = self.tasks.lock().unwrap();
            match tasks.get(&id) {
                Some(task) => {
                    let mut state = task.lock();
                    if state.clock() != clock && state.is_alive() {
                        // One process per task: the old attempt is stopped first and the
                        // executor takes the new clock once it is gone.
                        let first = state.pending.is_none();
                        state.pending = Some((clock, action));
                        if !first {
                            return None;
                        }
                        info!(target: "ibex.task", task_id = id, old_clock = state.clock(), clock, "new clock assigned; stopping previous attempt");
                        state.action = TaskAction::Kill;
                    } else if state.clock() != clock {
                        info!(target: "ibex.task", task_id = id, old_clock = state.clock(), clock, %action, "new clock assigned");
                        state.reset(clock, action);
                    } else if state.action != action {
                        debug!(target: "ibex.task", task_id = id, clock, from = %state.action, to = %action, "action changed");
                        state.action = action;
                    } else if state.action == TaskAction::Start
                        && state.status == TaskStatus::Empty
                        && !state.is_alive()
                    {
                        debug!(target: "ibex.task", task_id = id, clock, "retrying start");
                    } else {
                        return None;
                    }
                    drop(state);
                    Arc::clone(task)
                }
                None if action == TaskAction::Kill => {
                    debug!(target: "ibex.task", task_id = id, clock, "kill for unknown task ignored");
                    return None;
                }
                None => {
                    debug!(target: "ibex.task", task_id = id, clock, %action, "task assigned");
                    let task = Arc::new(Task::new(id, clock, action));
                    tasks.insert(id, Arc::clone(&task));
                    task
                }
            }
        };

        Some(tokio::spawn(Arc::clone(&self.executor).dispatch(task)))
    }

    /// Current view of every task, ordered by id.
    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        let tasks = self.tasks.lock().unwrap();
        let mut snaps: Vec<_> = tasks.values().map(|task| task.snapshot()).collect();
        snaps.sort_unstable_by_key(|snap| snap.id);
        snaps
    }

    /// Entries for the next `Server.Report`.
    pub fn report_tasks(&self) -> Vec<ReportTask> {
        self.snapshot().into_iter().map(ReportTask::from).collect()
    }

    /// Forget every idle task missing from `assigned` and delete its meta directory.
    ///
    /// Alive tasks are kept and reconsidered on a later heartbeat. Returns the removed ids.
    pub async fn clean(&self, assigned: &HashSet<TaskId>) -> Vec<TaskId> {
        let removed: Vec<TaskId> = {
            let mut tasks = self.tasks.lock().unwrap();
            let stale: Vec<TaskId> = tasks
                .iter()
                .filter(|(id, task)| !assigned.contains(id) && !task.is_alive())
                .map(|(id, _)| *id)
                .collect();
            for id in &stale {
                tasks.remove(id);
            }
            stale
        };

        for id in &removed {
            match self.executor.layout().remove(*id).await {
                Ok(()) => debug!(target: "ibex.task", task_id = id, "task cleaned"),
                Err(e) => warn!(target: "ibex.task", task_id = id, error = %e, "remove meta dir failed"),
            }
        }
        removed
    }

    /// Load finished attempts left on disk by a previous run. Returns how many tasks were restored.
    pub async fn rehydrate(&self) -> Result<usize, TaskError> {
        let layout = self.executor.layout();
        let mut restored = Vec::new();

        for (id, clock) in layout.scan_done().await? {
            match layout.load_result(id, clock).await {
                Ok(Some(stored)) => restored.push(Task::restored(id, clock, stored)),
                Ok(None) => {}
                Err(e) => warn!(target: "ibex.task", task_id = id, clock, error = %e, "skip unreadable result"),
            }
        }

        let count = restored.len();
        let mut tasks = self.tasks.lock().unwrap();
        for task in restored {
            tasks.entry(task.id()).or_insert_with(|| Arc::new(task));
        }
        info!(target: "ibex.task", count, dir = %layout.root().display(), "tasks restored from meta dir");
        Ok(count)
    }
}

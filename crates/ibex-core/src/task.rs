use std::sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicBool, Ordering},
};

use ibex_model::{Clock, ReportTask, TaskAction, TaskId, TaskStatus};

use crate::{REPORT_OUTPUT_LIMIT, layout::{Inputs, StoredResult}};

/// Output captured from one attempt so far.
#[derive(Debug, Default)]
pub(crate) struct Captured {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// One execution attempt of a task, identified by its clock.
///
/// Workers keep their own `Arc<Attempt>`, so a worker that outlives a clock change still finalizes
/// the attempt it was spawned for and never touches the newer one.
#[derive(Debug)]
pub(crate) struct Attempt {
    pub clock: Clock,
    /// Inputs on disk belong to an older clock and must be fetched again.
    pub refetch: bool,
    output: Mutex<Captured>,
    finalized: AtomicBool,
    cancelled: AtomicBool,
    killed: AtomicBool,
}

impl Attempt {
    fn new(clock: Clock, refetch: bool) -> Arc<Self> {
        Arc::new(Self {
            clock,
            refetch,
            output: Mutex::new(Captured::default()),
            finalized: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            killed: AtomicBool::new(false),
        })
    }

    pub fn output(&self) -> MutexGuard<'_, Captured> {
        self.output.lock().unwrap()
    }

    /// Claim the single terminal transition of this attempt.
    pub fn try_finalize(&self) -> bool {
        !self.finalized.swap(true, Ordering::SeqCst)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    /// Abort a preparation in progress; the start path checks this before spawning.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// The process group was signalled; the exit is reported as `killed`.
    pub fn mark_killed(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

/// Mutable part of a [`Task`], guarded by the task's own lock.
#[derive(Debug)]
pub(crate) struct TaskState {
    pub action: TaskAction,
    pub status: TaskStatus,
    /// Inputs cached after a successful preparation.
    pub inputs: Option<Inputs>,
    pub attempt: Arc<Attempt>,
    pub preparing: bool,
    pub running: bool,
    pub killing: bool,
    pub pid: Option<u32>,
    /// Clock assigned while the current attempt was still alive; started once it is gone.
    pub pending: Option<(Clock, TaskAction)>,
}

impl TaskState {
    pub fn clock(&self) -> Clock {
        self.attempt.clock
    }

    pub fn is_alive(&self) -> bool {
        self.preparing || self.running || self.killing
    }

    pub fn is_current(&self, attempt: &Arc<Attempt>) -> bool {
        Arc::ptr_eq(&self.attempt, attempt)
    }

    /// Start over for a new clock. Only valid once the previous attempt is no longer alive.
    pub fn reset(&mut self, clock: Clock, action: TaskAction) {
        self.attempt.cancel();
        self.attempt = Attempt::new(clock, true);
        self.action = action;
        self.status = TaskStatus::Empty;
        self.inputs = None;
        self.preparing = false;
        self.running = false;
        self.killing = false;
        self.pid = None;
        self.pending = None;
    }

    /// Adopt a terminal result found on disk for the current attempt.
    pub fn hydrate(&mut self, stored: StoredResult) {
        self.attempt.finalized.store(true, Ordering::SeqCst);
        let mut output = self.attempt.output();
        output.stdout = stored.stdout;
        output.stderr = stored.stderr;
        drop(output);
        self.status = stored.status;
    }
}

/// A task known to this agent.
#[derive(Debug)]
pub struct Task {
    id: TaskId,
    state: Mutex<TaskState>,
}

impl Task {
    pub(crate) fn new(id: TaskId, clock: Clock, action: TaskAction) -> Self {
        Self {
            id,
            state: Mutex::new(TaskState {
                action,
                status: TaskStatus::Empty,
                inputs: None,
                attempt: Attempt::new(clock, false),
                preparing: false,
                running: false,
                killing: false,
                pid: None,
                pending: None,
            }),
        }
    }

    /// A task rebuilt from its latest done marker at start-up.
    pub(crate) fn restored(id: TaskId, clock: Clock, stored: StoredResult) -> Self {
        let task = Self::new(id, clock, TaskAction::Start);
        task.lock().hydrate(stored);
        task
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap()
    }

    pub fn is_alive(&self) -> bool {
        self.lock().is_alive()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.lock();
        let (stdout, stderr) = if state.status.is_terminal() {
            let output = state.attempt.output();
            (
                tail_utf8(&output.stdout, REPORT_OUTPUT_LIMIT),
                tail_utf8(&output.stderr, REPORT_OUTPUT_LIMIT),
            )
        } else {
            (String::new(), String::new())
        };

        TaskSnapshot {
            id: self.id,
            clock: state.clock(),
            action: state.action.clone(),
            status: state.status,
            alive: state.is_alive(),
            pid: state.pid,
            stdout,
            stderr,
        }
    }

    /// Everything the current attempt has written so far, running or not.
    pub fn output(&self) -> (String, String) {
        let state = self.lock();
        let output = state.attempt.output();
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        (stdout, stderr)
    }
}

/// Point-in-time view of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub clock: Clock,
    pub action: TaskAction,
    pub status: TaskStatus,
    pub alive: bool,
    pub pid: Option<u32>,
    /// Output tails; empty until the attempt is terminal.
    pub stdout: String,
    pub stderr: String,
}

impl From<TaskSnapshot> for ReportTask {
    fn from(s: TaskSnapshot) -> Self {
        ReportTask {
            id: s.id,
            clock: s.clock,
            status: s.status,
            stdout: s.stdout,
            stderr: s.stderr,
        }
    }
}

/// Last `limit` bytes of `bytes`, starting on a character boundary.
pub(crate) fn tail_utf8(bytes: &[u8], limit: usize) -> String {
    let mut start = bytes.len().saturating_sub(limit);
    while start < bytes.len() && (bytes[start] & 0b1100_0000) == 0b1000_0000 {
        start += 1;
    }
    String::from_utf8_lossy(&bytes[start..]).into_owned()
}

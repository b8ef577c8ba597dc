use std::{sync::Arc, time::Duration};

use ibex_exec::{ExecError, ExitKind, LoginUser, ScriptCommand, classify_exit, kill_group, spawn_in_group};
use ibex_model::{TaskAction, TaskId, TaskStatus};
use ibex_rpc::JobServer;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::Child,
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    error::TaskError,
    layout::{Inputs, MetaDir},
    task::{Attempt, Captured, Task, TaskState},
};

/// How long output readers may keep draining after the child has exited.
/// Descendants that escaped the process group can hold the pipes open.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 8 * 1024;

/// Drives the per-task state machine: preparation, spawn, wait, kill and persistence.
pub struct Executor {
    layout: MetaDir,
    server: Arc<dyn JobServer>,
    login: LoginUser,
}

enum Launch {
    Started(Child),
    Superseded,
    Cancelled,
    Failed(ExecError),
}

enum KillPlan {
    Group { pid: u32, attempt: Arc<Attempt> },
    NeverStarted(Arc<Attempt>),
    Nothing,
}

impl Executor {
    pub fn new(layout: MetaDir, server: Arc<dyn JobServer>, login: LoginUser) -> Self {
        Self {
            layout,
            server,
            login,
        }
    }

    pub fn layout(&self) -> &MetaDir {
        &self.layout
    }

    /// Act on the task's current action.
    pub async fn dispatch(self: Arc<Self>, task: Arc<Task>) {
        self.recover(&task).await;

        let action = task.lock().action.clone();
        match action {
            TaskAction::Start => self.start(&task).await,
            TaskAction::Kill => self.kill(&task).await,
            TaskAction::Other(action) => {
                warn!(target: "ibex.task", task_id = task.id(), %action, "unknown action ignored");
            }
        }
    }

    /// Adopt the done marker of the current attempt if an earlier run already finished it.
    async fn recover(&self, task: &Arc<Task>) {
        let attempt = {
            let state = task.lock();
            if state.status != TaskStatus::Empty || state.is_alive() {
                return;
            }
            Arc::clone(&state.attempt)
        };

        let stored = match self.layout.load_result(task.id(), attempt.clock).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return,
            Err(e) => {
                warn!(target: "ibex.task", task_id = task.id(), clock = attempt.clock, error = %e, "read done marker failed");
                return;
            }
        };

        let mut state = task.lock();
        if state.is_current(&attempt) && state.status == TaskStatus::Empty && !state.is_alive() {
            info!(target: "ibex.task", task_id = task.id(), clock = attempt.clock, status = %stored.status, "attempt already done; not running again");
            state.hydrate(stored);
        }
    }

    async fn start(self: &Arc<Self>, task: &Arc<Task>) {
        let id = task.id();
        let (attempt, cached) = {
            let mut state = task.lock();
            if state.is_alive() || state.status != TaskStatus::Empty {
                return;
            }
            state.preparing = true;
            (Arc::clone(&state.attempt), state.inputs.clone())
        };
        let clock = attempt.clock;

        let inputs = match cached {
            Some(inputs) => Ok(inputs),
            None => self.prepare(id, attempt.refetch).await,
        };
        let inputs = match inputs {
            Ok(inputs) => inputs,
            Err(e) => {
                warn!(target: "ibex.task", task_id = id, clock, error = %e, "prepare failed; will retry on next assignment");
                self.abandon(task, &attempt);
                return;
            }
        };

        let mut cmd = ScriptCommand::new(self.layout.script(id))
            .with_args(inputs.args.as_str())
            .with_account(inputs.account.as_str())
            .build(&self.login);

        // Spawn under the task lock so a concurrent kill sees either nothing or a pid.
        let launch = {
            let mut state = task.lock();
            if !state.is_current(&attempt) {
                Launch::Superseded
            } else {
                state.inputs = Some(inputs.clone());
                if attempt.is_cancelled() {
                    Launch::Cancelled
                } else {
                    state.preparing = false;
                    match spawn_in_group(&mut cmd) {
                        Ok(child) => {
                            state.running = true;
                            state.pid = child.id();
                            state.status = TaskStatus::Running;
                            Launch::Started(child)
                        }
                        Err(e) => Launch::Failed(e),
                    }
                }
            }
        };

        let mut child = match launch {
            Launch::Started(child) => child,
            Launch::Superseded => {
                debug!(target: "ibex.task", task_id = id, clock, "attempt superseded during preparation");
                return;
            }
            Launch::Cancelled => {
                info!(target: "ibex.task", task_id = id, clock, "killed before start");
                self.finalize(task, &attempt, TaskStatus::Killed).await;
                self.abandon(task, &attempt);
                return;
            }
            Launch::Failed(e) => {
                warn!(target: "ibex.task", task_id = id, clock, error = %e, "spawn failed; will retry on next assignment");
                self.abandon(task, &attempt);
                return;
            }
        };
        info!(target: "ibex.task", task_id = id, clock, pid = ?child.id(), account = %inputs.account, "task started");

        if let Some(mut stdin) = child.stdin.take() {
            let payload = inputs.stdin.into_bytes();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(target: "ibex.task", task_id = id, error = %e, "stdin not fully consumed");
                }
            });
        }
        let readers = [
            child.stdout.take().map(|out| spawn_reader(out, Arc::clone(&attempt), stdout_of)),
            child.stderr.take().map(|err| spawn_reader(err, Arc::clone(&attempt), stderr_of)),
        ];

        let this = Arc::clone(self);
        let task = Arc::clone(task);
        tokio::spawn(async move { this.wait(task, attempt, child, readers).await });
    }

    async fn prepare(&self, id: TaskId, refetch: bool) -> Result<Inputs, TaskError> {
        self.layout.ensure_task_dir(id).await?;

        if !refetch && let Some(inputs) = self.layout.read_inputs(id).await? {
            debug!(target: "ibex.task", task_id = id, "inputs loaded from disk");
            return Ok(inputs);
        }

        let meta = self.server.task_meta(id).await?;
        self.layout.write_inputs(id, &meta).await?;
        Ok(Inputs {
            args: meta.args,
            account: meta.account,
            stdin: meta.stdin,
        })
    }

    fn abandon(self: &Arc<Self>, task: &Arc<Task>, attempt: &Arc<Attempt>) {
        let mut state = task.lock();
        if state.is_current(attempt) {
            state.preparing = false;
            self.promote(task, &mut state);
        }
    }

    /// Move on to a clock that arrived while the previous attempt was alive.
    ///
    /// Called with the task lock held, right after an alive flag was cleared.
    fn promote(self: &Arc<Self>, task: &Arc<Task>, state: &mut TaskState) {
        if state.is_alive() {
            return;
        }
        let Some((clock, action)) = state.pending.take() else {
            return;
        };
        info!(target: "ibex.task", task_id = task.id(), old_clock = state.clock(), clock, %action, "previous attempt gone; taking new clock");
        state.reset(clock, action);
        tokio::spawn(Arc::clone(self).dispatch(Arc::clone(task)));
    }

    async fn wait(
        self: Arc<Self>,
        task: Arc<Task>,
        attempt: Arc<Attempt>,
        mut child: Child,
        readers: [Option<JoinHandle<()>>; 2],
    ) {
        let id = task.id();
        let exit = child.wait().await;

        for reader in readers.into_iter().flatten() {
            let abort = reader.abort_handle();
            if timeout(DRAIN_GRACE, reader).await.is_err() {
                debug!(target: "ibex.task", task_id = id, "output still open after exit; detaching");
                abort.abort();
            }
        }

        let status = match exit {
            Ok(exit) => {
                debug!(target: "ibex.task", task_id = id, clock = attempt.clock, %exit, "process exited");
                match classify_exit(exit) {
                    _ if attempt.was_killed() => TaskStatus::Killed,
                    ExitKind::Success => TaskStatus::Success,
                    ExitKind::Killed => TaskStatus::Killed,
                    ExitKind::Failed => TaskStatus::Failed,
                }
            }
            Err(e) => {
                warn!(target: "ibex.task", task_id = id, clock = attempt.clock, error = %e, "wait failed");
                TaskStatus::Failed
            }
        };

        self.finalize(&task, &attempt, status).await;

        let mut state = task.lock();
        if state.is_current(&attempt) {
            state.running = false;
            state.pid = None;
            self.promote(&task, &mut state);
        }
    }

    async fn kill(self: &Arc<Self>, task: &Arc<Task>) {
        let id = task.id();
        let plan = {
            let mut state = task.lock();
            if state.status.is_terminal() || state.killing {
                KillPlan::Nothing
            } else if let (true, Some(pid)) = (state.running, state.pid) {
                state.killing = true;
                state.status = TaskStatus::Killing;
                KillPlan::Group {
                    pid,
                    attempt: Arc::clone(&state.attempt),
                }
            } else if state.preparing {
                state.attempt.cancel();
                KillPlan::Nothing
            } else {
                state.killing = true;
                KillPlan::NeverStarted(Arc::clone(&state.attempt))
            }
        };

        let attempt = match plan {
            KillPlan::Nothing => return,
            KillPlan::NeverStarted(attempt) => {
                info!(target: "ibex.task", task_id = id, clock = attempt.clock, "killed before start");
                self.finalize(task, &attempt, TaskStatus::Killed).await;
                attempt
            }
            KillPlan::Group { pid, attempt } => {
                match kill_group(pid) {
                    Ok(()) => {
                        attempt.mark_killed();
                        info!(target: "ibex.task", task_id = id, clock = attempt.clock, pid, "process group killed");
                    }
                    Err(e) => {
                        warn!(target: "ibex.task", task_id = id, clock = attempt.clock, pid, error = %e, "kill failed");
                        self.finalize(task, &attempt, TaskStatus::KillFailed).await;
                    }
                }
                attempt
            }
        };

        let mut state = task.lock();
        if state.is_current(&attempt) {
            state.killing = false;
            self.promote(task, &mut state);
        }
    }

    /// Persist the terminal status of `attempt`, then publish it. Only the first call per attempt counts.
    async fn finalize(&self, task: &Task, attempt: &Arc<Attempt>, status: TaskStatus) {
        if !attempt.try_finalize() {
            return;
        }
        let id = task.id();

        let (stdout, stderr) = {
            let output = attempt.output();
            (output.stdout.clone(), output.stderr.clone())
        };
        let persisted = async {
            self.layout.ensure_task_dir(id).await?;
            self.layout
                .persist_result(id, attempt.clock, &stdout, &stderr, status)
                .await
        };
        match persisted.await {
            Ok(()) => info!(target: "ibex.task", task_id = id, clock = attempt.clock, %status, "task finished"),
            Err(e) => warn!(target: "ibex.task", task_id = id, clock = attempt.clock, %status, error = %e, "persist result failed"),
        }

        let mut state = task.lock();
        if state.is_current(attempt) {
            state.status = status;
        }
    }
}

fn spawn_reader<R>(
    mut pipe: R,
    attempt: Arc<Attempt>,
    sink: fn(&mut Captured) -> &mut Vec<u8>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => sink(&mut *attempt.output()).extend_from_slice(&chunk[..n]),
            }
        }
    })
}

fn stdout_of(c: &mut Captured) -> &mut Vec<u8> {
    &mut c.stdout
}

fn stderr_of(c: &mut Captured) -> &mut Vec<u8> {
    &mut c.stderr
}

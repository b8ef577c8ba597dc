use std::{collections::HashSet, sync::Arc, time::Duration};

use ibex_model::ReportRequest;
use ibex_rpc::{JobServer, RpcError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{ident::HostIdent, registry::LocalTasks};

/// What one heartbeat iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The local ident could not be resolved; nothing was sent.
    NoIdent,
    /// `Server.Report` failed; the assignment was not applied.
    Unreachable,
    /// The server answered with a non-empty `Message`.
    Refused(String),
    Applied { assigned: usize, cleaned: usize },
}

/// Periodic report/assign/clean cycle against the job server.
pub struct Heartbeat {
    interval: Duration,
    ident: HostIdent,
    server: Arc<dyn JobServer>,
    tasks: Arc<LocalTasks>,
}

impl Heartbeat {
    pub fn new(interval: Duration, ident: HostIdent, server: Arc<dyn JobServer>, tasks: Arc<LocalTasks>) -> Self {
        Self {
            interval,
            ident,
            server,
            tasks,
        }
    }

    /// Run until `cancel` fires. Running tasks are left alone on the way out.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(target: "ibex.heartbeat", interval_ms = self.interval.as_millis() as u64, ident = %self.ident, "heartbeat started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            let outcome = self.tick().await;
            debug!(target: "ibex.heartbeat", ?outcome, "tick done");
        }
        info!(target: "ibex.heartbeat", "heartbeat stopped");
    }

    /// One report/assign/clean round.
    pub async fn tick(&self) -> TickOutcome {
        let ident = match self.ident.resolve().await {
            Ok(ident) => ident,
            Err(e) => {
                warn!(target: "ibex.heartbeat", ident = %self.ident, error = %e, "resolve ident failed; skipping");
                return TickOutcome::NoIdent;
            }
        };

        let req = ReportRequest {
            ident,
            report_tasks: self.tasks.report_tasks(),
        };
        let resp = match self.server.report(&req).await {
            Ok(resp) => resp,
            Err(RpcError::NoServer) => {
                error!(target: "ibex.heartbeat", "no job server reachable");
                return TickOutcome::Unreachable;
            }
            Err(e) => {
                warn!(target: "ibex.heartbeat", error = %e, "report failed");
                return TickOutcome::Unreachable;
            }
        };

        if !resp.message.is_empty() {
            warn!(target: "ibex.heartbeat", message = %resp.message, "report refused by server");
            return TickOutcome::Refused(resp.message);
        }

        let assigned: HashSet<_> = resp.assign_tasks.iter().map(|t| t.id).collect();
        for task in &resp.assign_tasks {
            self.tasks.assign(task);
        }
        let cleaned = self.tasks.clean(&assigned).await;

        debug!(
            target: "ibex.heartbeat",
            reported = req.report_tasks.len(),
            assigned = assigned.len(),
            cleaned = cleaned.len(),
            "assignment applied"
        );
        TickOutcome::Applied {
            assigned: assigned.len(),
            cleaned: cleaned.len(),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use ibex_exec::LoginUser;
    use ibex_model::{AssignTask, ReportResponse, TaskAction, TaskId, TaskMeta, TaskStatus};
    use tempfile::TempDir;

    use super::*;
    use crate::{executor::Executor, layout::MetaDir};

    /// Replays scripted responses and records every report it receives.
    #[derive(Default)]
    struct Scripted {
        replies: Mutex<Vec<Result<ReportResponse, RpcError>>>,
        seen: Mutex<Vec<ReportRequest>>,
    }

    #[async_trait]
    impl JobServer for Scripted {
        async fn report(&self, req: &ReportRequest) -> Result<ReportResponse, RpcError> {
            self.seen.lock().unwrap().push(req.clone());
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                Ok(ReportResponse::default())
            } else {
                replies.remove(0)
            }
        }

        async fn task_meta(&self, _id: TaskId) -> Result<TaskMeta, RpcError> {
            Ok(TaskMeta {
                script: "#!/bin/sh\nexit 0\n".into(),
                ..TaskMeta::default()
            })
        }
    }

    fn heartbeat(tmp: &TempDir, server: Arc<Scripted>) -> Heartbeat {
        let exec = Executor::new(
            MetaDir::new(tmp.path()),
            Arc::clone(&server) as Arc<dyn JobServer>,
            LoginUser::current().unwrap(),
        );
        let tasks = Arc::new(LocalTasks::new(Arc::new(exec)));
        Heartbeat::new(Duration::from_millis(20), HostIdent::parse("agent-1"), server, tasks)
    }

    #[tokio::test]
    async fn refused_report_keeps_tasks() {
        let tmp = TempDir::new().unwrap();
        let server = Arc::new(Scripted::default());
        server.replies.lock().unwrap().push(Ok(ReportResponse {
            message: "agent not registered".into(),
            assign_tasks: vec![],
        }));
        let hb = heartbeat(&tmp, Arc::clone(&server));
        hb.tasks.assign(&AssignTask::new(1, 1, TaskAction::Other("hold".into())));

        assert_eq!(hb.tick().await, TickOutcome::Refused("agent not registered".into()));
        assert_eq!(hb.tasks.len(), 1);
        assert_eq!(server.seen.lock().unwrap()[0].ident, "agent-1");
    }

    #[tokio::test]
    async fn transport_failure_skips_iteration() {
        let tmp = TempDir::new().unwrap();
        let server = Arc::new(Scripted::default());
        server.replies.lock().unwrap().push(Err(RpcError::NoServer));
        let hb = heartbeat(&tmp, Arc::clone(&server));
        hb.tasks.assign(&AssignTask::new(1, 1, TaskAction::Other("hold".into())));

        assert_eq!(hb.tick().await, TickOutcome::Unreachable);
        assert_eq!(hb.tasks.len(), 1);
    }

    #[tokio::test]
    async fn empty_assignment_cleans_idle_tasks() {
        let tmp = TempDir::new().unwrap();
        let server = Arc::new(Scripted::default());
        server.replies.lock().unwrap().push(Ok(ReportResponse {
            message: String::new(),
            assign_tasks: vec![AssignTask::new(2, 1, TaskAction::Kill), AssignTask::new(3, 1, TaskAction::Start)],
        }));
        let hb = heartbeat(&tmp, Arc::clone(&server));
        hb.tasks.assign(&AssignTask::new(1, 1, TaskAction::Other("hold".into())));

        let outcome = hb.tick().await;
        assert_eq!(outcome, TickOutcome::Applied { assigned: 2, cleaned: 1 });
        assert!(hb.tasks.get(1).is_none());
        assert!(hb.tasks.get(2).is_none(), "kill for an unknown id creates nothing");

        for _ in 0..200 {
            if hb.tasks.get(3).is_some_and(|t| t.snapshot().status == TaskStatus::Success && !t.is_alive()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(hb.tick().await, TickOutcome::Applied { assigned: 0, cleaned: 1 });
        assert!(hb.tasks.is_empty());
        let seen = server.seen.lock().unwrap();
        assert_eq!(seen[1].report_tasks[0].status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let tmp = TempDir::new().unwrap();
        let server = Arc::new(Scripted::default());
        let hb = heartbeat(&tmp, Arc::clone(&server));
        let cancel = CancellationToken::new();

        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { hb.run(cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert!(!server.seen.lock().unwrap().is_empty());
    }
}

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::get,
};
use ibex_core::{LocalTasks, TaskSnapshot};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Read-only admin endpoints.
///
/// Routes:
/// - GET /ping  - liveness
/// - GET /pid   - process id
/// - GET /tasks - registry snapshot
/// - GET /output/{id}/stdout.json, /output/{id}/stderr.json - output of the task's current attempt
pub fn router(tasks: Arc<LocalTasks>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/pid", get(pid))
        .route("/tasks", get(list_tasks))
        .route("/output/{id}/stdout.json", get(task_stdout))
        .route("/output/{id}/stderr.json", get(task_stderr))
        .with_state(tasks)
}

/// Serve [`router`] on `addr` until `cancel` fires.
pub async fn serve(addr: SocketAddr, tasks: Arc<LocalTasks>, cancel: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(target: "ibex.agentd", addr = %listener.local_addr()?, "http server listening");

    axum::serve(listener, router(tasks))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    info!(target: "ibex.agentd", "http server stopped");
    Ok(())
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Debug, Serialize)]
struct TaskView {
    id: i64,
    clock: i64,
    action: String,
    status: String,
    alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pid: Option<u32>,
}

impl From<TaskSnapshot> for TaskView {
    fn from(s: TaskSnapshot) -> Self {
        Self {
            id: s.id,
            clock: s.clock,
            action: s.action.to_string(),
            status: s.status.to_string(),
            alive: s.alive,
            pid: s.pid,
        }
    }
}

/// Body shape the job server expects when it proxies output from an agent.
#[derive(Debug, Serialize)]
struct OutputView {
    dat: String,
    err: String,
}

enum Stream {
    Stdout,
    Stderr,
}

fn render_output(tasks: &LocalTasks, id: i64, stream: Stream) -> (StatusCode, Json<OutputView>) {
    let Some(task) = tasks.get(id) else {
        let view = OutputView {
            dat: String::new(),
            err: format!("task {id} not found"),
        };
        return (StatusCode::NOT_FOUND, Json(view));
    };

    let (stdout, stderr) = task.output();
    let dat = match stream {
        Stream::Stdout => stdout,
        Stream::Stderr => stderr,
    };
    (StatusCode::OK, Json(OutputView { dat, err: String::new() }))
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /ping
async fn ping() -> &'static str {
    "pong"
}

/// GET /pid
async fn pid() -> String {
    std::process::id().to_string()
}

/// GET /tasks
async fn list_tasks(State(tasks): State<Arc<LocalTasks>>) -> Json<Vec<TaskView>> {
    Json(tasks.snapshot().into_iter().map(TaskView::from).collect())
}

/// GET /output/{id}/stdout.json
async fn task_stdout(State(tasks): State<Arc<LocalTasks>>, Path(id): Path<i64>) -> (StatusCode, Json<OutputView>) {
    render_output(&tasks, id, Stream::Stdout)
}

/// GET /output/{id}/stderr.json
async fn task_stderr(State(tasks): State<Arc<LocalTasks>>, Path(id): Path<i64>) -> (StatusCode, Json<OutputView>) {
    render_output(&tasks, id, Stream::Stderr)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ibex_core::{Executor, MetaDir};
    use ibex_exec::LoginUser;
    use ibex_model::{AssignTask, TaskAction, TaskStatus};
    use ibex_rpc::{ClientOptions, JobServer, RpcClient};
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn tasks(dir: &TempDir) -> Arc<LocalTasks> {
        let server: Arc<dyn JobServer> = Arc::new(RpcClient::new(vec![], ClientOptions::default()));
        let exec = Executor::new(MetaDir::new(dir.path()), server, LoginUser::current().unwrap());
        Arc::new(LocalTasks::new(Arc::new(exec)))
    }

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let req = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut resp = String::new();
        stream.read_to_string(&mut resp).await.unwrap();
        resp
    }

    #[tokio::test]
    async fn endpoints_answer_and_stop_on_cancel() {
        let tmp = TempDir::new().unwrap();
        let tasks = tasks(&tmp);
        tasks.assign(&AssignTask::new(7, 3, TaskAction::Other("hold".into())));

        let layout = tasks.executor().layout().clone();
        layout.ensure_task_dir(8).await.unwrap();
        layout
            .persist_result(8, 4, b"hello\n", b"oops", TaskStatus::Success)
            .await
            .unwrap();
        tasks.rehydrate().await.unwrap();

        let spare = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = spare.local_addr().unwrap();
        drop(spare);

        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(addr, Arc::clone(&tasks), cancel.clone()));

        let mut ping = String::new();
        for _ in 0..50 {
            if tokio::net::TcpStream::connect(addr).await.is_ok() {
                ping = get(addr, "/ping").await;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(ping.ends_with("pong"), "{ping}");

        let pid = get(addr, "/pid").await;
        assert!(pid.ends_with(&std::process::id().to_string()));

        let list = get(addr, "/tasks").await;
        assert!(list.contains(r#""id":7"#), "{list}");
        assert!(list.contains(r#""clock":3"#));
        assert!(list.contains(r#""status":"""#));

        let stdout = get(addr, "/output/8/stdout.json").await;
        assert!(stdout.starts_with("HTTP/1.1 200"), "{stdout}");
        assert!(stdout.ends_with(r#"{"dat":"hello\n","err":""}"#), "{stdout}");
        let stderr = get(addr, "/output/8/stderr.json").await;
        assert!(stderr.ends_with(r#"{"dat":"oops","err":""}"#), "{stderr}");
        let missing = get(addr, "/output/99/stdout.json").await;
        assert!(missing.starts_with("HTTP/1.1 404"), "{missing}");
        assert!(missing.contains("task 99 not found"));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

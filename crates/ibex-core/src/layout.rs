use std::{
    io,
    path::{Path, PathBuf},
};

use ibex_model::{Clock, TaskId, TaskMeta, TaskStatus};
use tokio::fs;
use tracing::{debug, warn};

use crate::error::TaskError;

const SCRIPT: &str = "script";
const ARGS: &str = "args";
const ACCOUNT: &str = "account";
const STDIN: &str = "stdin";
const STDOUT: &str = "stdout";
const STDERR: &str = "stderr";
const WRITE_FLAG: &str = ".write";
const DONE_SUFFIX: &str = ".done";

/// Execution inputs of a prepared task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inputs {
    pub args: String,
    pub account: String,
    pub stdin: String,
}

/// Terminal state of one attempt as found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResult {
    pub status: TaskStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Per-task persisted state under one root directory.
///
/// ```text
/// <root>/<id>/script        chmod +x
/// <root>/<id>/args
/// <root>/<id>/account
/// <root>/<id>/stdin
/// <root>/<id>/.write        written after the four inputs
/// <root>/<id>/stdout
/// <root>/<id>/stderr
/// <root>/<id>/<clock>.done  final status, written after stdout/stderr
/// ```
#[derive(Debug, Clone)]
pub struct MetaDir {
    root: PathBuf,
}

impl MetaDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn task_dir(&self, id: TaskId) -> PathBuf {
        self.root.join(id.to_string())
    }

    pub fn script(&self, id: TaskId) -> PathBuf {
        self.task_dir(id).join(SCRIPT)
    }

    pub fn done_marker(&self, id: TaskId, clock: Clock) -> PathBuf {
        self.task_dir(id).join(format!("{clock}{DONE_SUFFIX}"))
    }

    pub async fn ensure_task_dir(&self, id: TaskId) -> Result<(), TaskError> {
        let dir = self.task_dir(id);
        fs::create_dir_all(&dir)
            .await
            .map_err(TaskError::io("mkdir -p", dir))
    }

    /// Inputs written by an earlier preparation, if its `.write` sentinel exists.
    pub async fn read_inputs(&self, id: TaskId) -> Result<Option<Inputs>, TaskError> {
        let dir = self.task_dir(id);
        if !exists(&dir.join(WRITE_FLAG)).await {
            return Ok(None);
        }

        Ok(Some(Inputs {
            args: read_trimmed(&dir.join(ARGS)).await?,
            account: read_trimmed(&dir.join(ACCOUNT)).await?,
            stdin: read_trimmed(&dir.join(STDIN)).await?,
        }))
    }

    /// Materialise fetched metadata; the `.write` sentinel goes last.
    pub async fn write_inputs(&self, id: TaskId, meta: &TaskMeta) -> Result<(), TaskError> {
        let dir = self.task_dir(id);

        let script = dir.join(SCRIPT);
        write(&script, meta.script.as_bytes()).await?;
        make_executable(&script).await?;

        write(&dir.join(ARGS), meta.args.as_bytes()).await?;
        write(&dir.join(ACCOUNT), meta.account.as_bytes()).await?;
        write(&dir.join(STDIN), meta.stdin.as_bytes()).await?;
        write(&dir.join(WRITE_FLAG), b"").await?;

        debug!(target: "ibex.task", task_id = id, dir = %dir.display(), "task inputs written");
        Ok(())
    }

    pub async fn is_done(&self, id: TaskId, clock: Clock) -> bool {
        exists(&self.done_marker(id, clock)).await
    }

    /// Write captured output and then the done marker carrying `status`.
    pub async fn persist_result(
        &self,
        id: TaskId,
        clock: Clock,
        stdout: &[u8],
        stderr: &[u8],
        status: TaskStatus,
    ) -> Result<(), TaskError> {
        let dir = self.task_dir(id);
        write(&dir.join(STDOUT), stdout).await?;
        write(&dir.join(STDERR), stderr).await?;
        write(&self.done_marker(id, clock), status.as_str().as_bytes()).await
    }

    /// Load the result of `(id, clock)` if its done marker exists.
    ///
    /// Missing or unreadable output files degrade to empty buffers.
    pub async fn load_result(&self, id: TaskId, clock: Clock) -> Result<Option<StoredResult>, TaskError> {
        let marker = self.done_marker(id, clock);
        let raw = match fs::read_to_string(&marker).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TaskError::io("read", marker)(e)),
        };

        let status = raw.parse().unwrap_or_else(|e| {
            warn!(target: "ibex.task", task_id = id, clock, error = %e, "unreadable done marker; treating as failed");
            TaskStatus::Failed
        });

        let dir = self.task_dir(id);
        Ok(Some(StoredResult {
            status,
            stdout: read_or_empty(&dir.join(STDOUT)).await,
            stderr: read_or_empty(&dir.join(STDERR)).await,
        }))
    }

    pub async fn remove(&self, id: TaskId) -> Result<(), TaskError> {
        let dir = self.task_dir(id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TaskError::io("rm -rf", dir)(e)),
        }
    }

    /// Every task directory holding at least one done marker, with its highest clock.
    pub async fn scan_done(&self) -> Result<Vec<(TaskId, Clock)>, TaskError> {
        let mut found = Vec::new();

        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(TaskError::io("read dir", &self.root)(e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(TaskError::io("read dir", &self.root))?
        {
            let Some(id) = entry.file_name().to_str().and_then(|s| s.parse::<TaskId>().ok()) else {
                continue;
            };
            if let Some(clock) = latest_done(&entry.path()).await? {
                found.push((id, clock));
            }
        }

        found.sort_unstable();
        Ok(found)
    }
}

async fn latest_done(dir: &Path) -> Result<Option<Clock>, TaskError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotADirectory => return Ok(None),
        Err(e) => return Err(TaskError::io("read dir", dir)(e)),
    };

    let mut latest = None;
    while let Some(entry) = entries.next_entry().await.map_err(TaskError::io("read dir", dir))? {
        let clock = entry
            .file_name()
            .to_str()
            .and_then(|name| name.strip_suffix(DONE_SUFFIX))
            .and_then(|clock| clock.parse::<Clock>().ok());
        if let Some(clock) = clock {
            latest = latest.max(Some(clock));
        }
    }
    Ok(latest)
}

async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

async fn write(path: &Path, contents: &[u8]) -> Result<(), TaskError> {
    fs::write(path, contents).await.map_err(TaskError::io("write", path))
}

async fn read_trimmed(path: &Path) -> Result<String, TaskError> {
    let raw = fs::read_to_string(path).await.map_err(TaskError::io("read", path))?;
    Ok(raw.trim_end().to_string())
}

async fn read_or_empty(path: &Path) -> Vec<u8> {
    fs::read(path).await.unwrap_or_else(|e| {
        warn!(target: "ibex.task", path = %path.display(), error = %e, "read output failed");
        Vec::new()
    })
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<(), TaskError> {
    use std::os::unix::fs::PermissionsExt;

    let meta = fs::metadata(path).await.map_err(TaskError::io("stat", path))?;
    let mut perms = meta.permissions();
    perms.set_mode(perms.mode() | 0o111);
    fs::set_permissions(path, perms)
        .await
        .map_err(TaskError::io("chmod +x", path))
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> Result<(), TaskError> {
    Ok(())
}

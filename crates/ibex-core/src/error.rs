use std::{io, path::PathBuf};

use ibex_exec::ExecError;
use ibex_rpc::RpcError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("query task meta: {0}")]
    Meta(#[from] RpcError),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

impl TaskError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| TaskError::Io { op, path, source }
    }
}

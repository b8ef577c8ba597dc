//! Process plumbing for task scripts: building the shell command line, launching it as the
//! leader of a fresh process group, terminating the whole group, and classifying the exit.
mod error;
pub use error::{ExecError, ExecResult};

mod command;
pub use command::{ScriptCommand, quote_args};

mod group;
pub use group::{ExitKind, classify_exit, kill_group, spawn_in_group};

mod identity;
pub use identity::LoginUser;

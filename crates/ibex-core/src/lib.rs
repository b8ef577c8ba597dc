//! Task lifecycle on the agent: on-disk meta layout, per-task state machine and executor,
//! the local registry, and the heartbeat loop that reconciles it with the job server.
pub mod error;
pub use error::TaskError;

mod layout;
pub use layout::{Inputs, MetaDir, StoredResult};

mod task;
pub use task::{Task, TaskSnapshot};

mod executor;
pub use executor::Executor;

mod registry;
pub use registry::LocalTasks;

mod heartbeat;
pub use heartbeat::{Heartbeat, TickOutcome};

mod ident;
pub use ident::{HostIdent, IdentError};

/// Report payloads keep at most this many trailing bytes of each output stream.
pub const REPORT_OUTPUT_LIMIT: usize = 65535;

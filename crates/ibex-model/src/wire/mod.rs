//! Request/response shapes exchanged with the job server.
//!
//! Field names follow the server's string-keyed maps (`Id`, `Clock`, `ReportTasks`, ...).
//! Lists the server may send as `nil` decode to empty vectors.
mod meta;
pub use meta::TaskMetaResponse;

mod report;
pub use report::{AssignTask, ReportRequest, ReportResponse, ReportTask};

pub(crate) mod nullable {
    use serde::{Deserialize, Deserializer};

    pub fn vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
    }

    pub fn string<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
    }
}

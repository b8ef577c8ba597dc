use async_trait::async_trait;
use tracing::debug;

use ibex_model::{ReportRequest, ReportResponse, TaskId, TaskMeta, TaskMetaResponse};

use crate::{RpcClient, error::RpcError, method};

/// The job-server operations the agent relies on.
///
/// [`RpcClient`] is the production implementation; tests substitute in-memory fakes.
#[async_trait]
pub trait JobServer: Send + Sync + 'static {
    /// `Server.Report`: send the local view, receive the authoritative assignment.
    ///
    /// A non-empty `message` in the reply is returned as-is; it is not an error at this layer.
    async fn report(&self, req: &ReportRequest) -> Result<ReportResponse, RpcError>;

    /// `Server.GetTaskMeta`: script body, arguments, account and stdin of a task.
    async fn task_meta(&self, id: TaskId) -> Result<TaskMeta, RpcError>;
}

#[async_trait]
impl JobServer for RpcClient {
    async fn report(&self, req: &ReportRequest) -> Result<ReportResponse, RpcError> {
        self.call(method::REPORT, req).await
    }

    async fn task_meta(&self, id: TaskId) -> Result<TaskMeta, RpcError> {
        fetch_task_meta(self, id).await
    }
}

/// Fetch the metadata of task `id` from the currently selected server.
///
/// A reply with a non-empty `Message` becomes [`RpcError::Rejected`] and leaves the connection open;
/// transport failures have already closed it inside [`RpcClient::call`].
pub async fn fetch_task_meta(client: &RpcClient, id: TaskId) -> Result<TaskMeta, RpcError> {
    let resp: TaskMetaResponse = client.call(method::GET_TASK_META, &id).await?;
    if !resp.message.is_empty() {
        return Err(RpcError::Rejected(resp.message));
    }
    debug!(target: "ibex.rpc", task_id = id, account = %resp.account, "task meta fetched");
    Ok(resp.into())
}

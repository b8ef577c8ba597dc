use std::{
    future::Future,
    time::{Duration, Instant},
};

use serde::{Serialize, de::DeserializeOwned};
use tokio::{net::TcpStream, sync::Mutex, task::JoinSet, time::timeout};
use tracing::{debug, error, info, warn};

use crate::{codec::MsgpackConn, error::RpcError, method};

/// Timeouts applied to every connection the client opens.
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub dial_timeout: Duration,
    pub call_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(5),
        }
    }
}

struct Selected {
    addr: String,
    conn: MsgpackConn<TcpStream>,
}

/// RPC client over a set of replicated job servers.
///
/// The first call probes every server (dial + `Server.Ping`) and keeps the fastest one. That server is
/// reused until a call fails with a transport-level error, after which the connection is dropped and
/// the next call probes again. Calls are serialised; reselection happens under the same lock.
pub struct RpcClient {
    servers: Vec<String>,
    opts: ClientOptions,
    current: Mutex<Option<Selected>>,
}

impl RpcClient {
    pub fn new(servers: Vec<String>, opts: ClientOptions) -> Self {
        Self {
            servers,
            opts,
            current: Mutex::new(None),
        }
    }

    /// Address of the currently selected server, if any.
    pub async fn selected(&self) -> Option<String> {
        self.current.lock().await.as_ref().map(|s| s.addr.clone())
    }

    /// Invoke `method` on the selected server, selecting one first when needed.
    pub async fn call<Req, Resp>(&self, method: &str, params: &Req) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let mut current = self.current.lock().await;

        if current.is_none() {
            *current = self.select().await;
        }
        let Some(selected) = current.as_mut() else {
            return Err(RpcError::NoServer);
        };

        let result = with_timeout("call", self.opts.call_timeout, selected.conn.call(method, params)).await;
        if let Err(e) = &result
            && e.is_transport()
        {
            warn!(target: "ibex.rpc", server = %selected.addr, method, error = %e, "call failed; closing connection");
            *current = None;
        }
        result
    }

    /// Drop the current connection; the next call reselects.
    pub async fn close(&self) {
        if let Some(selected) = self.current.lock().await.take() {
            debug!(target: "ibex.rpc", server = %selected.addr, "connection closed");
        }
    }

    async fn select(&self) -> Option<Selected> {
        let mut probes = JoinSet::new();
        for addr in &self.servers {
            let addr = addr.clone();
            let opts = self.opts;
            probes.spawn(async move {
                let result = probe(&addr, opts).await;
                (addr, result)
            });
        }

        let mut best: Option<(Duration, Selected)> = None;
        while let Some(joined) = probes.join_next().await {
            let Ok((addr, result)) = joined else {
                continue;
            };
            match result {
                Ok((elapsed, conn)) => {
                    debug!(target: "ibex.rpc", server = %addr, elapsed_ms = elapsed.as_millis() as u64, "ping ok");
                    if best.as_ref().is_none_or(|(fastest, _)| elapsed < *fastest) {
                        best = Some((elapsed, Selected { addr, conn }));
                    }
                }
                Err(e) => warn!(target: "ibex.rpc", server = %addr, error = %e, "ping failed"),
            }
        }

        match best {
            Some((elapsed, selected)) => {
                info!(target: "ibex.rpc", server = %selected.addr, elapsed_ms = elapsed.as_millis() as u64, "server selected");
                Some(selected)
            }
            None => {
                error!(target: "ibex.rpc", servers = ?self.servers, "no server reachable");
                None
            }
        }
    }
}

async fn probe(addr: &str, opts: ClientOptions) -> Result<(Duration, MsgpackConn<TcpStream>), RpcError> {
    let started = Instant::now();

    let stream = match timeout(opts.dial_timeout, TcpStream::connect(addr)).await {
        Ok(stream) => stream?,
        Err(_) => {
            return Err(RpcError::Timeout {
                op: "dial",
                ms: opts.dial_timeout.as_millis(),
            });
        }
    };
    let _ = stream.set_nodelay(true);

    let mut conn = MsgpackConn::new(stream);
    let _: rmpv::Value = with_timeout("ping", opts.call_timeout, conn.call(method::PING, "")).await?;

    Ok((started.elapsed(), conn))
}

async fn with_timeout<T>(
    op: &'static str,
    limit: Duration,
    fut: impl Future<Output = Result<T, RpcError>>,
) -> Result<T, RpcError> {
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(RpcError::Timeout {
            op,
            ms: limit.as_millis(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use tokio::net::TcpListener;

    use super::*;
    use crate::codec::RESPONSE;

    /// Answers every request with "pong" after `delay`, counting the non-ping calls.
    async fn stub(delay: Duration, calls: Arc<AtomicUsize>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    let mut conn = MsgpackConn::new(stream);
                    while let Ok(frame) = conn.read_frame().await {
                        let items = frame.as_array().cloned().unwrap_or_default();
                        let msgid = items[1].as_u64().unwrap() as u32;
                        if items[2].as_str() != Some(method::PING) {
                            calls.fetch_add(1, Ordering::SeqCst);
                        }
                        tokio::time::sleep(delay).await;
                        if conn
                            .write_frame(&(RESPONSE, msgid, (), "pong"))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    fn dead_addr() -> String {
        // Bind and drop to get a port nobody listens on.
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().to_string()
    }

    #[tokio::test]
    async fn no_server_reachable() {
        let client = RpcClient::new(vec![dead_addr()], ClientOptions::default());
        let err = client.call::<_, String>("Server.Echo", "").await.unwrap_err();
        assert!(matches!(err, RpcError::NoServer));
        assert!(client.selected().await.is_none());
    }

    #[tokio::test]
    async fn skips_unreachable_and_sticks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let live = stub(Duration::ZERO, Arc::clone(&calls)).await;
        let client = RpcClient::new(vec![dead_addr(), live.clone()], ClientOptions::default());

        for _ in 0..3 {
            let out: String = client.call("Server.Echo", "").await.unwrap();
            assert_eq!(out, "pong");
        }
        assert_eq!(client.selected().await.as_deref(), Some(live.as_str()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn picks_the_fastest_replica() {
        let slow = stub(Duration::from_millis(300), Arc::new(AtomicUsize::new(0))).await;
        let fast = stub(Duration::ZERO, Arc::new(AtomicUsize::new(0))).await;
        let client = RpcClient::new(vec![slow, fast.clone()], ClientOptions::default());

        let _: String = client.call("Server.Echo", "").await.unwrap();
        assert_eq!(client.selected().await.as_deref(), Some(fast.as_str()));
    }

    #[tokio::test]
    async fn call_timeout_drops_connection() {
        let opts = ClientOptions {
            dial_timeout: Duration::from_secs(1),
            call_timeout: Duration::from_millis(200),
        };
        // The stub answers the probe's ping but never the call that follows.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = MsgpackConn::new(stream);
            let frame = conn.read_frame().await.unwrap();
            let msgid = frame.as_array().unwrap()[1].as_u64().unwrap() as u32;
            conn.write_frame(&(RESPONSE, msgid, (), "pong")).await.unwrap();
            let _ = conn.read_frame().await;
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let client = RpcClient::new(vec![addr], opts);
        let err = client.call::<_, String>("Server.Echo", "").await.unwrap_err();
        assert!(matches!(err, RpcError::Timeout { op: "call", .. }));
        assert!(client.selected().await.is_none());
    }
}

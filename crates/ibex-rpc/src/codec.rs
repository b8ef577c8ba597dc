use std::io::{self, Cursor};

use rmpv::Value;
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::RpcError;

/// Message type tag of a request frame: `[0, msgid, method, [params]]`.
pub const REQUEST: u8 = 0;
/// Message type tag of a response frame: `[1, msgid, error, result]`.
pub const RESPONSE: u8 = 1;

const READ_CHUNK: usize = 4096;

/// A msgpack-rpc connection.
///
/// Frames are self-delimiting msgpack values; bytes are buffered until a whole value decodes.
/// Structs are written as string-keyed maps so the server sees its own field names.
/// One call is in flight at a time: [`MsgpackConn::call`] takes `&mut self`.
pub struct MsgpackConn<S> {
    stream: S,
    buf: Vec<u8>,
    next_id: u32,
}

impl<S> MsgpackConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::with_capacity(READ_CHUNK),
            next_id: 0,
        }
    }

    /// Invoke `method` with a single argument and decode the result.
    pub async fn call<Req, Resp>(&mut self, method: &str, params: &Req) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let msgid = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        self.write_frame(&(REQUEST, msgid, method, [params])).await?;
        trace!(target: "ibex.rpc", method, msgid, "request sent");

        let frame = self.read_frame().await?;
        let (resp_id, error, result) = split_response(frame)?;
        if resp_id != msgid {
            return Err(RpcError::Protocol(format!(
                "response id {resp_id} does not match request id {msgid}"
            )));
        }
        if let Some(message) = error {
            return Err(RpcError::Remote(message));
        }
        Ok(rmpv::ext::from_value(result)?)
    }

    /// Encode `value` with named struct fields and flush it.
    pub async fn write_frame<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), RpcError> {
        let bytes = rmp_serde::to_vec_named(value)?;
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read exactly one msgpack value from the stream.
    pub async fn read_frame(&mut self) -> Result<Value, RpcError> {
        loop {
            if !self.buf.is_empty() {
                let mut cursor = Cursor::new(self.buf.as_slice());
                match rmpv::decode::read_value(&mut cursor) {
                    Ok(value) => {
                        let used = cursor.position() as usize;
                        self.buf.drain(..used);
                        return Ok(value);
                    }
                    Err(e) if is_incomplete(&e) => {}
                    Err(e) => return Err(RpcError::Codec(e.to_string())),
                }
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(RpcError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                )));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

fn is_incomplete(e: &rmpv::decode::Error) -> bool {
    match e {
        rmpv::decode::Error::InvalidMarkerRead(io) | rmpv::decode::Error::InvalidDataRead(io) => {
            io.kind() == io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

fn split_response(frame: Value) -> Result<(u32, Option<String>, Value), RpcError> {
    let Value::Array(items) = frame else {
        return Err(RpcError::Protocol("response frame is not an array".into()));
    };
    let [kind, msgid, error, result]: [Value; 4] = items
        .try_into()
        .map_err(|v: Vec<Value>| RpcError::Protocol(format!("response frame has {} items", v.len())))?;

    if kind.as_u64() != Some(u64::from(RESPONSE)) {
        return Err(RpcError::Protocol(format!("unexpected message type {kind}")));
    }
    let msgid = msgid
        .as_u64()
        .and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| RpcError::Protocol(format!("invalid message id {msgid}")))?;

    let error = match error {
        Value::Nil => None,
        Value::String(s) => s.into_str().filter(|s| !s.is_empty()),
        Value::Binary(b) => Some(String::from_utf8_lossy(&b).into_owned()).filter(|s| !s.is_empty()),
        other => Some(other.to_string()),
    };

    Ok((msgid, error, result))
}

#[cfg(test)]
mod tests {
    use ibex_model::{ReportRequest, ReportResponse, TaskAction};
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn request_frame_layout() {
        let (client, server) = duplex(1024);
        let mut client = MsgpackConn::new(client);
        let mut server = MsgpackConn::new(server);

        let req = ReportRequest {
            ident: "host-a".into(),
            report_tasks: vec![],
        };
        client.write_frame(&(REQUEST, 7u32, "Server.Report", [&req])).await.unwrap();

        let frame = server.read_frame().await.unwrap();
        let items = frame.as_array().unwrap();
        assert_eq!(items[0].as_u64(), Some(0));
        assert_eq!(items[1].as_u64(), Some(7));
        assert_eq!(items[2].as_str(), Some("Server.Report"));

        let params = items[3].as_array().unwrap();
        let map = params[0].as_map().unwrap();
        assert!(map.iter().any(|(k, v)| k.as_str() == Some("Ident") && v.as_str() == Some("host-a")));
    }

    #[tokio::test]
    async fn call_round_trip_through_stub() {
        let (client, server) = duplex(64);
        let mut client = MsgpackConn::new(client);
        let mut server = MsgpackConn::new(server);

        let stub = tokio::spawn(async move {
            let frame = server.read_frame().await.unwrap();
            let msgid = frame.as_array().unwrap()[1].as_u64().unwrap() as u32;
            let resp = ReportResponse {
                message: String::new(),
                assign_tasks: vec![ibex_model::AssignTask::new(1, 100, TaskAction::Start)],
            };
            server
                .write_frame(&(RESPONSE, msgid, Option::<String>::None, resp))
                .await
                .unwrap();
        });

        let resp: ReportResponse = client
            .call("Server.Report", &ReportRequest::default())
            .await
            .unwrap();
        assert_eq!(resp.assign_tasks.len(), 1);
        assert_eq!(resp.assign_tasks[0].clock, 100);
        stub.await.unwrap();
    }

    #[tokio::test]
    async fn remote_error_is_surfaced() {
        let (client, server) = duplex(256);
        let mut client = MsgpackConn::new(client);
        let mut server = MsgpackConn::new(server);

        tokio::spawn(async move {
            let _ = server.read_frame().await.unwrap();
            server
                .write_frame(&(RESPONSE, 0u32, "rpc: can't find method", ()))
                .await
                .unwrap();
        });

        let err = client.call::<_, String>("Server.Nope", "").await.unwrap_err();
        assert!(matches!(err, RpcError::Remote(m) if m.contains("can't find method")));
    }

    #[tokio::test]
    async fn closed_stream_is_io_error() {
        let (client, server) = duplex(64);
        drop(server);
        let mut client = MsgpackConn::new(client);
        assert!(matches!(client.read_frame().await, Err(RpcError::Io(_))));
    }
}

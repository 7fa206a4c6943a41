//! Host side of the local channel.
//!
//! Serves a [`Dispatch`] target to one connected guest. Requests on a
//! connection are applied strictly in arrival order.

use super::protocol::{read_frame, write_frame, IpcRequest, IpcResponse};
use crate::error::{RaveError, Result};
use crate::store::{Dispatch, Operation};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

/// Serves store operations to guests.
pub struct Host {
    target: Arc<dyn Dispatch>,
}

impl Host {
    pub fn new(target: Arc<dyn Dispatch>) -> Self {
        Self { target }
    }

    /// Answer requests on `stream` until the guest disconnects or `shutdown` turns true.
    pub async fn serve<S>(&self, stream: S, shutdown: &mut watch::Receiver<bool>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);

        loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result? {
                        Some(f) => f,
                        None => return Ok(()), // Clean disconnect
                    }
                }
                _ = stopped(shutdown) => {
                    return Ok(()); // Server shutting down
                }
            };

            let request_str = String::from_utf8(frame).map_err(|_| RaveError::Validation {
                field: "ipc_payload".to_string(),
                message: "Invalid UTF-8 in IPC frame".to_string(),
            })?;

            let response = self.process_request(&request_str).await;

            let response_bytes = serde_json::to_vec(&response)?;
            write_frame(&mut writer, &response_bytes).await?;
        }
    }

    async fn process_request(&self, request_str: &str) -> IpcResponse {
        let request: IpcRequest = match serde_json::from_str(request_str) {
            Ok(req) => req,
            Err(e) => {
                return IpcResponse::error(None, -32700, format!("Parse error: {}", e));
            }
        };

        if request.jsonrpc != "2.0" {
            return IpcResponse::error(
                request.id,
                -32600,
                "Invalid Request: expected jsonrpc 2.0".to_string(),
            );
        }

        let params = request
            .params
            .unwrap_or(serde_json::Value::Object(Default::default()));

        let op = match Operation::from_call(&request.method, params) {
            Ok(op) => op,
            Err(e) => return IpcResponse::error(request.id, e.to_rpc_error_code(), e.to_string()),
        };

        let outcome = self
            .target
            .dispatch(op)
            .await
            .and_then(|reply| serde_json::to_value(reply).map_err(RaveError::from));

        match outcome {
            Ok(result) => IpcResponse::success(request.id, result),
            Err(e) => IpcResponse::error(request.id, e.to_rpc_error_code(), e.to_string()),
        }
    }
}

/// Resolves once `shutdown` is true or its sender is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Reply;
    use tokio::io::DuplexStream;

    struct EchoDispatch;

    #[async_trait::async_trait]
    impl Dispatch for EchoDispatch {
        async fn dispatch(&self, op: Operation) -> Result<Reply> {
            match op {
                Operation::Get { key } => Ok(Reply::Value(Some(key))),
                Operation::Del { .. } => Err(RaveError::NotOpen),
                _ => Err(RaveError::Other("test failure".to_string())),
            }
        }
    }

    fn start() -> (DuplexStream, watch::Sender<bool>, tokio::task::JoinHandle<Result<()>>) {
        let (client, server) = tokio::io::duplex(4096);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let host = Host::new(Arc::new(EchoDispatch));
        let task = tokio::spawn(async move { host.serve(server, &mut stop_rx).await });
        (client, stop_tx, task)
    }

    async fn roundtrip(client: &mut DuplexStream, payload: &[u8]) -> IpcResponse {
        write_frame(client, payload).await.unwrap();
        let bytes = read_frame(client).await.unwrap().unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_serves_operation() {
        let (mut client, _stop, _task) = start();

        let req = IpcRequest::from_operation(Operation::Get { key: "ab".into() }, 1).unwrap();
        let resp = roundtrip(&mut client, &serde_json::to_vec(&req).unwrap()).await;

        assert_eq!(resp.call_id(), Some(1));
        assert_eq!(resp.into_reply().unwrap().into_value().unwrap(), Some(b"ab".to_vec()));
    }

    #[tokio::test]
    async fn test_dispatch_error_keeps_code() {
        let (mut client, _stop, _task) = start();

        let req = IpcRequest::from_operation(Operation::Del { key: "a".into() }, 2).unwrap();
        let resp = roundtrip(&mut client, &serde_json::to_vec(&req).unwrap()).await;

        assert_eq!(resp.error.as_ref().unwrap().code, -32011);
        assert!(matches!(resp.into_reply(), Err(RaveError::NotOpen)));
    }

    #[tokio::test]
    async fn test_invalid_json_returns_parse_error() {
        let (mut client, _stop, _task) = start();

        let resp = roundtrip(&mut client, b"not valid json").await;
        assert_eq!(resp.error.unwrap().code, -32700);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (mut client, _stop, _task) = start();

        let req = IpcRequest::new("compact", serde_json::json!({}), 3);
        let resp = roundtrip(&mut client, &serde_json::to_vec(&req).unwrap()).await;
        assert_eq!(resp.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn test_wrong_version_rejected() {
        let (mut client, _stop, _task) = start();

        let mut req = IpcRequest::new("get", serde_json::json!({ "key": "61" }), 4);
        req.jsonrpc = "1.0".to_string();
        let resp = roundtrip(&mut client, &serde_json::to_vec(&req).unwrap()).await;
        assert_eq!(resp.error.unwrap().code, -32600);
    }

    #[tokio::test]
    async fn test_shutdown_ends_serve() {
        let (_client, stop, task) = start();
        stop.send_replace(true);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_ends_serve() {
        let (client, _stop, task) = start();
        drop(client);
        task.await.unwrap().unwrap();
    }
}

//! Host side of the boundary: reads requests, dispatches them through the registry,
//! and writes exactly one response per request.

use std::sync::Arc;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{
    self, ErrorKind, Frame, FrameCodec, Message, RemoteError, Request, Response, MAX_FRAME_LEN,
};
use crate::registry::CapabilityRegistry;

/// Serve `registry` until the peer closes its end.
///
/// Each request is dispatched on its own task, so a slow handler never holds up
/// the others and responses go out in completion order. Requests already in flight
/// when input ends are still answered before this returns.
pub async fn serve<R, W>(
    registry: Arc<CapabilityRegistry>,
    reader: R,
    writer: W,
) -> BridgeResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut frames = FramedRead::new(reader, FrameCodec::new());
    let mut sink = FramedWrite::new(writer, FrameCodec::new());
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Response>();
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(Frame::Oversized)) => {
                    log::warn!("Dropping request frame over {} bytes", MAX_FRAME_LEN);
                }
                Some(Ok(Frame::Line(line))) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match parse_request(&line) {
                        Ok(request) => {
                            let registry = registry.clone();
                            let done_tx = done_tx.clone();
                            in_flight.spawn(async move {
                                let _ = done_tx.send(answer(&registry, request).await);
                            });
                        }
                        Err(Some(response)) => write_response(&mut sink, response).await?,
                        Err(None) => {}
                    }
                }
                Some(Err(e)) => {
                    log::warn!("Host input failed: {}", e);
                    break;
                }
                None => break,
            },
            Some(response) = done_rx.recv() => write_response(&mut sink, response).await?,
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    log::error!("Request task failed: {}", e);
                }
            }
        }
    }

    drop(done_tx);
    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            log::error!("Request task failed: {}", e);
        }
    }
    while let Some(response) = done_rx.recv().await {
        write_response(&mut sink, response).await?;
    }
    SinkExt::<String>::close(&mut sink)
        .await
        .map_err(|e| BridgeError::Protocol(format!("Failed to close output: {}", e)))?;

    log::info!("Host input closed, serve loop finished");
    Ok(())
}

/// Serve `registry` over this process's stdin/stdout.
pub async fn serve_stdio(registry: Arc<CapabilityRegistry>) -> BridgeResult<()> {
    serve(registry, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Decode a request frame. Malformed frames that still name a correlation id get an
/// immediate error response; anything else is dropped.
fn parse_request(line: &str) -> Result<Request, Option<Response>> {
    match protocol::decode(line) {
        Ok(Message::Request(request)) => Ok(request),
        Ok(Message::Response(response)) => {
            log::warn!(
                "Ignoring response frame #{} sent to host",
                response.correlation_id
            );
            Err(None)
        }
        Err(e) => {
            log::warn!("{}", e);
            Err(protocol::correlation_hint(line).map(|correlation_id| Response {
                correlation_id,
                outcome: Err(RemoteError {
                    kind: ErrorKind::InvalidArguments,
                    message: e.to_string(),
                }),
            }))
        }
    }
}

async fn answer(registry: &CapabilityRegistry, request: Request) -> Response {
    let started = Instant::now();
    let result = registry.dispatch(&request.name, request.args).await;

    match &result {
        Ok(_) => log::info!(
            "#{} {} ok in {:?}",
            request.correlation_id,
            request.name,
            started.elapsed()
        ),
        Err(e) => log::warn!(
            "#{} {} failed in {:?}: {}",
            request.correlation_id,
            request.name,
            started.elapsed(),
            e
        ),
    }

    Response::from_result(request.correlation_id, result)
}

/// Write one response. A result too large for a single frame is replaced by a
/// `HandlerError` for the same call.
async fn write_response<W>(
    sink: &mut FramedWrite<W, FrameCodec>,
    response: Response,
) -> BridgeResult<()>
where
    W: AsyncWrite + Unpin,
{
    let correlation_id = response.correlation_id;
    let mut line = protocol::encode(&Message::Response(response))?;
    if line.len() > MAX_FRAME_LEN {
        log::warn!(
            "#{} response is {} bytes, over the {} byte frame limit",
            correlation_id,
            line.len(),
            MAX_FRAME_LEN
        );
        line = protocol::encode(&Message::Response(Response {
            correlation_id,
            outcome: Err(RemoteError {
                kind: ErrorKind::HandlerError,
                message: format!(
                    "Result of {} bytes exceeds the {} byte frame limit",
                    line.len(),
                    MAX_FRAME_LEN
                ),
            }),
        }))?;
    }
    sink.send(line)
        .await
        .map_err(|e| BridgeError::Protocol(format!("Failed to write response: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::CapabilitySpec;
    use crate::registry::{Capability, HostContext};
    use serde_json::{json, Value};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn registry() -> Arc<CapabilityRegistry> {
        let mut registry = CapabilityRegistry::new(HostContext::default());
        registry
            .register(Capability::sync(CapabilitySpec::no_args("ping"), |_, _| {
                Ok(json!("pong"))
            }))
            .unwrap();
        registry
            .register(Capability::sync(CapabilitySpec::no_args("blob"), |_, _| {
                Ok(json!("b".repeat(MAX_FRAME_LEN)))
            }))
            .unwrap();
        Arc::new(registry)
    }

    async fn exchange(input: &str) -> Vec<Value> {
        let (mut client, host) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host);
        let server = tokio::spawn(serve(registry(), host_read, host_write));

        client.write_all(input.as_bytes()).await.unwrap();
        client.shutdown().await.unwrap();

        let mut out = Vec::new();
        let mut lines = BufReader::new(client).lines();
        while let Some(line) = lines.next_line().await.unwrap() {
            out.push(serde_json::from_str(&line).unwrap());
        }
        server.await.unwrap().unwrap();
        out
    }

    #[tokio::test]
    async fn answers_every_request_before_exit() {
        let input = concat!(
            r#"{"type":"request","correlationId":1,"name":"ping","args":{}}"#, "\n",
            r#"{"type":"request","correlationId":2,"name":"get-nonexistent"}"#, "\n",
        );
        let mut out = exchange(input).await;
        out.sort_by_key(|v| v["correlationId"].as_u64());

        assert_eq!(
            out,
            vec![
                json!({"type": "response", "correlationId": 1, "ok": true, "value": "pong"}),
                json!({
                    "type": "response",
                    "correlationId": 2,
                    "ok": false,
                    "errorKind": "NotFound",
                    "message": "Capability not found: get-nonexistent"
                }),
            ]
        );
    }

    #[tokio::test]
    async fn malformed_request_with_id_gets_an_answer() {
        let input = concat!(
            r#"{"type":"request","correlationId":5,"name":7}"#, "\n",
            "garbage\n",
        );
        let out = exchange(input).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["correlationId"], json!(5));
        assert_eq!(out[0]["errorKind"], json!("InvalidArguments"));
    }

    #[tokio::test]
    async fn oversized_request_is_dropped_and_the_next_one_answered() {
        let oversized = json!({
            "type": "request",
            "correlationId": 1,
            "name": "ping",
            "args": { "pad": "p".repeat(MAX_FRAME_LEN) }
        });
        let input = format!(
            "{}\n{}\n",
            oversized,
            r#"{"type":"request","correlationId":2,"name":"ping"}"#
        );
        let out = exchange(&input).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["correlationId"], json!(2));
        assert_eq!(out[0]["value"], json!("pong"));
    }

    #[tokio::test]
    async fn oversized_result_becomes_a_handler_error() {
        let input = concat!(
            r#"{"type":"request","correlationId":3,"name":"blob"}"#, "\n",
            r#"{"type":"request","correlationId":4,"name":"ping"}"#, "\n",
        );
        let mut out = exchange(input).await;
        out.sort_by_key(|v| v["correlationId"].as_u64());

        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["correlationId"], json!(3));
        assert_eq!(out[0]["ok"], json!(false));
        assert_eq!(out[0]["errorKind"], json!("HandlerError"));
        assert_eq!(out[1]["value"], json!("pong"));
    }
}

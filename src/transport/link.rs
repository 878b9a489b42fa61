//! Pumps a [`ChannelTransport`] over any byte stream pair using line-delimited JSON.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::ChannelTransport;
use crate::error::BridgeError;
use crate::protocol::{self, Frame, FrameCodec, Message, Request, MAX_FRAME_LEN};

/// A live channel: the transport plus the tasks moving its frames.
pub struct Connection {
    transport: Arc<ChannelTransport>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Start reading responses from `reader` and writing requests to `writer`.
///
/// End of stream or an I/O failure on either side tears the channel down. A single
/// frame over [`MAX_FRAME_LEN`] only fails its own call.
pub fn connect<R, W>(reader: R, writer: W) -> Connection
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (transport, outbound) = ChannelTransport::new();
    log::debug!("[channel {}] connected", transport.id());

    let writer = tokio::spawn(write_loop(
        outbound,
        FramedWrite::new(writer, FrameCodec::new()),
        transport.clone(),
    ));
    let reader = tokio::spawn(read_loop(
        FramedRead::new(reader, FrameCodec::new()),
        transport.clone(),
    ));

    Connection {
        transport,
        reader,
        writer,
    }
}

impl Connection {
    pub fn transport(&self) -> Arc<ChannelTransport> {
        self.transport.clone()
    }

    /// Close the channel, flush the writer, and stop reading.
    pub async fn shutdown(self) {
        self.transport.close();
        if let Err(e) = self.writer.await {
            log::warn!("[channel {}] writer task failed: {}", self.transport.id(), e);
        }
        self.reader.abort();
    }
}

async fn write_loop<W>(
    mut outbound: mpsc::UnboundedReceiver<Request>,
    mut sink: FramedWrite<W, FrameCodec>,
    transport: Arc<ChannelTransport>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(request) = outbound.recv().await {
        let correlation_id = request.correlation_id;
        let name = request.name.clone();
        let line = match protocol::encode(&Message::Request(request)) {
            Ok(line) => line,
            Err(e) => {
                log::error!(
                    "[channel {}] failed to encode #{}: {}",
                    transport.id(),
                    correlation_id,
                    e
                );
                transport.reject(correlation_id, e);
                continue;
            }
        };
        if line.len() > MAX_FRAME_LEN {
            log::warn!(
                "[channel {}] '{}' #{} is {} bytes, not sent",
                transport.id(),
                name,
                correlation_id,
                line.len()
            );
            transport.reject(
                correlation_id,
                BridgeError::invalid_arguments(
                    name,
                    format!(
                        "request of {} bytes exceeds the {} byte frame limit",
                        line.len(),
                        MAX_FRAME_LEN
                    ),
                ),
            );
            continue;
        }

        if let Err(e) = sink.send(line).await {
            log::warn!("[channel {}] write failed: {}", transport.id(), e);
            transport.close();
            break;
        }
    }

    // Closing the sink flushes it and shuts down the write half, which the
    // host sees as end of input.
    if let Err(e) = SinkExt::<String>::close(&mut sink).await {
        log::debug!("[channel {}] close failed: {}", transport.id(), e);
    }
}

async fn read_loop<R>(mut frames: FramedRead<R, FrameCodec>, transport: Arc<ChannelTransport>)
where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = frames.next().await {
        let line = match frame {
            Ok(Frame::Line(line)) => line,
            Ok(Frame::Oversized) => {
                log::warn!(
                    "[channel {}] dropping frame over {} bytes",
                    transport.id(),
                    MAX_FRAME_LEN
                );
                continue;
            }
            Err(e) => {
                log::warn!("[channel {}] read failed: {}", transport.id(), e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match protocol::decode(&line) {
            Ok(Message::Response(response)) => {
                transport.deliver(response);
            }
            Ok(Message::Request(request)) => {
                log::warn!(
                    "[channel {}] ignoring request '{}' from host side",
                    transport.id(),
                    request.name
                );
            }
            Err(e) => log::warn!("[channel {}] {}", transport.id(), e),
        }
    }

    transport.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn frames_cross_the_stream() {
        let (client, host) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let (host_read, mut host_write) = tokio::io::split(host);

        let conn = connect(client_read, client_write);
        let call = conn.transport().send("get-platform", json!({}));

        let mut lines = BufReader::new(host_read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let request = match protocol::decode(&line).unwrap() {
            Message::Request(r) => r,
            other => panic!("expected request, got {:?}", other),
        };
        assert_eq!(request.name, "get-platform");

        let reply = json!({
            "type": "response",
            "correlationId": request.correlation_id,
            "ok": true,
            "value": { "platform": "linux" }
        });
        let reply = format!("{}\n", reply);
        host_write.write_all(reply.as_bytes()).await.unwrap();

        assert_eq!(call.await.unwrap(), json!({ "platform": "linux" }));
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn garbage_frames_are_skipped() {
        let (client, host) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let (host_read, mut host_write) = tokio::io::split(host);

        let conn = connect(client_read, client_write);
        let call = conn.transport().send("get-platform", json!({}));

        let mut lines = BufReader::new(host_read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let id = protocol::correlation_hint(&line).unwrap();

        host_write.write_all(b"this is not json\n\n").await.unwrap();
        let reply = format!(
            "{{\"type\":\"response\",\"correlationId\":{},\"ok\":true,\"value\":1}}\n",
            id
        );
        host_write.write_all(reply.as_bytes()).await.unwrap();

        assert_eq!(call.await.unwrap(), json!(1));
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn host_hangup_closes_channel() {
        let (client, host) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);

        let conn = connect(client_read, client_write);
        let transport = conn.transport();
        let call = transport.send("get-platform", json!({}));

        drop(host);

        assert!(matches!(call.await, Err(BridgeError::ChannelClosed)));
        assert!(transport.is_closed());
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn oversized_request_fails_only_its_own_call() {
        let (client, host) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (host_read, mut host_write) = tokio::io::split(host);

        let conn = connect(client_read, client_write);
        let transport = conn.transport();
        let big = transport.send(
            "get-environment-variable",
            json!({ "name": "A".repeat(MAX_FRAME_LEN) }),
        );
        let small = transport.send("get-platform", json!({}));

        match big.await {
            Err(BridgeError::InvalidArguments { capability, .. }) => {
                assert_eq!(capability, "get-environment-variable")
            }
            other => panic!("expected InvalidArguments, got {:?}", other),
        }

        // Only the small request ever reached the host.
        let mut lines = BufReader::new(host_read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let id = protocol::correlation_hint(&line).unwrap();
        assert_eq!(Some(id), small.correlation_id());

        let reply = json!({ "type": "response", "correlationId": id, "ok": true, "value": 1 });
        host_write.write_all(format!("{}\n", reply).as_bytes()).await.unwrap();
        assert_eq!(small.await.unwrap(), json!(1));
        assert!(!transport.is_closed());
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn oversized_inbound_frame_is_skipped() {
        let (client, host) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (host_read, mut host_write) = tokio::io::split(host);

        let conn = connect(client_read, client_write);
        let call = conn.transport().send("get-platform", json!({}));

        let mut lines = BufReader::new(host_read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let id = protocol::correlation_hint(&line).unwrap();

        let writer = tokio::spawn(async move {
            let junk = format!("{}\n", "j".repeat(MAX_FRAME_LEN + 1));
            host_write.write_all(junk.as_bytes()).await.unwrap();
            let reply = json!({ "type": "response", "correlationId": id, "ok": true, "value": 2 });
            host_write.write_all(format!("{}\n", reply).as_bytes()).await.unwrap();
            host_write
        });

        assert_eq!(call.await.unwrap(), json!(2));
        assert!(!conn.transport().is_closed());
        let _host_write = writer.await.unwrap();
        conn.shutdown().await;
    }
}

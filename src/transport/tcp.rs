//! JSON-lines ingress over TCP.
//!
//! Each line is one message. The connection receives `ACK <n>` when the
//! processor commits the n-th line and `NACK <n>` when it is rejected or
//! cannot be decoded. Line numbers start at 1 per connection.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Acknowledge, Delivery};
use crate::errors::TransportError;

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

async fn write_reply(writer: &SharedWriter, verb: &str, seq: u64) -> Result<(), TransportError> {
    let mut w = writer.lock().await;
    w.write_all(format!("{} {}\n", verb, seq).as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

/// Acknowledges a line by writing back to the originating connection.
struct TcpAck {
    writer: SharedWriter,
    seq: u64,
}

#[async_trait]
impl Acknowledge for TcpAck {
    async fn commit(&self) -> Result<(), TransportError> {
        write_reply(&self.writer, "ACK", self.seq).await
    }

    async fn reject(&self) -> Result<(), TransportError> {
        write_reply(&self.writer, "NACK", self.seq).await
    }
}

/// Accept connections until `cancel` fires, forwarding decoded lines into `tx`.
pub async fn serve_ingress<M>(
    listener: TcpListener,
    tx: mpsc::Sender<Delivery<M>>,
    cancel: CancellationToken,
) -> Result<(), TransportError>
where
    M: DeserializeOwned + Send + 'static,
{
    let local = listener.local_addr()?;
    info!(addr = %local, "ingress listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(addr = %local, "ingress stopped");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                debug!(%peer, "ingress connection opened");
                let tx = tx.clone();
                let cancel = cancel.child_token();
                tokio::spawn(async move {
                    let (read, write) = stream.into_split();
                    let writer: SharedWriter = Arc::new(Mutex::new(write));
                    if let Err(e) = read_lines::<M, _>(read, writer, tx, cancel).await {
                        warn!(%peer, error = %e, "ingress connection failed");
                    }
                    debug!(%peer, "ingress connection closed");
                });
            }
        }
    }
}

async fn read_lines<M, R>(
    read: R,
    writer: SharedWriter,
    tx: mpsc::Sender<Delivery<M>>,
    cancel: CancellationToken,
) -> Result<(), TransportError>
where
    M: DeserializeOwned + Send + 'static,
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(read).lines();
    let mut seq = 0u64;

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }
        seq += 1;

        match serde_json::from_str::<M>(&line) {
            Ok(payload) => {
                let ack = TcpAck {
                    writer: Arc::clone(&writer),
                    seq,
                };
                if tx.send(Delivery::new(payload, ack)).await.is_err() {
                    write_reply(&writer, "NACK", seq).await?;
                    return Err(TransportError::Ack("processor input closed".into()));
                }
            }
            Err(e) => {
                warn!(seq, error = %e, "malformed ingress line");
                write_reply(&writer, "NACK", seq).await?;
            }
        }
    }
}

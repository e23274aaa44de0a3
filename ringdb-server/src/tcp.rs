//! TCP ingestion server
//!
//! Every connection gets its own ingestion session. Rejected frames are
//! answered on the same connection, which stays open.

use bytes::BytesMut;
use ringdb_core::ingest::IngestionSession;
use ringdb_core::storage::Storage;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const READ_BUFFER: usize = 64 * 1024;

/// Accept connections until `cancel` fires
pub async fn serve(listener: TcpListener, storage: Arc<Storage>, cancel: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        info!("TCP ingestion listening on {}", addr);
    }

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!("Accepted ingestion connection from {}", addr);
                        let storage = storage.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, storage, cancel).await {
                                warn!("Connection error from {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                }
            }
            _ = cancel.cancelled() => {
                info!("TCP ingestion shutting down");
                break;
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    storage: Arc<Storage>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut session = IngestionSession::new(storage);
    let mut buf = BytesMut::with_capacity(READ_BUFFER);

    loop {
        buf.clear();
        let n = tokio::select! {
            n = stream.read_buf(&mut buf) => n?,
            _ = cancel.cancelled() => break,
        };
        if n == 0 {
            break;
        }

        // storage writes touch the disk
        let data = buf.split().freeze();
        let (returned, reply) = tokio::task::spawn_blocking(move || {
            let reply = session.handle(&data);
            (session, reply)
        })
        .await?;
        session = returned;

        if !reply.is_empty() {
            stream.write_all(&reply).await?;
        }
    }

    if session.in_frame() {
        debug!("{} disconnected inside a frame, partial frame dropped", addr);
    }
    let (accepted, rejected) = session.counters();
    debug!(
        "Connection {} closed: {} samples accepted, {} frames rejected",
        addr, accepted, rejected
    );
    Ok(())
}

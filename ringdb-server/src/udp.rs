//! UDP ingestion server
//!
//! Each datagram is parsed on its own; there is no reply channel, so bad
//! frames are logged and dropped.

use ringdb_core::ingest::IngestionSession;
use ringdb_core::storage::Storage;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const MAX_DATAGRAM: usize = 64 * 1024;

/// Receive datagrams until `cancel` fires
pub async fn serve(socket: UdpSocket, storage: Arc<Storage>, cancel: CancellationToken) {
    if let Ok(addr) = socket.local_addr() {
        info!("UDP ingestion listening on {}", addr);
    }

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, peer) = tokio::select! {
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    error!("UDP receive failed: {}", e);
                    continue;
                }
            },
            _ = cancel.cancelled() => {
                info!("UDP ingestion shutting down");
                break;
            }
        };

        let mut datagram = buf[..n].to_vec();
        // the last line of a datagram may omit its terminator
        if datagram.last() != Some(&b'\n') {
            datagram.extend_from_slice(b"\r\n");
        }

        let storage = storage.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut session = IngestionSession::new(storage);
            // nobody to send the reply to
            let _ = session.handle(&datagram);
            (session.counters(), session.in_frame())
        })
        .await;

        match result {
            Ok(((accepted, rejected), partial)) => {
                if rejected > 0 || partial {
                    debug!(
                        "Datagram from {}: {} samples accepted, {} frames rejected{}",
                        peer,
                        accepted,
                        rejected,
                        if partial { ", trailing partial frame dropped" } else { "" }
                    );
                }
            }
            Err(e) => error!("Ingestion task failed: {}", e),
        }
    }
}

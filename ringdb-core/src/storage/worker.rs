//! Background commit worker

use super::Storage;
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

/// Thread committing pending samples on a timer or when nudged
pub(crate) struct CommitWorker {
    shutdown: Sender<()>,
    nudge: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl CommitWorker {
    pub(crate) fn spawn(storage: Weak<Storage>, interval: Duration) -> std::io::Result<Self> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let (nudge_tx, nudge_rx) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("ringdb-commit".into())
            .spawn(move || run(storage, interval, shutdown_rx, nudge_rx))?;

        Ok(Self {
            shutdown: shutdown_tx,
            nudge: nudge_tx,
            handle: Some(handle),
        })
    }

    /// Ask for an early commit; a nudge already queued is enough
    pub(crate) fn nudge(&self) {
        let _ = self.nudge.try_send(());
    }

    pub(crate) fn stop(&mut self) {
        let _ = self.shutdown.try_send(());
        if let Some(handle) = self.handle.take() {
            // the last storage handle may be released on the worker itself
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("Commit worker panicked");
            }
        }
    }
}

fn run(storage: Weak<Storage>, interval: Duration, shutdown: Receiver<()>, nudge: Receiver<()>) {
    let ticker = tick(interval);
    loop {
        select! {
            recv(shutdown) -> _ => break,
            recv(ticker) -> _ => {},
            recv(nudge) -> _ => {},
        }

        let Some(storage) = storage.upgrade() else {
            break;
        };
        match storage.commit() {
            Ok(0) => {}
            Ok(n) => debug!("Background commit of {} samples", n),
            Err(e) => error!("Background commit failed: {}", e),
        }
    }
    debug!("Commit worker stopped");
}

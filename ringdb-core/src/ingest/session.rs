//! Per-connection ingestion session

use super::parser::{Frame, ProtocolParser, SeriesRef};
use crate::storage::Storage;
use crate::{Result, RingError, Sample, Value};
use bytes::{BufMut, BytesMut};
use std::sync::Arc;
use tracing::warn;

/// Turns a byte stream into storage writes and error replies
pub struct IngestionSession {
    parser: ProtocolParser,
    storage: Arc<Storage>,
    accepted: u64,
    rejected: u64,
}

impl IngestionSession {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            parser: ProtocolParser::new(),
            storage,
            accepted: 0,
            rejected: 0,
        }
    }

    /// Feed received bytes; returns the reply lines to send back
    /// (empty when everything was accepted or is still incomplete)
    pub fn handle(&mut self, data: &[u8]) -> BytesMut {
        let mut reply = BytesMut::new();
        for result in self.parser.feed(data) {
            let outcome = result
                .map_err(RingError::from)
                .and_then(|frame| self.apply(frame));
            match outcome {
                Ok(n) => self.accepted += n as u64,
                Err(e) => {
                    self.rejected += 1;
                    warn!("Rejected frame: {}", e);
                    reply.put_slice(e.wire_message().as_bytes());
                    reply.put_slice(b"\r\n");
                }
            }
        }
        reply
    }

    /// True while a partially received frame is buffered
    pub fn in_frame(&self) -> bool {
        self.parser.in_frame()
    }

    /// Samples accepted and frames rejected so far
    pub fn counters(&self) -> (u64, u64) {
        (self.accepted, self.rejected)
    }

    fn apply(&self, frame: Frame) -> Result<usize> {
        let samples = match frame {
            Frame::Sample {
                series,
                timestamp,
                value,
            } => {
                let id = match series {
                    SeriesRef::Id(id) => match self.storage.index().key(id) {
                        Some(key) if !key.is_event() => id,
                        _ => return Err(RingError::Protocol("unknown series id".into())),
                    },
                    SeriesRef::Name(key) => self.storage.series_id(&key)?,
                };
                vec![Sample::new(id, timestamp, value)]
            }
            Frame::Bulk {
                series,
                timestamp,
                values,
            } => {
                let mut samples = Vec::with_capacity(series.len());
                for (key, value) in series.iter().zip(values) {
                    samples.push(Sample::new(self.storage.series_id(key)?, timestamp, value));
                }
                samples
            }
            Frame::Event {
                series,
                timestamp,
                payload,
            } => {
                let id = self.storage.series_id(&series)?;
                vec![Sample::new(id, timestamp, Value::Event(payload))]
            }
        };

        self.storage.write(&samples)?;
        Ok(samples.len())
    }
}

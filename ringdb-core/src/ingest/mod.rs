//! Ingestion protocol: framing state machine and per-connection sessions

mod parser;
mod session;

pub use parser::{Frame, ProtocolError, ProtocolParser, SeriesRef, MAX_LINE};
pub use session::IngestionSession;

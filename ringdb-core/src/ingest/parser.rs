//! Line-oriented ingestion framing
//!
//! Record kinds (every line ends with CRLF or LF):
//! - sample: `+<series>`, `+<timestamp>`, `+<value>`
//! - bulk:   `+<m1|m2|..> <tags>`, `+<timestamp>`, `*<N>`, N value lines
//! - event:  `+!<name> <tags>`, `+<timestamp>`, `+<payload>`
//!
//! `:N` is accepted for a series id, a nanosecond timestamp and an integer
//! value.

use crate::time::parse_timestamp;
use crate::{SeriesId, SeriesKey, Timestamp};
use bytes::BytesMut;
use thiserror::Error;

/// Longest accepted line, terminator excluded
pub const MAX_LINE: usize = 64 * 1024;

/// A rejected frame; the string is the reason sent after `-PARSER`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ProtocolError(pub String);

impl ProtocolError {
    fn new(reason: impl Into<String>) -> Self {
        ProtocolError(reason.into())
    }
}

impl From<ProtocolError> for crate::RingError {
    fn from(e: ProtocolError) -> Self {
        crate::RingError::Protocol(e.0)
    }
}

/// Series named on a sample line
#[derive(Debug, Clone, PartialEq)]
pub enum SeriesRef {
    Name(SeriesKey),
    Id(SeriesId),
}

/// A complete, syntactically valid record
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Sample {
        series: SeriesRef,
        timestamp: Timestamp,
        value: f64,
    },
    Bulk {
        series: Vec<SeriesKey>,
        timestamp: Timestamp,
        values: Vec<f64>,
    },
    Event {
        series: SeriesKey,
        timestamp: Timestamp,
        payload: String,
    },
}

#[derive(Debug)]
enum Header {
    Single(SeriesRef),
    Bulk(Vec<SeriesKey>),
    Event(SeriesKey),
}

#[derive(Debug)]
enum State {
    AwaitSeries,
    AwaitTimestamp(Header),
    AwaitValue(Header, Timestamp),
    AwaitValues {
        series: Vec<SeriesKey>,
        timestamp: Timestamp,
        values: Vec<f64>,
    },
}

/// Incremental parser for one connection or datagram
pub struct ProtocolParser {
    buf: BytesMut,
    state: State,
    discarding: bool,
}

impl ProtocolParser {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            state: State::AwaitSeries,
            discarding: false,
        }
    }

    /// True while a frame has been started but not finished
    pub fn in_frame(&self) -> bool {
        !matches!(self.state, State::AwaitSeries) || !self.buf.is_empty()
    }

    /// Consume bytes, returning every frame or error they complete.
    /// Incomplete input is buffered until more bytes arrive.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Result<Frame, ProtocolError>> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();

        loop {
            let Some(pos) = self.buf.iter().position(|b| *b == b'\n') else {
                if self.buf.len() > MAX_LINE {
                    self.buf.clear();
                    if !self.discarding {
                        self.discarding = true;
                        self.state = State::AwaitSeries;
                        out.push(Err(ProtocolError::new("line too long")));
                    }
                }
                break;
            };

            let raw = self.buf.split_to(pos + 1);
            if self.discarding {
                self.discarding = false;
                continue;
            }

            let mut line = &raw[..pos];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            if line.len() > MAX_LINE {
                self.state = State::AwaitSeries;
                out.push(Err(ProtocolError::new("line too long")));
                continue;
            }

            let result = match std::str::from_utf8(line) {
                Ok(text) => self.step(text),
                Err(_) => Err(ProtocolError::new("invalid utf-8")),
            };
            match result {
                Ok(Some(frame)) => out.push(Ok(frame)),
                Ok(None) => {}
                Err(e) => {
                    self.state = State::AwaitSeries;
                    out.push(Err(e));
                }
            }
        }

        out
    }

    fn step(&mut self, line: &str) -> Result<Option<Frame>, ProtocolError> {
        let state = std::mem::replace(&mut self.state, State::AwaitSeries);
        match state {
            State::AwaitSeries => {
                if line.trim().is_empty() {
                    return Ok(None);
                }
                self.state = State::AwaitTimestamp(parse_series(line)?);
                Ok(None)
            }
            State::AwaitTimestamp(header) => {
                let ts = parse_timestamp_line(line)?;
                self.state = State::AwaitValue(header, ts);
                Ok(None)
            }
            State::AwaitValue(header, timestamp) => match header {
                Header::Event(series) => {
                    let payload = line
                        .strip_prefix('+')
                        .ok_or_else(|| ProtocolError::new("bad event payload"))?;
                    Ok(Some(Frame::Event {
                        series,
                        timestamp,
                        payload: payload.to_string(),
                    }))
                }
                Header::Bulk(series) => {
                    self.start_bulk(series, timestamp, line)?;
                    Ok(None)
                }
                Header::Single(SeriesRef::Name(key)) if line.starts_with('*') => {
                    self.start_bulk(vec![key], timestamp, line)?;
                    Ok(None)
                }
                Header::Single(series) => Ok(Some(Frame::Sample {
                    series,
                    timestamp,
                    value: parse_value(line)?,
                })),
            },
            State::AwaitValues {
                series,
                timestamp,
                mut values,
            } => {
                values.push(parse_value(line)?);
                if values.len() == series.len() {
                    Ok(Some(Frame::Bulk {
                        series,
                        timestamp,
                        values,
                    }))
                } else {
                    self.state = State::AwaitValues {
                        series,
                        timestamp,
                        values,
                    };
                    Ok(None)
                }
            }
        }
    }

    fn start_bulk(
        &mut self,
        series: Vec<SeriesKey>,
        timestamp: Timestamp,
        line: &str,
    ) -> Result<(), ProtocolError> {
        let count: usize = line
            .strip_prefix('*')
            .and_then(|n| n.trim().parse().ok())
            .ok_or_else(|| ProtocolError::new("bad count"))?;
        if count != series.len() {
            return Err(ProtocolError::new("count does not match metrics"));
        }
        self.state = State::AwaitValues {
            series,
            timestamp,
            values: Vec::with_capacity(count),
        };
        Ok(())
    }
}

impl Default for ProtocolParser {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_series(line: &str) -> Result<Header, ProtocolError> {
    if let Some(id) = line.strip_prefix(':') {
        return id
            .trim()
            .parse()
            .map(|id| Header::Single(SeriesRef::Id(id)))
            .map_err(|_| ProtocolError::new("bad series id"));
    }

    let name = line
        .strip_prefix('+')
        .ok_or_else(|| ProtocolError::new("bad series"))?;
    let key = SeriesKey::parse(name).map_err(|e| match e {
        crate::RingError::InvalidFormat(reason) => ProtocolError(reason),
        other => ProtocolError(other.to_string()),
    })?;

    if !key.metric.contains('|') {
        return Ok(if key.is_event() {
            Header::Event(key)
        } else {
            Header::Single(SeriesRef::Name(key))
        });
    }

    let mut series = Vec::new();
    for metric in key.metric.split('|') {
        if metric.is_empty() || metric.starts_with('!') {
            return Err(ProtocolError::new("bad metric list"));
        }
        series.push(SeriesKey {
            metric: metric.to_string(),
            tags: key.tags.clone(),
        });
    }
    Ok(Header::Bulk(series))
}

fn parse_timestamp_line(line: &str) -> Result<Timestamp, ProtocolError> {
    let bad = || ProtocolError::new("bad timestamp");
    if let Some(n) = line.strip_prefix(':') {
        return n.trim().parse().map_err(|_| bad());
    }
    let text = line.strip_prefix('+').ok_or_else(bad)?.trim();
    if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) {
        return text.parse().map_err(|_| bad());
    }
    parse_timestamp(text).map_err(|_| bad())
}

fn parse_value(line: &str) -> Result<f64, ProtocolError> {
    let bad = || ProtocolError::new("bad value");
    if let Some(n) = line.strip_prefix(':') {
        return n.trim().parse::<i64>().map(|v| v as f64).map_err(|_| bad());
    }
    let value: f64 = line
        .strip_prefix('+')
        .ok_or_else(bad)?
        .trim()
        .parse()
        .map_err(|_| bad())?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(bad())
    }
}

//! Aggregate function implementations

use crate::{AggregateFunction, Direction, Timestamp};

/// Accumulator for computing aggregates incrementally
pub trait Accumulator: Send {
    /// Add a sample to the accumulator
    fn add(&mut self, timestamp: Timestamp, value: f64);

    /// Get the current result; `None` until something was added
    fn result(&self) -> Option<f64>;

    /// Reset the accumulator
    fn reset(&mut self);
}

/// Fresh accumulator for `func`, fed in `direction` scan order
pub fn accumulator(func: AggregateFunction, direction: Direction) -> Box<dyn Accumulator> {
    use AggregateFunction::*;
    match func {
        Count | Sum | Mean => Box::new(Totals {
            func,
            count: 0,
            sum: 0.0,
        }),
        Min | Max => Box::new(Extreme {
            largest: func == Max,
            best: None,
        }),
        First | Last => Box::new(Edge {
            latest: func == Last,
            forward: direction == Direction::Forward,
            held: None,
        }),
    }
}

/// Count, sum and mean share one running total
#[derive(Debug)]
struct Totals {
    func: AggregateFunction,
    count: u64,
    sum: f64,
}

impl Accumulator for Totals {
    fn add(&mut self, _timestamp: Timestamp, value: f64) {
        self.count += 1;
        self.sum += value;
    }

    fn result(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        Some(match self.func {
            AggregateFunction::Count => self.count as f64,
            AggregateFunction::Mean => self.sum / self.count as f64,
            _ => self.sum,
        })
    }

    fn reset(&mut self) {
        self.count = 0;
        self.sum = 0.0;
    }
}

/// Smallest or largest value
#[derive(Debug)]
struct Extreme {
    largest: bool,
    best: Option<f64>,
}

impl Accumulator for Extreme {
    fn add(&mut self, _timestamp: Timestamp, value: f64) {
        let replace = match self.best {
            None => true,
            Some(best) if self.largest => value > best,
            Some(best) => value < best,
        };
        if replace {
            self.best = Some(value);
        }
    }

    fn result(&self) -> Option<f64> {
        self.best
    }

    fn reset(&mut self) {
        self.best = None;
    }
}

/// Value at the earliest or latest timestamp, whatever the scan direction.
///
/// On equal timestamps the later write wins for `latest` and the earlier
/// one for `earliest`. A backward scan delivers ties newest first, so the
/// tie break flips with the direction.
#[derive(Debug)]
struct Edge {
    latest: bool,
    forward: bool,
    held: Option<(Timestamp, f64)>,
}

impl Accumulator for Edge {
    fn add(&mut self, timestamp: Timestamp, value: f64) {
        let replace = match self.held {
            None => true,
            Some((ts, _)) if self.latest => timestamp > ts || (timestamp == ts && self.forward),
            Some((ts, _)) => timestamp < ts || (timestamp == ts && !self.forward),
        };
        if replace {
            self.held = Some((timestamp, value));
        }
    }

    fn result(&self) -> Option<f64> {
        self.held.map(|(_, v)| v)
    }

    fn reset(&mut self) {
        self.held = None;
    }
}

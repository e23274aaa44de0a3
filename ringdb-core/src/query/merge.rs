//! K-way merge of per-series cursors
//!
//! Inputs are merged by timestamp in scan direction. Equal timestamps come
//! out in input order, so callers list inputs in the tie order they want.

use crate::column::Cursor;
use crate::{Direction, Timestamp, Value};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

struct Head {
    key: i128,
    input: usize,
    timestamp: Timestamp,
    value: Value,
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.key, self.input).cmp(&(other.key, other.input))
    }
}

/// Iterator of `(input index, timestamp, value)`
pub struct Merge {
    inputs: Vec<Option<Cursor>>,
    heap: BinaryHeap<Reverse<Head>>,
    backward: bool,
}

impl Merge {
    /// Inputs that are `None` (series without samples) are skipped
    pub fn new(inputs: Vec<Option<Cursor>>, direction: Direction) -> Self {
        let mut merge = Self {
            heap: BinaryHeap::with_capacity(inputs.len()),
            inputs,
            backward: direction == Direction::Backward,
        };
        for input in 0..merge.inputs.len() {
            merge.advance(input);
        }
        merge
    }

    fn advance(&mut self, input: usize) {
        let next = self.inputs[input].as_mut().and_then(|c| c.next());
        match next {
            Some((timestamp, value)) => {
                let key = if self.backward {
                    -(timestamp as i128)
                } else {
                    timestamp as i128
                };
                self.heap.push(Reverse(Head {
                    key,
                    input,
                    timestamp,
                    value,
                }));
            }
            None => self.inputs[input] = None,
        }
    }
}

impl Iterator for Merge {
    type Item = (usize, Timestamp, Value);

    fn next(&mut self) -> Option<Self::Item> {
        let Reverse(head) = self.heap.pop()?;
        self.advance(head.input);
        Some((head.input, head.timestamp, head.value))
    }
}

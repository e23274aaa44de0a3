//! Bucketing and sampling transforms (PAA, SAX)

use super::{PaaFunc, QueryValue, SampleSpec};
use crate::{Direction, TimeRange, Timestamp};

/// Fixed-width bucket grid anchored at the range start.
///
/// Forward bucket `k` is `[from + k*step, from + (k+1)*step)` stamped with
/// its lower edge. Backward buckets are stamped with their upper edge; the
/// sampling grid uses `[from - (k+1)*step, from - k*step)` and the closed
/// grid `(from - (k+1)*step, from - k*step]`, which keeps `from` itself in
/// bucket 0. Indexes grow in scan direction.
#[derive(Debug, Clone, Copy)]
pub struct Bucketer {
    from: i128,
    to: i128,
    step: i128,
    backward: bool,
    closed: bool,
}

impl Bucketer {
    /// Grid used by sampling transforms
    pub fn new(range: TimeRange, step: i64) -> Self {
        Self {
            from: range.from as i128,
            to: range.to as i128,
            step: step.max(1) as i128,
            backward: range.direction() == Direction::Backward,
            closed: false,
        }
    }

    /// Grid used by group-aggregate: every bucket lies inside the range
    pub fn closed(range: TimeRange, step: i64) -> Self {
        Self {
            closed: true,
            ..Self::new(range, step)
        }
    }

    pub fn index(&self, ts: Timestamp) -> i64 {
        let ts = ts as i128;
        let k = if self.backward && self.closed {
            (self.from - ts).div_euclid(self.step)
        } else if self.backward {
            (self.from - 1 - ts).div_euclid(self.step)
        } else {
            (ts - self.from).div_euclid(self.step)
        };
        clamp(k)
    }

    pub fn stamp(&self, k: i64) -> Timestamp {
        let k = k as i128;
        let stamp = if self.backward {
            self.from - k * self.step
        } else {
            self.from + k * self.step
        };
        clamp(stamp)
    }

    /// Bucket lies entirely inside the query range
    pub fn is_complete(&self, k: i64) -> bool {
        let k = k as i128;
        if self.backward {
            let lo = self.from - (k + 1) * self.step;
            let hi = self.from - k * self.step;
            if self.closed {
                lo >= self.to && hi <= self.from
            } else {
                lo > self.to && hi <= self.from + 1
            }
        } else {
            let lo = self.from + k * self.step;
            let hi = lo + self.step;
            lo >= self.from && hi <= self.to
        }
    }
}

fn clamp(v: i128) -> i64 {
    v.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Reduces each stream's samples bucket by bucket.
///
/// Samples must arrive in scan order (globally, across streams). When the
/// bucket index advances, every stream's pending bucket is flushed in
/// stream order, so output is time-major.
pub struct Sampler {
    spec: SampleSpec,
    bucketer: Bucketer,
    current: Option<i64>,
    buckets: Vec<Vec<(Timestamp, f64)>>,
    windows: Vec<Vec<f64>>,
}

impl Sampler {
    pub fn new(spec: SampleSpec, bucketer: Bucketer, streams: usize) -> Self {
        Self {
            spec,
            bucketer,
            current: None,
            buckets: vec![Vec::new(); streams],
            windows: vec![Vec::new(); streams],
        }
    }

    /// Add a sample; rows for buckets closed by it are appended to `out`
    pub fn push(
        &mut self,
        stream: usize,
        ts: Timestamp,
        value: f64,
        out: &mut Vec<(usize, Timestamp, QueryValue)>,
    ) {
        let k = self.bucketer.index(ts);
        if self.current != Some(k) {
            self.flush(out);
            self.current = Some(k);
        }
        self.buckets[stream].push((ts, value));
    }

    /// Close the last bucket
    pub fn finish(&mut self, out: &mut Vec<(usize, Timestamp, QueryValue)>) {
        self.flush(out);
        self.current = None;
    }

    fn flush(&mut self, out: &mut Vec<(usize, Timestamp, QueryValue)>) {
        let Some(k) = self.current else {
            return;
        };
        let complete = self.bucketer.is_complete(k);
        let stamp = self.bucketer.stamp(k);

        for (stream, bucket) in self.buckets.iter_mut().enumerate() {
            if bucket.is_empty() {
                continue;
            }
            if self.bucketer.backward {
                // reduce in write order so ties resolve as in a forward scan
                bucket.reverse();
            }
            if complete {
                match self.spec {
                    SampleSpec::Paa(func) => {
                        out.push((stream, stamp, QueryValue::Float(reduce(func, bucket))));
                    }
                    SampleSpec::Sax { alphabet, window } => {
                        let mean = reduce(PaaFunc::Mean, bucket);
                        let pending = &mut self.windows[stream];
                        pending.push(mean);
                        if pending.len() == window {
                            let mut word = sax_word(pending, alphabet);
                            if self.bucketer.backward {
                                word = word.chars().rev().collect();
                            }
                            out.push((stream, stamp, QueryValue::String(word)));
                            pending.clear();
                        }
                    }
                }
            }
            bucket.clear();
        }
    }
}

/// Reduce one non-empty bucket
fn reduce(func: PaaFunc, bucket: &[(Timestamp, f64)]) -> f64 {
    match func {
        PaaFunc::Mean => bucket.iter().map(|(_, v)| v).sum::<f64>() / bucket.len() as f64,
        PaaFunc::Median => {
            let mut values: Vec<f64> = bucket.iter().map(|(_, v)| *v).collect();
            values.sort_by(|a, b| a.total_cmp(b));
            values[values.len() / 2]
        }
        PaaFunc::Max => bucket.iter().map(|(_, v)| *v).fold(f64::MIN, f64::max),
        PaaFunc::Min => bucket.iter().map(|(_, v)| *v).fold(f64::MAX, f64::min),
        PaaFunc::First => {
            let mut best = bucket[0];
            for s in bucket {
                if s.0 < best.0 {
                    best = *s;
                }
            }
            best.1
        }
        PaaFunc::Last => {
            let mut best = bucket[0];
            for s in bucket {
                if s.0 >= best.0 {
                    best = *s;
                }
            }
            best.1
        }
    }
}

/// SAX word for `values` over an alphabet of `alphabet` letters.
///
/// Values are z-normalised (sample standard deviation; a flat window is
/// only mean-centred) and each is mapped to the letter of the equiprobable
/// Gaussian region it falls into.
pub fn sax_word(values: &[f64], alphabet: usize) -> String {
    if values.is_empty() {
        return String::new();
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let stddev = if values.len() > 1 {
        (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
    } else {
        0.0
    };

    let breakpoints: Vec<f64> = (1..alphabet.max(1))
        .map(|i| inverse_normal_cdf(i as f64 / alphabet as f64))
        .collect();

    values
        .iter()
        .map(|v| {
            let z = if stddev < 1e-6 {
                v - mean
            } else {
                (v - mean) / stddev
            };
            let region = breakpoints.iter().filter(|b| **b <= z).count();
            (b'a' + region as u8) as char
        })
        .collect()
}

/// Acklam's rational approximation of the standard normal quantile
fn inverse_normal_cdf(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969683028665376e+01,
        2.209460984245205e+02,
        -2.759285104469687e+02,
        1.383577518672690e+02,
        -3.066479806614716e+01,
        2.506628277459239e+00,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e+01,
        1.615858368580409e+02,
        -1.556989798598866e+02,
        6.680131188771972e+01,
        -1.328068155288572e+01,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-03,
        -3.223964580411365e-01,
        -2.400758277161838e+00,
        -2.549671010243281e+00,
        4.374664141464968e+00,
        2.938163982698783e+00,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-03,
        3.224671290700398e-01,
        2.445134137142996e+00,
        3.754408661907416e+00,
    ];
    const P_LOW: f64 = 0.02425;

    let tail = |q: f64| {
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    };

    if p < P_LOW {
        tail((-2.0 * p.ln()).sqrt())
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        -tail((-2.0 * (1.0 - p).ln()).sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_grid() {
        let b = Bucketer::new(TimeRange::new(100, 200), 10);
        assert_eq!(b.index(100), 0);
        assert_eq!(b.index(119), 1);
        assert_eq!(b.stamp(1), 110);
        assert!(b.is_complete(9));
        assert!(!b.is_complete(10));

        // a ragged tail bucket is incomplete
        let b = Bucketer::new(TimeRange::new(100, 195), 10);
        assert!(!b.is_complete(9));
    }

    #[test]
    fn test_backward_grid() {
        let b = Bucketer::new(TimeRange::new(200, 100), 10);
        assert_eq!(b.index(199), 0);
        assert_eq!(b.index(190), 0);
        assert_eq!(b.index(189), 1);
        assert_eq!(b.stamp(0), 200);
        // the range start itself sits one bucket above the grid
        assert_eq!(b.index(200), -1);
        assert!(!b.is_complete(-1));
        assert!(b.is_complete(8));
        // [100, 110) touches the excluded end
        assert!(!b.is_complete(9));
    }

    #[test]
    fn test_closed_backward_grid() {
        let b = Bucketer::closed(TimeRange::new(200, 100), 10);
        assert_eq!(b.index(200), 0);
        assert_eq!(b.index(191), 0);
        assert_eq!(b.index(190), 1);
        assert_eq!(b.stamp(0), 200);
        assert_eq!(b.stamp(1), 190);
        // (100, 110] stays clear of the excluded end
        assert!(b.is_complete(9));
        assert!(!b.is_complete(10));

        // forward is unaffected
        let f = Bucketer::closed(TimeRange::new(100, 200), 10);
        assert_eq!(f.index(100), 0);
        assert_eq!(f.index(119), 1);
    }

    #[test]
    fn test_inverse_normal_cdf() {
        assert!(inverse_normal_cdf(0.5).abs() < 1e-9);
        assert!((inverse_normal_cdf(0.8) - 0.841_621).abs() < 1e-5);
        assert!((inverse_normal_cdf(0.01) + 2.326_348).abs() < 1e-5);
    }

    #[test]
    fn test_sax_word_of_ramp() {
        let ramp: Vec<f64> = (0..10).map(|i| i as f64).collect();
        assert_eq!(sax_word(&ramp, 5), "aabbccddee");
        assert_eq!(sax_word(&ramp, 1), "aaaaaaaaaa");
        assert_eq!(sax_word(&[3.0; 4], 4), "cccc");
    }

    #[test]
    fn test_paa_mean_time_major() {
        let bucketer = Bucketer::new(TimeRange::new(0, 30), 10);
        let mut sampler = Sampler::new(SampleSpec::Paa(PaaFunc::Mean), bucketer, 2);
        let mut out = Vec::new();
        for ts in 0..30 {
            sampler.push((ts % 2) as usize, ts, ts as f64, &mut out);
        }
        sampler.finish(&mut out);

        let rows: Vec<(usize, i64, f64)> = out
            .into_iter()
            .map(|(s, ts, v)| (s, ts, v.as_f64().unwrap()))
            .collect();
        assert_eq!(
            rows,
            vec![
                (0, 0, 4.0),
                (1, 0, 5.0),
                (0, 10, 14.0),
                (1, 10, 15.0),
                (0, 20, 24.0),
                (1, 20, 25.0),
            ]
        );
    }

    #[test]
    fn test_median_and_edges() {
        let bucket = [(3, 5.0), (1, 1.0), (2, 9.0), (4, 2.0)];
        assert_eq!(reduce(PaaFunc::Median, &bucket), 5.0);
        assert_eq!(reduce(PaaFunc::First, &bucket), 1.0);
        assert_eq!(reduce(PaaFunc::Last, &bucket), 2.0);
        assert_eq!(reduce(PaaFunc::Max, &bucket), 9.0);
    }

    #[test]
    fn test_sax_backward_reads_in_time_order() {
        // 1ms buckets, one rising value per bucket, scanned backward
        let bucketer = Bucketer::new(TimeRange::new(100, -1), 1);
        let spec = SampleSpec::Sax {
            alphabet: 5,
            window: 10,
        };
        let mut sampler = Sampler::new(spec, bucketer, 1);
        let mut out = Vec::new();
        for ts in (90..100).rev() {
            sampler.push(0, ts, ts as f64, &mut out);
        }
        sampler.finish(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].2, QueryValue::String("aabbccddee".into()));
        assert_eq!(out[0].1, 91);
    }

    #[test]
    fn test_backward_edges_match_forward_on_ties() {
        let run = |range: TimeRange, samples: &[(Timestamp, f64)]| {
            let mut sampler = Sampler::new(SampleSpec::Paa(PaaFunc::Last), Bucketer::new(range, 100), 1);
            let mut out = Vec::new();
            for (ts, v) in samples {
                sampler.push(0, *ts, *v, &mut out);
            }
            sampler.finish(&mut out);
            out.into_iter().map(|(_, _, v)| v).collect::<Vec<_>>()
        };
        // two writes at ts 50, the second one holding 2.0
        let forward = run(TimeRange::new(0, 100), &[(10, 0.0), (50, 1.0), (50, 2.0)]);
        let backward = run(TimeRange::new(100, -1), &[(50, 2.0), (50, 1.0), (10, 0.0)]);
        assert_eq!(forward, vec![QueryValue::Float(2.0)]);
        assert_eq!(backward, forward);
    }
}

//! Progress reporting for one sync step
//!
//! Connection acquisition covers `[0, 0.1]`, SEARCH `(0.1, 0.25]`, and the
//! fetch phase the rest, split by the relative cost of each fetch.

use crate::config::ProgressWeights;

const CONNECTED: f64 = 0.1;
const SEARCHED: f64 = 0.25;

pub struct ProgressEstimator<'a> {
    weights: ProgressWeights,
    callback: &'a mut dyn FnMut(f64),
    last: f64,
    total_cost: f64,
    done_cost: f64,
}

impl<'a> ProgressEstimator<'a> {
    pub fn new(weights: ProgressWeights, callback: &'a mut dyn FnMut(f64)) -> Self {
        Self {
            weights,
            callback,
            last: 0.0,
            total_cost: 0.0,
            done_cost: 0.0,
        }
    }

    /// Last value handed to the callback
    pub fn value(&self) -> f64 {
        self.last
    }

    pub fn connection_acquired(&mut self) {
        self.report(CONNECTED);
    }

    pub fn search_completed(&mut self) {
        self.report(SEARCHED);
    }

    /// Size the fetch phase for `new` unseen UIDs and `known` flag checks
    pub fn begin_fetch(&mut self, new: usize, known: usize) {
        let w = &self.weights;
        self.total_cost = 2.0 * w.aggregate
            + w.per_known * known as f64
            + (w.per_new_header + w.per_new_body) * new as f64;
        self.done_cost = 0.0;
    }

    /// The batched header fetch for `count` new UIDs came back
    pub fn headers_fetched(&mut self, count: usize) {
        self.advance(self.weights.aggregate + self.weights.per_new_header * count as f64);
    }

    /// The batched flags fetch for `count` known UIDs came back
    pub fn flags_fetched(&mut self, count: usize) {
        self.advance(self.weights.aggregate + self.weights.per_known * count as f64);
    }

    /// One new message has all of its body parts
    pub fn body_done(&mut self) {
        self.advance(self.weights.per_new_body);
    }

    pub fn finish(&mut self) {
        self.report(1.0);
    }

    fn advance(&mut self, cost: f64) {
        self.done_cost += cost;
        if self.total_cost > 0.0 {
            let fraction = (self.done_cost / self.total_cost).min(1.0);
            self.report(SEARCHED + (1.0 - SEARCHED) * fraction);
        }
    }

    fn report(&mut self, value: f64) {
        // Never move backwards
        self.last = value.clamp(0.0, 1.0).max(self.last);
        (self.callback)(self.last);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(f: impl FnOnce(&mut ProgressEstimator<'_>)) -> Vec<f64> {
        let mut seen = Vec::new();
        let mut callback = |v: f64| seen.push(v);
        let mut progress = ProgressEstimator::new(ProgressWeights::default(), &mut callback);
        f(&mut progress);
        seen
    }

    #[test]
    fn test_phases_in_order() {
        let seen = collect(|p| {
            p.connection_acquired();
            p.search_completed();
            p.begin_fetch(2, 10);
            p.headers_fetched(2);
            p.flags_fetched(10);
            p.body_done();
            p.body_done();
            p.finish();
        });
        assert_eq!(seen[0], 0.1);
        assert_eq!(seen[1], 0.25);
        // total = 40 + 10 + 70 = 120; headers = 20 + 10
        assert!((seen[2] - (0.25 + 0.75 * 30.0 / 120.0)).abs() < 1e-9);
        // all fetch cost accounted for
        assert!((seen[5] - 1.0).abs() < 1e-9);
        assert_eq!(*seen.last().unwrap(), 1.0);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_never_decreases() {
        let seen = collect(|p| {
            p.search_completed();
            p.connection_acquired();
        });
        assert_eq!(seen, vec![0.25, 0.25]);
    }

    #[test]
    fn test_empty_fetch_phase() {
        let seen = collect(|p| {
            p.search_completed();
            p.begin_fetch(0, 0);
            p.flags_fetched(0);
            p.finish();
        });
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*seen.last().unwrap(), 1.0);
    }
}

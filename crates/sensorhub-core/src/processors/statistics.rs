//! Rolling trapezoidal mean/variance per quantity.
//!
//! Ported from `original_source/src/processors/statistics.{h,cpp}` — the
//! one processor with a complete original implementation (spec.md §9 names
//! `fusion`/`signalk*`/`tcp_push`/`gpsd` as out-of-scope scaffolds; this one
//! is not among them).

use std::collections::{HashMap, HashSet, VecDeque};

use crate::cache::{StampedQuantity, StampedValue};
use crate::processor::{parse_filter_set, Processor};
use crate::quantity::{value_diff, value_norm, Quantity};
use crate::scale::BaseScale;

/// Fields exposed per quantity by `index`/`modbus_register`.
const FIELDS_PER_QUANTITY: usize = 4;
const F_TIME: usize = 0;
const F_N: usize = 1;
const F_MEAN: usize = 2;
const F_STDDEV: usize = 3;

#[derive(Clone, Copy, Debug)]
struct Statistic {
    time: f64,
    n: usize,
    mean: f64,
    variance: f64,
}

pub struct Statistics {
    period: f64,
    filter: HashSet<Quantity>,
    windows: HashMap<Quantity, VecDeque<StampedValue>>,
    stats: HashMap<Quantity, Statistic>,
}

impl Statistics {
    pub fn new() -> Self {
        Statistics {
            period: 1.0,
            filter: HashSet::new(),
            windows: HashMap::new(),
            stats: HashMap::new(),
        }
    }

    fn field(&self, q: Quantity, field: usize) -> f64 {
        let Some(stat) = self.stats.get(&q) else { return 0.0 };
        match field {
            F_TIME => stat.time,
            F_N => stat.n as f64,
            F_MEAN => stat.mean,
            F_STDDEV => stat.variance.sqrt(),
            _ => 0.0,
        }
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for Statistics {
    fn insert_value(&mut self, value: &StampedQuantity) {
        if !self.filter.is_empty() && !self.filter.contains(&value.quantity) {
            return;
        }
        let q = value.quantity;
        let window = self.windows.entry(q).or_default();

        if window.is_empty() {
            window.push_back(StampedValue { value: value.value, stamp: value.stamp });
            self.stats.insert(q, Statistic { time: value.stamp, n: 1, mean: value.value, variance: 0.0 });
            return;
        }

        let back = *window.back().unwrap();
        let front = *window.front().unwrap();
        let span = back.stamp - front.stamp;
        let interval = value.stamp - back.stamp;
        if interval <= 0.0 {
            return;
        }

        let old_mean = self.stats.get(&q).map(|s| s.mean).unwrap_or(back.value);
        let avg = value_norm(q, value.value - 0.5 * value_diff(q, value.value, back.value));
        let new_mean = value_norm(q, old_mean + value_diff(q, avg, old_mean) * interval / (interval + span));
        let mean_shift_2 = value_diff(q, old_mean, new_mean).powi(2);
        let mean_diff_2 = value_diff(q, avg, new_mean).powi(2);
        let old_variance = self.stats.get(&q).map(|s| s.variance).unwrap_or(0.0);
        let new_variance = (span * (old_variance + mean_shift_2) + interval * mean_diff_2) / (span + interval);

        window.push_back(StampedValue { value: value.value, stamp: value.stamp });

        let mut stat = Statistic { time: value.stamp, n: window.len(), mean: new_mean, variance: new_variance };

        while window.len() > 1 && value.stamp - window.front().unwrap().stamp > self.period {
            let popped = window.pop_front().unwrap();
            if window.len() == 1 {
                stat = Statistic { time: value.stamp, n: 1, mean: value.value, variance: 0.0 };
                break;
            }
            let new_front = *window.front().unwrap();
            let back = *window.back().unwrap();
            let span2 = back.stamp - new_front.stamp;
            let interval2 = new_front.stamp - popped.stamp;
            if span2 <= 0.0 {
                break;
            }
            let avg2 = value_norm(q, popped.value - 0.5 * value_diff(q, popped.value, new_front.value));
            let old_mean2 = stat.mean;
            let new_mean2 = value_norm(q, old_mean2 - value_diff(q, avg2, old_mean2) * interval2 / span2);
            let mean_shift2_2 = value_diff(q, old_mean2, new_mean2).powi(2);
            let mean_diff2_2 = value_diff(q, avg2, new_mean2).powi(2);
            let new_variance2 = ((span2 + interval2) * stat.variance - interval2 * mean_diff2_2) / span2 - mean_shift2_2;
            stat = Statistic { time: value.stamp, n: window.len(), mean: new_mean2, variance: new_variance2 };
        }

        self.stats.insert(q, stat);
    }

    fn index(&self, index: usize) -> f64 {
        let q_idx = index / FIELDS_PER_QUANTITY;
        let field = index % FIELDS_PER_QUANTITY;
        let Some(q) = Quantity::ALL.get(q_idx) else { return 0.0 };
        self.field(*q, field)
    }

    fn modbus_register(&self, index: usize, scaler: &BaseScale) -> u16 {
        // 5 register slots per quantity: time occupies two u16 halves of a u32.
        let q_idx = index / 5;
        let slot = index % 5;
        let Some(&q) = Quantity::ALL.get(q_idx) else { return 0 };
        let Some(stat) = self.stats.get(&q) else { return 0 };
        match slot {
            0 => {
                let t: u32 = scaler.scale_to(Quantity::ut, stat.time);
                (t >> 16) as u16
            }
            1 => {
                let t: u32 = scaler.scale_to(Quantity::ut, stat.time);
                (t & 0xFFFF) as u16
            }
            2 => stat.n as u16,
            3 => scaler.scale_to(q, stat.mean),
            4 => scaler.scale_to(q, stat.variance.sqrt()),
            _ => 0,
        }
    }

    fn to_json(&self) -> String {
        let mut data = serde_json::Map::new();
        for (q, stat) in &self.stats {
            data.insert(
                q.name().to_string(),
                serde_json::json!({
                    "time": stat.time,
                    "samples": stat.n,
                    "mean": stat.mean,
                    "stddev": stat.variance.sqrt(),
                }),
            );
        }
        serde_json::json!({ "data": data }).to_string()
    }

    fn len(&self) -> usize {
        FIELDS_PER_QUANTITY * Quantity::ALL.len()
    }

    fn set_param(&mut self, name: &str, value: f64) {
        if name == "period" {
            self.period = value;
        }
    }

    fn set_filter(&mut self, filter: &str) {
        self.filter = parse_filter_set(filter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(stats: &mut Statistics, value: f64, stamp: f64) {
        stats.insert_value(&StampedQuantity::new(Quantity::ax, value, stamp));
    }

    #[test]
    fn first_sample_initializes_stat() {
        let mut stats = Statistics::new();
        insert(&mut stats, 1.0, 0.0);
        assert_eq!(stats.field(Quantity::ax, F_N), 1.0);
        assert_eq!(stats.field(Quantity::ax, F_MEAN), 1.0);
        assert_eq!(stats.field(Quantity::ax, F_STDDEV), 0.0);
    }

    #[test]
    fn square_wave_converges_near_expected_mean_and_stddev() {
        let mut stats = Statistics::new();
        let samples = [0.9, 1.1, 1.3, 1.1];
        let mut t = 0.0;
        for _ in 0..500_000 {
            for &v in &samples {
                insert(&mut stats, v, t);
                t += 0.25;
            }
        }
        assert_eq!(stats.field(Quantity::ax, F_N), 5.0);
        assert!((stats.field(Quantity::ax, F_MEAN) - 1.1).abs() < 1e-8);
        assert!((stats.field(Quantity::ax, F_STDDEV) - 0.1).abs() < 1e-8);
    }

    #[test]
    fn non_increasing_stamp_is_ignored() {
        let mut stats = Statistics::new();
        insert(&mut stats, 1.0, 1.0);
        insert(&mut stats, 2.0, 1.0);
        assert_eq!(stats.field(Quantity::ax, F_N), 1.0);
        assert_eq!(stats.field(Quantity::ax, F_MEAN), 1.0);
    }

    #[test]
    fn filter_restricts_accepted_quantities() {
        let mut stats = Statistics::new();
        stats.set_filter("ay");
        insert(&mut stats, 1.0, 0.0);
        assert_eq!(stats.field(Quantity::ax, F_N), 0.0);
    }
}

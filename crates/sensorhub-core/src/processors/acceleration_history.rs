//! Rolling history of acceleration peaks above a threshold.
//!
//! Grounded in `original_source/src/processors/acceleration_history.{h,cpp}`.

use std::collections::VecDeque;

use log::info;

use crate::cache::{StampedQuantity, StampedValue};
use crate::processor::Processor;
use crate::quantity::Quantity;
use crate::scale::BaseScale;

const X_DIR: u32 = 1;
const Y_DIR: u32 = 2;
const Z_DIR: u32 = 4;

#[derive(Debug, Clone, Copy, Default)]
struct AccelerationPeak {
    start: f64,
    duration: f64,
    peak: f64,
    mean: f64,
    rms: f64,
}

impl AccelerationPeak {
    const FIELD_COUNT: usize = 5;

    fn field(&self, index: usize) -> f64 {
        match index {
            0 => self.start,
            1 => self.duration,
            2 => self.peak,
            3 => self.mean,
            4 => self.rms,
            _ => 0.0,
        }
    }
}

pub struct AccelerationHistory {
    current: AccelerationPeak,
    peaks: VecDeque<AccelerationPeak>,
    value_threshold: f64,
    duration_threshold: f64,
    item_count: usize,
    direction: u32,
    fax: StampedValue,
    fay: StampedValue,
    faz: StampedValue,
}

impl AccelerationHistory {
    pub fn new() -> Self {
        AccelerationHistory {
            current: AccelerationPeak::default(),
            peaks: VecDeque::new(),
            value_threshold: 1.0,
            duration_threshold: 1.0,
            item_count: 10,
            direction: X_DIR | Y_DIR,
            fax: StampedValue { value: 0.0, stamp: 0.0 },
            fay: StampedValue { value: 0.0, stamp: 0.0 },
            faz: StampedValue { value: 0.0, stamp: 0.0 },
        }
    }

    fn handle_value(&mut self) {
        let (amp, sqamp) = match self.direction {
            X_DIR => (self.fax.value, self.fax.value.powi(2)),
            Y_DIR => (self.fay.value, self.fay.value.powi(2)),
            Z_DIR => (self.faz.value, self.faz.value.powi(2)),
            _ => {
                let sq = self.fax.value.powi(2) + self.fay.value.powi(2) + self.faz.value.powi(2);
                (sq.sqrt(), sq)
            }
        };
        let stamp = self.fax.stamp.max(self.fay.stamp).max(self.faz.stamp);
        let aamp = amp.abs();

        if aamp > self.value_threshold {
            if self.current.start == 0.0 {
                self.current = AccelerationPeak { start: stamp, duration: 0.0, peak: amp, mean: amp, rms: sqamp };
            } else {
                if aamp > self.current.peak.abs() {
                    self.current.peak = amp;
                }
                let new_duration = stamp - self.current.start;
                let interval = new_duration - self.current.duration;
                if new_duration > 0.0 {
                    self.current.duration = new_duration;
                    self.current.mean += (amp - self.current.mean) * interval / new_duration;
                    self.current.rms += (sqamp - self.current.rms) * interval / new_duration;
                }
            }
        } else {
            if self.current.duration > self.duration_threshold {
                self.current.rms = self.current.rms.sqrt();
                self.peaks.push_front(self.current);
                while self.peaks.len() > self.item_count {
                    self.peaks.pop_back();
                }
            }
            self.current = AccelerationPeak::default();
        }
        self.fax = StampedValue { value: 0.0, stamp: 0.0 };
        self.fay = StampedValue { value: 0.0, stamp: 0.0 };
        self.faz = StampedValue { value: 0.0, stamp: 0.0 };
    }
}

impl Default for AccelerationHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for AccelerationHistory {
    fn insert_value(&mut self, value: &StampedQuantity) {
        if (self.direction & X_DIR) != 0 && value.quantity == Quantity::fax {
            if self.fax.stamp != 0.0 {
                self.handle_value();
            }
            self.fax = value.as_stamped_value();
        } else if (self.direction & Y_DIR) != 0 && value.quantity == Quantity::fay {
            if self.fay.stamp != 0.0 {
                self.handle_value();
            }
            self.fay = value.as_stamped_value();
        } else if (self.direction & Z_DIR) != 0 && value.quantity == Quantity::faz {
            if self.faz.stamp != 0.0 {
                self.handle_value();
            }
            self.faz = value.as_stamped_value();
        }
    }

    fn index(&self, index: usize) -> f64 {
        let i = index / AccelerationPeak::FIELD_COUNT;
        let m = index % AccelerationPeak::FIELD_COUNT;
        self.peaks.get(i).map(|p| p.field(m)).unwrap_or(0.0)
    }

    fn modbus_register(&self, index: usize, scaler: &BaseScale) -> u16 {
        let slots = AccelerationPeak::FIELD_COUNT + 1;
        let i = index / slots;
        let m = index % slots;
        let Some(peak) = self.peaks.get(i) else { return 0 };
        match m {
            0 => {
                let t: u32 = scaler.scale_to(Quantity::ut, peak.start);
                (t >> 16) as u16
            }
            1 => {
                let t: u32 = scaler.scale_to(Quantity::ut, peak.start);
                (t & 0xFFFF) as u16
            }
            2 => scaler.scale_to(Quantity::du, peak.duration),
            _ => scaler.scale_to(Quantity::ax, peak.field(m - 1)),
        }
    }

    fn to_json(&self) -> String {
        let data: Vec<_> = self
            .peaks
            .iter()
            .map(|p| {
                serde_json::json!({
                    "time": p.start,
                    "duration": p.duration,
                    "peak": p.peak,
                    "mean": p.mean,
                    "rms": p.rms,
                })
            })
            .collect();
        serde_json::json!({ "data": data }).to_string()
    }

    fn len(&self) -> usize {
        AccelerationPeak::FIELD_COUNT * self.peaks.len()
    }

    fn set_param(&mut self, name: &str, value: f64) {
        match name {
            "value_threshold" => {
                self.value_threshold = value;
                info!("setting value_threshold to {value}");
            }
            "duration_threshold" => {
                self.duration_threshold = value;
                info!("setting duration_threshold to {value}");
            }
            "item_count" => {
                self.item_count = value as usize;
                info!("setting item_count to {}", self.item_count);
            }
            "direction" => {
                self.direction = value as u32;
                info!("setting direction to {}", self.direction);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(q: Quantity, value: f64, stamp: f64) -> StampedQuantity {
        StampedQuantity::new(q, value, stamp)
    }

    #[test]
    fn below_threshold_never_records_a_peak() {
        let mut hist = AccelerationHistory::new();
        hist.set_param("value_threshold", 5.0);
        for t in 0..20 {
            hist.insert_value(&v(Quantity::fax, 0.1, t as f64));
            hist.insert_value(&v(Quantity::fay, 0.1, t as f64));
        }
        assert!(hist.is_empty());
    }

    #[test]
    fn sustained_excursion_above_threshold_becomes_a_recorded_peak() {
        let mut hist = AccelerationHistory::new();
        hist.set_param("duration_threshold", 0.5);
        for i in 0..20 {
            let t = i as f64 * 0.1;
            hist.insert_value(&v(Quantity::fax, 3.0, t));
            hist.insert_value(&v(Quantity::fay, 3.0, t));
        }
        // Drop back below threshold to close out the peak.
        hist.insert_value(&v(Quantity::fax, 0.0, 2.1));
        hist.insert_value(&v(Quantity::fay, 0.0, 2.1));
        assert_eq!(hist.len(), 5);
        assert!(hist.index(2) > 2.0); // peak amplitude
    }

    #[test]
    fn item_count_bounds_history_length() {
        let mut hist = AccelerationHistory::new();
        hist.set_param("item_count", 2.0);
        hist.set_param("duration_threshold", 0.05);
        for burst in 0..5 {
            let base = burst as f64 * 10.0;
            for i in 0..5 {
                let t = base + i as f64 * 0.1;
                hist.insert_value(&v(Quantity::fax, 3.0, t));
                hist.insert_value(&v(Quantity::fay, 3.0, t));
            }
            hist.insert_value(&v(Quantity::fax, 0.0, base + 0.6));
            hist.insert_value(&v(Quantity::fay, 0.0, base + 0.6));
        }
        assert_eq!(hist.peaks.len(), 2);
    }
}

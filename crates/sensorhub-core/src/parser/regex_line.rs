//! The regex-based line protocol: configurable per-quantity filters with
//! numeric/time format decoding.
//!
//! Grounded in `original_source/src/devices/regex.{h,cpp}`.

use std::collections::HashMap;

use chrono::{NaiveDate, NaiveDateTime, TimeZone};
use regex::Regex;

use crate::cache::StampedQuantity;
use crate::quantity::Quantity;

use super::{FrameParser, ParseBuffer};

/// Maximum capture groups a single filter uses, per spec.md §4.6.
pub const MAX_CAPTURE_GROUPS: usize = 10;

/// One quantity's regex filter: an expression plus up to ten parallel
/// per-capture-group decode parameters.
#[derive(Clone)]
pub struct QuantityFilter {
    pub expression: Regex,
    pub multipliers: Vec<f64>,
    pub offsets: Vec<f64>,
    pub formats: Vec<String>,
}

impl QuantityFilter {
    pub fn new(expression: Regex) -> Self {
        QuantityFilter {
            expression,
            multipliers: vec![1.0; MAX_CAPTURE_GROUPS],
            offsets: vec![0.0; MAX_CAPTURE_GROUPS],
            formats: vec!["f".to_string(); MAX_CAPTURE_GROUPS],
        }
    }
}

/// Decode a captured substring per `format`, per spec.md §4.6.
fn decode_capture(text: &str, format: &str) -> Option<f64> {
    match format {
        "f" => {
            let normalized = if !text.contains('.') {
                text.replacen(',', ".", 1)
            } else {
                text.to_string()
            };
            let normalized: String = normalized.chars().filter(|&c| c != ',').collect();
            normalized.parse::<f64>().ok()
        }
        "dt" => {
            if text.contains('T') {
                let parsed = NaiveDateTime::parse_from_str(text, "%Y%m%dT%H%M%S%.f")
                    .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
                    .ok()?;
                Some(parsed.and_utc().timestamp() as f64 + parsed.and_utc().timestamp_subsec_nanos() as f64 * 1e-9)
            } else {
                let parsed = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f").ok()?;
                Some(parsed.and_utc().timestamp() as f64 + parsed.and_utc().timestamp_subsec_nanos() as f64 * 1e-9)
            }
        }
        other => {
            let naive = NaiveDateTime::parse_from_str(text, other)
                .ok()
                .or_else(|| NaiveDate::parse_from_str(text, other).ok().map(|d| d.and_hms_opt(0, 0, 0).unwrap()))?;
            let local = chrono::Local.from_local_datetime(&naive).single()?;
            Some(local.timestamp() as f64)
        }
    }
}

/// Stateful regex line parser. Holds one filter per quantity.
#[derive(Default)]
pub struct RegexParser {
    buf: ParseBuffer,
    filters: HashMap<Quantity, QuantityFilter>,
}

impl RegexParser {
    pub fn new() -> Self {
        RegexParser { buf: ParseBuffer::new(), filters: HashMap::new() }
    }

    pub fn set_filter(&mut self, quantity: Quantity, filter: QuantityFilter) {
        self.filters.insert(quantity, filter);
    }

    fn run(&mut self, stamp: f64) {
        loop {
            let text = String::from_utf8_lossy(self.buf.buffer.make_contiguous()).into_owned();
            let mut matched = false;
            let mut furthest_end = 0usize;
            let mut emitted = Vec::new();

            for (quantity, filter) in &self.filters {
                let Some(caps) = filter.expression.captures(&text) else { continue };
                matched = true;
                let whole = caps.get(0).unwrap();
                furthest_end = furthest_end.max(whole.end());

                let mut sum = 0.0;
                for i in 1..caps.len().min(MAX_CAPTURE_GROUPS + 1) {
                    let Some(group) = caps.get(i) else { continue };
                    let format = filter.formats.get(i - 1).map(String::as_str).unwrap_or("f");
                    let Some(mut value) = decode_capture(group.as_str(), format) else { continue };
                    value *= filter.multipliers.get(i - 1).copied().unwrap_or(1.0);
                    value += filter.offsets.get(i - 1).copied().unwrap_or(0.0);
                    sum += value;
                }
                emitted.push(StampedQuantity::new(*quantity, sum, stamp));
            }

            if !matched {
                break;
            }
            self.buf.ready.extend(emitted);
            for _ in 0..furthest_end {
                self.buf.buffer.pop_front();
            }
        }
    }
}

impl FrameParser for RegexParser {
    fn feed(&mut self, stamp: f64, bytes: &[u8]) {
        self.buf.push(bytes);
        self.run(stamp);
    }

    fn drain(&mut self) -> Vec<StampedQuantity> {
        self.buf.drain_ready()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_regex_filter() {
        let mut parser = RegexParser::new();
        let mut filter = QuantityFilter::new(Regex::new(r"^([0-2]),[0-2]").unwrap());
        filter.multipliers[0] = 3.1415927;
        filter.offsets[0] = 0.0;
        filter.formats[0] = "f".to_string();
        parser.set_filter(Quantity::ax, filter);

        let line = b"1,0,224,69767,18.927,18.984,27.366,0.630\n";
        parser.feed(1000.0, line);
        let out = parser.drain();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].quantity, Quantity::ax);
        assert!((out[0].value - 3.1415927).abs() < 1e-7);
        assert_eq!(out[0].stamp, 1000.0);
    }

    #[test]
    fn decode_f_accepts_comma_decimal_when_no_dot() {
        assert_eq!(decode_capture("3,14", "f"), Some(3.14));
        assert_eq!(decode_capture("1,234.5", "f"), Some(1234.5));
    }
}

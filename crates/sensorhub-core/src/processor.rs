//! The processor interface and its factory registry.
//!
//! Grounded in `original_source/src/processor.h`. Every processor is
//! mutated only through `insert_value`, called from the scheduler's single
//! thread (spec.md §3/§5) — the trait therefore takes `&mut self`, with no
//! internal locking.

use std::collections::HashMap;

use log::{error, warn};

use crate::cache::StampedQuantity;
use crate::quantity::get_quantity;
use crate::scale::BaseScale;

/// A stateful consumer of stamped quantities, exposing scalar indexing, a
/// Modbus register view, and a JSON snapshot.
pub trait Processor: Send {
    fn insert_value(&mut self, _value: &StampedQuantity) {}

    /// Scalar value at `index`; processor-defined layout. Returns 0 for an
    /// out-of-range index, matching the original's default.
    fn index(&self, _index: usize) -> f64 {
        0.0
    }

    fn modbus_register(&self, _index: usize, _scaler: &BaseScale) -> u16 {
        0
    }

    fn to_json(&self) -> String {
        "{}".to_string()
    }

    fn len(&self) -> usize {
        0
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn set_param(&mut self, _name: &str, _value: f64) {}

    /// Comma-separated quantity names this processor restricts itself to.
    fn set_filter(&mut self, _filter: &str) {}

    /// Comma-separated `key=value` parameters, parsed and dispatched to
    /// [`Processor::set_param`] one at a time.
    fn set_params(&mut self, params: &str) {
        for field in params.split(',') {
            let field = field.trim();
            if field.is_empty() {
                continue;
            }
            let Some((key, val)) = field.split_once('=') else {
                warn!("expected key=value in processor parameters, got '{field}'");
                continue;
            };
            match val.trim().parse::<f64>() {
                Ok(v) => self.set_param(key.trim(), v),
                Err(e) => {
                    error!("{e}. Expected floating point argument in processor parameter, got '{val}'.");
                }
            }
        }
    }
}

/// Parse a comma-separated list of quantity names into a filter set,
/// skipping (and logging) names absent from the catalogue.
pub fn parse_filter_set(filter: &str) -> std::collections::HashSet<crate::quantity::Quantity> {
    let mut set = std::collections::HashSet::new();
    for name in filter.split(',') {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        match get_quantity(name) {
            Some(q) => {
                set.insert(q);
            }
            None => warn!("unknown quantity '{name}' in processor filter"),
        }
    }
    set
}

/// A named, owned processor instance plus the set of device names it was
/// requested to attach to (tracked so the service loop can warn when none
/// matched, per `original_source/src/loop.cpp`'s `setup_processors`).
pub struct ProcessorHandle {
    pub name: String,
    pub processor: Box<dyn Processor>,
}

type ProcessorFactory = fn() -> Box<dyn Processor>;

/// Process-wide processor factory registry, initialised on first use.
#[derive(Default)]
pub struct ProcessorRegistry {
    factories: HashMap<&'static str, ProcessorFactory>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        let mut registry = ProcessorRegistry { factories: HashMap::new() };
        registry.register("statistics", || {
            Box::new(crate::processors::statistics::Statistics::new())
        });
        registry.register("acceleration_history", || {
            Box::new(crate::processors::acceleration_history::AccelerationHistory::new())
        });
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: ProcessorFactory) {
        self.factories.insert(name, factory);
    }

    pub fn create(&self, type_name: &str) -> Option<Box<dyn Processor>> {
        self.factories.get(type_name).map(|f| f())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_creates_known_processors() {
        let registry = ProcessorRegistry::new();
        assert!(registry.create("statistics").is_some());
        assert!(registry.create("acceleration_history").is_some());
        assert!(registry.create("missing_processor_type").is_none());
    }

    struct Counter(f64);
    impl Processor for Counter {
        fn set_param(&mut self, name: &str, value: f64) {
            if name == "period" {
                self.0 = value;
            }
        }
    }

    #[test]
    fn set_params_skips_malformed_fields() {
        let mut c = Counter(0.0);
        c.set_params("period=2.5,bogus,also=not_a_number");
        assert_eq!(c.0, 2.5);
    }
}

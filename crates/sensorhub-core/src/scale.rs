//! Projection of physical quantity values onto fixed-width integers for the
//! Modbus base map, grounded in `original_source/src/processor.h`'s
//! `Base_scale::scale_to`.

use std::collections::HashMap;
use std::ops::BitXorAssign;

use crate::quantity::Quantity;

/// Per-quantity scale configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scale {
    pub min: f64,
    pub max: f64,
    pub multiplier: f64,
    pub offset: f64,
    pub overflow: bool,
    pub signed_type: bool,
}

impl Default for Scale {
    fn default() -> Self {
        Scale {
            min: -32768.0,
            max: 32768.0,
            multiplier: 0.0,
            offset: 0.0,
            overflow: false,
            signed_type: false,
        }
    }
}

/// An unsigned integer width `scale_to` can project onto.
pub trait ScaleTarget: Copy + BitXorAssign + 'static {
    /// `max - min + 1` for this integer width, as an `f64`.
    const RANGE: f64;
    /// The high bit, used to re-centre a zero physical value for signed output.
    const TOP_BIT: Self;
    /// Truncating cast from a normalized-and-scaled `f64`.
    fn from_f64(v: f64) -> Self;
}

impl ScaleTarget for u16 {
    const RANGE: f64 = 65536.0;
    const TOP_BIT: u16 = 0x8000;
    fn from_f64(v: f64) -> u16 {
        v as u16
    }
}

impl ScaleTarget for u32 {
    const RANGE: f64 = 4294967296.0;
    const TOP_BIT: u32 = 0x8000_0000;
    fn from_f64(v: f64) -> u32 {
        v as u32
    }
}

/// Per-quantity scaler built from configuration, with defaults falling back
/// to [`Quantity::default_bounds`].
#[derive(Debug, Clone)]
pub struct BaseScale {
    scales: HashMap<Quantity, Scale>,
}

impl BaseScale {
    /// Build a scaler where every quantity uses its catalogue default bounds.
    pub fn with_defaults() -> Self {
        let mut scales = HashMap::new();
        for q in Quantity::ALL {
            let (min, max) = q.default_bounds();
            scales.insert(
                *q,
                Scale {
                    min,
                    max,
                    ..Scale::default()
                },
            );
        }
        BaseScale { scales }
    }

    /// Override one quantity's scale, e.g. from the `modbus.{q}_min` etc.
    /// configuration keys.
    pub fn set(&mut self, q: Quantity, scale: Scale) {
        self.scales.insert(q, scale);
    }

    /// Project `value` for `quantity` onto `T`. Returns `T::default()`-like
    /// zero if the quantity has no configured scale (mirrors the original's
    /// catch-all `return 0` on lookup failure).
    pub fn scale_to<T: ScaleTarget>(&self, quantity: Quantity, value: f64) -> T
    where
        T: Default,
    {
        let Some(scale) = self.scales.get(&quantity) else {
            return T::default();
        };

        let (mut min, mut max) = (scale.min, scale.max);
        if scale.multiplier != 0.0 {
            let range = T::RANGE / scale.multiplier;
            min = scale.offset - range / 2.0;
            max = scale.offset + range / 2.0;
        }

        let mut value = value;
        if !scale.overflow {
            value = value.max(min);
            value = value.min(max);
        }

        value -= min;
        value /= max - min;
        value *= T::RANGE;

        let mut result = T::from_f64(value);
        if scale.signed_type {
            result ^= T::TOP_BIT;
        }
        result
    }
}

impl Default for BaseScale {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_centred_quantity_maps_to_top_bit() {
        let scaler = BaseScale::with_defaults();
        // la defaults to (-pi, pi); value 0.0 is the midpoint.
        let v: u16 = scaler.scale_to(Quantity::la, 0.0);
        assert_eq!(v, 0x8000);
    }

    #[test]
    fn clamps_out_of_range_when_overflow_disabled() {
        let mut scaler = BaseScale::with_defaults();
        scaler.set(
            Quantity::ax,
            Scale {
                min: -1.0,
                max: 1.0,
                multiplier: 0.0,
                offset: 0.0,
                overflow: false,
                signed_type: false,
            },
        );
        let v: u16 = scaler.scale_to(Quantity::ax, 1000.0);
        assert_eq!(v, 0xFFFF);
    }

    #[test]
    fn unknown_quantity_returns_zero() {
        let scaler = BaseScale { scales: HashMap::new() };
        let v: u16 = scaler.scale_to(Quantity::ax, 42.0);
        assert_eq!(v, 0);
    }
}

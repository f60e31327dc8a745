//! The fixed catalogue of physical quantities and their wrap/scale semantics.
//!
//! Every reading that flows out of a device parser is tagged with one of
//! these. The catalogue is closed: adding a quantity means adding a variant
//! here, not a runtime registration.

use std::f64::consts::PI;

/// Wrap policy applied by [`value_norm`] / [`value_diff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapPolicy {
    /// No wrapping; values pass through unchanged.
    None,
    /// Wrapped into `[-pi, pi)`.
    Symmetric,
    /// Wrapped into `[0, 2*pi)`.
    Positive,
}

macro_rules! quantity_enum {
    ($($variant:ident),+ $(,)?) => {
        /// A physical quantity kind, identified by its short device-protocol name.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[allow(non_camel_case_types)]
        pub enum Quantity {
            $($variant),+
        }

        impl Quantity {
            /// All quantities in catalogue order.
            pub const ALL: &'static [Quantity] = &[$(Quantity::$variant),+];

            /// The quantity's short name, e.g. `"ax"`.
            pub fn name(self) -> &'static str {
                match self {
                    $(Quantity::$variant => stringify!($variant)),+
                }
            }
        }
    };
}

quantity_enum! {
    ut, la, lo, hg84, hmsl, vog, vtw, hdg, crs, mn,
    mx, my, mz, x, y, z, vx, vy, vz, ax,
    ay, az, ro, pi, ya, q1, q2, q3, q4, rr,
    pr, yr, fax, fay, faz, du, hacc, vacc, sacc, cacc,
    racc, pacc, yacc, hdac, rax, ray, raz, rrr, rpr, ryr,
    rmx, rmy, rmz, gtmp, stmp, wtmp, atmp, etmp, otmp, vsup,
    isup, vset, vsig, frq, sts0, sts1, md0, md1, md2, md3,
    cst0, cst1, cst2, cst3, cst4, cst5, cst6, cst7,
}

/// Look up a quantity by its short name. Used by config parsing and the
/// regex line-protocol filter keys.
pub fn get_quantity(name: &str) -> Option<Quantity> {
    Quantity::ALL.iter().copied().find(|q| q.name() == name)
}

impl Quantity {
    /// The wrap policy that governs [`value_norm`]/[`value_diff`] for this quantity.
    pub fn wrap_policy(self) -> WrapPolicy {
        use Quantity::*;
        match self {
            lo | ro | pi | ya => WrapPolicy::Symmetric,
            hdg | crs => WrapPolicy::Positive,
            _ => WrapPolicy::None,
        }
    }

    /// Default `(min, max)` scale bounds, as configured in the original
    /// `def_config_data` table. Quantities absent from that table fall back
    /// to the generic default of `(-32768.0, 32768.0)`.
    pub fn default_bounds(self) -> (f64, f64) {
        use Quantity::*;
        match self {
            ut => (0.0, 4294967296.0),
            la | ro | pi | ya | rr | pr | yr => (-PI, PI),
            hdg | crs => (0.0, 2.0 * PI),
            ax | ay | az | vx | vy | vz | fax | fay | faz | rax | ray | raz => {
                (-32.768, 32.768)
            }
            mx | my | mz | rmx | rmy | rmz => (-0.00032768, 0.00032768),
            du => (0.0, 6553.6),
            hg84 | hmsl => (-327.68, 327.68),
            hacc | vacc | sacc | cacc | racc | pacc | yacc | hdac => (0.0, 655.36),
            q1 | q2 | q3 | q4 => (-1.0, 1.0),
            gtmp => (0.0, 6553.6),
            stmp | wtmp | atmp | etmp | otmp => (0.0, 655.36),
            vsup | isup => (0.0, 655.36),
            vset | vsig => (-327.68, 327.68),
            frq => (0.0, 655360.0),
            sts0 | sts1 | md0 | md1 | md2 | md3 | cst0 | cst1 | cst2 | cst3 | cst4 | cst5
            | cst6 | cst7 => (0.0, 65536.0),
            _ => (-32768.0, 32768.0),
        }
    }
}

/// Reduce `v` into `q`'s canonical interval per its wrap policy.
pub fn value_norm(q: Quantity, v: f64) -> f64 {
    match q.wrap_policy() {
        WrapPolicy::None => v,
        WrapPolicy::Symmetric => wrap(v, -PI, 2.0 * PI),
        WrapPolicy::Positive => wrap(v, 0.0, 2.0 * PI),
    }
}

/// Shortest signed difference `a - b` respecting `q`'s wrap policy.
pub fn value_diff(q: Quantity, a: f64, b: f64) -> f64 {
    match q.wrap_policy() {
        WrapPolicy::None => a - b,
        WrapPolicy::Symmetric | WrapPolicy::Positive => wrap(a - b, -PI, 2.0 * PI),
    }
}

/// Wrap `v` into `[low, low + span)`.
fn wrap(v: f64, low: f64, span: f64) -> f64 {
    let mut r = (v - low) % span;
    if r < 0.0 {
        r += span;
    }
    low + r
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_round_trips() {
        for q in Quantity::ALL {
            assert_eq!(get_quantity(q.name()), Some(*q));
        }
    }

    #[test]
    fn catalogue_has_78_members() {
        assert_eq!(Quantity::ALL.len(), 78);
    }

    #[test]
    fn value_norm_is_idempotent() {
        for q in Quantity::ALL {
            for x in [-100.0_f64, -PI, -0.1, 0.0, 0.1, PI, 100.0] {
                let once = value_norm(*q, x);
                let twice = value_norm(*q, once);
                assert!((once - twice).abs() < 1e-12, "{:?} {}", q, x);
            }
        }
    }

    #[test]
    fn symmetric_wrap_range() {
        let v = value_norm(Quantity::ro, 3.0 * PI + 0.1);
        assert!((-PI..PI).contains(&v));
    }

    #[test]
    fn positive_wrap_range() {
        let v = value_norm(Quantity::hdg, -0.1);
        assert!((0.0..2.0 * PI).contains(&v));
    }

    #[test]
    fn value_diff_wraps_into_symmetric_range() {
        let d = value_diff(Quantity::ya, 0.1, 2.0 * PI - 0.1);
        assert!(d > 0.0 && d < 1.0);
    }
}

//! Unit conversion
//!
//! Resolves a conversion from a native unit expression to the reporting
//! unit. The expression language covers SI prefixes, `/` rate forms with
//! `^n` powers on the denominator, additive offsets (temperatures), and
//! `_3D` axis-wise application. The conversion composes to
//! `value' = (value * factor + offset) * scale` with `scale` absorbing the
//! data item's native scale.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use types::{DataItem, ObservedValue, Scalar};

use crate::error::PipelineError;
use crate::Result;

/// Linear map from one unit into its dimension's canonical unit
#[derive(Debug, Clone, Copy)]
struct Linear {
    factor: f64,
    offset: f64,
    canonical: &'static str,
}

const fn linear(factor: f64, offset: f64, canonical: &'static str) -> Linear {
    Linear { factor, offset, canonical }
}

/// Base units keyed by name, each mapped into its canonical unit
static BASE_UNITS: Lazy<HashMap<&'static str, Linear>> = Lazy::new(|| {
    HashMap::from([
        // Length, canonical MILLIMETER
        ("MILLIMETER", linear(1.0, 0.0, "MILLIMETER")),
        ("CENTIMETER", linear(10.0, 0.0, "MILLIMETER")),
        ("METER", linear(1000.0, 0.0, "MILLIMETER")),
        ("INCH", linear(25.4, 0.0, "MILLIMETER")),
        ("FOOT", linear(304.8, 0.0, "MILLIMETER")),
        // Angle, canonical DEGREE
        ("DEGREE", linear(1.0, 0.0, "DEGREE")),
        ("RADIAN", linear(57.295_779_513_082_32, 0.0, "DEGREE")),
        ("REVOLUTION", linear(1.0, 0.0, "REVOLUTION")),
        // Temperature, canonical CELSIUS
        ("CELSIUS", linear(1.0, 0.0, "CELSIUS")),
        ("FAHRENHEIT", linear(5.0 / 9.0, -160.0 / 9.0, "CELSIUS")),
        ("KELVIN", linear(1.0, -273.15, "CELSIUS")),
        // Pressure, canonical PASCAL
        ("PASCAL", linear(1.0, 0.0, "PASCAL")),
        ("BAR", linear(100_000.0, 0.0, "PASCAL")),
        ("TORR", linear(133.322, 0.0, "PASCAL")),
        // Volume, canonical split between LITER and CUBIC_MILLIMETER
        ("LITER", linear(1.0, 0.0, "LITER")),
        ("GALLON", linear(3.785_41, 0.0, "LITER")),
        ("PINT", linear(0.473_176, 0.0, "LITER")),
        ("CUBIC_MILLIMETER", linear(1.0, 0.0, "CUBIC_MILLIMETER")),
        ("CUBIC_INCH", linear(16_387.064, 0.0, "CUBIC_MILLIMETER")),
        ("CUBIC_FOOT", linear(28_316_846.592, 0.0, "CUBIC_MILLIMETER")),
        // Area, canonical SQUARE_MILLIMETER
        ("SQUARE_MILLIMETER", linear(1.0, 0.0, "SQUARE_MILLIMETER")),
        ("SQUARE_INCH", linear(645.16, 0.0, "SQUARE_MILLIMETER")),
        ("SQUARE_FOOT", linear(92_903.04, 0.0, "SQUARE_MILLIMETER")),
        // Energy, canonical WATT_SECOND
        ("WATT_SECOND", linear(1.0, 0.0, "WATT_SECOND")),
        ("WATT_HOUR", linear(3600.0, 0.0, "WATT_SECOND")),
        ("JOULE", linear(1.0, 0.0, "WATT_SECOND")),
        // Mass, canonical GRAM
        ("GRAM", linear(1.0, 0.0, "GRAM")),
        ("POUND", linear(453.592_37, 0.0, "GRAM")),
        // Time, canonical SECOND
        ("SECOND", linear(1.0, 0.0, "SECOND")),
        ("MINUTE", linear(60.0, 0.0, "SECOND")),
        ("HOUR", linear(3600.0, 0.0, "SECOND")),
        // Dimensionless / electrical singletons
        ("AMPERE", linear(1.0, 0.0, "AMPERE")),
        ("VOLT", linear(1.0, 0.0, "VOLT")),
        ("WATT", linear(1.0, 0.0, "WATT")),
        ("OHM", linear(1.0, 0.0, "OHM")),
        ("HERTZ", linear(1.0, 0.0, "HERTZ")),
        ("NEWTON", linear(1.0, 0.0, "NEWTON")),
        ("PERCENT", linear(1.0, 0.0, "PERCENT")),
        ("COUNT", linear(1.0, 0.0, "COUNT")),
    ])
});

static SI_PREFIXES: &[(&str, f64)] = &[
    ("NANO", 1e-9),
    ("MICRO", 1e-6),
    ("MILLI", 1e-3),
    ("CENTI", 1e-2),
    ("DECI", 1e-1),
    ("DECA", 1e1),
    ("HECTO", 1e2),
    ("KILO", 1e3),
    ("MEGA", 1e6),
    ("GIGA", 1e9),
    ("TERA", 1e12),
];

/// Irregular pairs resolved before the compositional rules
static DIRECT: Lazy<HashMap<(&'static str, &'static str), f64>> = Lazy::new(|| {
    HashMap::from([
        (("POUND/INCH^2", "PASCAL"), 6_894.76),
    ])
});

/// A precomputed conversion for one data item
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitConversion {
    factor: f64,
    offset: f64,
    scale: f64,
    vector: bool,
}

impl UnitConversion {
    /// Resolve a conversion from `native` to `target`. Unknown expressions
    /// fail construction; the caller treats that as fatal for the item.
    pub fn try_new(native: &str, target: &str) -> Result<Self> {
        let unknown = || PipelineError::UnknownUnit {
            from: native.to_string(),
            to: target.to_string(),
        };

        if native == target {
            return Ok(Self::identity());
        }

        if let Some(factor) = DIRECT.get(&(native, target)) {
            return Ok(Self::factor(*factor));
        }

        // Axis-wise vector form
        if let (Some(native_base), Some(target_base)) =
            (native.strip_suffix("_3D"), target.strip_suffix("_3D"))
        {
            let mut conv = Self::try_new(native_base, target_base)?;
            conv.vector = true;
            return Ok(conv);
        }

        // Rate form: numerator and denominator convert independently,
        // offsets are meaningless inside a compound expression.
        if native.contains('/') || target.contains('/') {
            let (nat_num, nat_den) = split_rate(native);
            let (tgt_num, tgt_den) = split_rate(target);
            let num = ratio(nat_num, tgt_num).ok_or_else(unknown)?;
            let den = match (nat_den, tgt_den) {
                (Some(nat), Some(tgt)) => {
                    let (nat_unit, nat_pow) = split_power(nat);
                    let (tgt_unit, tgt_pow) = split_power(tgt);
                    if nat_pow != tgt_pow {
                        return Err(unknown());
                    }
                    ratio(nat_unit, tgt_unit).ok_or_else(unknown)?.powi(nat_pow)
                }
                (None, None) => 1.0,
                _ => return Err(unknown()),
            };
            return Ok(Self::factor(num / den));
        }

        // Plain linear pair in the same dimension
        if let (Some(from), Some(to)) = (resolve(native), resolve(target)) {
            if from.canonical == to.canonical {
                return Ok(Self {
                    factor: from.factor / to.factor,
                    offset: (from.offset - to.offset) / to.factor,
                    scale: 1.0,
                    vector: false,
                });
            }
        }

        // Bare prefix relation, e.g. KILOAMPERE -> AMPERE for units outside
        // the base table
        if let Some(factor) = prefix_relation(native, target) {
            return Ok(Self::factor(factor));
        }

        Err(unknown())
    }

    /// Build the conversion a data item declares, if any.
    pub fn for_data_item(item: &DataItem) -> Option<Result<UnitConversion>> {
        if !item.conversion_required() {
            return None;
        }
        let conversion = match (&item.native_units, &item.units) {
            (Some(native), Some(units)) => Self::try_new(native, units),
            // Scale-only conversion
            _ => Ok(Self::identity()),
        };
        Some(conversion.map(|conv| match item.native_scale {
            Some(scale) if scale != 0.0 => conv.with_native_scale(scale),
            _ => conv,
        }))
    }

    fn identity() -> Self {
        Self { factor: 1.0, offset: 0.0, scale: 1.0, vector: false }
    }

    fn factor(factor: f64) -> Self {
        Self { factor, offset: 0.0, scale: 1.0, vector: false }
    }

    /// Fold the data item's native scale into the conversion; reported
    /// values are the native reading divided by the scale.
    pub fn with_native_scale(mut self, native_scale: f64) -> Self {
        self.scale = 1.0 / native_scale;
        self
    }

    pub fn convert(&self, value: f64) -> f64 {
        (value * self.factor + self.offset) * self.scale
    }

    /// Convert a value in place; vectors and time series convert axis-wise,
    /// text and conditions pass through untouched.
    pub fn convert_value(&self, value: &mut ObservedValue) {
        match value {
            ObservedValue::Scalar(Scalar::Number(n)) => *n = self.convert(*n),
            ObservedValue::Vector(axes) => {
                for axis in axes {
                    *axis = self.convert(*axis);
                }
            }
            ObservedValue::TimeSeries { values, .. } => {
                for v in values {
                    *v = self.convert(*v);
                }
            }
            _ => {}
        }
    }
}

fn split_rate(expr: &str) -> (&str, Option<&str>) {
    match expr.split_once('/') {
        Some((num, den)) => (num, Some(den)),
        None => (expr, None),
    }
}

fn split_power(expr: &str) -> (&str, i32) {
    match expr.split_once('^') {
        Some((unit, pow)) => (unit, pow.parse().unwrap_or(1)),
        None => (expr, 1),
    }
}

/// Resolve a unit name, trying the base table first and SI prefixes second.
fn resolve(unit: &str) -> Option<Linear> {
    if let Some(linear) = BASE_UNITS.get(unit) {
        return Some(*linear);
    }
    for (prefix, multiplier) in SI_PREFIXES {
        if let Some(rest) = unit.strip_prefix(prefix) {
            if let Some(base) = BASE_UNITS.get(rest) {
                if base.offset == 0.0 {
                    return Some(Linear {
                        factor: base.factor * multiplier,
                        offset: 0.0,
                        canonical: base.canonical,
                    });
                }
            }
        }
    }
    None
}

/// Pure multiplicative ratio between two units of one dimension
fn ratio(from: &str, to: &str) -> Option<f64> {
    if from == to {
        return Some(1.0);
    }
    let from = resolve(from)?;
    let to = resolve(to)?;
    if from.canonical == to.canonical && from.offset == 0.0 && to.offset == 0.0 {
        Some(from.factor / to.factor)
    } else {
        None
    }
}

/// `KILOX -> X` or `X -> KILOX` for units outside the base table
fn prefix_relation(native: &str, target: &str) -> Option<f64> {
    for (prefix, multiplier) in SI_PREFIXES {
        if native.strip_prefix(prefix) == Some(target) {
            return Some(*multiplier);
        }
        if target.strip_prefix(prefix) == Some(native) {
            return Some(1.0 / multiplier);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn near(expected: f64, actual: f64, eps: f64) {
        assert!(
            (expected - actual).abs() < eps,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn inch_3d_converts_each_axis() {
        let conv = UnitConversion::try_new("INCH_3D", "MILLIMETER_3D").unwrap();
        let mut value = ObservedValue::Vector(vec![1.0, 2.0, 3.0]);
        conv.convert_value(&mut value);
        match value {
            ObservedValue::Vector(v) => {
                near(25.4, v[0], 0.0001);
                near(50.8, v[1], 0.0001);
                near(76.2, v[2], 0.0001);
            }
            other => panic!("expected vector, got {other:?}"),
        }
    }

    #[test]
    fn radian_3d() {
        let conv = UnitConversion::try_new("RADIAN_3D", "DEGREE_3D").unwrap();
        near(57.29578, conv.convert(1.0), 0.0001);
        near(171.8873, conv.convert(3.0), 0.0001);
    }

    #[test]
    fn kilo_prefix() {
        let conv = UnitConversion::try_new("KILOAMPERE", "AMPERE").unwrap();
        near(130.0, conv.convert(0.13), 0.0001);
    }

    #[test]
    fn cubic_inch_to_cubic_millimeter() {
        let conv = UnitConversion::try_new("CUBIC_INCH", "CUBIC_MILLIMETER").unwrap();
        near(114_709.447_99, conv.convert(7.0), 0.0001);
    }

    #[test]
    fn fahrenheit_to_celsius_has_offset() {
        let conv = UnitConversion::try_new("FAHRENHEIT", "CELSIUS").unwrap();
        near(-12.22222, conv.convert(10.0), 0.0001);
    }

    #[test]
    fn foot_per_minute_rate() {
        let conv = UnitConversion::try_new("FOOT/MINUTE", "MILLIMETER/SECOND").unwrap();
        near(35.56, conv.convert(7.0), 0.0001);
    }

    #[test]
    fn squared_denominator_acceleration() {
        let conv = UnitConversion::try_new("FOOT/MINUTE^2", "MILLIMETER/SECOND^2").unwrap();
        near(0.592_666_667, conv.convert(7.0), 0.0001);
    }

    #[test]
    fn pound_per_square_inch_is_special_cased() {
        let conv = UnitConversion::try_new("POUND/INCH^2", "PASCAL").unwrap();
        near(48_263.32, conv.convert(7.0), 0.0001);
    }

    #[test]
    fn revolution_per_second_to_per_minute() {
        let conv = UnitConversion::try_new("REVOLUTION/SECOND", "REVOLUTION/MINUTE").unwrap();
        near(420.0, conv.convert(7.0), 0.0001);
    }

    #[test]
    fn cubic_feet_per_minute() {
        let conv =
            UnitConversion::try_new("CUBIC_FOOT/MINUTE", "CUBIC_MILLIMETER/SECOND").unwrap();
        near(3_303_632.15, conv.convert(7.0), 0.1);
    }

    #[test]
    fn kilowatt_hour_to_watt_second() {
        let conv = UnitConversion::try_new("KILOWATT_HOUR", "WATT_SECOND").unwrap();
        near(3.6e6, conv.convert(1.0), 0.1);
    }

    #[test]
    fn gallon_and_pint_to_liter() {
        let conv = UnitConversion::try_new("GALLON", "LITER").unwrap();
        near(3.78541, conv.convert(1.0), 0.0001);
        let conv = UnitConversion::try_new("PINT", "LITER").unwrap();
        near(0.473176, conv.convert(1.0), 0.0001);
    }

    #[test]
    fn native_scale_divides() {
        let conv = UnitConversion::try_new("MILLIMETER", "MILLIMETER")
            .unwrap()
            .with_native_scale(10.0);
        near(1.5, conv.convert(15.0), 0.0001);
    }

    #[test]
    fn unknown_units_fail_construction() {
        assert!(matches!(
            UnitConversion::try_new("FURLONG", "MILLIMETER"),
            Err(PipelineError::UnknownUnit { .. })
        ));
        assert!(matches!(
            UnitConversion::try_new("FOOT/FORTNIGHT", "MILLIMETER/SECOND"),
            Err(PipelineError::UnknownUnit { .. })
        ));
    }
}

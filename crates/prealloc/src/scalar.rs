//! Untrusted numeric arguments.

/// The magnitude up to which every integer has an exact `f64` representation.
const MAX_EXACT_FLOAT: f64 = 9_007_199_254_740_992.0;

/// A numeric argument as supplied by a caller or received over the wire,
/// before it is validated as an offset, a length or a mode.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(from = "WireScalar", into = "WireScalar")]
pub enum Scalar {
    /// An integer value.
    Integer(i64),
    /// A floating point value, possibly fractional or non-finite.
    Float(f64),
}

impl Scalar {
    /// The exact integer value, if this scalar holds one.
    pub fn as_exact_integer(self) -> Option<i64> {
        match self {
            Scalar::Integer(value) => Some(value),
            Scalar::Float(value) => {
                if !value.is_finite() || value.fract() != 0.0 || value.abs() > MAX_EXACT_FLOAT {
                    return None;
                }
                Some(value as i64)
            }
        }
    }
}

macro_rules! impl_from_lossless {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Scalar {
                fn from(value: $ty) -> Self {
                    Scalar::Integer(value.into())
                }
            }
        )*
    };
}

impl_from_lossless!(i8, i16, i32, i64, u8, u16, u32);

impl From<u64> for Scalar {
    fn from(value: u64) -> Self {
        match i64::try_from(value) {
            Ok(value) => Scalar::Integer(value),
            // Too large for any native offset type, keep it around as
            // an invalid value.
            Err(_) => Scalar::Float(value as f64),
        }
    }
}

impl From<usize> for Scalar {
    fn from(value: usize) -> Self {
        (value as u64).into()
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Float(value)
    }
}

impl From<f32> for Scalar {
    fn from(value: f32) -> Self {
        Scalar::Float(value.into())
    }
}

/// The wire representation.
///
/// JSON has no literals for the non-finite floats, so those travel as
/// strings instead of silently degrading to `null`.
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
enum WireScalar {
    Integer(i64),
    Float(f64),
    NonFinite(String),
}

impl From<Scalar> for WireScalar {
    fn from(value: Scalar) -> Self {
        match value {
            Scalar::Integer(value) => WireScalar::Integer(value),
            Scalar::Float(value) if value.is_finite() => WireScalar::Float(value),
            Scalar::Float(value) if value.is_nan() => WireScalar::NonFinite("NaN".to_owned()),
            Scalar::Float(value) if value > 0.0 => WireScalar::NonFinite("Infinity".to_owned()),
            Scalar::Float(_) => WireScalar::NonFinite("-Infinity".to_owned()),
        }
    }
}

impl From<WireScalar> for Scalar {
    fn from(value: WireScalar) -> Self {
        match value {
            WireScalar::Integer(value) => Scalar::Integer(value),
            WireScalar::Float(value) => Scalar::Float(value),
            WireScalar::NonFinite(text) => Scalar::Float(text.parse().unwrap_or(f64::NAN)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routine(sample: Scalar, expected: Option<i64>) {
        assert_eq!(sample.as_exact_integer(), expected, "sample: {sample:?}");
    }

    #[test]
    fn exact_integers() {
        routine(Scalar::Integer(-1), Some(-1));
        routine(Scalar::Integer(0), Some(0));
        routine(Scalar::Float(4096.0), Some(4096));
        routine(Scalar::Float(-3.0), Some(-3));
    }

    #[test]
    fn inexact_values() {
        routine(Scalar::Float(1.09), None);
        routine(Scalar::Float(f64::NAN), None);
        routine(Scalar::Float(f64::INFINITY), None);
        routine(Scalar::Float(f64::NEG_INFINITY), None);
        routine(Scalar::Float(1e300), None);
    }

    #[test]
    fn huge_unsigned() {
        routine(Scalar::from(u64::MAX), None);
        routine(Scalar::from(u64::from(u32::MAX)), Some(i64::from(u32::MAX)));
    }

    #[test]
    fn wire_forms() {
        let encoded = serde_json::to_string(&[
            Scalar::Integer(7),
            Scalar::Float(1.5),
            Scalar::Float(f64::NAN),
            Scalar::Float(f64::INFINITY),
            Scalar::Float(f64::NEG_INFINITY),
        ])
        .unwrap();
        assert_eq!(encoded, r#"[7,1.5,"NaN","Infinity","-Infinity"]"#);
    }

    #[test]
    fn non_finite_stays_invalid_across_the_wire() {
        for sample in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let encoded = serde_json::to_string(&Scalar::Float(sample)).unwrap();
            let decoded: Scalar = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded.as_exact_integer(), None);
        }
    }

    #[test]
    fn integral_float_from_the_wire() {
        let decoded: Scalar = serde_json::from_str("5.0").unwrap();
        assert_eq!(decoded.as_exact_integer(), Some(5));
    }
}

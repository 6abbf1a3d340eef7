use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;

/// Kind discriminant of a [`ParamValue`].
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Bool,
    Int,
    Decimal,
    Text,
}

/// A typed strategy parameter value.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Decimal(Decimal),
    Text(SmolStr),
}

impl ParamValue {
    pub fn kind(&self) -> ParamKind {
        match self {
            ParamValue::Bool(_) => ParamKind::Bool,
            ParamValue::Int(_) => ParamKind::Int,
            ParamValue::Decimal(_) => ParamKind::Decimal,
            ParamValue::Text(_) => ParamKind::Text,
        }
    }

    fn as_numeric(&self) -> Option<Decimal> {
        match self {
            ParamValue::Int(value) => Some(Decimal::from(*value)),
            ParamValue::Decimal(value) => Some(*value),
            _ => None,
        }
    }
}

/// Declared shape and range of a single strategy parameter.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct ParamSpec {
    pub kind: ParamKind,
    pub min: Option<Decimal>,
    pub max: Option<Decimal>,
}

impl ParamSpec {
    pub fn of(kind: ParamKind) -> Self {
        Self {
            kind,
            min: None,
            max: None,
        }
    }

    pub fn decimal_range(min: Decimal, max: Decimal) -> Self {
        Self {
            kind: ParamKind::Decimal,
            min: Some(min),
            max: Some(max),
        }
    }
}

/// Typed parameter set carried by a strategy.
#[derive(Debug, Clone, Eq, PartialEq, Default, Deserialize, Serialize)]
pub struct ParamSet {
    values: IndexMap<SmolStr, ParamValue>,
}

impl ParamSet {
    pub fn new<Iter, Name>(values: Iter) -> Self
    where
        Iter: IntoIterator<Item = (Name, ParamValue)>,
        Name: Into<SmolStr>,
    {
        Self {
            values: values
                .into_iter()
                .map(|(name, value)| (name.into(), value))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn decimal(&self, name: &str) -> Option<Decimal> {
        self.get(name).and_then(ParamValue::as_numeric)
    }

    pub fn set(&mut self, name: impl Into<SmolStr>, value: ParamValue) {
        self.values.insert(name.into(), value);
    }

    /// Merge `update` over this set, producing the candidate new set.
    pub fn merged_with(&self, update: &ParamSet) -> ParamSet {
        let mut merged = self.clone();
        for (name, value) in &update.values {
            merged.values.insert(name.clone(), value.clone());
        }
        merged
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SmolStr, &ParamValue)> + '_ {
        self.values.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Declared parameter schema of a strategy, validating updates before they
/// are applied.
#[derive(Debug, Clone, Eq, PartialEq, Default, Deserialize, Serialize)]
pub struct ParamSchema {
    specs: IndexMap<SmolStr, ParamSpec>,
}

impl ParamSchema {
    pub fn new<Iter, Name>(specs: Iter) -> Self
    where
        Iter: IntoIterator<Item = (Name, ParamSpec)>,
        Name: Into<SmolStr>,
    {
        Self {
            specs: specs
                .into_iter()
                .map(|(name, spec)| (name.into(), spec))
                .collect(),
        }
    }

    /// Validate an update against the schema: every key must be declared,
    /// the kind must match, and numeric values must lie within range.
    pub fn validate(&self, update: &ParamSet) -> Result<(), ParamError> {
        for (name, value) in update.iter() {
            let Some(spec) = self.specs.get(name) else {
                return Err(ParamError::Unknown(name.clone()));
            };

            if value.kind() != spec.kind {
                return Err(ParamError::KindMismatch {
                    name: name.clone(),
                    expected: spec.kind,
                    actual: value.kind(),
                });
            }

            if let Some(numeric) = value.as_numeric() {
                if spec.min.is_some_and(|min| numeric < min)
                    || spec.max.is_some_and(|max| numeric > max)
                {
                    return Err(ParamError::OutOfRange {
                        name: name.clone(),
                        value: numeric,
                    });
                }
            }
        }

        Ok(())
    }
}

/// Errors produced when validating a parameter update.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ParamError {
    #[error("unknown parameter: {0}")]
    Unknown(SmolStr),

    #[error("parameter {name} expects {expected:?}, got {actual:?}")]
    KindMismatch {
        name: SmolStr,
        expected: ParamKind,
        actual: ParamKind,
    },

    #[error("parameter {name} value {value} is out of range")]
    OutOfRange { name: SmolStr, value: Decimal },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn schema() -> ParamSchema {
        ParamSchema::new(vec![
            ("qty", ParamSpec::decimal_range(dec!(0.001), dec!(10))),
            ("enabled", ParamSpec::of(ParamKind::Bool)),
        ])
    }

    #[test]
    fn test_validate_accepts_in_range_updates() {
        let update = ParamSet::new(vec![("qty", ParamValue::Decimal(dec!(1)))]);
        assert!(schema().validate(&update).is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_kind_and_range_violations() {
        assert!(matches!(
            schema().validate(&ParamSet::new(vec![(
                "unknown",
                ParamValue::Bool(true)
            )])),
            Err(ParamError::Unknown(_))
        ));
        assert!(matches!(
            schema().validate(&ParamSet::new(vec![("qty", ParamValue::Bool(true))])),
            Err(ParamError::KindMismatch { .. })
        ));
        assert!(matches!(
            schema().validate(&ParamSet::new(vec![(
                "qty",
                ParamValue::Decimal(dec!(100))
            )])),
            Err(ParamError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_merged_with_overlays_updates() {
        let current = ParamSet::new(vec![
            ("qty", ParamValue::Decimal(dec!(1))),
            ("enabled", ParamValue::Bool(true)),
        ]);
        let update = ParamSet::new(vec![("qty", ParamValue::Decimal(dec!(2)))]);

        let merged = current.merged_with(&update);
        assert_eq!(merged.decimal("qty"), Some(dec!(2)));
        assert_eq!(merged.get("enabled"), Some(&ParamValue::Bool(true)));
    }
}

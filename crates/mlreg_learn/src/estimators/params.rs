use mlreg_core::{RegistryError, Result};
use std::ops::RangeInclusive;

use crate::types::{ParamValue, Parameters};

/// Typed access to a parameter map against a fixed list of accepted names.
pub(crate) struct ParamReader<'a> {
    params: &'a Parameters,
}

fn field(name: &str) -> String {
    format!("parameters.{name}")
}

impl<'a> ParamReader<'a> {
    /// Fails on the first parameter name not in `accepted`.
    pub fn new(params: &'a Parameters, accepted: &[&str]) -> Result<Self> {
        if let Some(name) = params.keys().find(|k| !accepted.contains(&k.as_str())) {
            return Err(RegistryError::validation(
                field(name),
                format!("unknown parameter, accepted: {}", accepted.join(", ")),
            ));
        }
        Ok(Self { params })
    }

    pub fn usize_or(&self, name: &str, default: usize, range: RangeInclusive<usize>) -> Result<usize> {
        Ok(self.opt_usize(name, range)?.unwrap_or(default))
    }

    /// Optional integer; absent means `None`.
    pub fn opt_usize(&self, name: &str, range: RangeInclusive<usize>) -> Result<Option<usize>> {
        let Some(value) = self.params.get(name) else {
            return Ok(None);
        };
        let ParamValue::Int(v) = value else {
            return Err(wrong_type(name, "integer", value));
        };
        let v = usize::try_from(*v).ok().filter(|v| range.contains(v)).ok_or_else(|| {
            RegistryError::validation(
                field(name),
                format!("must be between {} and {}", range.start(), range.end()),
            )
        })?;
        Ok(Some(v))
    }

    pub fn u64_or(&self, name: &str, default: u64) -> Result<u64> {
        match self.params.get(name) {
            None => Ok(default),
            Some(ParamValue::Int(v)) => u64::try_from(*v)
                .map_err(|_| RegistryError::validation(field(name), "must not be negative")),
            Some(other) => Err(wrong_type(name, "integer", other)),
        }
    }

    /// Float parameter; integers are accepted and widened.
    pub fn f64_or(&self, name: &str, default: f64, check: impl Fn(f64) -> bool, expect: &str) -> Result<f64> {
        let v = match self.params.get(name) {
            None => return Ok(default),
            Some(ParamValue::Float(v)) => *v,
            Some(ParamValue::Int(v)) => *v as f64,
            Some(other) => return Err(wrong_type(name, "number", other)),
        };
        if v.is_finite() && check(v) {
            Ok(v)
        } else {
            Err(RegistryError::validation(field(name), format!("must be {expect}")))
        }
    }

    pub fn bool_or(&self, name: &str, default: bool) -> Result<bool> {
        match self.params.get(name) {
            None => Ok(default),
            Some(ParamValue::Bool(v)) => Ok(*v),
            Some(other) => Err(wrong_type(name, "boolean", other)),
        }
    }
}

fn wrong_type(name: &str, expected: &str, got: &ParamValue) -> RegistryError {
    RegistryError::validation(
        field(name),
        format!("expected {expected}, got {}", got.type_name()),
    )
}

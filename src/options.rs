//! Typed translator configuration.
//!
//! Each translator publishes a vector of option specs (key, type, bounds,
//! default); raw key/value input is validated against that vector before the
//! translator is constructed. Unknown keys are rejected outright.

use std::collections::HashMap;
use std::error;
use std::fmt;

/// Option value types a translator may declare.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OptType {
    Bool,
    /// Integer with inclusive bounds.
    Int { min: i64, max: i64 },
    /// Percentage, 0..=100.
    Percent,
    /// Byte size (plain integer, no unit suffixes).
    Size,
    Str,
    Path,
    /// Semicolon-separated list of strings.
    StrList,
}

/// One configuration key a translator understands.
#[derive(Clone, Copy, Debug)]
pub struct OptSpec {
    pub key: &'static str,
    pub typ: OptType,
    pub default: &'static str,
    pub desc: &'static str,
}

/// A validated option value.
#[derive(Clone, Debug, PartialEq)]
pub enum OptValue {
    Bool(bool),
    Int(i64),
    Percent(f64),
    Size(u64),
    Str(String),
    List(Vec<String>),
}

/// Validation failures.
#[derive(Debug)]
pub enum OptionError {
    UnknownKey(String),
    BadValue { key: String, value: String, expected: &'static str },
    OutOfRange { key: String, value: i64, min: i64, max: i64 },
}

impl fmt::Display for OptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionError::UnknownKey(key) => write!(f, "unknown option key {key:?}"),
            OptionError::BadValue { key, value, expected } => {
                write!(f, "option {key:?}: {value:?} is not a valid {expected}")
            }
            OptionError::OutOfRange { key, value, min, max } => {
                write!(f, "option {key:?}: {value} outside [{min}, {max}]")
            }
        }
    }
}

impl error::Error for OptionError {}

fn parse_one(spec: &OptSpec, raw: &str) -> Result<OptValue, OptionError> {
    let bad = |expected| OptionError::BadValue {
        key: spec.key.to_string(),
        value: raw.to_string(),
        expected,
    };
    match spec.typ {
        OptType::Bool => match raw {
            "true" | "on" | "yes" | "1" => Ok(OptValue::Bool(true)),
            "false" | "off" | "no" | "0" => Ok(OptValue::Bool(false)),
            _ => Err(bad("boolean")),
        },
        OptType::Int { min, max } => {
            let v: i64 = raw.parse().map_err(|_| bad("integer"))?;
            if v < min || v > max {
                return Err(OptionError::OutOfRange { key: spec.key.to_string(), value: v, min, max });
            }
            Ok(OptValue::Int(v))
        }
        OptType::Percent => {
            let v: f64 = raw.parse().map_err(|_| bad("percentage"))?;
            if !(0.0..=100.0).contains(&v) {
                return Err(bad("percentage in 0..=100"));
            }
            Ok(OptValue::Percent(v))
        }
        OptType::Size => {
            let v: u64 = raw.parse().map_err(|_| bad("byte size"))?;
            Ok(OptValue::Size(v))
        }
        OptType::Str => Ok(OptValue::Str(raw.to_string())),
        OptType::Path => {
            if raw.is_empty() || !raw.starts_with('/') {
                return Err(bad("absolute path"));
            }
            Ok(OptValue::Str(raw.to_string()))
        }
        OptType::StrList => Ok(OptValue::List(
            raw.split(';').filter(|s| !s.is_empty()).map(str::to_string).collect(),
        )),
    }
}

/// A validated bag of options for one translator instance.
#[derive(Clone, Debug, Default)]
pub struct Options {
    values: HashMap<&'static str, OptValue>,
}

impl Options {
    /// Validate raw input against a spec vector. Every spec key receives its
    /// default when absent from the input; unknown input keys are rejected.
    pub fn validate(
        specs: &'static [OptSpec],
        raw: &HashMap<String, String>,
    ) -> Result<Options, OptionError> {
        for key in raw.keys() {
            if !specs.iter().any(|s| s.key == key) {
                return Err(OptionError::UnknownKey(key.clone()));
            }
        }
        let mut values = HashMap::with_capacity(specs.len());
        for spec in specs {
            let text = raw.get(spec.key).map(String::as_str).unwrap_or(spec.default);
            values.insert(spec.key, parse_one(spec, text)?);
        }
        Ok(Options { values })
    }

    /// All defaults for a spec vector.
    pub fn defaults(specs: &'static [OptSpec]) -> Options {
        Options::validate(specs, &HashMap::new()).expect("defaults must validate")
    }

    pub fn get_bool(&self, key: &str) -> bool {
        matches!(self.values.get(key), Some(OptValue::Bool(true)))
    }

    pub fn get_int(&self, key: &str) -> i64 {
        match self.values.get(key) {
            Some(OptValue::Int(v)) => *v,
            _ => 0,
        }
    }

    pub fn get_percent(&self, key: &str) -> f64 {
        match self.values.get(key) {
            Some(OptValue::Percent(v)) => *v,
            _ => 0.0,
        }
    }

    pub fn get_size(&self, key: &str) -> u64 {
        match self.values.get(key) {
            Some(OptValue::Size(v)) => *v,
            _ => 0,
        }
    }

    pub fn get_str(&self, key: &str) -> &str {
        match self.values.get(key) {
            Some(OptValue::Str(v)) => v,
            _ => "",
        }
    }

    pub fn get_list(&self, key: &str) -> &[String] {
        match self.values.get(key) {
            Some(OptValue::List(v)) => v,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPECS: &[OptSpec] = &[
        OptSpec { key: "cache-size", typ: OptType::Size, default: "131072", desc: "bytes" },
        OptSpec { key: "force", typ: OptType::Bool, default: "off", desc: "force mode" },
        OptSpec { key: "reserve", typ: OptType::Percent, default: "10", desc: "disk reserve" },
        OptSpec {
            key: "level",
            typ: OptType::Int { min: -1, max: 9 },
            default: "-1",
            desc: "compression level",
        },
        OptSpec { key: "filters", typ: OptType::StrList, default: "", desc: "glob filters" },
    ];

    fn raw(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn defaults_apply() {
        let opts = Options::defaults(SPECS);
        assert_eq!(opts.get_size("cache-size"), 131072);
        assert!(!opts.get_bool("force"));
        assert_eq!(opts.get_int("level"), -1);
        assert!(opts.get_list("filters").is_empty());
    }

    #[test]
    fn unknown_key_rejected() {
        let err = Options::validate(SPECS, &raw(&[("bogus", "1")])).unwrap_err();
        assert!(matches!(err, OptionError::UnknownKey(_)));
    }

    #[test]
    fn out_of_range_rejected() {
        let err = Options::validate(SPECS, &raw(&[("level", "12")])).unwrap_err();
        assert!(matches!(err, OptionError::OutOfRange { .. }));
        let err = Options::validate(SPECS, &raw(&[("reserve", "120")])).unwrap_err();
        assert!(matches!(err, OptionError::BadValue { .. }));
    }

    #[test]
    fn list_parsing() {
        let opts = Options::validate(SPECS, &raw(&[("filters", "*.log;;data/*")])).unwrap();
        assert_eq!(opts.get_list("filters"), &["*.log".to_string(), "data/*".to_string()]);
    }
}

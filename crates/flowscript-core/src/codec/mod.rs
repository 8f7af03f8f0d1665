//! State codec: live environment bindings to a persistable tagged-value tree
//! and back.
//!
//! Plain data and closures, named or literal, survive a capture. Facades and
//! opaque engine values are context-bound; they are dropped with a warning
//! and must be rebuilt from the flow context on the next request.

pub mod envelope;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{RestoreError, SandboxResult};
use crate::log::SharedLog;
use crate::sandbox::Environment;
use crate::value::{Closure, Scalar, Value};

pub use envelope::{digest_of, StateEnvelope};

/// Persistable form of one binding value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SerializedValue {
    Scalar {
        value: Scalar,
    },
    Char {
        value: char,
    },
    /// Infinite or NaN float, spelled the way `f64` prints it.
    NonFinite {
        value: String,
    },
    Sequence {
        items: Vec<SerializedValue>,
    },
    Mapping {
        entries: BTreeMap<String, SerializedValue>,
    },
    /// `name` is the engine's name for the function; literal closures
    /// carry a generated one that is replaced on restore.
    Closure {
        name: String,
        source: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        captured: Vec<SerializedValue>,
    },
}

impl SerializedValue {
    pub fn closure(name: impl Into<String>, source: impl Into<String>) -> Self {
        SerializedValue::Closure {
            name: name.into(),
            source: source.into(),
            captured: Vec::new(),
        }
    }
}

/// One top-level binding: its value and whether it was declared `const`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedEntry {
    #[serde(flatten)]
    pub value: SerializedValue,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub constant: bool,
}

/// Captured bindings of one environment, keyed by binding name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SerializedBinding(BTreeMap<String, SerializedEntry>);

impl SerializedBinding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&SerializedValue> {
        self.0.get(name).map(|entry| &entry.value)
    }

    pub fn is_constant(&self, name: &str) -> bool {
        self.0.get(name).is_some_and(|entry| entry.constant)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: SerializedValue) {
        self.0.insert(
            name.into(),
            SerializedEntry {
                value,
                constant: false,
            },
        );
    }

    pub fn insert_constant(&mut self, name: impl Into<String>, value: SerializedValue) {
        self.0.insert(
            name.into(),
            SerializedEntry {
                value,
                constant: true,
            },
        );
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SerializedValue)> {
        self.0.iter().map(|(name, entry)| (name, &entry.value))
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &SerializedEntry)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> BTreeMap<String, SerializedEntry> {
        self.0
    }
}

impl FromIterator<(String, SerializedValue)> for SerializedBinding {
    fn from_iter<I: IntoIterator<Item = (String, SerializedValue)>>(iter: I) -> Self {
        let mut binding = Self::new();
        for (name, value) in iter {
            binding.insert(name, value);
        }
        binding
    }
}

/// Captures and restores environment bindings.
pub struct StateCodec {
    log: SharedLog,
}

impl StateCodec {
    pub fn new(log: SharedLog) -> Self {
        Self { log }
    }

    /// Walk every binding of `environment`.
    pub fn capture(&self, environment: &Environment<'_>) -> SerializedBinding {
        let mut captured = SerializedBinding::new();
        for (name, value) in environment.bindings() {
            let Some(value) = self.capture_value(&name, &value) else {
                continue;
            };
            if environment.is_constant(&name) {
                captured.insert_constant(name, value);
            } else {
                captured.insert(name, value);
            }
        }
        tracing::debug!(
            event = "codec.captured",
            context_id = %environment.context_id(),
            bindings = captured.len(),
        );
        captured
    }

    /// Persistable form of `value`, or `None` when it cannot be persisted.
    /// `path` names the value in warnings (`user`, `items[2]`, `cfg.owner`).
    pub fn capture_value(&self, path: &str, value: &Value) -> Option<SerializedValue> {
        match value {
            Value::Scalar(Scalar::Float(x)) if !x.is_finite() => Some(SerializedValue::NonFinite {
                value: x.to_string(),
            }),
            Value::Scalar(Scalar::Char(c)) => Some(SerializedValue::Char { value: *c }),
            Value::Scalar(scalar) => Some(SerializedValue::Scalar {
                value: scalar.clone(),
            }),
            Value::Sequence(items) => Some(SerializedValue::Sequence {
                items: items
                    .iter()
                    .enumerate()
                    .filter_map(|(i, item)| self.capture_value(&format!("{path}[{i}]"), item))
                    .collect(),
            }),
            Value::Mapping(entries) => Some(SerializedValue::Mapping {
                entries: entries
                    .iter()
                    .filter_map(|(key, item)| {
                        Some((key.clone(), self.capture_value(&format!("{path}.{key}"), item)?))
                    })
                    .collect(),
            }),
            Value::Closure(closure) => {
                let captured = closure
                    .captured
                    .iter()
                    .enumerate()
                    .map(|(i, item)| self.capture_value(&format!("{path}<captured {i}>"), item))
                    .collect::<Option<Vec<_>>>();
                let Some(captured) = captured else {
                    self.log.warn(
                        "codec",
                        &format!("'{path}' captures a value that cannot be persisted; the closure is dropped"),
                    );
                    return None;
                };
                Some(SerializedValue::Closure {
                    name: closure.name.clone(),
                    source: closure.source.clone(),
                    captured,
                })
            }
            Value::Facade(facade) => {
                self.log.warn(
                    "codec",
                    &format!(
                        "'{path}' holds a {} facade and is not persisted; rebuild it from the flow context",
                        facade.type_id()
                    ),
                );
                None
            }
            Value::Opaque(type_name) => {
                self.log.warn(
                    "codec",
                    &format!("'{path}' holds an engine value of type {type_name} and is not persisted"),
                );
                None
            }
        }
    }

    /// Bind every captured entry into `environment`, recompiling closures in
    /// it. Every entry is decoded before anything is bound, and a failure
    /// while binding rolls `environment` back, so it is never left holding
    /// part of the state.
    pub fn restore(
        &self,
        serialized: &SerializedBinding,
        environment: &mut Environment<'_>,
    ) -> SandboxResult<()> {
        let entries = serialized
            .entries()
            .map(|(name, entry)| Ok((name.clone(), Self::restore_value(&entry.value)?, entry.constant)))
            .collect::<Result<Vec<_>, RestoreError>>()?;
        environment.bind_all(entries)
    }

    /// Live form of a captured value. Closures carry their source only; they
    /// become callable once bound into an environment.
    pub fn restore_value(value: &SerializedValue) -> Result<Value, RestoreError> {
        Ok(match value {
            SerializedValue::Scalar { value } => Value::Scalar(value.clone()),
            SerializedValue::Char { value } => Value::from(*value),
            SerializedValue::NonFinite { value } => match value.parse::<f64>() {
                Ok(x) if !x.is_finite() => Value::from(x),
                _ => {
                    return Err(RestoreError::Malformed(format!(
                        "'{value}' is not a non-finite float"
                    )))
                }
            },
            SerializedValue::Sequence { items } => Value::Sequence(
                items
                    .iter()
                    .map(Self::restore_value)
                    .collect::<Result<_, _>>()?,
            ),
            SerializedValue::Mapping { entries } => Value::Mapping(
                entries
                    .iter()
                    .map(|(key, item)| Ok((key.clone(), Self::restore_value(item)?)))
                    .collect::<Result<_, RestoreError>>()?,
            ),
            SerializedValue::Closure {
                name,
                source,
                captured,
            } => Value::Closure(Closure {
                captured: captured
                    .iter()
                    .map(Self::restore_value)
                    .collect::<Result<_, _>>()?,
                ..Closure::named(name.clone(), source.clone())
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::context::InMemoryFlowContext;
    use crate::facade::{FacadeRef, FlowFacade};
    use crate::log::RecordingLog;

    fn codec() -> (StateCodec, Arc<RecordingLog>) {
        let log = Arc::new(RecordingLog::new());
        (StateCodec::new(log.clone()), log)
    }

    #[test]
    fn test_serialized_form_is_tagged() {
        let value = SerializedValue::Sequence {
            items: vec![
                SerializedValue::Scalar {
                    value: Scalar::Int(1),
                },
                SerializedValue::closure("f", "fn f() { 1 }"),
                SerializedValue::Char { value: 'c' },
            ],
        };
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "sequence",
                "items": [
                    { "type": "scalar", "value": 1 },
                    { "type": "closure", "name": "f", "source": "fn f() { 1 }" },
                    { "type": "char", "value": "c" }
                ]
            })
        );
        let back: SerializedValue = serde_json::from_value(json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_binding_serialises_as_plain_map() {
        let mut binding: SerializedBinding = [(
            "x".to_string(),
            SerializedValue::Scalar {
                value: Scalar::Int(5),
            },
        )]
        .into_iter()
        .collect();
        let json = serde_json::to_string(&binding).unwrap();
        assert_eq!(json, r#"{"x":{"type":"scalar","value":5}}"#);

        binding.insert_constant(
            "LIMIT",
            SerializedValue::Scalar {
                value: Scalar::Int(3),
            },
        );
        let json = serde_json::to_string(&binding).unwrap();
        assert_eq!(
            json,
            r#"{"LIMIT":{"type":"scalar","value":3,"constant":true},"x":{"type":"scalar","value":5}}"#
        );
        let back: SerializedBinding = serde_json::from_str(&json).unwrap();
        assert!(back.is_constant("LIMIT"));
        assert!(!back.is_constant("x"));
        assert_eq!(back, binding);
    }

    #[test]
    fn test_facade_dropped_inside_mapping_with_warning() {
        let (codec, log) = codec();
        let ctx = InMemoryFlowContext::new("carbon.super").into_shared();
        let facade = FacadeRef::new(FlowFacade::new(ctx, log.clone()));
        let value = Value::Mapping(BTreeMap::from([
            ("keep".to_string(), Value::from(1i64)),
            ("ctx".to_string(), Value::Facade(facade)),
        ]));

        let Some(SerializedValue::Mapping { entries }) = codec.capture_value("cfg", &value) else {
            panic!("expected a mapping");
        };
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key("keep"));
        assert_eq!(log.warning_count(), 1);
        assert!(log.entries()[0].message.contains("cfg.ctx"));
    }

    #[test]
    fn test_opaque_dropped_from_sequence() {
        let (codec, log) = codec();
        let value = Value::Sequence(vec![Value::Opaque("range".into()), Value::from("a")]);
        let Some(SerializedValue::Sequence { items }) = codec.capture_value("xs", &value) else {
            panic!("expected a sequence");
        };
        assert_eq!(items.len(), 1);
        assert_eq!(log.warning_count(), 1);
    }

    #[test]
    fn test_closure_capturing_a_facade_is_dropped() {
        let (codec, log) = codec();
        let ctx = InMemoryFlowContext::new("carbon.super").into_shared();
        let facade = FacadeRef::new(FlowFacade::new(ctx, log.clone()));
        let closure = Closure {
            captured: vec![Value::Facade(facade)],
            ..Closure::named("anon$01", "|n| n + ctx.tenantDomain")
        };
        assert!(codec.capture_value("greet", &Value::Closure(closure)).is_none());
        assert!(log
            .entries()
            .iter()
            .any(|e| e.message.contains("'greet' captures a value")));
    }

    #[test]
    fn test_non_finite_floats_are_tagged() {
        let (codec, log) = codec();
        for x in [f64::INFINITY, f64::NEG_INFINITY] {
            let captured = codec.capture_value("v", &Value::from(x)).unwrap();
            let json = serde_json::to_string(&captured).unwrap();
            let back: SerializedValue = serde_json::from_str(&json).unwrap();
            assert_eq!(StateCodec::restore_value(&back).unwrap(), Value::from(x));
        }
        let nan = codec.capture_value("v", &Value::from(f64::NAN)).unwrap();
        let Value::Scalar(Scalar::Float(x)) = StateCodec::restore_value(&nan).unwrap() else {
            panic!("expected a float");
        };
        assert!(x.is_nan());
        assert_eq!(log.warning_count(), 0);

        let bogus = SerializedValue::NonFinite {
            value: "1.5".into(),
        };
        assert!(matches!(
            StateCodec::restore_value(&bogus),
            Err(RestoreError::Malformed(_))
        ));
    }

    #[test]
    fn test_restore_value_mirrors_capture() {
        let (codec, _) = codec();
        let value = Value::Mapping(BTreeMap::from([
            ("n".to_string(), Value::from(2.5)),
            ("c".to_string(), Value::from('q')),
            ("tags".to_string(), Value::from(vec!["a".to_string()])),
        ]));
        let captured = codec.capture_value("v", &value).unwrap();
        assert_eq!(StateCodec::restore_value(&captured).unwrap(), value);
    }
}

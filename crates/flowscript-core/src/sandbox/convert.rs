//! Conversion between engine values and host [`Value`]s.

use std::collections::BTreeMap;

use rhai::{Array, Dynamic, EvalAltResult, FnPtr, Map};

use crate::facade::FacadeRef;
use crate::value::{Closure, Scalar, Value};

/// Engine value to host value.
///
/// `functions` resolves function pointers, named or anonymous, to their
/// recorded closures; curried arguments come along as captured values. A
/// pointer to anything unrecorded becomes [`Value::Opaque`].
pub(crate) fn to_value(value: &Dynamic, functions: &BTreeMap<String, Closure>) -> Value {
    let value = value.flatten_clone();
    if value.is_unit() {
        return Value::absent();
    }
    if let Ok(b) = value.as_bool() {
        return Value::from(b);
    }
    if let Ok(n) = value.as_int() {
        return Value::from(n);
    }
    if let Ok(x) = value.as_float() {
        return Value::from(x);
    }
    if let Ok(c) = value.as_char() {
        return Value::from(c);
    }
    if value.is_string() {
        return match value.into_string() {
            Ok(s) => Value::text(s),
            Err(type_name) => Value::Opaque(type_name.to_string()),
        };
    }
    if value.is_array() {
        let type_name = value.type_name();
        return match value.into_array() {
            Ok(items) => Value::Sequence(items.iter().map(|item| to_value(item, functions)).collect()),
            Err(_) => Value::Opaque(type_name.to_string()),
        };
    }
    if value.is_map() {
        let type_name = value.type_name();
        return match value.try_cast::<Map>() {
            Some(map) => Value::Mapping(
                map.iter()
                    .map(|(key, item)| (key.to_string(), to_value(item, functions)))
                    .collect(),
            ),
            None => Value::Opaque(type_name.to_string()),
        };
    }
    if value.is::<FnPtr>() {
        let pointer = value.clone_cast::<FnPtr>();
        return match functions.get(pointer.fn_name()) {
            Some(closure) => Value::Closure(Closure {
                captured: pointer
                    .curry()
                    .iter()
                    .map(|item| to_value(item, functions))
                    .collect(),
                ..closure.clone()
            }),
            None => Value::Opaque(format!("Fn({})", pointer.fn_name())),
        };
    }
    if value.is::<FacadeRef>() {
        return Value::Facade(value.clone_cast::<FacadeRef>());
    }
    Value::Opaque(value.type_name().to_string())
}

/// Host value to engine value, turning every closure into an engine value
/// through `closure`. Opaque values have no engine form and become unit.
pub(crate) fn to_dynamic_with<E, F>(value: &Value, closure: &mut F) -> Result<Dynamic, E>
where
    F: FnMut(&Closure) -> Result<Dynamic, E>,
{
    Ok(match value {
        Value::Scalar(Scalar::Null) | Value::Opaque(_) => Dynamic::UNIT,
        Value::Scalar(Scalar::Bool(b)) => Dynamic::from_bool(*b),
        Value::Scalar(Scalar::Int(n)) => Dynamic::from_int(*n),
        Value::Scalar(Scalar::Float(x)) => Dynamic::from_float(*x),
        Value::Scalar(Scalar::Text(s)) => Dynamic::from(s.clone()),
        Value::Scalar(Scalar::Char(c)) => Dynamic::from_char(*c),
        Value::Sequence(items) => {
            let array = items
                .iter()
                .map(|item| to_dynamic_with(item, &mut *closure))
                .collect::<Result<Array, E>>()?;
            Dynamic::from_array(array)
        }
        Value::Mapping(entries) => {
            let mut map = Map::new();
            for (key, item) in entries {
                map.insert(key.as_str().into(), to_dynamic_with(item, &mut *closure)?);
            }
            Dynamic::from_map(map)
        }
        Value::Closure(c) => closure(c)?,
        Value::Facade(facade) => Dynamic::from(facade.clone()),
    })
}

/// Host value to engine value for callers with no function library. Named
/// closures become pointers by name; anonymous ones cannot be expressed.
pub(crate) fn to_dynamic(value: &Value) -> Result<Dynamic, Box<EvalAltResult>> {
    to_dynamic_with(value, &mut |closure: &Closure| {
        let captured = closure
            .captured
            .iter()
            .map(to_dynamic)
            .collect::<Result<Vec<_>, _>>()?;
        pointer(&closure.name, captured)
    })
}

/// Pointer to the named function `name` with `captured` curried in.
pub(crate) fn pointer(name: &str, captured: Vec<Dynamic>) -> Result<Dynamic, Box<EvalAltResult>> {
    let mut pointer = FnPtr::new(name)?;
    for value in captured {
        pointer.add_curry(value);
    }
    Ok(Dynamic::from(pointer))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_functions() -> BTreeMap<String, Closure> {
        BTreeMap::new()
    }

    #[test]
    fn test_plain_data_survives_both_directions() {
        let value = Value::Mapping(BTreeMap::from([
            ("n".to_string(), Value::from(5i64)),
            ("x".to_string(), Value::from(1.5)),
            ("ok".to_string(), Value::from(true)),
            ("c".to_string(), Value::from('z')),
            (
                "list".to_string(),
                Value::Sequence(vec![Value::from("a"), Value::absent()]),
            ),
        ]));
        let dynamic = to_dynamic(&value).unwrap();
        assert_eq!(to_value(&dynamic, &no_functions()), value);
    }

    #[test]
    fn test_char_stays_char() {
        assert_eq!(to_value(&Dynamic::from_char('x'), &no_functions()), Value::from('x'));
        assert_eq!(to_dynamic(&Value::from('x')).unwrap().as_char(), Ok('x'));
    }

    #[test]
    fn test_function_pointer_resolution() {
        let closure = Closure {
            params: vec!["n".into()],
            ..Closure::named("greet", "fn greet(n) { n }")
        };
        let functions = BTreeMap::from([("greet".to_string(), closure.clone())]);

        let known = Dynamic::from(FnPtr::new("greet").unwrap());
        assert_eq!(to_value(&known, &functions), Value::Closure(closure));

        let unknown = Dynamic::from(FnPtr::new("other").unwrap());
        assert_eq!(
            to_value(&unknown, &functions),
            Value::Opaque("Fn(other)".into())
        );
    }

    #[test]
    fn test_curried_arguments_become_captured_values() {
        let functions = BTreeMap::from([(
            "add".to_string(),
            Closure::named("add", "fn add(a, b) { a + b }"),
        )]);
        let curried = pointer("add", vec![Dynamic::from_int(3)]).unwrap();

        let Value::Closure(closure) = to_value(&curried, &functions) else {
            panic!("expected a closure");
        };
        assert_eq!(closure.captured, vec![Value::from(3i64)]);

        let back = to_dynamic(&Value::Closure(closure)).unwrap().cast::<FnPtr>();
        assert_eq!(back.fn_name(), "add");
        assert_eq!(back.curry().len(), 1);
    }

    #[test]
    fn test_opaque_becomes_unit() {
        let dynamic = to_dynamic(&Value::Opaque("range".into())).unwrap();
        assert!(dynamic.is_unit());
    }
}

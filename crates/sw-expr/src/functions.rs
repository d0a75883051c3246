//! Built-in functions
//!
//! - `length(x)` / `len(x)`
//! - `to_string(x)` / `str(x)`
//! - `to_int(x)` / `int(x)`
//! - `to_float(x)` / `float(x)`
//! - `to_bool(x)` / `bool(x)`
//! - `range(stop)`, `range(start, stop)`, `range(start, stop, step)`
//!
//! The conversions and `length` are registered as filters too.

use crate::value::{as_number, is_truthy, to_display, type_name, Num};
use minijinja::value::{Value, ValueKind};
use minijinja::{Environment, Error, ErrorKind};
use std::fmt::Display;

/// Upper bound on the number of elements `range` (or a counted loop) may
/// produce
pub const MAX_RANGE_LEN: usize = 100_000;

/// Names that resolve from the environment rather than the scope
const GLOBALS: &[&str] = &[
    "length",
    "len",
    "to_string",
    "str",
    "to_int",
    "int",
    "to_float",
    "float",
    "to_bool",
    "bool",
    "range",
    "null",
];

pub(crate) fn is_global(name: &str) -> bool {
    GLOBALS.contains(&name)
}

/// Register functions, filters and globals with an environment
pub(crate) fn register(env: &mut Environment<'static>) {
    env.add_function("length", length);
    env.add_function("len", length);
    env.add_function("to_string", to_string);
    env.add_function("str", to_string);
    env.add_function("to_int", to_int);
    env.add_function("int", to_int);
    env.add_function("to_float", to_float);
    env.add_function("float", to_float);
    env.add_function("to_bool", to_bool);
    env.add_function("bool", to_bool);
    env.add_function("range", range);

    env.add_filter("length", length);
    env.add_filter("to_string", to_string);
    env.add_filter("to_int", to_int);
    env.add_filter("to_float", to_float);
    env.add_filter("to_bool", to_bool);

    env.add_global("null", Value::from(()));
}

fn invalid(function: &str, message: impl Display) -> Error {
    Error::new(
        ErrorKind::InvalidOperation,
        format!("invalid argument to {}: {}", function, message),
    )
}

fn as_json(function: &str, value: &Value) -> Result<serde_json::Value, Error> {
    serde_json::to_value(value).map_err(|e| invalid(function, e))
}

fn length(value: Value) -> Result<usize, Error> {
    match value.kind() {
        ValueKind::String => Ok(value.as_str().map(|s| s.chars().count()).unwrap_or(0)),
        ValueKind::Seq | ValueKind::Map => value
            .len()
            .ok_or_else(|| invalid("length", "value has no length")),
        kind => Err(invalid("length", format!("{} has no length", kind))),
    }
}

fn to_string(value: Value) -> Result<String, Error> {
    Ok(to_display(&as_json("to_string", &value)?))
}

fn to_int(value: Value) -> Result<i64, Error> {
    let json = as_json("to_int", &value)?;
    if let serde_json::Value::Bool(b) = json {
        return Ok(i64::from(b));
    }
    match as_number(&json) {
        Some(Num::Int(i)) => Ok(i),
        Some(Num::Float(f)) if f.abs() < i64::MAX as f64 => Ok(f.trunc() as i64),
        _ => Err(invalid(
            "to_int",
            format!("cannot convert {} '{}' to int", type_name(&json), to_display(&json)),
        )),
    }
}

fn to_float(value: Value) -> Result<f64, Error> {
    let json = as_json("to_float", &value)?;
    match json {
        serde_json::Value::Bool(b) => Ok(f64::from(u8::from(b))),
        _ => as_number(&json).map(Num::as_f64).ok_or_else(|| {
            invalid(
                "to_float",
                format!("cannot convert {} '{}' to float", type_name(&json), to_display(&json)),
            )
        }),
    }
}

fn to_bool(value: Value) -> Result<bool, Error> {
    Ok(is_truthy(&as_json("to_bool", &value)?))
}

fn range(first: i64, stop: Option<i64>, step: Option<i64>) -> Result<Value, Error> {
    let (start, stop) = match stop {
        Some(stop) => (first, stop),
        None => (0, first),
    };
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(invalid("range", "step must not be zero"));
    }

    let mut items = Vec::new();
    let mut current = start;
    while (step > 0 && current < stop) || (step < 0 && current > stop) {
        if items.len() >= MAX_RANGE_LEN {
            return Err(invalid("range", format!("more than {} elements", MAX_RANGE_LEN)));
        }
        items.push(current);
        current = match current.checked_add(step) {
            Some(next) => next,
            None => break,
        };
    }
    Ok(Value::from(items))
}

#[cfg(test)]
mod tests {
    use crate::{evaluate, EmptyScope, ExprError};
    use serde_json::json;
    use sw_core::ErrorKind;

    fn eval(src: &str) -> Result<serde_json::Value, ExprError> {
        evaluate(src, &EmptyScope)
    }

    #[test]
    fn test_length() {
        assert_eq!(eval("length('héllo')").unwrap(), json!(5));
        assert_eq!(eval("len([1, 2])").unwrap(), json!(2));
        assert_eq!(eval("length({'a': 1})").unwrap(), json!(1));
        assert_eq!(eval("[1, 2, 3] | length").unwrap(), json!(3));
        assert_eq!(eval("length(3)").unwrap_err().kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn test_conversions() {
        assert_eq!(eval("to_int('42')").unwrap(), json!(42));
        assert_eq!(eval("int(3.9)").unwrap(), json!(3));
        assert_eq!(eval("int(true)").unwrap(), json!(1));
        assert_eq!(eval("to_float('2.5')").unwrap(), json!(2.5));
        assert_eq!(eval("to_string(7)").unwrap(), json!("7"));
        assert_eq!(eval("to_bool('off')").unwrap(), json!(false));
        assert_eq!(eval("' 12 ' | to_int").unwrap(), json!(12));
        assert!(matches!(
            eval("to_int('abc')"),
            Err(ExprError::TypeMismatch { message }) if message.contains("to_int")
        ));
    }

    #[test]
    fn test_range() {
        assert_eq!(eval("range(3)").unwrap(), json!([0, 1, 2]));
        assert_eq!(eval("range(1, 4)").unwrap(), json!([1, 2, 3]));
        assert_eq!(eval("range(5, 0, -2)").unwrap(), json!([5, 3, 1]));
        assert!(eval("range(1, 2, 0)").is_err());
        assert!(eval("range(0, 1000000)").is_err());
    }

    #[test]
    fn test_unknown_function() {
        assert_eq!(
            eval("explode(1)"),
            Err(ExprError::UnknownFunction {
                name: "explode".into()
            })
        );
    }
}

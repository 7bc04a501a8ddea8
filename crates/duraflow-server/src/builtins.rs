// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Built-in function library.

use duraflow_core::functions::{FunctionError, FunctionRegistry, ResolveError, positional};
use serde_json::{Map, Value};

/// Register `math.add`, `math.multiply`, `math.subtract`, `text.concat` and `text.upper`.
pub fn register(registry: &mut FunctionRegistry) -> Result<(), ResolveError> {
    registry.register("math.add", add)?;
    registry.register("math.multiply", multiply)?;
    registry.register("math.subtract", subtract)?;
    registry.register("text.concat", concat)?;
    registry.register("text.upper", upper)?;
    Ok(())
}

/// Registry holding only the built-ins.
pub fn registry() -> Result<FunctionRegistry, ResolveError> {
    let mut registry = FunctionRegistry::new();
    register(&mut registry)?;
    Ok(registry)
}

fn number(args: &[Value], index: usize) -> Result<&serde_json::Number, FunctionError> {
    match positional(args, index)? {
        Value::Number(n) => Ok(n),
        other => Err(FunctionError::new(format!(
            "argument {} must be a number, got {}",
            index, other
        ))),
    }
}

/// Apply an integer operation when both operands are integers, a float one otherwise.
fn arithmetic(
    args: &[Value],
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, FunctionError> {
    let (a, b) = (number(args, 0)?, number(args, 1)?);
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return int_op(a, b)
            .map(Value::from)
            .ok_or_else(|| FunctionError::new("integer overflow"));
    }
    let (a, b) = (a.as_f64().unwrap_or_default(), b.as_f64().unwrap_or_default());
    serde_json::Number::from_f64(float_op(a, b))
        .map(Value::Number)
        .ok_or_else(|| FunctionError::new("result is not a finite number"))
}

fn add(args: &[Value], _kwargs: &Map<String, Value>) -> Result<Value, FunctionError> {
    arithmetic(args, i64::checked_add, |a, b| a + b)
}

fn multiply(args: &[Value], _kwargs: &Map<String, Value>) -> Result<Value, FunctionError> {
    arithmetic(args, i64::checked_mul, |a, b| a * b)
}

fn subtract(args: &[Value], _kwargs: &Map<String, Value>) -> Result<Value, FunctionError> {
    arithmetic(args, i64::checked_sub, |a, b| a - b)
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Join every positional argument, with an optional `sep` keyword argument.
fn concat(args: &[Value], kwargs: &Map<String, Value>) -> Result<Value, FunctionError> {
    let separator = match kwargs.get("sep") {
        None => String::new(),
        Some(Value::String(sep)) => sep.clone(),
        Some(other) => {
            return Err(FunctionError::new(format!(
                "sep must be a string, got {}",
                other
            )));
        }
    };
    let parts: Vec<String> = args.iter().map(text).collect();
    Ok(Value::String(parts.join(&separator)))
}

fn upper(args: &[Value], _kwargs: &Map<String, Value>) -> Result<Value, FunctionError> {
    match positional(args, 0)? {
        Value::String(s) => Ok(Value::String(s.to_uppercase())),
        other => Err(FunctionError::new(format!(
            "argument 0 must be a string, got {}",
            other
        ))),
    }
}

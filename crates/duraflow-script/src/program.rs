// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Program type definitions.
//!
//! A program is a JSON document with a list of steps, discriminated by the
//! `stepType` field, and an output operand evaluated once every step has run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ScriptError;

/// A parsed step program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Program {
    /// Steps run in order.
    pub steps: Vec<ScriptStep>,

    /// Program result; `null` when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Operand>,
}

impl Program {
    /// Parse a program from its JSON source.
    pub fn parse(source: &str) -> Result<Self, ScriptError> {
        serde_json::from_str(source).map_err(|e| ScriptError::Parse(e.to_string()))
    }

    /// Short names of every function the program calls, in first-use order.
    pub fn called_functions(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for step in &self.steps {
            for call in step.calls() {
                if !names.contains(&call.function.as_str()) {
                    names.push(&call.function);
                }
            }
        }
        names
    }
}

/// Union of all step types, discriminated by the stepType field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stepType")]
pub enum ScriptStep {
    /// Issue several calls at one suspension point and bind their results as an array
    Gather(GatherStep),

    /// Issue one call and bind its result
    Call(CallStep),

    /// Bind the value of an operand
    Assign(AssignStep),
}

impl ScriptStep {
    /// Variable the step binds.
    pub fn id(&self) -> &str {
        match self {
            ScriptStep::Gather(step) => &step.id,
            ScriptStep::Call(step) => &step.id,
            ScriptStep::Assign(step) => &step.id,
        }
    }

    /// Calls issued by the step.
    pub fn calls(&self) -> &[CallSpec] {
        match self {
            ScriptStep::Gather(step) => &step.calls,
            ScriptStep::Call(step) => std::slice::from_ref(&step.call),
            ScriptStep::Assign(_) => &[],
        }
    }
}

/// Calls awaited together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatherStep {
    /// Variable receiving the array of results, in call order.
    pub id: String,
    /// Calls issued at this step.
    pub calls: Vec<CallSpec>,
}

/// A single awaited call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallStep {
    /// Variable receiving the result.
    pub id: String,
    /// The call.
    pub call: CallSpec,
}

/// Immediate binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignStep {
    /// Variable receiving the value.
    pub id: String,
    /// Value to bind.
    pub value: Operand,
}

/// An external function invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSpec {
    /// Short function name.
    pub function: String,

    /// Positional arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Operand>,

    /// Keyword arguments.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kwargs: BTreeMap<String, Operand>,
}

/// A value expression.
///
/// - `{"ref": "x.items.0"}` reads a variable, indexing into objects and arrays
/// - `{"op": "sum", "of": [...]}` combines operands
/// - anything else is a literal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    /// Variable reference.
    Ref(RefOperand),
    /// Operator application.
    Op(OpOperand),
    /// Literal JSON value.
    Literal(Value),
}

/// `{"ref": "path"}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RefOperand {
    /// Dotted path; the first segment names a variable.
    #[serde(rename = "ref")]
    pub path: String,
}

/// `{"op": "...", "of": [...]}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpOperand {
    /// Operator.
    pub op: OpKind,
    /// Operands.
    #[serde(default)]
    pub of: Vec<Operand>,
}

/// Supported operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    /// Numeric sum; array operands contribute their elements.
    Sum,
    /// Concatenation of arrays, or of strings.
    Concat,
    /// Array of the operand values.
    List,
}

impl Operand {
    /// Evaluate against the bound variables.
    pub fn eval(&self, variables: &Map<String, Value>) -> Result<Value, ScriptError> {
        match self {
            Operand::Literal(value) => Ok(value.clone()),
            Operand::Ref(RefOperand { path }) => lookup(variables, path),
            Operand::Op(OpOperand { op, of }) => {
                let values = of
                    .iter()
                    .map(|operand| operand.eval(variables))
                    .collect::<Result<Vec<_>, _>>()?;
                match op {
                    OpKind::Sum => sum(values),
                    OpKind::Concat => concat(values),
                    OpKind::List => Ok(Value::Array(values)),
                }
            }
        }
    }
}

fn lookup(variables: &Map<String, Value>, path: &str) -> Result<Value, ScriptError> {
    let mut segments = path.split('.');
    let name = segments.next().unwrap_or_default();
    let mut current = variables
        .get(name)
        .ok_or_else(|| ScriptError::UndefinedVariable(name.to_string()))?;

    for segment in segments {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        current = next.ok_or_else(|| ScriptError::BadPath(path.to_string()))?;
    }
    Ok(current.clone())
}

fn sum(values: Vec<Value>) -> Result<Value, ScriptError> {
    let mut numbers = Vec::new();
    for value in values {
        match value {
            Value::Array(items) => numbers.extend(items),
            other => numbers.push(other),
        }
    }

    let mut int_total: i64 = 0;
    let mut float_total: f64 = 0.0;
    let mut integral = true;
    for number in &numbers {
        let Value::Number(n) = number else {
            return Err(ScriptError::BadOperand(format!(
                "sum expects numbers, got {}",
                number
            )));
        };
        match n.as_i64() {
            Some(i) if integral => {
                int_total = int_total
                    .checked_add(i)
                    .ok_or_else(|| ScriptError::BadOperand("sum overflow".to_string()))?;
            }
            _ => {
                if integral {
                    float_total = int_total as f64;
                    integral = false;
                }
                float_total += n.as_f64().unwrap_or_default();
            }
        }
    }

    if integral {
        Ok(Value::from(int_total))
    } else {
        serde_json::Number::from_f64(float_total)
            .map(Value::Number)
            .ok_or_else(|| ScriptError::BadOperand("sum is not a finite number".to_string()))
    }
}

fn concat(values: Vec<Value>) -> Result<Value, ScriptError> {
    if values.iter().all(Value::is_string) && !values.is_empty() {
        let joined: String = values.iter().filter_map(Value::as_str).collect();
        return Ok(Value::String(joined));
    }

    let mut items = Vec::new();
    for value in values {
        match value {
            Value::Array(inner) => items.extend(inner),
            other => {
                return Err(ScriptError::BadOperand(format!(
                    "concat expects arrays or strings, got {}",
                    other
                )));
            }
        }
    }
    Ok(Value::Array(items))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> Map<String, Value> {
        json!({
            "x": 4,
            "user": {"name": "ada", "tags": ["a", "b"]},
            "results": [1, 2, 3],
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn operand(value: Value) -> Operand {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_parse_steps() {
        let program = Program::parse(
            r#"{
                "steps": [
                    {"stepType": "Gather", "id": "r", "calls": [
                        {"function": "add", "args": [1, 2]},
                        {"function": "mul", "args": [{"ref": "x"}, 2]}
                    ]},
                    {"stepType": "Call", "id": "s", "call": {"function": "add", "kwargs": {"a": 1}}},
                    {"stepType": "Assign", "id": "t", "value": {"op": "list", "of": [1]}}
                ],
                "output": {"ref": "t"}
            }"#,
        )
        .unwrap();

        assert_eq!(program.steps.len(), 3);
        assert_eq!(program.steps[0].id(), "r");
        assert_eq!(program.steps[0].calls().len(), 2);
        assert_eq!(program.steps[1].calls()[0].kwargs["a"], Operand::Literal(json!(1)));
        assert!(program.steps[2].calls().is_empty());
        assert_eq!(program.called_functions(), vec!["add", "mul"]);
    }

    #[test]
    fn test_parse_rejects_unknown_step_type() {
        let err = Program::parse(r#"{"steps": [{"stepType": "Loop", "id": "x"}]}"#).unwrap_err();
        assert!(matches!(err, ScriptError::Parse(_)));
    }

    #[test]
    fn test_operand_kinds() {
        assert!(matches!(operand(json!({"ref": "x"})), Operand::Ref(_)));
        assert!(matches!(
            operand(json!({"op": "sum", "of": []})),
            Operand::Op(_)
        ));
        assert!(matches!(operand(json!({"ref": "x", "extra": 1})), Operand::Literal(_)));
        assert!(matches!(operand(json!([1, 2])), Operand::Literal(_)));
    }

    #[test]
    fn test_ref_paths() {
        let vars = vars();
        assert_eq!(operand(json!({"ref": "x"})).eval(&vars).unwrap(), json!(4));
        assert_eq!(
            operand(json!({"ref": "user.tags.1"})).eval(&vars).unwrap(),
            json!("b")
        );
        assert!(matches!(
            operand(json!({"ref": "nope"})).eval(&vars),
            Err(ScriptError::UndefinedVariable(name)) if name == "nope"
        ));
        assert!(matches!(
            operand(json!({"ref": "user.tags.9"})).eval(&vars),
            Err(ScriptError::BadPath(_))
        ));
    }

    #[test]
    fn test_sum() {
        let vars = vars();
        assert_eq!(
            operand(json!({"op": "sum", "of": [{"ref": "results"}, {"ref": "x"}]}))
                .eval(&vars)
                .unwrap(),
            json!(10)
        );
        assert_eq!(
            operand(json!({"op": "sum", "of": [1, 0.5]})).eval(&vars).unwrap(),
            json!(1.5)
        );
        assert!(matches!(
            operand(json!({"op": "sum", "of": ["a"]})).eval(&vars),
            Err(ScriptError::BadOperand(_))
        ));
    }

    #[test]
    fn test_concat_and_list() {
        let vars = vars();
        assert_eq!(
            operand(json!({"op": "concat", "of": [{"ref": "results"}, {"op": "list", "of": [{"ref": "x"}]}]}))
                .eval(&vars)
                .unwrap(),
            json!([1, 2, 3, 4])
        );
        assert_eq!(
            operand(json!({"op": "concat", "of": ["ab", {"ref": "user.name"}]}))
                .eval(&vars)
                .unwrap(),
            json!("abada")
        );
        assert!(matches!(
            operand(json!({"op": "concat", "of": [[1], 2]})).eval(&vars),
            Err(ScriptError::BadOperand(_))
        ));
    }
}

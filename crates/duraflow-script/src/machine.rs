// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step program interpreter.
//!
//! A [`Machine`] walks the program's steps. `Assign` steps run immediately; `Call`
//! and `Gather` steps issue their calls one `Blocked` step at a time and then
//! suspend until the orchestrator resumes them with every result.
//!
//! ```text
//!  Ready ──Start──► run ──► Issuing ──Future──► ... ──► Waiting ──Results──► run
//!                    │                                                        │
//!                    └──────────────────────► Finished ◄───────────────────────┘
//! ```

use std::collections::{BTreeMap, BTreeSet};

use duraflow_core::engine::{
    Continuation, ContinuationEngine, EngineError, ExternalCall, Resume, Step,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::ScriptError;
use crate::program::{CallSpec, Program, ScriptStep};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
enum Phase {
    Ready,
    Issuing { calls: Vec<ExternalCall>, issued: usize },
    Waiting { pending: Vec<i64> },
    Finished,
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Ready => "ready",
            Phase::Issuing { .. } => "issuing calls",
            Phase::Waiting { .. } => "waiting for results",
            Phase::Finished => "finished",
        }
    }
}

/// A running step program. Its serde_json encoding is the snapshot format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    program: Program,
    allowed: BTreeSet<String>,
    variables: Map<String, Value>,
    pc: usize,
    next_call_id: i64,
    phase: Phase,
}

impl Machine {
    /// Create a machine that has not started yet.
    pub fn new(
        program: Program,
        external_functions: &[String],
        inputs: &Map<String, Value>,
    ) -> Self {
        Self {
            program,
            allowed: external_functions.iter().cloned().collect(),
            variables: inputs.clone(),
            pc: 0,
            next_call_id: 0,
            phase: Phase::Ready,
        }
    }

    /// Restore a machine from [`Machine::snapshot`] bytes.
    pub fn restore(snapshot: &[u8]) -> Result<Self, ScriptError> {
        serde_json::from_slice(snapshot).map_err(|e| ScriptError::Snapshot(e.to_string()))
    }

    /// Serialize the whole machine.
    pub fn snapshot(&self) -> Result<Vec<u8>, ScriptError> {
        serde_json::to_vec(self).map_err(|e| ScriptError::Snapshot(e.to_string()))
    }

    /// Bound variables, inputs included.
    pub fn variables(&self) -> &Map<String, Value> {
        &self.variables
    }

    /// Whether the program has produced its output.
    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Finished
    }

    /// Advance the program.
    pub fn step(&mut self, input: Resume) -> Result<Step, ScriptError> {
        match input {
            Resume::Start => {
                if self.phase != Phase::Ready {
                    return Err(ScriptError::WrongPhase {
                        input: "start",
                        phase: self.phase.name(),
                    });
                }
                self.run()
            }
            Resume::Future => self.issue_next(),
            Resume::Results(results) => self.resume_with(results),
        }
    }

    fn run(&mut self) -> Result<Step, ScriptError> {
        while let Some(step) = self.program.steps.get(self.pc) {
            match step {
                ScriptStep::Assign(assign) => {
                    let value = assign.value.eval(&self.variables)?;
                    self.variables.insert(assign.id.clone(), value);
                    self.pc += 1;
                }
                ScriptStep::Gather(_) | ScriptStep::Call(_) => {
                    let calls = build_calls(
                        step.calls(),
                        &self.variables,
                        &self.allowed,
                        &mut self.next_call_id,
                    )?;
                    let Some(first) = calls.first().cloned() else {
                        // Empty gather
                        self.variables
                            .insert(step.id().to_string(), Value::Array(Vec::new()));
                        self.pc += 1;
                        continue;
                    };
                    self.phase = Phase::Issuing { calls, issued: 0 };
                    return Ok(Step::Blocked(first));
                }
            }
        }

        let output = match &self.program.output {
            Some(operand) => operand.eval(&self.variables)?,
            None => Value::Null,
        };
        self.phase = Phase::Finished;
        Ok(Step::Done(output))
    }

    fn issue_next(&mut self) -> Result<Step, ScriptError> {
        let phase = self.phase.name();
        let Phase::Issuing { calls, issued } = &mut self.phase else {
            return Err(ScriptError::WrongPhase {
                input: "acknowledge a call",
                phase,
            });
        };

        *issued += 1;
        if let Some(call) = calls.get(*issued) {
            return Ok(Step::Blocked(call.clone()));
        }

        let pending: Vec<i64> = calls.iter().map(|call| call.call_id).collect();
        debug!(pc = self.pc, pending = ?pending, "Program suspended");
        self.phase = Phase::Waiting {
            pending: pending.clone(),
        };
        Ok(Step::Suspended {
            pending_call_ids: pending,
        })
    }

    fn resume_with(&mut self, mut results: BTreeMap<i64, Value>) -> Result<Step, ScriptError> {
        let phase = self.phase.name();
        let Phase::Waiting { pending } = &self.phase else {
            return Err(ScriptError::WrongPhase {
                input: "resume with results",
                phase,
            });
        };

        let values = pending
            .iter()
            .map(|id| results.remove(id).ok_or(ScriptError::MissingResult(*id)))
            .collect::<Result<Vec<_>, _>>()?;

        let Some(step) = self.program.steps.get(self.pc) else {
            return Err(ScriptError::WrongPhase {
                input: "resume with results",
                phase: "past the last step",
            });
        };
        let value = match step {
            ScriptStep::Gather(_) => Value::Array(values),
            _ => values.into_iter().next().unwrap_or(Value::Null),
        };
        self.variables.insert(step.id().to_string(), value);
        self.pc += 1;
        self.run()
    }
}

fn build_calls(
    specs: &[CallSpec],
    variables: &Map<String, Value>,
    allowed: &BTreeSet<String>,
    next_call_id: &mut i64,
) -> Result<Vec<ExternalCall>, ScriptError> {
    let mut calls = Vec::with_capacity(specs.len());
    for spec in specs {
        if !allowed.contains(&spec.function) {
            return Err(ScriptError::UnknownFunction(spec.function.clone()));
        }
        let args = spec
            .args
            .iter()
            .map(|arg| arg.eval(variables))
            .collect::<Result<Vec<_>, _>>()?;
        let mut kwargs = Map::new();
        for (name, operand) in &spec.kwargs {
            kwargs.insert(name.clone(), operand.eval(variables)?);
        }

        calls.push(ExternalCall {
            call_id: *next_call_id,
            function_name: spec.function.clone(),
            args,
            kwargs,
        });
        *next_call_id += 1;
    }
    Ok(calls)
}

impl Continuation for Machine {
    fn advance(&mut self, input: Resume) -> Result<Step, EngineError> {
        Ok(self.step(input)?)
    }

    fn dump(&self) -> Result<Vec<u8>, EngineError> {
        Ok(self.snapshot()?)
    }
}

/// Continuation engine running JSON step programs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptEngine;

impl ScriptEngine {
    /// Create the engine.
    pub fn new() -> Self {
        Self
    }
}

impl ContinuationEngine for ScriptEngine {
    fn start(
        &self,
        code: &str,
        external_functions: &[String],
        inputs: &Map<String, Value>,
    ) -> Result<Box<dyn Continuation>, EngineError> {
        let program = Program::parse(code)?;
        Ok(Box::new(Machine::new(program, external_functions, inputs)))
    }

    fn load(&self, snapshot: &[u8]) -> Result<Box<dyn Continuation>, EngineError> {
        Ok(Box::new(Machine::restore(snapshot)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PROGRAM: &str = r#"{
        "steps": [
            {"stepType": "Gather", "id": "results", "calls": [
                {"function": "add", "args": [1, 2]},
                {"function": "add", "args": [{"ref": "x"}, 1]}
            ]},
            {"stepType": "Call", "id": "single", "call": {"function": "add", "args": [5, 7]}},
            {"stepType": "Assign", "id": "all", "value": {"op": "concat", "of": [{"ref": "results"}, {"op": "list", "of": [{"ref": "single"}]}]}}
        ],
        "output": {"op": "sum", "of": [{"ref": "all"}]}
    }"#;

    fn machine() -> Machine {
        let inputs = json!({"x": 10}).as_object().cloned().unwrap();
        Machine::new(
            Program::parse(PROGRAM).unwrap(),
            &["add".to_string()],
            &inputs,
        )
    }

    fn blocked(step: Step) -> ExternalCall {
        match step {
            Step::Blocked(call) => call,
            other => panic!("expected Blocked, got {:?}", other),
        }
    }

    #[test]
    fn test_full_run_with_snapshots() {
        let mut m = machine();

        let first = blocked(m.step(Resume::Start).unwrap());
        assert_eq!(first.call_id, 0);
        assert_eq!(first.function_name, "add");
        assert_eq!(first.args, vec![json!(1), json!(2)]);

        let second = blocked(m.step(Resume::Future).unwrap());
        assert_eq!(second.call_id, 1);
        assert_eq!(second.args, vec![json!(10), json!(1)]);

        assert_eq!(
            m.step(Resume::Future).unwrap(),
            Step::Suspended {
                pending_call_ids: vec![0, 1]
            }
        );

        let snapshot = m.snapshot().unwrap();
        let mut m = Machine::restore(&snapshot).unwrap();

        let third = blocked(
            m.step(Resume::Results(BTreeMap::from([(0, json!(3)), (1, json!(11))])))
                .unwrap(),
        );
        assert_eq!(third.call_id, 2);
        assert_eq!(third.args, vec![json!(5), json!(7)]);
        assert_eq!(m.variables()["results"], json!([3, 11]));

        assert_eq!(
            m.step(Resume::Future).unwrap(),
            Step::Suspended {
                pending_call_ids: vec![2]
            }
        );

        let mut m = Machine::restore(&m.snapshot().unwrap()).unwrap();
        assert_eq!(
            m.step(Resume::Results(BTreeMap::from([(2, json!(12))])))
                .unwrap(),
            Step::Done(json!(26))
        );
        assert!(m.is_finished());
        assert_eq!(m.variables()["all"], json!([3, 11, 12]));
    }

    #[test]
    fn test_program_without_calls() {
        let program = Program::parse(
            r#"{"steps": [
                {"stepType": "Assign", "id": "y", "value": {"op": "sum", "of": [{"ref": "x"}, 5]}},
                {"stepType": "Gather", "id": "none", "calls": []}
            ], "output": {"op": "list", "of": [{"ref": "y"}, {"ref": "none"}]}}"#,
        )
        .unwrap();
        let inputs = json!({"x": 1}).as_object().cloned().unwrap();
        let mut m = Machine::new(program, &[], &inputs);

        assert_eq!(m.step(Resume::Start).unwrap(), Step::Done(json!([6, []])));
    }

    #[test]
    fn test_missing_output_is_null() {
        let mut m = Machine::new(Program::parse(r#"{"steps": []}"#).unwrap(), &[], &Map::new());
        assert_eq!(m.step(Resume::Start).unwrap(), Step::Done(Value::Null));
    }

    #[test]
    fn test_function_outside_allow_list() {
        let mut m = Machine::new(Program::parse(PROGRAM).unwrap(), &[], &Map::new());
        assert_eq!(
            m.step(Resume::Start).unwrap_err(),
            ScriptError::UnknownFunction("add".to_string())
        );
    }

    #[test]
    fn test_undefined_variable() {
        let mut m = Machine::new(
            Program::parse(PROGRAM).unwrap(),
            &["add".to_string()],
            &Map::new(),
        );
        assert_eq!(
            m.step(Resume::Start).unwrap_err(),
            ScriptError::UndefinedVariable("x".to_string())
        );
    }

    #[test]
    fn test_missing_result() {
        let mut m = machine();
        m.step(Resume::Start).unwrap();
        m.step(Resume::Future).unwrap();
        m.step(Resume::Future).unwrap();

        assert_eq!(
            m.step(Resume::Results(BTreeMap::from([(0, json!(3))])))
                .unwrap_err(),
            ScriptError::MissingResult(1)
        );
    }

    #[test]
    fn test_wrong_phase() {
        let mut m = machine();
        assert!(matches!(
            m.step(Resume::Future),
            Err(ScriptError::WrongPhase { phase: "ready", .. })
        ));
        assert!(matches!(
            m.step(Resume::Results(BTreeMap::new())),
            Err(ScriptError::WrongPhase { .. })
        ));

        m.step(Resume::Start).unwrap();
        assert!(matches!(
            m.step(Resume::Start),
            Err(ScriptError::WrongPhase {
                input: "start",
                phase: "issuing calls"
            })
        ));
    }

    #[test]
    fn test_engine_maps_errors() {
        let engine = ScriptEngine::new();

        let err = engine.start("not json", &[], &Map::new()).err().unwrap();
        assert!(matches!(err, EngineError::InvalidProgram(_)));

        let err = engine.load(b"garbage").err().unwrap();
        assert!(matches!(err, EngineError::Snapshot(_)));

        let mut continuation = engine
            .start(PROGRAM, &[], &json!({"x": 1}).as_object().cloned().unwrap())
            .unwrap();
        let err = continuation.advance(Resume::Start).unwrap_err();
        assert!(err.is_program_error());

        let mut continuation = engine
            .start(PROGRAM, &["add".to_string()], &json!({"x": 1}).as_object().cloned().unwrap())
            .unwrap();
        let err = continuation.advance(Resume::Future).unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)));
    }

    #[test]
    fn test_engine_round_trips_through_dump() {
        let engine = ScriptEngine::new();
        let inputs = json!({"x": 2}).as_object().cloned().unwrap();
        let mut continuation = engine
            .start(PROGRAM, &["add".to_string()], &inputs)
            .unwrap();
        continuation.advance(Resume::Start).unwrap();
        continuation.advance(Resume::Future).unwrap();
        continuation.advance(Resume::Future).unwrap();

        let mut restored = engine.load(&continuation.dump().unwrap()).unwrap();
        let step = restored
            .advance(Resume::Results(BTreeMap::from([(0, json!(3)), (1, json!(3))])))
            .unwrap();
        assert!(matches!(step, Step::Blocked(ExternalCall { call_id: 2, .. })));
    }
}

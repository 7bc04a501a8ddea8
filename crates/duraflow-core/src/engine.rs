// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Continuation engine boundary.
//!
//! The orchestrator never interprets workflow code itself. It hands the code to a
//! [`ContinuationEngine`], which runs it until it either completes or blocks on
//! external calls, and which can serialize its paused state to bytes.
//!
//! # Protocol
//!
//! ```text
//! advance(Start | Results)          advance(Future)
//!        │                                 │
//!        ▼                                 ▼
//!   Blocked(call) ──────────────────► Blocked(call) ── ... ──► Suspended { pending_call_ids }
//!        │                                                          │
//!        └────────────────► Done(output)                           dump() → bytes
//! ```
//!
//! Each `Blocked` step is acknowledged with [`Resume::Future`] ("keep going, this is a
//! future"), so that a single suspension point yields the whole batch of calls it is
//! waiting on.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// An external call the engine is blocked on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalCall {
    /// Engine-assigned id, unique within one execution.
    pub call_id: i64,
    /// Short function name as referenced in the workflow code.
    pub function_name: String,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Keyword arguments.
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

/// Input used to advance a continuation.
#[derive(Debug, Clone, PartialEq)]
pub enum Resume {
    /// Run a freshly started program from the beginning.
    Start,
    /// Treat the last blocking call as a future and keep running.
    Future,
    /// Resolve the pending calls with their return values, keyed by call id.
    Results(BTreeMap<i64, Value>),
}

/// Progress reported by the engine after an `advance`.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// The program issued an external call and waits for acknowledgement.
    Blocked(ExternalCall),
    /// The program cannot proceed until these calls resolve.
    Suspended {
        /// Ids of every call the program is durably blocked on.
        pending_call_ids: Vec<i64>,
    },
    /// The program finished.
    Done(Value),
}

/// Errors raised by an engine.
#[derive(Debug, Clone, Error, PartialEq)]
#[non_exhaustive]
pub enum EngineError {
    /// The workflow program could not be parsed.
    #[error("invalid program: {0}")]
    InvalidProgram(String),

    /// The workflow program failed while running.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// A snapshot could not be serialized or restored.
    #[error("snapshot error: {0}")]
    Snapshot(String),

    /// The engine was advanced with an input that does not fit its current state,
    /// or reported progress that breaks the suspension protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl EngineError {
    /// Whether the error is caused by the workflow program itself.
    ///
    /// Program errors are terminal for an execution; protocol and snapshot errors
    /// point at the engine or the store and are surfaced to the caller instead.
    pub fn is_program_error(&self) -> bool {
        matches!(self, Self::InvalidProgram(_) | Self::Runtime(_))
    }
}

/// A running or paused workflow program.
pub trait Continuation: Send {
    /// Advance the program with the given input.
    fn advance(&mut self, input: Resume) -> Result<Step, EngineError>;

    /// Serialize the paused program to an opaque byte sequence.
    fn dump(&self) -> Result<Vec<u8>, EngineError>;
}

/// Factory for continuations.
pub trait ContinuationEngine: Send + Sync {
    /// Build a fresh program from code, the allowed external function short names,
    /// and named inputs.
    fn start(
        &self,
        code: &str,
        external_functions: &[String],
        inputs: &Map<String, Value>,
    ) -> Result<Box<dyn Continuation>, EngineError>;

    /// Restore a program from a snapshot produced by [`Continuation::dump`].
    fn load(&self, snapshot: &[u8]) -> Result<Box<dyn Continuation>, EngineError>;
}

/// Test double that replays a fixed sequence of suspension points.
#[cfg(test)]
pub(crate) mod mock {
    use std::sync::Arc;

    use super::*;

    /// Engine whose programs block on the configured call batches in order, then
    /// complete with the sum of every integer result received.
    pub(crate) struct MockEngine {
        stages: Arc<Vec<Vec<ExternalCall>>>,
    }

    impl MockEngine {
        pub(crate) fn new(stages: Vec<Vec<(i64, &str, Vec<Value>)>>) -> Self {
            let stages = stages
                .into_iter()
                .map(|stage| {
                    stage
                        .into_iter()
                        .map(|(call_id, name, args)| ExternalCall {
                            call_id,
                            function_name: name.to_string(),
                            args,
                            kwargs: Map::new(),
                        })
                        .collect()
                })
                .collect();
            Self {
                stages: Arc::new(stages),
            }
        }
    }

    #[derive(Serialize, Deserialize)]
    struct MockState {
        stage: usize,
        issued: usize,
        total: i64,
    }

    struct MockContinuation {
        stages: Arc<Vec<Vec<ExternalCall>>>,
        state: MockState,
    }

    impl MockContinuation {
        fn run_stage(&mut self) -> Step {
            match self.stages.get(self.state.stage) {
                Some(stage) if !stage.is_empty() => {
                    self.state.issued = 1;
                    Step::Blocked(stage[0].clone())
                }
                _ => Step::Done(Value::from(self.state.total)),
            }
        }
    }

    impl Continuation for MockContinuation {
        fn advance(&mut self, input: Resume) -> Result<Step, EngineError> {
            match input {
                Resume::Start => Ok(self.run_stage()),
                Resume::Future => {
                    let stage = self
                        .stages
                        .get(self.state.stage)
                        .ok_or_else(|| EngineError::Protocol("no active stage".to_string()))?;
                    if let Some(call) = stage.get(self.state.issued) {
                        self.state.issued += 1;
                        Ok(Step::Blocked(call.clone()))
                    } else {
                        Ok(Step::Suspended {
                            pending_call_ids: stage.iter().map(|c| c.call_id).collect(),
                        })
                    }
                }
                Resume::Results(results) => {
                    let stage = self
                        .stages
                        .get(self.state.stage)
                        .ok_or_else(|| EngineError::Protocol("no active stage".to_string()))?;
                    for call in stage {
                        let value = results.get(&call.call_id).ok_or_else(|| {
                            EngineError::Protocol(format!("missing result {}", call.call_id))
                        })?;
                        self.state.total += value.as_i64().unwrap_or_default();
                    }
                    self.state.stage += 1;
                    Ok(self.run_stage())
                }
            }
        }

        fn dump(&self) -> Result<Vec<u8>, EngineError> {
            serde_json::to_vec(&self.state).map_err(|e| EngineError::Snapshot(e.to_string()))
        }
    }

    impl ContinuationEngine for MockEngine {
        fn start(
            &self,
            _code: &str,
            _external_functions: &[String],
            _inputs: &Map<String, Value>,
        ) -> Result<Box<dyn Continuation>, EngineError> {
            Ok(Box::new(MockContinuation {
                stages: self.stages.clone(),
                state: MockState {
                    stage: 0,
                    issued: 0,
                    total: 0,
                },
            }))
        }

        fn load(&self, snapshot: &[u8]) -> Result<Box<dyn Continuation>, EngineError> {
            let state: MockState = serde_json::from_slice(snapshot)
                .map_err(|e| EngineError::Snapshot(e.to_string()))?;
            Ok(Box::new(MockContinuation {
                stages: self.stages.clone(),
                state,
            }))
        }
    }
}

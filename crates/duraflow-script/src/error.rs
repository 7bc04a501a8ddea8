// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use duraflow_core::engine::EngineError;
use thiserror::Error;

/// Errors raised while parsing or running a step program.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScriptError {
    /// The program source is not a valid step program.
    #[error("failed to parse program: {0}")]
    Parse(String),

    /// A call targets a function outside the execution's allow-list.
    #[error("function '{0}' is not an allowed external function")]
    UnknownFunction(String),

    /// A reference names a variable that was never bound.
    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),

    /// A reference path does not exist inside its variable.
    #[error("path '{0}' does not exist")]
    BadPath(String),

    /// An operator received a value it cannot work with.
    #[error("bad operand: {0}")]
    BadOperand(String),

    /// The program was resumed without the result of a pending call.
    #[error("missing result for call {0}")]
    MissingResult(i64),

    /// The program was advanced with an input that does not fit its phase.
    #[error("cannot {input} while {phase}")]
    WrongPhase {
        /// The rejected input.
        input: &'static str,
        /// The phase the program was in.
        phase: &'static str,
    },

    /// A snapshot could not be written or read.
    #[error("snapshot error: {0}")]
    Snapshot(String),
}

impl From<ScriptError> for EngineError {
    fn from(err: ScriptError) -> Self {
        let message = err.to_string();
        match err {
            ScriptError::Parse(_) => EngineError::InvalidProgram(message),
            ScriptError::UnknownFunction(_)
            | ScriptError::UndefinedVariable(_)
            | ScriptError::BadPath(_)
            | ScriptError::BadOperand(_) => EngineError::Runtime(message),
            ScriptError::MissingResult(_) | ScriptError::WrongPhase { .. } => {
                EngineError::Protocol(message)
            }
            ScriptError::Snapshot(_) => EngineError::Snapshot(message),
        }
    }
}

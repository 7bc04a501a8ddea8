// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Duraflow Script - JSON step programs as a continuation engine
//!
//! Programs are JSON documents whose steps are discriminated by `stepType`:
//!
//! ```json
//! {
//!   "steps": [
//!     {"stepType": "Gather", "id": "results", "calls": [
//!       {"function": "add", "args": [1, 2]},
//!       {"function": "add", "args": [{"ref": "x"}, 1]}
//!     ]},
//!     {"stepType": "Call", "id": "single", "call": {"function": "add", "args": [5, 7]}},
//!     {"stepType": "Assign", "id": "all", "value": {"op": "concat", "of": [{"ref": "results"}, {"op": "list", "of": [{"ref": "single"}]}]}}
//!   ],
//!   "output": {"op": "sum", "of": [{"ref": "all"}]}
//! }
//! ```
//!
//! | Step | Behaviour |
//! |------|-----------|
//! | `Gather` | Issues all its calls at one suspension point and binds the results array |
//! | `Call` | Issues one call and binds its result |
//! | `Assign` | Binds an operand immediately |
//!
//! Inputs are bound as variables before the first step. Call ids are assigned
//! sequentially from 0 across the whole run.

#![deny(missing_docs)]

/// Errors raised while parsing or running programs.
pub mod error;

/// Interpreter and [`ScriptEngine`].
pub mod machine;

/// Program, step and operand types.
pub mod program;

pub use error::ScriptError;
pub use machine::{Machine, ScriptEngine};
pub use program::Program;

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for duraflow-core E2E tests.
//!
//! Provides TestContext wiring an in-memory store, the step-program engine and a
//! small function registry together.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use duraflow_core::executor::Executor;
use duraflow_core::functions::{FunctionError, FunctionRegistry, positional};
use duraflow_core::orchestrator::{Orchestrator, PollReport};
use duraflow_core::persistence::SqlitePersistence;
use duraflow_core::{Worker, WorkerConfig};
use duraflow_script::ScriptEngine;
use tracing_subscriber::EnvFilter;

/// `gather(add(1, 2), add(3, 4))`, output is the sum of the results.
pub const GATHER_ADD: &str = r#"{
    "steps": [
        {"stepType": "Gather", "id": "results", "calls": [
            {"function": "add", "args": [1, 2]},
            {"function": "add", "args": [3, 4]}
        ]}
    ],
    "output": {"op": "sum", "of": [{"ref": "results"}]}
}"#;

/// `gather(add(x, 1), add(y, 2))`, output is the sum of the results.
pub const GATHER_INPUTS: &str = r#"{
    "steps": [
        {"stepType": "Gather", "id": "results", "calls": [
            {"function": "add", "args": [{"ref": "x"}, 1]},
            {"function": "add", "args": [{"ref": "y"}, 2]}
        ]}
    ],
    "output": {"op": "sum", "of": [{"ref": "results"}]}
}"#;

/// Two sequential gathers, the second one consuming the first one's results.
///
/// `first = gather(add(1, 2), add(3, 4))` → `[3, 7]`,
/// `second = gather(multiply(3, 7), add(3, 7))` → `[21, 10]`, output 31.
pub const TWO_GATHERS: &str = r#"{
    "steps": [
        {"stepType": "Gather", "id": "first", "calls": [
            {"function": "add", "args": [1, 2]},
            {"function": "add", "args": [3, 4]}
        ]},
        {"stepType": "Gather", "id": "second", "calls": [
            {"function": "multiply", "args": [{"ref": "first.0"}, {"ref": "first.1"}]},
            {"function": "add", "args": [{"ref": "first.0"}, {"ref": "first.1"}]}
        ]}
    ],
    "output": {"op": "sum", "of": [{"ref": "second"}]}
}"#;

/// `gather(add(1, 2), fail("boom"))` followed by a call that must never run.
pub const FAILING: &str = r#"{
    "steps": [
        {"stepType": "Gather", "id": "results", "calls": [
            {"function": "add", "args": [1, 2]},
            {"function": "fail", "args": ["boom"]}
        ]},
        {"stepType": "Call", "id": "after", "call": {"function": "add", "args": [0, 0]}}
    ],
    "output": {"ref": "after"}
}"#;

fn int(args: &[Value], index: usize) -> Result<i64, FunctionError> {
    positional(args, index)?
        .as_i64()
        .ok_or_else(|| FunctionError::new(format!("argument {} must be an integer", index)))
}

fn add(args: &[Value], _kwargs: &Map<String, Value>) -> Result<Value, FunctionError> {
    Ok(Value::from(int(args, 0)? + int(args, 1)?))
}

fn multiply(args: &[Value], _kwargs: &Map<String, Value>) -> Result<Value, FunctionError> {
    Ok(Value::from(int(args, 0)? * int(args, 1)?))
}

fn fail(args: &[Value], _kwargs: &Map<String, Value>) -> Result<Value, FunctionError> {
    let message = positional(args, 0)?.as_str().unwrap_or("failed");
    Err(FunctionError::new(message))
}

/// Registry with `tasks.add`, `tasks.multiply` and `tasks.fail`.
pub fn registry() -> Arc<FunctionRegistry> {
    let mut registry = FunctionRegistry::new();
    registry.register("tasks.add", add).unwrap();
    registry.register("tasks.multiply", multiply).unwrap();
    registry.register("tasks.fail", fail).unwrap();
    Arc::new(registry)
}

/// Build an inputs map from a JSON object.
pub fn inputs(value: Value) -> Map<String, Value> {
    value.as_object().cloned().expect("inputs must be an object")
}

/// Driver loop settings for tests.
pub fn fast_config() -> WorkerConfig {
    WorkerConfig {
        poll_interval: Duration::from_millis(5),
        ..Default::default()
    }
}

/// Route test logs through the test writer; `RUST_LOG` overrides the default.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("duraflow_core=warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Test context with an in-memory store.
pub struct TestContext {
    pub persistence: Arc<SqlitePersistence>,
    pub orchestrator: Arc<Orchestrator>,
    pub registry: Arc<FunctionRegistry>,
}

impl TestContext {
    pub async fn new() -> Self {
        init_tracing();
        let persistence = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let registry = registry();
        let orchestrator = Arc::new(Orchestrator::new(
            persistence.clone(),
            Arc::new(ScriptEngine::new()),
            registry.clone(),
        ));
        Self {
            persistence,
            orchestrator,
            registry,
        }
    }

    /// A driver loop over this context's orchestrator.
    pub fn worker(&self, executor: Arc<dyn Executor>) -> Worker {
        Worker::new(self.orchestrator.clone(), executor, fast_config())
    }

    /// Run ticks until the execution is terminal.
    pub async fn drive(&self, worker: &Worker, execution_id: &str) -> PollReport {
        for _ in 0..400 {
            worker.run_once().await;
            let report = self.orchestrator.poll(execution_id).await.unwrap();
            if report.is_terminal() {
                return report;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("execution {} did not reach a terminal state", execution_id);
    }
}

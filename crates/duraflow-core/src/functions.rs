// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! External functions, the registry that holds them, and identifier resolution.
//!
//! Functions are addressed by module-qualified identifiers such as `math.add`.
//! Workflow code refers to them by their short name (`add`); the mapping from short
//! name to qualified identifier is fixed when an execution is submitted.
//!
//! The registry is an explicit object handed to executors at construction time, so
//! any number of registries can coexist in one process.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;

/// Error raised by an external function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionError {
    message: String,
}

impl FunctionError {
    /// Create a new function error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for FunctionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for FunctionError {}

impl From<String> for FunctionError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for FunctionError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// A callable external function.
pub trait ExternalFunction: Send + Sync {
    /// Invoke the function.
    fn call(&self, args: &[Value], kwargs: &Map<String, Value>) -> Result<Value, FunctionError>;
}

impl<F> ExternalFunction for F
where
    F: Fn(&[Value], &Map<String, Value>) -> Result<Value, FunctionError> + Send + Sync,
{
    fn call(&self, args: &[Value], kwargs: &Map<String, Value>) -> Result<Value, FunctionError> {
        self(args, kwargs)
    }
}

/// Fetch a positional argument or fail with a descriptive error.
pub fn positional(args: &[Value], index: usize) -> Result<&Value, FunctionError> {
    args.get(index).ok_or_else(|| {
        FunctionError::new(format!(
            "missing positional argument {} (got {})",
            index,
            args.len()
        ))
    })
}

/// Function resolution errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResolveError {
    /// The identifier is not a module-qualified path.
    #[error(
        "invalid function path '{0}': must be a module-qualified path like 'tasks.{0}'"
    )]
    InvalidPath(String),

    /// No function is registered under the identifier or short name.
    #[error("function '{0}' not found")]
    NotFound(String),

    /// A short name matches several registered functions.
    #[error("function name '{name}' is ambiguous: {candidates:?}")]
    Ambiguous {
        /// The short name that was looked up.
        name: String,
        /// Every qualified identifier ending in that short name.
        candidates: Vec<String>,
    },

    /// A function is already registered under the identifier.
    #[error("function '{0}' is already registered")]
    AlreadyRegistered(String),
}

/// Check that an identifier is a module-qualified path (`module.function`).
pub fn validate_qualified_name(identifier: &str) -> Result<(), ResolveError> {
    let mut segments = identifier.split('.');
    let valid = identifier.contains('.')
        && segments.all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
        });
    if valid {
        Ok(())
    } else {
        Err(ResolveError::InvalidPath(identifier.to_string()))
    }
}

/// The short name of a qualified identifier (its last path segment).
pub fn short_name(identifier: &str) -> &str {
    identifier.rsplit('.').next().unwrap_or(identifier)
}

/// Resolves function identifiers to callables and short names to identifiers.
pub trait FunctionResolver: Send + Sync {
    /// Look up the callable registered under a qualified identifier.
    fn resolve(&self, identifier: &str) -> Result<Arc<dyn ExternalFunction>, ResolveError>;

    /// Turn an unqualified function name into its qualified identifier.
    fn qualify(&self, name: &str) -> Result<String, ResolveError>;
}

/// A reference to an external function supplied at submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionRef {
    /// A module-qualified identifier. Not required to be registered locally, since
    /// a remote executor may own the function.
    Qualified(String),
    /// A bare name that must be qualified through a [`FunctionResolver`].
    Name(String),
}

impl FunctionRef {
    /// Resolve to a `(short_name, qualified_identifier)` pair.
    pub fn resolve_with(
        &self,
        resolver: &dyn FunctionResolver,
    ) -> Result<(String, String), ResolveError> {
        let qualified = match self {
            Self::Qualified(identifier) => {
                validate_qualified_name(identifier)?;
                identifier.clone()
            }
            Self::Name(name) => {
                let qualified = resolver.qualify(name)?;
                validate_qualified_name(&qualified)?;
                qualified
            }
        };
        Ok((short_name(&qualified).to_string(), qualified))
    }
}

impl From<&str> for FunctionRef {
    fn from(value: &str) -> Self {
        if value.contains('.') {
            Self::Qualified(value.to_string())
        } else {
            Self::Name(value.to_string())
        }
    }
}

impl From<String> for FunctionRef {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

/// Registry of external functions keyed by qualified identifier.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn ExternalFunction>>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

impl FunctionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function under a qualified identifier.
    pub fn register<F>(&mut self, identifier: &str, function: F) -> Result<(), ResolveError>
    where
        F: ExternalFunction + 'static,
    {
        validate_qualified_name(identifier)?;
        if self.functions.contains_key(identifier) {
            return Err(ResolveError::AlreadyRegistered(identifier.to_string()));
        }
        self.functions
            .insert(identifier.to_string(), Arc::new(function));
        Ok(())
    }

    /// Registered identifiers, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl FunctionResolver for FunctionRegistry {
    fn resolve(&self, identifier: &str) -> Result<Arc<dyn ExternalFunction>, ResolveError> {
        self.functions
            .get(identifier)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(identifier.to_string()))
    }

    fn qualify(&self, name: &str) -> Result<String, ResolveError> {
        if name.contains('.') {
            validate_qualified_name(name)?;
            return Ok(name.to_string());
        }

        let mut candidates: Vec<String> = self
            .functions
            .keys()
            .filter(|identifier| short_name(identifier) == name)
            .cloned()
            .collect();
        candidates.sort();

        match candidates.len() {
            0 => Err(ResolveError::NotFound(name.to_string())),
            1 => Ok(candidates.remove(0)),
            _ => Err(ResolveError::Ambiguous {
                name: name.to_string(),
                candidates,
            }),
        }
    }
}

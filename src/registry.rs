//! Explicit registry of job functions and exception handlers.
//!
//! Jobs refer to their code by a stable name. A worker resolves that name
//! through the [`Registry`] it was built with; there is no global state, so
//! several registries (for example one per test) can coexist in a process.
//!
//! # Examples
//!
//! ```rust
//! use std::time::Duration;
//! use serde_json::json;
//! use workhorse::{HandlerOutcome, JobContext, Registry};
//!
//! let mut registry = Registry::new();
//! registry
//!     .register("add", |ctx: JobContext| async move {
//!         let a: i64 = ctx.arg(0)?;
//!         let b: i64 = ctx.arg(1)?;
//!         Ok(json!(a + b))
//!     })
//!     .on_queue("math")
//!     .with_timeout(Duration::from_secs(5));
//!
//! registry.add_exception_handler("log", |job, failure| {
//!     eprintln!("{} failed: {}", job.id, failure.message);
//!     HandlerOutcome::Continue
//! });
//!
//! assert!(registry.resolve("add").is_ok());
//! assert!(registry.resolve("missing").is_err());
//! ```

use crate::{
    Result, WorkhorseError,
    job::{FailureInfo, Job, JobId, JobOptions},
};
use anyhow::Context;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::{
    collections::{HashMap, hash_map::Entry},
    future::Future,
    pin::Pin,
    sync::Arc,
    time::Duration,
};

/// The call a handler receives.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub func_name: String,
    pub queue: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub meta: Map<String, Value>,
}

impl JobContext {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            func_name: job.func_name.clone(),
            queue: job.origin.clone(),
            args: job.args.clone(),
            kwargs: job.kwargs.clone(),
            meta: job.meta.clone(),
        }
    }

    /// Deserializes the positional argument at `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> anyhow::Result<T> {
        let value = self
            .args
            .get(index)
            .with_context(|| format!("missing positional argument {}", index))?;
        serde_json::from_value(value.clone())
            .with_context(|| format!("positional argument {} has the wrong type", index))
    }

    /// Deserializes a keyword argument, `None` when it was not passed.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<Option<T>> {
        match self.kwargs.get(name) {
            Some(value) => Ok(Some(
                serde_json::from_value(value.clone())
                    .with_context(|| format!("keyword argument {} has the wrong type", name))?,
            )),
            None => Ok(None),
        }
    }
}

pub type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

pub type JobHandler = Arc<dyn Fn(JobContext) -> JobFuture + Send + Sync>;

/// What an exception handler decided about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Pass the failure on to the next handler.
    Continue,
    /// Stop the chain. The job is still recorded as failed.
    Handled,
}

pub type ExceptionHandler = Arc<dyn Fn(&Job, &FailureInfo) -> HandlerOutcome + Send + Sync>;

/// A registered function and the defaults its jobs start from.
#[derive(Clone)]
pub struct FunctionSpec {
    name: String,
    handler: JobHandler,
    defaults: JobOptions,
}

impl std::fmt::Debug for FunctionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionSpec")
            .field("name", &self.name)
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl FunctionSpec {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> JobHandler {
        self.handler.clone()
    }

    pub fn defaults(&self) -> &JobOptions {
        &self.defaults
    }

    pub fn on_queue(&mut self, queue: &str) -> &mut Self {
        self.defaults.queue = Some(queue.to_string());
        self
    }

    pub fn with_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.defaults.timeout = Some(timeout);
        self
    }

    pub fn with_result_ttl(&mut self, result_ttl: Duration) -> &mut Self {
        self.defaults = std::mem::take(&mut self.defaults).result_ttl(result_ttl);
        self
    }

    pub fn with_ttl(&mut self, ttl: Duration) -> &mut Self {
        self.defaults.ttl = Some(ttl);
        self
    }

    pub fn with_description(&mut self, description: &str) -> &mut Self {
        self.defaults.description = Some(description.to_string());
        self
    }
}

#[derive(Default)]
pub struct Registry {
    functions: HashMap<String, FunctionSpec>,
    exception_handlers: Vec<(String, ExceptionHandler)>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("functions", &self.function_names())
            .field("exception_handlers", &self.exception_handler_names())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an async function under `name`, replacing any previous
    /// registration. Returns the entry so per-function defaults can be chained.
    pub fn register<F, Fut>(&mut self, name: &str, f: F) -> &mut FunctionSpec
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler: JobHandler = Arc::new(move |ctx: JobContext| -> JobFuture { Box::pin(f(ctx)) });
        self.register_handler(name, handler)
    }

    pub fn register_handler(&mut self, name: &str, handler: JobHandler) -> &mut FunctionSpec {
        let function = FunctionSpec {
            name: name.to_string(),
            handler,
            defaults: JobOptions::default(),
        };
        match self.functions.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                entry.insert(function);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(function),
        }
    }

    pub fn function(&self, name: &str) -> Option<&FunctionSpec> {
        self.functions.get(name)
    }

    pub fn resolve(&self, name: &str) -> Result<JobHandler> {
        self.functions
            .get(name)
            .map(|function| function.handler.clone())
            .ok_or_else(|| WorkhorseError::UnknownFunction {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn function_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Appends a named exception handler. Handlers run in registration order.
    /// Registering an existing name replaces it in place.
    pub fn add_exception_handler<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&Job, &FailureInfo) -> HandlerOutcome + Send + Sync + 'static,
    {
        let handler: ExceptionHandler = Arc::new(f);
        match self
            .exception_handlers
            .iter_mut()
            .find(|(existing, _)| existing == name)
        {
            Some(slot) => slot.1 = handler,
            None => self.exception_handlers.push((name.to_string(), handler)),
        }
    }

    pub fn exception_handler(&self, name: &str) -> Option<ExceptionHandler> {
        self.exception_handlers
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, handler)| handler.clone())
    }

    pub fn exception_handlers(&self) -> Vec<(String, ExceptionHandler)> {
        self.exception_handlers.clone()
    }

    pub fn exception_handler_names(&self) -> Vec<String> {
        self.exception_handlers
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }
}

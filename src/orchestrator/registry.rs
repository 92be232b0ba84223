//! Function Registry
//!
//! Maps function names (the `:name` of `/function/:name`) to async handlers and the
//! session options each one declared when it was registered.

use super::types::*;

use anyhow::Result;
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Thread-safe, type-erased function handler.
pub type FunctionHandlerFn =
    Arc<dyn Fn(ErmesRequest, SessionContext) -> HandlerFuture + Send + Sync>;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<ErmesResponse>> + Send>>;

#[derive(Clone)]
pub struct RegisteredFunction {
    pub handler: FunctionHandlerFn,
    pub options: HandlerOptions,
}

pub struct FunctionRegistry {
    functions: DashMap<String, RegisteredFunction>,
}

impl FunctionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `handler` under `name`, replacing any previous registration.
    pub fn register<F, Fut>(&self, name: &str, options: HandlerOptions, handler: F)
    where
        F: Fn(ErmesRequest, SessionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ErmesResponse>> + Send + 'static,
    {
        // Box::pin erases the concrete future so every handler fits the same map.
        let handler_fn: FunctionHandlerFn = Arc::new(move |request, session| {
            Box::pin(handler(request, session)) as HandlerFuture
        });

        self.functions.insert(
            name.to_string(),
            RegisteredFunction {
                handler: handler_fn,
                options,
            },
        );

        tracing::info!("Registered function: {} ({:?})", name, options);
    }

    pub fn get(&self, name: &str) -> Option<RegisteredFunction> {
        self.functions.get(name).map(|entry| entry.value().clone())
    }

    pub fn list_functions(&self) -> Vec<String> {
        self.functions
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self {
            functions: DashMap::new(),
        }
    }
}

//! Explicit task registry: task name → handler, built at startup.
//!
//! Handlers that need an external system declare a connection provider by
//! name when registered. The registry acquires a connection from that
//! provider before the call and releases it afterwards, whatever the
//! outcome.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::connection::{
    BoxConnectionProvider, Connection, ConnectionError, ConnectionHandle, ConnectionProvider,
    downcast_connection,
};
use super::{TaskContext, TaskError, TaskInvoker, TaskOutput};

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<TaskOutput, TaskError>> + Send>>;

/// Everything a handler receives for one call.
pub struct TaskCall {
    pub inputs: TaskOutput,
    pub ctx: TaskContext,
    pub connection: Option<ConnectionHandle>,
}

impl TaskCall {
    /// The declared connection, downcast to its concrete type.
    pub fn connection<T: Connection + 'static>(&self) -> Result<&T, TaskError> {
        let conn = self
            .connection
            .as_ref()
            .ok_or_else(|| TaskError::InvalidInput("task has no connection".to_string()))?;
        Ok(downcast_connection::<T>(conn)?)
    }

    pub fn input(&self, name: &str) -> Option<&serde_json::Value> {
        self.inputs.get(name)
    }
}

type TaskHandler = Arc<dyn Fn(TaskCall) -> TaskFuture + Send + Sync>;

#[derive(Clone)]
struct RegisteredTask {
    handler: TaskHandler,
    connection: Option<String>,
}

// ---------------------------------------------------------------------------
// TaskRegistry
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, RegisteredTask>,
    providers: HashMap<String, BoxConnectionProvider>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the built-in tasks.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        super::builtin::register_builtins(&mut registry);
        registry
    }

    /// Register a handler. A later registration under the same name wins.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(TaskCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskOutput, TaskError>> + Send + 'static,
    {
        self.insert(name.into(), None, handler);
        self
    }

    /// Register a handler that receives a connection from `provider`.
    pub fn register_with_connection<F, Fut>(
        &mut self,
        name: impl Into<String>,
        provider: impl Into<String>,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(TaskCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskOutput, TaskError>> + Send + 'static,
    {
        self.insert(name.into(), Some(provider.into()), handler);
        self
    }

    fn insert<F, Fut>(&mut self, name: String, connection: Option<String>, handler: F)
    where
        F: Fn(TaskCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskOutput, TaskError>> + Send + 'static,
    {
        if self.tasks.contains_key(&name) {
            tracing::debug!(task = %name, "replacing registered task");
        }
        let handler: TaskHandler = Arc::new(move |call| -> TaskFuture { Box::pin(handler(call)) });
        self.tasks.insert(
            name,
            RegisteredTask {
                handler,
                connection,
            },
        );
    }

    /// Make a connection provider available under its own name.
    pub fn add_provider<P: ConnectionProvider + 'static>(&mut self, provider: P) -> &mut Self {
        let boxed = BoxConnectionProvider::new(provider);
        self.providers.insert(boxed.name().to_string(), boxed);
        self
    }

    pub fn provider(&self, name: &str) -> Option<&BoxConnectionProvider> {
        self.providers.get(name)
    }

    pub fn task_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Disconnect every registered provider, logging failures.
    pub async fn shutdown(&self) {
        for (name, provider) in &self.providers {
            if let Err(e) = provider.disconnect().await {
                tracing::warn!(provider = %name, error = %e, "failed to disconnect provider");
            }
        }
    }

    /// Check that every task's declared provider is registered.
    pub fn validate(&self) -> Result<(), ConnectionError> {
        for task in self.tasks.values() {
            if let Some(provider) = &task.connection {
                if !self.providers.contains_key(provider) {
                    return Err(ConnectionError::UnknownProvider(provider.clone()));
                }
            }
        }
        Ok(())
    }
}

impl TaskInvoker for TaskRegistry {
    fn has_task(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    async fn invoke(
        &self,
        task: &str,
        inputs: TaskOutput,
        ctx: &TaskContext,
    ) -> Result<TaskOutput, TaskError> {
        let registered = self
            .tasks
            .get(task)
            .ok_or_else(|| TaskError::UnknownTask(task.to_string()))?;

        let Some(provider_name) = &registered.connection else {
            return (registered.handler)(TaskCall {
                inputs,
                ctx: ctx.clone(),
                connection: None,
            })
            .await;
        };

        let provider = self
            .providers
            .get(provider_name)
            .ok_or_else(|| ConnectionError::UnknownProvider(provider_name.clone()))?;
        let conn = provider.get_connection().await?;
        tracing::debug!(task, provider = %provider_name, "acquired connection");

        let result = (registered.handler)(TaskCall {
            inputs,
            ctx: ctx.clone(),
            connection: Some(Arc::clone(&conn)),
        })
        .await;

        provider.release_connection(conn).await;
        result
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.task_names())
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Subflow resolution, definition caching, and call-stack bookkeeping.
//!
//! How a name maps to YAML is pluggable through [`FlowSource`]; the loader
//! parses each resolved definition once and reuses it across calls. Cycle
//! detection works on the caller's [`CallStack`]: `enter` returns the stack
//! the child runs with, so the caller's own stack is never mutated and
//! concurrent branches can call subflows independently.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use stepflow_types::flow::FlowDefinition;
use thiserror::Error;

use super::context::CallStack;
use super::definition::parse_flow_yaml;
use super::error::EngineError;

// ---------------------------------------------------------------------------
// FlowSource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("flow '{0}' not found")]
    NotFound(String),

    #[error("invalid flow name '{0}'")]
    InvalidName(String),

    #[error("failed to read flow '{name}': {message}")]
    Io { name: String, message: String },
}

/// YAML text resolved for a name, plus the canonical key it is cached under
/// (e.g. the file path it was read from).
#[derive(Debug, Clone)]
pub struct ResolvedFlow {
    pub key: String,
    pub yaml: String,
}

/// Name → YAML discovery strategy.
pub trait FlowSource: Send + Sync {
    fn resolve(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<ResolvedFlow, SourceError>> + Send;
}

/// Object-safe version of [`FlowSource`].
pub trait FlowSourceDyn: Send + Sync {
    fn resolve_boxed<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ResolvedFlow, SourceError>> + Send + 'a>>;
}

impl<T: FlowSource> FlowSourceDyn for T {
    fn resolve_boxed<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ResolvedFlow, SourceError>> + Send + 'a>> {
        Box::pin(self.resolve(name))
    }
}

/// Type-erased flow source.
pub struct BoxFlowSource {
    inner: Box<dyn FlowSourceDyn>,
}

impl BoxFlowSource {
    pub fn new<T: FlowSource + 'static>(source: T) -> Self {
        Self {
            inner: Box::new(source),
        }
    }

    pub async fn resolve(&self, name: &str) -> Result<ResolvedFlow, SourceError> {
        self.inner.resolve_boxed(name).await
    }
}

/// Flow source backed by an in-memory name → YAML map.
#[derive(Debug, Default, Clone)]
pub struct InMemoryFlowSource {
    flows: Arc<DashMap<String, String>>,
}

impl InMemoryFlowSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, yaml: impl Into<String>) {
        self.flows.insert(name.into(), yaml.into());
    }
}

impl FlowSource for InMemoryFlowSource {
    async fn resolve(&self, name: &str) -> Result<ResolvedFlow, SourceError> {
        self.flows
            .get(name)
            .map(|yaml| ResolvedFlow {
                key: format!("memory:{name}"),
                yaml: yaml.value().clone(),
            })
            .ok_or_else(|| SourceError::NotFound(name.to_string()))
    }
}

// ---------------------------------------------------------------------------
// SubflowLoader
// ---------------------------------------------------------------------------

/// Resolves subflow names to parsed definitions and guards against cycles.
pub struct SubflowLoader {
    source: BoxFlowSource,
    /// Canonical key → parsed definition.
    cache: DashMap<String, Arc<FlowDefinition>>,
    /// Requested name → canonical key.
    aliases: DashMap<String, String>,
    /// Name → number of in-flight calls.
    active: DashMap<String, usize>,
    max_depth: usize,
}

impl SubflowLoader {
    pub fn new(source: BoxFlowSource, max_depth: usize) -> Self {
        Self {
            source,
            cache: DashMap::new(),
            aliases: DashMap::new(),
            active: DashMap::new(),
            max_depth,
        }
    }

    /// Make a definition available by name without consulting the source.
    pub fn register(&self, def: FlowDefinition) {
        let key = format!("registered:{}", def.name);
        self.aliases.insert(def.name.clone(), key.clone());
        self.cache.insert(key, Arc::new(def));
    }

    /// Resolve and parse `name`, reusing the cached definition when present.
    pub async fn load(&self, name: &str) -> Result<Arc<FlowDefinition>, EngineError> {
        if let Some(def) = self.cached(name) {
            return Ok(def);
        }

        let resolved = self.source.resolve(name).await.map_err(|e| match e {
            SourceError::NotFound(n) => EngineError::SubflowNotFound(n),
            other => EngineError::Validation(other.to_string()),
        })?;

        let existing = self.cache.get(&resolved.key).map(|d| Arc::clone(d.value()));
        let def = match existing {
            Some(def) => def,
            None => {
                let parsed = parse_flow_yaml(&resolved.yaml)
                    .map_err(|e| EngineError::Validation(format!("subflow '{name}': {e}")))?;
                tracing::debug!(subflow = name, key = %resolved.key, "cached subflow definition");
                Arc::clone(
                    self.cache
                        .entry(resolved.key.clone())
                        .or_insert_with(|| Arc::new(parsed))
                        .value(),
                )
            }
        };
        self.aliases.insert(name.to_string(), resolved.key);
        Ok(def)
    }

    fn cached(&self, name: &str) -> Option<Arc<FlowDefinition>> {
        let key = self.aliases.get(name)?;
        self.cache.get(key.value()).map(|d| Arc::clone(d.value()))
    }

    /// Check `name` against the caller's stack and record the call.
    ///
    /// Returns the stack the subflow runs with. Every successful `enter`
    /// must be paired with [`exit`](Self::exit).
    pub fn enter(&self, stack: &CallStack, name: &str) -> Result<CallStack, EngineError> {
        if stack.contains(name) {
            return Err(EngineError::CircularDependency {
                cycle: stack.cycle_with(name),
            });
        }
        let next = stack.pushed(name);
        // The root flow is not a subflow call.
        let depth = next.depth() - 1;
        if depth > self.max_depth {
            return Err(EngineError::SubflowDepthExceeded {
                depth,
                max: self.max_depth,
            });
        }
        *self.active.entry(name.to_string()).or_insert(0) += 1;
        Ok(next)
    }

    pub fn exit(&self, name: &str) {
        if let Some(mut count) = self.active.get_mut(name) {
            *count = count.saturating_sub(1);
        }
        self.active.remove_if(name, |_, count| *count == 0);
    }

    /// Number of calls to `name` currently executing.
    pub fn active_calls(&self, name: &str) -> usize {
        self.active.get(name).map(|c| *c.value()).unwrap_or(0)
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }
}

impl std::fmt::Debug for SubflowLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubflowLoader")
            .field("cached", &self.cache.len())
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CHILD: &str = "name: child\nsteps:\n  - type: task\n    task: noop\n";

    /// Counts how often the underlying source is consulted.
    struct CountingSource {
        inner: InMemoryFlowSource,
        hits: Arc<AtomicUsize>,
    }

    impl FlowSource for CountingSource {
        async fn resolve(&self, name: &str) -> Result<ResolvedFlow, SourceError> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            self.inner.resolve(name).await
        }
    }

    fn loader_with(flows: &[(&str, &str)]) -> (SubflowLoader, Arc<AtomicUsize>) {
        let inner = InMemoryFlowSource::new();
        for (name, yaml) in flows {
            inner.insert(*name, *yaml);
        }
        let hits = Arc::new(AtomicUsize::new(0));
        let source = CountingSource {
            inner,
            hits: Arc::clone(&hits),
        };
        (SubflowLoader::new(BoxFlowSource::new(source), 16), hits)
    }

    #[tokio::test]
    async fn load_parses_once_and_caches() {
        let (loader, hits) = loader_with(&[("child", CHILD)]);
        let a = loader.load("child").await.unwrap();
        let b = loader.load("child").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(loader.cached_count(), 1);
    }

    #[tokio::test]
    async fn missing_flow_is_not_found() {
        let (loader, _) = loader_with(&[]);
        let err = loader.load("ghost").await.unwrap_err();
        assert!(matches!(err, EngineError::SubflowNotFound(n) if n == "ghost"));
    }

    #[tokio::test]
    async fn invalid_yaml_is_validation_error() {
        let (loader, _) = loader_with(&[("bad", "name: bad\nsteps: []\n")]);
        let err = loader.load("bad").await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn registered_definitions_skip_the_source() {
        let (loader, hits) = loader_with(&[]);
        loader.register(parse_flow_yaml(CHILD).unwrap());
        assert_eq!(loader.load("child").await.unwrap().name, "child");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn enter_detects_cycles() {
        let (loader, _) = loader_with(&[]);
        let root = CallStack::new("A");
        let b = loader.enter(&root, "B").unwrap();
        let c = loader.enter(&b, "C").unwrap();
        let err = loader.enter(&c, "A").unwrap_err();
        match err {
            EngineError::CircularDependency { cycle } => assert_eq!(cycle, "A → B → C → A"),
            other => panic!("expected cycle, got {other:?}"),
        }
        assert_eq!(loader.active_calls("B"), 1);
        loader.exit("C");
        loader.exit("B");
        assert_eq!(loader.active_calls("B"), 0);
    }

    #[test]
    fn enter_enforces_depth() {
        let inner = InMemoryFlowSource::new();
        let loader = SubflowLoader::new(BoxFlowSource::new(inner), 2);
        let one = loader.enter(&CallStack::new("root"), "one").unwrap();
        let two = loader.enter(&one, "two").unwrap();
        let err = loader.enter(&two, "three").unwrap_err();
        assert!(matches!(err, EngineError::SubflowDepthExceeded { depth: 3, max: 2 }));
    }
}

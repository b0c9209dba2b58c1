//! The methods and properties one side of a connection offers its peer.
//!
//! An [`ExposedSurface`] is built once and then shared: every connection
//! created from the same surface (or a clone of it) sees the same property
//! values, so a `set` arriving on one channel is visible to a `get` on
//! another.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use tracing::warn;

/// Name that would make a remote handle look awaitable.
pub const THEN: &str = "then";

/// Name that resolves to the caller's own session id on a remote handle.
pub const GET_MY_SESSION_ID: &str = "$getMySessionId";

/// Names that can never be exposed.
pub const RESERVED_NAMES: &[&str] = &[THEN, GET_MY_SESSION_ID];

/// Result of a method: the returned value, or the error value sent to the caller.
pub type MethodResult = std::result::Result<Value, Value>;

/// What a method produced when it was invoked.
pub enum MethodOutcome {
    /// The method already finished.
    Immediate(MethodResult),
    /// The method finishes later.
    Deferred(BoxFuture<'static, MethodResult>),
}

impl MethodOutcome {
    /// Wait for the method to finish, whichever way it ran.
    pub async fn settle(self) -> MethodResult {
        match self {
            MethodOutcome::Immediate(result) => result,
            MethodOutcome::Deferred(future) => future.await,
        }
    }
}

impl std::fmt::Debug for MethodOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MethodOutcome::Immediate(result) => f.debug_tuple("Immediate").field(result).finish(),
            MethodOutcome::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

type MethodFn = Arc<dyn Fn(Vec<Value>) -> MethodOutcome + Send + Sync>;

enum Entry {
    Method(MethodFn),
    Property(Value),
}

struct SurfaceInner {
    methods: BTreeMap<String, MethodFn>,
    properties: RwLock<BTreeMap<String, Value>>,
}

/// Methods and properties exposed to the peer.
#[derive(Clone)]
pub struct ExposedSurface {
    inner: Arc<SurfaceInner>,
}

impl ExposedSurface {
    /// Start building a surface.
    pub fn builder() -> SurfaceBuilder {
        SurfaceBuilder::default()
    }

    /// A surface exposing nothing.
    pub fn empty() -> Self {
        SurfaceBuilder::default().build()
    }

    /// Names of exposed methods, sorted.
    pub fn method_names(&self) -> Vec<String> {
        self.inner.methods.keys().cloned().collect()
    }

    /// Names of exposed properties, sorted.
    pub fn property_names(&self) -> Vec<String> {
        self.read_properties().keys().cloned().collect()
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.inner.methods.contains_key(name)
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.read_properties().contains_key(name)
    }

    /// Current value of a property, `None` when it is not exposed.
    pub fn get_property(&self, name: &str) -> Option<Value> {
        self.read_properties().get(name).cloned()
    }

    /// Assign a property. Returns the applied value, or `None` without
    /// mutating anything when the property is not exposed.
    pub fn set_property(&self, name: &str, value: Value) -> Option<Value> {
        let mut properties = self
            .inner
            .properties
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let slot = properties.get_mut(name)?;
        *slot = value.clone();
        Some(value)
    }

    /// Run a method. `None` when no such method is exposed.
    pub fn invoke(&self, name: &str, args: Vec<Value>) -> Option<MethodOutcome> {
        let method = self.inner.methods.get(name)?;
        Some(method(args))
    }

    fn read_properties(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Value>> {
        self.inner
            .properties
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ExposedSurface {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for ExposedSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExposedSurface")
            .field("methods", &self.method_names())
            .field("properties", &self.property_names())
            .finish()
    }
}

/// Collects entries for an [`ExposedSurface`].
///
/// Registering a name twice keeps the last entry, whether it is a method or
/// a property.
#[derive(Default)]
pub struct SurfaceBuilder {
    entries: BTreeMap<String, Entry>,
}

impl SurfaceBuilder {
    /// Expose a method that answers synchronously.
    pub fn method<F>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(Vec<Value>) -> MethodResult + Send + Sync + 'static,
    {
        let method: MethodFn = Arc::new(move |args| MethodOutcome::Immediate(method(args)));
        self.entries.insert(name.into(), Entry::Method(method));
        self
    }

    /// Expose a method that answers later.
    pub fn async_method<F, Fut>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        let method: MethodFn = Arc::new(move |args| MethodOutcome::Deferred(method(args).boxed()));
        self.entries.insert(name.into(), Entry::Method(method));
        self
    }

    /// Expose a property with its initial value.
    pub fn property(mut self, name: impl Into<String>, value: Value) -> Self {
        self.entries.insert(name.into(), Entry::Property(value));
        self
    }

    /// Partition the entries into methods and properties.
    pub fn build(self) -> ExposedSurface {
        let mut methods = BTreeMap::new();
        let mut properties = BTreeMap::new();

        for (name, entry) in self.entries {
            if RESERVED_NAMES.contains(&name.as_str()) {
                warn!(name = %name, "Dropping exposed entry with a reserved name");
                continue;
            }
            match entry {
                Entry::Method(method) => {
                    methods.insert(name, method);
                }
                Entry::Property(value) => {
                    properties.insert(name, value);
                }
            }
        }

        ExposedSurface {
            inner: Arc::new(SurfaceInner {
                methods,
                properties: RwLock::new(properties),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> ExposedSurface {
        ExposedSurface::builder()
            .method("echo", |args| Ok(args.into_iter().next().unwrap_or(Value::Null)))
            .async_method("later", |_args| async { Ok(json!("done")) })
            .method("fail", |_args| Err(json!("broken")))
            .property("variable", json!(1))
            .build()
    }

    #[test]
    fn test_partition() {
        let surface = sample();
        assert_eq!(surface.method_names(), vec!["echo", "fail", "later"]);
        assert_eq!(surface.property_names(), vec!["variable"]);
        assert!(surface.has_method("echo"));
        assert!(!surface.has_method("variable"));
        assert!(surface.has_property("variable"));
    }

    #[test]
    fn test_reserved_names_are_dropped() {
        let surface = ExposedSurface::builder()
            .method("then", |_| Ok(Value::Null))
            .property("$getMySessionId", json!(3))
            .property("kept", json!(true))
            .build();
        assert!(surface.method_names().is_empty());
        assert_eq!(surface.property_names(), vec!["kept"]);
    }

    #[test]
    fn test_last_registration_wins() {
        let surface = ExposedSurface::builder()
            .property("name", json!(1))
            .method("name", |_| Ok(json!(2)))
            .build();
        assert!(surface.has_method("name"));
        assert!(!surface.has_property("name"));
    }

    #[test]
    fn test_set_property_only_when_exposed() {
        let surface = sample();
        assert_eq!(surface.set_property("variable", json!(5)), Some(json!(5)));
        assert_eq!(surface.get_property("variable"), Some(json!(5)));

        assert_eq!(surface.set_property("unknown", json!(1)), None);
        assert!(!surface.has_property("unknown"));
        assert_eq!(surface.get_property("unknown"), None);
    }

    #[test]
    fn test_clones_share_properties() {
        let surface = sample();
        let other = surface.clone();
        other.set_property("variable", json!("shared"));
        assert_eq!(surface.get_property("variable"), Some(json!("shared")));
    }

    #[tokio::test]
    async fn test_invoke_settles_both_kinds() {
        let surface = sample();

        let outcome = surface.invoke("echo", vec![json!(7)]).unwrap();
        assert!(matches!(outcome, MethodOutcome::Immediate(_)));
        assert_eq!(outcome.settle().await, Ok(json!(7)));

        let outcome = surface.invoke("later", vec![]).unwrap();
        assert!(matches!(outcome, MethodOutcome::Deferred(_)));
        assert_eq!(outcome.settle().await, Ok(json!("done")));

        let outcome = surface.invoke("fail", vec![]).unwrap();
        assert_eq!(outcome.settle().await, Err(json!("broken")));

        assert!(surface.invoke("missing", vec![]).is_none());
    }
}

//! Method interception
//!
//! Services registered with [BindingBuilder::intercepted](crate::BindingBuilder::intercepted)
//! are wrapped in a proxy implementing the same trait. Each proxied method builds a fresh
//! [Pipeline] from the [InterceptorSpec]s attached to the method in a [MethodTable],
//! then threads the call through the interceptor hooks:
//!
//! * ```before_invoke``` in declaration order, any [Flow::Stop] vetoes the call,
//! * the wrapped method itself,
//! * on failure, ```on_error``` in declaration order until one handles the error,
//! * ```after_invoke``` in reverse order.
//!
//! Interceptor kinds are instantiated by name from an [InterceptorCatalog],
//! using their configuration payload.

use std::any::Any;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::policies::{NoopInterceptor, ProfileInterceptor, RetryInterceptor};
use crate::*;

/// Decision of a ```before_invoke``` hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Proceed,
    Stop,
}

/// Decision of an ```on_error``` hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Handled,
    Unhandled,
}

/// The intercepted call
#[derive(Debug, Clone, Copy)]
pub struct Call<'a> {
    service: &'static str,
    method: &'a str,
}

impl<'a> Call<'a> {
    pub fn new(service: &'static str, method: &'a str) -> Self {
        Self { service, method }
    }

    pub fn service(&self) -> &'static str {
        self.service
    }

    pub fn method(&self) -> &'a str {
        self.method
    }
}

impl fmt::Display for Call<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.method)
    }
}

/// Failure of the wrapped method, with the ability to invoke it again
pub struct Failure<'a> {
    error: &'a (dyn StdError + Send + Sync + 'static),
    reinvoke: &'a dyn Fn() -> Result<(), BoxError>,
}

impl<'a> Failure<'a> {
    pub fn error(&self) -> &'a (dyn StdError + Send + Sync + 'static) {
        self.error
    }

    /// Invoke the wrapped method again with the same arguments, discarding its return value
    pub fn reinvoke(&self) -> Result<(), BoxError> {
        (self.reinvoke)()
    }
}

/// Hooks called around each intercepted method call.
///
/// All hooks have a neutral default implementation.
pub trait Interceptor {
    /// Receive a resolver to look up services needed by this interceptor
    fn attach(&mut self, _resolver: Resolver) {}

    fn before_invoke(&mut self, _call: &Call<'_>) -> Flow {
        Flow::Proceed
    }

    /// Called after a successful call, or after a handled error without result
    fn after_invoke(&mut self, _call: &Call<'_>, _result: Option<&dyn Any>) {}

    fn on_error(&mut self, _call: &Call<'_>, _failure: &Failure<'_>) -> Disposition {
        Disposition::Unhandled
    }
}

/// Interceptors which can be instantiated from a configuration payload
pub trait InterceptorKind: Interceptor + Sized + 'static {
    type Config: DeserializeOwned;

    fn from_config(config: Self::Config) -> Result<Self, Error>;
}

/// Interceptor declared on a method.
///
/// The ```tag``` identifies the declared capability. When no explicit ```interceptor``` kind is
/// given, the default kind declared for the tag in the catalog is used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterceptorSpec {
    pub tag: String,
    #[serde(default)]
    pub interceptor: Option<String>,
    #[serde(default)]
    pub config: Value,
}

impl InterceptorSpec {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            interceptor: None,
            config: Value::Null,
        }
    }

    pub fn using(mut self, kind: impl Into<String>) -> Self {
        self.interceptor = Some(kind.into());
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

/// Ordered interceptor specifications, by method name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MethodTable(HashMap<String, Vec<InterceptorSpec>>);

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(
        mut self,
        name: impl Into<String>,
        specs: impl IntoIterator<Item = InterceptorSpec>,
    ) -> Self {
        self.0.entry(name.into()).or_default().extend(specs);
        self
    }

    /// Load a table from a JSON object mapping method names to lists of specifications
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json)
            .map_err(|e| Error::Configuration(format!("Invalid interception table: {}", e)))
    }

    pub fn specs(&self, method: &str) -> &[InterceptorSpec] {
        self.0.get(method).map(Vec::as_slice).unwrap_or_default()
    }
}

type InterceptorConstructor =
    Arc<dyn Fn(&Value) -> Result<Box<dyn Interceptor>, Error> + Send + Sync>;

/// Known interceptor kinds, and the default kind of each declared tag
#[derive(Clone)]
pub struct InterceptorCatalog {
    tags: HashMap<String, String>,
    kinds: HashMap<String, InterceptorConstructor>,
}

impl Default for InterceptorCatalog {
    /// Catalog with the built-in ```retry```, ```profile``` and ```handle-errors``` tags
    fn default() -> Self {
        let mut catalog = Self::empty();
        catalog
            .register_kind::<RetryInterceptor>(RetryInterceptor::KIND)
            .register_kind::<ProfileInterceptor>(ProfileInterceptor::KIND)
            .register_kind::<NoopInterceptor>(NoopInterceptor::KIND)
            .declare_tag("retry", RetryInterceptor::KIND)
            .declare_tag("profile", ProfileInterceptor::KIND)
            .declare_tag("handle-errors", NoopInterceptor::KIND);
        catalog
    }
}

impl InterceptorCatalog {
    pub fn empty() -> Self {
        Self {
            tags: HashMap::new(),
            kinds: HashMap::new(),
        }
    }

    pub fn register_kind<K: InterceptorKind>(&mut self, kind: impl Into<String>) -> &mut Self {
        let kind = kind.into();
        let name = kind.clone();
        let constructor = move |payload: &Value| -> Result<Box<dyn Interceptor>, Error> {
            // a missing payload selects the default configuration
            let payload = match payload {
                Value::Null => Value::Object(Default::default()),
                other => other.clone(),
            };
            let config = serde_json::from_value::<K::Config>(payload).map_err(|e| {
                Error::Configuration(format!("Invalid configuration for interceptor {}: {}", name, e))
            })?;
            Ok(Box::new(K::from_config(config)?))
        };
        self.kinds.insert(kind, Arc::new(constructor));
        self
    }

    /// Declare a tag and the interceptor kind used when a specification does not name one
    pub fn declare_tag(&mut self, tag: impl Into<String>, kind: impl Into<String>) -> &mut Self {
        self.tags.insert(tag.into(), kind.into());
        self
    }

    pub(crate) fn merge(&mut self, other: &InterceptorCatalog) {
        self.tags
            .extend(other.tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.kinds
            .extend(other.kinds.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    /// Instantiate the interceptor described by a specification
    pub fn instantiate(&self, spec: &InterceptorSpec) -> Result<Box<dyn Interceptor>, Error> {
        let kind = match &spec.interceptor {
            Some(kind) => kind,
            None => self.tags.get(&spec.tag).ok_or_else(|| {
                Error::Configuration(format!("No interceptor declared for tag {}", spec.tag))
            })?,
        };
        let constructor = self.kinds.get(kind).ok_or_else(|| {
            Error::Configuration(format!("No usable constructor for interceptor {}", kind))
        })?;
        constructor(&spec.config)
    }
}

impl fmt::Debug for InterceptorCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorCatalog")
            .field("tags", &self.tags)
            .field("kinds", &self.kinds.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Interception context shared by all calls of a proxied instance
pub struct Interception {
    service: &'static str,
    methods: Arc<MethodTable>,
    catalog: Arc<InterceptorCatalog>,
    resolver: Resolver,
}

impl Interception {
    pub(crate) fn new(
        service: &'static str,
        methods: Arc<MethodTable>,
        container: &Container,
    ) -> Self {
        Self {
            service,
            methods,
            catalog: container.catalog().clone(),
            resolver: container.resolver(),
        }
    }

    /// Build the interceptor chain of a method, failing before the call on invalid metadata
    pub fn pipeline(&self, method: &str) -> Result<Pipeline, Error> {
        let interceptors = self
            .methods
            .specs(method)
            .iter()
            .map(|spec| -> Result<Box<dyn Interceptor>, Error> {
                let mut interceptor = self.catalog.instantiate(spec)?;
                interceptor.attach(self.resolver.clone());
                Ok(interceptor)
            })
            .collect::<Result<_, Error>>()?;
        Ok(Pipeline { interceptors })
    }
}

/// Interceptor chain of a single call
pub struct Pipeline {
    interceptors: Vec<Box<dyn Interceptor>>,
}

impl Pipeline {
    pub fn new(interceptors: Vec<Box<dyn Interceptor>>) -> Self {
        Self { interceptors }
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Run a call through the chain.
    ///
    /// Returns `Ok(None)` when the call was vetoed or when its error was handled.
    /// An unhandled error is returned unchanged, without running the ```after_invoke``` hooks.
    pub fn dispatch<R, E, F>(&mut self, call: &Call<'_>, invoke: F) -> Result<Option<R>, E>
    where
        R: Any,
        E: StdError + Send + Sync + 'static,
        F: Fn() -> Result<R, E>,
    {
        for interceptor in self.interceptors.iter_mut() {
            if interceptor.before_invoke(call) == Flow::Stop {
                return Ok(None);
            }
        }

        let result = match invoke() {
            Ok(value) => Some(value),
            Err(error) => {
                let reinvoke = || invoke().map(drop).map_err(BoxError::from);
                let failure = Failure {
                    error: &error,
                    reinvoke: &reinvoke,
                };
                let handled = self
                    .interceptors
                    .iter_mut()
                    .any(|interceptor| interceptor.on_error(call, &failure) == Disposition::Handled);
                if !handled {
                    return Err(error);
                }
                None
            }
        };

        for interceptor in self.interceptors.iter_mut().rev() {
            interceptor.after_invoke(call, result.as_ref().map(|value| value as &dyn Any));
        }
        Ok(result)
    }
}

/// Trait objects which can be wrapped in an intercepting proxy.
///
/// Implement this for ```dyn MyTrait``` by returning a wrapper struct which implements
/// ```MyTrait``` and forwards every method through [Proxy::call].
pub trait Intercept: Send + Sync + 'static {
    fn intercept(proxy: Proxy<Self>) -> Arc<Self>;
}

/// Wrapped service instance, routing calls through the interception pipeline.
///
/// Formatting and equality do not go through the pipeline: [fmt::Display] is answered by
/// the wrapped instance and two proxies are equal only if they are the same proxy.
pub struct Proxy<S: ?Sized> {
    target: Arc<S>,
    interception: Interception,
}

impl<S: ?Sized> Proxy<S> {
    pub(crate) fn new(target: Arc<S>, interception: Interception) -> Self {
        Self {
            target,
            interception,
        }
    }

    pub fn target(&self) -> &Arc<S> {
        &self.target
    }

    /// Call a method of the wrapped instance through its interception pipeline
    pub fn call<R, E, F>(&self, method: &str, invoke: F) -> Result<Option<R>, E>
    where
        R: Any,
        E: StdError + Send + Sync + 'static + From<Error>,
        F: Fn(&S) -> Result<R, E>,
    {
        let mut pipeline = self.interception.pipeline(method)?;
        let call = Call {
            service: self.interception.service,
            method,
        };
        pipeline.dispatch(&call, || invoke(&*self.target))
    }

    /// Same as [Proxy::call], using the default value when no result is available
    pub fn call_or_default<R, E, F>(&self, method: &str, invoke: F) -> Result<R, E>
    where
        R: Any + Default,
        E: StdError + Send + Sync + 'static + From<Error>,
        F: Fn(&S) -> Result<R, E>,
    {
        self.call(method, invoke).map(Option::unwrap_or_default)
    }
}

impl<S: ?Sized + fmt::Display> fmt::Display for Proxy<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.target, f)
    }
}

impl<S: ?Sized> fmt::Debug for Proxy<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("service", &self.interception.service)
            .finish_non_exhaustive()
    }
}

impl<S: ?Sized> PartialEq for Proxy<S> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl<S: ?Sized> Eq for Proxy<S> {}

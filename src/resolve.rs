//! Bindings and the registry collecting them
//!
//! A [ServiceBinding] associates a requested type with a [Lifetime] and a construction strategy.
//! Bindings are grouped in a [Registry], which is consumed once to build a [Container].
//!
//! * A binding can be built from a factory closure receiving the resolving container.
//! * A binding can be built from an implementation type implementing [Injectable]: the constructor
//!   with the most parameters is selected and each parameter is injected from the container.
//!
//! Registering the same requested type twice replaces the previous binding.

use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use thiserror::Error;

use crate::inject::{Constructor, Container, Injectable};
use crate::intercept::{Intercept, Interception, InterceptorCatalog, MethodTable, Proxy};
use crate::logging;

/// Boxed error raised by factories, service methods and disposal
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Type-erased instance stored by the container, always holding an `Arc<S>`
pub(crate) type Instance = Arc<dyn Any + Send + Sync>;

type Construct = Arc<dyn Fn(&Container) -> Result<Instance, Error> + Send + Sync>;
type Closer = Arc<dyn Fn(&Instance) -> Result<(), BoxError> + Send + Sync>;

/// Errors triggered while wiring or resolving services
#[derive(Error, Debug)]
pub enum Error {
    #[error("Unable to resolve {0}: no binding registered")]
    NotRegistered(&'static str),
    #[error("Cannot resolve scoped service {0} in root scope")]
    InvalidScopeUsage(&'static str),
    #[error("Failed to construct {service}: {source}")]
    ConstructionFailure {
        service: &'static str,
        #[source]
        source: BoxError,
    },
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("No logger factory registered, call `logging::register_factory` first")]
    LoggerNotConfigured,
    #[error("Resolver is detached: its container has been dropped")]
    Detached,
    #[error("Stored instance does not match requested type {0}")]
    TypeMismatch(&'static str),
}

impl Error {
    /// Wrap a construction error, unless it already is a wiring error raised by a nested resolution
    pub(crate) fn construction<S: ?Sized>(source: BoxError) -> Self {
        match source.downcast::<Error>() {
            Ok(inner) => *inner,
            Err(source) => Error::ConstructionFailure {
                service: type_name::<S>(),
                source,
            },
        }
    }
}

/// Lifetime of resolved instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifetime {
    /// One instance per root container, shared with all its scopes
    Singleton,
    /// One instance per scope, unavailable from the root container
    Scoped,
    /// A new instance for each resolution
    Transient,
}

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lifetime::Singleton => "SINGLETON",
            Lifetime::Scoped => "SCOPED",
            Lifetime::Transient => "TRANSIENT",
        };
        f.write_str(name)
    }
}

/// Identify a requested type. Equality only depends on the [TypeId].
#[derive(Debug, Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    pub fn of<S: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<S>(),
            name: type_name::<S>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Services with resources to release when their owning container is closed
pub trait Close: Send + Sync {
    fn close(&self) -> Result<(), BoxError>;
}

/// Recover the typed service from a stored instance
pub(crate) fn downcast<S: ?Sized + 'static>(instance: &Instance) -> Result<Arc<S>, Error> {
    instance
        .downcast_ref::<Arc<S>>()
        .cloned()
        .ok_or(Error::TypeMismatch(type_name::<S>()))
}

/// Map a requested type to a lifetime and a construction strategy
#[derive(Clone)]
pub struct ServiceBinding {
    key: TypeKey,
    lifetime: Lifetime,
    construct: Construct,
    closer: Option<Closer>,
}

impl ServiceBinding {
    /// Bind a requested type to a factory closure.
    ///
    /// The factory receives the resolving container to look up its own dependencies.
    pub fn from_factory<S, F>(lifetime: Lifetime, factory: F) -> Self
    where
        S: ?Sized + Send + Sync + 'static,
        F: Fn(&Container) -> Result<Arc<S>, BoxError> + Send + Sync + 'static,
    {
        let construct = move |container: &Container| -> Result<Instance, Error> {
            let service = factory(container).map_err(Error::construction::<S>)?;
            Ok(Arc::new(service))
        };
        Self::new::<S>(lifetime, Arc::new(construct))
    }

    /// Bind a requested type to an implementation type built by constructor injection.
    ///
    /// The constructor with the most parameters is used, ties are won by the first declared one.
    /// There is no fallback on other constructors, and parameters without a binding are
    /// injected as `None` instead of failing.
    pub fn from_type<S, I, F>(lifetime: Lifetime, upcast: F) -> Self
    where
        S: ?Sized + Send + Sync + 'static,
        I: Injectable,
        F: Fn(I) -> Arc<S> + Send + Sync + 'static,
    {
        let selected: Option<Constructor<I>> = I::constructors()
            .into_iter()
            .reduce(|best, next| if next.arity() > best.arity() { next } else { best });
        let construct = move |container: &Container| -> Result<Instance, Error> {
            let Some(constructor) = &selected else {
                return Err(Error::Configuration(format!(
                    "No constructors found for {}",
                    type_name::<I>()
                )));
            };
            let service = upcast(constructor.build(container)?);
            Ok(Arc::new(service))
        };
        Self::new::<S>(lifetime, Arc::new(construct))
    }

    fn new<S: ?Sized + 'static>(lifetime: Lifetime, construct: Construct) -> Self {
        Self {
            key: TypeKey::of::<S>(),
            lifetime,
            construct,
            closer: None,
        }
    }

    pub fn key(&self) -> TypeKey {
        self.key
    }

    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    pub(crate) fn is_closeable(&self) -> bool {
        self.closer.is_some()
    }

    /// Run the construction strategy, with the container that owns the resulting instance
    pub(crate) fn create(&self, container: &Container) -> Result<Instance, Error> {
        let logger = container.logger();
        logger.debug(format_args!(
            "Initializing {} Service {}",
            self.lifetime, self.key
        ));
        let instance = (self.construct)(container)?;
        logger.info(format_args!(
            "Initialized {} Service {}",
            self.lifetime, self.key
        ));
        Ok(instance)
    }

    pub(crate) fn close(&self, instance: &Instance) -> Result<(), BoxError> {
        match &self.closer {
            Some(closer) => closer(instance),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ServiceBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceBinding")
            .field("key", &self.key)
            .field("lifetime", &self.lifetime)
            .field("closeable", &self.is_closeable())
            .finish()
    }
}

/// Typed access to a freshly registered binding
pub struct BindingBuilder<'a, S: ?Sized> {
    binding: &'a mut ServiceBinding,
    _service: PhantomData<fn() -> Arc<S>>,
}

impl<'a, S: ?Sized + Send + Sync + 'static> BindingBuilder<'a, S> {
    /// Close the resolved instance when its owning container is closed
    pub fn closeable(self) -> Self
    where
        S: Close,
    {
        let closer = |instance: &Instance| -> Result<(), BoxError> {
            let service = downcast::<S>(instance)?;
            service.close()
        };
        self.binding.closer = Some(Arc::new(closer));
        self
    }

    /// Wrap resolved instances in a proxy routing calls through the interception pipeline
    pub fn intercepted(self, methods: MethodTable) -> Self
    where
        S: Intercept,
    {
        let inner = self.binding.construct.clone();
        let methods = Arc::new(methods);
        let key = self.binding.key;
        let construct = move |container: &Container| -> Result<Instance, Error> {
            let target = downcast::<S>(&inner(container)?)?;
            let interception = Interception::new(key.name(), methods.clone(), container);
            let proxied: Arc<S> = S::intercept(Proxy::new(target, interception));
            Ok(Arc::new(proxied))
        };
        self.binding.construct = Arc::new(construct);
        self
    }
}

/// A group of registrations, applied to a [Registry]
pub trait Module {
    fn configure(registry: &mut Registry);
}

/// Ordered collection of service bindings and interceptor kinds
#[derive(Clone, Default)]
pub struct Registry {
    bindings: Vec<ServiceBinding>,
    catalog: InterceptorCatalog,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a binding, replacing any previous binding for the same type
    pub fn add(&mut self, binding: ServiceBinding) -> &mut ServiceBinding {
        if let Some(pos) = self.bindings.iter().position(|b| b.key == binding.key) {
            if let Ok(logger) = logging::get(module_path!()) {
                logger.warn(format_args!(
                    "{} already registered. Replacing with updated instance",
                    binding.key
                ));
            }
            self.bindings[pos] = binding;
            return &mut self.bindings[pos];
        }
        self.bindings.push(binding);
        let last = self.bindings.len() - 1;
        &mut self.bindings[last]
    }

    pub fn add_factory<S, F>(&mut self, lifetime: Lifetime, factory: F) -> BindingBuilder<'_, S>
    where
        S: ?Sized + Send + Sync + 'static,
        F: Fn(&Container) -> Result<Arc<S>, BoxError> + Send + Sync + 'static,
    {
        let binding = self.add(ServiceBinding::from_factory(lifetime, factory));
        BindingBuilder {
            binding,
            _service: PhantomData,
        }
    }

    pub fn add_singleton<S, F>(&mut self, factory: F) -> BindingBuilder<'_, S>
    where
        S: ?Sized + Send + Sync + 'static,
        F: Fn(&Container) -> Result<Arc<S>, BoxError> + Send + Sync + 'static,
    {
        self.add_factory(Lifetime::Singleton, factory)
    }

    pub fn add_scoped<S, F>(&mut self, factory: F) -> BindingBuilder<'_, S>
    where
        S: ?Sized + Send + Sync + 'static,
        F: Fn(&Container) -> Result<Arc<S>, BoxError> + Send + Sync + 'static,
    {
        self.add_factory(Lifetime::Scoped, factory)
    }

    pub fn add_transient<S, F>(&mut self, factory: F) -> BindingBuilder<'_, S>
    where
        S: ?Sized + Send + Sync + 'static,
        F: Fn(&Container) -> Result<Arc<S>, BoxError> + Send + Sync + 'static,
    {
        self.add_factory(Lifetime::Transient, factory)
    }

    /// Register an implementation type built by constructor injection.
    ///
    /// The ```bind!``` macro generates the ```upcast``` closure for trait objects.
    pub fn add_type<S, I, F>(&mut self, lifetime: Lifetime, upcast: F) -> BindingBuilder<'_, S>
    where
        S: ?Sized + Send + Sync + 'static,
        I: Injectable,
        F: Fn(I) -> Arc<S> + Send + Sync + 'static,
    {
        let binding = self.add(ServiceBinding::from_type::<S, I, F>(lifetime, upcast));
        BindingBuilder {
            binding,
            _service: PhantomData,
        }
    }

    /// Merge the bindings and interceptor kinds of another registry, in registration order
    pub fn include_registry(&mut self, other: &Registry) -> &mut Self {
        for binding in &other.bindings {
            self.add(binding.clone());
        }
        self.catalog.merge(&other.catalog);
        self
    }

    pub fn include_module<M: Module>(&mut self) -> &mut Self {
        let mut other = Registry::new();
        M::configure(&mut other);
        self.include_registry(&other)
    }

    pub fn interceptors(&self) -> &InterceptorCatalog {
        &self.catalog
    }

    pub fn interceptors_mut(&mut self) -> &mut InterceptorCatalog {
        &mut self.catalog
    }

    pub fn bindings(&self) -> impl Iterator<Item = &ServiceBinding> {
        self.bindings.iter()
    }

    pub(crate) fn into_parts(self) -> (Vec<ServiceBinding>, InterceptorCatalog) {
        (self.bindings, self.catalog)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("bindings", &self.bindings)
            .finish_non_exhaustive()
    }
}

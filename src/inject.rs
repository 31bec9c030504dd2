use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use crate::helpers::MemoCell;
use crate::intercept::InterceptorCatalog;
use crate::logging::{self, Logger};
use crate::resolve::{downcast, Instance};
use crate::*;

/// Per-binding factory wrapper.
///
/// Singleton and scoped entries always carry a memoization cell, transient entries never do.
struct FactoryEntry {
    binding: ServiceBinding,
    cell: Option<MemoCell<Instance>>,
}

impl FactoryEntry {
    fn new(binding: ServiceBinding) -> Self {
        let cell = match binding.lifetime() {
            Lifetime::Transient => None,
            Lifetime::Singleton | Lifetime::Scoped => Some(MemoCell::new()),
        };
        Self { binding, cell }
    }

    /// Same binding with an empty cell, used for scoped entries of a new scope
    fn renewed(&self) -> Self {
        Self::new(self.binding.clone())
    }

    fn lifetime(&self) -> Lifetime {
        self.binding.lifetime()
    }

    fn is_populated(&self) -> bool {
        self.cell.as_ref().map_or(false, MemoCell::is_present)
    }
}

struct Core {
    table: RwLock<HashMap<TypeKey, Arc<FactoryEntry>>>,
    parent: Option<Container>,
    catalog: Arc<InterceptorCatalog>,
    logger: Arc<dyn Logger>,
}

/// Service container, either a root container or a scope derived from another container.
///
/// This is a cheap handle: clones share the same bindings and instances.
#[derive(Clone)]
pub struct Container {
    core: Arc<Core>,
}

impl Container {
    /// Build a root container from the bindings of a registry.
    ///
    /// Fails if no logger factory has been registered.
    pub fn build(registry: Registry) -> Result<Self, Error> {
        let logger = logging::get(module_path!())?;
        logger.info(format_args!("Initializing Root Scope"));
        let (bindings, catalog) = registry.into_parts();
        let table = bindings
            .into_iter()
            .map(|binding| (binding.key(), Arc::new(FactoryEntry::new(binding))))
            .collect();
        Ok(Self {
            core: Arc::new(Core {
                table: RwLock::new(table),
                parent: None,
                catalog: Arc::new(catalog),
                logger,
            }),
        })
    }

    /// Build a root container from the registry selected by a configuration closure
    pub fn configure(configure: impl FnOnce(&mut Configurer)) -> Result<Self, Error> {
        let mut configurer = Configurer::default();
        configure(&mut configurer);
        let registry = configurer
            .registry
            .ok_or_else(|| Error::Configuration("No registry applied to the container".into()))?;
        Self::build(registry)
    }

    pub fn is_scope(&self) -> bool {
        self.core.parent.is_some()
    }

    pub fn is_registered<S: ?Sized + 'static>(&self) -> bool {
        self.read_table().contains_key(&TypeKey::of::<S>())
    }

    /// Obtain an instance of the requested type
    pub fn resolve<S: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<S>, Error> {
        let key = TypeKey::of::<S>();
        self.debug(format_args!("Resolving Service {}", key));
        match self.resolve_key(key).and_then(|instance| downcast::<S>(&instance)) {
            Ok(service) => Ok(service),
            Err(e) => {
                self.core
                    .logger
                    .error(format_args!("Error - unable to resolve Service {}: {}", key, e));
                Err(e)
            }
        }
    }

    /// Obtain an instance of the requested type, or `None` on any failure
    pub fn try_resolve<S: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<S>> {
        let key = TypeKey::of::<S>();
        self.debug(format_args!("Resolving Service {}", key));
        match self.resolve_key(key).and_then(|instance| downcast::<S>(&instance)) {
            Ok(service) => Some(service),
            Err(e) => {
                self.core.logger.warn(format_args!(
                    "Warning - unable to resolve Service {}: {}",
                    key, e
                ));
                None
            }
        }
    }

    fn resolve_key(&self, key: TypeKey) -> Result<Instance, Error> {
        let entry = self
            .read_table()
            .get(&key)
            .cloned()
            .ok_or(Error::NotRegistered(key.name()))?;
        if entry.lifetime() == Lifetime::Scoped && !self.is_scope() {
            return Err(Error::InvalidScopeUsage(key.name()));
        }
        let instance = self.instantiate(&entry)?;
        self.core.logger.info(format_args!(
            "Resolved {} Service {}",
            entry.lifetime(),
            key
        ));
        Ok(instance)
    }

    fn instantiate(&self, entry: &FactoryEntry) -> Result<Instance, Error> {
        let Some(cell) = &entry.cell else {
            return entry.binding.create(self);
        };
        cell.get_or_try_init(|| match entry.lifetime() {
            // singletons belong to the root, even when first touched through a scope
            Lifetime::Singleton => entry.binding.create(&self.root()),
            _ => entry.binding.create(self),
        })
    }

    fn root(&self) -> Container {
        match &self.core.parent {
            Some(parent) => parent.root(),
            None => self.clone(),
        }
    }

    /// Derive a scope from this container.
    ///
    /// Singleton and transient entries are shared with this container,
    /// scoped entries get a fresh cell local to the new scope.
    pub fn create_scope(&self) -> Container {
        let table = self
            .read_table()
            .iter()
            .map(|(key, entry)| {
                let entry = match entry.lifetime() {
                    Lifetime::Scoped => Arc::new(entry.renewed()),
                    Lifetime::Singleton | Lifetime::Transient => entry.clone(),
                };
                (*key, entry)
            })
            .collect();
        self.core.logger.info(format_args!("New scope created"));
        Container {
            core: Arc::new(Core {
                table: RwLock::new(table),
                parent: Some(self.clone()),
                catalog: self.core.catalog.clone(),
                logger: self.core.logger.clone(),
            }),
        }
    }

    /// Close the instances owned by this container, then drop all bindings.
    ///
    /// Transient instances belong to the caller and are never closed.
    /// Only populated entries are considered: a service is never created just to be closed.
    /// A failure while closing one service is logged and does not stop the others.
    pub fn close(&self) {
        let kind = if self.is_scope() { "Scope" } else { "Root Scope" };
        self.debug(format_args!("Closing {}", kind));
        let entries: Vec<_> = self.write_table().drain().collect();
        for (key, entry) in entries {
            if !self.is_potentially_closeable(&entry) {
                continue;
            }
            let Some(instance) = entry.cell.as_ref().and_then(MemoCell::get) else {
                continue;
            };
            if !entry.binding.is_closeable() {
                self.debug(format_args!("Service {} not closeable. Skipping...", key));
                continue;
            }
            match entry.binding.close(instance) {
                Ok(()) => self.debug(format_args!("Closed service {}", key)),
                Err(e) => self
                    .core
                    .logger
                    .error(format_args!("Error closing service {}: {}", key, e)),
            }
        }
        self.core.logger.info(format_args!("Closed {}", kind));
    }

    fn is_potentially_closeable(&self, entry: &FactoryEntry) -> bool {
        match entry.lifetime() {
            Lifetime::Transient => false,
            Lifetime::Scoped => self.is_scope() && entry.is_populated(),
            Lifetime::Singleton => !self.is_scope() && entry.is_populated(),
        }
    }

    /// Weak handle to this container, for interceptors and constructors
    pub fn resolver(&self) -> Resolver {
        Resolver {
            core: Arc::downgrade(&self.core),
        }
    }

    pub(crate) fn catalog(&self) -> &Arc<InterceptorCatalog> {
        &self.core.catalog
    }

    pub(crate) fn logger(&self) -> &dyn Logger {
        self.core.logger.as_ref()
    }

    fn debug(&self, args: fmt::Arguments<'_>) {
        if self.core.logger.is_enabled(logging::Level::Debug) {
            self.core.logger.debug(args);
        }
    }

    fn read_table(&self) -> RwLockReadGuard<'_, HashMap<TypeKey, Arc<FactoryEntry>>> {
        self.core.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_table(&self) -> RwLockWriteGuard<'_, HashMap<TypeKey, Arc<FactoryEntry>>> {
        self.core.table.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("scope", &self.is_scope())
            .field("bindings", &self.read_table().len())
            .finish()
    }
}

/// Non-owning handle to a container.
///
/// Proxies and interceptors hold a resolver rather than a container,
/// so that singletons stored in a container do not keep it alive.
#[derive(Clone)]
pub struct Resolver {
    core: Weak<Core>,
}

impl Resolver {
    pub fn container(&self) -> Result<Container, Error> {
        self.core
            .upgrade()
            .map(|core| Container { core })
            .ok_or(Error::Detached)
    }

    pub fn resolve<S: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<S>, Error> {
        self.container()?.resolve()
    }

    pub fn try_resolve<S: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<S>> {
        self.container().ok()?.try_resolve()
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("attached", &(self.core.strong_count() > 0))
            .finish()
    }
}

/// Select the registry used to build a container
#[derive(Default)]
pub struct Configurer {
    registry: Option<Registry>,
}

impl Configurer {
    pub fn apply(&mut self, registry: Registry) {
        self.registry = Some(registry);
    }

    pub fn apply_module<M: Module>(&mut self) {
        let mut registry = Registry::new();
        M::configure(&mut registry);
        self.registry = Some(registry);
    }
}

/*
 * The following is used to inject up to 10 parameters into any constructor function
 * inspired by https://nickbryan.co.uk/software/using-a-type-map-for-dependency-injection-in-rust/
 */

/// A Callable has a ```call``` function with a single argument and a single return type.
///
/// This trait is implemented for all functions with up to 10 arguments, using a tuple to
/// wrap them all in a single type.
pub trait Callable<Args, Ret> {
    fn call(&self, args: Args) -> Ret;
}

/// A constructor parameter that can be fetched from a container
pub trait Dependency: Sized {
    fn fetch(container: &Container) -> Result<Self, Error>;
}

/// Services are injected as optional: a type without binding is injected as `None`.
///
/// A registered dependency is resolved eagerly and its errors are propagated.
impl<S: ?Sized + Send + Sync + 'static> Dependency for Option<Arc<S>> {
    fn fetch(container: &Container) -> Result<Self, Error> {
        if !container.is_registered::<S>() {
            return Ok(None);
        }
        let service = container.resolve::<S>()?;
        Ok(Some(service))
    }
}

impl Dependency for Resolver {
    fn fetch(container: &Container) -> Result<Self, Error> {
        Ok(container.resolver())
    }
}

/// Tuple of constructor parameters
pub trait Dependencies: Sized {
    const ARITY: usize;
    fn fetch(container: &Container) -> Result<Self, Error>;
}

macro_rules! count {
    () => { 0usize };
    ($head:ident $($tail:ident)*) => { 1usize + count!($($tail)*) };
}

macro_rules! callable_tuple ({ $($param:ident)* } => {
    impl<Func, Ret, $($param,)*> Callable<($($param,)*), Ret> for Func
    where
        Func: Fn($($param),*) -> Ret,
    {
        #[inline]
        #[allow(non_snake_case)]
        fn call(&self, ($($param,)*): ($($param,)*)) -> Ret {
            (self)($($param,)*)
        }
    }

    // Extract such tuples for a list of parameter types
    #[allow(clippy::unused_unit)]
    impl<$($param: Dependency,)*> Dependencies for ($($param,)*) {
        const ARITY: usize = count!($($param)*);

        #[inline]
        fn fetch(_container: &Container) -> Result<Self, Error> {
            Ok(($($param::fetch(_container)?,)*))
        }
    }
});

callable_tuple! {}
callable_tuple! { A }
callable_tuple! { A B }
callable_tuple! { A B C }
callable_tuple! { A B C D }
callable_tuple! { A B C D E }
callable_tuple! { A B C D E F }
callable_tuple! { A B C D E F G }
callable_tuple! { A B C D E F G H }
callable_tuple! { A B C D E F G H I }
callable_tuple! { A B C D E F G H I J }

type Build<T> = Arc<dyn Fn(&Container) -> Result<T, Error> + Send + Sync>;

/// A constructor function with injectable parameters
pub struct Constructor<T> {
    arity: usize,
    build: Build<T>,
}

impl<T: 'static> Constructor<T> {
    pub fn new<Args, F>(constructor: F) -> Self
    where
        Args: Dependencies,
        F: Callable<Args, T> + Send + Sync + 'static,
    {
        Self {
            arity: Args::ARITY,
            build: Arc::new(move |container: &Container| -> Result<T, Error> {
                Ok(constructor.call(Args::fetch(container)?))
            }),
        }
    }

    /// A constructor which may fail, its error is reported as a construction failure
    pub fn fallible<Args, F, E>(constructor: F) -> Self
    where
        Args: Dependencies,
        F: Callable<Args, Result<T, E>> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        Self {
            arity: Args::ARITY,
            build: Arc::new(move |container: &Container| -> Result<T, Error> {
                constructor
                    .call(Args::fetch(container)?)
                    .map_err(|e| Error::construction::<T>(e.into()))
            }),
        }
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub(crate) fn build(&self, container: &Container) -> Result<T, Error> {
        (self.build)(container)
    }
}

/// Implementation types which can be built by constructor injection
pub trait Injectable: Sized + Send + Sync + 'static {
    /// All available constructors, the one with the most parameters is used
    fn constructors() -> Vec<Constructor<Self>>;
}

//! Dependency injection container with method interception.
//!
//! # Simple use case
//!
//! ```
//! # use std::sync::Arc;
//! # use interject::*;
//! // Define traits and implementors
//! trait Greeter: Send + Sync {
//!     fn greet(&self, name: &str) -> String;
//! }
//!
//! struct Polite;
//!
//! impl Greeter for Polite {
//!     fn greet(&self, name: &str) -> String {
//!         format!("Good morning, {}", name)
//!     }
//! }
//!
//! # fn main() -> Result<(), Error> {
//! // A logger factory must be registered before building containers
//! logging::register_factory(logging::TracingLogger::factory);
//!
//! // Declare the bindings, then build a container
//! let mut registry = Registry::new();
//! registry.add_singleton::<dyn Greeter, _>(|_| Ok(Arc::new(Polite)));
//! let container = Container::build(registry)?;
//!
//! let greeter: Arc<dyn Greeter> = container.resolve()?;
//! assert_eq!(greeter.greet("Ada"), "Good morning, Ada");
//! container.close();
//! # Ok(())
//! # }
//! ```
//!
//! # Mechanism
//!
//! The container is a map from requested types (based on ```TypeId```) to factory entries.
//! Instances are stored as ```Arc<S>``` behind the ```Any``` trait and recovered by downcasting.
//!
//! * A [Registry] collects [ServiceBinding]s, each associating a requested type with a
//!   [Lifetime] and a construction strategy: either a factory closure, or an [Injectable]
//!   implementation type whose constructor parameters are injected from the container.
//! * A [Container] built from the registry resolves instances lazily. Singleton and scoped
//!   entries are memoized in a thread-safe cell, transient entries are built on each resolution.
//! * [Container::create_scope] derives a scope sharing the singleton entries of its parent and
//!   holding its own scoped instances. Scoped services cannot be resolved from the root.
//! * [Container::close] closes the instantiated services it owns, if they implement [Close].
//!
//! Trait objects implementing [Intercept] can be registered as intercepted: resolved instances
//! are then wrapped in a [Proxy] which builds an interceptor [Pipeline] on each method call,
//! from the [InterceptorSpec]s declared for this method in a [MethodTable].
//! See the [intercept] module for the call protocol and [policies] for the built-in interceptors.

mod helpers;
mod inject;
pub mod intercept;
pub mod logging;
pub mod policies;
mod resolve;

pub use helpers::MemoCell;
pub use inject::{
    Callable, Configurer, Constructor, Container, Dependencies, Dependency, Injectable, Resolver,
};
pub use intercept::{
    Call, Disposition, Failure, Flow, Intercept, Interceptor, InterceptorCatalog, InterceptorKind,
    InterceptorSpec, MethodTable, Pipeline, Proxy,
};
pub use policies::{Interrupt, ProfileConfig, RetryConfig};
pub use resolve::{
    BindingBuilder, BoxError, Close, Error, Lifetime, Module, Registry, ServiceBinding, TypeKey,
};

#[cfg(test)]
mod tests;

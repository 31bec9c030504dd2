//! Logger facade
//!
//! Loggers are obtained by name from a process-wide factory, which must be registered
//! with [register_factory] before any container is built.
//! [TracingLogger] forwards to the ```tracing``` ecosystem.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::Error;

/// Logging levels, in increasing severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn abbreviation(&self) -> &'static str {
        match self {
            Level::Trace => "TRC",
            Level::Debug => "DBG",
            Level::Info => "INF",
            Level::Warn => "WRN",
            Level::Error => "ERR",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.abbreviation())
    }
}

/// Leveled log sink
pub trait Logger: Send + Sync {
    fn is_enabled(&self, level: Level) -> bool;

    fn log(&self, level: Level, args: fmt::Arguments<'_>);

    fn trace(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Trace, args);
    }

    fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args);
    }

    fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args);
    }

    fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args);
    }

    fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args);
    }
}

type LoggerFactory = Arc<dyn Fn(&'static str) -> Arc<dyn Logger> + Send + Sync>;

static FACTORY: RwLock<Option<LoggerFactory>> = RwLock::new(None);

/// Register the factory used to create named loggers, replacing any previous one
pub fn register_factory<F>(factory: F)
where
    F: Fn(&'static str) -> Arc<dyn Logger> + Send + Sync + 'static,
{
    let mut slot = FACTORY.write().unwrap_or_else(PoisonError::into_inner);
    *slot = Some(Arc::new(factory));
}

/// Obtain a named logger from the registered factory
pub fn get(name: &'static str) -> Result<Arc<dyn Logger>, Error> {
    let factory = FACTORY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .ok_or(Error::LoggerNotConfigured)?;
    Ok(factory(name))
}

/// Logger emitting ```tracing``` events, with the logger name as a field
#[derive(Debug, Clone, Copy)]
pub struct TracingLogger {
    name: &'static str,
}

impl TracingLogger {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }

    /// Factory function suitable for [register_factory]
    pub fn factory(name: &'static str) -> Arc<dyn Logger> {
        Arc::new(Self::new(name))
    }
}

impl Logger for TracingLogger {
    fn is_enabled(&self, level: Level) -> bool {
        match level {
            Level::Trace => tracing::enabled!(tracing::Level::TRACE),
            Level::Debug => tracing::enabled!(tracing::Level::DEBUG),
            Level::Info => tracing::enabled!(tracing::Level::INFO),
            Level::Warn => tracing::enabled!(tracing::Level::WARN),
            Level::Error => tracing::enabled!(tracing::Level::ERROR),
        }
    }

    fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        let logger = self.name;
        match level {
            Level::Trace => tracing::trace!(logger, "{}", args),
            Level::Debug => tracing::debug!(logger, "{}", args),
            Level::Info => tracing::info!(logger, "{}", args),
            Level::Warn => tracing::warn!(logger, "{}", args),
            Level::Error => tracing::error!(logger, "{}", args),
        }
    }
}

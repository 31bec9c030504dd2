//! Built-in interceptors: retry with backoff, profiling and the no-op error handler

use std::any::Any;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};

use crate::intercept::{Call, Disposition, Failure, Flow, Interceptor, InterceptorKind, InterceptorSpec};
use crate::logging::{self, Level, Logger};
use crate::*;

/// Interceptor with neutral hooks.
///
/// This is the default kind of the ```handle-errors``` tag: errors are left unhandled.
#[derive(Debug, Default)]
pub struct NoopInterceptor;

impl NoopInterceptor {
    pub const KIND: &'static str = "noop";
}

impl Interceptor for NoopInterceptor {}

impl InterceptorKind for NoopInterceptor {
    type Config = IgnoredAny;

    fn from_config(_config: IgnoredAny) -> Result<Self, Error> {
        Ok(NoopInterceptor)
    }
}

/// Configuration of the retry interceptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    /// Total number of attempts, including the initial call
    pub tries: u32,
    pub back_off_interval_millis: u64,
    pub exponential: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            tries: 1,
            back_off_interval_millis: 1000,
            exponential: false,
        }
    }
}

impl RetryConfig {
    /// Delay before the re-attempt following failed attempt number ```attempt``` (starting at 1)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = if self.exponential {
            1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX)
        } else {
            u64::from(attempt)
        };
        Duration::from_millis(self.back_off_interval_millis.saturating_mul(factor))
    }
}

impl From<RetryConfig> for InterceptorSpec {
    fn from(config: RetryConfig) -> Self {
        InterceptorSpec::new("retry").with_config(serde_json::to_value(config).unwrap_or_default())
    }
}

/// Signal used to abort the backoff sleep of retrying calls.
///
/// When an ```Interrupt``` service is registered, retry interceptors fetch it on attach
/// and stop retrying as soon as it is raised.
#[derive(Debug, Default)]
pub struct Interrupt {
    raised: Mutex<bool>,
    signal: Condvar,
}

/// The backoff sleep was interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        *self.raised.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.signal.notify_all();
    }

    pub fn reset(&self) {
        *self.raised.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    pub fn is_raised(&self) -> bool {
        *self.raised.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for the given duration, unless the interrupt is or gets raised
    pub fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        let raised = self.raised.lock().unwrap_or_else(PoisonError::into_inner);
        let (raised, _) = self
            .signal
            .wait_timeout_while(raised, duration, |raised| !*raised)
            .unwrap_or_else(PoisonError::into_inner);
        if *raised {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Re-invoke a failed method until it succeeds or the number of tries is exhausted.
///
/// A successful re-attempt handles the error: its return value is discarded
/// and the intercepted call returns no result.
pub struct RetryInterceptor {
    config: RetryConfig,
    attempt: u32,
    interrupt: Option<Arc<Interrupt>>,
    logger: Arc<dyn Logger>,
}

impl RetryInterceptor {
    pub const KIND: &'static str = "retry";

    fn backoff(&self) -> Result<(), Interrupted> {
        let delay = self.config.backoff(self.attempt);
        self.logger
            .debug(format_args!("Backing off by {} ms", delay.as_millis()));
        match &self.interrupt {
            Some(interrupt) => interrupt.sleep(delay),
            None => {
                thread::sleep(delay);
                Ok(())
            }
        }
    }
}

impl Interceptor for RetryInterceptor {
    fn attach(&mut self, resolver: Resolver) {
        self.interrupt = resolver
            .container()
            .ok()
            .filter(Container::is_registered::<Interrupt>)
            .and_then(|container| container.try_resolve());
    }

    fn on_error(&mut self, call: &Call<'_>, failure: &Failure<'_>) -> Disposition {
        self.logger.warn(format_args!(
            "{} failed on first attempt. Will try a total of {} times.",
            call, self.config.tries
        ));
        self.logger.debug(format_args!(
            "Initiating {} backoff strategy",
            if self.config.exponential { "exponential" } else { "linear" }
        ));

        let mut last_error: Option<BoxError> = None;
        loop {
            if self.attempt >= self.config.tries {
                let reason = match &last_error {
                    Some(e) => e.to_string(),
                    None => failure.error().to_string(),
                };
                self.logger.error(format_args!(
                    "{} failed on try {}. {}",
                    call, self.attempt, reason
                ));
                return Disposition::Unhandled;
            }

            if self.backoff().is_err() {
                self.logger.warn(format_args!(
                    "Backoff of {} was interrupted, giving up after {} tries",
                    call, self.attempt
                ));
                return Disposition::Unhandled;
            }

            match failure.reinvoke() {
                Ok(()) => {
                    self.logger
                        .info(format_args!("{} succeeded on try {}", call, self.attempt + 1));
                    return Disposition::Handled;
                }
                Err(e) => last_error = Some(e),
            }
            self.attempt += 1;
        }
    }
}

impl InterceptorKind for RetryInterceptor {
    type Config = RetryConfig;

    fn from_config(config: RetryConfig) -> Result<Self, Error> {
        if config.tries < 1 {
            return Err(Error::Configuration(
                "Retry interceptor requires at least one try".into(),
            ));
        }
        Ok(Self {
            config,
            attempt: 1,
            interrupt: None,
            logger: logging::get(module_path!())?,
        })
    }
}

/// Configuration of the profile interceptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProfileConfig {
    pub default_level: Level,
    pub threshold_exceeded_level: Level,
    /// Threshold above which ```threshold_exceeded_level``` is used, disabled if not positive
    pub threshold_millis: i64,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            default_level: Level::Debug,
            threshold_exceeded_level: Level::Warn,
            threshold_millis: -1,
        }
    }
}

impl From<ProfileConfig> for InterceptorSpec {
    fn from(config: ProfileConfig) -> Self {
        InterceptorSpec::new("profile").with_config(serde_json::to_value(config).unwrap_or_default())
    }
}

/// Log the execution time of intercepted calls
pub struct ProfileInterceptor {
    config: ProfileConfig,
    start: Option<Instant>,
    logger: Arc<dyn Logger>,
}

impl ProfileInterceptor {
    pub const KIND: &'static str = "profile";
}

impl Interceptor for ProfileInterceptor {
    fn before_invoke(&mut self, call: &Call<'_>) -> Flow {
        self.logger
            .log(self.config.default_level, format_args!("Executing {}", call));
        self.start = Some(Instant::now());
        Flow::Proceed
    }

    fn after_invoke(&mut self, call: &Call<'_>, _result: Option<&dyn Any>) {
        let elapsed = self.start.map(|start| start.elapsed()).unwrap_or_default();
        let threshold = u128::try_from(self.config.threshold_millis).unwrap_or(0);
        let level = if threshold > 0 && elapsed.as_millis() > threshold {
            self.config.threshold_exceeded_level
        } else {
            self.config.default_level
        };
        if threshold > 0 {
            self.logger.log(
                level,
                format_args!(
                    "Executed {} in {} μs (threshold = {} ms)",
                    call,
                    elapsed.as_micros(),
                    threshold
                ),
            );
        } else {
            self.logger.log(
                level,
                format_args!("Executed {} in {} μs", call, elapsed.as_micros()),
            );
        }
    }
}

impl InterceptorKind for ProfileInterceptor {
    type Config = ProfileConfig;

    fn from_config(config: ProfileConfig) -> Result<Self, Error> {
        Ok(Self {
            config,
            start: None,
            logger: logging::get(module_path!())?,
        })
    }
}

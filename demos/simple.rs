use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use interject::*;
use tracing_subscriber::EnvFilter;

// Define regular traits and implementor structs

trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

#[derive(Debug, thiserror::Error)]
enum FeedError {
    #[error("feed is unavailable")]
    Unavailable,
    #[error(transparent)]
    Wiring(#[from] Error),
}

trait Feed: Send + Sync {
    fn latest(&self) -> Result<String, FeedError>;
}

struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }
}

/// Feed which fails on its first call
struct NewsFeed {
    clock: Option<Arc<dyn Clock>>,
    calls: AtomicU32,
}

impl NewsFeed {
    fn new(clock: Option<Arc<dyn Clock>>) -> Self {
        Self {
            clock,
            calls: AtomicU32::new(0),
        }
    }
}

impl Injectable for NewsFeed {
    fn constructors() -> Vec<Constructor<Self>> {
        vec![Constructor::new(NewsFeed::new)]
    }
}

impl Feed for NewsFeed {
    fn latest(&self) -> Result<String, FeedError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(FeedError::Unavailable);
        }
        let now = self.clock.as_ref().map(|c| c.now()).unwrap_or_default();
        Ok(format!("{}s since epoch", now))
    }
}

// Route the Feed methods through the interception pipeline

struct FeedProxy(Proxy<dyn Feed>);

impl Feed for FeedProxy {
    fn latest(&self) -> Result<String, FeedError> {
        self.0.call_or_default("latest", |feed| feed.latest())
    }
}

impl Intercept for dyn Feed {
    fn intercept(proxy: Proxy<Self>) -> Arc<Self> {
        Arc::new(FeedProxy(proxy))
    }
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    logging::register_factory(logging::TracingLogger::factory);

    let methods = MethodTable::new().method(
        "latest",
        [
            InterceptorSpec::from(ProfileConfig::default()),
            InterceptorSpec::from(RetryConfig {
                tries: 3,
                back_off_interval_millis: 200,
                exponential: true,
            }),
        ],
    );

    let container = Container::configure(|config| {
        let mut registry = Registry::new();
        registry.add_singleton::<dyn Clock, _>(|_| Ok(Arc::new(SystemClock)));
        bind!(registry, Transient, dyn Feed => NewsFeed).intercepted(methods);
        config.apply(registry);
    })?;

    let scope = container.create_scope();
    let feed: Arc<dyn Feed> = scope.resolve()?;

    // the first call fails and is retried, the retried value is not returned
    match feed.latest() {
        Ok(value) => println!("retried call returned {:?}", value),
        Err(e) => println!("call failed: {}", e),
    }
    match feed.latest() {
        Ok(value) => println!("second call returned {:?}", value),
        Err(e) => println!("call failed: {}", e),
    }

    scope.close();
    container.close();
    Ok(())
}

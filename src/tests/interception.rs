use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::json;

use super::init;
use crate::*;

#[derive(Debug, thiserror::Error)]
enum AccountError {
    #[error("insufficient funds")]
    Insufficient,
    #[error(transparent)]
    Wiring(#[from] Error),
}

trait Account: Send + Sync {
    fn withdraw(&self, amount: u32) -> Result<u32, AccountError>;
    fn calls(&self) -> u32;
}

/// Fails with ```Insufficient``` until the given attempt
struct Flaky {
    calls: AtomicU32,
    succeed_on: u32,
}

impl Flaky {
    fn new(succeed_on: u32) -> Self {
        Self {
            calls: AtomicU32::new(0),
            succeed_on,
        }
    }
}

impl Account for Flaky {
    fn withdraw(&self, amount: u32) -> Result<u32, AccountError> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt < self.succeed_on {
            return Err(AccountError::Insufficient);
        }
        Ok(100 - amount)
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

struct AccountProxy(Proxy<dyn Account>);

impl Account for AccountProxy {
    fn withdraw(&self, amount: u32) -> Result<u32, AccountError> {
        self.0
            .call_or_default("withdraw", |account| account.withdraw(amount))
    }

    fn calls(&self) -> u32 {
        self.0.target().calls()
    }
}

impl Intercept for dyn Account {
    fn intercept(proxy: Proxy<Self>) -> Arc<Self> {
        Arc::new(AccountProxy(proxy))
    }
}

/// Shared record of interceptor hooks
#[derive(Default)]
struct Journal(Mutex<Vec<String>>);

impl Journal {
    fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

#[derive(Deserialize)]
struct RecorderConfig {
    name: String,
    #[serde(default)]
    stop: bool,
    #[serde(default)]
    handle: bool,
}

/// Record hook calls in the ```Journal``` service
struct Recorder {
    config: RecorderConfig,
    journal: Option<Arc<Journal>>,
}

impl Recorder {
    fn record(&self, hook: &str) {
        if let Some(journal) = &self.journal {
            journal.push(format!("{}:{}", hook, self.config.name));
        }
    }
}

impl Interceptor for Recorder {
    fn attach(&mut self, resolver: Resolver) {
        self.journal = resolver.resolve::<Journal>().ok();
    }

    fn before_invoke(&mut self, _call: &Call<'_>) -> Flow {
        self.record("before");
        if self.config.stop {
            Flow::Stop
        } else {
            Flow::Proceed
        }
    }

    fn after_invoke(&mut self, _call: &Call<'_>, result: Option<&dyn Any>) {
        match result.and_then(|r| r.downcast_ref::<u32>()) {
            Some(value) => self.record(&format!("after({})", value)),
            None => self.record("after"),
        }
    }

    fn on_error(&mut self, _call: &Call<'_>, _failure: &Failure<'_>) -> Disposition {
        self.record("error");
        if self.config.handle {
            Disposition::Handled
        } else {
            Disposition::Unhandled
        }
    }
}

impl InterceptorKind for Recorder {
    type Config = RecorderConfig;

    fn from_config(config: RecorderConfig) -> Result<Self, Error> {
        Ok(Self {
            config,
            journal: None,
        })
    }
}

fn record(name: &str) -> InterceptorSpec {
    InterceptorSpec::new("record").with_config(json!({ "name": name }))
}

/// Registry with an intercepted account, failing until ```succeed_on```
fn account_registry(succeed_on: u32, specs: Vec<InterceptorSpec>) -> Registry {
    let mut registry = Registry::new();
    registry
        .interceptors_mut()
        .register_kind::<Recorder>("recorder")
        .declare_tag("record", "recorder");
    registry.add_singleton(|_| Ok(Arc::new(Journal::default())));
    registry
        .add_transient::<dyn Account, _>(move |_| Ok(Arc::new(Flaky::new(succeed_on))))
        .intercepted(MethodTable::new().method("withdraw", specs));
    registry
}

fn fast_retry(tries: u32) -> InterceptorSpec {
    RetryConfig {
        tries,
        back_off_interval_millis: 1,
        exponential: false,
    }
    .into()
}

#[test]
fn hooks_run_forward_then_backward() -> Result<(), Error> {
    init();
    let container = Container::build(account_registry(1, vec![record("a"), record("b")]))?;
    let account: Arc<dyn Account> = container.resolve()?;
    let journal: Arc<Journal> = container.resolve()?;

    assert_eq!(account.withdraw(30).unwrap(), 70);
    assert_eq!(
        journal.entries(),
        vec!["before:a", "before:b", "after(70):b", "after(70):a"]
    );
    Ok(())
}

#[test]
fn before_hook_can_veto_the_call() -> Result<(), Error> {
    init();
    let veto = InterceptorSpec::new("record").with_config(json!({ "name": "a", "stop": true }));
    let container = Container::build(account_registry(1, vec![veto, record("b")]))?;
    let account: Arc<dyn Account> = container.resolve()?;
    let journal: Arc<Journal> = container.resolve()?;

    assert_eq!(account.withdraw(30).unwrap(), 0);
    assert_eq!(account.calls(), 0);
    assert_eq!(journal.entries(), vec!["before:a"]);
    Ok(())
}

#[test]
fn first_handler_claims_the_error() -> Result<(), Error> {
    init();
    let handler = |name: &str| {
        InterceptorSpec::new("record").with_config(json!({ "name": name, "handle": true }))
    };
    let container = Container::build(account_registry(2, vec![handler("a"), handler("b")]))?;
    let account: Arc<dyn Account> = container.resolve()?;
    let journal: Arc<Journal> = container.resolve()?;

    assert_eq!(account.withdraw(30).unwrap(), 0);
    assert_eq!(
        journal.entries(),
        vec!["before:a", "before:b", "error:a", "after:b", "after:a"]
    );
    Ok(())
}

#[test]
fn unhandled_error_reaches_the_caller() -> Result<(), Error> {
    init();
    let container = Container::build(account_registry(2, vec![record("a"), record("b")]))?;
    let account: Arc<dyn Account> = container.resolve()?;
    let journal: Arc<Journal> = container.resolve()?;

    let err = account.withdraw(30).unwrap_err();
    assert!(matches!(err, AccountError::Insufficient));
    assert_eq!(
        journal.entries(),
        vec!["before:a", "before:b", "error:a", "error:b"]
    );
    Ok(())
}

#[test]
fn retry_until_success() -> Result<(), Error> {
    init();
    let container = Container::build(account_registry(6, vec![fast_retry(6)]))?;
    let account: Arc<dyn Account> = container.resolve()?;

    // the value of the successful retry is not returned
    assert_eq!(account.withdraw(30).unwrap(), 0);
    assert_eq!(account.calls(), 6);
    Ok(())
}

#[test]
fn retry_gives_up_after_all_tries() -> Result<(), Error> {
    init();
    let container = Container::build(account_registry(u32::MAX, vec![fast_retry(4)]))?;
    let account: Arc<dyn Account> = container.resolve()?;

    let err = account.withdraw(30).unwrap_err();
    assert!(matches!(err, AccountError::Insufficient));
    assert_eq!(account.calls(), 4);
    Ok(())
}

#[test]
fn retry_handles_before_later_interceptors() -> Result<(), Error> {
    init();
    let container = Container::build(account_registry(2, vec![fast_retry(3), record("b")]))?;
    let account: Arc<dyn Account> = container.resolve()?;
    let journal: Arc<Journal> = container.resolve()?;

    assert!(account.withdraw(30).is_ok());
    assert_eq!(account.calls(), 2);
    assert_eq!(journal.entries(), vec!["before:b", "after:b"]);
    Ok(())
}

#[test]
fn backoff_schedules() {
    let linear = RetryConfig {
        tries: 4,
        back_off_interval_millis: 100,
        exponential: false,
    };
    let delays: Vec<_> = (1..4).map(|n| linear.backoff(n).as_millis()).collect();
    assert_eq!(delays, vec![100, 200, 300]);

    let exponential = RetryConfig {
        exponential: true,
        ..linear
    };
    let delays: Vec<_> = (1..5).map(|n| exponential.backoff(n).as_millis()).collect();
    assert_eq!(delays, vec![100, 200, 400, 800]);
}

#[test]
fn interrupted_backoff_stops_retrying() -> Result<(), Error> {
    init();
    let slow_retry: InterceptorSpec = RetryConfig {
        tries: 5,
        back_off_interval_millis: 60_000,
        exponential: false,
    }
    .into();
    let mut registry = account_registry(u32::MAX, vec![slow_retry]);
    registry.add_singleton(|_| Ok(Arc::new(Interrupt::new())));
    let container = Container::build(registry)?;

    let interrupt: Arc<Interrupt> = container.resolve()?;
    interrupt.raise();
    assert!(interrupt.is_raised());

    let account: Arc<dyn Account> = container.resolve()?;
    let start = Instant::now();
    let err = account.withdraw(30).unwrap_err();
    assert!(matches!(err, AccountError::Insufficient));
    assert_eq!(account.calls(), 1);
    assert!(start.elapsed() < Duration::from_secs(30));

    interrupt.reset();
    assert!(!interrupt.is_raised());
    Ok(())
}

#[test]
fn interrupt_wakes_a_sleeping_backoff() -> Result<(), Error> {
    init();
    let slow_retry: InterceptorSpec = RetryConfig {
        tries: 3,
        back_off_interval_millis: 60_000,
        exponential: false,
    }
    .into();
    let mut registry = account_registry(u32::MAX, vec![slow_retry]);
    registry.add_singleton(|_| Ok(Arc::new(Interrupt::new())));
    let container = Container::build(registry)?;

    let interrupt: Arc<Interrupt> = container.resolve()?;
    let account: Arc<dyn Account> = container.resolve()?;
    assert!(!interrupt.is_raised());

    let raiser = {
        let interrupt = interrupt.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            interrupt.raise();
        })
    };
    let start = Instant::now();
    let err = account.withdraw(30).unwrap_err();
    let elapsed = start.elapsed();
    raiser.join().unwrap();

    assert!(matches!(err, AccountError::Insufficient));
    assert_eq!(account.calls(), 1);
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_secs(30));
    Ok(())
}

#[test]
fn invalid_metadata_fails_before_the_call() -> Result<(), Error> {
    init();
    let invalid = vec![
        InterceptorSpec::new("audit"),
        InterceptorSpec::new("retry").using("circuit-breaker"),
        InterceptorSpec::new("retry").with_config(json!({ "tries": "many" })),
        InterceptorSpec::new("retry").with_config(json!({ "tries": 0 })),
    ];
    for spec in invalid {
        let container = Container::build(account_registry(1, vec![record("a"), spec]))?;
        let account: Arc<dyn Account> = container.resolve()?;
        let journal: Arc<Journal> = container.resolve()?;

        let err = account.withdraw(30).unwrap_err();
        assert!(matches!(
            err,
            AccountError::Wiring(Error::Configuration(_))
        ));
        assert_eq!(account.calls(), 0);
        assert!(journal.entries().is_empty());
    }
    Ok(())
}

#[test]
fn handle_errors_defaults_to_noop() -> Result<(), Error> {
    init();
    let spec = InterceptorSpec::new("handle-errors");
    let container = Container::build(account_registry(2, vec![spec]))?;
    let account: Arc<dyn Account> = container.resolve()?;

    assert!(matches!(
        account.withdraw(30).unwrap_err(),
        AccountError::Insufficient
    ));
    Ok(())
}

#[test]
fn profile_passes_results_through() -> Result<(), Error> {
    init();
    let profile: InterceptorSpec = ProfileConfig {
        threshold_millis: 1,
        ..Default::default()
    }
    .into();
    let container = Container::build(account_registry(1, vec![profile, record("a")]))?;
    let account: Arc<dyn Account> = container.resolve()?;
    let journal: Arc<Journal> = container.resolve()?;

    assert_eq!(account.withdraw(10).unwrap(), 90);
    assert_eq!(journal.entries(), vec!["before:a", "after(90):a"]);
    Ok(())
}

#[test]
fn method_table_from_json() -> Result<(), Error> {
    init();
    let table = MethodTable::from_json(
        r#"{
            "withdraw": [
                { "tag": "profile", "config": { "defaultLevel": "INFO", "thresholdMillis": 50 } },
                { "tag": "record", "config": { "name": "json" } },
                { "tag": "retry", "interceptor": "retry", "config": { "tries": 2, "backOffIntervalMillis": 0 } }
            ]
        }"#,
    )?;
    assert_eq!(table.specs("withdraw").len(), 3);
    assert!(table.specs("deposit").is_empty());

    let mut registry = account_registry(1, Vec::new());
    registry
        .add_singleton::<dyn Account, _>(|_| Ok(Arc::new(Flaky::new(2))))
        .intercepted(table);
    let container = Container::build(registry)?;
    let account: Arc<dyn Account> = container.resolve()?;
    let journal: Arc<Journal> = container.resolve()?;

    assert_eq!(account.withdraw(10).unwrap(), 0);
    assert_eq!(account.calls(), 2);
    assert_eq!(journal.entries(), vec!["before:json", "after:json"]);

    assert!(MethodTable::from_json("[1, 2]").is_err());
    Ok(())
}

#[test]
fn singleton_proxy_resolved_through_scope() -> Result<(), Error> {
    init();
    let mut registry = account_registry(1, Vec::new());
    registry
        .add_singleton::<dyn Account, _>(|_| Ok(Arc::new(Flaky::new(1))))
        .intercepted(MethodTable::new().method("withdraw", vec![record("s")]));
    let container = Container::build(registry)?;
    let scope = container.create_scope();

    let a1: Arc<dyn Account> = scope.resolve()?;
    let a2: Arc<dyn Account> = container.resolve()?;
    assert!(Arc::ptr_eq(&a1, &a2));

    scope.close();
    assert_eq!(a1.withdraw(40).unwrap(), 60);
    let journal: Arc<Journal> = container.resolve()?;
    assert_eq!(journal.entries(), vec!["before:s", "after(60):s"]);
    Ok(())
}

#[test]
fn pipeline_without_container() {
    init();
    let mut catalog = InterceptorCatalog::empty();
    catalog
        .register_kind::<Recorder>("recorder")
        .declare_tag("record", "recorder");
    let interceptor = catalog.instantiate(&record("solo"));
    assert!(interceptor.is_ok());
    assert!(catalog.instantiate(&InterceptorSpec::new("retry")).is_err());

    let mut pipeline = Pipeline::new(vec![Box::new(policies::NoopInterceptor)]);
    assert_eq!(pipeline.len(), 1);
    let call_count = AtomicU32::new(0);
    let outcome: Result<Option<u32>, AccountError> = pipeline.dispatch(
        &Call::new("Ledger", "total"),
        || {
            call_count.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        },
    );
    assert_eq!(outcome.unwrap(), Some(7));
    assert_eq!(call_count.load(Ordering::SeqCst), 1);
}

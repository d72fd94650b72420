//! End-to-end behaviour of admission, fallback routing and recording.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use tollgate_core::{
    AdmissionGate, CircuitBreaker, CircuitBreakerConfig, Clock, GatewayConfig, LedgerStore, ManualClock,
    QuotaLedger, QuotaScope, RecordStatus, Rejection, Tier,
};
use tollgate_runtime::{
    AttemptClass, FallbackRouter, Gateway, GatewayError, GenerationOptions, GenerationProvider,
    GenerationRequest, GenerationResponse, ProviderCatalog, ProviderDescriptor, ProviderError,
    ProviderRegistry, RouterError, TokenUsage,
};

fn reply(text: &str) -> GenerationResponse {
    GenerationResponse {
        text: text.to_string(),
        usage: TokenUsage {
            prompt_tokens: 12,
            completion_tokens: 30,
            ..Default::default()
        },
        model: "claude-sonnet-4-5".to_string(),
        cost: None,
    }
}

enum Behaviour {
    Succeed,
    Hang(Duration),
    Fail(ProviderError),
    /// Mark every provider unhealthy, then fail
    Sabotage(Arc<ProviderRegistry>),
    /// Cancel the caller's token, then fail
    Cancel(CancellationToken),
}

struct TestProvider {
    label: &'static str,
    behaviour: Behaviour,
    calls: AtomicU32,
}

impl TestProvider {
    fn new(label: &'static str, behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            label,
            behaviour,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationProvider for TestProvider {
    async fn generate(
        &self,
        _prompt: &str,
        _options: &GenerationOptions,
    ) -> Result<GenerationResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behaviour {
            Behaviour::Succeed => Ok(reply(self.label)),
            Behaviour::Hang(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(reply("too late"))
            }
            Behaviour::Fail(error) => Err(error.clone()),
            Behaviour::Sabotage(registry) => {
                for descriptor in registry.list() {
                    registry.mark_unhealthy(&descriptor.name).ok();
                }
                Err(ProviderError::HttpError("connection reset".into()))
            }
            Behaviour::Cancel(token) => {
                token.cancel();
                Err(ProviderError::HttpError("connection reset".into()))
            }
        }
    }

    fn name(&self) -> &str {
        self.label
    }
}

fn router(registry: Arc<ProviderRegistry>, providers: &[Arc<TestProvider>]) -> FallbackRouter {
    for (i, provider) in providers.iter().enumerate() {
        registry
            .register(
                ProviderDescriptor::new(provider.label, i as u32 + 1),
                provider.clone(),
            )
            .unwrap();
    }
    FallbackRouter::new(registry, Duration::from_secs(30))
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 9, 14, 8, 0, 0).unwrap(),
    ))
}

#[tokio::test(start_paused = true)]
async fn two_timeouts_then_third_provider_serves() {
    let providers = vec![
        TestProvider::new("provider-1", Behaviour::Hang(Duration::from_secs(120))),
        TestProvider::new("provider-2", Behaviour::Hang(Duration::from_secs(120))),
        TestProvider::new("provider-3", Behaviour::Succeed),
    ];
    let router = router(Arc::new(ProviderRegistry::new(3)), &providers);

    let outcome = router.generate("hi", &GenerationOptions::default()).await;

    assert!(outcome.success);
    assert_eq!(outcome.provider.as_deref(), Some("provider-3"));
    assert_eq!(outcome.attempts.len(), 3);
    assert_eq!(outcome.attempts[0].class, AttemptClass::Timeout);
    assert_eq!(outcome.attempts[1].class, AttemptClass::Timeout);
    assert_eq!(outcome.attempts[2].class, AttemptClass::Success);
}

#[tokio::test(start_paused = true)]
async fn all_providers_fail_with_distinct_classes() {
    let providers = vec![
        TestProvider::new("slow", Behaviour::Hang(Duration::from_secs(120))),
        TestProvider::new(
            "locked",
            Behaviour::Fail(ProviderError::AuthError("invalid x-api-key".into())),
        ),
        TestProvider::new(
            "flaky",
            Behaviour::Fail(ProviderError::ApiError {
                status: 503,
                message: "overloaded".into(),
            }),
        ),
    ];
    let router = router(Arc::new(ProviderRegistry::new(3)), &providers);

    let error = router
        .generate("hi", &GenerationOptions::default())
        .await
        .into_result()
        .unwrap_err();

    let attempts = match error {
        RouterError::AllProvidersExhausted { attempts } => attempts,
        other => panic!("expected exhaustion, got {other:?}"),
    };
    let classes: Vec<AttemptClass> = attempts.iter().map(|a| a.class).collect();
    assert_eq!(
        classes,
        vec![AttemptClass::Timeout, AttemptClass::Auth, AttemptClass::Transient]
    );
}

#[tokio::test]
async fn no_provider_is_tried_twice_when_health_changes_mid_call() {
    let registry = Arc::new(ProviderRegistry::new(3));
    let providers = vec![
        TestProvider::new("a", Behaviour::Sabotage(registry.clone())),
        TestProvider::new("b", Behaviour::Sabotage(registry.clone())),
        TestProvider::new("c", Behaviour::Sabotage(registry.clone())),
    ];
    let router = router(registry, &providers);

    let outcome = router.generate("hi", &GenerationOptions::default()).await;

    assert!(!outcome.success);
    assert_eq!(outcome.attempts.len(), 3);
    for provider in &providers {
        assert_eq!(provider.calls(), 1, "{} attempted more than once", provider.label);
    }
}

#[tokio::test]
async fn cancellation_stops_the_chain_and_records_once() {
    let dir = tempfile::tempdir().unwrap();
    let clock = clock();
    let cancel = CancellationToken::new();
    let first = TestProvider::new("first", Behaviour::Cancel(cancel.clone()));
    let second = TestProvider::new("second", Behaviour::Succeed);

    let config = GatewayConfig::from_yaml("tiers:\n  pro: { preset: pro }\n").unwrap();
    let gateway = Gateway::builder()
        .config(config)
        .clock(clock.clone())
        .catalog(ProviderCatalog::new())
        .ledger_dir(dir.path())
        .provider(ProviderDescriptor::new("first", 1), first.clone())
        .provider(ProviderDescriptor::new("second", 2), second.clone())
        .build()
        .unwrap();

    let error = gateway
        .generate_with_cancel("pro", GenerationRequest::new("hi"), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(
        &error,
        GatewayError::Routing(RouterError::Cancelled { attempts }) if attempts.len() == 1
    ));
    assert_eq!(second.calls(), 0);

    let store = LedgerStore::open(dir.path()).unwrap();
    let records = store.load_month(clock.now()).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, RecordStatus::Cancelled);
    assert_eq!(records[0].total_tokens, 0);
}

#[test]
fn free_tier_rejects_the_fifty_first_request_of_the_day() {
    let clock = clock();
    let ledger = Arc::new(QuotaLedger::new("free", Tier::free(), clock.clone()));
    let breaker = Arc::new(CircuitBreaker::new(
        "free",
        CircuitBreakerConfig::default(),
        clock.clone(),
    ));
    let mut gate = AdmissionGate::new();
    gate.insert(Arc::new(QuotaScope::new(ledger.clone(), breaker)));

    // Stay under the hourly cap of 20 by spreading the day's traffic.
    for i in 0..50 {
        if i > 0 && i % 17 == 0 {
            clock.advance(ChronoDuration::hours(1));
        }
        let decision = gate.admit(10, 0.0, "free").unwrap();
        assert!(decision.allowed, "request {} rejected", i + 1);
        ledger.record(10, 0.0, RecordStatus::Success);
    }
    clock.advance(ChronoDuration::hours(1));

    let decision = gate.admit(10, 0.0, "free").unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.http_status, 429);
    assert_eq!(
        decision.reason().as_deref(),
        Some("daily request limit reached (50)")
    );
    assert!(decision.retry_after_seconds > 0);
}

#[test]
fn forced_open_breaker_rejects_without_checking_quota() {
    let clock = clock();
    let ledger = Arc::new(QuotaLedger::new("pro", Tier::pro(), clock.clone()));
    let breaker = Arc::new(CircuitBreaker::new(
        "pro",
        CircuitBreakerConfig::default(),
        clock,
    ));
    let mut gate = AdmissionGate::new();
    gate.insert(Arc::new(QuotaScope::new(ledger.clone(), breaker.clone())));

    breaker.force_open("oncall", "upstream billing incident");
    let decision = gate.admit(100, 0.01, "pro").unwrap();

    assert!(!decision.allowed);
    assert_eq!(decision.rejection, Some(Rejection::CircuitOpen));
    assert_eq!(ledger.allowance_checks(), 0);
}

#[tokio::test]
async fn restart_rebuilds_windows_from_the_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let clock = clock();
    let config = GatewayConfig::from_yaml("tiers:\n  pro: { preset: pro }\n  free: { preset: free }\n")
        .unwrap();

    let build = || {
        Gateway::builder()
            .config(config.clone())
            .clock(clock.clone())
            .catalog(ProviderCatalog::new())
            .ledger_dir(dir.path())
            .provider(
                ProviderDescriptor::new("main", 1),
                TestProvider::new("main", Behaviour::Succeed),
            )
            .build()
            .unwrap()
    };

    let first = build();
    for _ in 0..3 {
        first.generate("pro", GenerationRequest::new("hello")).await.unwrap();
    }
    first.generate("free", GenerationRequest::new("hello")).await.unwrap();
    let before = first.usage("pro").unwrap();
    drop(first);

    let second = build();
    let after = second.usage("pro").unwrap();

    assert_eq!(after.daily.request_count, 3);
    assert_eq!(after.daily.request_count, before.daily.request_count);
    assert_eq!(after.daily.token_count, before.daily.token_count);
    assert_eq!(after.hourly.token_count, before.hourly.token_count);
    assert!((after.daily.cost_accumulated - before.daily.cost_accumulated).abs() < 1e-12);
    assert_eq!(second.usage("free").unwrap().daily.request_count, 1);
}

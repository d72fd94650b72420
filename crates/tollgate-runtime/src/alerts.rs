//! Background quota alerting.
//!
//! The dispatcher polls every tier's usage on a fixed interval and decides
//! when a WARNING, CRITICAL or circuit-open alert is due. Delivery goes
//! through injected [`AlertTransport`]s; a failing transport is logged and
//! never reaches the request path.

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tollgate_core::{AlertsConfig, Period, QuotaScope};

/// Severity of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Warning,
    Critical,
    CircuitOpen,
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AlertLevel::Warning => "WARNING",
            AlertLevel::Critical => "CRITICAL",
            AlertLevel::CircuitOpen => "CIRCUIT OPEN",
        })
    }
}

/// A notification ready for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub scope: String,
    pub level: AlertLevel,

    /// Window the alert is about; `None` for circuit transitions
    pub period: Option<Period>,
    pub usage_percent: f64,
    pub raised_at: DateTime<Utc>,
    pub message: String,
}

/// Errors from alert delivery.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Delivery timed out after {0:?}")]
    Timeout(Duration),
}

/// Outbound alert channel (email, webhook, pager, ...).
#[async_trait]
pub trait AlertTransport: Send + Sync {
    /// Transport kind as written in config ("log", "webhook", ...).
    fn kind(&self) -> &str;

    async fn deliver(&self, alert: &Alert) -> Result<(), TransportError>;
}

/// Writes alerts to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTransport;

#[async_trait]
impl AlertTransport for LogTransport {
    fn kind(&self) -> &str {
        "log"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), TransportError> {
        match alert.level {
            AlertLevel::Warning => tracing::warn!(
                scope = %alert.scope,
                level = %alert.level,
                usage_percent = alert.usage_percent,
                "{}",
                alert.message
            ),
            AlertLevel::Critical | AlertLevel::CircuitOpen => tracing::error!(
                scope = %alert.scope,
                level = %alert.level,
                usage_percent = alert.usage_percent,
                "{}",
                alert.message
            ),
        }
        Ok(())
    }
}

/// Thresholds and timing for the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertPolicy {
    pub poll_interval: Duration,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    pub delivery_timeout: Duration,
    pub delivery_retries: usize,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self::from(&AlertsConfig::default())
    }
}

impl From<&AlertsConfig> for AlertPolicy {
    fn from(config: &AlertsConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            warning_threshold: config.warning_threshold,
            critical_threshold: config.critical_threshold,
            delivery_timeout: config.delivery_timeout,
            delivery_retries: config.delivery_retries,
        }
    }
}

impl AlertPolicy {
    fn level_for(&self, percent: f64) -> Option<AlertLevel> {
        if percent >= self.critical_threshold {
            Some(AlertLevel::Critical)
        } else if percent >= self.warning_threshold {
            Some(AlertLevel::Warning)
        } else {
            None
        }
    }
}

/// Highest level already sent for one window instance.
#[derive(Debug, Clone, Copy)]
struct Fired {
    window_start: DateTime<Utc>,
    level: AlertLevel,
}

/// Decides when to alert and hands alerts to the transports.
pub struct AlertDispatcher {
    scopes: Vec<Arc<QuotaScope>>,
    transports: Vec<Arc<dyn AlertTransport>>,
    policy: AlertPolicy,
    fired: Mutex<HashMap<(String, Period), Fired>>,
    circuit_seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl AlertDispatcher {
    pub fn new(
        scopes: Vec<Arc<QuotaScope>>,
        transports: Vec<Arc<dyn AlertTransport>>,
        policy: AlertPolicy,
    ) -> Self {
        Self {
            scopes,
            transports,
            policy,
            fired: Mutex::new(HashMap::new()),
            circuit_seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &AlertPolicy {
        &self.policy
    }

    /// Alerts due right now, marking them as sent.
    pub fn evaluate(&self) -> Vec<Alert> {
        let mut due = Vec::new();

        for scope in &self.scopes {
            let snapshot = scope.ledger.current_usage();

            for period in [Period::Hourly, Period::Daily] {
                let percent = snapshot.percent(period).worst();
                let Some(level) = self.policy.level_for(percent) else {
                    continue;
                };
                let window_start = snapshot.window(period).window_start;

                let mut fired = self.fired.lock();
                let key = (scope.name().to_string(), period);
                let already = fired
                    .get(&key)
                    .is_some_and(|f| f.window_start == window_start && f.level >= level);
                if already {
                    continue;
                }
                fired.insert(key, Fired { window_start, level });

                let threshold = match level {
                    AlertLevel::Warning => self.policy.warning_threshold,
                    _ => self.policy.critical_threshold,
                };
                due.push(Alert {
                    scope: scope.name().to_string(),
                    level,
                    period: Some(period),
                    usage_percent: percent,
                    raised_at: snapshot.taken_at,
                    message: format!(
                        "tier '{}' {} usage at {:.1}% ({} threshold {}%)",
                        scope.name(),
                        period,
                        percent,
                        level.to_string().to_lowercase(),
                        threshold
                    ),
                });
            }

            let state = scope.breaker.state();
            if let (true, Some(opened_at)) = (state.is_open, state.opened_at) {
                let mut seen = self.circuit_seen.lock();
                if seen.get(scope.name()) != Some(&opened_at) {
                    seen.insert(scope.name().to_string(), opened_at);
                    let (_, worst) = snapshot.worst();
                    let message = match state.cooldown_until {
                        Some(until) => format!(
                            "tier '{}' circuit opened; admissions rejected until {}",
                            scope.name(),
                            until
                        ),
                        None => format!(
                            "tier '{}' circuit forced open by an operator",
                            scope.name()
                        ),
                    };
                    due.push(Alert {
                        scope: scope.name().to_string(),
                        level: AlertLevel::CircuitOpen,
                        period: None,
                        usage_percent: worst,
                        raised_at: opened_at,
                        message,
                    });
                }
            }
        }

        due
    }

    /// One polling pass: decide, then deliver. Returns what was raised.
    pub async fn poll_once(&self) -> Vec<Alert> {
        let alerts = self.evaluate();
        for alert in &alerts {
            self.deliver(alert).await;
        }
        alerts
    }

    /// Send one alert through every transport concurrently.
    async fn deliver(&self, alert: &Alert) {
        let deliveries = self
            .transports
            .iter()
            .map(|transport| self.deliver_via(transport.as_ref(), alert));
        futures::future::join_all(deliveries).await;
    }

    async fn deliver_via(&self, transport: &dyn AlertTransport, alert: &Alert) {
        let timeout = self.policy.delivery_timeout;
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(self.policy.delivery_retries);

        let result = (|| async move {
            match tokio::time::timeout(timeout, transport.deliver(alert)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(timeout)),
            }
        })
        .retry(backoff)
        .sleep(tokio::time::sleep)
        .notify(|err: &TransportError, after: Duration| {
            tracing::debug!(transport = %transport.kind(), error = %err, retry_in = ?after, "Retrying alert delivery");
        })
        .await;

        if let Err(e) = result {
            tracing::error!(
                transport = %transport.kind(),
                scope = %alert.scope,
                level = %alert.level,
                error = %e,
                "Alert delivery failed"
            );
        }
    }

    /// Run `poll_once` on the policy interval until the handle is shut down.
    pub fn start(self: Arc<Self>) -> AlertHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.policy.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(
                scopes = self.scopes.len(),
                transports = self.transports.len(),
                interval = ?self.policy.poll_interval,
                "Alert dispatcher started"
            );
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        self.poll_once().await;
                    }
                }
            }
            tracing::info!("Alert dispatcher stopped");
        });
        AlertHandle { cancel, task }
    }
}

impl std::fmt::Debug for AlertDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let transports: Vec<&str> = self.transports.iter().map(|t| t.kind()).collect();
        f.debug_struct("AlertDispatcher")
            .field("scopes", &self.scopes.len())
            .field("transports", &transports)
            .field("policy", &self.policy)
            .finish()
    }
}

/// Owns the running dispatcher task.
#[derive(Debug)]
pub struct AlertHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl AlertHandle {
    /// Token that stops the dispatcher when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop polling and wait for the task to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Alert dispatcher task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tollgate_core::{
        CircuitBreaker, CircuitBreakerConfig, ManualClock, QuotaLedger, RecordStatus, Tier,
    };

    #[derive(Default)]
    struct Collecting {
        delivered: Mutex<Vec<Alert>>,
    }

    #[async_trait]
    impl AlertTransport for Collecting {
        fn kind(&self) -> &str {
            "collect"
        }

        async fn deliver(&self, alert: &Alert) -> Result<(), TransportError> {
            self.delivered.lock().push(alert.clone());
            Ok(())
        }
    }

    /// Fails a fixed number of times, then succeeds.
    struct Flaky {
        failures_left: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AlertTransport for Flaky {
        fn kind(&self) -> &str {
            "flaky"
        }

        async fn deliver(&self, _alert: &Alert) -> Result<(), TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(TransportError::Delivery("503".into()));
            }
            Ok(())
        }
    }

    fn tier() -> Tier {
        Tier {
            hourly_requests: 100,
            daily_requests: 1_000,
            ..Tier::enterprise()
        }
    }

    fn setup() -> (Arc<ManualClock>, Arc<QuotaScope>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 5, 14, 10, 0).unwrap(),
        ));
        let scope = Arc::new(QuotaScope::new(
            Arc::new(QuotaLedger::new("pro", tier(), clock.clone())),
            Arc::new(CircuitBreaker::new("pro", CircuitBreakerConfig::default(), clock.clone())),
        ));
        (clock, scope)
    }

    fn fill(scope: &QuotaScope, requests: u64) {
        for _ in 0..requests {
            scope.ledger.record(1, 0.0, RecordStatus::Success);
        }
    }

    fn dispatcher(scope: Arc<QuotaScope>, transport: Arc<dyn AlertTransport>) -> AlertDispatcher {
        AlertDispatcher::new(vec![scope], vec![transport], AlertPolicy::default())
    }

    #[tokio::test]
    async fn test_no_alert_below_warning() {
        let (_, scope) = setup();
        fill(&scope, 69);
        let sink = Arc::new(Collecting::default());
        let dispatcher = dispatcher(scope, sink.clone());

        assert!(dispatcher.poll_once().await.is_empty());
        assert!(sink.delivered.lock().is_empty());
    }

    #[tokio::test]
    async fn test_warning_fires_once_per_window() {
        let (_, scope) = setup();
        fill(&scope, 72);
        let sink = Arc::new(Collecting::default());
        let dispatcher = dispatcher(scope.clone(), sink.clone());

        let first = dispatcher.poll_once().await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].level, AlertLevel::Warning);
        assert_eq!(first[0].period, Some(Period::Hourly));

        fill(&scope, 3);
        assert!(dispatcher.poll_once().await.is_empty());
        assert_eq!(sink.delivered.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_escalation_to_critical_fires_again() {
        let (_, scope) = setup();
        fill(&scope, 75);
        let dispatcher = dispatcher(scope.clone(), Arc::new(Collecting::default()));
        dispatcher.poll_once().await;

        fill(&scope, 16);
        let alerts = dispatcher.poll_once().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, AlertLevel::Critical);
        assert!(alerts[0].message.contains("critical threshold 90%"));
    }

    #[tokio::test]
    async fn test_new_window_rearms_alert() {
        let (clock, scope) = setup();
        fill(&scope, 80);
        let dispatcher = dispatcher(scope.clone(), Arc::new(Collecting::default()));
        assert_eq!(dispatcher.poll_once().await.len(), 1);

        clock.advance(chrono::Duration::hours(1));
        fill(&scope, 80);
        let alerts = dispatcher.poll_once().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].period, Some(Period::Hourly));
    }

    #[tokio::test]
    async fn test_circuit_open_alert_fires_once_per_opening() {
        let (_, scope) = setup();
        let dispatcher = dispatcher(scope.clone(), Arc::new(Collecting::default()));

        scope.breaker.force_open("ops", "drill");
        let alerts = dispatcher.poll_once().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, AlertLevel::CircuitOpen);
        assert!(alerts[0].message.contains("forced open"));

        assert!(dispatcher.poll_once().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_retries_with_backoff() {
        let (_, scope) = setup();
        fill(&scope, 72);
        let flaky = Arc::new(Flaky {
            failures_left: AtomicUsize::new(2),
            calls: AtomicUsize::new(0),
        });
        let dispatcher = dispatcher(scope, flaky.clone());

        dispatcher.poll_once().await;
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_gives_up_after_retries() {
        let (_, scope) = setup();
        fill(&scope, 72);
        let flaky = Arc::new(Flaky {
            failures_left: AtomicUsize::new(100),
            calls: AtomicUsize::new(0),
        });
        let dispatcher = dispatcher(scope, flaky.clone());

        let alerts = dispatcher.poll_once().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1 + AlertPolicy::default().delivery_retries);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_task_polls_and_shuts_down() {
        let (_, scope) = setup();
        fill(&scope, 72);
        let sink = Arc::new(Collecting::default());
        let dispatcher = Arc::new(AlertDispatcher::new(
            vec![scope],
            vec![sink.clone() as Arc<dyn AlertTransport>],
            AlertPolicy {
                poll_interval: Duration::from_secs(5),
                ..Default::default()
            },
        ));

        let handle = dispatcher.start();
        tokio::time::sleep(Duration::from_secs(12)).await;
        handle.shutdown().await;

        assert_eq!(sink.delivered.lock().len(), 1);
    }
}

//! Transport auto-switch controller.
//!
//! Watches the health of the session's active transport and moves the session
//! between a primary and a fallback transport.
//!
//! Health input comes from two places: a periodic probe against the active
//! transport, and the heartbeat outcomes the [`SessionEngine`] publishes.
//! Failures are counted per transport kind. Once the active kind reaches
//! `failure_threshold` consecutive failures the controller switches to the
//! other kind. While on the fallback, the primary is probed on the side
//! (connect, probe, disconnect) and the session moves back once the primary
//! has stayed healthy for `recovery_window`.
//!
//! Only one switch runs at a time. A request that arrives while a switch or a
//! standby probe is in flight is dropped, and health signals that queued up
//! during a switch are discarded once it finishes.
//!
//! A switch that fails but reverts cleanly leaves the session where it was:
//! the attempt is recorded, further attempts back off (holding at
//! `max_backoff` once `max_retries` is spent) and the loop keeps running. The
//! loop only gives up when the revert fails as well.

use crate::backoff::RetryConfig;
use crate::error::{Result, SessionError};
use crate::session::{HealthSignal, SessionEngine, SessionState};
use dashmap::DashMap;
use skylink_transport::{TransportClient, TransportKind};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::Span;

/// Failed attempts kept by [`AutoSwitchController::failures`]
const MAX_FAILURE_RECORDS: usize = 64;

/// Error type observers may return
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

// ═══════════════════════════════════════════════════════════════════════════
// Configuration and records
// ═══════════════════════════════════════════════════════════════════════════

/// Auto-switch tuning
#[derive(Debug, Clone)]
pub struct SwitchConfig {
    /// Act on health input; manual switches work either way
    pub enabled: bool,
    /// Time between probes of the active transport
    pub probe_interval: Duration,
    /// Deadline of one probe
    pub probe_timeout: Duration,
    /// Consecutive failures that trigger a switch
    pub failure_threshold: u32,
    /// How long the primary must stay healthy before switching back
    pub recovery_window: Duration,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            probe_interval: Duration::from_secs(3),
            probe_timeout: Duration::from_secs(2),
            failure_threshold: 3,
            recovery_window: Duration::from_secs(30),
        }
    }
}

/// Health bookkeeping for one transport kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHealth {
    /// Transport kind
    pub kind: TransportKind,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Last successful probe or heartbeat
    pub last_success_at: Option<Instant>,
    /// Why the last failure happened
    pub last_failure_reason: Option<String>,
}

impl TransportHealth {
    fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            consecutive_failures: 0,
            last_success_at: None,
            last_failure_reason: None,
        }
    }
}

/// A completed switch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchEvent {
    /// Kind the session left
    pub from: TransportKind,
    /// Kind the session now runs on
    pub to: TransportKind,
    /// When the switch completed
    pub timestamp: SystemTime,
    /// What triggered it
    pub reason: String,
}

impl fmt::Display for SwitchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} ({})", self.from, self.to, self.reason)
    }
}

/// A switch attempt that failed and left the session where it was
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchFailure {
    /// Kind the session stayed on
    pub from: TransportKind,
    /// Kind that could not take the session
    pub to: TransportKind,
    /// When the attempt gave up
    pub timestamp: SystemTime,
    /// Consecutive failed attempts, this one included
    pub attempt: u32,
    /// Why the target was refused
    pub error: String,
}

/// Result of a switch request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// The session moved
    Switched(SwitchEvent),
    /// Another switch or standby probe was in flight
    Dropped,
    /// Already on the requested kind
    Unchanged,
}

/// Receives completed switches.
///
/// Observers run synchronously on the controller task, in registration order.
/// An error is logged and does not stop the remaining observers.
pub trait SwitchObserver: Send + Sync {
    /// Called once per completed switch
    fn on_switch(&self, event: &SwitchEvent) -> std::result::Result<(), BoxError>;
}

/// Adapts a `(from, to)` closure into a [`SwitchObserver`]
pub struct FnObserver<F>(pub F);

impl<F> SwitchObserver for FnObserver<F>
where
    F: Fn(TransportKind, TransportKind) + Send + Sync,
{
    fn on_switch(&self, event: &SwitchEvent) -> std::result::Result<(), BoxError> {
        (self.0)(event.from, event.to);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Controller
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct Pacing {
    failed_attempts: u32,
    retry_at: Option<Instant>,
    primary_healthy_since: Option<Instant>,
}

/// Releases the switch slot on every exit path
struct SwitchSlot<'a>(&'a AtomicBool);

impl Drop for SwitchSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Keeps a [`SessionEngine`] on a working transport
pub struct AutoSwitchController {
    engine: Arc<SessionEngine>,
    primary: Arc<dyn TransportClient>,
    fallback: Arc<dyn TransportClient>,
    config: SwitchConfig,
    retry: RetryConfig,
    switching: AtomicBool,
    running: AtomicBool,
    health: DashMap<TransportKind, TransportHealth>,
    pacing: Mutex<Pacing>,
    observers: RwLock<Vec<Arc<dyn SwitchObserver>>>,
    history: RwLock<Vec<SwitchEvent>>,
    failures: RwLock<Vec<SwitchFailure>>,
    shutdown: watch::Sender<bool>,
    span: Span,
}

impl AutoSwitchController {
    /// Controller for `engine`, which must be bound to one of the two
    /// transports.
    ///
    /// # Errors
    ///
    /// [`SessionError::Config`] if both transports are the same kind.
    pub fn new(
        engine: Arc<SessionEngine>,
        primary: Arc<dyn TransportClient>,
        fallback: Arc<dyn TransportClient>,
        config: SwitchConfig,
        retry: RetryConfig,
        span: Span,
    ) -> Result<Self> {
        if primary.kind() == fallback.kind() {
            return Err(SessionError::config(format!(
                "primary and fallback are both {}",
                primary.kind()
            )));
        }
        if config.probe_interval.is_zero() || config.failure_threshold == 0 {
            return Err(SessionError::config(
                "probe interval and failure threshold must be positive",
            ));
        }

        let health = DashMap::new();
        for kind in [primary.kind(), fallback.kind()] {
            health.insert(kind, TransportHealth::new(kind));
        }
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            engine,
            primary,
            fallback,
            config,
            retry,
            switching: AtomicBool::new(false),
            running: AtomicBool::new(false),
            health,
            pacing: Mutex::new(Pacing::default()),
            observers: RwLock::new(Vec::new()),
            history: RwLock::new(Vec::new()),
            failures: RwLock::new(Vec::new()),
            shutdown,
            span,
        })
    }

    /// Register an observer
    pub async fn add_observer(&self, observer: Arc<dyn SwitchObserver>) {
        self.observers.write().await.push(observer);
    }

    /// Register a `(from, to)` callback
    pub async fn on_switch<F>(&self, callback: F)
    where
        F: Fn(TransportKind, TransportKind) + Send + Sync + 'static,
    {
        self.add_observer(Arc::new(FnObserver(callback))).await;
    }

    /// Kind the session is on right now. Never blocks.
    pub fn get_current_mode(&self) -> TransportKind {
        self.engine.transport_kind()
    }

    /// Health record of `kind`
    pub fn health(&self, kind: TransportKind) -> Option<TransportHealth> {
        self.health.get(&kind).map(|h| h.clone())
    }

    /// Every switch so far, oldest first
    pub async fn history(&self) -> Vec<SwitchEvent> {
        self.history.read().await.clone()
    }

    /// Most recent failed switch attempts, oldest first
    pub async fn failures(&self) -> Vec<SwitchFailure> {
        self.failures.read().await.clone()
    }

    /// Whether the loop task is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the loop to exit
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    /// Move the session to `to` now.
    ///
    /// # Errors
    ///
    /// [`SessionError::UnsupportedConfiguration`] if `to` is neither
    /// transport, otherwise whatever the switch itself failed with.
    pub async fn request_switch(&self, to: TransportKind, reason: impl Into<String>) -> Result<SwitchOutcome> {
        let target = self.transport_for(to)?;
        let Some(_slot) = self.try_claim() else {
            tracing::debug!(parent: &self.span, %to, "switch already in flight, request dropped");
            return Ok(SwitchOutcome::Dropped);
        };
        self.switch_claimed(target, reason.into()).await
    }

    /// Spawn the health loop.
    ///
    /// The task ends with `Ok` when [`AutoSwitchController::stop`] is called or
    /// the session closes, and with the exhausted-transports error when no
    /// transport can carry the session.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<Result<()>> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            if controller
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Err(SessionError::invalid_state("auto-switch loop already running"));
            }
            let result = controller.run().await;
            controller.running.store(false, Ordering::SeqCst);
            match &result {
                Ok(()) => tracing::info!(parent: &controller.span, "auto-switch stopped"),
                Err(e) => tracing::error!(parent: &controller.span, error = %e, "auto-switch gave up"),
            }
            result
        })
    }

    async fn run(&self) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        let mut closed = self.engine.closed_signal();
        let mut signals = self.engine.health_signals();
        if *shutdown.borrow() || *closed.borrow() {
            return Ok(());
        }

        let mut ticker = tokio::time::interval(self.config.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            parent: &self.span,
            primary = %self.primary.kind(),
            fallback = %self.fallback.kind(),
            enabled = self.config.enabled,
            "auto-switch started"
        );

        loop {
            let before = self.get_current_mode();
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = closed.changed() => break,
                _ = ticker.tick() => self.on_tick().await?,
                signal = signals.recv() => match signal {
                    Ok(signal) => self.on_signal(signal).await?,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(parent: &self.span, skipped, "health signals lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
            }

            if self.get_current_mode() != before {
                drain(&mut signals);
            }
        }
        Ok(())
    }

    async fn on_tick(&self) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        if !matches!(
            self.engine.state().await,
            SessionState::Connected | SessionState::Authenticated | SessionState::Ready
        ) {
            return Ok(());
        }

        let transport = self.engine.active_transport().await;
        let kind = transport.kind();
        match transport.probe(self.config.probe_timeout).await {
            Ok(rtt) => {
                tracing::trace!(parent: &self.span, %kind, ?rtt, "probe ok");
                self.record_success(kind);
            }
            Err(e) => {
                tracing::debug!(parent: &self.span, %kind, error = %e, "probe failed");
                self.record_failure(kind, e.to_string());
            }
        }
        self.evaluate(kind).await?;

        if kind == self.fallback.kind() && self.get_current_mode() == kind {
            self.probe_standby().await?;
        }
        Ok(())
    }

    async fn on_signal(&self, signal: HealthSignal) -> Result<()> {
        if !self.config.enabled || signal.kind != self.get_current_mode() {
            return Ok(());
        }
        if signal.ok {
            self.record_success(signal.kind);
        } else {
            let reason = signal.reason.unwrap_or_else(|| "heartbeat failed".into());
            self.record_failure(signal.kind, reason);
        }
        self.evaluate(signal.kind).await
    }

    /// Switch away from `kind` if it has failed often enough
    async fn evaluate(&self, kind: TransportKind) -> Result<()> {
        let Some(health) = self.health(kind) else {
            return Ok(());
        };
        if health.consecutive_failures < self.config.failure_threshold {
            return Ok(());
        }
        if self
            .pacing
            .lock()
            .await
            .retry_at
            .is_some_and(|at| Instant::now() < at)
        {
            return Ok(());
        }

        let to = self.other(kind);
        let reason = format!(
            "{kind} failed {} consecutive health checks: {}",
            health.consecutive_failures,
            health.last_failure_reason.as_deref().unwrap_or("unknown")
        );
        match self.request_switch(to, reason).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_exhausted() => Err(e),
            Err(e) => {
                tracing::warn!(parent: &self.span, from = %kind, %to, error = %e, "switch attempt failed");
                Ok(())
            }
        }
    }

    /// Check whether the primary is back while the session runs on the
    /// fallback
    async fn probe_standby(&self) -> Result<()> {
        let Some(_slot) = self.try_claim() else {
            return Ok(());
        };
        let kind = self.primary.kind();

        let probe = async {
            self.primary.connect().await?;
            let rtt = self.primary.probe(self.config.probe_timeout).await;
            let _ = self.primary.disconnect().await;
            rtt
        };
        let healthy_for = match probe.await {
            Ok(rtt) => {
                self.record_success(kind);
                let mut pacing = self.pacing.lock().await;
                let since = *pacing.primary_healthy_since.get_or_insert_with(Instant::now);
                tracing::debug!(parent: &self.span, %kind, ?rtt, "standby probe ok");
                since.elapsed()
            }
            Err(e) => {
                self.record_failure(kind, e.to_string());
                self.pacing.lock().await.primary_healthy_since = None;
                tracing::trace!(parent: &self.span, %kind, error = %e, "standby probe failed");
                return Ok(());
            }
        };

        if healthy_for < self.config.recovery_window {
            return Ok(());
        }
        let reason = format!("{kind} healthy for {healthy_for:?}");
        match self.switch_claimed(Arc::clone(&self.primary), reason).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_exhausted() => Err(e),
            Err(e) => {
                tracing::warn!(parent: &self.span, to = %kind, error = %e, "switch back failed");
                Ok(())
            }
        }
    }

    /// Run one switch. The caller holds the switch slot.
    async fn switch_claimed(&self, target: Arc<dyn TransportClient>, reason: String) -> Result<SwitchOutcome> {
        let from = self.get_current_mode();
        let to = target.kind();
        if from == to {
            return Ok(SwitchOutcome::Unchanged);
        }

        tracing::info!(parent: &self.span, %from, %to, %reason, "switching transport");
        if let Err(e) = self.engine.switch_transport(target).await {
            // the engine only reports exhaustion once the revert failed too
            if e.is_exhausted() {
                return Err(e);
            }
            self.record_failure(to, e.to_string());

            let mut pacing = self.pacing.lock().await;
            pacing.failed_attempts = pacing.failed_attempts.saturating_add(1);
            let attempt = pacing.failed_attempts;
            let wait = if self.retry.exhausted(attempt) {
                self.retry.max_backoff
            } else {
                self.retry.backoff_duration(attempt - 1)
            };
            pacing.retry_at = Some(Instant::now() + wait);
            drop(pacing);

            if self.retry.exhausted(attempt) {
                tracing::warn!(
                    parent: &self.span,
                    %from,
                    %to,
                    attempt,
                    ?wait,
                    "switch retries spent, holding at the longest backoff"
                );
            } else {
                tracing::debug!(parent: &self.span, attempt, ?wait, "switch failed, backing off");
            }

            let mut failures = self.failures.write().await;
            if failures.len() == MAX_FAILURE_RECORDS {
                failures.remove(0);
            }
            failures.push(SwitchFailure {
                from,
                to,
                timestamp: SystemTime::now(),
                attempt,
                error: e.to_string(),
            });
            return Err(e);
        }

        *self.pacing.lock().await = Pacing::default();
        for kind in [from, to] {
            if let Some(mut health) = self.health.get_mut(&kind) {
                health.consecutive_failures = 0;
            }
        }

        let event = SwitchEvent {
            from,
            to,
            timestamp: SystemTime::now(),
            reason,
        };
        self.history.write().await.push(event.clone());
        self.notify(&event).await;
        Ok(SwitchOutcome::Switched(event))
    }

    async fn notify(&self, event: &SwitchEvent) {
        let observers = self.observers.read().await.clone();
        for (index, observer) in observers.iter().enumerate() {
            if let Err(e) = observer.on_switch(event) {
                tracing::warn!(parent: &self.span, observer = index, error = %e, "switch observer failed");
            }
        }
    }

    fn try_claim(&self) -> Option<SwitchSlot<'_>> {
        self.switching
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SwitchSlot(&self.switching))
    }

    fn transport_for(&self, kind: TransportKind) -> Result<Arc<dyn TransportClient>> {
        if kind == self.primary.kind() {
            Ok(Arc::clone(&self.primary))
        } else if kind == self.fallback.kind() {
            Ok(Arc::clone(&self.fallback))
        } else {
            Err(SessionError::UnsupportedConfiguration(
                format!("{kind} is not configured for auto-switch").into(),
            ))
        }
    }

    fn other(&self, kind: TransportKind) -> TransportKind {
        if kind == self.primary.kind() {
            self.fallback.kind()
        } else {
            self.primary.kind()
        }
    }

    fn record_success(&self, kind: TransportKind) {
        if let Some(mut health) = self.health.get_mut(&kind) {
            health.consecutive_failures = 0;
            health.last_success_at = Some(Instant::now());
        }
    }

    fn record_failure(&self, kind: TransportKind, reason: String) {
        if let Some(mut health) = self.health.get_mut(&kind) {
            health.consecutive_failures = health.consecutive_failures.saturating_add(1);
            health.last_failure_reason = Some(reason);
        }
    }
}

impl fmt::Debug for AutoSwitchController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoSwitchController")
            .field("primary", &self.primary.kind())
            .field("fallback", &self.fallback.kind())
            .field("mode", &self.get_current_mode())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn drain(signals: &mut broadcast::Receiver<HealthSignal>) {
    loop {
        match signals.try_recv() {
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
}

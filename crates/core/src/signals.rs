//! Outbound signal emission.
//!
//! Assignment and conversion signals are pushed onto a bounded queue and
//! delivered by a single background worker with retry and backoff. Emission
//! never blocks and never fails the operation that produced the signal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::SignalsConfig;
use crate::domain::experiment::ExperimentId;
use crate::domain::tenant::TenantId;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-pricewise-signature";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    AssignmentCreated,
    ConversionRecorded,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AssignmentCreated => "assignment_created",
            Self::ConversionRecorded => "conversion_recorded",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub kind: SignalKind,
    pub tenant_id: TenantId,
    pub experiment_id: ExperimentId,
    pub user_id: String,
    pub variant_name: String,
    pub price: Decimal,
    pub revenue: Option<Decimal>,
    pub occurred_at: DateTime<Utc>,
}

impl Signal {
    pub fn new(
        kind: SignalKind,
        tenant_id: TenantId,
        experiment_id: ExperimentId,
        user_id: impl Into<String>,
        variant_name: impl Into<String>,
        price: Decimal,
        revenue: Option<Decimal>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            tenant_id,
            experiment_id,
            user_id: user_id.into(),
            variant_name: variant_name.into(),
            price,
            revenue,
            occurred_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("signal delivery failed: {0}")]
    Delivery(String),
    #[error("signal rejected with status {status}")]
    Rejected { status: u16 },
    #[error("signal encoding failed: {0}")]
    Encoding(String),
}

#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn deliver(&self, signal: &Signal) -> Result<(), SignalError>;
}

/// Discards every signal. Used when emission is disabled.
#[derive(Clone, Debug, Default)]
pub struct NoopSignalSink;

#[async_trait]
impl SignalSink for NoopSignalSink {
    async fn deliver(&self, _signal: &Signal) -> Result<(), SignalError> {
        Ok(())
    }
}

/// Collects delivered signals in memory.
#[derive(Clone, Debug, Default)]
pub struct InMemorySignalSink {
    delivered: Arc<Mutex<Vec<Signal>>>,
}

impl InMemorySignalSink {
    pub async fn delivered(&self) -> Vec<Signal> {
        self.delivered.lock().await.clone()
    }
}

#[async_trait]
impl SignalSink for InMemorySignalSink {
    async fn deliver(&self, signal: &Signal) -> Result<(), SignalError> {
        self.delivered.lock().await.push(signal.clone());
        Ok(())
    }
}

/// Hex HMAC-SHA256 of `body` keyed by `secret`.
pub fn sign_payload(secret: &[u8], body: &[u8]) -> Result<String, SignalError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|error| SignalError::Encoding(error.to_string()))?;
    mac.update(body);
    Ok(encode_hex(mac.finalize().into_bytes().as_slice()))
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatcherSettings {
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_backoff_multiplier: u32,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(200),
            retry_backoff_multiplier: 2,
        }
    }
}

impl DispatcherSettings {
    pub fn from_config(config: &SignalsConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity,
            max_retries: config.max_retries,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
            retry_backoff_multiplier: config.retry_backoff_multiplier,
        }
    }

    /// `base × multiplier^retry` plus up to a quarter of the base as jitter.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let base_ms = self.retry_base_delay.as_millis() as u64;
        let factor = u64::from(self.retry_backoff_multiplier.max(1)).saturating_pow(retry);
        let jitter_ms =
            if base_ms >= 4 { rand::thread_rng().gen_range(0..=base_ms / 4) } else { 0 };
        Duration::from_millis(base_ms.saturating_mul(factor).saturating_add(jitter_ms))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
    pub retried: u64,
}

#[derive(Debug, Default)]
struct DispatchCounters {
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    retried: AtomicU64,
}

impl DispatchCounters {
    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable producer side of the dispatcher queue.
#[derive(Clone, Debug)]
pub struct SignalEmitter {
    sender: mpsc::Sender<Signal>,
    counters: Arc<DispatchCounters>,
}

impl SignalEmitter {
    /// Enqueues without waiting. A full or closed queue drops the signal.
    pub fn emit(&self, signal: Signal) {
        match self.sender.try_send(signal) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(signal)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event_name = "signals.queue.full",
                    signal_id = %signal.id,
                    kind = signal.kind.as_str(),
                    "signal queue full; dropping signal"
                );
            }
            Err(mpsc::error::TrySendError::Closed(signal)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event_name = "signals.queue.closed",
                    signal_id = %signal.id,
                    kind = signal.kind.as_str(),
                    "signal dispatcher stopped; dropping signal"
                );
            }
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }
}

pub struct SignalDispatcher {
    emitter: SignalEmitter,
    shutdown: Option<oneshot::Sender<()>>,
    worker: JoinHandle<()>,
}

impl SignalDispatcher {
    /// Spawns the delivery worker on the current tokio runtime.
    pub fn spawn(sink: Arc<dyn SignalSink>, settings: DispatcherSettings) -> Self {
        let (sender, receiver) = mpsc::channel(settings.queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let counters = Arc::new(DispatchCounters::default());

        let worker =
            tokio::spawn(run_worker(receiver, shutdown_rx, sink, settings, counters.clone()));

        Self {
            emitter: SignalEmitter { sender, counters },
            shutdown: Some(shutdown_tx),
            worker,
        }
    }

    pub fn emitter(&self) -> SignalEmitter {
        self.emitter.clone()
    }

    pub fn stats(&self) -> DispatchStats {
        self.emitter.stats()
    }

    /// Stops accepting work, delivers everything already queued and returns
    /// the final counters.
    pub async fn shutdown(mut self) -> DispatchStats {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(join_error) = (&mut self.worker).await {
            error!(
                event_name = "signals.worker.join_failed",
                error = %join_error,
                "signal worker terminated abnormally"
            );
        }
        self.emitter.stats()
    }
}

async fn run_worker(
    mut receiver: mpsc::Receiver<Signal>,
    mut shutdown: oneshot::Receiver<()>,
    sink: Arc<dyn SignalSink>,
    settings: DispatcherSettings,
    counters: Arc<DispatchCounters>,
) {
    loop {
        tokio::select! {
            received = receiver.recv() => match received {
                Some(signal) => {
                    deliver_with_retry(sink.as_ref(), &signal, &settings, &counters).await
                }
                None => return,
            },
            _ = &mut shutdown => break,
        }
    }

    receiver.close();
    while let Some(signal) = receiver.recv().await {
        deliver_with_retry(sink.as_ref(), &signal, &settings, &counters).await;
    }
    debug!(event_name = "signals.worker.drained", "signal worker drained queue");
}

async fn deliver_with_retry(
    sink: &dyn SignalSink,
    signal: &Signal,
    settings: &DispatcherSettings,
    counters: &DispatchCounters,
) {
    let mut retry = 0_u32;
    loop {
        match sink.deliver(signal).await {
            Ok(()) => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(
                    event_name = "signals.delivery.succeeded",
                    signal_id = %signal.id,
                    retries = retry,
                    "signal delivered"
                );
                return;
            }
            Err(delivery_error) if retry < settings.max_retries => {
                let delay = settings.backoff_delay(retry);
                retry += 1;
                counters.retried.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event_name = "signals.delivery.retrying",
                    signal_id = %signal.id,
                    attempt = retry,
                    delay_ms = delay.as_millis() as u64,
                    error = %delivery_error,
                    "signal delivery failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(delivery_error) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    event_name = "signals.delivery.failed",
                    signal_id = %signal.id,
                    kind = signal.kind.as_str(),
                    experiment_id = %signal.experiment_id,
                    retries = retry,
                    error = %delivery_error,
                    "signal delivery failed permanently"
                );
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use rust_decimal::Decimal;

    use super::{
        sign_payload, DispatcherSettings, InMemorySignalSink, Signal, SignalDispatcher,
        SignalError, SignalKind, SignalSink,
    };
    use crate::domain::experiment::ExperimentId;
    use crate::domain::tenant::TenantId;

    fn signal(user: &str) -> Signal {
        Signal::new(
            SignalKind::AssignmentCreated,
            TenantId("tenant-1".to_string()),
            ExperimentId("exp-1".to_string()),
            user,
            "control",
            Decimal::new(2999, 2),
            None,
        )
    }

    fn fast_settings(max_retries: u32) -> DispatcherSettings {
        DispatcherSettings {
            queue_capacity: 16,
            max_retries,
            retry_base_delay: Duration::from_millis(1),
            retry_backoff_multiplier: 2,
        }
    }

    struct FlakySink {
        failures_before_success: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl SignalSink for FlakySink {
        async fn deliver(&self, _signal: &Signal) -> Result<(), SignalError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                Err(SignalError::Rejected { status: 502 })
            } else {
                Ok(())
            }
        }
    }

    struct BlockedSink;

    #[async_trait]
    impl SignalSink for BlockedSink {
        async fn deliver(&self, _signal: &Signal) -> Result<(), SignalError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        }
    }

    #[test]
    fn signature_is_stable_hex_hmac() {
        let first = sign_payload(b"secret", b"{\"a\":1}").expect("sign");
        let second = sign_payload(b"secret", b"{\"a\":1}").expect("sign");
        let other_key = sign_payload(b"other", b"{\"a\":1}").expect("sign");

        assert_eq!(first, second);
        assert_ne!(first, other_key);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn backoff_grows_exponentially() {
        let settings = DispatcherSettings {
            retry_base_delay: Duration::from_millis(100),
            retry_backoff_multiplier: 2,
            ..DispatcherSettings::default()
        };

        let first = settings.backoff_delay(0);
        let third = settings.backoff_delay(2);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(425));
    }

    #[tokio::test]
    async fn shutdown_drains_queued_signals() {
        let sink = InMemorySignalSink::default();
        let dispatcher = SignalDispatcher::spawn(Arc::new(sink.clone()), fast_settings(0));
        let emitter = dispatcher.emitter();

        for index in 0..5 {
            emitter.emit(signal(&format!("user-{index}")));
        }
        let stats = dispatcher.shutdown().await;

        assert_eq!(stats.delivered, 5);
        assert_eq!(sink.delivered().await.len(), 5);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let sink = Arc::new(FlakySink { failures_before_success: 2, calls: AtomicU32::new(0) });
        let dispatcher = SignalDispatcher::spawn(sink.clone(), fast_settings(3));
        dispatcher.emitter().emit(signal("user-1"));

        let stats = dispatcher.shutdown().await;
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.failed, 0);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_count_as_failed() {
        let sink =
            Arc::new(FlakySink { failures_before_success: u32::MAX, calls: AtomicU32::new(0) });
        let dispatcher = SignalDispatcher::spawn(sink, fast_settings(1));
        dispatcher.emitter().emit(signal("user-1"));

        let stats = dispatcher.shutdown().await;
        assert_eq!(stats, super::DispatchStats { delivered: 0, failed: 1, dropped: 0, retried: 1 });
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let settings = DispatcherSettings { queue_capacity: 1, ..fast_settings(0) };
        let dispatcher = SignalDispatcher::spawn(Arc::new(BlockedSink), settings);
        let emitter = dispatcher.emitter();

        for index in 0..10 {
            emitter.emit(signal(&format!("user-{index}")));
        }

        let stats = emitter.stats();
        assert!(stats.dropped >= 8, "expected most signals dropped, got {stats:?}");
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn emit_after_shutdown_is_counted_as_dropped() {
        let dispatcher =
            SignalDispatcher::spawn(Arc::new(InMemorySignalSink::default()), fast_settings(0));
        let emitter = dispatcher.emitter();
        dispatcher.shutdown().await;

        emitter.emit(signal("late"));
        assert_eq!(emitter.stats().dropped, 1);
    }
}

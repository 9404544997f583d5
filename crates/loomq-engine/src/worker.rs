use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use loomq_core::{ErrorEnvelope, ErrorStatus, Severity, Transform};
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};

use crate::broker::{Broker, BrokerError};

const PUBLISH_RETRY_ATTEMPTS: u32 = 5;
const PUBLISH_RETRY_BASE: Duration = Duration::from_millis(100);

/// Per-worker state shared with the owning Supervisor. Worker writes `busy`; Supervisor writes
/// `marked`. Both are single-writer, so a plain `Arc<AtomicBool>` pair is sufficient without a
/// lock.
#[derive(Debug)]
pub(crate) struct WorkerFlags {
    busy: AtomicBool,
    marked: AtomicBool,
}

impl WorkerFlags {
    /// Builds a fresh flag pair for a newly spawned worker: not busy, not marked.
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            busy: AtomicBool::new(false),
            marked: AtomicBool::new(false),
        })
    }

    /// True while a message is mid-process.
    pub(crate) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// True once the Supervisor has requested termination.
    pub(crate) fn is_marked(&self) -> bool {
        self.marked.load(Ordering::SeqCst)
    }

    /// Requests termination. Idempotent; never blocks. The worker honours this after its next
    /// ack, never mid-message.
    pub(crate) fn request_termination(&self) {
        self.marked.store(true, Ordering::SeqCst);
    }

    fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }
}

/// Why a worker task ended.
#[derive(Debug)]
pub(crate) enum WorkerExit {
    /// Drained cleanly after observing `marked_for_termination`.
    Drained,
    /// The broker connection or a queue RPC failed.
    BrokerUnavailable(String),
    /// A publish could not be completed after exhausting the retry budget.
    PublishExhausted,
}

/// One message's completed latency, reported back to the Supervisor's advisory speed window.
pub(crate) struct Completion {
    /// Identifier of the worker that completed the message.
    pub(crate) worker_id: String,
    /// Wall-clock time from delivery receipt to ack, in milliseconds.
    pub(crate) latency_ms: u64,
}

/// Runs a single worker to completion: opens its own broker connection, consumes from the
/// input queue one message at a time, routes the transform's outcome to the output/error
/// queues, and exits once marked and drained.
///
/// Broker connections are never shared across workers: each call to this function owns its own
/// `Broker` instance end to end.
#[instrument(skip(broker, transform, completions), fields(worker_id = %worker_id))]
pub(crate) async fn run(
    worker_id: String,
    broker: Arc<dyn Broker>,
    transform: Arc<dyn Transform>,
    flags: Arc<WorkerFlags>,
    output_queue: String,
    error_queue: String,
    completions: mpsc::UnboundedSender<Completion>,
) -> WorkerExit {
    if let Err(err) = broker.prepare(1).await {
        error!(%err, "worker failed to prepare broker connection");
        return WorkerExit::BrokerUnavailable(err.to_string());
    }
    if let Err(err) = broker.start_consuming().await {
        error!(%err, "worker failed to register as a consumer");
        return WorkerExit::BrokerUnavailable(err.to_string());
    }

    loop {
        let delivery = match broker.consume_one().await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                warn!("consumer stream ended; worker exiting for the Supervisor to respawn");
                return WorkerExit::BrokerUnavailable("consumer stream ended".into());
            }
            Err(err) => {
                warn!(%err, "worker lost its broker connection");
                return WorkerExit::BrokerUnavailable(err.to_string());
            }
        };

        flags.set_busy(true);
        let started = Instant::now();

        let outcome = process_with_panic_guard(transform.as_ref(), &delivery.body, &worker_id).await;

        if route(broker.as_ref(), &output_queue, &error_queue, &outcome)
            .await
            .is_err()
        {
            let _ = broker.nack_requeue(delivery).await;
            flags.set_busy(false);
            return WorkerExit::PublishExhausted;
        }

        if let Err(err) = broker.ack(delivery).await {
            warn!(%err, "ack failed; broker connection considered lost");
            flags.set_busy(false);
            return WorkerExit::BrokerUnavailable(err.to_string());
        }

        let _ = completions.send(Completion {
            worker_id: worker_id.clone(),
            latency_ms: started.elapsed().as_millis() as u64,
        });

        flags.set_busy(false);
        if flags.is_marked() {
            let _ = broker.close().await;
            info!("worker drained and exiting");
            return WorkerExit::Drained;
        }
    }
}

struct Outcome {
    payload: Vec<u8>,
    status: ErrorStatus,
    envelope: Option<ErrorEnvelope>,
}

async fn process_with_panic_guard(
    transform: &dyn Transform,
    body: &[u8],
    worker_id: &str,
) -> Outcome {
    match AssertUnwindSafe(transform.process(body)).catch_unwind().await {
        Ok(result) => Outcome {
            payload: result.payload,
            status: result.status,
            envelope: result.envelope,
        },
        Err(panic) => {
            let message = panic_message(panic);
            error!(%message, "transform panicked; synthesizing a critical envelope");
            Outcome {
                payload: Vec::new(),
                status: ErrorStatus::Critical,
                envelope: Some(ErrorEnvelope::new(
                    worker_id,
                    "worker",
                    message,
                    String::from_utf8_lossy(body).into_owned(),
                    Severity::Critical,
                )),
            }
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "transform panicked with a non-string payload".to_string()
    }
}

/// Publishes `outcome` to the output/error queues per its status, with bounded retry. Returns
/// `Err(())` once the retry budget is exhausted on any required publish.
async fn route(
    broker: &dyn Broker,
    output_queue: &str,
    error_queue: &str,
    outcome: &Outcome,
) -> Result<(), ()> {
    if outcome.status.forwards_to_output() {
        publish_with_retry(broker, output_queue, &outcome.payload).await?;
    }
    if outcome.status.publishes_envelope() {
        let Some(envelope) = &outcome.envelope else {
            error!("non-NoError outcome missing its envelope; dropping without publish");
            return Ok(());
        };
        let bytes = match envelope.to_json_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(%err, "failed to serialize error envelope");
                return Ok(());
            }
        };
        publish_with_retry(broker, error_queue, &bytes).await?;
    }
    Ok(())
}

async fn publish_with_retry(broker: &dyn Broker, queue: &str, body: &[u8]) -> Result<(), ()> {
    let mut delay = PUBLISH_RETRY_BASE;
    for attempt in 1..=PUBLISH_RETRY_ATTEMPTS {
        match broker.publish(queue, body).await {
            Ok(()) => return Ok(()),
            Err(BrokerError::PublishFailed(reason)) if attempt < PUBLISH_RETRY_ATTEMPTS => {
                warn!(attempt, %reason, "publish failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(err) => {
                error!(%err, attempts = attempt, "publish exhausted retry budget");
                return Err(());
            }
        }
    }
    Err(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::broker::tests::FakeBroker;
    use async_trait::async_trait;

    /// Minimal transform shared with the supervisor test module, where no message ever flows.
    pub(crate) struct NoopTransform;

    #[async_trait]
    impl Transform for NoopTransform {
        async fn process(&self, message: &[u8]) -> loomq_core::TransformOutcome {
            loomq_core::TransformOutcome::ok(message.to_vec())
        }
    }

    struct EchoTransform;

    #[async_trait]
    impl Transform for EchoTransform {
        async fn process(&self, message: &[u8]) -> loomq_core::TransformOutcome {
            loomq_core::TransformOutcome::ok(message.to_vec())
        }
    }

    struct PanickingTransform;

    #[async_trait]
    impl Transform for PanickingTransform {
        async fn process(&self, _message: &[u8]) -> loomq_core::TransformOutcome {
            panic!("boom");
        }
    }

    struct LowSeverityTransform;

    #[async_trait]
    impl Transform for LowSeverityTransform {
        async fn process(&self, message: &[u8]) -> loomq_core::TransformOutcome {
            let envelope = ErrorEnvelope::new(
                "w",
                "input",
                "minor formatting issue",
                String::from_utf8_lossy(message).into_owned(),
                Severity::Low,
            );
            loomq_core::TransformOutcome::faulty(message.to_vec(), ErrorStatus::Low, envelope)
        }
    }

    #[tokio::test]
    async fn clean_message_forwards_and_acks() {
        let broker = Arc::new(FakeBroker::new());
        broker.push_input(b"hello".to_vec());
        let flags = WorkerFlags::new();
        flags.request_termination();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let exit = run(
            "w-1".into(),
            broker.clone(),
            Arc::new(EchoTransform),
            flags.clone(),
            "out".into(),
            "err".into(),
            tx,
        )
        .await;

        assert!(matches!(exit, WorkerExit::Drained));
        assert_eq!(broker.published("out"), vec![b"hello".to_vec()]);
        assert!(broker.published("err").is_empty());
        assert_eq!(broker.ack_count(), 1);
        assert!(rx.recv().await.is_some());
        assert!(!flags.is_busy(), "busy must be cleared before a drained exit");
    }

    #[tokio::test]
    async fn panicking_transform_yields_critical_envelope() {
        let broker = Arc::new(FakeBroker::new());
        broker.push_input(b"boom-input".to_vec());
        let flags = WorkerFlags::new();
        flags.request_termination();
        let (tx, _rx) = mpsc::unbounded_channel();

        let exit = run(
            "w-2".into(),
            broker.clone(),
            Arc::new(PanickingTransform),
            flags,
            "out".into(),
            "err".into(),
            tx,
        )
        .await;

        assert!(matches!(exit, WorkerExit::Drained));
        assert!(broker.published("out").is_empty());
        assert_eq!(broker.published("err").len(), 1);
        let envelope: serde_json::Value =
            serde_json::from_slice(&broker.published("err")[0]).unwrap();
        assert_eq!(envelope["Severity"], "CRITICAL");
        assert_eq!(envelope["Blame"], "worker");
    }

    #[tokio::test]
    async fn low_severity_outcome_publishes_to_both_queues() {
        let broker = Arc::new(FakeBroker::new());
        broker.push_input(b"dirty-input".to_vec());
        let flags = WorkerFlags::new();
        flags.request_termination();
        let (tx, _rx) = mpsc::unbounded_channel();

        let exit = run(
            "w-3".into(),
            broker.clone(),
            Arc::new(LowSeverityTransform),
            flags,
            "out".into(),
            "err".into(),
            tx,
        )
        .await;

        assert!(matches!(exit, WorkerExit::Drained));
        assert_eq!(broker.published("out").len(), 1);
        assert_eq!(broker.published("err").len(), 1);
        assert_eq!(broker.ack_count(), 1);
    }

    #[tokio::test]
    async fn publish_exhausted_nacks_and_exits() {
        let broker = Arc::new(FakeBroker::new());
        broker.push_input(b"hello".to_vec());
        broker.fail_publishing(true);
        let flags = WorkerFlags::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let exit = run(
            "w-4".into(),
            broker.clone(),
            Arc::new(EchoTransform),
            flags.clone(),
            "out".into(),
            "err".into(),
            tx,
        )
        .await;

        assert!(matches!(exit, WorkerExit::PublishExhausted));
        assert_eq!(broker.nack_count(), 1);
        assert_eq!(broker.ack_count(), 0);
        assert!(broker.published("out").is_empty());
        assert!(!flags.is_busy(), "busy must be cleared before the worker exits");
    }
}

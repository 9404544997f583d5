use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use loomq_core::Transform;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::api::{ScaleAction, StatusSnapshot, SupervisorConfig, SupervisorEvent, SupervisorHandle};
use crate::broker::{AmqpBroker, Broker, BrokerError};
use crate::policy::{self, Direction};
use crate::worker::{self, Completion, WorkerExit, WorkerFlags};

/// One live worker, as tracked by the roster. `flags` is the only state shared with the
/// worker task itself.
struct WorkerHandle {
    id: String,
    flags: Arc<WorkerFlags>,
}

/// Ordered sequence of live [`WorkerHandle`]s, owned exclusively by the Supervisor. Insertion
/// order; scale-down marks the oldest unmarked handles first.
struct PoolRoster {
    handles: Vec<WorkerHandle>,
}

impl PoolRoster {
    fn new() -> Self {
        Self { handles: Vec::new() }
    }

    fn live_count(&self) -> u32 {
        self.handles.len() as u32
    }

    /// Workers that are neither marked for termination nor counted twice by a pending spawn.
    fn active_count(&self) -> u32 {
        self.handles
            .iter()
            .filter(|h| !h.flags.is_marked())
            .count() as u32
    }

    fn push(&mut self, handle: WorkerHandle) {
        self.handles.push(handle);
    }

    fn remove(&mut self, id: &str) {
        self.handles.retain(|h| h.id != id);
    }

    /// Marks the first `k` unmarked handles, oldest first. Returns how many were actually
    /// marked (fewer than `k` if the roster doesn't have that many unmarked handles).
    fn mark_oldest_unmarked(&self, k: u32) -> u32 {
        let mut marked = 0;
        for h in &self.handles {
            if marked >= k {
                break;
            }
            if !h.flags.is_marked() {
                h.flags.request_termination();
                marked += 1;
            }
        }
        marked
    }

    fn mark_all(&self) {
        for h in &self.handles {
            h.flags.request_termination();
        }
    }

    fn any_busy(&self) -> bool {
        self.handles.iter().any(|h| h.flags.is_busy())
    }
}

/// Bounded window of the last N=10 per-message latencies. Advisory only: feeds the status-line
/// throughput estimate and nothing else.
struct SpeedWindow {
    samples: VecDeque<u64>,
}

impl SpeedWindow {
    const CAPACITY: usize = 10;

    fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(Self::CAPACITY),
        }
    }

    fn push(&mut self, latency_ms: u64) {
        if self.samples.len() == Self::CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    fn average_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64
    }

    /// Records/sec, scaled by the number of live workers. `0` until the first sample lands.
    fn throughput_per_sec(&self, live_count: u32) -> f64 {
        let avg = self.average_ms();
        if avg <= 0.0 {
            0.0
        } else {
            (1000.0 / avg) * live_count as f64
        }
    }
}

pub(crate) struct SupervisorInner {
    pub(crate) event_tx: broadcast::Sender<SupervisorEvent>,
    pub(crate) snapshot_rx: watch::Receiver<StatusSnapshot>,
    stop_requested: AtomicBool,
    notify: Notify,
}

impl SupervisorInner {
    pub(crate) fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            let _ = self.event_tx.send(SupervisorEvent::Warning {
                message: "graceful shutdown requested".into(),
            });
            self.notify.notify_waiters();
        }
    }

    fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

struct ScalePlan {
    action: ScaleAction,
    spawn_count: u32,
    mark_count: u32,
}

impl ScalePlan {
    fn consistent() -> Self {
        Self {
            action: ScaleAction::Consistent,
            spawn_count: 0,
            mark_count: 0,
        }
    }
}

struct Runtime {
    cfg: SupervisorConfig,
    transform: Arc<dyn Transform>,
    sampler: Arc<dyn Broker>,
    roster: PoolRoster,
    worker_join: JoinSet<(String, WorkerExit)>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    speed: SpeedWindow,
    next_worker_id: u64,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    inner: Arc<SupervisorInner>,
}

impl Runtime {
    fn emit(&self, event: SupervisorEvent) {
        let _ = self.inner.event_tx.send(event);
    }

    fn push_snapshot(&self, action: ScaleAction) {
        let snapshot = StatusSnapshot {
            live_count: self.roster.live_count(),
            throughput_per_sec: self.speed.throughput_per_sec(self.roster.live_count()),
            action,
        };
        let _ = self.snapshot_tx.send(snapshot.clone());
        self.emit(SupervisorEvent::Ticked { snapshot });
    }

    fn spawn_worker(&mut self) {
        let id = format!("loomq-worker-{}", self.next_worker_id);
        self.next_worker_id += 1;

        let flags = WorkerFlags::new();
        self.roster.push(WorkerHandle {
            id: id.clone(),
            flags: flags.clone(),
        });

        let uri = self.cfg.broker_uri.clone();
        let input_queue = self.cfg.input_queue.clone();
        let output_queue = self.cfg.output_queue.clone();
        let error_queue = self.cfg.error_queue.clone();
        let transform = self.transform.clone();
        let completions = self.completions_tx.clone();
        let worker_id = id.clone();

        self.worker_join.spawn(async move {
            let broker: Arc<dyn Broker> = match AmqpBroker::connect(
                &uri,
                &input_queue,
                &output_queue,
                &error_queue,
                &worker_id,
            )
            .await
            {
                Ok(broker) => Arc::new(broker),
                Err(err) => return (worker_id, WorkerExit::BrokerUnavailable(err.to_string())),
            };
            let exit = worker::run(
                worker_id.clone(),
                broker,
                transform,
                flags,
                output_queue,
                error_queue,
                completions,
            )
            .await;
            (worker_id, exit)
        });

        info!(worker_id = %id, "spawned worker");
    }

    /// Removes every roster entry whose task has already exited. Spec invariant: a handle is
    /// reaped only once its execution context has fully exited; since a worker never returns
    /// while `busy`, this can never reap a busy handle.
    fn reap(&mut self) {
        while let Some(res) = self.worker_join.try_join_next() {
            match res {
                Ok((id, exit)) => {
                    match &exit {
                        WorkerExit::Drained => info!(worker_id = %id, "worker reaped (drained)"),
                        WorkerExit::BrokerUnavailable(reason) => {
                            warn!(worker_id = %id, %reason, "worker reaped (broker unavailable)")
                        }
                        WorkerExit::PublishExhausted => {
                            warn!(worker_id = %id, "worker reaped (publish retries exhausted)")
                        }
                    }
                    self.roster.remove(&id);
                }
                Err(join_err) => warn!(%join_err, "worker task panicked"),
            }
        }
        while let Ok(completion) = self.completions_rx.try_recv() {
            self.speed.push(completion.latency_ms);
        }
    }

    async fn sample(&self) -> Result<(f64, f64), BrokerError> {
        let in_count = self.sampler.message_count(&self.cfg.input_queue).await?;
        let out_count = self.sampler.message_count(&self.cfg.output_queue).await?;
        let limit = self.cfg.blocking_limit.max(1) as f64;
        Ok((in_count as f64 / limit, out_count as f64 / limit))
    }

    /// Pure sizing decision derived from the current roster and the policy's output: how many
    /// workers to spawn or mark, and the resulting status-line label. Kept separate from
    /// [`Self::act`] so the scale-clamping arithmetic can be tested without spawning real tasks.
    fn plan(&self, decision: policy::Decision) -> ScalePlan {
        if decision.magnitude == 0 {
            if self.roster.live_count() == 0 {
                return ScalePlan {
                    action: ScaleAction::ScaledUp,
                    spawn_count: 1,
                    mark_count: 0,
                };
            }
            return ScalePlan::consistent();
        }

        match decision.direction {
            Direction::Up => {
                let active = self.roster.active_count();
                let wanted = decision.magnitude.saturating_sub(active.min(decision.magnitude));
                let room = self.cfg.max_worker_count.saturating_sub(self.roster.live_count());
                let to_spawn = wanted.min(SupervisorConfig::MAX_SPAWN_PER_TICK).min(room);
                ScalePlan {
                    action: if to_spawn > 0 {
                        ScaleAction::ScaledUp
                    } else {
                        ScaleAction::Consistent
                    },
                    spawn_count: to_spawn,
                    mark_count: 0,
                }
            }
            Direction::Down => {
                const FLOOR: u32 = 1;
                let sparable = self.roster.active_count().saturating_sub(FLOOR);
                let to_mark = decision.magnitude.min(sparable);
                ScalePlan {
                    action: if to_mark > 0 {
                        ScaleAction::ScaledDown
                    } else {
                        ScaleAction::Consistent
                    },
                    spawn_count: 0,
                    mark_count: to_mark,
                }
            }
            Direction::Hold => ScalePlan::consistent(),
        }
    }

    fn act(&mut self, decision: policy::Decision) -> ScaleAction {
        let plan = self.plan(decision);
        for _ in 0..plan.spawn_count {
            self.spawn_worker();
        }
        if plan.mark_count > 0 {
            self.roster.mark_oldest_unmarked(plan.mark_count);
        }
        plan.action
    }

    async fn drain(&mut self, grace: std::time::Duration) {
        self.roster.mark_all();
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            self.reap();
            if self.roster.live_count() == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("shutdown grace period elapsed; aborting remaining workers");
                self.worker_join.abort_all();
                while self.worker_join.join_next().await.is_some() {}
                self.roster.handles.clear();
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    async fn run(mut self) -> anyhow::Result<()> {
        self.emit(SupervisorEvent::Started);
        self.push_snapshot(ScaleAction::Consistent);

        let mut tick = tokio::time::interval(self.cfg.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.inner.notify.notified() => {}
            }

            if self.inner.should_stop() {
                break;
            }

            self.reap();

            let (in_load, out_load) = match self.sample().await {
                Ok(loads) => loads,
                Err(err) => {
                    warn!(%err, "skipping tick after sampling failure");
                    self.emit(SupervisorEvent::Warning {
                        message: format!("sample failed: {err}"),
                    });
                    continue;
                }
            };

            let decision = policy::decide(in_load, out_load);
            let action = self.act(decision);
            self.push_snapshot(action);
        }

        self.drain(self.cfg.shutdown_grace).await;
        self.emit(SupervisorEvent::Stopped);
        self.push_snapshot(ScaleAction::Consistent);
        Ok(())
    }
}

pub(crate) async fn start(
    cfg: SupervisorConfig,
    transform: Arc<dyn Transform>,
) -> Result<SupervisorHandle, BrokerError> {
    let sampler = AmqpBroker::connect(
        &cfg.broker_uri,
        &cfg.input_queue,
        &cfg.output_queue,
        &cfg.error_queue,
        "loomq-supervisor",
    )
    .await?;
    sampler.prepare(1).await?;

    let (event_tx, _) = broadcast::channel::<SupervisorEvent>(1024);
    let (snapshot_tx, snapshot_rx) = watch::channel(StatusSnapshot {
        live_count: 0,
        throughput_per_sec: 0.0,
        action: ScaleAction::Consistent,
    });
    let (completions_tx, completions_rx) = mpsc::unbounded_channel();

    let inner = Arc::new(SupervisorInner {
        event_tx,
        snapshot_rx,
        stop_requested: AtomicBool::new(false),
        notify: Notify::new(),
    });

    let runtime = Runtime {
        cfg,
        transform,
        sampler: Arc::new(sampler),
        roster: PoolRoster::new(),
        worker_join: JoinSet::new(),
        completions_rx,
        completions_tx,
        speed: SpeedWindow::new(),
        next_worker_id: 0,
        snapshot_tx,
        inner: inner.clone(),
    };

    let join = tokio::spawn(runtime.run());
    Ok(SupervisorHandle { inner, join })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(marked: bool, busy: bool) -> WorkerHandle {
        let flags = WorkerFlags::new();
        if marked {
            flags.request_termination();
        }
        WorkerHandle {
            id: format!("{:p}", Arc::as_ptr(&flags)),
            flags,
        }
    }

    #[test]
    fn mark_oldest_unmarked_skips_already_marked() {
        let mut roster = PoolRoster::new();
        roster.push(handle(true, false));
        roster.push(handle(false, false));
        roster.push(handle(false, false));

        let marked = roster.mark_oldest_unmarked(1);
        assert_eq!(marked, 1);
        assert!(roster.handles[0].flags.is_marked());
        assert!(roster.handles[1].flags.is_marked());
        assert!(!roster.handles[2].flags.is_marked());
    }

    #[test]
    fn mark_oldest_unmarked_caps_at_available_unmarked() {
        let mut roster = PoolRoster::new();
        roster.push(handle(true, false));
        roster.push(handle(false, false));

        let marked = roster.mark_oldest_unmarked(5);
        assert_eq!(marked, 1);
    }

    #[test]
    fn speed_window_caps_at_ten_samples() {
        let mut window = SpeedWindow::new();
        for i in 0..20u64 {
            window.push(i);
        }
        assert_eq!(window.samples.len(), SpeedWindow::CAPACITY);
        assert_eq!(window.samples.front().copied(), Some(10));
    }

    #[test]
    fn throughput_is_zero_without_samples() {
        let window = SpeedWindow::new();
        assert_eq!(window.throughput_per_sec(3), 0.0);
    }

    fn test_cfg() -> SupervisorConfig {
        SupervisorConfig {
            broker_uri: "amqp://localhost".into(),
            input_queue: "in".into(),
            output_queue: "out".into(),
            error_queue: "err".into(),
            max_worker_count: 5,
            blocking_limit: 100,
            tick_interval: SupervisorConfig::DEFAULT_TICK_INTERVAL,
            shutdown_grace: SupervisorConfig::DEFAULT_SHUTDOWN_GRACE,
        }
    }

    fn test_runtime() -> Runtime {
        let (event_tx, _) = broadcast::channel(16);
        let (snapshot_tx, snapshot_rx) = watch::channel(StatusSnapshot {
            live_count: 0,
            throughput_per_sec: 0.0,
            action: ScaleAction::Consistent,
        });
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SupervisorInner {
            event_tx,
            snapshot_rx,
            stop_requested: AtomicBool::new(false),
            notify: Notify::new(),
        });
        Runtime {
            cfg: test_cfg(),
            transform: Arc::new(crate::worker::tests::NoopTransform),
            sampler: Arc::new(crate::broker::tests::FakeBroker::new()),
            roster: PoolRoster::new(),
            worker_join: JoinSet::new(),
            completions_rx,
            completions_tx,
            speed: SpeedWindow::new(),
            next_worker_id: 0,
            snapshot_tx,
            inner,
        }
    }

    #[test]
    fn scale_up_bootstraps_from_empty_roster() {
        let rt = test_runtime();
        let plan = rt.plan(policy::Decision {
            direction: Direction::Hold,
            magnitude: 0,
        });
        assert_eq!(plan.action, ScaleAction::ScaledUp);
        assert_eq!(plan.spawn_count, 1);
    }

    #[test]
    fn scale_down_never_drives_roster_below_one() {
        let mut rt = test_runtime();
        rt.roster.push(handle(false, false));
        let plan = rt.plan(policy::Decision {
            direction: Direction::Down,
            magnitude: 3,
        });
        assert_eq!(plan.action, ScaleAction::Consistent);
        assert_eq!(plan.mark_count, 0);
    }

    #[test]
    fn scale_up_is_capped_per_tick() {
        let mut rt = test_runtime();
        rt.cfg.max_worker_count = 100;
        let plan = rt.plan(policy::Decision {
            direction: Direction::Up,
            magnitude: 9,
        });
        assert_eq!(plan.action, ScaleAction::ScaledUp);
        assert_eq!(plan.spawn_count, SupervisorConfig::MAX_SPAWN_PER_TICK);
    }

    #[test]
    fn scale_up_respects_max_worker_count() {
        let mut rt = test_runtime();
        rt.cfg.max_worker_count = 2;
        let plan = rt.plan(policy::Decision {
            direction: Direction::Up,
            magnitude: 9,
        });
        assert_eq!(plan.action, ScaleAction::ScaledUp);
        assert_eq!(plan.spawn_count, 2);
    }

    #[test]
    fn scale_down_marks_up_to_sparable_above_floor() {
        let mut rt = test_runtime();
        for _ in 0..5 {
            rt.roster.push(handle(false, false));
        }
        let plan = rt.plan(policy::Decision {
            direction: Direction::Down,
            magnitude: 3,
        });
        assert_eq!(plan.action, ScaleAction::ScaledDown);
        assert_eq!(plan.mark_count, 3);
    }
}

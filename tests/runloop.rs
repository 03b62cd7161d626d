//! End-to-end run loop scenarios against in-memory collaborators.
//!
//! The harness wires a scripted consumer (per-partition queues with real
//! choose/try_update flow control), a recording offset manager, and
//! scriptable tasks whose completion behavior each scenario picks.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use taskmux::{
    Callback, CallbackFactory, ContainerMetrics, Coordinator, Envelope, LoopError,
    MultiplexedConsumer, Offset, OffsetManager, Partition, RunLoop, RunLoopConfig, RunLoopHandle,
    StreamTask, TaskError, TaskName, TaskRef,
};

// ---- Collaborators ----

#[derive(Default)]
struct ConsumerInner {
    queues: BTreeMap<Partition, VecDeque<Envelope>>,
    gated: HashSet<Partition>,
    fail: bool,
}

/// Consumer with one queue per partition. Choosing an envelope gates its
/// partition until `try_update` acknowledges it, like the real multiplexer.
struct ScriptedConsumer {
    poll: Duration,
    inner: Mutex<ConsumerInner>,
    updates: Mutex<Vec<Partition>>,
}

impl ScriptedConsumer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            poll: Duration::from_millis(5),
            inner: Mutex::new(ConsumerInner::default()),
            updates: Mutex::new(Vec::new()),
        })
    }

    fn push(&self, envelope: Envelope) {
        self.inner
            .lock()
            .unwrap()
            .queues
            .entry(envelope.partition.clone())
            .or_default()
            .push_back(envelope);
    }

    fn fail_next_choose(&self) {
        self.inner.lock().unwrap().fail = true;
    }

    fn update_count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }
}

impl MultiplexedConsumer for ScriptedConsumer {
    fn choose(&self) -> Result<Option<Envelope>, LoopError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail {
            return Err(LoopError::Consumer {
                reason: "poll failed".to_string(),
            });
        }
        let partition = inner
            .queues
            .iter()
            .find(|(p, q)| !q.is_empty() && !inner.gated.contains(p))
            .map(|(p, _)| p.clone());
        match partition {
            Some(p) => {
                let envelope = inner.queues.get_mut(&p).unwrap().pop_front().unwrap();
                inner.gated.insert(p);
                Ok(Some(envelope))
            }
            None => Ok(None),
        }
    }

    fn try_update(&self, partition: &Partition) {
        self.updates.lock().unwrap().push(partition.clone());
        self.inner.lock().unwrap().gated.remove(partition);
    }

    fn poll_interval(&self) -> Duration {
        self.poll
    }
}

#[derive(Default)]
struct RecordingOffsets {
    updates: Mutex<Vec<(TaskName, Partition, Offset)>>,
}

impl RecordingOffsets {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn snapshot(&self) -> Vec<(TaskName, Partition, Offset)> {
        self.updates.lock().unwrap().clone()
    }

    /// Offsets must be strictly increasing per (task, partition).
    fn assert_monotonic(&self) {
        let mut last: HashMap<(TaskName, Partition), Offset> = HashMap::new();
        for (task, partition, offset) in self.snapshot() {
            if let Some(prev) = last.insert((task.clone(), partition.clone()), offset) {
                assert!(
                    offset > prev,
                    "offset regression for {task}/{partition}: {prev} -> {offset}"
                );
            }
        }
    }
}

impl OffsetManager for RecordingOffsets {
    fn update(&self, task: &TaskName, partition: &Partition, offset: Offset) {
        self.updates
            .lock()
            .unwrap()
            .push((task.clone(), partition.clone(), offset));
    }
}

// ---- Scriptable task ----

#[derive(Clone, Copy, PartialEq)]
enum Completion {
    /// Complete the callback inside `process`.
    Immediate,
    /// Park the callback on the probe; the test completes it later.
    Manual,
    /// Never complete (exercise the watchdog).
    Never,
    /// Fail the callback inside `process`.
    Fail,
}

#[derive(Default)]
struct TaskProbe {
    processed: Mutex<Vec<Envelope>>,
    parked: Mutex<Vec<Arc<Callback>>>,
    windows: AtomicU64,
    commits: AtomicU64,
}

impl TaskProbe {
    fn processed_count(&self) -> usize {
        self.processed.lock().unwrap().len()
    }

    fn parked_count(&self) -> usize {
        self.parked.lock().unwrap().len()
    }

    /// Completes the parked callback for the given offset.
    fn complete_offset(&self, offset: Offset) {
        let parked = self.parked.lock().unwrap();
        let callback = parked
            .iter()
            .find(|cb| cb.envelope().offset == offset)
            .expect("no parked callback for offset");
        callback.complete();
    }

    fn complete_all_parked(&self) {
        for callback in self.parked.lock().unwrap().iter() {
            callback.complete();
        }
    }
}

struct ScriptedTask {
    name: &'static str,
    partitions: Vec<Partition>,
    windowable: bool,
    completion: Completion,
    request_commit_and_shutdown: bool,
    first_dispatch: AtomicBool,
    probe: Arc<TaskProbe>,
}

impl ScriptedTask {
    fn new(name: &'static str, partitions: Vec<Partition>, completion: Completion) -> Arc<Self> {
        Arc::new(Self {
            name,
            partitions,
            windowable: false,
            completion,
            request_commit_and_shutdown: false,
            first_dispatch: AtomicBool::new(true),
            probe: Arc::new(TaskProbe::default()),
        })
    }

    fn windowed(name: &'static str, partitions: Vec<Partition>, completion: Completion) -> Arc<Self> {
        Arc::new(Self {
            name,
            partitions,
            windowable: true,
            completion,
            request_commit_and_shutdown: false,
            first_dispatch: AtomicBool::new(true),
            probe: Arc::new(TaskProbe::default()),
        })
    }

    fn requesting_shutdown(name: &'static str, partitions: Vec<Partition>) -> Arc<Self> {
        Arc::new(Self {
            name,
            partitions,
            windowable: false,
            completion: Completion::Immediate,
            request_commit_and_shutdown: true,
            first_dispatch: AtomicBool::new(true),
            probe: Arc::new(TaskProbe::default()),
        })
    }
}

#[async_trait]
impl StreamTask for ScriptedTask {
    fn name(&self) -> &str {
        self.name
    }

    fn partitions(&self) -> Vec<Partition> {
        self.partitions.clone()
    }

    fn windowable(&self) -> bool {
        self.windowable
    }

    async fn process(
        &self,
        envelope: Envelope,
        coordinator: Arc<Coordinator>,
        callbacks: CallbackFactory,
    ) {
        self.probe.processed.lock().unwrap().push(envelope);
        let callback = callbacks.create();

        if self.request_commit_and_shutdown && self.first_dispatch.swap(false, Ordering::SeqCst) {
            coordinator.request_commit();
            coordinator.request_shutdown();
        }

        match self.completion {
            Completion::Immediate => callback.complete(),
            Completion::Manual => self.probe.parked.lock().unwrap().push(callback),
            Completion::Never => {}
            Completion::Fail => callback.fail(TaskError::failed("scripted failure")),
        }
    }

    async fn window(&self, _coordinator: Arc<Coordinator>) -> Result<(), TaskError> {
        self.probe.windows.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn commit(&self) -> Result<(), TaskError> {
        self.probe.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---- Harness ----

struct Harness {
    handle: RunLoopHandle,
    token: CancellationToken,
    join: JoinHandle<Result<(), LoopError>>,
}

impl Harness {
    fn start(run_loop: RunLoop) -> Self {
        let handle = run_loop.handle();
        let token = CancellationToken::new();
        let join = tokio::spawn(run_loop.run(token.clone()));
        Self {
            handle,
            token,
            join,
        }
    }

    async fn shutdown_and_join(self) -> Result<(), LoopError> {
        self.handle.shutdown();
        self.join_within(Duration::from_secs(2)).await
    }

    async fn join_within(self, limit: Duration) -> Result<(), LoopError> {
        tokio::time::timeout(limit, self.join)
            .await
            .expect("run loop did not exit in time")
            .expect("run loop task panicked")
    }
}

fn build(
    tasks: Vec<TaskRef>,
    consumer: Arc<ScriptedConsumer>,
    offsets: Arc<RecordingOffsets>,
    metrics: Arc<ContainerMetrics>,
    config: RunLoopConfig,
) -> RunLoop {
    RunLoop::new(tasks, consumer, offsets, metrics, config).expect("valid assignment")
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn partition() -> Partition {
    Partition::new("input", 0)
}

// ---- Scenarios ----

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn happy_path_single_task_commits_in_order() {
    let p = partition();
    let consumer = ScriptedConsumer::new();
    consumer.push(Envelope::new(p.clone(), 10, "a"));
    consumer.push(Envelope::new(p.clone(), 11, "b"));
    let offsets = RecordingOffsets::new();
    let metrics = Arc::new(ContainerMetrics::new());

    let task = ScriptedTask::new("t", vec![p.clone()], Completion::Immediate);
    let probe = task.probe.clone();
    let harness = Harness::start(build(
        vec![task],
        consumer.clone(),
        offsets.clone(),
        metrics.clone(),
        RunLoopConfig::default(),
    ));

    wait_until("both envelopes processed", || probe.processed_count() == 2).await;
    harness.shutdown_and_join().await.unwrap();

    assert_eq!(metrics.envelopes.get(), 2);
    assert_eq!(metrics.processes.get(), 2);
    let t = TaskName::from("t");
    assert_eq!(
        offsets.snapshot(),
        vec![(t.clone(), p.clone(), 10), (t, p, 11)]
    );
    offsets.assert_monotonic();
    assert!(metrics.choose_ns.count() > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn out_of_order_completions_commit_high_water_marks() {
    let p = partition();
    let consumer = ScriptedConsumer::new();
    for offset in 1..=4 {
        consumer.push(Envelope::new(p.clone(), offset, "m"));
    }
    let offsets = RecordingOffsets::new();

    let task = ScriptedTask::new("t", vec![p.clone()], Completion::Manual);
    let probe = task.probe.clone();
    let harness = Harness::start(build(
        vec![task],
        consumer,
        offsets.clone(),
        Arc::new(ContainerMetrics::new()),
        RunLoopConfig {
            max_concurrency: 4,
            ..RunLoopConfig::default()
        },
    ));

    wait_until("four in-flight dispatches", || probe.parked_count() == 4).await;
    let t = TaskName::from("t");

    probe.complete_offset(3);
    assert_eq!(offsets.snapshot(), vec![]);

    probe.complete_offset(1);
    assert_eq!(offsets.snapshot(), vec![(t.clone(), p.clone(), 1)]);

    probe.complete_offset(4);
    assert_eq!(offsets.snapshot().len(), 1);

    probe.complete_offset(2);
    assert_eq!(
        offsets.snapshot(),
        vec![(t.clone(), p.clone(), 1), (t, p, 4)]
    );
    offsets.assert_monotonic();

    harness.shutdown_and_join().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broadcast_envelope_reaches_all_tasks_with_one_cursor_advance() {
    let p = partition();
    let consumer = ScriptedConsumer::new();
    consumer.push(Envelope::new(p.clone(), 7, "m"));
    let offsets = RecordingOffsets::new();

    let t1 = ScriptedTask::new("t1", vec![p.clone()], Completion::Immediate);
    let t2 = ScriptedTask::new("t2", vec![p.clone()], Completion::Immediate);
    let (probe1, probe2) = (t1.probe.clone(), t2.probe.clone());

    let harness = Harness::start(build(
        vec![t1, t2],
        consumer.clone(),
        offsets.clone(),
        Arc::new(ContainerMetrics::new()),
        RunLoopConfig::default(),
    ));

    wait_until("both tasks processed the broadcast", || {
        probe1.processed_count() == 1 && probe2.processed_count() == 1
    })
    .await;
    harness.shutdown_and_join().await.unwrap();

    assert_eq!(consumer.update_count(), 1);
    let snapshot = offsets.snapshot();
    assert!(snapshot.contains(&(TaskName::from("t1"), p.clone(), 7)));
    assert!(snapshot.contains(&(TaskName::from("t2"), p, 7)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn window_waits_for_in_flight_and_blocks_dispatch() {
    let p = partition();
    let consumer = ScriptedConsumer::new();
    for offset in 1..=3 {
        consumer.push(Envelope::new(p.clone(), offset, "m"));
    }
    let offsets = RecordingOffsets::new();
    let metrics = Arc::new(ContainerMetrics::new());

    let task = ScriptedTask::windowed("t", vec![p.clone()], Completion::Manual);
    let probe = task.probe.clone();
    let harness = Harness::start(build(
        vec![task],
        consumer.clone(),
        offsets.clone(),
        metrics.clone(),
        RunLoopConfig {
            max_concurrency: 8,
            window_interval: Duration::from_millis(50),
            ..RunLoopConfig::default()
        },
    ));

    wait_until("three in-flight dispatches", || probe.parked_count() == 3).await;

    // Let a window tick fire while three dispatches are in flight. The
    // window must not start, and neither may new process dispatches.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(probe.windows.load(Ordering::SeqCst), 0);

    consumer.push(Envelope::new(p.clone(), 4, "m"));
    consumer.push(Envelope::new(p.clone(), 5, "m"));
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(probe.processed_count(), 3, "dispatch resumed too early");

    // Draining the in-flight messages unblocks the window, then dispatch.
    probe.complete_all_parked();
    wait_until("window ran", || probe.windows.load(Ordering::SeqCst) >= 1).await;
    wait_until("dispatch resumed", || probe.processed_count() == 5).await;
    assert!(metrics.windows.get() >= 1);

    harness.shutdown_and_join().await.unwrap();
    offsets.assert_monotonic();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn callback_timeout_aborts_without_offset_advance() {
    let p = partition();
    let consumer = ScriptedConsumer::new();
    consumer.push(Envelope::new(p.clone(), 5, "m"));
    let offsets = RecordingOffsets::new();

    let task = ScriptedTask::new("t", vec![p], Completion::Never);
    let harness = Harness::start(build(
        vec![task],
        consumer,
        offsets.clone(),
        Arc::new(ContainerMetrics::new()),
        RunLoopConfig {
            callback_timeout: Duration::from_millis(25),
            ..RunLoopConfig::default()
        },
    ));

    let result = harness.join_within(Duration::from_secs(2)).await;
    match result {
        Err(LoopError::Task {
            task,
            source: TaskError::Timeout { .. },
        }) => assert_eq!(task, TaskName::from("t")),
        other => panic!("expected callback timeout, got {other:?}"),
    }
    assert!(offsets.snapshot().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn coordinator_shutdown_runs_owed_commit_first() {
    let p = partition();
    let consumer = ScriptedConsumer::new();
    consumer.push(Envelope::new(p.clone(), 1, "m"));
    let offsets = RecordingOffsets::new();
    let metrics = Arc::new(ContainerMetrics::new());

    let task = ScriptedTask::requesting_shutdown("t", vec![p]);
    let probe = task.probe.clone();
    let harness = Harness::start(build(
        vec![task],
        consumer,
        offsets.clone(),
        metrics.clone(),
        RunLoopConfig::default(),
    ));

    // The loop shuts itself down once the requested commit has run.
    harness.join_within(Duration::from_secs(2)).await.unwrap();
    assert_eq!(probe.commits.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.commits.get(), 1);
}

// ---- Failure and edge paths ----

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn process_failure_aborts_and_keeps_replay_position() {
    let p = partition();
    let consumer = ScriptedConsumer::new();
    consumer.push(Envelope::new(p.clone(), 3, "m"));
    let offsets = RecordingOffsets::new();

    let task = ScriptedTask::new("t", vec![p], Completion::Fail);
    let harness = Harness::start(build(
        vec![task],
        consumer,
        offsets.clone(),
        Arc::new(ContainerMetrics::new()),
        RunLoopConfig::default(),
    ));

    let result = harness.join_within(Duration::from_secs(2)).await;
    assert!(matches!(
        result,
        Err(LoopError::Task {
            source: TaskError::Failed { .. },
            ..
        })
    ));
    assert!(offsets.snapshot().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn consumer_error_propagates() {
    let consumer = ScriptedConsumer::new();
    consumer.fail_next_choose();

    let task = ScriptedTask::new("t", vec![partition()], Completion::Immediate);
    let harness = Harness::start(build(
        vec![task],
        consumer,
        RecordingOffsets::new(),
        Arc::new(ContainerMetrics::new()),
        RunLoopConfig::default(),
    ));

    let result = harness.join_within(Duration::from_secs(2)).await;
    assert!(matches!(result, Err(LoopError::Consumer { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unroutable_partition_is_fatal() {
    let consumer = ScriptedConsumer::new();
    consumer.push(Envelope::new(Partition::new("unassigned", 9), 1, "m"));

    let task = ScriptedTask::new("t", vec![partition()], Completion::Immediate);
    let harness = Harness::start(build(
        vec![task],
        consumer,
        RecordingOffsets::new(),
        Arc::new(ContainerMetrics::new()),
        RunLoopConfig::default(),
    ));

    let result = harness.join_within(Duration::from_secs(2)).await;
    assert!(matches!(
        result,
        Err(LoopError::UnroutablePartition { partition }) if partition == Partition::new("unassigned", 9)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_completion_is_ignored() {
    let p = partition();
    let consumer = ScriptedConsumer::new();
    consumer.push(Envelope::new(p.clone(), 9, "m"));
    let offsets = RecordingOffsets::new();

    let task = ScriptedTask::new("t", vec![p], Completion::Manual);
    let probe = task.probe.clone();
    let run_loop = build(
        vec![task],
        consumer,
        offsets.clone(),
        Arc::new(ContainerMetrics::new()),
        RunLoopConfig::default(),
    );
    let task_metrics = run_loop.task_metrics(&TaskName::from("t")).unwrap();
    let harness = Harness::start(run_loop);

    wait_until("dispatch parked", || probe.parked_count() == 1).await;
    probe.complete_offset(9);
    probe.complete_offset(9);

    harness.shutdown_and_join().await.unwrap();
    assert_eq!(offsets.snapshot().len(), 1);
    assert_eq!(task_metrics.duplicate_callbacks.get(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_while_parked_is_interrupted() {
    let consumer = ScriptedConsumer::new();
    let task = ScriptedTask::new("t", vec![partition()], Completion::Immediate);
    let harness = Harness::start(build(
        vec![task],
        consumer,
        RecordingOffsets::new(),
        Arc::new(ContainerMetrics::new()),
        RunLoopConfig::default(),
    ));

    tokio::time::sleep(Duration::from_millis(30)).await;
    harness.token.cancel();
    let result = harness.join_within(Duration::from_secs(2)).await;
    assert!(matches!(result, Err(LoopError::Interrupted)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn periodic_window_and_commit_both_fire_when_idle() {
    let consumer = ScriptedConsumer::new();
    let metrics = Arc::new(ContainerMetrics::new());

    let task = ScriptedTask::windowed("t", vec![partition()], Completion::Immediate);
    let probe = task.probe.clone();
    let harness = Harness::start(build(
        vec![task],
        consumer,
        RecordingOffsets::new(),
        metrics.clone(),
        RunLoopConfig {
            window_interval: Duration::from_millis(30),
            commit_interval: Duration::from_millis(45),
            ..RunLoopConfig::default()
        },
    ));

    wait_until("window and commit ticks fired", || {
        probe.windows.load(Ordering::SeqCst) >= 2 && probe.commits.load(Ordering::SeqCst) >= 2
    })
    .await;
    harness.shutdown_and_join().await.unwrap();

    assert!(metrics.windows.get() >= 2);
    assert!(metrics.commits.get() >= 2);
    assert!(metrics.window_ns.count() >= 2);
    assert!(metrics.commit_ns.count() >= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn window_error_aborts_the_loop() {
    struct FailingWindowTask {
        partitions: Vec<Partition>,
    }

    #[async_trait]
    impl StreamTask for FailingWindowTask {
        fn name(&self) -> &str {
            "t"
        }

        fn partitions(&self) -> Vec<Partition> {
            self.partitions.clone()
        }

        fn windowable(&self) -> bool {
            true
        }

        async fn process(
            &self,
            _envelope: Envelope,
            _coordinator: Arc<Coordinator>,
            callbacks: CallbackFactory,
        ) {
            callbacks.create().complete();
        }

        async fn window(&self, _coordinator: Arc<Coordinator>) -> Result<(), TaskError> {
            Err(TaskError::failed("window blew up"))
        }
    }

    let harness = Harness::start(build(
        vec![Arc::new(FailingWindowTask {
            partitions: vec![partition()],
        })],
        ScriptedConsumer::new(),
        RecordingOffsets::new(),
        Arc::new(ContainerMetrics::new()),
        RunLoopConfig {
            window_interval: Duration::from_millis(20),
            ..RunLoopConfig::default()
        },
    ));

    let result = harness.join_within(Duration::from_secs(2)).await;
    assert!(matches!(result, Err(LoopError::Window { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn offloaded_commit_still_serializes_with_dispatch() {
    let p = partition();
    let consumer = ScriptedConsumer::new();
    for offset in 1..=20 {
        consumer.push(Envelope::new(p.clone(), offset, "m"));
    }
    let offsets = RecordingOffsets::new();
    let metrics = Arc::new(ContainerMetrics::new());

    let task = ScriptedTask::new("t", vec![p.clone()], Completion::Immediate);
    let probe = task.probe.clone();
    let harness = Harness::start(build(
        vec![task],
        consumer,
        offsets.clone(),
        metrics.clone(),
        RunLoopConfig {
            max_concurrency: 4,
            commit_interval: Duration::from_millis(10),
            offload: true,
            ..RunLoopConfig::default()
        },
    ));

    wait_until("all envelopes processed", || probe.processed_count() == 20).await;
    wait_until("a commit fired", || probe.commits.load(Ordering::SeqCst) >= 1).await;
    harness.shutdown_and_join().await.unwrap();

    offsets.assert_monotonic();
    let snapshot = offsets.snapshot();
    assert_eq!(snapshot.last(), Some(&(TaskName::from("t"), p, 20)));
}

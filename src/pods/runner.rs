//! Runners and the runner collection.
//!
//! One runner drives one worker pod: `pod_cc` cooperative workers drain the
//! group's shared queue while a supervisor watches for idleness and
//! cancellation. The collection owns the dense index space, the shared job
//! counters, and the pod add/remove transitions.

use super::ordered::{Indexed, OrderedCollection};
use super::JobWrapper;
use super::Operator;
use k8s_openapi::api::core::v1::Pod;
use once_cell::sync::OnceCell;
use regex::Regex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunnerState {
    Scheduled,
    Running,
    Stopping,
}

/// Collection hooks handed to every runner, so runners never hold a direct
/// reference back to the collection.
#[derive(Clone)]
pub(crate) struct RunnerHooks {
    pub before_job_run: Arc<dyn Fn() + Send + Sync>,
    pub after_job_run: Arc<dyn Fn() + Send + Sync>,
    pub on_job_finish: Arc<dyn Fn() + Send + Sync>,
    pub requeue: Arc<dyn Fn(JobWrapper) + Send + Sync>,
}

pub(crate) struct Runner {
    group: String,
    index: AtomicUsize,
    state: Mutex<RunnerState>,
    pod: Mutex<Option<Pod>>,
    cancel: CancellationToken,
    soft: bool,
    pod_cc: usize,
    idle_timeout: Duration,
    incoming: async_channel::Receiver<JobWrapper>,
    operator: Arc<dyn Operator>,
    hooks: RunnerHooks,
}

impl Indexed for Arc<Runner> {
    fn set_index(&self, index: usize) {
        self.index.store(index, Ordering::SeqCst);
        // A freshly scheduled runner asks the operator for its pod as soon
        // as it knows its name.
        if *self.state.lock().unwrap() == RunnerState::Scheduled {
            let operator = Arc::clone(&self.operator);
            let name = self.name();
            tokio::spawn(async move {
                operator.spin_up(&name);
            });
        }
    }
}

impl Runner {
    pub(crate) fn name(&self) -> String {
        format!("{}-{}", self.group, self.index.load(Ordering::SeqCst))
    }

    pub(crate) fn state(&self) -> RunnerState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: RunnerState) {
        *self.state.lock().unwrap() = state;
    }

    fn set_pod(&self, pod: Pod) {
        *self.pod.lock().unwrap() = Some(pod);
    }

    /// Promotes the runner to running and spawns its workers + supervisor.
    fn start(self: &Arc<Self>) {
        self.set_state(RunnerState::Running);
        let runner = Arc::clone(self);
        tokio::spawn(async move { runner.supervise().await });
    }

    async fn supervise(self: Arc<Self>) {
        let (busy_tx, mut busy_rx) = tokio::sync::mpsc::channel::<()>(1);
        for _ in 0..self.pod_cc {
            let worker = Arc::clone(&self);
            let busy = busy_tx.clone();
            tokio::spawn(async move { worker.work(busy).await });
        }
        drop(busy_tx);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.idle_timeout) => {
                    debug!(runner = %self.name(), "idle timeout reached, retiring");
                    self.cancel.cancel();
                    break;
                }
                received = busy_rx.recv() => {
                    // None means every worker exited (queue closed).
                    if received.is_none() {
                        break;
                    }
                }
            }
        }

        self.set_state(RunnerState::Stopping);
        let operator = Arc::clone(&self.operator);
        let name = self.name();
        let soft = self.soft;
        tokio::spawn(async move {
            operator.tear_down(&name, soft);
        });
    }

    async fn work(self: Arc<Self>, busy: tokio::sync::mpsc::Sender<()>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = self.incoming.recv() => {
                    let Ok(mut wrapper) = received else {
                        // Queue closed and drained.
                        break;
                    };
                    let _ = busy.send(()).await;
                    (self.hooks.before_job_run)();
                    let pod = self.pod.lock().unwrap().clone();
                    let result = (wrapper.job)(pod).await;
                    (self.hooks.after_job_run)();
                    if result.is_err() && wrapper.retry_count < wrapper.retry_limit {
                        wrapper.retry_count += 1;
                        (self.hooks.requeue)(wrapper);
                    } else {
                        (self.hooks.on_job_finish)();
                    }
                }
            }
        }
    }
}

#[derive(Default)]
struct Counters {
    job_count: usize,
    job_running: usize,
}

/// The set of runners for one pod group.
pub(crate) struct RunnerCollection {
    group: String,
    min: usize,
    max: usize,
    pod_cc: usize,
    idle_timeout: Duration,
    extractor: Regex,
    operator: Arc<dyn Operator>,
    queue_rx: async_channel::Receiver<JobWrapper>,
    queue_tx: async_channel::Sender<JobWrapper>,
    counters: Mutex<Counters>,
    pub(crate) runners: OrderedCollection<Arc<Runner>>,
    root: CancellationToken,
    hooks: OnceCell<RunnerHooks>,
}

impl RunnerCollection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        group: &str,
        min: usize,
        max: usize,
        pod_cc: usize,
        idle_timeout: Duration,
        queue_rx: async_channel::Receiver<JobWrapper>,
        queue_tx: async_channel::Sender<JobWrapper>,
        operator: Arc<dyn Operator>,
        root: CancellationToken,
    ) -> Arc<Self> {
        let collection = Arc::new(Self {
            group: group.to_string(),
            min,
            max,
            pod_cc: pod_cc.max(1),
            idle_timeout,
            extractor: Regex::new(&format!(r"^{}-(\d+)-.*$", regex::escape(group)))
                .expect("runner index extractor"),
            operator,
            queue_rx,
            queue_tx,
            counters: Mutex::new(Counters::default()),
            runners: OrderedCollection::new(),
            root,
            hooks: OnceCell::new(),
        });

        let hooks = RunnerHooks {
            before_job_run: {
                let weak = Arc::downgrade(&collection);
                Arc::new(move || {
                    if let Some(c) = weak.upgrade() {
                        c.counters.lock().unwrap().job_running += 1;
                    }
                })
            },
            after_job_run: {
                let weak = Arc::downgrade(&collection);
                Arc::new(move || {
                    if let Some(c) = weak.upgrade() {
                        let mut counters = c.counters.lock().unwrap();
                        counters.job_running = counters.job_running.saturating_sub(1);
                    }
                })
            },
            on_job_finish: {
                let weak = Arc::downgrade(&collection);
                Arc::new(move || {
                    if let Some(c) = weak.upgrade() {
                        let mut counters = c.counters.lock().unwrap();
                        counters.job_count = counters.job_count.saturating_sub(1);
                    }
                })
            },
            requeue: {
                let weak = Arc::downgrade(&collection);
                Arc::new(move |wrapper: JobWrapper| {
                    if let Some(c) = weak.upgrade() {
                        let _ = c.queue_tx.try_send(wrapper);
                        // Re-evaluate demand so a retried job can still wake
                        // a runner; the job itself is already counted.
                        c.schedule(0);
                    }
                })
            },
        };
        let _ = collection.hooks.set(hooks);
        collection
    }

    pub(crate) fn job_count(&self) -> usize {
        self.counters.lock().unwrap().job_count
    }

    /// Registers `count` new jobs and spins up enough scheduled runners to
    /// cover the outstanding work, clamped into `[min, max]` where set.
    pub(crate) fn schedule(&self, count: usize) {
        let spawn = {
            let mut counters = self.counters.lock().unwrap();
            counters.job_count += count;
            let need_run = counters.job_count.saturating_sub(counters.job_running);
            let needed = need_run.div_ceil(self.pod_cc);
            let live = self.runners.len();
            let mut target = live + needed;
            if self.max > 0 {
                target = target.min(self.max);
            }
            if self.min > 0 {
                target = target.max(self.min);
            }
            target.saturating_sub(live)
        };
        for _ in 0..spawn {
            self.runners.fill(self.new_runner(RunnerState::Scheduled, None));
        }
    }

    fn new_runner(&self, state: RunnerState, pod: Option<Pod>) -> Arc<Runner> {
        Arc::new(Runner {
            group: self.group.clone(),
            index: AtomicUsize::new(0),
            state: Mutex::new(state),
            pod: Mutex::new(pod),
            cancel: self.root.child_token(),
            soft: false,
            pod_cc: self.pod_cc,
            idle_timeout: self.idle_timeout,
            incoming: self.queue_rx.clone(),
            operator: Arc::clone(&self.operator),
            hooks: self.hooks.get().expect("hooks installed at construction").clone(),
        })
    }

    pub(crate) fn extract_index(&self, pod_name: &str) -> Option<usize> {
        self.extractor
            .captures(pod_name)
            .and_then(|caps| caps[1].parse().ok())
    }

    /// A matching pod became available.
    pub(crate) fn on_add(&self, pod: Pod) {
        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        let Some(index) = self.extract_index(&pod_name) else {
            warn!(
                group = %self.group,
                pod = %pod_name,
                "pod add with unextractable index, this should not happen"
            );
            return;
        };
        match self.runners.get(index) {
            Some(runner) => match runner.state() {
                RunnerState::Scheduled => {
                    runner.set_pod(pod);
                    runner.start();
                }
                RunnerState::Running => {
                    warn!(
                        group = %self.group,
                        pod = %pod_name,
                        "pod add for an already running runner, this should not happen"
                    );
                }
                RunnerState::Stopping => {
                    // A stopped runner never resurrects; replace it.
                    let runner = self.new_runner(RunnerState::Running, Some(pod));
                    self.runners.set(index, Arc::clone(&runner));
                    runner.start();
                }
            },
            None => {
                let runner = self.new_runner(RunnerState::Running, Some(pod));
                self.runners.set(index, Arc::clone(&runner));
                runner.start();
            }
        }
    }

    /// A matching pod went away.
    pub(crate) fn on_remove(&self, pod: Pod) {
        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        let Some(index) = self.extract_index(&pod_name) else {
            warn!(
                group = %self.group,
                pod = %pod_name,
                "pod remove with unextractable index, this should not happen"
            );
            return;
        };
        if let Some(runner) = self.runners.get(index) {
            if runner.state() == RunnerState::Running {
                runner.set_state(RunnerState::Stopping);
                runner.cancel.cancel();
            }
        }
        self.runners.delete(index);
    }
}

//! Dynamic worker-pod pools.
//!
//! A [`Group`] accepts jobs into an unbounded queue and scales worker pods
//! through an injected [`Operator`]. Each live pod is driven by a runner
//! with bounded per-pod concurrency; failed jobs are requeued up to a retry
//! limit; idle runners retire themselves and their pod.

pub mod operator;
pub mod ordered;
mod runner;

pub use operator::Operator;

use crate::error::{EngineError, Result};
use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::Pod;
use regex::Regex;
use runner::RunnerCollection;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A user-supplied unit of work executed against a worker pod.
///
/// Jobs may run more than once (retries), so they are shared closures. The
/// pod is `None` when the runner has not observed its pod yet.
pub type Job = Arc<dyn Fn(Option<Pod>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Envelope carrying a job's retry bookkeeping through the queue.
pub(crate) struct JobWrapper {
    pub job: Job,
    pub retry_count: u32,
    pub retry_limit: u32,
}

/// Tunables for a pod group.
#[derive(Debug, Clone)]
pub struct GroupOptions {
    /// Concurrent jobs per pod.
    pub pod_concurrency: usize,
    /// Retries per job after the first failure.
    pub retry: u32,
    /// Upper bound on worker pods; 0 means unbounded.
    pub max: usize,
    /// Lower bound on worker pods; 0 means none.
    pub min: usize,
    /// How long a runner may sit without work before retiring.
    pub idle_timeout: Duration,
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self {
            pod_concurrency: 1,
            retry: 0,
            max: 0,
            min: 0,
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// A named dynamic worker pool whose pods are `<group>-<index>-<suffix>`.
pub struct Group {
    name: String,
    retry: u32,
    queue_tx: async_channel::Sender<JobWrapper>,
    pub(crate) runners: Arc<RunnerCollection>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group").field("name", &self.name).finish()
    }
}

impl Group {
    /// Builds the group, wires the runner collection to the operator, and
    /// starts the watch and finalizer tasks.
    pub fn new(
        cancel: CancellationToken,
        name: &str,
        operator: Arc<dyn Operator>,
        options: GroupOptions,
    ) -> Result<Arc<Self>> {
        if name.is_empty() {
            return Err(EngineError::InvalidName("pod group name".to_string()));
        }
        let (queue_tx, queue_rx) = async_channel::unbounded();
        let runners = RunnerCollection::new(
            name,
            options.min,
            options.max,
            options.pod_concurrency.max(1),
            options.idle_timeout,
            queue_rx,
            queue_tx.clone(),
            Arc::clone(&operator),
            cancel.child_token(),
        );

        {
            let operator = Arc::clone(&operator);
            let on_add = {
                let runners = Arc::clone(&runners);
                Arc::new(move |pod: Pod| runners.on_add(pod)) as crate::cluster::PodHandler
            };
            let on_remove = {
                let runners = Arc::clone(&runners);
                Arc::new(move |pod: Pod| runners.on_remove(pod)) as crate::cluster::PodHandler
            };
            tokio::spawn(async move {
                let match_all = Regex::new("").expect("empty regex");
                operator.watch(match_all, on_add, on_remove).await;
            });
        }
        {
            // Closing the queue lets drained workers exit, which retires
            // their runners.
            let cancel = cancel.clone();
            let queue_tx = queue_tx.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                queue_tx.close();
            });
        }

        Ok(Arc::new(Self {
            name: name.to_string(),
            retry: options.retry,
            queue_tx,
            runners,
            cancel,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Jobs not yet terminally finished.
    pub fn outstanding(&self) -> usize {
        self.runners.job_count()
    }

    /// Enqueues jobs and scales the runner pool to cover them.
    pub fn schedule<I>(&self, jobs: I)
    where
        I: IntoIterator<Item = Job>,
    {
        let mut count = 0;
        for job in jobs {
            count += 1;
            let _ = self.queue_tx.try_send(JobWrapper {
                job,
                retry_count: 0,
                retry_limit: self.retry,
            });
        }
        self.runners.schedule(count);
    }

    /// Cancels the group: closes the queue and retires every runner.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::PodHandler;
    use async_trait::async_trait;
    use futures::FutureExt;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    enum PodEvent {
        Add(Pod),
        Remove(Pod),
    }

    /// Operator double: every spin-up immediately yields a pod named
    /// `<runner>-0`, every teardown retracts it.
    struct TestOperator {
        events_tx: async_channel::Sender<PodEvent>,
        events_rx: async_channel::Receiver<PodEvent>,
        spun: Mutex<Vec<String>>,
        torn: Mutex<Vec<String>>,
    }

    impl TestOperator {
        fn new() -> Arc<Self> {
            let (events_tx, events_rx) = async_channel::unbounded();
            Arc::new(Self {
                events_tx,
                events_rx,
                spun: Mutex::new(Vec::new()),
                torn: Mutex::new(Vec::new()),
            })
        }

        fn pod(name: &str) -> Pod {
            Pod {
                metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Operator for TestOperator {
        fn spin_up(&self, name: &str) {
            self.spun.lock().unwrap().push(name.to_string());
            let _ = self
                .events_tx
                .try_send(PodEvent::Add(Self::pod(&format!("{}-0", name))));
        }

        fn tear_down(&self, name: &str, _soft: bool) {
            self.torn.lock().unwrap().push(name.to_string());
            let _ = self
                .events_tx
                .try_send(PodEvent::Remove(Self::pod(&format!("{}-0", name))));
        }

        async fn watch(
            &self,
            pattern: Regex,
            on_available: PodHandler,
            on_unavailable: PodHandler,
        ) {
            while let Ok(event) = self.events_rx.recv().await {
                match event {
                    PodEvent::Add(pod) => {
                        if pattern.is_match(pod.metadata.name.as_deref().unwrap_or("")) {
                            on_available(pod);
                        }
                    }
                    PodEvent::Remove(pod) => {
                        if pattern.is_match(pod.metadata.name.as_deref().unwrap_or("")) {
                            on_unavailable(pod);
                        }
                    }
                }
            }
        }
    }

    async fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_group_runs_scheduled_jobs() {
        let operator = TestOperator::new();
        let group = Group::new(
            CancellationToken::new(),
            "whocares",
            operator,
            GroupOptions::default(),
        )
        .unwrap();

        let (done_tx, done_rx) = async_channel::unbounded::<usize>();
        let jobs: Vec<Job> = (1..=2)
            .map(|i| {
                let done = done_tx.clone();
                Arc::new(move |_pod: Option<Pod>| {
                    let done = done.clone();
                    async move {
                        let _ = done.try_send(i);
                        Ok(())
                    }
                    .boxed()
                }) as Job
            })
            .collect();
        group.schedule(jobs);

        let mut sum = 0;
        for _ in 0..2 {
            sum += tokio::time::timeout(Duration::from_secs(5), done_rx.recv())
                .await
                .expect("job did not finish")
                .unwrap();
        }
        assert_eq!(sum, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_more_jobs_than_pods() {
        let operator = TestOperator::new();
        let group = Group::new(
            CancellationToken::new(),
            "whocares",
            Arc::clone(&operator) as Arc<dyn Operator>,
            GroupOptions {
                max: 2,
                ..Default::default()
            },
        )
        .unwrap();

        let per_pod: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));
        let (done_tx, done_rx) = async_channel::unbounded::<()>();
        let jobs: Vec<Job> = (0..10)
            .map(|_| {
                let per_pod = Arc::clone(&per_pod);
                let done = done_tx.clone();
                Arc::new(move |pod: Option<Pod>| {
                    let per_pod = Arc::clone(&per_pod);
                    let done = done.clone();
                    async move {
                        let name = pod
                            .and_then(|p| p.metadata.name)
                            .unwrap_or_else(|| "unknown".to_string());
                        *per_pod.lock().unwrap().entry(name).or_insert(0) += 1;
                        let _ = done.try_send(());
                        Ok(())
                    }
                    .boxed()
                }) as Job
            })
            .collect();
        group.schedule(jobs);

        for _ in 0..10 {
            tokio::time::timeout(Duration::from_secs(5), done_rx.recv())
                .await
                .expect("job did not finish")
                .unwrap();
        }
        let counts = per_pod.lock().unwrap().clone();
        assert!(counts.len() <= 2, "at most two pods, saw {:?}", counts);
        assert_eq!(counts.values().sum::<usize>(), 10);
        assert!(
            wait_until(|| group.outstanding() == 0, Duration::from_secs(2)).await,
            "outstanding jobs never drained"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_jobs_are_retried_up_to_limit() {
        let operator = TestOperator::new();
        let group = Group::new(
            CancellationToken::new(),
            "whocares",
            operator,
            GroupOptions {
                max: 2,
                retry: 3,
                ..Default::default()
            },
        )
        .unwrap();

        let invocations = Arc::new(AtomicU32::new(0));
        let (done_tx, done_rx) = async_channel::unbounded::<()>();
        let jobs: Vec<Job> = (0..10)
            .map(|_| {
                let attempts = Arc::new(AtomicU32::new(0));
                let invocations = Arc::clone(&invocations);
                let done = done_tx.clone();
                Arc::new(move |_pod: Option<Pod>| {
                    let attempts = Arc::clone(&attempts);
                    let invocations = Arc::clone(&invocations);
                    let done = done.clone();
                    async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        if attempts.fetch_add(1, Ordering::SeqCst) < 3 {
                            anyhow::bail!("whocares");
                        }
                        let _ = done.try_send(());
                        Ok(())
                    }
                    .boxed()
                }) as Job
            })
            .collect();
        group.schedule(jobs);

        for _ in 0..10 {
            tokio::time::timeout(Duration::from_secs(10), done_rx.recv())
                .await
                .expect("job never succeeded")
                .unwrap();
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 40);
        assert!(
            wait_until(|| group.outstanding() == 0, Duration::from_secs(2)).await,
            "outstanding jobs never drained"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_idle_runners_scale_to_zero() {
        let operator = TestOperator::new();
        let group = Group::new(
            CancellationToken::new(),
            "whocares",
            Arc::clone(&operator) as Arc<dyn Operator>,
            GroupOptions {
                idle_timeout: Duration::from_millis(25),
                ..Default::default()
            },
        )
        .unwrap();

        let (done_tx, done_rx) = async_channel::unbounded::<()>();
        let jobs: Vec<Job> = (0..2)
            .map(|_| {
                let done = done_tx.clone();
                Arc::new(move |_pod: Option<Pod>| {
                    let done = done.clone();
                    async move {
                        let _ = done.try_send(());
                        Ok(())
                    }
                    .boxed()
                }) as Job
            })
            .collect();
        group.schedule(jobs);
        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(5), done_rx.recv())
                .await
                .expect("job did not finish")
                .unwrap();
        }

        assert!(
            wait_until(|| group.runners.runners.index() == 0, Duration::from_secs(3)).await,
            "runner index never compacted to zero"
        );
        let spun: HashSet<String> = operator.spun.lock().unwrap().iter().cloned().collect();
        let torn: HashSet<String> = operator.torn.lock().unwrap().iter().cloned().collect();
        assert!(!spun.is_empty());
        assert_eq!(spun, torn, "every spun-up runner must be torn down");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_tears_runners_down() {
        let operator = TestOperator::new();
        let group = Group::new(
            CancellationToken::new(),
            "whocares",
            Arc::clone(&operator) as Arc<dyn Operator>,
            GroupOptions::default(),
        )
        .unwrap();

        let (done_tx, done_rx) = async_channel::unbounded::<()>();
        let done = done_tx.clone();
        group.schedule(vec![Arc::new(move |_pod: Option<Pod>| {
            let done = done.clone();
            async move {
                let _ = done.try_send(());
                Ok(())
            }
            .boxed()
        }) as Job]);
        tokio::time::timeout(Duration::from_secs(5), done_rx.recv())
            .await
            .expect("job did not finish")
            .unwrap();

        group.shutdown();
        assert!(
            wait_until(
                || !operator.torn.lock().unwrap().is_empty(),
                Duration::from_secs(3)
            )
            .await,
            "shutdown never tore the runner down"
        );
    }

    #[test]
    fn test_group_requires_a_name() {
        struct Idle;
        #[async_trait]
        impl Operator for Idle {
            fn spin_up(&self, _name: &str) {}
            fn tear_down(&self, _name: &str, _soft: bool) {}
            async fn watch(&self, _p: Regex, _a: PodHandler, _u: PodHandler) {}
        }
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let err = Group::new(
            CancellationToken::new(),
            "",
            Arc::new(Idle),
            GroupOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidName(_)));
    }
}

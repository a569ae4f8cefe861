//! Concurrent execution of pipelines.
//!
//! Every branch of every pipeline runs as its own task. A branch opens one
//! session (preferably as an unused tracked user, falling back to any
//! tracked user and finally to the administrative credential) and walks its
//! steps in order; each step is a rotation of `cycles` cycles of
//! `repetitions` invocations separated by random pauses no longer than
//! `period / repetitions`. Actions are synchronous and run on the blocking
//! pool.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::actions::{ActionContext, ActionRef, ActionSet, Outcome};
use crate::api::{Cloud, Connector};
use crate::error::{Result, SpamError};
use crate::keeper::Keeper;
use crate::pipeline::{Pipeline, Rate};
use crate::store::Record;
use crate::types::{Collection, Credential, Namespace, ResourceKind};

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

/// Cooperative stop signal shared by every rotation of a run.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

#[derive(Default)]
struct ShutdownInner {
    triggered: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Resolves once [`Shutdown::trigger`] has been called.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Outcome counts of one or more rotations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub invoked: u64,
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub changed: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl Tally {
    pub fn record(&mut self, outcome: &Outcome) {
        self.invoked += 1;
        match outcome {
            Outcome::Created(_) => self.created += 1,
            Outcome::Updated(_) => self.updated += 1,
            Outcome::Deleted(_) => self.deleted += 1,
            Outcome::Changed(_) => self.changed += 1,
            Outcome::Skipped(_) => self.skipped += 1,
            Outcome::Failed(_) => self.failed += 1,
        }
    }

    pub fn merge(&mut self, other: &Tally) {
        self.invoked += other.invoked;
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.changed += other.changed;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub action: String,
    pub tally: Tally,
}

#[derive(Debug, Clone, Serialize)]
pub struct BranchReport {
    pub pipeline: String,
    pub collection: Collection,
    /// Principal the branch acted as; `None` when no session could be opened.
    pub principal: Option<String>,
    pub steps: Vec<StepReport>,
    /// Stopped early by a shutdown.
    pub interrupted: bool,
    /// Why the branch never started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

impl BranchReport {
    pub fn total(&self) -> Tally {
        let mut total = Tally::default();
        for step in &self.steps {
            total.merge(&step.tally);
        }
        total
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub branches: Vec<BranchReport>,
}

impl RunReport {
    pub fn total(&self) -> Tally {
        let mut total = Tally::default();
        for branch in &self.branches {
            total.merge(&branch.total());
        }
        total
    }
}

// ---------------------------------------------------------------------------
// Rotation
// ---------------------------------------------------------------------------

/// Invoke `action` `rate.cycles * rate.repetitions` times, pausing a random
/// `[0, period / repetitions]` after each call. Returns early, with what was
/// counted so far, once `shutdown` triggers; an `Err` from `action` ends the
/// rotation and is returned as is.
pub async fn rotate<F, Fut>(mut action: F, rate: Rate, shutdown: &Shutdown) -> Result<Tally>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Outcome>>,
{
    let mut tally = Tally::default();
    for _ in 0..rate.cycles {
        for _ in 0..rate.repetitions {
            if shutdown.is_triggered() {
                return Ok(tally);
            }
            let outcome = action().await?;
            tally.record(&outcome);
            if !pause(random_pause(rate.max_pause()), shutdown).await {
                return Ok(tally);
            }
        }
    }
    Ok(tally)
}

/// A uniformly random duration in `[0, max]`.
pub fn random_pause(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    max.mul_f64(rand::thread_rng().gen_range(0.0..=1.0))
}

/// Sleep for `duration` unless `shutdown` fires first; `false` means stop.
async fn pause(duration: Duration, shutdown: &Shutdown) -> bool {
    if duration.is_zero() {
        return !shutdown.is_triggered();
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = shutdown.wait() => false,
    }
}

/// Run `f` on the blocking pool, re-raising its panic on the caller.
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(SpamError::Cancelled(e.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Shared services every branch works with.
#[derive(Clone)]
pub struct Services {
    pub keeper: Arc<Keeper>,
    pub actions: Arc<ActionSet>,
    pub connector: Arc<dyn Connector>,
}

struct Session {
    cloud: Arc<dyn Cloud>,
    /// User claimed for the branch's lifetime.
    claimed: Option<String>,
}

fn open_session(keeper: &Keeper, connector: &dyn Connector) -> Result<Session> {
    let claimed = keeper.pick_unused(ResourceKind::User)?;
    let candidate = match &claimed {
        Some(id) => Some(id.clone()),
        None => keeper.pick_random(ResourceKind::User)?,
    };

    if let Some(user_id) = candidate {
        match user_credential(keeper, &user_id)? {
            Some(credential) => match connector.connect(&credential) {
                Ok(cloud) => return Ok(Session { cloud, claimed }),
                Err(e) => warn!(user = %user_id, error = %e, "login failed, using admin"),
            },
            None => debug!(user = %user_id, "no credential recorded, using admin"),
        }
    }

    if let Some(id) = &claimed {
        keeper.release(ResourceKind::User, id)?;
    }
    let admin = keeper.settings().admin_credential(keeper.store())?;
    let cloud = connector.connect(&admin)?;
    Ok(Session {
        cloud,
        claimed: None,
    })
}

/// The recorded credential of tracked user `user_id`, looked up by name.
fn user_credential(keeper: &Keeper, user_id: &str) -> Result<Option<Credential>> {
    let users = keeper.admin().resource(ResourceKind::User)?;
    let Some(user) = keeper.get_by_id(users.as_ref(), user_id) else {
        return Ok(None);
    };
    match keeper.store().get(&Namespace::credentials(), user.name()) {
        Ok(Record::Credential(credential)) => Ok(Some(credential)),
        Ok(_) | Err(SpamError::NotFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

fn close_session(keeper: &Keeper, session: Session) -> Result<()> {
    let Session { cloud, claimed } = session;
    drop(cloud);
    match claimed {
        Some(id) => match keeper.release(ResourceKind::User, &id) {
            Err(SpamError::NotFound { .. }) => Ok(()),
            other => other,
        },
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatorState {
    Loaded,
    Running,
    Completed,
}

struct BranchJob {
    pipeline: String,
    collection: Collection,
    steps: Vec<(String, ActionRef, Rate)>,
}

pub struct Simulator {
    jobs: Vec<BranchJob>,
    services: Services,
    shutdown: Shutdown,
    state: SimulatorState,
}

impl Simulator {
    /// Resolve every step of `pipelines` up front; an unknown action fails
    /// here rather than mid-run.
    pub fn new(pipelines: Vec<Pipeline>, services: Services) -> Result<Self> {
        let mut jobs = Vec::new();
        for pipeline in &pipelines {
            let resolved = pipeline.resolve(&services.actions)?;
            for (branch, refs) in pipeline.branches.iter().zip(resolved) {
                jobs.push(BranchJob {
                    pipeline: pipeline.name.clone(),
                    collection: branch.collection,
                    steps: branch
                        .steps
                        .iter()
                        .zip(refs)
                        .map(|(step, action)| (step.label(), action, step.rate))
                        .collect(),
                });
            }
        }
        Ok(Self {
            jobs,
            services,
            shutdown: Shutdown::new(),
            state: SimulatorState::Loaded,
        })
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn state(&self) -> SimulatorState {
        self.state
    }

    /// Run all branches concurrently until they finish or the shutdown
    /// fires. A non-recoverable error in one branch stops the others and is
    /// returned once they have wound down.
    pub async fn run(&mut self) -> Result<RunReport> {
        if self.state != SimulatorState::Loaded {
            return Err(SpamError::InvalidPipeline(
                "simulator has already been run".into(),
            ));
        }
        self.state = SimulatorState::Running;
        info!(branches = self.jobs.len(), "simulation started");

        let mut set = JoinSet::new();
        for (index, job) in std::mem::take(&mut self.jobs).into_iter().enumerate() {
            let services = self.services.clone();
            let shutdown = self.shutdown.clone();
            set.spawn(async move { (index, run_branch(services, job, shutdown).await) });
        }

        let mut branches = Vec::new();
        let mut fatal = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, Ok(report))) => branches.push((index, report)),
                Ok((_, Err(e))) => {
                    error!(error = %e, "branch failed, stopping simulation");
                    self.shutdown.trigger();
                    fatal.get_or_insert(e);
                }
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => warn!(error = %e, "branch task cancelled"),
            }
        }
        self.state = SimulatorState::Completed;

        if let Some(e) = fatal {
            return Err(e);
        }
        branches.sort_by_key(|(index, _)| *index);
        let report = RunReport {
            branches: branches.into_iter().map(|(_, report)| report).collect(),
        };
        let total = report.total();
        info!(
            invoked = total.invoked,
            failed = total.failed,
            skipped = total.skipped,
            "simulation finished"
        );
        Ok(report)
    }
}

async fn run_branch(services: Services, job: BranchJob, shutdown: Shutdown) -> Result<BranchReport> {
    let mut report = BranchReport {
        pipeline: job.pipeline.clone(),
        collection: job.collection,
        principal: None,
        steps: Vec::new(),
        interrupted: false,
        aborted: None,
    };

    let opened = {
        let services = services.clone();
        blocking(move || open_session(&services.keeper, services.connector.as_ref())).await
    };
    let session = match opened {
        Ok(session) => session,
        Err(e) if e.is_recoverable() => {
            warn!(pipeline = %job.pipeline, collection = %job.collection, error = %e, "no session, branch skipped");
            report.aborted = Some(e.to_string());
            return Ok(report);
        }
        Err(e) => return Err(e),
    };
    report.principal = Some(session.cloud.principal().to_string());
    info!(
        pipeline = %job.pipeline,
        collection = %job.collection,
        principal = session.cloud.principal(),
        "branch started"
    );

    let walked = walk_steps(&services, &session, &job, &shutdown, &mut report).await;

    let keeper = services.keeper.clone();
    let closed = blocking(move || close_session(&keeper, session)).await;
    walked?;
    closed?;
    Ok(report)
}

async fn walk_steps(
    services: &Services,
    session: &Session,
    job: &BranchJob,
    shutdown: &Shutdown,
    report: &mut BranchReport,
) -> Result<()> {
    for (label, action, rate) in &job.steps {
        let action = *action;
        let tally = rotate(
            || {
                let services = services.clone();
                let cloud = session.cloud.clone();
                blocking(move || {
                    let ctx = ActionContext::new(&services.keeper, cloud.as_ref());
                    services.actions.invoke(action, &ctx)
                })
            },
            *rate,
            shutdown,
        )
        .await?;
        info!(
            pipeline = %job.pipeline,
            step = %label,
            invoked = tally.invoked,
            failed = tally.failed,
            "rotation finished"
        );
        report.steps.push(StepReport {
            action: label.clone(),
            tally,
        });
        if shutdown.is_triggered() {
            report.interrupted = true;
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionSpec, Effect};
    use crate::pipeline::PipelineFile;
    use crate::testing::Fixture;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn services(fx: &Fixture, actions: ActionSet) -> Services {
        Services {
            keeper: fx.keeper.clone(),
            actions: Arc::new(actions),
            connector: Arc::new(fx.cloud.clone()),
        }
    }

    fn pipelines(text: &str) -> Vec<Pipeline> {
        PipelineFile::parse(text).unwrap().pipelines
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_invokes_every_repetition_within_its_period() {
        let calls = Mutex::new(Vec::new());
        let start = Instant::now();
        let tally = rotate(
            || {
                calls.lock().unwrap().push(Instant::now());
                async { Ok(Outcome::Changed("x".into())) }
            },
            Rate::new(10.0, 5, 2).unwrap(),
            &Shutdown::new(),
        )
        .await
        .unwrap();

        assert_eq!(tally.invoked, 10);
        assert_eq!(tally.changed, 10);
        let calls = calls.into_inner().unwrap();
        assert_eq!(calls.len(), 10);
        for pair in calls.windows(2) {
            assert!(pair[1] - pair[0] <= Duration::from_secs(2));
        }
        assert!(calls[5] - calls[0] <= Duration::from_secs(10));
        assert!(start.elapsed() <= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_stops_when_shutdown_fires() {
        let shutdown = Shutdown::new();
        let count = AtomicUsize::new(0);
        let tally = rotate(
            || {
                if count.fetch_add(1, Ordering::SeqCst) == 2 {
                    shutdown.trigger();
                }
                async { Ok(Outcome::Skipped("nothing".into())) }
            },
            Rate::new(100.0, 10, 1).unwrap(),
            &shutdown,
        )
        .await
        .unwrap();
        assert_eq!(tally.invoked, 3);
        assert_eq!(tally.skipped, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_a_pause() {
        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.trigger();
        });
        let start = Instant::now();
        assert!(!pause(Duration::from_secs(3600), &shutdown).await);
        assert!(start.elapsed() < Duration::from_secs(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_returns_the_first_error() {
        let count = AtomicUsize::new(0);
        let result = rotate(
            || {
                let n = count.fetch_add(1, Ordering::SeqCst);
                async move {
                    match n {
                        0 => Ok(Outcome::Changed("x".into())),
                        _ => Err(SpamError::storage("disk full")),
                    }
                }
            },
            Rate::new(1.0, 3, 3).unwrap(),
            &Shutdown::new(),
        )
        .await;
        assert!(matches!(result, Err(SpamError::Storage(_))));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn random_pause_stays_in_bounds() {
        let max = Duration::from_millis(250);
        for _ in 0..100 {
            assert!(random_pause(max) <= max);
        }
        assert_eq!(random_pause(Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn dependent_step_skips_until_its_dependency_exists() {
        let fx = Fixture::new();
        let mut sim = Simulator::new(
            pipelines(
                "storage:\n  volumes:\n    create: [60, 3, 2]\n    attach: [1, 2, 1]\nidentity:\n  projects:\n    create: [10, 2, 1]\n",
            ),
            services(&fx, ActionSet::default()),
        )
        .unwrap();
        assert_eq!(sim.state(), SimulatorState::Loaded);

        let report = sim.run().await.unwrap();
        assert_eq!(sim.state(), SimulatorState::Completed);
        assert_eq!(report.branches.len(), 2);

        let storage = &report.branches[0];
        assert_eq!(storage.collection, Collection::Storage);
        assert_eq!(storage.principal.as_deref(), Some("admin"));
        assert_eq!(storage.steps[0].action, "volumes/create");
        assert_eq!(storage.steps[0].tally.created, 6);
        assert_eq!(storage.steps[1].tally.skipped, 2);
        assert!(!storage.interrupted);

        assert_eq!(report.branches[1].steps[0].tally.created, 2);
        assert_eq!(report.total().invoked, 10);
        assert_eq!(fx.store.len(&ResourceKind::Volume.namespace()).unwrap(), 6);
        // every volume is released after the skipped attaches
        for (_, record) in fx.store.entries(&ResourceKind::Volume.namespace()).unwrap() {
            assert_eq!(record.used(), Some(false));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn claimed_user_is_released_after_the_run() {
        let fx = Fixture::new();
        let mut sim = Simulator::new(
            pipelines("image:\n  images:\n    create: [1, 1, 1]\n"),
            services(&fx, ActionSet::default()),
        )
        .unwrap();
        let report = sim.run().await.unwrap();
        assert_eq!(report.branches[0].principal.as_deref(), Some("admin"));
        for (_, record) in fx.store.entries(&ResourceKind::User.namespace()).unwrap() {
            assert_eq!(record.used(), Some(false));
        }
        assert!(sim.run().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_action_fails_before_running() {
        let fx = Fixture::new();
        let result = Simulator::new(
            pipelines("storage:\n  volumes:\n    explode: [1, 1, 1]\n"),
            services(&fx, ActionSet::default()),
        );
        assert!(matches!(result, Err(SpamError::UnknownAction(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_stops_the_run() {
        let fx = Fixture::new();
        let actions = ActionSet::new(vec![ActionSpec {
            kind: ResourceKind::Volume,
            verb: "corrupt",
            handler: |_| Err(SpamError::storage("disk full")),
            effect: Effect::None,
        }]);
        let mut sim = Simulator::new(
            pipelines("storage:\n  volumes:\n    corrupt: [1, 5, 5]\n"),
            services(&fx, actions),
        )
        .unwrap();
        let shutdown = sim.shutdown_handle();
        assert!(matches!(sim.run().await, Err(SpamError::Storage(_))));
        assert!(shutdown.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    #[should_panic(expected = "handler exploded")]
    async fn handler_panic_reaches_the_caller() {
        let fx = Fixture::new();
        let actions = ActionSet::new(vec![ActionSpec {
            kind: ResourceKind::Volume,
            verb: "explode",
            handler: |_| panic!("handler exploded"),
            effect: Effect::None,
        }]);
        let mut sim = Simulator::new(
            pipelines("storage:\n  volumes:\n    explode: [1, 1, 1]\n"),
            services(&fx, actions),
        )
        .unwrap();
        let _ = sim.run().await;
    }

    #[tokio::test(start_paused = true)]
    async fn triggered_shutdown_marks_branches_interrupted() {
        let fx = Fixture::new();
        let mut sim = Simulator::new(
            pipelines("storage:\n  volumes:\n    create: [3600, 100, 100]\n"),
            services(&fx, ActionSet::default()),
        )
        .unwrap();
        let shutdown = sim.shutdown_handle();
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(120)).await;
            shutdown.trigger();
        });
        let report = sim.run().await.unwrap();
        stopper.await.unwrap();
        assert!(report.branches[0].interrupted);
        assert!(report.branches[0].steps[0].tally.invoked < 10_000);
    }
}

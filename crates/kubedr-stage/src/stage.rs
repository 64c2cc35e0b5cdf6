//! Stage: validate, setup, execute and clean up a list of actions
//!
//! Phases run in order and stop at the first failure. Setup lets every
//! action add what it needs to a single [`WorkerOptions`]; execute then
//! provisions exactly one worker and hands its client to each action in
//! turn. Cleanup runs last, on every path, for each action that has one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use kubedr_common::cleanup::fold_error;
use kubedr_common::{Cleanup, CleanupStack, Error, Phase, Result, Scope, DEFAULT_CLEANUP_TIMEOUT};
use kubedr_resources::worker::{WorkerClient, WorkerOptions, WorkerProvisioner};

/// Action name reported when provisioning or tearing down the worker fails
pub const WORKER_ACTION: &str = "worker";

/// One step of a recipe
#[async_trait]
pub trait Action: Send + Sync {
    /// Check configuration and preconditions; must not create anything
    async fn validate(&self, scope: &Scope) -> Result<()>;

    /// Create prerequisites and add volumes and settings to the worker
    async fn setup(&mut self, scope: &Scope, worker: &mut WorkerOptions) -> Result<()>;

    /// Do the work through the shared worker client
    async fn execute(&mut self, scope: &Scope, client: Arc<dyn WorkerClient>) -> Result<()>;

    /// The action's cleanup, if it creates anything during setup
    fn as_cleanup(&mut self) -> Option<&mut dyn CleanupAction> {
        None
    }
}

/// Deletes what an action created. Must be safe to call whatever state
/// setup reached, and more than once.
#[async_trait]
pub trait CleanupAction: Send + Sync {
    /// Delete everything the action created
    async fn cleanup(&mut self, scope: &Scope) -> Result<()>;
}

struct NamedAction {
    name: String,
    action: Box<dyn Action>,
}

/// Settings shared by every action of a stage
#[derive(Clone, Debug)]
pub struct StageOptions {
    /// Starting point of the worker every action adds to
    pub worker: WorkerOptions,
    /// DNS suffixes tried when discovering the worker, after the worker's own
    pub search_domains: Vec<String>,
    /// Deadline for each cleanup, independent of the run's scope
    pub cleanup_timeout: Duration,
}

impl StageOptions {
    /// Options seeded from a base worker description
    pub fn new(worker: WorkerOptions) -> Self {
        Self {
            worker,
            search_domains: Vec::new(),
            cleanup_timeout: DEFAULT_CLEANUP_TIMEOUT,
        }
    }

    fn seed_worker(&self) -> WorkerOptions {
        let mut worker = self.worker.clone();
        for domain in &self.search_domains {
            if !worker.search_domains.contains(domain) {
                worker.search_domains.push(domain.clone());
            }
        }
        worker
    }
}

/// An ordered list of actions sharing one worker
pub struct Stage {
    provisioner: Arc<dyn WorkerProvisioner>,
    options: StageOptions,
    actions: Vec<NamedAction>,
}

impl Stage {
    /// Empty stage
    pub fn new(provisioner: Arc<dyn WorkerProvisioner>, options: StageOptions) -> Self {
        Self {
            provisioner,
            options,
            actions: Vec::new(),
        }
    }

    /// Append an action; names appear in errors and logs
    pub fn with_action(mut self, name: impl Into<String>, action: impl Action + 'static) -> Self {
        self.actions.push(NamedAction {
            name: name.into(),
            action: Box::new(action),
        });
        self
    }

    /// Number of actions
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether the stage has no actions
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run every phase, then clean up.
    ///
    /// The returned error names the phase and action that failed, aggregated
    /// with any cleanup failures.
    #[instrument(skip_all, fields(actions = self.actions.len()))]
    pub async fn run(mut self, scope: &Scope) -> Result<()> {
        let mut result = self.run_phases(scope).await;
        self.cleanup(scope, &mut result).await;
        match &result {
            Ok(()) => info!("stage completed"),
            Err(e) => warn!(error = %e, "stage failed"),
        }
        result
    }

    async fn run_phases(&mut self, scope: &Scope) -> Result<()> {
        info!(phase = %Phase::Validate, "stage phase started");
        for named in &self.actions {
            named
                .action
                .validate(scope)
                .await
                .map_err(|e| Error::phase(Phase::Validate, &named.name, e))?;
        }

        info!(phase = %Phase::Setup, "stage phase started");
        let mut worker = self.options.seed_worker();
        for named in &mut self.actions {
            named
                .action
                .setup(scope, &mut worker)
                .await
                .map_err(|e| Error::phase(Phase::Setup, &named.name, e))?;
        }

        info!(phase = %Phase::Execute, volumes = worker.volumes.len(), "stage phase started");
        self.execute(scope, &worker).await
    }

    async fn execute(&mut self, scope: &Scope, worker: &WorkerOptions) -> Result<()> {
        let mut handle = self
            .provisioner
            .provision(scope, worker)
            .await
            .map_err(|e| Error::phase(Phase::Execute, WORKER_ACTION, e))?;
        info!(worker = %handle.name(), "worker provisioned");

        let mut result = match handle.client() {
            Some(client) => self.execute_actions(scope, client).await,
            None => Err(Error::phase(
                Phase::Execute,
                WORKER_ACTION,
                Error::internal("provisioned worker has no client"),
            )),
        };

        let timeout = self.options.cleanup_timeout;
        let target = handle.as_mut();
        let closed = Cleanup::new(move || async move { target.close_client().await })
            .context("close worker client")
            .timeout(timeout)
            .run(scope)
            .await;
        if let Err(e) = closed {
            fold_error(&mut result, Error::phase(Phase::Cleanup, WORKER_ACTION, e));
        }

        let target = handle.as_mut();
        let deleted = Cleanup::with_scope(move |s| async move { target.delete(&s).await })
            .context("delete worker")
            .timeout(timeout)
            .run(scope)
            .await;
        if let Err(e) = deleted {
            fold_error(&mut result, Error::phase(Phase::Cleanup, WORKER_ACTION, e));
        }
        result
    }

    async fn execute_actions(&mut self, scope: &Scope, client: Arc<dyn WorkerClient>) -> Result<()> {
        for named in &mut self.actions {
            info!(action = %named.name, "executing action");
            named
                .action
                .execute(scope, client.clone())
                .await
                .map_err(|e| Error::phase(Phase::Execute, &named.name, e))?;
        }
        Ok(())
    }

    /// Clean up cleanup-capable actions in reverse order, attempting all
    async fn cleanup(&mut self, scope: &Scope, result: &mut Result<()>) {
        let timeout = self.options.cleanup_timeout;
        let mut stack = CleanupStack::new();
        for named in &mut self.actions {
            let name = named.name.clone();
            let Some(target) = named.action.as_cleanup() else {
                continue;
            };
            stack.push(
                Cleanup::with_scope(move |s| async move { target.cleanup(&s).await })
                    .timeout(timeout)
                    .map_err(move |e| Error::phase(Phase::Cleanup, name, e)),
            );
        }
        if !stack.is_empty() {
            info!(phase = %Phase::Cleanup, actions = stack.len(), "stage phase started");
        }
        stack.unwind(scope, result).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use kubedr_proto::{
        DumpPostgresRequest, RestorePostgresRequest, SyncFilesRequest, SyncObjectStorageRequest,
    };
    use kubedr_resources::worker::{WorkerHandle, WorkerVolume};

    use super::*;

    type Log = Arc<Mutex<Vec<String>>>;

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[derive(Default)]
    struct FakeClient {
        closes: AtomicUsize,
    }

    #[async_trait]
    impl WorkerClient for FakeClient {
        async fn dump_postgres(&self, _: DumpPostgresRequest) -> Result<()> {
            Ok(())
        }
        async fn restore_postgres(&self, _: RestorePostgresRequest) -> Result<()> {
            Ok(())
        }
        async fn sync_object_storage(&self, _: SyncObjectStorageRequest) -> Result<()> {
            Ok(())
        }
        async fn sync_files(&self, _: SyncFilesRequest) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeHandle {
        client: Option<Arc<dyn WorkerClient>>,
        log: Log,
    }

    #[async_trait]
    impl WorkerHandle for FakeHandle {
        fn name(&self) -> &str {
            "kubedr-worker-test1"
        }
        fn client(&self) -> Option<Arc<dyn WorkerClient>> {
            self.client.clone()
        }
        async fn close_client(&mut self) -> Result<()> {
            if let Some(client) = self.client.take() {
                client.close().await?;
            }
            self.log.lock().unwrap().push("worker:close".to_string());
            Ok(())
        }
        async fn delete(&mut self, _: &Scope) -> Result<()> {
            self.log.lock().unwrap().push("worker:delete".to_string());
            Ok(())
        }
    }

    struct FakeProvisioner {
        client: Arc<FakeClient>,
        provisioned: Mutex<Vec<WorkerOptions>>,
        fail: bool,
        log: Log,
    }

    impl FakeProvisioner {
        fn new(log: Log) -> Self {
            Self {
                client: Arc::new(FakeClient::default()),
                provisioned: Mutex::new(Vec::new()),
                fail: false,
                log,
            }
        }
    }

    #[async_trait]
    impl WorkerProvisioner for FakeProvisioner {
        async fn provision(
            &self,
            _: &Scope,
            options: &WorkerOptions,
        ) -> Result<Box<dyn WorkerHandle>> {
            self.provisioned.lock().unwrap().push(options.clone());
            if self.fail {
                return Err(Error::timeout("Pod/kubedr-worker-test1", "deadline exceeded"));
            }
            Ok(Box::new(FakeHandle {
                client: Some(self.client.clone() as Arc<dyn WorkerClient>),
                log: self.log.clone(),
            }))
        }
    }

    /// Records every call; fails in the configured phase
    struct FakeAction {
        name: &'static str,
        log: Log,
        fail_in: Option<Phase>,
        cleanable: bool,
        volume: Option<WorkerVolume>,
        clients: Arc<Mutex<Vec<Arc<dyn WorkerClient>>>>,
    }

    impl FakeAction {
        fn new(name: &'static str, log: &Log) -> Self {
            Self {
                name,
                log: log.clone(),
                fail_in: None,
                cleanable: false,
                volume: None,
                clients: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn failing_in(mut self, phase: Phase) -> Self {
            self.fail_in = Some(phase);
            self
        }

        fn cleanable(mut self) -> Self {
            self.cleanable = true;
            self
        }

        fn record(&self, phase: Phase) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, phase));
            if self.fail_in == Some(phase) {
                return Err(Error::internal(format!("{} broke", self.name)));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Action for FakeAction {
        async fn validate(&self, _: &Scope) -> Result<()> {
            self.record(Phase::Validate)
        }

        async fn setup(&mut self, _: &Scope, worker: &mut WorkerOptions) -> Result<()> {
            self.record(Phase::Setup)?;
            if let Some(volume) = self.volume.clone() {
                worker.add_volume(volume)?;
            }
            Ok(())
        }

        async fn execute(&mut self, _: &Scope, client: Arc<dyn WorkerClient>) -> Result<()> {
            self.clients.lock().unwrap().push(client);
            self.record(Phase::Execute)
        }

        fn as_cleanup(&mut self) -> Option<&mut dyn CleanupAction> {
            if self.cleanable {
                Some(self)
            } else {
                None
            }
        }
    }

    #[async_trait]
    impl CleanupAction for FakeAction {
        async fn cleanup(&mut self, _: &Scope) -> Result<()> {
            self.record(Phase::Cleanup)
        }
    }

    fn options() -> StageOptions {
        StageOptions::new(WorkerOptions::new("dr", "kubedr/worker:1"))
    }

    // ==========================================================================
    // Story: Phases stop at the first failure, cleanup always runs
    // ==========================================================================

    #[tokio::test]
    async fn story_validate_failure_stops_before_any_setup() {
        let log = Log::default();
        let provisioner = Arc::new(FakeProvisioner::new(log.clone()));
        let stage = Stage::new(provisioner.clone(), options())
            .with_action("a", FakeAction::new("a", &log).cleanable())
            .with_action("b", FakeAction::new("b", &log).failing_in(Phase::Validate))
            .with_action("c", FakeAction::new("c", &log).cleanable());

        let err = stage.run(&Scope::background()).await.unwrap_err();

        assert_eq!(err.failed_phase(), Some((Phase::Validate, "b")));
        assert_eq!(
            entries(&log),
            vec!["a:validate", "b:validate", "c:cleanup", "a:cleanup"]
        );
        assert!(provisioner.provisioned.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn setup_failure_skips_execution() {
        let log = Log::default();
        let provisioner = Arc::new(FakeProvisioner::new(log.clone()));
        let stage = Stage::new(provisioner.clone(), options())
            .with_action("a", FakeAction::new("a", &log).cleanable())
            .with_action("b", FakeAction::new("b", &log).failing_in(Phase::Setup));

        let err = stage.run(&Scope::background()).await.unwrap_err();

        assert_eq!(err.failed_phase(), Some((Phase::Setup, "b")));
        assert_eq!(
            entries(&log),
            vec!["a:validate", "b:validate", "a:setup", "b:setup", "a:cleanup"]
        );
        assert!(provisioner.provisioned.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn execute_failure_still_tears_down_the_worker() {
        let log = Log::default();
        let provisioner = Arc::new(FakeProvisioner::new(log.clone()));
        let stage = Stage::new(provisioner.clone(), options())
            .with_action("a", FakeAction::new("a", &log).failing_in(Phase::Execute))
            .with_action("b", FakeAction::new("b", &log).cleanable());

        let err = stage.run(&Scope::background()).await.unwrap_err();

        assert_eq!(err.failed_phase(), Some((Phase::Execute, "a")));
        let log = entries(&log);
        assert!(!log.contains(&"b:execute".to_string()));
        assert_eq!(
            &log[log.len() - 3..],
            ["worker:close", "worker:delete", "b:cleanup"]
        );
        assert_eq!(provisioner.client.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn worker_provisioning_failure_is_reported_as_the_worker_action() {
        let log = Log::default();
        let mut provisioner = FakeProvisioner::new(log.clone());
        provisioner.fail = true;
        let stage = Stage::new(Arc::new(provisioner), options())
            .with_action("a", FakeAction::new("a", &log).cleanable());

        let err = stage.run(&Scope::background()).await.unwrap_err();

        assert_eq!(err.failed_phase(), Some((Phase::Execute, WORKER_ACTION)));
        assert!(err.is_timeout());
        assert_eq!(entries(&log).last().unwrap(), "a:cleanup");
    }

    #[tokio::test]
    async fn cleanup_failures_are_aggregated_with_the_phase_error() {
        let log = Log::default();
        let stage = Stage::new(Arc::new(FakeProvisioner::new(log.clone())), options())
            .with_action(
                "a",
                FakeAction::new("a", &log)
                    .cleanable()
                    .failing_in(Phase::Cleanup),
            )
            .with_action("b", FakeAction::new("b", &log).failing_in(Phase::Validate));

        let err = stage.run(&Scope::background()).await.unwrap_err();

        let errors = err.errors();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].failed_phase(), Some((Phase::Validate, "b")));
        assert_eq!(errors[1].failed_phase(), Some((Phase::Cleanup, "a")));
    }

    #[tokio::test]
    async fn cancelled_scope_still_runs_cleanup() {
        let log = Log::default();
        let stage = Stage::new(Arc::new(FakeProvisioner::new(log.clone())), options())
            .with_action("a", FakeAction::new("a", &log).cleanable());
        let scope = Scope::background();
        scope.cancel();

        let _ = stage.run(&scope).await;
        assert!(entries(&log).contains(&"a:cleanup".to_string()));
    }

    #[tokio::test]
    async fn stage_search_domains_reach_the_worker() {
        let log = Log::default();
        let provisioner = Arc::new(FakeProvisioner::new(log.clone()));
        let mut options = options();
        options.worker.search_domains = vec!["corp.internal".to_string()];
        options.search_domains = vec!["example.com".to_string(), "corp.internal".to_string()];

        Stage::new(provisioner.clone(), options)
            .with_action("a", FakeAction::new("a", &log))
            .run(&Scope::background())
            .await
            .unwrap();

        let provisioned = provisioner.provisioned.lock().unwrap();
        assert_eq!(
            provisioned[0].search_domains,
            vec!["corp.internal", "example.com"]
        );
    }

    // ==========================================================================
    // Story: One worker shared by every action
    // ==========================================================================

    #[tokio::test]
    async fn story_actions_share_one_worker_with_all_volumes() {
        let log = Log::default();
        let provisioner = Arc::new(FakeProvisioner::new(log.clone()));

        let mut backup = FakeAction::new("backup", &log);
        backup.volume = Some(WorkerVolume::pvc("dr", "dr-claim", "/dr"));
        let backup_clients = backup.clients.clone();
        let mut upload = FakeAction::new("upload", &log);
        upload.volume = Some(WorkerVolume::secret("creds", "s3-creds", "/credentials"));
        let upload_clients = upload.clients.clone();

        Stage::new(provisioner.clone(), options())
            .with_action("backup", backup)
            .with_action("upload", upload)
            .run(&Scope::background())
            .await
            .unwrap();

        let provisioned = provisioner.provisioned.lock().unwrap();
        assert_eq!(provisioned.len(), 1);
        let names: Vec<_> = provisioned[0].volumes.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["dr", "creds"]);

        let first = backup_clients.lock().unwrap()[0].clone();
        let second = upload_clients.lock().unwrap()[0].clone();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(
            entries(&log),
            vec![
                "backup:validate",
                "upload:validate",
                "backup:setup",
                "upload:setup",
                "backup:execute",
                "upload:execute",
                "worker:close",
                "worker:delete",
            ]
        );
    }
}

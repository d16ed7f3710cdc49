pub mod context;
pub mod steps;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::nginx;
use crate::pm2;
use crate::process::LogSink;
use crate::release;
use crate::secrets::{self, SecretsCodec};
use crate::store::deployment::{
    DeployStatus, DeploymentRecord, DeploymentStore, Step, StepRecord, StepStatus,
};
use crate::store::project::{ProjectRecord, ProjectStore, Runtime, Target};
use crate::store::template::TemplateStore;
use crate::validate;

use context::ProjectPaths;
use steps::{StepCtx, StepOutcome};

/// Commands the pipeline will actually run. Template-bound projects take
/// all four from their template; the record's own fields are ignored.
#[derive(Debug, Clone, Default)]
pub struct ResolvedCommands {
    pub install: Option<String>,
    pub test: Option<String>,
    pub build: Option<String>,
    pub start: Option<String>,
}

#[derive(Debug, Clone)]
struct Job {
    deployment_id: Uuid,
    project_id: String,
    dry_run: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Job>,
    active: usize,
}

/// The deployment pipeline engine: bounded FIFO admission, a worker pool
/// capped at `MAX_CONCURRENT_DEPLOYS`, and one-step rollback.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: Config,
    codec: SecretsCodec,
    projects: ProjectStore,
    deployments: DeploymentStore,
    templates: TemplateStore,
    queue: Mutex<QueueState>,
    // One promotion lock per project; created lazily, never removed.
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Engine {
    pub fn new(cfg: Config) -> Self {
        let codec = SecretsCodec::new(cfg.secrets_master_key.as_deref());
        let projects = ProjectStore::new(cfg.projects_dir.clone(), codec.clone());
        let deployments = DeploymentStore::new(cfg.projects_dir.clone());
        let templates = TemplateStore::new(&cfg.projects_dir);
        Self {
            inner: Arc::new(Inner {
                cfg,
                codec,
                projects,
                deployments,
                templates,
                queue: Mutex::new(QueueState::default()),
                locks: StdMutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.cfg
    }

    pub fn codec(&self) -> &SecretsCodec {
        &self.inner.codec
    }

    pub fn projects(&self) -> &ProjectStore {
        &self.inner.projects
    }

    pub fn deployments(&self) -> &DeploymentStore {
        &self.inner.deployments
    }

    pub fn templates(&self) -> &TemplateStore {
        &self.inner.templates
    }

    pub fn resolve_commands(&self, project: &ProjectRecord) -> Result<ResolvedCommands> {
        if project.is_template_bound() {
            let template_id = project.template_id.as_deref().ok_or_else(|| {
                Error::ConfigIncomplete(format!(
                    "project '{}' must reference a command template",
                    project.id
                ))
            })?;
            let template = self.inner.templates.get(template_id)?;
            Ok(ResolvedCommands {
                install: template.install_command,
                test: template.test_command,
                build: template.build_command,
                start: template.start_command,
            })
        } else {
            Ok(ResolvedCommands {
                install: project.install_command.clone(),
                test: project.test_command.clone(),
                build: project.build_command.clone(),
                start: project.start_command.clone(),
            })
        }
    }

    /// Admit a deployment. The queued record is persisted before the job
    /// becomes visible to workers; when admission fails nothing is written.
    pub async fn enqueue(&self, project_id: &str, dry_run: bool) -> Result<DeploymentRecord> {
        let project = self.inner.projects.load(project_id)?;

        validate::repo_url(&project.repo)?;
        validate::branch(&project.branch)?;
        let commands = self.resolve_commands(&project)?;
        if commands.build.is_none() {
            return Err(Error::ConfigIncomplete(format!(
                "project '{project_id}' has no build command"
            )));
        }
        if project.runtime == Runtime::Node && commands.start.is_none() {
            return Err(Error::ConfigIncomplete(format!(
                "project '{project_id}' is a node runtime without a startCommand"
            )));
        }
        validate::deploy_path(&project.deploy_path, &self.inner.cfg.nginx_root)?;

        let record = {
            let mut queue = self.inner.queue.lock().await;
            if queue.active + queue.pending.len() >= self.inner.cfg.max_queue_size {
                return Err(Error::QueueFull);
            }
            let record =
                DeploymentRecord::new(project_id, dry_run, &self.inner.cfg.logs_dir.join(project_id));
            self.inner.deployments.create(&record).await?;
            queue.pending.push_back(Job {
                deployment_id: record.id,
                project_id: project_id.to_string(),
                dry_run,
            });
            record
        };

        info!(project = %project_id, deployment = %record.id, dry_run, "deployment queued");
        self.dispatch();
        Ok(record)
    }

    /// Hand pending jobs to workers, up to the concurrency bound. Safe to
    /// call from any context; the actual hand-off happens on the runtime.
    fn dispatch(&self) {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                let job = {
                    let mut queue = engine.inner.queue.lock().await;
                    if queue.active >= engine.inner.cfg.max_concurrent_deploys {
                        break;
                    }
                    match queue.pending.pop_front() {
                        Some(job) => {
                            queue.active += 1;
                            job
                        }
                        None => break,
                    }
                };
                let worker = engine.clone();
                tokio::spawn(async move { worker.run_job(job).await });
            }
        });
    }

    async fn run_job(&self, job: Job) {
        if let Err(err) = self.run_pipeline(&job).await {
            self.finish_failed(&job, &err).await;
        }
        {
            let mut queue = self.inner.queue.lock().await;
            queue.active = queue.active.saturating_sub(1);
        }
        self.dispatch();
    }

    async fn run_pipeline(&self, job: &Job) -> Result<()> {
        let mut record = self.inner.deployments.get(job.deployment_id).await?;
        record.status = DeployStatus::Running;
        record.started_at = Some(Utc::now());
        self.inner.deployments.save(&record).await?;

        let mut project = self.inner.projects.load(&job.project_id)?;
        let paths = ProjectPaths::new(&self.inner.cfg, &job.project_id);
        let sink = LogSink::open(&record.log_path).await?;
        sink.line(&format!(
            "deploying {} from {} ({}){}",
            project.id,
            project.repo,
            project.branch,
            if job.dry_run { " [dry-run]" } else { "" }
        ))
        .await?;

        let commands = self.resolve_commands(&project)?;
        let env = secrets::env::build(&project.env.0, &self.inner.codec)?;

        let mut fresh_port = false;
        if project.runtime == Runtime::Node && project.runtime_port.is_none() {
            project.runtime_port = Some(self.assign_runtime_port(&project.id)?);
            fresh_port = true;
        }

        let ctx = StepCtx {
            cfg: &self.inner.cfg,
            paths: &paths,
            project: &project,
            commands: &commands,
            env: &env,
            sink: &sink,
            dry_run: job.dry_run,
        };

        let commit = self
            .run_step(&mut record, Step::Sync, &sink, steps::sync(&ctx))
            .await?;
        if let Some(sha) = &commit {
            record.commit = Some(sha.clone());
            self.inner.deployments.save(&record).await?;
        }

        self.run_skippable(&mut record, Step::Install, &sink, steps::install(&ctx))
            .await?;
        self.run_skippable(&mut record, Step::Test, &sink, steps::test(&ctx))
            .await?;
        self.run_step(&mut record, Step::Build, &sink, steps::build(&ctx))
            .await?;

        let promotion = self.project_lock(&job.project_id);
        let release_dir = self
            .run_step(
                &mut record,
                Step::Release,
                &sink,
                steps::release(&ctx, commit.as_deref(), &promotion),
            )
            .await?;

        self.run_skippable(&mut record, Step::Nginx, &sink, steps::nginx(&ctx))
            .await?;
        self.run_skippable(
            &mut record,
            Step::Runtime,
            &sink,
            steps::runtime(&ctx, release_dir.as_deref()),
        )
        .await?;

        record.status = DeployStatus::Success;
        record.finished_at = Some(Utc::now());
        self.inner.deployments.save(&record).await?;

        if !job.dry_run {
            // Re-read in case the record changed while the pipeline ran.
            let mut stored = self.inner.projects.load(&job.project_id)?;
            stored.last_deploy = record.finished_at;
            stored.last_commit = record.commit.clone();
            if fresh_port {
                stored.runtime_port = project.runtime_port;
            }
            self.inner.projects.save(&stored)?;
        }

        sink.line("deploy finished successfully").await?;
        info!(project = %job.project_id, deployment = %job.deployment_id, "deploy succeeded");
        Ok(())
    }

    async fn run_step<T>(
        &self,
        record: &mut DeploymentRecord,
        step: Step,
        sink: &LogSink,
        work: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        let position = Step::ALL.iter().position(|s| *s == step).unwrap_or(0) + 1;
        sink.line(&format!("[{position}/{}] {step}", Step::ALL.len()))
            .await?;

        record.steps.insert(
            step,
            StepRecord {
                status: StepStatus::Running,
                started_at: Some(Utc::now()),
                finished_at: None,
                error: None,
            },
        );
        self.inner.deployments.save(record).await?;

        match work.await {
            Ok(value) => {
                if let Some(state) = record.steps.get_mut(&step) {
                    state.status = StepStatus::Success;
                    state.finished_at = Some(Utc::now());
                }
                self.inner.deployments.save(record).await?;
                Ok(value)
            }
            Err(err) => {
                if let Some(state) = record.steps.get_mut(&step) {
                    state.status = StepStatus::Failed;
                    state.finished_at = Some(Utc::now());
                    state.error = Some(err.to_string());
                }
                if let Err(save_err) = self.inner.deployments.save(record).await {
                    warn!(deployment = %record.id, error = %save_err, "could not record step failure");
                }
                Err(err)
            }
        }
    }

    async fn run_skippable(
        &self,
        record: &mut DeploymentRecord,
        step: Step,
        sink: &LogSink,
        work: impl std::future::Future<Output = Result<StepOutcome>>,
    ) -> Result<()> {
        let outcome = self.run_step(record, step, sink, work).await?;
        if let StepOutcome::Skipped(reason) = outcome {
            if let Some(state) = record.steps.get_mut(&step) {
                state.status = StepStatus::Skipped;
            }
            self.inner.deployments.save(record).await?;
            sink.line(&format!("{step} skipped ({reason})")).await?;
        }
        Ok(())
    }

    async fn finish_failed(&self, job: &Job, err: &Error) {
        error!(project = %job.project_id, deployment = %job.deployment_id, error = %err, "deploy failed");

        match self.inner.deployments.get(job.deployment_id).await {
            Ok(mut record) => {
                if !record.status.is_terminal() {
                    record.status = DeployStatus::Failed;
                    record.error = Some(err.to_string());
                    record.finished_at = Some(Utc::now());
                    if let Err(save_err) = self.inner.deployments.save(&record).await {
                        warn!(deployment = %job.deployment_id, error = %save_err, "could not persist failure");
                    }
                }
                if let Ok(sink) = LogSink::open(&record.log_path).await {
                    let _ = sink.line(&format!("deploy failed: {}", err.chain())).await;
                }
            }
            Err(load_err) => {
                warn!(deployment = %job.deployment_id, error = %load_err, "failed deployment record unavailable");
            }
        }
    }

    /// Point the live symlinks back at the previous release, re-render the
    /// server config and restart the supervised process. No deployment
    /// record is written; the rollback log carries the trace.
    pub async fn rollback(&self, project_id: &str) -> Result<()> {
        let project = self.inner.projects.load(project_id)?;
        let commands = self.resolve_commands(&project)?;
        let paths = ProjectPaths::new(&self.inner.cfg, project_id);
        let sink = LogSink::open(&paths.rollback_log()).await?;

        let lock = self.project_lock(project_id);
        let target = {
            let _guard = lock.lock().await;
            release::rollback_pointers(
                &paths.current_link(),
                &paths.previous_link(),
                &project.deploy_path,
            )?
        };
        sink.line(&format!("rolled back to {}", target.display()))
            .await?;
        info!(project = %project_id, target = %target.display(), "rolled back");

        if project.target != Target::GithubPages {
            nginx::install(&self.inner.cfg, &project, &sink, false).await?;
        }
        if project.runtime == Runtime::Node && commands.start.is_some() {
            pm2::restart(&self.inner.cfg, project_id, &sink, false).await?;
        }
        Ok(())
    }

    fn project_lock(&self, project_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.inner.locks.lock().expect("lock registry poisoned");
        locks
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Deterministic port in [4000, 5000): hash the project id, then probe
    /// past ports already held by other projects.
    fn assign_runtime_port(&self, project_id: &str) -> Result<u16> {
        let used: HashSet<u16> = self
            .inner
            .projects
            .list()?
            .iter()
            .filter(|p| p.id != project_id)
            .filter_map(|p| p.runtime_port)
            .collect();

        let digest = Sha256::digest(project_id.as_bytes());
        let base = u16::from_be_bytes([digest[0], digest[1]]) % 1000;
        for offset in 0..1000 {
            let port = 4000 + ((base + offset) % 1000);
            if !used.contains(&port) {
                return Ok(port);
            }
        }
        Err(Error::ConfigIncomplete(
            "no free runtime port in [4000, 5000)".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::project::{EnvEntry, EnvList, ADMIN_OWNER_ID};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_config(root: &Path) -> Config {
        Config {
            projects_dir: root.join("projects"),
            logs_dir: root.join("logs"),
            build_dir: root.join("build"),
            nginx_root: root.join("www"),
            nginx_sites_available: root.join("nginx/sites-available"),
            nginx_sites_enabled: root.join("nginx/sites-enabled"),
            pm2_bin: "pm2".into(),
            max_concurrent_deploys: 1,
            max_queue_size: 2,
            secrets_master_key: Some("test-master".into()),
            default_build_output: "build".into(),
            releases_dir_name: "releases".into(),
            admin_token: None,
        }
    }

    fn static_project(cfg: &Config, id: &str) -> ProjectRecord {
        ProjectRecord {
            id: id.into(),
            repo: "https://github.com/o/r".into(),
            branch: "main".into(),
            build_command: Some("npm run build".into()),
            install_command: None,
            test_command: None,
            start_command: None,
            build_output: "build".into(),
            runtime: Runtime::Static,
            deploy_path: cfg.nginx_root.join(id),
            domain: None,
            port: None,
            target: Target::Server,
            owner_id: ADMIN_OWNER_ID.into(),
            template_id: None,
            env: EnvList::default(),
            runtime_port: None,
            last_deploy: None,
            last_commit: None,
            created_at: Utc::now(),
        }
    }

    async fn wait_terminal(engine: &Engine, id: Uuid) -> DeploymentRecord {
        for _ in 0..500 {
            let record = engine.deployments().get(id).await.unwrap();
            if record.status.is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("deployment {id} never reached a terminal state");
    }

    #[tokio::test]
    async fn admission_is_bounded_and_writes_nothing_when_full() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path());
        cfg.ensure_dirs().unwrap();
        let engine = Engine::new(cfg.clone());
        engine.projects().create(&static_project(&cfg, "p1")).unwrap();

        // Single-threaded runtime: workers cannot start until we yield, so
        // three back-to-back enqueues hit the bound deterministically.
        let first = engine.enqueue("p1", true).await.unwrap();
        let second = engine.enqueue("p1", true).await.unwrap();
        let third = engine.enqueue("p1", true).await;
        assert!(matches!(third, Err(Error::QueueFull)));

        assert_eq!(engine.deployments().list_for_project("p1", 10).unwrap().len(), 2);

        wait_terminal(&engine, first.id).await;
        wait_terminal(&engine, second.id).await;

        // Capacity is released once workers finish.
        engine.enqueue("p1", true).await.unwrap();
    }

    #[tokio::test]
    async fn dry_run_completes_without_touching_the_filesystem() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path());
        cfg.ensure_dirs().unwrap();
        let engine = Engine::new(cfg.clone());
        engine.projects().create(&static_project(&cfg, "p1")).unwrap();

        let queued = engine.enqueue("p1", true).await.unwrap();
        let record = wait_terminal(&engine, queued.id).await;

        assert_eq!(record.status, DeployStatus::Success);
        assert!(record.commit.is_none());
        assert_eq!(record.steps[&Step::Sync].status, StepStatus::Success);
        assert_eq!(record.steps[&Step::Build].status, StepStatus::Success);
        assert_eq!(record.steps[&Step::Install].status, StepStatus::Skipped);
        assert_eq!(record.steps[&Step::Runtime].status, StepStatus::Skipped);

        let log = std::fs::read_to_string(&record.log_path).unwrap();
        assert!(log.contains("[dry-run] $ git clone"));
        assert!(log.contains("[dry-run] $ bash -lc npm run build"));
        assert!(log.contains("[dry-run] $ nginx -t"));

        let paths = ProjectPaths::new(&cfg, "p1");
        assert!(!paths.releases_dir().exists());
        assert!(!paths.repo_dir().join(".git").exists());
        assert!(engine.projects().load("p1").unwrap().last_deploy.is_none());
    }

    #[tokio::test]
    async fn tampered_secret_fails_before_any_step_runs() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path());
        cfg.ensure_dirs().unwrap();
        let engine = Engine::new(cfg.clone());

        let blob = engine.codec().encrypt("s3cret").unwrap();
        let mut tampered: Vec<char> = blob.chars().collect();
        let last = tampered.len() - 1;
        tampered[last] = if tampered[last] == 'A' { 'B' } else { 'A' };

        let mut project = static_project(&cfg, "p1");
        project.env = EnvList(vec![EnvEntry {
            key: "API_KEY".into(),
            is_secret: true,
            value: None,
            encrypted_value: Some(tampered.into_iter().collect()),
        }]);
        engine.projects().create(&project).unwrap();

        let queued = engine.enqueue("p1", true).await.unwrap();
        let record = wait_terminal(&engine, queued.id).await;

        assert_eq!(record.status, DeployStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("Failed to decrypt secrets"));
        assert!(record.steps.is_empty());

        let log = std::fs::read_to_string(&record.log_path).unwrap();
        assert!(log.contains("Failed to decrypt secrets"));
        assert!(!ProjectPaths::new(&cfg, "p1").releases_dir().exists());
    }

    #[tokio::test]
    async fn template_bound_project_without_template_is_rejected() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path());
        cfg.ensure_dirs().unwrap();
        let engine = Engine::new(cfg.clone());

        let mut project = static_project(&cfg, "p1");
        project.owner_id = "user-7".into();
        project.template_id = None;
        engine.projects().create(&project).unwrap();

        let err = engine.enqueue("p1", false).await.unwrap_err();
        assert!(matches!(err, Error::ConfigIncomplete(_)));
        assert!(engine.deployments().list_for_project("p1", 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn node_project_without_start_command_is_rejected() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path());
        cfg.ensure_dirs().unwrap();
        let engine = Engine::new(cfg.clone());

        let mut project = static_project(&cfg, "p1");
        project.runtime = Runtime::Node;
        engine.projects().create(&project).unwrap();

        let err = engine.enqueue("p1", false).await.unwrap_err();
        assert!(matches!(err, Error::ConfigIncomplete(_)));
    }

    #[tokio::test]
    async fn deploy_path_outside_web_root_is_rejected_at_admission() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path());
        cfg.ensure_dirs().unwrap();
        let engine = Engine::new(cfg.clone());

        let mut project = static_project(&cfg, "p1");
        project.deploy_path = "/etc/passwd".into();
        engine.projects().create(&project).unwrap();

        let err = engine.enqueue("p1", false).await.unwrap_err();
        assert!(matches!(err, Error::PathEscape { .. }));
    }

    #[tokio::test]
    async fn node_dry_run_assigns_a_port_without_persisting_it() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path());
        cfg.ensure_dirs().unwrap();
        let engine = Engine::new(cfg.clone());

        let mut project = static_project(&cfg, "api");
        project.runtime = Runtime::Node;
        project.start_command = Some("node server.js".into());
        engine.projects().create(&project).unwrap();

        let queued = engine.enqueue("api", true).await.unwrap();
        let record = wait_terminal(&engine, queued.id).await;
        assert_eq!(record.status, DeployStatus::Success);
        assert_eq!(record.steps[&Step::Runtime].status, StepStatus::Success);

        let log = std::fs::read_to_string(&record.log_path).unwrap();
        assert!(log.contains("pm2 start bash --name api"));

        // Dry-run leaves the stored record untouched; the port is assigned
        // again (to the same value) on the first real deploy.
        assert!(engine.projects().load("api").unwrap().runtime_port.is_none());
    }

    #[tokio::test]
    async fn runtime_ports_are_deterministic_and_collision_free() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path());
        cfg.ensure_dirs().unwrap();
        let engine = Engine::new(cfg.clone());

        let first = engine.assign_runtime_port("api").unwrap();
        let again = engine.assign_runtime_port("api").unwrap();
        assert_eq!(first, again);
        assert!((4000..5000).contains(&first));

        // Another project already holding the port forces a probe.
        let mut other = static_project(&cfg, "other");
        other.runtime_port = Some(first);
        engine.projects().create(&other).unwrap();

        let probed = engine.assign_runtime_port("api").unwrap();
        assert_ne!(probed, first);
        assert!((4000..5000).contains(&probed));
    }
}

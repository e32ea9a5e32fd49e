//! Deploy pipeline.
//!
//! A deploy attempt creates a project row first and then walks the daemon
//! through pre-emption, stale-name cleanup, network ensure, clone, build,
//! container create and start, persisting the designated status at every
//! boundary. Pre-emption and name cleanup are opportunistic: their failures
//! are logged and swallowed. Everything from the network step onward marks
//! the project `failed` before the error is surfaced.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    pin::Pin,
    task::{Context, Poll},
};

use common::config;
use db::{
    course_offering,
    project::{self, Status},
    team, ActiveValue, EntityTrait,
};
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{error, instrument, warn};

use crate::{
    auth,
    docker::{BuildEvent, BuildEventStream, ContainerSpec},
    error::Error,
    events::DeployEvent,
    fetch::CloneDir,
    naming, store, Engine,
};

/// Command forced onto legacy two-container applications.
const LEGACY_APP_CMD: [&str; 4] = ["flask", "run", "--host=0.0.0.0", "--port=5000"];

/// Inputs of a deploy attempt.
#[derive(Clone, Debug)]
pub struct DeployRequest {
    pub team_id: i64,
    pub github_url: String,
    pub deployed_by: i64,
    pub build_args: HashMap<String, String>,
    pub env_vars: HashMap<String, String>,
    pub data_file: Option<DataFile>,
}

impl DeployRequest {
    pub fn new(team_id: i64, github_url: impl Into<String>, deployed_by: i64) -> Self {
        Self {
            team_id,
            github_url: github_url.into(),
            deployed_by,
            build_args: HashMap::new(),
            env_vars: HashMap::new(),
            data_file: None,
        }
    }
}

/// Uploaded data file bind-mounted read-only into the container.
#[derive(Clone, Debug)]
pub struct DataFile {
    /// Path under which this process observes the file.
    pub path: PathBuf,

    /// Filename the upload originally had, preserved inside the container.
    pub original_name: String,
}

/// Sidecar database flavor of a legacy two-container deploy.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LegacyVariant {
    Json,
    Sql,
}

/// Live event stream of a streaming deploy.
///
/// Yields a `start` record, one `log` record per build event, and a terminal
/// `complete` or `error`. Dropping the stream abandons only the observation;
/// the build itself runs to daemon completion and the project is marked
/// failed.
pub struct DeployStream {
    events: mpsc::UnboundedReceiver<DeployEvent>,
}

impl DeployStream {
    pub async fn next_event(&mut self) -> Option<DeployEvent> {
        self.events.recv().await
    }
}

impl Stream for DeployStream {
    type Item = DeployEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

/// Container launch parameters shared by deploy and redeploy.
struct LaunchSpec {
    /// Image content identifier. Launching by hash rather than by the
    /// mutable reference keeps tagged builds pinned even after the team's
    /// `:latest` moves on.
    image: String,
    name: String,
    env: Vec<String>,
    cmd: Option<Vec<String>>,
    data_file: Option<(PathBuf, String)>,
}

/// Rewrite an engine-visible data file path into the daemon's view.
pub(crate) fn resolve_host_path(config: &config::Engine, path: &Path) -> PathBuf {
    if let Some(host_dir) = &config.host_data_dir {
        if let Ok(rest) = path.strip_prefix(&config.container_data_dir) {
            return host_dir.join(rest);
        }
    }

    path.to_owned()
}

fn map_to_json(map: &HashMap<String, String>) -> serde_json::Value {
    serde_json::to_value(map).unwrap_or_default()
}

pub(crate) fn json_to_map(value: &serde_json::Value) -> HashMap<String, String> {
    serde_json::from_value(value.clone()).unwrap_or_default()
}

/// Environment in `KEY=VALUE` form, sorted for stable container specs.
fn container_env(env_vars: &HashMap<String, String>) -> Vec<String> {
    let mut env: Vec<String> = env_vars
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();
    env.sort();
    env
}

fn data_file_of(path: Option<&str>, original_name: Option<&str>) -> Option<(PathBuf, String)> {
    let path = PathBuf::from(path?);

    let name = original_name.map(str::to_owned).or_else(|| {
        path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
    })?;

    Some((path, name))
}

/// Accumulated result of a consumed build stream.
struct BuildOutcome {
    logs: String,
    error: Option<String>,
}

/// Drain a build stream, accumulating log text and relaying it to the
/// streaming client when one is attached.
///
/// A disconnected client terminates consumption; the daemon finishes the
/// build on its own and only the observation is lost.
async fn consume_build(
    mut stream: BuildEventStream,
    relay: Option<&mpsc::UnboundedSender<DeployEvent>>,
) -> BuildOutcome {
    let mut logs = String::new();
    let mut error = None;

    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => {
                let text = event.log_text();
                logs.push_str(&text);

                if let Some(sender) = relay {
                    if sender.send(DeployEvent::Log { data: text }).is_err() {
                        error = Some(String::from("build log consumer disconnected"));
                        break;
                    }
                }

                if let BuildEvent::Error(message) = event {
                    error = Some(message);
                    break;
                }
            }
            Err(err) => {
                error = Some(err.to_string());
                break;
            }
        }
    }

    BuildOutcome { logs, error }
}

impl Engine {
    /// Deploy a team's repository and leave its container running.
    #[instrument(skip_all, fields(team = request.team_id))]
    pub async fn deploy(&self, request: DeployRequest) -> Result<project::Model, Error> {
        self.deploy_inner(request, None).await
    }

    /// Deploy with a sidecar database container alongside the application.
    #[instrument(skip_all, fields(team = request.team_id, variant = ?variant))]
    pub async fn deploy_legacy_two_container(
        &self,
        request: DeployRequest,
        variant: LegacyVariant,
    ) -> Result<project::Model, Error> {
        self.deploy_inner(request, Some(variant)).await
    }

    /// Deploy while exposing the build output as a live event stream.
    ///
    /// Input validation failures surface before any stream exists; from then
    /// on failures arrive as a terminal `error` event.
    #[instrument(skip_all, fields(team = request.team_id))]
    pub async fn deploy_streaming(&self, request: DeployRequest) -> Result<DeployStream, Error> {
        let (team, offering) = self.load_team(request.team_id).await?;

        if !auth::may_deploy(&*self.db, request.deployed_by, &offering).await? {
            return Err(Error::Forbidden);
        }

        let project = self.insert_project(&request, Status::Building).await?;

        let (sender, events) = mpsc::unbounded_channel();
        let _ = sender.send(DeployEvent::Start {
            project: project.clone(),
        });

        let engine = self.clone();

        tokio::spawn(async move {
            engine.reconcile_team_state(&team).await;

            match engine
                .build_and_launch(&team, &project, &request, None, Some(&sender))
                .await
            {
                Ok(model) => {
                    let _ = sender.send(DeployEvent::Complete { project: model });
                }
                Err(err) => {
                    engine.mark_failed(project.id).await;

                    let _ = sender.send(DeployEvent::Error {
                        message: err.to_string(),
                    });
                }
            }
        });

        Ok(DeployStream { events })
    }

    /// Start a new container from a previously built project, skipping clone
    /// and build.
    #[instrument(skip_all, fields(source = source_project_id))]
    pub async fn redeploy(
        &self,
        source_project_id: i64,
        deployed_by: i64,
    ) -> Result<project::Model, Error> {
        let source = store::by_id(&*self.db, source_project_id)
            .await?
            .ok_or(Error::NotFound("project"))?;

        let (team, offering) = self.load_team(source.team_id).await?;

        if !auth::may_deploy(&*self.db, deployed_by, &offering).await? {
            return Err(Error::Forbidden);
        }

        // The stored image and data file must both still exist; the source
        // row may be arbitrarily old.
        self.docker
            .inspect_image(&source.image_hash)
            .await
            .map_err(|err| {
                if err.is_not_found() {
                    Error::NotFound("image")
                } else {
                    Error::Daemon(err)
                }
            })?;

        let data_file = data_file_of(
            source.data_file.as_deref(),
            source.original_data_file_name.as_deref(),
        );

        if let Some((path, _)) = &data_file {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                return Err(Error::NotFound("data file"));
            }
        }

        let project = self.insert_redeploy(&source, deployed_by).await?;

        self.reconcile_team_state(&team).await;

        let launch = LaunchSpec {
            image: source.image_hash.clone(),
            name: naming::normalized_team_name(&team.name),
            env: container_env(&json_to_map(&source.env_vars)),
            cmd: None,
            data_file,
        };

        let result = async {
            self.ensure_network().await?;
            self.launch(project.id, launch).await
        }
        .await;

        match result {
            Ok(model) => Ok(model),
            Err(err) => {
                self.mark_failed(project.id).await;
                Err(err)
            }
        }
    }

    /// Kill a project's container and record the stop.
    #[instrument(skip_all, fields(project = project_id))]
    pub async fn stop(&self, project_id: i64, caller: i64) -> Result<project::Model, Error> {
        let project = store::by_id(&*self.db, project_id)
            .await?
            .ok_or(Error::NotFound("project"))?;

        let container_id = project
            .container_id
            .clone()
            .ok_or_else(|| Error::BadRequest(String::from("project has no container")))?;

        let (team, offering) = self.load_team(project.team_id).await?;

        if !auth::may_stop(&*self.db, caller, &offering, team.id).await? {
            return Err(Error::Forbidden);
        }

        // Force kill; an absent or already-stopped container is fine.
        if let Err(err) = self.docker.kill_container(&container_id).await {
            if !err.is_benign_stop() {
                return Err(Error::Daemon(err));
            }
        }

        store::mark_stopped(&*self.db, project.id).await?;

        store::by_id(&*self.db, project.id)
            .await?
            .ok_or(Error::NotFound("project"))
    }

    /// Inspect the shared network, creating it when absent.
    ///
    /// A concurrent create is idempotent: the network name is unique
    /// daemon-side, so a conflict means someone else won the race.
    pub(crate) async fn ensure_network(&self) -> Result<(), Error> {
        match self.docker.inspect_network(&self.config.projects_network).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => {
                match self.docker.create_network(&self.config.projects_network).await {
                    Ok(()) => Ok(()),
                    Err(err) if err.is_conflict() => Ok(()),
                    Err(err) => Err(Error::Daemon(err)),
                }
            }
            Err(err) => Err(Error::Daemon(err)),
        }
    }

    async fn deploy_inner(
        &self,
        request: DeployRequest,
        variant: Option<LegacyVariant>,
    ) -> Result<project::Model, Error> {
        let (team, offering) = self.load_team(request.team_id).await?;

        if !auth::may_deploy(&*self.db, request.deployed_by, &offering).await? {
            return Err(Error::Forbidden);
        }

        let project = self.insert_project(&request, Status::Building).await?;

        self.reconcile_team_state(&team).await;

        match self
            .build_and_launch(&team, &project, &request, variant, None)
            .await
        {
            Ok(model) => Ok(model),
            Err(err) => {
                self.mark_failed(project.id).await;
                Err(err)
            }
        }
    }

    async fn load_team(
        &self,
        team_id: i64,
    ) -> Result<(team::Model, course_offering::Model), Error> {
        let team = team::Entity::find_by_id(team_id)
            .one(&*self.db)
            .await?
            .ok_or(Error::NotFound("team"))?;

        let offering = course_offering::Entity::find_by_id(team.course_offering_id)
            .one(&*self.db)
            .await?
            .ok_or(Error::NotFound("course offering"))?;

        Ok((team, offering))
    }

    async fn insert_project(
        &self,
        request: &DeployRequest,
        status: Status,
    ) -> Result<project::Model, Error> {
        let model = project::Entity::insert(project::ActiveModel {
            team_id: ActiveValue::Set(request.team_id),
            deployed_by_id: ActiveValue::Set(Some(request.deployed_by)),
            github_url: ActiveValue::Set(request.github_url.clone()),
            image_hash: ActiveValue::Set(String::new()),
            status: ActiveValue::Set(status),
            build_args: ActiveValue::Set(map_to_json(&request.build_args)),
            env_vars: ActiveValue::Set(map_to_json(&request.env_vars)),
            data_file: ActiveValue::Set(
                request
                    .data_file
                    .as_ref()
                    .map(|file| file.path.display().to_string()),
            ),
            original_data_file_name: ActiveValue::Set(
                request
                    .data_file
                    .as_ref()
                    .map(|file| file.original_name.clone()),
            ),
            deployed_at: ActiveValue::Set(store::now()),
            ..Default::default()
        })
        .exec_with_returning(&*self.db)
        .await?;

        Ok(model)
    }

    async fn insert_redeploy(
        &self,
        source: &project::Model,
        deployed_by: i64,
    ) -> Result<project::Model, Error> {
        let model = project::Entity::insert(project::ActiveModel {
            team_id: ActiveValue::Set(source.team_id),
            deployed_by_id: ActiveValue::Set(Some(deployed_by)),
            github_url: ActiveValue::Set(source.github_url.clone()),
            image_hash: ActiveValue::Set(source.image_hash.clone()),
            tag: ActiveValue::Set(source.tag.clone()),
            status: ActiveValue::Set(Status::Deploying),
            build_args: ActiveValue::Set(source.build_args.clone()),
            env_vars: ActiveValue::Set(source.env_vars.clone()),
            data_file: ActiveValue::Set(source.data_file.clone()),
            original_data_file_name: ActiveValue::Set(source.original_data_file_name.clone()),
            deployed_at: ActiveValue::Set(store::now()),
            ..Default::default()
        })
        .exec_with_returning(&*self.db)
        .await?;

        Ok(model)
    }

    /// Steps shared by every deploy variant from the network ensure onward.
    async fn build_and_launch(
        &self,
        team: &team::Model,
        project: &project::Model,
        request: &DeployRequest,
        variant: Option<LegacyVariant>,
        relay: Option<&mpsc::UnboundedSender<DeployEvent>>,
    ) -> Result<project::Model, Error> {
        self.ensure_network().await?;

        let clone_root = self
            .config
            .clone_root
            .clone()
            .unwrap_or_else(std::env::temp_dir);

        let clone_dir = CloneDir::unique(&clone_root, &request.github_url);

        if let Err(err) = tokio::fs::create_dir_all(clone_dir.path()).await {
            return Err(Error::Fetch(err.into()));
        }

        if let Err(err) = self.fetcher.fetch(&request.github_url, clone_dir.path()).await {
            clone_dir.remove().await;
            return Err(err.into());
        }

        let image_reference = naming::image_reference(&team.name);

        let stream = match self
            .docker
            .build_image(clone_dir.path(), &image_reference, &request.build_args)
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                clone_dir.remove().await;
                return Err(Error::Daemon(err));
            }
        };

        let outcome = consume_build(stream, relay).await;

        // The staging clone is gone on every exit path from here on.
        clone_dir.remove().await;

        if let Some(message) = outcome.error {
            if let Err(err) = store::set_build_logs(&*self.db, project.id, &outcome.logs).await {
                error!(project = project.id, %err, "unable to persist failed build logs");
            }

            return Err(Error::BuildFailure {
                message,
                logs: outcome.logs,
            });
        }

        let image = self.docker.inspect_image(&image_reference).await?;

        store::set_build_result(&*self.db, project.id, &outcome.logs, &image.id).await?;

        let mut env = container_env(&request.env_vars);
        let mut cmd = None;

        if let Some(variant) = variant {
            let alias = naming::sidecar_alias(&team.name);

            self.provision_sidecar(variant, &alias).await?;

            env.push(format!("DB_NAME={alias}"));
            cmd = Some(LEGACY_APP_CMD.iter().map(|arg| arg.to_string()).collect());
        }

        self.launch(
            project.id,
            LaunchSpec {
                image: image.id,
                name: naming::normalized_team_name(&team.name),
                env,
                cmd,
                data_file: request
                    .data_file
                    .as_ref()
                    .map(|file| (file.path.clone(), file.original_name.clone())),
            },
        )
        .await
    }

    /// Create, start, inspect, persist.
    async fn launch(&self, project_id: i64, launch: LaunchSpec) -> Result<project::Model, Error> {
        let mut binds = Vec::new();

        if let Some((path, original_name)) = &launch.data_file {
            let host_path = resolve_host_path(&self.config, path);

            binds.push(format!(
                "{}:{}/{}:ro",
                host_path.display(),
                self.config.data_mount_path,
                original_name
            ));
        }

        let container_id = self
            .docker
            .create_container(ContainerSpec {
                name: launch.name.clone(),
                image: launch.image,
                env: launch.env,
                cmd: launch.cmd,
                memory_limit: self.config.memory_limit,
                network: self.config.projects_network.clone(),
                aliases: vec![launch.name],
                binds,
            })
            .await?;

        self.docker.start_container(&container_id).await?;

        let info = self.docker.inspect_container(&container_id).await?;

        store::mark_running(&*self.db, project_id, &info).await?;

        store::by_id(&*self.db, project_id)
            .await?
            .ok_or(Error::NotFound("project"))
    }

    /// Start the sidecar database of a legacy two-container deploy.
    async fn provision_sidecar(&self, variant: LegacyVariant, alias: &str) -> Result<(), Error> {
        // The sidecar name is as much a single-writer resource as the
        // application name; reconcile leftovers the same way.
        self.remove_stale_container(alias).await;

        let image = match variant {
            LegacyVariant::Json => &self.config.json_db_image,
            LegacyVariant::Sql => &self.config.sql_db_image,
        };

        let container_id = self
            .docker
            .create_container(ContainerSpec {
                name: alias.to_string(),
                image: image.clone(),
                memory_limit: self.config.memory_limit,
                network: self.config.projects_network.clone(),
                aliases: vec![alias.to_string()],
                ..Default::default()
            })
            .await?;

        self.docker.start_container(&container_id).await?;

        Ok(())
    }

    /// Steps 2 and 3: stop whatever the team currently has running and
    /// reconcile containers the repository forgot about. Opportunistic;
    /// never aborts the deploy.
    async fn reconcile_team_state(&self, team: &team::Model) {
        self.preempt_running(team.id).await;
        self.remove_stale_container(&naming::normalized_team_name(&team.name))
            .await;
    }

    async fn preempt_running(&self, team_id: i64) {
        let running = match store::running_for_team(&*self.db, team_id).await {
            Ok(running) => running,
            Err(err) => {
                error!(team = team_id, %err, "unable to load running projects");
                return;
            }
        };

        for prior in running {
            if let Some(container_id) = prior.container_id.as_deref() {
                if let Err(err) = self.docker.stop_container(container_id).await {
                    if !err.is_benign_stop() {
                        warn!(container = container_id, %err, "unable to stop preempted container");
                    }
                }
            }

            if let Err(err) = store::mark_stopped(&*self.db, prior.id).await {
                error!(project = prior.id, %err, "unable to mark preempted project stopped");
            }
        }
    }

    /// Best-effort stop-then-remove of a container by canonical name.
    pub(crate) async fn remove_stale_container(&self, name: &str) {
        let stale = match self.docker.inspect_container(name).await {
            Ok(info) => info,
            Err(err) => {
                if !err.is_not_found() {
                    warn!(name, %err, "unable to look up stale container");
                }
                return;
            }
        };

        if let Err(err) = self.docker.stop_container(&stale.id).await {
            if !err.is_benign_stop() {
                warn!(container = %stale.id, %err, "unable to stop stale container");
            }
        }

        if let Err(err) = self.docker.remove_container(&stale.id).await {
            if !err.is_not_found() {
                warn!(container = %stale.id, %err, "unable to remove stale container");
            }
        }
    }

    pub(crate) async fn mark_failed(&self, project_id: i64) {
        if let Err(err) = store::mark_failed(&*self.db, project_id).await {
            error!(project = project_id, %err, "unable to mark project failed");
        }
    }
}

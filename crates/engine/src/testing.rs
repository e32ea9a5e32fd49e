//! Test fixtures.
//!
//! An in-memory [`ContainerDaemon`], a scripted repository fetcher, and a
//! sqlite database with the full schema applied, so every pipeline test runs
//! without a daemon, a network, or `git`.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use bytes::Bytes;
use common::config;
use db::{
    course_offering, enrollment, team, team_member, user, ActiveValue, Database,
    DatabaseConnection, EntityTrait,
};
use futures_util::{stream, StreamExt};
use migration::MigratorTrait;

use crate::{
    docker::{
        BuildEvent, BuildEventStream, ByteStream, ContainerDaemon, ContainerInfo, ContainerSpec,
        ContainerSummary, Error, ImageInfo, LogStreamOptions, NetworkInfo,
    },
    fetch::{FetchError, SourceFetcher},
    Engine,
};

pub(crate) async fn create_database() -> DatabaseConnection {
    let db = Database::connect("sqlite::memory:")
        .await
        .expect("unable to create test database");

    migration::Migrator::up(&db, None)
        .await
        .expect("unable to run migrations");

    db
}

/// One container known to the fake daemon.
#[derive(Clone, Debug)]
pub(crate) struct FakeContainer {
    pub id: String,
    /// Stored with the daemon's leading `/`.
    pub name: String,
    pub image: String,
    pub image_id: String,
    pub running: bool,
    pub env: Vec<String>,
    pub cmd: Option<Vec<String>>,
    pub binds: Vec<String>,
    pub memory_limit: i64,
    pub created_at: Option<String>,
    pub ports: Option<serde_json::Value>,
}

impl FakeContainer {
    pub(crate) fn foreign(id: &str, name: &str, image: &str, image_id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: format!("/{name}"),
            image: image.to_string(),
            image_id: image_id.to_string(),
            running: true,
            env: Vec::new(),
            cmd: None,
            binds: Vec::new(),
            memory_limit: 0,
            created_at: Some(String::from("2024-03-01T12:00:00Z")),
            ports: Some(serde_json::json!({})),
        }
    }
}

#[derive(Default)]
struct State {
    containers: HashMap<String, FakeContainer>,
    /// Image ids present in the daemon.
    images: HashSet<String>,
    /// Reference (`repo:tag`) to image id.
    image_refs: HashMap<String, String>,
    /// Network name to connected container id to alias list.
    networks: HashMap<String, HashMap<String, Vec<String>>>,
    /// Events served by the next builds; a successful default when `None`.
    build_events: Option<Vec<BuildEvent>>,
    /// Recorded `(tag, build_args)` of every build.
    builds: Vec<(String, HashMap<String, String>)>,
    /// Chunks served by `container_logs`.
    log_chunks: Vec<Bytes>,
    next_container: u64,
    next_image: u64,
    networks_created: u64,
}

impl State {
    /// Resolve an image reference or (possibly truncated) id.
    fn resolve_image(&self, reference: &str) -> Option<String> {
        if let Some(id) = self.image_refs.get(reference) {
            return Some(id.clone());
        }

        if self.images.contains(reference) {
            return Some(reference.to_string());
        }

        self.images
            .iter()
            .find(|id| id.starts_with(reference) || reference.starts_with(id.as_str()))
            .cloned()
    }

    fn container_info(&self, container: &FakeContainer) -> ContainerInfo {
        let network_aliases = self
            .networks
            .iter()
            .filter_map(|(network, connected)| {
                connected
                    .get(&container.id)
                    .map(|aliases| (network.clone(), aliases.clone()))
            })
            .collect();

        ContainerInfo {
            id: container.id.clone(),
            name: container.name.clone(),
            running: container.running,
            image: container.image.clone(),
            image_id: container.image_id.clone(),
            created_at: container.created_at.clone(),
            ports: container.ports.clone(),
            network_aliases,
        }
    }

    fn find_container(&self, id_or_name: &str) -> Option<&FakeContainer> {
        if let Some(container) = self.containers.get(id_or_name) {
            return Some(container);
        }

        let wanted = id_or_name.trim_start_matches('/');

        self.containers
            .values()
            .find(|container| container.name.trim_start_matches('/') == wanted)
    }
}

/// In-memory [`ContainerDaemon`].
#[derive(Default)]
pub(crate) struct FakeDaemon {
    state: Mutex<State>,
}

impl FakeDaemon {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set_build_events(&self, events: Vec<BuildEvent>) {
        self.state.lock().unwrap().build_events = Some(events);
    }

    pub(crate) fn set_log_chunks(&self, chunks: Vec<Bytes>) {
        self.state.lock().unwrap().log_chunks = chunks;
    }

    pub(crate) fn add_container(&self, container: FakeContainer) {
        let mut state = self.state.lock().unwrap();
        state.containers.insert(container.id.clone(), container);
    }

    pub(crate) fn register_image(&self, id: &str, references: &[&str]) {
        let mut state = self.state.lock().unwrap();
        state.images.insert(id.to_string());
        for reference in references {
            state.image_refs.insert(reference.to_string(), id.to_string());
        }
    }

    pub(crate) fn add_network(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .networks
            .insert(name.to_string(), HashMap::new());
    }

    pub(crate) fn connect(&self, network: &str, container_id: &str, aliases: &[&str]) {
        self.state
            .lock()
            .unwrap()
            .networks
            .entry(network.to_string())
            .or_default()
            .insert(
                container_id.to_string(),
                aliases.iter().map(|alias| alias.to_string()).collect(),
            );
    }

    pub(crate) fn container(&self, id: &str) -> Option<FakeContainer> {
        self.state.lock().unwrap().containers.get(id).cloned()
    }

    pub(crate) fn container_named(&self, name: &str) -> Option<FakeContainer> {
        self.state.lock().unwrap().find_container(name).cloned()
    }

    pub(crate) fn has_image(&self, reference: &str) -> bool {
        self.state.lock().unwrap().resolve_image(reference).is_some()
    }

    pub(crate) fn image_references(&self) -> Vec<String> {
        self.state.lock().unwrap().image_refs.keys().cloned().collect()
    }

    pub(crate) fn aliases_of(&self, network: &str, container_id: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .networks
            .get(network)
            .and_then(|connected| connected.get(container_id))
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn network_exists(&self, name: &str) -> bool {
        self.state.lock().unwrap().networks.contains_key(name)
    }

    pub(crate) fn networks_created(&self) -> u64 {
        self.state.lock().unwrap().networks_created
    }

    pub(crate) fn builds(&self) -> Vec<(String, HashMap<String, String>)> {
        self.state.lock().unwrap().builds.clone()
    }
}

#[async_trait]
impl ContainerDaemon for FakeDaemon {
    async fn build_image(
        &self,
        _context: &Path,
        tag: &str,
        build_args: &HashMap<String, String>,
    ) -> Result<BuildEventStream, Error> {
        let mut state = self.state.lock().unwrap();

        state.builds.push((tag.to_string(), build_args.clone()));

        let events = state.build_events.clone().unwrap_or_else(|| {
            vec![
                BuildEvent::Stream(String::from("Step 1/2 : FROM python:3\n")),
                BuildEvent::Stream(String::from("Successfully built\n")),
            ]
        });

        let failed = events
            .iter()
            .any(|event| matches!(event, BuildEvent::Error(_)));

        if !failed {
            state.next_image += 1;
            let id = format!("sha256:fake{:04}", state.next_image);
            state.images.insert(id.clone());
            state.image_refs.insert(tag.to_string(), id);
        }

        Ok(stream::iter(events.into_iter().map(Ok)).boxed())
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageInfo, Error> {
        let state = self.state.lock().unwrap();

        state
            .resolve_image(reference)
            .map(|id| ImageInfo { id })
            .ok_or_else(|| Error::NotFound(format!("no such image: {reference}")))
    }

    async fn tag_image(&self, reference: &str, repo: &str, tag: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();

        let id = state
            .resolve_image(reference)
            .ok_or_else(|| Error::NotFound(format!("no such image: {reference}")))?;

        state.image_refs.insert(format!("{repo}:{tag}"), id);

        Ok(())
    }

    async fn remove_image(&self, reference: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();

        let id = state
            .resolve_image(reference)
            .ok_or_else(|| Error::NotFound(format!("no such image: {reference}")))?;

        let in_use = state.containers.values().any(|container| {
            container.image_id.starts_with(&id) || id.starts_with(&container.image_id)
        });

        if in_use {
            return Err(Error::Conflict(format!("image is being used: {id}")));
        }

        state.images.remove(&id);
        state.image_refs.retain(|_, image_id| *image_id != id);

        Ok(())
    }

    async fn list_containers(
        &self,
        include_stopped: bool,
    ) -> Result<Vec<ContainerSummary>, Error> {
        let state = self.state.lock().unwrap();

        Ok(state
            .containers
            .values()
            .filter(|container| include_stopped || container.running)
            .map(|container| ContainerSummary {
                id: container.id.clone(),
                names: vec![container.name.clone()],
                image: container.image.clone(),
                image_id: container.image_id.clone(),
                running: container.running,
            })
            .collect())
    }

    async fn create_container(&self, spec: ContainerSpec) -> Result<String, Error> {
        let mut state = self.state.lock().unwrap();

        if state.find_container(&spec.name).is_some() {
            return Err(Error::Conflict(format!(
                "container name {} is already in use",
                spec.name
            )));
        }

        let image_id = state
            .resolve_image(&spec.image)
            .ok_or_else(|| Error::NotFound(format!("no such image: {}", spec.image)))?;

        state.next_container += 1;
        let id = format!("ctr{:04}", state.next_container);

        state.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: format!("/{}", spec.name),
                image: spec.image,
                image_id,
                running: false,
                env: spec.env,
                cmd: spec.cmd,
                binds: spec.binds,
                memory_limit: spec.memory_limit,
                created_at: Some(String::from("2024-03-01T12:00:00Z")),
                ports: Some(serde_json::json!({})),
            },
        );

        state
            .networks
            .entry(spec.network)
            .or_default()
            .insert(id.clone(), spec.aliases);

        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();

        match state.containers.get_mut(id) {
            Some(container) => {
                container.running = true;
                Ok(())
            }
            None => Err(Error::NotFound(format!("no such container: {id}"))),
        }
    }

    async fn stop_container(&self, id: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();

        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("no such container: {id}")))?;

        if !container.running {
            return Err(Error::AlreadyInDesiredState);
        }

        container.running = false;

        Ok(())
    }

    async fn kill_container(&self, id: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();

        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("no such container: {id}")))?;

        if !container.running {
            return Err(Error::Conflict(format!("container {id} is not running")));
        }

        container.running = false;

        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();

        state
            .containers
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("no such container: {id}")))?;

        for connected in state.networks.values_mut() {
            connected.remove(id);
        }

        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, Error> {
        let state = self.state.lock().unwrap();

        state
            .find_container(id)
            .map(|container| state.container_info(container))
            .ok_or_else(|| Error::NotFound(format!("no such container: {id}")))
    }

    async fn container_logs(
        &self,
        id: &str,
        _options: LogStreamOptions,
    ) -> Result<ByteStream, Error> {
        let state = self.state.lock().unwrap();

        if state.find_container(id).is_none() {
            return Err(Error::NotFound(format!("no such container: {id}")));
        }

        let chunks = state.log_chunks.clone();

        Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
    }

    async fn inspect_network(&self, name: &str) -> Result<NetworkInfo, Error> {
        let state = self.state.lock().unwrap();

        state
            .networks
            .get(name)
            .map(|connected| NetworkInfo {
                name: name.to_string(),
                container_ids: connected.keys().cloned().collect(),
            })
            .ok_or_else(|| Error::NotFound(format!("no such network: {name}")))
    }

    async fn create_network(&self, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();

        if state.networks.contains_key(name) {
            return Err(Error::Conflict(format!("network {name} already exists")));
        }

        state.networks.insert(name.to_string(), HashMap::new());
        state.networks_created += 1;

        Ok(())
    }

    async fn connect_network(
        &self,
        name: &str,
        container: &str,
        aliases: &[String],
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();

        let connected = state
            .networks
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("no such network: {name}")))?;

        connected.insert(container.to_string(), aliases.to_vec());

        Ok(())
    }

    async fn disconnect_network(&self, name: &str, container: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();

        let connected = state
            .networks
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("no such network: {name}")))?;

        connected
            .remove(container)
            .ok_or_else(|| Error::NotFound(format!("container {container} is not connected")))?;

        Ok(())
    }
}

#[derive(Default)]
struct FetcherState {
    fetched: Vec<String>,
    fail: bool,
}

/// [`SourceFetcher`] that fabricates a one-file build context.
#[derive(Default)]
pub(crate) struct FakeFetcher {
    state: Mutex<FetcherState>,
}

impl FakeFetcher {
    pub(crate) fn set_fail(&self) {
        self.state.lock().unwrap().fail = true;
    }

    pub(crate) fn fetched(&self) -> Vec<String> {
        self.state.lock().unwrap().fetched.clone()
    }
}

#[async_trait]
impl SourceFetcher for FakeFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<(), FetchError> {
        {
            let mut state = self.state.lock().unwrap();

            if state.fail {
                return Err(FetchError::CloneFailed);
            }

            state.fetched.push(url.to_string());
        }

        tokio::fs::write(dest.join("Dockerfile"), "FROM python:3\n").await?;

        Ok(())
    }
}

/// A fully wired engine over fakes.
pub(crate) struct TestWorld {
    pub docker: Arc<FakeDaemon>,
    pub fetcher: Arc<FakeFetcher>,
    pub db: Arc<DatabaseConnection>,
    pub engine: Engine,
}

pub(crate) async fn world() -> TestWorld {
    world_with(config::Engine::default()).await
}

pub(crate) async fn world_with(config: config::Engine) -> TestWorld {
    let docker = FakeDaemon::new();
    let fetcher = Arc::new(FakeFetcher::default());
    let db = Arc::new(create_database().await);

    let engine =
        Engine::new(docker.clone(), db.clone(), config).with_fetcher(fetcher.clone());

    TestWorld {
        docker,
        fetcher,
        db,
        engine,
    }
}

pub(crate) async fn seed_user(db: &DatabaseConnection, username: &str, admin: bool) -> i64 {
    user::Entity::insert(user::ActiveModel {
        username: ActiveValue::Set(username.to_string()),
        admin: ActiveValue::Set(admin),
        ..Default::default()
    })
    .exec_with_returning(db)
    .await
    .expect("unable to create user")
    .id
}

pub(crate) async fn seed_offering(db: &DatabaseConnection, settings: serde_json::Value) -> i64 {
    course_offering::Entity::insert(course_offering::ActiveModel {
        name: ActiveValue::Set(String::from("CS312 2026S1")),
        settings: ActiveValue::Set(settings),
        ..Default::default()
    })
    .exec_with_returning(db)
    .await
    .expect("unable to create course offering")
    .id
}

pub(crate) async fn seed_team(db: &DatabaseConnection, offering_id: i64, name: &str) -> i64 {
    team::Entity::insert(team::ActiveModel {
        course_offering_id: ActiveValue::Set(offering_id),
        name: ActiveValue::Set(name.to_string()),
        ..Default::default()
    })
    .exec_with_returning(db)
    .await
    .expect("unable to create team")
    .id
}

/// Directly inserted project row for tests that need precise pre-state.
pub(crate) struct ProjectSeed {
    pub team_id: i64,
    pub status: db::project::Status,
    pub image_hash: String,
    pub tag: Option<String>,
    pub container_id: Option<String>,
    pub container_name: Option<String>,
    pub data_file: Option<String>,
}

impl ProjectSeed {
    pub(crate) fn new(team_id: i64, status: db::project::Status) -> Self {
        Self {
            team_id,
            status,
            image_hash: String::new(),
            tag: None,
            container_id: None,
            container_name: None,
            data_file: None,
        }
    }
}

pub(crate) async fn seed_project(db: &DatabaseConnection, seed: ProjectSeed) -> i64 {
    db::project::Entity::insert(db::project::ActiveModel {
        team_id: ActiveValue::Set(seed.team_id),
        github_url: ActiveValue::Set(String::from("https://github.com/u/r")),
        image_hash: ActiveValue::Set(seed.image_hash),
        tag: ActiveValue::Set(seed.tag),
        container_id: ActiveValue::Set(seed.container_id),
        container_name: ActiveValue::Set(seed.container_name),
        status: ActiveValue::Set(seed.status),
        build_args: ActiveValue::Set(serde_json::json!({})),
        env_vars: ActiveValue::Set(serde_json::json!({})),
        data_file: ActiveValue::Set(seed.data_file),
        deployed_at: ActiveValue::Set(crate::store::now()),
        ..Default::default()
    })
    .exec_with_returning(db)
    .await
    .expect("unable to create project")
    .id
}

pub(crate) async fn seed_member(db: &DatabaseConnection, team_id: i64, user_id: i64) {
    team_member::Entity::insert(team_member::ActiveModel {
        team_id: ActiveValue::Set(team_id),
        user_id: ActiveValue::Set(user_id),
        ..Default::default()
    })
    .exec_without_returning(db)
    .await
    .expect("unable to create team membership");
}

pub(crate) async fn seed_instructor(db: &DatabaseConnection, offering_id: i64, user_id: i64) {
    enrollment::Entity::insert(enrollment::ActiveModel {
        user_id: ActiveValue::Set(user_id),
        course_offering_id: ActiveValue::Set(offering_id),
        role: ActiveValue::Set(enrollment::Role::Instructor),
        ..Default::default()
    })
    .exec_without_returning(db)
    .await
    .expect("unable to create enrollment");
}

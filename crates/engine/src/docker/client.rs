use std::{collections::HashMap, path::Path};

use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
        NetworkingConfig, RemoveContainerOptions, StopContainerOptions,
    },
    image::{BuildImageOptions, RemoveImageOptions, TagImageOptions},
    network::{
        ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions,
        InspectNetworkOptions,
    },
    service::{EndpointSettings, HostConfig},
    Docker,
};
use futures_util::StreamExt;

use crate::logmux::{self, StreamKind};

use super::{
    BuildEvent, BuildEventStream, ByteStream, ContainerDaemon, ContainerInfo, ContainerSpec,
    ContainerSummary, Error, ImageInfo, LogStreamOptions, NetworkInfo,
};

/// Bollard-backed [`ContainerDaemon`] implementation.
#[derive(Clone)]
pub struct Client {
    docker: Docker,
}

impl Client {
    /// Connect to the daemon over its local socket.
    pub fn connect() -> Result<Self, Error> {
        let docker = Docker::connect_with_socket_defaults()?;

        Ok(Self { docker })
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code,
                message,
            } => match status_code {
                404 => Self::NotFound(message),
                409 => Self::Conflict(message),
                304 => Self::AlreadyInDesiredState,
                _ => Self::Api(message),
            },
            err => Self::Api(err.to_string()),
        }
    }
}

/// Pack a build context directory into a tar archive.
///
/// The daemon consumes contexts as archives; packing runs on the blocking
/// pool since the context may contain an entire cloned repository.
async fn context_archive(context: &Path) -> Result<Vec<u8>, Error> {
    let context = context.to_owned();

    tokio::task::spawn_blocking(move || {
        let mut builder = tar::Builder::new(Vec::new());
        builder.append_dir_all(".", &context)?;
        builder.into_inner()
    })
    .await
    .map_err(|err| Error::Api(err.to_string()))?
    .map_err(Error::Io)
}

fn map_build_info(info: bollard::models::BuildInfo) -> Option<BuildEvent> {
    if let Some(error) = info.error {
        Some(BuildEvent::Error(error))
    } else if let Some(stream) = info.stream {
        Some(BuildEvent::Stream(stream))
    } else {
        info.status.map(|status| BuildEvent::Status {
            status,
            progress: info.progress,
        })
    }
}

#[async_trait]
impl ContainerDaemon for Client {
    async fn build_image(
        &self,
        context: &Path,
        tag: &str,
        build_args: &HashMap<String, String>,
    ) -> Result<BuildEventStream, Error> {
        let archive = context_archive(context).await?;

        let options = BuildImageOptions {
            dockerfile: String::from("Dockerfile"),
            t: tag.to_string(),
            rm: true,
            buildargs: build_args.clone(),
            ..Default::default()
        };

        let docker = self.docker.clone();
        let stream = async_stream::stream! {
            let mut inner = docker.build_image(options, None, Some(archive.into()));
            while let Some(item) = inner.next().await {
                match item {
                    Ok(info) => {
                        if let Some(event) = map_build_info(info) {
                            yield Ok(event);
                        }
                    }
                    Err(err) => yield Err(Error::from(err)),
                }
            }
        };

        Ok(stream.boxed())
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageInfo, Error> {
        let inspect = self.docker.inspect_image(reference).await?;

        Ok(ImageInfo {
            id: inspect.id.unwrap_or_default(),
        })
    }

    async fn tag_image(&self, reference: &str, repo: &str, tag: &str) -> Result<(), Error> {
        self.docker
            .tag_image(
                reference,
                Some(TagImageOptions {
                    repo: repo.to_string(),
                    tag: tag.to_string(),
                }),
            )
            .await?;

        Ok(())
    }

    async fn remove_image(&self, reference: &str) -> Result<(), Error> {
        self.docker
            .remove_image(
                reference,
                Some(RemoveImageOptions {
                    force: false,
                    noprune: false,
                }),
                None,
            )
            .await?;

        Ok(())
    }

    async fn list_containers(
        &self,
        include_stopped: bool,
    ) -> Result<Vec<ContainerSummary>, Error> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: include_stopped,
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .map(|container| ContainerSummary {
                id: container.id.unwrap_or_default(),
                names: container.names.unwrap_or_default(),
                image: container.image.unwrap_or_default(),
                image_id: container.image_id.unwrap_or_default(),
                running: container.state.as_deref() == Some("running"),
            })
            .collect())
    }

    async fn create_container(&self, spec: ContainerSpec) -> Result<String, Error> {
        let host_config = HostConfig {
            memory: Some(spec.memory_limit),
            binds: (!spec.binds.is_empty()).then_some(spec.binds),
            auto_remove: Some(false),
            ..Default::default()
        };

        let endpoints = HashMap::from([(
            spec.network,
            EndpointSettings {
                aliases: Some(spec.aliases),
                ..Default::default()
            },
        )]);

        let container = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name,
                    ..Default::default()
                }),
                Config {
                    image: Some(spec.image),
                    env: Some(spec.env),
                    cmd: spec.cmd,
                    host_config: Some(host_config),
                    networking_config: Some(NetworkingConfig {
                        endpoints_config: endpoints,
                    }),
                    ..Default::default()
                },
            )
            .await?;

        Ok(container.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), Error> {
        self.docker.start_container::<String>(id, None).await?;

        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<(), Error> {
        self.docker
            .stop_container(id, Some(StopContainerOptions { t: 10 }))
            .await?;

        Ok(())
    }

    async fn kill_container(&self, id: &str) -> Result<(), Error> {
        self.docker.kill_container::<String>(id, None).await?;

        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), Error> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;

        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, Error> {
        let inspect = self.docker.inspect_container(id, None).await?;

        let running = inspect
            .state
            .as_ref()
            .and_then(|state| state.running)
            .unwrap_or(false);

        let image = inspect
            .config
            .as_ref()
            .and_then(|config| config.image.clone())
            .unwrap_or_default();

        let (ports, network_aliases) = match inspect.network_settings {
            Some(settings) => {
                let ports = settings
                    .ports
                    .as_ref()
                    .and_then(|ports| serde_json::to_value(ports).ok());

                let aliases = settings
                    .networks
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(network, endpoint)| (network, endpoint.aliases.unwrap_or_default()))
                    .collect();

                (ports, aliases)
            }
            None => (None, HashMap::new()),
        };

        Ok(ContainerInfo {
            id: inspect.id.unwrap_or_default(),
            name: inspect.name.unwrap_or_default(),
            running,
            image,
            image_id: inspect.image.unwrap_or_default(),
            created_at: inspect.created,
            ports,
            network_aliases,
        })
    }

    async fn container_logs(
        &self,
        id: &str,
        options: LogStreamOptions,
    ) -> Result<ByteStream, Error> {
        let logs = self.docker.logs(
            id,
            Some(LogsOptions {
                follow: options.follow,
                stdout: true,
                stderr: true,
                since: options.since.unwrap_or(0),
                timestamps: options.timestamps,
                tail: options
                    .tail
                    .map(|lines| lines.to_string())
                    .unwrap_or_else(|| String::from("all")),
                ..Default::default()
            }),
        );

        // Bollard parses the daemon framing away; restore it so every
        // backend hands the transport the same wire format.
        let stream = logs.map(|item| match item {
            Ok(output) => {
                let (kind, message) = match output {
                    LogOutput::StdIn { message } => (StreamKind::Stdin, message),
                    LogOutput::StdOut { message } => (StreamKind::Stdout, message),
                    LogOutput::StdErr { message } => (StreamKind::Stderr, message),
                    LogOutput::Console { message } => (StreamKind::Stdout, message),
                };

                Ok(logmux::encode(kind, &message))
            }
            Err(err) => Err(Error::from(err)),
        });

        Ok(stream.boxed())
    }

    async fn inspect_network(&self, name: &str) -> Result<NetworkInfo, Error> {
        let network = self
            .docker
            .inspect_network(
                name,
                Some(InspectNetworkOptions::<String> {
                    verbose: true,
                    ..Default::default()
                }),
            )
            .await?;

        Ok(NetworkInfo {
            name: network.name.unwrap_or_else(|| name.to_string()),
            container_ids: network
                .containers
                .unwrap_or_default()
                .into_keys()
                .collect(),
        })
    }

    async fn create_network(&self, name: &str) -> Result<(), Error> {
        self.docker
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                driver: String::from("bridge"),
                internal: false,
                attachable: true,
                ..Default::default()
            })
            .await?;

        Ok(())
    }

    async fn connect_network(
        &self,
        name: &str,
        container: &str,
        aliases: &[String],
    ) -> Result<(), Error> {
        self.docker
            .connect_network(
                name,
                ConnectNetworkOptions {
                    container: container.to_string(),
                    endpoint_config: EndpointSettings {
                        aliases: Some(aliases.to_vec()),
                        ..Default::default()
                    },
                },
            )
            .await?;

        Ok(())
    }

    async fn disconnect_network(&self, name: &str, container: &str) -> Result<(), Error> {
        self.docker
            .disconnect_network(
                name,
                DisconnectNetworkOptions {
                    container: container.to_string(),
                    force: false,
                },
            )
            .await?;

        Ok(())
    }
}

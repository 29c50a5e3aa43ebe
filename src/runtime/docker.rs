use super::{execute, CommandOutput, ContainerRuntime, RuntimeContainer, RuntimeImage};
use crate::error::EngineError;
use crate::types::FINGERPRINT_LABEL;
use async_trait::async_trait;
use bollard::container::{ListContainersOptions, RemoveContainerOptions};
use bollard::errors::Error as DockerError;
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::{debug, info};
use tokio::sync::OnceCell;

/// Docker engine client, connected on first use.
#[derive(Default)]
pub struct DockerRuntime {
    client: OnceCell<Docker>,
}

impl DockerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects once; concurrent first callers wait on the same
    /// initialisation and share the resulting handle.
    async fn client(&self) -> Result<&Docker, EngineError> {
        self.client
            .get_or_try_init(|| async {
                // Handles the unix socket on Linux and DOCKER_HOST when set.
                let docker = Docker::connect_with_local_defaults()?;
                info!("Connected to Docker engine");
                Ok::<_, EngineError>(docker)
            })
            .await
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self) -> Result<Vec<RuntimeContainer>, EngineError> {
        let docker = self.client().await?;
        let opts = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let containers = docker.list_containers(Some(opts)).await?;

        let mut out = Vec::with_capacity(containers.len());
        for c in containers {
            let Some(name) = c
                .names
                .as_ref()
                .and_then(|n| n.first())
                .map(|n| n.trim_start_matches('/').to_string())
            else {
                continue;
            };
            let fingerprint = c
                .labels
                .as_ref()
                .and_then(|labels| labels.get(FINGERPRINT_LABEL))
                .cloned();
            out.push(RuntimeContainer {
                name,
                fingerprint,
                created: c.created.unwrap_or_default(),
            });
        }
        Ok(out)
    }

    async fn list_images(&self) -> Result<Vec<RuntimeImage>, EngineError> {
        let docker = self.client().await?;
        let opts = ListImagesOptions::<String> {
            all: true,
            ..Default::default()
        };
        let images = docker.list_images(Some(opts)).await?;
        Ok(images
            .into_iter()
            .map(|image| RuntimeImage {
                repo_tags: image.repo_tags,
                created: image.created,
            })
            .collect())
    }

    async fn remove_container(&self, name: &str, force: bool) -> Result<(), EngineError> {
        let docker = self.client().await?;
        let opts = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        match docker.remove_container(name, Some(opts)).await {
            Ok(()) => Ok(()),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!("Container {} already gone", name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn run_command(&self, argv: &[String]) -> Result<CommandOutput, EngineError> {
        execute(argv).await
    }

    async fn pull_image(&self, repo: &str, tag: &str) -> Result<(), EngineError> {
        let docker = self.client().await?;
        let opts = CreateImageOptions {
            from_image: repo.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };
        let mut stream = docker.create_image(Some(opts), None, None);
        while let Some(progress) = stream.next().await {
            let progress = progress?;
            if let Some(status) = progress.status {
                debug!("Pull {}:{}: {}", repo, tag, status);
            }
        }
        Ok(())
    }
}

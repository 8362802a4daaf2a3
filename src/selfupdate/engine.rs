//! Docker engine adapter for the self-update controller.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{ListContainersOptions, RestartContainerOptions};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::Docker;
use tokio_stream::StreamExt;
use tracing::debug;

use super::{ContainerEngine, Digest, ImageReference};

/// Engine client timeout in seconds.
pub const ENGINE_TIMEOUT_SECS: u64 = 120;

/// Container engine failures.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine API rejected the request or was unreachable.
    #[error("docker api error: {0}")]
    Api(#[from] BollardError),
    /// A pull progress event carried an error.
    #[error("pull error: {0}")]
    PullEvent(String),
    /// Generic engine failure.
    #[error("{0}")]
    Other(String),
}

/// [`ContainerEngine`] backed by the Docker API.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect to the engine's unix control socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be constructed.
    pub fn connect(socket_path: &str) -> Result<Self, EngineError> {
        let docker = Docker::connect_with_unix(
            socket_path,
            ENGINE_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )?;
        Ok(Self { docker })
    }

    /// Wrap an existing client.
    pub fn with_docker(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn local_digest(&self, image: &ImageReference) -> Result<Option<Digest>, EngineError> {
        let inspect = match self.docker.inspect_image(&image.fully_qualified()).await {
            Ok(inspect) => inspect,
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(image = %image, "image not present locally");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        Ok(digest_from_repo_digests(
            image,
            inspect.repo_digests.as_deref().unwrap_or_default(),
        ))
    }

    async fn pull(&self, image: &ImageReference) -> Result<(), EngineError> {
        let options = CreateImageOptions {
            from_image: image.name(),
            tag: image.tag.clone(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(event) = stream.next().await {
            let info = event?;
            if let Some(message) = info.error {
                return Err(EngineError::PullEvent(message));
            }
        }
        Ok(())
    }

    async fn find_container(&self, image: &ImageReference) -> Result<Option<String>, EngineError> {
        let options = ListContainersOptions {
            filters: HashMap::from([("ancestor".to_owned(), vec![image.fully_qualified()])]),
            ..Default::default()
        };

        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers.into_iter().find_map(|c| c.id))
    }

    async fn restart(&self, container_id: &str, grace_secs: u32) -> Result<(), EngineError> {
        let t = isize::try_from(grace_secs)
            .map_err(|_| EngineError::Other(format!("grace period too large: {grace_secs}")))?;
        self.docker
            .restart_container(container_id, Some(RestartContainerOptions { t }))
            .await?;
        Ok(())
    }
}

/// Pick the `host/repo@digest` entry for `image` and strip the prefix.
pub fn digest_from_repo_digests(
    image: &ImageReference,
    repo_digests: &[String],
) -> Option<Digest> {
    let prefix = format!("{}@", image.name());
    repo_digests
        .iter()
        .find_map(|entry| entry.strip_prefix(&prefix))
        .filter(|digest| !digest.is_empty())
        .map(Digest::new)
}

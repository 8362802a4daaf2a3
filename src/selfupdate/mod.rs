//! Container self-update controller.
//!
//! Each pass compares the registry's manifest digest for the configured
//! image with the digest of the locally pulled image. On a mismatch it
//! pulls the new image and restarts the container running it.
//!
//! Digest and pull failures leave the deployment untouched and are retried
//! on the next cycle. Failing to find or restart the target container after
//! a successful pull is terminal: [`UpdateError::is_terminal`] reports it
//! and the process boundary exits non-zero.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod engine;
pub mod registry;

pub use engine::{DockerEngine, EngineError};
pub use registry::{RegistryClient, RegistryError};

/// Tag used when an image reference names none.
pub const DEFAULT_TAG: &str = "latest";

// ---------------------------------------------------------------------------
// Image references and digests
// ---------------------------------------------------------------------------

/// Error parsing an [`ImageReference`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid image reference {input:?}: {reason}")]
pub struct ImageReferenceError {
    input: String,
    reason: &'static str,
}

/// A registry image: `host/repository:tag`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host, e.g. `ghcr.io`.
    pub registry: String,
    /// Repository path within the registry, e.g. `owner/app`.
    pub repository: String,
    /// Tag, e.g. `latest`.
    pub tag: String,
}

impl ImageReference {
    /// `host/repository`, the prefix of a repo digest.
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// `host/repository:tag`.
    pub fn fully_qualified(&self) -> String {
        format!("{}:{}", self.name(), self.tag)
    }

    /// Default registry API base URL.
    pub fn registry_base_url(&self) -> String {
        format!("https://{}", self.registry)
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.fully_qualified())
    }
}

impl FromStr for ImageReference {
    type Err = ImageReferenceError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let fail = |reason| ImageReferenceError {
            input: input.to_owned(),
            reason,
        };

        let trimmed = input.trim();
        if trimmed.contains('@') {
            return Err(fail("digest references are not supported"));
        }

        let (registry, rest) = trimmed
            .split_once('/')
            .ok_or_else(|| fail("missing registry host"))?;
        if registry.is_empty()
            || !(registry.contains('.') || registry.contains(':') || registry == "localhost")
        {
            return Err(fail("first component must be a registry host"));
        }

        let (repository, tag) = match rest.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo, tag),
            _ => (rest, DEFAULT_TAG),
        };
        if repository.is_empty() || repository.split('/').any(str::is_empty) {
            return Err(fail("empty repository path"));
        }
        if tag.is_empty() {
            return Err(fail("empty tag"));
        }

        Ok(Self {
            registry: registry.to_owned(),
            repository: repository.to_owned(),
            tag: tag.to_owned(),
        })
    }
}

/// A content digest such as `sha256:abc...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest(String);

impl Digest {
    /// Wrap a digest string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The digest string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Resolves the registry's current digest for an image.
#[async_trait]
pub trait DigestSource: Send + Sync {
    /// Current manifest digest for `image`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] on any non-200 response or missing digest.
    async fn remote_digest(
        &self,
        image: &ImageReference,
        cancel: &CancellationToken,
    ) -> Result<Digest, RegistryError>;
}

/// Local container engine operations.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Digest of the locally pulled image, or `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] for any failure other than "not found".
    async fn local_digest(&self, image: &ImageReference) -> Result<Option<Digest>, EngineError>;

    /// Pull `image`, draining the progress stream.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the request fails or an event carries an
    /// error.
    async fn pull(&self, image: &ImageReference) -> Result<(), EngineError>;

    /// First container whose image ancestry includes `image`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the listing fails.
    async fn find_container(&self, image: &ImageReference) -> Result<Option<String>, EngineError>;

    /// Restart a container, allowing `grace_secs` for a clean stop.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the restart is rejected.
    async fn restart(&self, container_id: &str, grace_secs: u32) -> Result<(), EngineError>;
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Result of a successful pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Local and remote digests matched.
    UpToDate,
    /// A new image was pulled and the container restarted.
    Restarted {
        /// Restarted container id.
        container_id: String,
    },
}

/// Digest comparison without side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateCheck {
    /// Registry digest.
    pub remote: Digest,
    /// Local digest, if the image is present.
    pub local: Option<Digest>,
}

impl UpdateCheck {
    /// True when the local image already matches the registry.
    pub fn is_current(&self) -> bool {
        self.local.as_ref() == Some(&self.remote)
    }
}

/// Why a pass did not complete.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    /// Remote digest could not be resolved.
    #[error("failed to resolve remote digest: {0}")]
    Registry(#[source] RegistryError),
    /// Local image could not be inspected.
    #[error("failed to inspect local image: {0}")]
    LocalDigest(#[source] EngineError),
    /// Pull request or stream failed.
    #[error("failed to pull image: {0}")]
    Pull(#[source] EngineError),
    /// Container listing failed after a successful pull.
    #[error("failed to list containers: {0}")]
    ListContainers(#[source] EngineError),
    /// Pull succeeded but no running container uses the image.
    #[error("pulled {image} but no container runs it; manual restart needed")]
    NoTargetContainer {
        /// Image that was pulled.
        image: String,
    },
    /// The target container could not be restarted.
    #[error("failed to restart container {container_id}: {source}")]
    RestartFailed {
        /// Target container id.
        container_id: String,
        /// Engine failure.
        #[source]
        source: EngineError,
    },
    /// The overall pass deadline elapsed before anything was pulled.
    #[error("self-update pass exceeded deadline of {0:?}")]
    DeadlineExceeded(Duration),
    /// The deadline elapsed after a successful pull, before the restart
    /// completed.
    #[error("pulled new image but restart did not complete within {0:?}")]
    RestartTimedOut(Duration),
}

impl UpdateError {
    /// True for failures that require the process to exit non-zero.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::NoTargetContainer { .. }
                | Self::RestartFailed { .. }
                | Self::RestartTimedOut(_)
        )
    }
}

/// Keeps the running container on the registry's latest image.
pub struct SelfUpdater {
    source: Arc<dyn DigestSource>,
    engine: Arc<dyn ContainerEngine>,
    image: ImageReference,
    deadline: Duration,
    restart_grace_secs: u32,
    cancel: CancellationToken,
}

impl std::fmt::Debug for SelfUpdater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfUpdater")
            .field("image", &self.image)
            .field("deadline", &self.deadline)
            .field("restart_grace_secs", &self.restart_grace_secs)
            .finish_non_exhaustive()
    }
}

impl SelfUpdater {
    /// Default overall pass deadline.
    pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(300);

    /// Default restart grace period in seconds.
    pub const DEFAULT_RESTART_GRACE_SECS: u32 = 10;

    /// Create a controller for `image`.
    pub fn new(
        source: Arc<dyn DigestSource>,
        engine: Arc<dyn ContainerEngine>,
        image: ImageReference,
    ) -> Self {
        Self {
            source,
            engine,
            image,
            deadline: Self::DEFAULT_DEADLINE,
            restart_grace_secs: Self::DEFAULT_RESTART_GRACE_SECS,
            cancel: CancellationToken::new(),
        }
    }

    /// Set the overall pass deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Set the restart grace period.
    #[must_use]
    pub fn with_restart_grace(mut self, secs: u32) -> Self {
        self.restart_grace_secs = secs;
        self
    }

    /// Use a parent token so shutdown aborts rate-limiter waits.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The image being tracked.
    pub fn image(&self) -> &ImageReference {
        &self.image
    }

    /// Compare digests without pulling.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Registry`], [`UpdateError::LocalDigest`], or
    /// [`UpdateError::DeadlineExceeded`].
    pub async fn check(&self) -> Result<UpdateCheck, UpdateError> {
        let cancel = self.cancel.child_token();
        let result = tokio::time::timeout(self.deadline, self.resolve(&cancel)).await;
        cancel.cancel();
        result.map_err(|_| UpdateError::DeadlineExceeded(self.deadline))?
    }

    /// Run one pass: compare digests, then pull and restart on a mismatch.
    ///
    /// The whole pass is bounded by the configured deadline; in-flight calls
    /// are dropped when it elapses. Elapsing after the pull finished is
    /// reported as [`UpdateError::RestartTimedOut`], which is terminal.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError`]; check [`UpdateError::is_terminal`] to decide
    /// whether the process must exit.
    pub async fn check_and_apply(&self) -> Result<UpdateOutcome, UpdateError> {
        info!(image = %self.image, "checking for image updates");

        let cancel = self.cancel.child_token();
        let pulled = AtomicBool::new(false);
        let result = tokio::time::timeout(self.deadline, self.apply(&cancel, &pulled)).await;
        cancel.cancel();

        let outcome = result.unwrap_or_else(|_| {
            if pulled.load(Ordering::Acquire) {
                Err(UpdateError::RestartTimedOut(self.deadline))
            } else {
                Err(UpdateError::DeadlineExceeded(self.deadline))
            }
        });
        match &outcome {
            Ok(UpdateOutcome::UpToDate) => info!(image = %self.image, "image is up to date"),
            Ok(UpdateOutcome::Restarted { container_id }) => {
                info!(container = %short_id(container_id), "container restarted on new image");
            }
            Err(e) if e.is_terminal() => error!(error = %e, "self-update failed terminally"),
            Err(e) => warn!(error = %e, "self-update pass failed, will retry next cycle"),
        }
        outcome
    }

    async fn resolve(&self, cancel: &CancellationToken) -> Result<UpdateCheck, UpdateError> {
        let remote = self
            .source
            .remote_digest(&self.image, cancel)
            .await
            .map_err(UpdateError::Registry)?;
        info!(digest = %remote, "remote digest");

        let local = self
            .engine
            .local_digest(&self.image)
            .await
            .map_err(UpdateError::LocalDigest)?;
        info!(
            digest = local.as_ref().map_or("<absent>", Digest::as_str),
            "local digest"
        );

        Ok(UpdateCheck { remote, local })
    }

    async fn apply(
        &self,
        cancel: &CancellationToken,
        pulled: &AtomicBool,
    ) -> Result<UpdateOutcome, UpdateError> {
        let check = self.resolve(cancel).await?;
        if check.is_current() {
            return Ok(UpdateOutcome::UpToDate);
        }

        info!(image = %self.image, "new image version detected, pulling");
        self.engine
            .pull(&self.image)
            .await
            .map_err(UpdateError::Pull)?;
        pulled.store(true, Ordering::Release);
        info!(image = %self.image, "pulled new image");

        let container_id = self
            .engine
            .find_container(&self.image)
            .await
            .map_err(UpdateError::ListContainers)?
            .ok_or_else(|| UpdateError::NoTargetContainer {
                image: self.image.fully_qualified(),
            })?;

        info!(
            container = %short_id(&container_id),
            grace_secs = self.restart_grace_secs,
            "restarting container"
        );
        self.engine
            .restart(&container_id, self.restart_grace_secs)
            .await
            .map_err(|source| UpdateError::RestartFailed {
                container_id: container_id.clone(),
                source,
            })?;

        Ok(UpdateOutcome::Restarted { container_id })
    }
}

/// First 12 characters of a container id, for logs.
fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

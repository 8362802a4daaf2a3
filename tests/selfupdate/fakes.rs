//! Recording fakes for the registry and container engine seams.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use guildsync::selfupdate::{
    ContainerEngine, Digest, DigestSource, EngineError, ImageReference, RegistryError,
};

/// Ordered log of engine and registry calls shared by both fakes.
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn calls(log: &CallLog) -> Vec<String> {
    log.lock().expect("call log lock").clone()
}

fn push(log: &CallLog, entry: impl Into<String>) {
    log.lock().expect("call log lock").push(entry.into());
}

/// Registry returning a fixed digest or failing.
pub struct FakeRegistry {
    pub digest: Option<String>,
    pub log: CallLog,
}

#[async_trait]
impl DigestSource for FakeRegistry {
    async fn remote_digest(
        &self,
        _image: &ImageReference,
        _cancel: &CancellationToken,
    ) -> Result<Digest, RegistryError> {
        push(&self.log, "remote_digest");
        self.digest
            .clone()
            .map(Digest::new)
            .ok_or(RegistryError::MissingDigest)
    }
}

/// Engine with scripted results for each call.
pub struct FakeEngine {
    pub local: Option<String>,
    pub pull_error: Option<String>,
    pub container: Option<String>,
    pub restart_fails: bool,
    pub restart_hangs: bool,
    pub log: CallLog,
}

impl FakeEngine {
    pub fn new(log: CallLog) -> Self {
        Self {
            local: None,
            pull_error: None,
            container: Some("0123456789abcdef0123".to_owned()),
            restart_fails: false,
            restart_hangs: false,
            log,
        }
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn local_digest(&self, _image: &ImageReference) -> Result<Option<Digest>, EngineError> {
        push(&self.log, "local_digest");
        Ok(self.local.clone().map(Digest::new))
    }

    async fn pull(&self, image: &ImageReference) -> Result<(), EngineError> {
        push(&self.log, format!("pull {image}"));
        match &self.pull_error {
            Some(message) => Err(EngineError::PullEvent(message.clone())),
            None => Ok(()),
        }
    }

    async fn find_container(&self, _image: &ImageReference) -> Result<Option<String>, EngineError> {
        push(&self.log, "find_container");
        Ok(self.container.clone())
    }

    async fn restart(&self, container_id: &str, grace_secs: u32) -> Result<(), EngineError> {
        push(&self.log, format!("restart {container_id} t={grace_secs}"));
        if self.restart_hangs {
            std::future::pending::<()>().await;
        }
        if self.restart_fails {
            return Err(EngineError::Other("container is dead".to_owned()));
        }
        Ok(())
    }
}

/// Engine whose digest lookup never completes.
pub struct HangingEngine;

#[async_trait]
impl ContainerEngine for HangingEngine {
    async fn local_digest(&self, _image: &ImageReference) -> Result<Option<Digest>, EngineError> {
        std::future::pending::<()>().await;
        Ok(None)
    }

    async fn pull(&self, _image: &ImageReference) -> Result<(), EngineError> {
        Ok(())
    }

    async fn find_container(&self, _image: &ImageReference) -> Result<Option<String>, EngineError> {
        Ok(None)
    }

    async fn restart(&self, _container_id: &str, _grace_secs: u32) -> Result<(), EngineError> {
        Ok(())
    }
}

pub fn image() -> ImageReference {
    "ghcr.io/guildsync/guildsync:latest"
        .parse()
        .expect("valid image reference")
}

//! Image pulls, routed through an external command for private registries.

use std::sync::Arc;

use log::info;
use regex::Regex;

use crate::error::EngineError;
use crate::runtime::ContainerRuntime;
use crate::types::ServiceSpec;

pub struct Puller {
    runtime: Arc<dyn ContainerRuntime>,
    private_registry: Option<Regex>,
    private_command: Vec<String>,
}

impl Puller {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        private_registry: Option<Regex>,
        private_command: Vec<String>,
    ) -> Self {
        Self {
            runtime,
            private_registry,
            private_command,
        }
    }

    fn is_private(&self, repo: &str) -> bool {
        !self.private_command.is_empty()
            && self
                .private_registry
                .as_ref()
                .is_some_and(|re| re.is_match(repo))
    }

    pub async fn pull(&self, spec: &ServiceSpec) -> Result<(), EngineError> {
        let image = spec.image_ref();
        if self.is_private(&spec.repo) {
            info!("Pulling {} through {:?}", image, self.private_command);
            let mut argv = self.private_command.clone();
            argv.push(image);
            self.runtime.run_command(&argv).await?;
        } else {
            info!("Pulling {}", image);
            self.runtime.pull_image(&spec.repo, spec.tag_or_latest()).await?;
        }
        Ok(())
    }
}

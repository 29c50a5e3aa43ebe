//! The reconciliation loop.
//!
//! One cycle runs LOAD, PULL, DETECT DRIFT, REMOVE, LAUNCH and PROPAGATE in
//! that order.  A stage that fails outright aborts the rest of the cycle;
//! per-service failures are logged and retried next cycle.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use log::{debug, info, warn};

use crate::error::{EngineError, LoadError};
use crate::gossip::Propagator;
use crate::loader::{read_definition, DefinitionDir};
use crate::pull::Puller;
use crate::runtime::{ContainerRuntime, RuntimeContainer};
use crate::store::{Flag, MergeSource, Store};

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub node_name: String,
    pub interval: Duration,
    /// Run the PULL stage every this many cycles; 0 disables it.
    pub pull_every: u64,
}

/// What one cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub loaded: Vec<String>,
    pub pulled: Vec<String>,
    pub removed: Vec<String>,
    pub launched: Vec<String>,
    pub peers_reached: usize,
}

pub struct Reconciler {
    store: Arc<Store>,
    definitions: DefinitionDir,
    runtime: Arc<dyn ContainerRuntime>,
    puller: Arc<Puller>,
    propagator: Arc<Propagator>,
    settings: ReconcilerSettings,
    cycle: u64,
}

impl Reconciler {
    pub fn new(
        store: Arc<Store>,
        definitions: DefinitionDir,
        runtime: Arc<dyn ContainerRuntime>,
        puller: Arc<Puller>,
        propagator: Arc<Propagator>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            store,
            definitions,
            runtime,
            puller,
            propagator,
            settings,
            cycle: 0,
        }
    }

    /// Runs cycles forever, sleeping `interval` after each one.
    pub async fn run(mut self) {
        info!(
            "Reconciling {} for node {} every {:?}",
            self.definitions.root().display(),
            self.settings.node_name,
            self.settings.interval
        );
        loop {
            match self.run_cycle().await {
                Ok(report) if report != CycleReport::default() => info!("Cycle done: {:?}", report),
                Ok(_) => {}
                Err(e) => warn!("Reconciliation cycle aborted: {:#}", e),
            }
            tokio::time::sleep(self.settings.interval).await;
        }
    }

    pub async fn run_cycle(&mut self) -> anyhow::Result<CycleReport> {
        let cycle = self.cycle;
        self.cycle += 1;

        let mut report = CycleReport {
            loaded: self.load().context("failed to load service definitions")?,
            ..Default::default()
        };
        if self.settings.pull_every > 0 && cycle % self.settings.pull_every == 0 {
            report.pulled = self.pull().await;
        }
        let running = self
            .detect_drift()
            .await
            .context("failed to inspect the container engine")?;
        report.removed = self.remove().await;
        report.launched = self.launch(&running, &report.removed).await;
        report.peers_reached = self.propagator.propagate(self.store.list()).await;
        Ok(report)
    }

    /// Reads every definition file and merges those selecting this node.
    fn load(&self) -> Result<Vec<String>, LoadError> {
        let mut accepted = Vec::new();
        for path in self.definitions.entries()? {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let spec = match read_definition(&path) {
                Ok(spec) => spec,
                Err(LoadError::UnknownExtension(_)) => {
                    if self.store.quarantine(&file_name) {
                        warn!("Service definition file has unknown extension: {}", file_name);
                    }
                    continue;
                }
                Err(e) => {
                    warn!("Skipping service definition: {}", e);
                    continue;
                }
            };
            if !self.store.selects(&spec, &self.settings.node_name) {
                debug!("{} does not select node {}", spec.name, self.settings.node_name);
                continue;
            }
            let name = spec.name.clone();
            match self.store.merge(spec, MergeSource::Definition) {
                Ok(true) => accepted.push(name),
                Ok(false) => {}
                Err(e) => warn!("Could not merge {}: {}", name, e),
            }
        }
        Ok(accepted)
    }

    async fn pull(&self) -> Vec<String> {
        let now = Instant::now();
        let mut pulled = Vec::new();
        for spec in self.store.list() {
            if !self.store.selects(&spec, &self.settings.node_name)
                || !self.store.pull_due(&spec, now)
            {
                continue;
            }
            match self.puller.pull(&spec).await {
                Ok(()) => {
                    self.store.mark_pulled(&spec.name, now);
                    pulled.push(spec.name);
                }
                Err(e) => warn!("Failed to pull {}: {}", spec.image_ref(), e),
            }
        }
        pulled
    }

    /// Flags specs whose running container drifted and returns the
    /// containers by name.
    async fn detect_drift(&self) -> Result<HashMap<String, RuntimeContainer>, EngineError> {
        let containers = self.runtime.list_containers().await?;
        let images = self.runtime.list_images().await?;

        let image_created: HashMap<&str, i64> = images
            .iter()
            .flat_map(|image| {
                image
                    .repo_tags
                    .iter()
                    .map(move |tag| (tag.as_str(), image.created))
            })
            .collect();
        let running: HashMap<String, RuntimeContainer> = containers
            .into_iter()
            .map(|c| (c.name.clone(), c))
            .collect();

        for spec in self.store.list() {
            let Some(container) = running.get(&spec.name) else {
                continue;
            };
            let fingerprint = spec.fingerprint();
            if container.fingerprint.as_deref() != Some(fingerprint.as_str()) {
                info!("Definition of {} changed", spec.name);
                self.store.flag(&spec.name, Flag::Changed);
            }
            let image = spec.image_ref();
            match image_created.get(image.as_str()) {
                Some(&created) if created > container.created => {
                    info!(
                        "Image {} is fresher than container {} ({} > {})",
                        image, spec.name, created, container.created
                    );
                    self.store.flag(&spec.name, Flag::Outdated);
                }
                Some(_) => {}
                None => debug!("No local image {} for container {}", image, spec.name),
            }
        }
        Ok(running)
    }

    /// Force-removes flagged containers, outdated ones first.  A flag is
    /// cleared only once its container is confirmed gone.
    async fn remove(&self) -> Vec<String> {
        let mut removed: Vec<String> = Vec::new();
        for flag in [Flag::Outdated, Flag::Changed] {
            for name in self.store.flagged(flag) {
                if removed.contains(&name) {
                    self.store.clear_flag(&name, flag);
                    continue;
                }
                info!("Removing container {} ({:?})", name, flag);
                match self.runtime.remove_container(&name, true).await {
                    Ok(()) => {
                        self.store.clear_flag(&name, flag);
                        removed.push(name);
                    }
                    Err(e) => warn!("Failed to remove container {}: {}", name, e),
                }
            }
        }
        removed
    }

    /// Launches every selected spec without a container.
    async fn launch(
        &self,
        running: &HashMap<String, RuntimeContainer>,
        removed: &[String],
    ) -> Vec<String> {
        let removed: HashSet<&str> = removed.iter().map(String::as_str).collect();
        let mut launched = Vec::new();
        for spec in self.store.list() {
            if running.contains_key(&spec.name) && !removed.contains(spec.name.as_str()) {
                continue;
            }
            if !self.store.selects(&spec, &self.settings.node_name) {
                continue;
            }
            let argv = spec.launch_command();
            info!("Launching {} with {:?}", spec.name, argv);
            match self.runtime.run_command(&argv).await {
                Ok(_) => launched.push(spec.name),
                Err(e) => warn!("Launch of {} failed: {}", spec.name, e),
            }
        }
        launched
    }
}

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use convoy::client::PeerClient;
use convoy::error::{EngineError, MembershipError};
use convoy::gossip::{Member, Membership, Propagator};
use convoy::loader::DefinitionDir;
use convoy::pull::Puller;
use convoy::reconciler::{Reconciler, ReconcilerSettings};
use convoy::runtime::{CommandOutput, ContainerRuntime, RuntimeContainer, RuntimeImage};
use convoy::store::{DefinitionWriter, Store};
use convoy::types::FINGERPRINT_LABEL;
use regex::Regex;

/// In-memory container engine.  `docker run --name X --label k=v` creates
/// a container named X carrying the label.
pub struct FakeRuntime {
    pub containers: Mutex<Vec<RuntimeContainer>>,
    pub images: Mutex<Vec<RuntimeImage>>,
    pub commands: Mutex<Vec<Vec<String>>>,
    pub removed: Mutex<Vec<String>>,
    pub pulled: Mutex<Vec<String>>,
    pub fail_remove: Mutex<HashSet<String>>,
    pub fail_list: AtomicBool,
    clock: AtomicI64,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self {
            containers: Mutex::new(Vec::new()),
            images: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            pulled: Mutex::new(Vec::new()),
            fail_remove: Mutex::new(HashSet::new()),
            fail_list: AtomicBool::new(false),
            clock: AtomicI64::new(1_000),
        }
    }
}

impl FakeRuntime {
    /// Advances the fake clock and returns the new time.
    pub fn tick(&self) -> i64 {
        self.clock.fetch_add(10, Ordering::SeqCst) + 10
    }

    pub fn add_image(&self, repo_tag: &str, created: i64) {
        self.images.lock().unwrap().push(RuntimeImage {
            repo_tags: vec![repo_tag.to_string()],
            created,
        });
    }

    pub fn container(&self, name: &str) -> Option<RuntimeContainer> {
        self.containers
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_containers(&self) -> Result<Vec<RuntimeContainer>, EngineError> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(EngineError::CommandFailed {
                program: "docker".into(),
                code: Some(1),
                stderr: "engine unavailable".into(),
            });
        }
        Ok(self.containers.lock().unwrap().clone())
    }

    async fn list_images(&self) -> Result<Vec<RuntimeImage>, EngineError> {
        Ok(self.images.lock().unwrap().clone())
    }

    async fn remove_container(&self, name: &str, _force: bool) -> Result<(), EngineError> {
        if self.fail_remove.lock().unwrap().contains(name) {
            return Err(EngineError::CommandFailed {
                program: "docker".into(),
                code: Some(1),
                stderr: format!("cannot remove {}", name),
            });
        }
        self.containers.lock().unwrap().retain(|c| c.name != name);
        self.removed.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn run_command(&self, argv: &[String]) -> Result<CommandOutput, EngineError> {
        self.commands.lock().unwrap().push(argv.to_vec());
        let value_after = |flag: &str| {
            argv.iter()
                .position(|a| a == flag)
                .and_then(|i| argv.get(i + 1))
                .cloned()
        };
        if let Some(name) = value_after("--name") {
            let fingerprint = value_after("--label").and_then(|label| {
                label
                    .strip_prefix(&format!("{}=", FINGERPRINT_LABEL))
                    .map(str::to_string)
            });
            let created = self.tick();
            self.containers.lock().unwrap().push(RuntimeContainer {
                name,
                fingerprint,
                created,
            });
        }
        Ok(CommandOutput::default())
    }

    async fn pull_image(&self, repo: &str, tag: &str) -> Result<(), EngineError> {
        self.pulled.lock().unwrap().push(format!("{}:{}", repo, tag));
        Ok(())
    }
}

/// A membership view that never changes.
pub struct FixedMembership(pub Vec<Member>);

#[async_trait]
impl Membership for FixedMembership {
    async fn join(&self, _seed: &str) -> Result<(), MembershipError> {
        Ok(())
    }

    fn members(&self) -> Vec<Member> {
        self.0.clone()
    }
}

pub fn member(id: &str, port: u16) -> Member {
    Member {
        id: id.to_string(),
        address: "127.0.0.1".to_string(),
        port,
    }
}

pub fn client() -> PeerClient {
    PeerClient::new(Duration::from_secs(2), None).unwrap()
}

pub fn puller(runtime: Arc<FakeRuntime>) -> Arc<Puller> {
    Arc::new(Puller::new(
        runtime,
        Some(Regex::new(r"^([a-z]+\.)?gcr\.io/").unwrap()),
        vec!["gcloud".into(), "docker".into(), "--".into(), "pull".into()],
    ))
}

pub struct Node {
    pub reconciler: Reconciler,
    pub store: Arc<Store>,
    pub runtime: Arc<FakeRuntime>,
}

/// A single node reconciling `dir` with no peers.
pub fn node(dir: &Path, node_name: &str, pull_every: u64) -> Node {
    let definitions = DefinitionDir::new(dir);
    let writer: Arc<dyn DefinitionWriter> = Arc::new(definitions.clone());
    let store = Arc::new(Store::new(Some(writer)));
    let runtime = Arc::new(FakeRuntime::default());
    let membership = Arc::new(FixedMembership(vec![member(node_name, 1)]));
    let propagator = Arc::new(Propagator::new(node_name.to_string(), membership, client()));
    let reconciler = Reconciler::new(
        store.clone(),
        definitions,
        runtime.clone(),
        puller(runtime.clone()),
        propagator,
        ReconcilerSettings {
            node_name: node_name.to_string(),
            interval: Duration::from_millis(10),
            pull_every,
        },
    );
    Node {
        reconciler,
        store,
        runtime,
    }
}

/// Writes a YAML definition and pushes its mtime `age_secs` into the future
/// so successive edits are strictly fresher.
pub fn write_definition(dir: &Path, name: &str, template: &str, repo: &str, tag: &str, age_secs: u64) {
    write_definition_with(dir, name, template, repo, tag, "", age_secs);
}

pub fn write_definition_with(
    dir: &Path,
    name: &str,
    template: &str,
    repo: &str,
    tag: &str,
    node_selector: &str,
    age_secs: u64,
) {
    let path = dir.join(format!("{}.yml", name));
    let contents = format!(
        "name: {}\nbash_template: {}\nrepo: {}\ntag: \"{}\"\nnode_selector: \"{}\"\n",
        name, template, repo, tag, node_selector
    );
    std::fs::write(&path, contents).unwrap();
    let file = std::fs::File::options().write(true).open(&path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(age_secs))
        .unwrap();
}

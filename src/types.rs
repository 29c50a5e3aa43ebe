//! Data structures used throughout the convoy daemon.
//!
//! A [`ServiceSpec`] is the unit of desired state.  It is read from a
//! definition file on disk, merged into the store, and shipped to peers
//! as base64-encoded JSON.  Only the behaviour-affecting fields take part
//! in the [`Fingerprint`]; propagation metadata (`origin`,
//! `last_updated`) never does.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SpecError;

/// Container label carrying the fingerprint a container was launched with.
pub const FINGERPRINT_LABEL: &str = "convoy.fingerprint";

/// Content hash over `bash_template + repo + tag + node_selector`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The desired state of one service, as held in the store and sent to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    /// Invocation used to launch the workload, e.g. `docker run -p 80:80 myrepo/app`.
    pub bash_template: String,
    pub repo: String,
    #[serde(default)]
    pub tag: String,
    /// Regular expression matched against the local node name.
    #[serde(default)]
    pub node_selector: String,
    /// Minimum seconds between proactive pulls of this spec's image.
    #[serde(default)]
    pub pull_interval: u64,
    /// Node that most recently pushed this spec; `None` for local definitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default)]
    pub last_updated: DateTime<Utc>,
}

impl ServiceSpec {
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(self.bash_template.as_bytes());
        hasher.update(self.repo.as_bytes());
        hasher.update(self.tag.as_bytes());
        hasher.update(self.node_selector.as_bytes());
        Fingerprint(hex::encode(hasher.finalize()))
    }

    /// Checks the spec and returns its compiled node selector.
    pub fn validate(&self) -> Result<Regex, SpecError> {
        if self.name.is_empty() {
            return Err(SpecError::EmptyName);
        }
        if self.name.contains(['/', '\\']) || self.name == "." || self.name == ".." {
            return Err(SpecError::InvalidName(self.name.clone()));
        }
        if self.repo.is_empty() {
            return Err(SpecError::EmptyRepo(self.name.clone()));
        }
        if !self.bash_template.contains(&self.repo) {
            return Err(SpecError::TemplateMissingRepo {
                name: self.name.clone(),
                repo: self.repo.clone(),
            });
        }
        if self.bash_template.split_whitespace().count() < 2 {
            return Err(SpecError::TemplateTooShort(self.name.clone()));
        }
        Regex::new(&self.node_selector).map_err(|source| SpecError::InvalidSelector {
            name: self.name.clone(),
            source,
        })
    }

    pub fn tag_or_latest(&self) -> &str {
        if self.tag.is_empty() {
            "latest"
        } else {
            &self.tag
        }
    }

    /// `repo:tag` as the engine indexes it.
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.repo, self.tag_or_latest())
    }

    /// Builds the concrete argv that launches this service.
    ///
    /// The image reference inside the template is re-tagged with `tag`, and
    /// the container name and fingerprint label are inserted right after the
    /// engine subcommand (`docker run`).
    pub fn launch_command(&self) -> Vec<String> {
        let mut argv: Vec<String> = self
            .bash_template
            .split_whitespace()
            .map(|token| self.retag(token))
            .collect();
        let rest = argv.split_off(argv.len().min(2));
        argv.extend([
            "--name".to_string(),
            self.name.clone(),
            "-d".to_string(),
            "--label".to_string(),
            format!("{}={}", FINGERPRINT_LABEL, self.fingerprint()),
        ]);
        argv.extend(rest);
        argv
    }

    fn retag(&self, token: &str) -> String {
        let Some(start) = token.find(&self.repo) else {
            return token.to_string();
        };
        let end = start + self.repo.len();
        let suffix = &token[end..];
        // Something like `myrepo/app-worker` is a different image.
        if !(suffix.is_empty() || suffix.starts_with(':') || suffix.starts_with('@')) {
            return token.to_string();
        }
        if self.tag.is_empty() {
            return token.to_string();
        }
        format!("{}:{}", &token[..end], self.tag)
    }

    /// Wire form used between peers: base64 of the JSON document.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        Ok(STANDARD.encode(serde_json::to_vec(self)?))
    }

    pub fn decode(blob: &str) -> Result<Self, SpecError> {
        let raw = STANDARD.decode(blob.trim())?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

/// The on-disk record.  Propagation metadata is deliberately absent: the
/// file's modification time is its freshness marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    pub name: String,
    pub bash_template: String,
    pub repo: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub node_selector: String,
    #[serde(default)]
    pub pull_interval: u64,
}

impl Definition {
    pub fn into_spec(self, last_updated: DateTime<Utc>) -> ServiceSpec {
        ServiceSpec {
            name: self.name,
            bash_template: self.bash_template,
            repo: self.repo,
            tag: self.tag,
            node_selector: self.node_selector,
            pull_interval: self.pull_interval,
            origin: None,
            last_updated,
        }
    }
}

impl From<&ServiceSpec> for Definition {
    fn from(spec: &ServiceSpec) -> Self {
        Self {
            name: spec.name.clone(),
            bash_template: spec.bash_template.clone(),
            repo: spec.repo.clone(),
            tag: spec.tag.clone(),
            node_selector: spec.node_selector.clone(),
            pull_interval: spec.pull_interval,
        }
    }
}

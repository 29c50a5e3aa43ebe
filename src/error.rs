//! Error types shared across the daemon.

use std::path::PathBuf;

use thiserror::Error;

/// A service definition that cannot be accepted.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("service name is empty")]
    EmptyName,

    #[error("service name {0:?} contains a path separator")]
    InvalidName(String),

    #[error("service {0} has an empty repo")]
    EmptyRepo(String),

    #[error("service {name} bash template does not contain repo {repo}")]
    TemplateMissingRepo { name: String, repo: String },

    #[error("service {0} bash template needs at least an engine and a subcommand")]
    TemplateTooShort(String),

    #[error("service {name} has an invalid node selector: {source}")]
    InvalidSelector {
        name: String,
        #[source]
        source: regex::Error,
    },

    #[error("malformed base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("malformed service JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure reading or writing a definition file.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read definition directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown definition file extension: {0}")]
    UnknownExtension(PathBuf),

    #[error("cannot parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("file {path} declares service {name}, expected the file base name to match")]
    NameMismatch { path: PathBuf, name: String },

    #[error("{path}: {source}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: SpecError,
    },
}

/// Errors from the container engine or launched commands.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("empty command")]
    EmptyCommand,

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command {program} exited with {code:?}: {stderr}")]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Errors from the Desired-State Store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Invalid(#[from] SpecError),

    #[error("failed to persist service definition: {0}")]
    Persist(#[from] LoadError),
}

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("cannot resolve seed {seed}: {message}")]
    Resolve { seed: String, message: String },

    #[error("gossip socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot encode member digest: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failures talking to another node's control API.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered with status {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("{url} answered with malformed JSON: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot encode service {name}: {source}")]
    Encode {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

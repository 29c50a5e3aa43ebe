//! Runtime Inspector: the container engine as seen by the reconciler.

use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

use crate::error::EngineError;

pub mod docker;
pub use docker::DockerRuntime;

/// A container observed on this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContainer {
    pub name: String,
    /// Fingerprint label stamped at launch, if any.
    pub fingerprint: Option<String>,
    /// Creation time, seconds since the epoch.
    pub created: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeImage {
    pub repo_tags: Vec<String>,
    pub created: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// All containers, running or not.
    async fn list_containers(&self) -> Result<Vec<RuntimeContainer>, EngineError>;

    async fn list_images(&self) -> Result<Vec<RuntimeImage>, EngineError>;

    /// Removing a container that does not exist is not an error.
    async fn remove_container(&self, name: &str, force: bool) -> Result<(), EngineError>;

    /// Runs `argv` to completion; a non-zero exit is an error.
    async fn run_command(&self, argv: &[String]) -> Result<CommandOutput, EngineError>;

    async fn pull_image(&self, repo: &str, tag: &str) -> Result<(), EngineError>;
}

/// Spawns `argv` as a child process and collects its output.
pub async fn execute(argv: &[String]) -> Result<CommandOutput, EngineError> {
    let (program, args) = argv.split_first().ok_or(EngineError::EmptyCommand)?;
    debug!("Executing {:?}", argv);
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| EngineError::Spawn {
            program: program.clone(),
            source,
        })?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !output.status.success() {
        return Err(EngineError::CommandFailed {
            program: program.clone(),
            code: output.status.code(),
            stderr: if stderr.is_empty() { stdout } else { stderr },
        });
    }
    Ok(CommandOutput { stdout, stderr })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn execute_reports_exit_status() {
        let ok = execute(&["sh".into(), "-c".into(), "echo hi".into()])
            .await
            .unwrap();
        assert_eq!(ok.stdout.trim(), "hi");

        let failed = execute(&["sh".into(), "-c".into(), "echo boom >&2; exit 3".into()]).await;
        match failed {
            Err(EngineError::CommandFailed { code, stderr, .. }) => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr.trim(), "boom");
            }
            other => panic!("unexpected result: {:?}", other),
        }

        assert!(matches!(execute(&[]).await, Err(EngineError::EmptyCommand)));
    }
}

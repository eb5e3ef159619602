//! Image build and sandboxed container runs through the docker CLI.

use crate::error::{Result, RuntimeError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// File that must sit at the root of every algorithm bundle.
pub const BUILD_DESCRIPTOR: &str = "Dockerfile";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub docker_bin: String,
    pub memory_bytes: u64,
    /// CPU quota in billionths of a CPU.
    pub nano_cpus: u64,
    pub stop_timeout_secs: u64,
    /// Largest build context accepted, in bytes.
    pub build_size_limit: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            memory_bytes: 1 << 30,
            nano_cpus: 1_000_000_000,
            stop_timeout_secs: 10,
            build_size_limit: 100 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    pub fn read_only(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code was zero.
    pub success: bool,
}

#[async_trait]
pub trait ContainerRunner: Send + Sync {
    /// Build `image` from `source_dir`, which must hold a build descriptor.
    async fn build_image(&self, source_dir: &Path, image: &str) -> Result<()>;

    /// Run `image` to completion. The container is always stopped and removed
    /// before this returns.
    async fn run_container(
        &self,
        image: &str,
        env: &[(String, String)],
        mounts: &[Mount],
    ) -> Result<ContainerOutput>;
}

pub struct DockerCliRunner {
    config: ContainerConfig,
}

impl DockerCliRunner {
    pub fn new(config: ContainerConfig) -> Self {
        Self { config }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.docker_bin);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn docker(&self, args: &[String]) -> Result<std::process::Output> {
        debug!(args = ?args, "🐳 docker");
        self.command()
            .args(args)
            .output()
            .await
            .map_err(|e| RuntimeError::Container(format!("failed to spawn docker: {}", e)))
    }

    async fn docker_ok(&self, args: &[String]) -> Result<String> {
        let output = self.docker(args).await?;
        if !output.status.success() {
            return Err(RuntimeError::Container(format!(
                "docker {} exited with {}: {}",
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn create_args(&self, image: &str, env: &[(String, String)], mounts: &[Mount]) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--memory".to_string(),
            self.config.memory_bytes.to_string(),
            "--cpus".to_string(),
            format!("{:.3}", self.config.nano_cpus as f64 / 1e9),
            "--security-opt".to_string(),
            "no-new-privileges".to_string(),
        ];
        for (key, value) in env {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }
        for mount in mounts {
            let mut spec = format!(
                "type=bind,source={},target={}",
                mount.source.display(),
                mount.target
            );
            if mount.read_only {
                spec.push_str(",readonly");
            }
            args.push("--mount".to_string());
            args.push(spec);
        }
        args.push(image.to_string());
        args
    }

    async fn run_created(&self, id: &str) -> Result<ContainerOutput> {
        self.docker_ok(&["start".to_string(), id.to_string()]).await?;

        let code = self.docker_ok(&["wait".to_string(), id.to_string()]).await?;
        let code: i64 = code
            .lines()
            .last()
            .unwrap_or_default()
            .trim()
            .parse()
            .map_err(|_| RuntimeError::Container(format!("unexpected wait output {:?}", code)))?;

        let logs = self.docker(&["logs".to_string(), id.to_string()]).await?;
        if !logs.status.success() {
            return Err(RuntimeError::Container(format!(
                "failed to read logs of {}",
                id
            )));
        }

        Ok(ContainerOutput {
            stdout: String::from_utf8_lossy(&logs.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&logs.stderr).into_owned(),
            success: code == 0,
        })
    }
}

#[async_trait]
impl ContainerRunner for DockerCliRunner {
    async fn build_image(&self, source_dir: &Path, image: &str) -> Result<()> {
        if !source_dir.join(BUILD_DESCRIPTOR).is_file() {
            return Err(RuntimeError::MissingBuildDescriptor(
                source_dir.display().to_string(),
            ));
        }
        let size = context_size(source_dir.to_path_buf()).await?;
        if size > self.config.build_size_limit {
            return Err(RuntimeError::BuildFailed(format!(
                "build context is {} bytes, limit is {}",
                size, self.config.build_size_limit
            )));
        }

        info!(image, dir = %source_dir.display(), bytes = size, "🔨 Building image");
        let args = vec![
            "build".to_string(),
            "--no-cache".to_string(),
            "--rm".to_string(),
            "--force-rm".to_string(),
            "-f".to_string(),
            source_dir.join(BUILD_DESCRIPTOR).display().to_string(),
            "-t".to_string(),
            image.to_string(),
            source_dir.display().to_string(),
        ];
        let output = self.docker(&args).await?;
        if !output.status.success() {
            return Err(RuntimeError::BuildFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        info!(image, "✅ Image built");
        Ok(())
    }

    async fn run_container(
        &self,
        image: &str,
        env: &[(String, String)],
        mounts: &[Mount],
    ) -> Result<ContainerOutput> {
        let id = self.docker_ok(&self.create_args(image, env, mounts)).await?;
        info!(image, container = %id, "🐳 Created container");

        let mut guard = ContainerGuard::new(&self.config, id.clone());
        let result = self.run_created(&id).await;
        guard.cleanup().await;
        result
    }
}

/// Stops and removes a container when the run ends, however it ends.
///
/// The normal path awaits [`ContainerGuard::cleanup`]. If the run future is
/// dropped first, `Drop` hands the cleanup to a detached task.
struct ContainerGuard {
    docker_bin: String,
    stop_timeout_secs: u64,
    id: Option<String>,
}

impl ContainerGuard {
    fn new(config: &ContainerConfig, id: String) -> Self {
        Self {
            docker_bin: config.docker_bin.clone(),
            stop_timeout_secs: config.stop_timeout_secs,
            id: Some(id),
        }
    }

    async fn cleanup(&mut self) {
        if let Some(id) = self.id.take() {
            remove_container(&self.docker_bin, self.stop_timeout_secs, &id).await;
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            let docker_bin = self.docker_bin.clone();
            let timeout = self.stop_timeout_secs;
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        remove_container(&docker_bin, timeout, &id).await;
                    });
                }
                Err(_) => warn!(container = %id, "No runtime left to remove container"),
            }
        }
    }
}

async fn remove_container(docker_bin: &str, stop_timeout_secs: u64, id: &str) {
    let stop = Command::new(docker_bin)
        .args(["stop", "-t", &stop_timeout_secs.to_string(), id])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = stop {
        warn!(container = %id, error = %e, "Failed to stop container");
    }

    let rm = Command::new(docker_bin)
        .args(["rm", "-f", "-v", id])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match rm {
        Ok(status) if status.success() => debug!(container = %id, "🧹 Removed container"),
        Ok(status) => warn!(container = %id, %status, "Container removal reported failure"),
        Err(e) => warn!(container = %id, error = %e, "Failed to remove container"),
    }
}

/// Total size of regular files under `dir`.
async fn context_size(dir: PathBuf) -> Result<u64> {
    tokio::task::spawn_blocking(move || walk_size(&dir))
        .await
        .map_err(|e| RuntimeError::BuildFailed(e.to_string()))?
}

fn walk_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += walk_size(&entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

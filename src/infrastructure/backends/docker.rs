//! Docker backend.
//!
//! Shells out to the docker CLI: one container per job, the build script
//! copied in and executed through `docker exec` with its output streamed
//! live. `docker rm -f` is the converging teardown.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::errors::ProviderError;
use crate::domain::models::ProviderConfig;
use crate::domain::ports::{Instance, Provider, RunResult, StartAttributes};
use crate::infrastructure::retry::RetryPolicy;

use super::stream_child;

/// Recognized `PROVIDER_CONFIG_*` options.
pub const OPTIONS: &[(&str, &str)] = &[
    ("IMAGE", "default image to run builds in"),
    ("DOCKER_PATH", "path to the docker CLI executable"),
    ("MEMORY", "memory limit per container (e.g. 4g)"),
    ("CPUS", "cpu limit per container"),
];

const SCRIPT_PATH: &str = "/tmp/build.sh";
const READY_RETRIES: u32 = 10;
const READY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct DockerSettings {
    docker_path: String,
    image: String,
    memory: Option<String>,
    cpus: Option<String>,
}

pub struct DockerProvider {
    settings: DockerSettings,
}

impl DockerProvider {
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            settings: DockerSettings {
                docker_path: config.get("DOCKER_PATH").unwrap_or("docker").to_string(),
                image: config.get("IMAGE").unwrap_or("ubuntu:22.04").to_string(),
                memory: config.get("MEMORY").map(str::to_string),
                cpus: config.get("CPUS").map(str::to_string),
            },
        })
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.settings.docker_path);
        cmd.kill_on_drop(true);
        cmd
    }

    async fn remove_container(&self, name: &str) -> Result<(), ProviderError> {
        remove_container(&self.settings.docker_path, name).await
    }
}

async fn remove_container(docker_path: &str, name: &str) -> Result<(), ProviderError> {
    let output = Command::new(docker_path)
        .args(["rm", "-f", name])
        .output()
        .await
        .map_err(|e| ProviderError::StopFailed(e.to_string()))?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    // Already gone counts as converged.
    if stderr.contains("No such container") {
        return Ok(());
    }
    Err(ProviderError::StopFailed(stderr.into_owned()))
}

#[async_trait]
impl Provider for DockerProvider {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn setup(&self, _token: &CancellationToken) -> Result<(), ProviderError> {
        let output = self
            .command()
            .args(["version", "--format", "{{.Server.Version}}"])
            .output()
            .await
            .map_err(|e| ProviderError::NotConfigured(format!("docker CLI not runnable: {e}")))?;

        if !output.status.success() {
            return Err(ProviderError::NotConfigured(format!(
                "docker daemon unreachable: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        debug!(
            version = %String::from_utf8_lossy(&output.stdout).trim(),
            "docker daemon ready"
        );
        Ok(())
    }

    async fn start(
        &self,
        token: &CancellationToken,
        attrs: &StartAttributes,
    ) -> Result<Box<dyn Instance>, ProviderError> {
        if token.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        let began = Instant::now();
        let name = format!(
            "kiln-job-{}-{}",
            attrs.job_id,
            Uuid::new_v4().simple().to_string().chars().take(8).collect::<String>()
        );
        let image = attrs
            .image_name
            .clone()
            .unwrap_or_else(|| self.settings.image.clone());

        let mut cmd = self.command();
        cmd.args(["run", "-d", "--name", &name]);
        if let Some(ref memory) = self.settings.memory {
            cmd.args(["--memory", memory]);
        }
        if let Some(ref cpus) = self.settings.cpus {
            cmd.args(["--cpus", cpus]);
        }
        cmd.args([image.as_str(), "sleep", "infinity"]);

        debug!(container = %name, image = %image, "creating container");
        let output = cmd
            .output()
            .await
            .map_err(|e| ProviderError::ProvisionFailed(e.to_string()))?;

        if !output.status.success() {
            return Err(ProviderError::ProvisionFailed(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }

        // The container starts quickly, but probe it so a crashed
        // entrypoint surfaces here and not inside the build.
        let policy = RetryPolicy::new(READY_RETRIES, READY_INTERVAL);
        let docker_path = self.settings.docker_path.clone();
        let probe_name = name.clone();
        let ready = policy
            .run(token, |attempt| {
                let docker_path = docker_path.clone();
                let name = probe_name.clone();
                async move {
                    debug!(container = %name, attempt, "probing container");
                    let status = Command::new(&docker_path)
                        .args(["exec", &name, "true"])
                        .stdout(Stdio::null())
                        .stderr(Stdio::null())
                        .status()
                        .await
                        .map_err(|e| ProviderError::Transient(e.to_string()))?;
                    if status.success() {
                        Ok(())
                    } else {
                        Err(ProviderError::Transient("container not ready".to_string()))
                    }
                }
            })
            .await;

        if let Err(e) = ready {
            info!(container = %name, "cleaning up container after failed start");
            let _ = self.remove_container(&name).await;
            return Err(e.into());
        }

        info!(container = %name, image = %image, "container ready");

        Ok(Box::new(DockerInstance {
            settings: self.settings.clone(),
            name,
            image,
            startup_duration: began.elapsed(),
        }))
    }
}

pub struct DockerInstance {
    settings: DockerSettings,
    name: String,
    image: String,
    startup_duration: Duration,
}

#[async_trait]
impl Instance for DockerInstance {
    async fn upload_script(
        &self,
        token: &CancellationToken,
        script: &[u8],
    ) -> Result<(), ProviderError> {
        if token.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        // Piping through `tee` avoids a temp file on the host.
        let mut child = Command::new(&self.settings.docker_path)
            .args(["exec", "-i", &self.name, "tee", SCRIPT_PATH])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::UploadFailed(e.to_string()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProviderError::UploadFailed("no stdin handle".to_string()))?;
        stdin
            .write_all(script)
            .await
            .map_err(|e| ProviderError::UploadFailed(e.to_string()))?;
        drop(stdin);

        let status = tokio::select! {
            _ = token.cancelled() => return Err(ProviderError::Cancelled),
            status = child.wait() => status.map_err(|e| ProviderError::UploadFailed(e.to_string()))?,
        };
        if !status.success() {
            return Err(ProviderError::UploadFailed(format!(
                "tee exited with {status}"
            )));
        }

        let chmod = Command::new(&self.settings.docker_path)
            .args(["exec", &self.name, "chmod", "+x", SCRIPT_PATH])
            .output()
            .await
            .map_err(|e| ProviderError::UploadFailed(e.to_string()))?;
        if !chmod.status.success() {
            return Err(ProviderError::UploadFailed(
                String::from_utf8_lossy(&chmod.stderr).into_owned(),
            ));
        }

        Ok(())
    }

    async fn run_script(
        &self,
        token: &CancellationToken,
        output: mpsc::Sender<Vec<u8>>,
    ) -> Result<RunResult, ProviderError> {
        let child = Command::new(&self.settings.docker_path)
            .args(["exec", &self.name, "/bin/bash", SCRIPT_PATH])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::ExecutionFailed(e.to_string()))?;

        let status = stream_child(token, child, output).await?;

        Ok(RunResult {
            completed: true,
            exit_code: status.code().unwrap_or(-1),
        })
    }

    async fn stop(&self, token: &CancellationToken) -> Result<(), ProviderError> {
        if token.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        debug!(container = %self.name, "removing container");
        remove_container(&self.settings.docker_path, &self.name).await
    }

    fn id(&self) -> String {
        self.name.clone()
    }

    fn image_name(&self) -> String {
        self.image.clone()
    }

    fn startup_duration(&self) -> Duration {
        self.startup_duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_defaults() {
        let provider = DockerProvider::from_config(&ProviderConfig::default()).unwrap();
        assert_eq!(provider.settings.docker_path, "docker");
        assert_eq!(provider.settings.image, "ubuntu:22.04");
        assert!(provider.settings.memory.is_none());
    }

    #[test]
    fn test_from_config_overrides() {
        let mut values = std::collections::HashMap::new();
        values.insert("IMAGE".to_string(), "debian:12".to_string());
        values.insert("MEMORY".to_string(), "4g".to_string());
        let provider = DockerProvider::from_config(&ProviderConfig::new(values)).unwrap();

        assert_eq!(provider.settings.image, "debian:12");
        assert_eq!(provider.settings.memory.as_deref(), Some("4g"));
    }
}

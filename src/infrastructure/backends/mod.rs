//! Provider backends and their registry.
//!
//! Backends register under a short name with a display name, the map of
//! configuration options they recognize, and a constructor taking the
//! flat `ProviderConfig`. The daemon looks its backend up by
//! `PROVIDER_NAME` and warns about unrecognized options.

pub mod docker;
pub mod mock;
pub mod vpc;

use std::process::ExitStatus;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::domain::errors::ProviderError;
use crate::domain::models::ProviderConfig;
use crate::domain::ports::Provider;

pub use docker::DockerProvider;
pub use mock::{MockBehavior, MockProvider};
pub use vpc::VpcProvider;

type ProviderCtor = fn(&ProviderConfig) -> Result<Arc<dyn Provider>, ProviderError>;

/// Registry entry for one backend.
pub struct ProviderInfo {
    pub name: &'static str,
    pub display_name: &'static str,
    /// Recognized `PROVIDER_CONFIG_*` keys with a human-readable purpose.
    pub options: &'static [(&'static str, &'static str)],
    ctor: ProviderCtor,
}

/// Lookup table of available backends.
pub struct ProviderRegistry {
    entries: Vec<ProviderInfo>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            entries: vec![
                ProviderInfo {
                    name: "docker",
                    display_name: "Local Docker containers",
                    options: docker::OPTIONS,
                    ctor: |cfg| Ok(Arc::new(DockerProvider::from_config(cfg)?)),
                },
                ProviderInfo {
                    name: "vpc",
                    display_name: "Cloud Virtual Servers for VPC",
                    options: vpc::OPTIONS,
                    ctor: |cfg| Ok(Arc::new(VpcProvider::from_config(cfg)?)),
                },
                ProviderInfo {
                    name: "mock",
                    display_name: "In-process mock backend",
                    options: &[],
                    ctor: |_| Ok(Arc::new(MockProvider::new())),
                },
            ],
        }
    }

    pub fn info(&self, name: &str) -> Option<&ProviderInfo> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn entries(&self) -> &[ProviderInfo] {
        &self.entries
    }

    /// Construct the named backend.
    pub fn create(
        &self,
        name: &str,
        config: &ProviderConfig,
    ) -> Result<Arc<dyn Provider>, ProviderError> {
        let entry = self
            .info(name)
            .ok_or_else(|| ProviderError::UnknownProvider(name.to_string()))?;
        (entry.ctor)(config)
    }

    /// Warn about `PROVIDER_CONFIG_*` keys the selected backend does not
    /// recognize.
    pub fn warn_unknown_options(&self, name: &str, config: &ProviderConfig) {
        let Some(entry) = self.info(name) else {
            return;
        };
        for key in config.keys() {
            if !entry.options.iter().any(|(known, _)| *known == key) {
                warn!(
                    provider = name,
                    option = key,
                    "unrecognized provider option, ignoring"
                );
            }
        }
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Pump a child's stdout+stderr into the output channel and wait for it,
/// killing the child if the token fires first.
pub(crate) async fn stream_child(
    token: &CancellationToken,
    mut child: Child,
    output: mpsc::Sender<Vec<u8>>,
) -> Result<ExitStatus, ProviderError> {
    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump(stdout, output.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump(stderr, output.clone())));
    }
    drop(output);

    tokio::select! {
        status = child.wait() => {
            for pump in pumps {
                let _ = pump.await;
            }
            status.map_err(|e| ProviderError::ExecutionFailed(e.to_string()))
        }
        _ = token.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            for pump in pumps {
                pump.abort();
            }
            Err(ProviderError::Cancelled)
        }
    }
}

async fn pump(mut reader: impl tokio::io::AsyncRead + Unpin, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let registry = ProviderRegistry::new();
        assert!(registry.info("docker").is_some());
        assert!(registry.info("vpc").is_some());
        assert!(registry.info("mock").is_some());
        assert!(registry.info("jupiterbrain").is_none());
    }

    #[test]
    fn test_create_unknown_provider() {
        let registry = ProviderRegistry::new();
        let config = ProviderConfig::default();
        match registry.create("nope", &config) {
            Err(ProviderError::UnknownProvider(name)) => assert_eq!(name, "nope"),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_create_mock_provider() {
        let registry = ProviderRegistry::new();
        let provider = registry.create("mock", &ProviderConfig::default()).unwrap();
        assert_eq!(provider.name(), "mock");
    }

    #[test]
    fn test_docker_options_declared() {
        let registry = ProviderRegistry::new();
        let info = registry.info("docker").unwrap();
        assert!(info.options.iter().any(|(k, _)| *k == "IMAGE"));
    }
}

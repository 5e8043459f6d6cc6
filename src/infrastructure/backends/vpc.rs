//! Cloud VPC backend.
//!
//! Provisions one virtual server per job: an ephemeral SSH key is
//! registered, an instance is booted from it, readiness is polled through
//! the cloud API and reachability probed over SSH, and the script runs
//! through the system `ssh` client. API and SSH probing carry separate
//! retry budgets: a "running" instance is not necessarily reachable.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::domain::errors::ProviderError;
use crate::domain::models::ProviderConfig;
use crate::domain::ports::{Instance, Provider, RunResult, StartAttributes};
use crate::infrastructure::retry::RetryPolicy;

use super::stream_child;

/// Recognized `PROVIDER_CONFIG_*` options.
pub const OPTIONS: &[(&str, &str)] = &[
    ("IC_API_KEY", "[REQUIRED] API key with access to create VMs"),
    ("REGION", "region where everything goes"),
    ("INSTANCE_PROFILE", "type of instance for each build"),
    ("RESOURCE_GROUP_ID", "[REQUIRED] ID of the resource group to add VMs to"),
    ("VPC_ID", "[REQUIRED] ID of the VPC instance to attach VMs to"),
    ("DEFAULT_IMAGE_ID", "ID of the default image to boot VMs into"),
    ("SUBNET_IDS", "[REQUIRED] list of subnet IDs to spawn VMs into"),
    ("SECURITY_GROUP_IDS", "list of security group IDs to attach to VMs"),
    ("USER_DATA", "custom user data appended to the startup script"),
    ("USERNAME", "username to SSH into VM with"),
    ("API_RETRIES", "number of times to retry API calls"),
    ("API_RETRY_INTERVAL", "seconds to wait in between API retries"),
    ("SSH_RETRIES", "number of times to retry SSH into instance"),
    ("SSH_RETRY_INTERVAL", "seconds to wait in between SSH retries"),
];

const DEFAULT_INSTANCE_PROFILE: &str = "cx2-2x4";
const DEFAULT_REGION: &str = "us-south";
const DEFAULT_USERNAME: &str = "build";
const DEFAULT_API_RETRIES: u32 = 60;
const DEFAULT_API_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_SSH_RETRIES: u32 = 60;
const DEFAULT_SSH_RETRY_INTERVAL: Duration = Duration::from_secs(2);
const API_VERSION: &str = "2024-11-12";

const REGION_ENDPOINTS: &[(&str, &str)] = &[
    ("us-south", "https://us-south.iaas.cloud.ibm.com/v1"),
    ("us-east", "https://us-east.iaas.cloud.ibm.com/v1"),
    ("ca-tor", "https://ca-tor.iaas.cloud.ibm.com/v1"),
    ("eu-gb", "https://eu-gb.iaas.cloud.ibm.com/v1"),
    ("eu-de", "https://eu-de.iaas.cloud.ibm.com/v1"),
    ("jp-tok", "https://jp-tok.iaas.cloud.ibm.com/v1"),
    ("jp-osa", "https://jp-osa.iaas.cloud.ibm.com/v1"),
    ("au-syd", "https://au-syd.iaas.cloud.ibm.com/v1"),
    ("br-sao", "https://br-sao.iaas.cloud.ibm.com/v1"),
];

const SSH_OPTIONS: &[&str] = &[
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "BatchMode=yes",
    "-o",
    "LogLevel=ERROR",
];

#[derive(Debug, Clone)]
struct VpcSettings {
    api_key: String,
    instance_profile: String,
    default_image_id: Option<String>,
    resource_group_id: String,
    vpc_id: String,
    subnet_ids: Vec<String>,
    security_group_ids: Vec<String>,
    user_data: String,
    username: String,
    api_retries: u32,
    api_retry_interval: Duration,
    ssh_retries: u32,
    ssh_retry_interval: Duration,
}

pub struct VpcProvider {
    settings: VpcSettings,
    client: reqwest::Client,
    endpoint: String,
    subnet_counter: AtomicUsize,
}

impl VpcProvider {
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let region = config.get("REGION").unwrap_or(DEFAULT_REGION);
        let endpoint = REGION_ENDPOINTS
            .iter()
            .find(|(name, _)| *name == region)
            .map(|(_, url)| (*url).to_string())
            .ok_or_else(|| ProviderError::NotConfigured(format!("unknown region {region}")))?;

        let subnet_ids: Vec<String> = config
            .require("SUBNET_IDS")?
            .split(',')
            .map(str::to_string)
            .filter(|s| !s.is_empty())
            .collect();
        if subnet_ids.is_empty() {
            return Err(ProviderError::NotConfigured(
                "SUBNET_IDS must name at least one subnet".to_string(),
            ));
        }

        let settings = VpcSettings {
            api_key: config.require("IC_API_KEY")?.to_string(),
            instance_profile: config
                .get("INSTANCE_PROFILE")
                .unwrap_or(DEFAULT_INSTANCE_PROFILE)
                .to_string(),
            default_image_id: config.get("DEFAULT_IMAGE_ID").map(str::to_string),
            resource_group_id: config.require("RESOURCE_GROUP_ID")?.to_string(),
            vpc_id: config.require("VPC_ID")?.to_string(),
            subnet_ids,
            security_group_ids: config
                .get("SECURITY_GROUP_IDS")
                .map(|s| s.split(',').map(str::to_string).collect())
                .unwrap_or_default(),
            user_data: config.get("USER_DATA").unwrap_or("").to_string(),
            username: config.get("USERNAME").unwrap_or(DEFAULT_USERNAME).to_string(),
            api_retries: parse_count(config, "API_RETRIES", DEFAULT_API_RETRIES)?,
            api_retry_interval: parse_interval(
                config,
                "API_RETRY_INTERVAL",
                DEFAULT_API_RETRY_INTERVAL,
            )?,
            ssh_retries: parse_count(config, "SSH_RETRIES", DEFAULT_SSH_RETRIES)?,
            ssh_retry_interval: parse_interval(
                config,
                "SSH_RETRY_INTERVAL",
                DEFAULT_SSH_RETRY_INTERVAL,
            )?,
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProviderError::NotConfigured(e.to_string()))?;

        Ok(Self {
            settings,
            client,
            endpoint,
            subnet_counter: AtomicUsize::new(0),
        })
    }

    fn api(&self) -> VpcApi {
        VpcApi {
            client: self.client.clone(),
            endpoint: self.endpoint.clone(),
            api_key: self.settings.api_key.clone(),
        }
    }

    fn api_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.settings.api_retries, self.settings.api_retry_interval)
    }

    fn ssh_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.settings.ssh_retries, self.settings.ssh_retry_interval)
    }

    /// Generate an ephemeral keypair and register the public half.
    async fn create_ssh_key(
        &self,
        token: &CancellationToken,
        job_id: u64,
    ) -> Result<(TempDir, String), ProviderError> {
        let key_dir = tempfile::tempdir()
            .map_err(|e| ProviderError::ProvisionFailed(e.to_string()))?;
        let key_path = key_dir.path().join("id_rsa");
        let key_name = format!("kiln-job-{job_id}");

        let output = Command::new("ssh-keygen")
            .args(["-t", "rsa", "-b", "4096", "-N", "", "-C", &key_name, "-f"])
            .arg(&key_path)
            .stdout(Stdio::null())
            .output()
            .await
            .map_err(|e| ProviderError::ProvisionFailed(format!("ssh-keygen failed: {e}")))?;
        if !output.status.success() {
            return Err(ProviderError::ProvisionFailed(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }

        let public_key = tokio::fs::read_to_string(key_path.with_extension("pub"))
            .await
            .map_err(|e| ProviderError::ProvisionFailed(e.to_string()))?;

        debug!(key = %key_name, "registering ssh key");
        let body = json!({
            "name": key_name,
            "public_key": public_key.trim(),
            "type": "rsa",
            "resource_group": { "id": self.settings.resource_group_id },
        });
        let created = self.api().post(token, "/keys", &body).await?;
        let key_id = created["id"]
            .as_str()
            .ok_or_else(|| ProviderError::ProvisionFailed("key response without id".to_string()))?
            .to_string();

        debug!(key = %key_name, key_id = %key_id, "registered ssh key");
        Ok((key_dir, key_id))
    }

    /// Spread instances across the configured subnets.
    fn next_subnet(&self) -> &str {
        let index = self.subnet_counter.fetch_add(1, Ordering::Relaxed);
        &self.settings.subnet_ids[index % self.settings.subnet_ids.len()]
    }

    fn startup_script(&self, public_key: &str) -> String {
        format!(
            "#!/usr/bin/env bash\n\
             cat > ~{user}/.ssh/authorized_keys <<EOF\n\
             {key}\n\
             EOF\n\
             chown -R {user}:{user} ~{user}/.ssh/\n\
             \n\
             {extra}\n",
            user = self.settings.username,
            key = public_key.trim(),
            extra = self.settings.user_data,
        )
    }

    async fn create_instance(
        &self,
        token: &CancellationToken,
        attrs: &StartAttributes,
        key_id: &str,
        public_key: &str,
    ) -> Result<(String, String), ProviderError> {
        let subnet_id = self.next_subnet();

        // The API wants the zone spelled out even though the subnet
        // implies it.
        debug!(subnet = %subnet_id, "getting subnet details");
        let subnet = self.api().get(token, &format!("/subnets/{subnet_id}")).await?;
        let zone = subnet["zone"]["name"]
            .as_str()
            .ok_or_else(|| ProviderError::ProvisionFailed("subnet without zone".to_string()))?;

        let image_id = attrs
            .image_name
            .clone()
            .or_else(|| self.settings.default_image_id.clone())
            .ok_or_else(|| {
                ProviderError::NotConfigured(
                    "no image requested and DEFAULT_IMAGE_ID unset".to_string(),
                )
            })?;

        let name = format!("kiln-job-{}", attrs.job_id);
        let security_groups: Vec<Value> = self
            .settings
            .security_group_ids
            .iter()
            .map(|id| json!({ "id": id }))
            .collect();

        let prototype = json!({
            "name": name,
            "keys": [{ "id": key_id }],
            "profile": { "name": self.settings.instance_profile },
            "resource_group": { "id": self.settings.resource_group_id },
            "user_data": self.startup_script(public_key),
            "vpc": { "id": self.settings.vpc_id },
            "image": { "id": image_id },
            "primary_network_interface": {
                "subnet": { "id": subnet_id },
                "security_groups": security_groups,
            },
            "zone": { "name": zone },
        });

        debug!(instance = %name, "creating instance");
        let created = self.api().post(token, "/instances", &prototype).await?;
        let instance_id = created["id"]
            .as_str()
            .ok_or_else(|| {
                ProviderError::ProvisionFailed("instance response without id".to_string())
            })?
            .to_string();

        debug!(instance = %name, instance_id = %instance_id, "created instance");
        Ok((instance_id, name))
    }

    /// Poll the API until the instance reports `running`, then return its
    /// primary address. Uses the API budget and interval.
    async fn wait_for_instance(
        &self,
        token: &CancellationToken,
        instance_id: &str,
    ) -> Result<(String, String), ProviderError> {
        let api = self.api();
        let path = format!("/instances/{instance_id}");
        let retries = self.settings.api_retries;

        let instance = self
            .api_policy()
            .run(token, |attempt| {
                let api = api.clone();
                let path = path.clone();
                async move {
                    debug!(attempt, retries, "probing instance for readiness");
                    let instance = api.get_raw(&path).await?;
                    match instance["status"].as_str() {
                        Some("running") => Ok(instance),
                        status => Err(ProviderError::Transient(format!(
                            "instance not running yet, state: {}",
                            status.unwrap_or("unknown")
                        ))),
                    }
                }
            })
            .await
            .map_err(ProviderError::from)?;

        info!(instance_id = %instance_id, "instance is running");

        let ip = instance["primary_network_interface"]["primary_ipv4_address"]
            .as_str()
            .ok_or_else(|| {
                ProviderError::ProvisionFailed("running instance without address".to_string())
            })?
            .to_string();
        let image = instance["image"]["name"]
            .as_str()
            .unwrap_or("unknown")
            .to_string();

        Ok((ip, image))
    }

    /// Probe TCP reachability of the SSH port. Uses the SSH budget and
    /// interval, independent of the API budget.
    async fn wait_for_ssh(&self, token: &CancellationToken, ip: &str) -> Result<(), ProviderError> {
        let address = format!("{ip}:22");
        let retries = self.settings.ssh_retries;

        self.ssh_policy()
            .run(token, |attempt| {
                let address = address.clone();
                async move {
                    debug!(attempt, retries, address = %address, "probing instance for connectivity");
                    match tokio::time::timeout(
                        Duration::from_secs(1),
                        TcpStream::connect(&address),
                    )
                    .await
                    {
                        Ok(Ok(_)) => Ok(()),
                        Ok(Err(e)) => Err(ProviderError::Transient(e.to_string())),
                        Err(_) => Err(ProviderError::Transient("connect timed out".to_string())),
                    }
                }
            })
            .await
            .map_err(ProviderError::from)?;

        info!(address = %address, "instance is reachable");
        Ok(())
    }

    async fn retry_delete_key(&self, token: &CancellationToken, key_id: &str) {
        let api = self.api();
        let path = format!("/keys/{key_id}");
        let result = self
            .api_policy()
            .run(token, |attempt| {
                let api = api.clone();
                let path = path.clone();
                async move {
                    debug!(attempt, "cleaning up ssh key");
                    api.delete(&path).await
                }
            })
            .await;
        if let Err(e) = result {
            error!(key_id = %key_id, error = %e, "failed to delete ssh key");
        }
    }

    async fn delete_instance_once(&self, instance_id: &str) -> Result<(), ProviderError> {
        self.api().delete(&format!("/instances/{instance_id}")).await
    }
}

#[async_trait]
impl Provider for VpcProvider {
    fn name(&self) -> &'static str {
        "vpc"
    }

    async fn setup(&self, _token: &CancellationToken) -> Result<(), ProviderError> {
        // Credentials and endpoint were validated in the constructor.
        Ok(())
    }

    async fn start(
        &self,
        token: &CancellationToken,
        attrs: &StartAttributes,
    ) -> Result<Box<dyn Instance>, ProviderError> {
        let began = Instant::now();

        let (key_dir, key_id) = self.create_ssh_key(token, attrs.job_id).await?;
        let public_key = tokio::fs::read_to_string(key_dir.path().join("id_rsa.pub"))
            .await
            .map_err(|e| ProviderError::ProvisionFailed(e.to_string()))?;

        let (instance_id, instance_name) =
            match self.create_instance(token, attrs, &key_id, &public_key).await {
                Ok(created) => created,
                Err(e) => {
                    self.retry_delete_key(token, &key_id).await;
                    return Err(e);
                }
            };

        let ready = async {
            let (ip, image) = self.wait_for_instance(token, &instance_id).await?;
            self.wait_for_ssh(token, &ip).await?;
            Ok::<_, ProviderError>((ip, image))
        }
        .await;

        let (ip, image) = match ready {
            Ok(ready) => ready,
            Err(e) => {
                info!(instance = %instance_name, "cleaning up instance due to failure");
                if let Err(delete_err) = self.delete_instance_once(&instance_id).await {
                    error!(instance = %instance_name, error = %delete_err, "failed to cleanup instance");
                }
                self.retry_delete_key(token, &key_id).await;
                return Err(e);
            }
        };

        Ok(Box::new(VpcInstance {
            api: self.api(),
            api_policy: self.api_policy(),
            username: self.settings.username.clone(),
            instance_id,
            instance_name,
            image,
            ip,
            key_id,
            key_dir,
            startup_duration: began.elapsed(),
        }))
    }
}

pub struct VpcInstance {
    api: VpcApi,
    api_policy: RetryPolicy,
    username: String,
    instance_id: String,
    instance_name: String,
    image: String,
    ip: String,
    key_id: String,
    key_dir: TempDir,
    startup_duration: Duration,
}

impl VpcInstance {
    fn key_path(&self) -> std::path::PathBuf {
        self.key_dir.path().join("id_rsa")
    }

    fn ssh_target(&self) -> String {
        format!("{}@{}", self.username, self.ip)
    }
}

#[async_trait]
impl Instance for VpcInstance {
    async fn upload_script(
        &self,
        token: &CancellationToken,
        script: &[u8],
    ) -> Result<(), ProviderError> {
        if token.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        let script_path = self.key_dir.path().join("build.sh");
        tokio::fs::write(&script_path, script)
            .await
            .map_err(|e| ProviderError::UploadFailed(e.to_string()))?;

        let mut cmd = Command::new("scp");
        cmd.args(SSH_OPTIONS)
            .arg("-i")
            .arg(self.key_path())
            .arg(&script_path)
            .arg(format!("{}:build.sh", self.ssh_target()))
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| ProviderError::UploadFailed(e.to_string()))?;
        let status = tokio::select! {
            _ = token.cancelled() => return Err(ProviderError::Cancelled),
            status = child.wait() => status.map_err(|e| ProviderError::UploadFailed(e.to_string()))?,
        };

        if !status.success() {
            return Err(ProviderError::UploadFailed(format!(
                "scp exited with {status}"
            )));
        }
        Ok(())
    }

    async fn run_script(
        &self,
        token: &CancellationToken,
        output: mpsc::Sender<Vec<u8>>,
    ) -> Result<RunResult, ProviderError> {
        let mut cmd = Command::new("ssh");
        cmd.args(SSH_OPTIONS)
            .arg("-i")
            .arg(self.key_path())
            .arg(self.ssh_target())
            .arg("bash ~/build.sh")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
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

        info!(instance = %self.instance_name, "cleaning up instance");
        self.api
            .delete(&format!("/instances/{}", self.instance_id))
            .await?;

        // Converge: the instance is only gone once the API says so.
        let api = self.api.clone();
        let path = format!("/instances/{}", self.instance_id);
        self.api_policy
            .run(token, |attempt| {
                let api = api.clone();
                let path = path.clone();
                async move {
                    debug!(attempt, "probing instance for deletion");
                    match api.get_raw(&path).await {
                        Err(ProviderError::ProvisionFailed(ref msg)) if msg.contains("404") => {
                            Ok(())
                        }
                        Ok(instance) => Err(ProviderError::Transient(format!(
                            "instance still present, state: {}",
                            instance["status"].as_str().unwrap_or("unknown")
                        ))),
                        Err(e) => Err(e),
                    }
                }
            })
            .await
            .map_err(ProviderError::from)?;

        debug!(instance = %self.instance_name, "instance is deleted");

        // The ephemeral key goes last so a retried stop can still
        // authenticate nothing.
        let key_path = format!("/keys/{}", self.key_id);
        self.api_policy
            .run(token, |attempt| {
                let api = api.clone();
                let path = key_path.clone();
                async move {
                    debug!(attempt, "cleaning up ssh key");
                    api.delete(&path).await
                }
            })
            .await
            .map_err(ProviderError::from)?;

        Ok(())
    }

    fn id(&self) -> String {
        self.instance_name.clone()
    }

    fn image_name(&self) -> String {
        self.image.clone()
    }

    fn startup_duration(&self) -> Duration {
        self.startup_duration
    }
}

/// Minimal authenticated client for the VPC REST API.
#[derive(Clone)]
pub struct VpcApi {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl VpcApi {
    fn url(&self, path: &str) -> String {
        format!(
            "{}{}?version={}&generation=2",
            self.endpoint, path, API_VERSION
        )
    }

    async fn get(&self, token: &CancellationToken, path: &str) -> Result<Value, ProviderError> {
        if token.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        self.get_raw(path).await
    }

    async fn get_raw(&self, path: &str) -> Result<Value, ProviderError> {
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;
        Self::decode(response).await
    }

    async fn post(
        &self,
        token: &CancellationToken,
        path: &str,
        body: &Value,
    ) -> Result<Value, ProviderError> {
        if token.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;
        Self::decode(response).await
    }

    /// DELETE where 404 counts as already gone.
    async fn delete(&self, path: &str) -> Result<(), ProviderError> {
        let response = self
            .client
            .delete(self.url(path))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() || status.as_u16() == 404 {
            Ok(())
        } else if status.is_server_error() {
            Err(ProviderError::Transient(format!("API returned {status}")))
        } else {
            Err(ProviderError::StopFailed(format!("API returned {status}")))
        }
    }

    async fn decode(response: reqwest::Response) -> Result<Value, ProviderError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;

        if status.is_server_error() {
            return Err(ProviderError::Transient(format!("API returned {status}")));
        }
        if !status.is_success() {
            return Err(ProviderError::ProvisionFailed(format!(
                "API returned {status}: {body}"
            )));
        }

        serde_json::from_str(&body).map_err(|e| ProviderError::ProvisionFailed(e.to_string()))
    }
}

fn parse_count(
    config: &ProviderConfig,
    key: &str,
    default: u32,
) -> Result<u32, ProviderError> {
    match config.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| ProviderError::NotConfigured(format!("invalid {key}: {raw}"))),
    }
}

fn parse_interval(
    config: &ProviderConfig,
    key: &str,
    default: Duration,
) -> Result<Duration, ProviderError> {
    match config.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map(Duration::from_secs)
            .map_err(|_| ProviderError::NotConfigured(format!("invalid {key}: {raw}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn minimal_config() -> ProviderConfig {
        let mut values = HashMap::new();
        values.insert("IC_API_KEY".to_string(), "k".to_string());
        values.insert("RESOURCE_GROUP_ID".to_string(), "rg".to_string());
        values.insert("VPC_ID".to_string(), "vpc".to_string());
        values.insert("SUBNET_IDS".to_string(), "sub-1,sub-2".to_string());
        ProviderConfig::new(values)
    }

    #[test]
    fn test_from_config_defaults() {
        let provider = VpcProvider::from_config(&minimal_config()).unwrap();
        assert_eq!(provider.settings.instance_profile, DEFAULT_INSTANCE_PROFILE);
        assert_eq!(provider.settings.username, DEFAULT_USERNAME);
        assert_eq!(provider.settings.api_retries, DEFAULT_API_RETRIES);
        assert_eq!(provider.settings.ssh_retries, DEFAULT_SSH_RETRIES);
        assert!(provider.endpoint.contains("us-south"));
    }

    #[test]
    fn test_budgets_are_independent() {
        let mut config = minimal_config();
        let mut values: HashMap<String, String> = config
            .keys()
            .map(|k| (k.to_string(), config.get(k).unwrap().to_string()))
            .collect();
        values.insert("API_RETRIES".to_string(), "7".to_string());
        values.insert("SSH_RETRIES".to_string(), "11".to_string());
        values.insert("API_RETRY_INTERVAL".to_string(), "9".to_string());
        values.insert("SSH_RETRY_INTERVAL".to_string(), "1".to_string());
        config = ProviderConfig::new(values);

        let provider = VpcProvider::from_config(&config).unwrap();
        // API settings must only touch the API budget, and vice versa.
        assert_eq!(provider.settings.api_retries, 7);
        assert_eq!(provider.settings.ssh_retries, 11);
        assert_eq!(provider.settings.api_retry_interval, Duration::from_secs(9));
        assert_eq!(provider.settings.ssh_retry_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_unknown_region_rejected() {
        let mut values = HashMap::new();
        values.insert("IC_API_KEY".to_string(), "k".to_string());
        values.insert("RESOURCE_GROUP_ID".to_string(), "rg".to_string());
        values.insert("VPC_ID".to_string(), "vpc".to_string());
        values.insert("SUBNET_IDS".to_string(), "sub-1".to_string());
        values.insert("REGION".to_string(), "mars-north".to_string());

        let result = VpcProvider::from_config(&ProviderConfig::new(values));
        assert!(matches!(result, Err(ProviderError::NotConfigured(_))));
    }

    #[test]
    fn test_missing_required_option() {
        let result = VpcProvider::from_config(&ProviderConfig::default());
        assert!(matches!(result, Err(ProviderError::NotConfigured(_))));
    }

    #[test]
    fn test_subnets_rotate() {
        let provider = VpcProvider::from_config(&minimal_config()).unwrap();
        let first = provider.next_subnet().to_string();
        let second = provider.next_subnet().to_string();
        let third = provider.next_subnet().to_string();
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn test_startup_script_installs_key() {
        let provider = VpcProvider::from_config(&minimal_config()).unwrap();
        let script = provider.startup_script("ssh-rsa AAAA test");
        assert!(script.starts_with("#!/usr/bin/env bash"));
        assert!(script.contains("ssh-rsa AAAA test"));
        assert!(script.contains("authorized_keys"));
        assert!(script.contains(DEFAULT_USERNAME));
    }
}

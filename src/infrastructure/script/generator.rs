//! HTTP client for the build-script generator service.
//!
//! The service turns a job payload into a shell script; the worker treats
//! it as a pure function and never inspects the result beyond emptiness.

use async_trait::async_trait;
use std::time::Duration;

use crate::domain::errors::ScriptError;
use crate::domain::models::job::Job;
use crate::domain::ports::BuildScriptGenerator;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpScriptGenerator {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpScriptGenerator {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, ScriptError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ScriptError::Request(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl BuildScriptGenerator for HttpScriptGenerator {
    async fn generate(&self, job: &Job) -> Result<Vec<u8>, ScriptError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&job.raw)
            .send()
            .await
            .map_err(|e| ScriptError::Request(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ScriptError::Request(e.to_string()))?;

        if !status.is_success() {
            return Err(ScriptError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        if body.is_empty() {
            return Err(ScriptError::Empty);
        }

        Ok(body.to_vec())
    }
}

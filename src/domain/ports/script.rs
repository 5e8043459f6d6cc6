//! Build-script generator port.

use async_trait::async_trait;

use crate::domain::errors::ScriptError;
use crate::domain::models::job::Job;

/// Pure function from job payload to executable build script.
///
/// The production implementation is an HTTP client against the build API;
/// the worker core only sees the bytes.
#[async_trait]
pub trait BuildScriptGenerator: Send + Sync {
    async fn generate(&self, job: &Job) -> Result<Vec<u8>, ScriptError>;
}

/// Adaptors to external systems that hold one view of an entity each.
///
/// A [`DataSource`] is the kernel's only way to reach outside itself:
/// `create`/`read`/`update`/`delete` against a single foreign key, each
/// returning the source's current JSON view (or `None` once deleted). Two
/// reference adaptors are provided: [`CommandDataSource`], which shells
/// out to a configured subprocess and exchanges JSON over stdio, and
/// [`HttpDataSource`] (behind the `http` feature), which issues REST calls
/// with `reqwest`.
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::error::RetconError;

/// One external view of an entity, keyed by the source's own opaque key.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// A human-readable name for traces and error messages.
    fn name(&self) -> &str;

    /// Create a new record, returning the key the source assigned it.
    async fn create(&self, entity: &str, document: &JsonValue) -> Result<String, DataSourceError>;

    /// Fetch the current view for `key`. `Ok(None)` means the record does
    /// not (or no longer) exist at this source.
    async fn read(&self, entity: &str, key: &str) -> Result<Option<JsonValue>, DataSourceError>;

    /// Overwrite the record at `key` with `document`.
    async fn update(
        &self,
        entity: &str,
        key: &str,
        document: &JsonValue,
    ) -> Result<(), DataSourceError>;

    /// Remove the record at `key`. Deleting an already-absent record is
    /// not an error.
    async fn delete(&self, entity: &str, key: &str) -> Result<(), DataSourceError>;
}

/// The reason a single `DataSource` call failed, reported up to
/// [`RetconError::DataSource`] by the kernel.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct DataSourceError(pub String);

impl DataSourceError {
    pub fn new(message: impl Into<String>) -> Self {
        DataSourceError(message.into())
    }
}

/// Shells out to a fixed command template for every call, substituting
/// `%fk` with the foreign key and `%entity` with the entity name. The
/// document (for `create`/`update`) is written to the child's stdin as
/// JSON; the child's stdout is parsed as JSON for `create`/`read`. Every
/// call is bounded by `deadline`.
pub struct CommandDataSource {
    name: String,
    create_command: Vec<String>,
    read_command: Vec<String>,
    update_command: Vec<String>,
    delete_command: Vec<String>,
    deadline: Duration,
}

impl CommandDataSource {
    /// Build an adaptor from its four command templates (argv-style,
    /// already split on whitespace by the config loader) and a
    /// per-call timeout.
    pub fn new(
        name: impl Into<String>,
        create_command: Vec<String>,
        read_command: Vec<String>,
        update_command: Vec<String>,
        delete_command: Vec<String>,
        deadline: Duration,
    ) -> Self {
        CommandDataSource {
            name: name.into(),
            create_command,
            read_command,
            update_command,
            delete_command,
            deadline,
        }
    }

    fn substitute(template: &[String], entity: &str, key: Option<&str>) -> Vec<String> {
        template
            .iter()
            .map(|arg| {
                let arg = arg.replace("%entity", entity);
                match key {
                    Some(k) => arg.replace("%fk", k),
                    None => arg,
                }
            })
            .collect()
    }

    async fn run(
        &self,
        template: &[String],
        entity: &str,
        key: Option<&str>,
        stdin_payload: Option<&JsonValue>,
    ) -> Result<Vec<u8>, DataSourceError> {
        let argv = Self::substitute(template, entity, key);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| DataSourceError::new("empty command template"))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DataSourceError::new(format!("failed to spawn '{}': {}", program, e)))?;

        if let Some(payload) = stdin_payload {
            let bytes = serde_json::to_vec(payload)
                .map_err(|e| DataSourceError::new(format!("failed to encode request: {}", e)))?;
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(&bytes)
                    .await
                    .map_err(|e| DataSourceError::new(format!("failed to write stdin: {}", e)))?;
            }
        } else {
            drop(child.stdin.take());
        }

        let output = tokio::time::timeout(self.deadline, child.wait_with_output())
            .await
            .map_err(|_| DataSourceError::new(format!("command timed out after {:?}", self.deadline)))?
            .map_err(|e| DataSourceError::new(format!("command failed: {}", e)))?;

        if !output.status.success() {
            return Err(DataSourceError::new(format!(
                "command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl DataSource for CommandDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self, entity: &str, document: &JsonValue) -> Result<String, DataSourceError> {
        let stdout = self
            .run(&self.create_command, entity, None, Some(document))
            .await?;
        let parsed: JsonValue = serde_json::from_slice(&stdout)
            .map_err(|e| DataSourceError::new(format!("malformed create response: {}", e)))?;
        parsed
            .get("key")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| DataSourceError::new("create response missing 'key' field"))
    }

    async fn read(&self, entity: &str, key: &str) -> Result<Option<JsonValue>, DataSourceError> {
        let stdout = self
            .run(&self.read_command, entity, Some(key), None)
            .await?;
        if stdout.is_empty() {
            return Ok(None);
        }
        let parsed: JsonValue = serde_json::from_slice(&stdout)
            .map_err(|e| DataSourceError::new(format!("malformed read response: {}", e)))?;
        if parsed.is_null() {
            Ok(None)
        } else {
            Ok(Some(parsed))
        }
    }

    async fn update(
        &self,
        entity: &str,
        key: &str,
        document: &JsonValue,
    ) -> Result<(), DataSourceError> {
        self.run(&self.update_command, entity, Some(key), Some(document))
            .await?;
        Ok(())
    }

    async fn delete(&self, entity: &str, key: &str) -> Result<(), DataSourceError> {
        self.run(&self.delete_command, entity, Some(key), None).await?;
        Ok(())
    }
}

/// Issues REST calls against `{base_url}/{entity}` (create) and
/// `{base_url}/{entity}/{key}` (read/update/delete). A 404 on `read` maps
/// to `Ok(None)`.
#[cfg(feature = "http")]
pub struct HttpDataSource {
    name: String,
    base_url: String,
    client: reqwest::Client,
    headers: HashMap<String, String>,
}

#[cfg(feature = "http")]
impl HttpDataSource {
    /// Build an adaptor against `base_url`, sending `headers` with every
    /// request (e.g. authentication).
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, headers: HashMap<String, String>) -> Self {
        HttpDataSource {
            name: name.into(),
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            headers,
        }
    }

    fn apply_headers(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (k, v) in &self.headers {
            builder = builder.header(k, v);
        }
        builder
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl DataSource for HttpDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self, entity: &str, document: &JsonValue) -> Result<String, DataSourceError> {
        let url = format!("{}/{}", self.base_url, entity);
        let resp = self
            .apply_headers(self.client.post(&url))
            .json(document)
            .send()
            .await
            .map_err(|e| DataSourceError::new(e.to_string()))?
            .error_for_status()
            .map_err(|e| DataSourceError::new(e.to_string()))?;
        let body: JsonValue = resp.json().await.map_err(|e| DataSourceError::new(e.to_string()))?;
        body.get("key")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| DataSourceError::new("create response missing 'key' field"))
    }

    async fn read(&self, entity: &str, key: &str) -> Result<Option<JsonValue>, DataSourceError> {
        let url = format!("{}/{}/{}", self.base_url, entity, key);
        let resp = self
            .apply_headers(self.client.get(&url))
            .send()
            .await
            .map_err(|e| DataSourceError::new(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status().map_err(|e| DataSourceError::new(e.to_string()))?;
        let body: JsonValue = resp.json().await.map_err(|e| DataSourceError::new(e.to_string()))?;
        Ok(Some(body))
    }

    async fn update(
        &self,
        entity: &str,
        key: &str,
        document: &JsonValue,
    ) -> Result<(), DataSourceError> {
        let url = format!("{}/{}/{}", self.base_url, entity, key);
        self.apply_headers(self.client.put(&url))
            .json(document)
            .send()
            .await
            .map_err(|e| DataSourceError::new(e.to_string()))?
            .error_for_status()
            .map_err(|e| DataSourceError::new(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, entity: &str, key: &str) -> Result<(), DataSourceError> {
        let url = format!("{}/{}/{}", self.base_url, entity, key);
        let resp = self
            .apply_headers(self.client.delete(&url))
            .send()
            .await
            .map_err(|e| DataSourceError::new(e.to_string()))?;
        if resp.status() != reqwest::StatusCode::NOT_FOUND {
            resp.error_for_status().map_err(|e| DataSourceError::new(e.to_string()))?;
        }
        Ok(())
    }
}

impl From<DataSourceError> for RetconError {
    fn from(e: DataSourceError) -> Self {
        RetconError::Internal(e.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitute_replaces_both_placeholders() {
        let template = vec!["adaptor".to_string(), "%entity".to_string(), "%fk".to_string()];
        let argv = CommandDataSource::substitute(&template, "customer", Some("K1"));
        assert_eq!(argv, vec!["adaptor", "customer", "K1"]);
    }

    #[test]
    fn substitute_leaves_fk_untouched_when_absent() {
        let template = vec!["adaptor".to_string(), "create".to_string(), "%entity".to_string()];
        let argv = CommandDataSource::substitute(&template, "customer", None);
        assert_eq!(argv, vec!["adaptor", "create", "customer"]);
    }

    #[tokio::test]
    async fn command_source_read_reports_absent_on_empty_stdout() {
        let source = CommandDataSource::new(
            "data",
            vec!["true".to_string()],
            vec!["true".to_string()],
            vec!["true".to_string()],
            vec!["true".to_string()],
            Duration::from_secs(5),
        );
        let result = source.read("customer", "K1").await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn command_source_reports_nonzero_exit_as_error() {
        let source = CommandDataSource::new(
            "data",
            vec!["false".to_string()],
            vec!["false".to_string()],
            vec!["false".to_string()],
            vec!["false".to_string()],
            Duration::from_secs(5),
        );
        assert!(source.read("customer", "K1").await.is_err());
    }
}

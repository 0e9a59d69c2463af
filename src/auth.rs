//! Registry credential resolution.
//!
//! Credentials are resolved by an ordered list of sources; the first source
//! that yields an error-free, fully populated pair wins. Later sources are
//! consulted only when earlier ones fail, and a fully failed chain is not
//! fatal: the pull proceeds anonymously.

use crate::config::{DriverConfig, RegistryAuth};
use crate::error::{Error, Result};
use crate::reference::ImageReference;
use serde::Deserialize;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// A resolved username/password pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// HTTP basic-auth header value for these credentials.
    pub fn basic_auth_header(&self) -> String {
        use base64::Engine;
        let raw = format!("{}:{}", self.username, self.password);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw)
        )
    }
}

/// An ordered credential source.
#[derive(Debug, Clone)]
enum CredentialSource {
    /// Static credentials: plugin-level pair overridden by the job pair.
    Static(RegistryAuth),
    /// External docker-credential-helper style executable.
    Helper(String),
}

impl CredentialSource {
    async fn resolve(&self, reference: &ImageReference) -> Result<Credentials> {
        match self {
            CredentialSource::Static(auth) => {
                if auth.is_complete() {
                    Ok(Credentials {
                        username: auth.username.clone(),
                        password: auth.password.clone(),
                    })
                } else {
                    Err(Error::NoCredentials)
                }
            }
            CredentialSource::Helper(helper) => run_helper(helper, reference.index_name()).await,
        }
    }
}

/// Resolves credentials for a repository, trying the job/plugin static pair
/// first and the plugin's helper program second. Returns `None` when no
/// source produced a usable pair.
pub async fn resolve_registry_auth(
    driver: &DriverConfig,
    task_auth: &RegistryAuth,
    reference: &ImageReference,
) -> Option<Credentials> {
    let mut sources = vec![CredentialSource::Static(merge_auth(&driver.auth, task_auth))];
    if let Some(helper) = &driver.auth_helper {
        if !helper.is_empty() {
            sources.push(CredentialSource::Helper(helper.clone()));
        }
    }

    for source in &sources {
        match source.resolve(reference).await {
            Ok(creds) if !creds.username.is_empty() && !creds.password.is_empty() => {
                return Some(creds);
            }
            Ok(_) => {}
            Err(err) => {
                debug!(repository = %reference.repository(), error = %err,
                    "credential source failed, trying next");
            }
        }
    }

    None
}

/// Job credentials take precedence over the plugin pair when both are set.
fn merge_auth(plugin: &RegistryAuth, job: &RegistryAuth) -> RegistryAuth {
    if job.is_complete() {
        job.clone()
    } else {
        plugin.clone()
    }
}

/// Response shape of a docker credential helper.
#[derive(Debug, Deserialize)]
struct HelperResponse {
    #[serde(rename = "Username", default)]
    username: String,
    #[serde(rename = "Secret", default)]
    secret: String,
}

/// Invokes the helper with argv `get`, feeding the registry index name on
/// stdin and parsing the `{"Username":…,"Secret":…}` JSON reply.
async fn run_helper(helper: &str, index_name: &str) -> Result<Credentials> {
    let mut child = Command::new(helper)
        .arg("get")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::AuthHelperFailed {
            helper: helper.to_string(),
            reason: e.to_string(),
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(index_name.as_bytes())
            .await
            .map_err(|e| Error::AuthHelperFailed {
                helper: helper.to_string(),
                reason: e.to_string(),
            })?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| Error::AuthHelperFailed {
            helper: helper.to_string(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(Error::AuthHelperFailed {
            helper: helper.to_string(),
            reason: format!(
                "exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    let response: HelperResponse = serde_json::from_slice(&output.stdout)?;
    if response.username.is_empty() || response.secret.is_empty() {
        return Err(Error::NoCredentials);
    }

    Ok(Credentials {
        username: response.username,
        password: response.secret,
    })
}

//! OCI image documents and the pulled-image handle.
//!
//! After the daemon pulls and unpacks an image, the driver reads the
//! manifest (resolving multi-arch indexes to the host platform) and the
//! image config back out of the content store. The handle carries
//! everything spec assembly needs: the runtime config the image ships and
//! the layer diff-ids the snapshot parent is derived from.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// =============================================================================
// Manifest Documents
// =============================================================================

/// A content descriptor as it appears in manifests and image records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciDescriptor {
    pub media_type: String,
    pub digest: String,
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<OciPlatform>,
}

/// Platform selector inside an image index entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciPlatform {
    pub architecture: String,
    pub os: String,
}

/// An image manifest: config descriptor plus ordered layers.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub config: OciDescriptor,
    pub layers: Vec<OciDescriptor>,
}

/// A multi-arch image index.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageIndex {
    pub manifests: Vec<OciDescriptor>,
}

// =============================================================================
// Image Config
// =============================================================================

/// The runtime portion of an image config document. Field names follow the
/// Docker image spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default, rename = "Env")]
    pub env: Vec<String>,
    #[serde(default, rename = "Cmd")]
    pub cmd: Vec<String>,
    #[serde(default, rename = "Entrypoint")]
    pub entrypoint: Vec<String>,
    #[serde(default, rename = "WorkingDir")]
    pub working_dir: String,
    #[serde(default, rename = "User")]
    pub user: String,
}

/// Rootfs section of an image config: the uncompressed layer digests.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RootFs {
    #[serde(default)]
    pub diff_ids: Vec<String>,
}

/// An OCI image config document, reduced to the fields the driver consumes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageConfigFile {
    #[serde(default)]
    pub config: RuntimeConfig,
    #[serde(default)]
    pub rootfs: RootFs,
}

// =============================================================================
// Pulled-Image Handle
// =============================================================================

/// Handle to an image the daemon has pulled and unpacked.
#[derive(Debug, Clone)]
pub struct ImageHandle {
    /// Fully normalized reference the image is stored under.
    pub name: String,
    /// Digest of the image target (manifest or index).
    pub digest: String,
    /// Runtime config the image ships (entrypoint, cmd, env, cwd, user).
    pub config: RuntimeConfig,
    /// Uncompressed layer digests, bottom to top.
    pub diff_ids: Vec<String>,
}

impl ImageHandle {
    /// Chain id of the unpacked layer stack; the snapshot parent key.
    pub fn chain_id(&self) -> String {
        chain_id(&self.diff_ids)
    }
}

/// Computes the OCI chain id of an ordered diff-id stack.
///
/// `chain(L1) = L1`; `chain(L1..Ln) = sha256(chain(L1..Ln-1) + " " + Ln)`.
pub fn chain_id(diff_ids: &[String]) -> String {
    let mut iter = diff_ids.iter();
    let mut chain = match iter.next() {
        Some(first) => first.clone(),
        None => return String::new(),
    };
    for diff in iter {
        let mut hasher = Sha256::new();
        hasher.update(chain.as_bytes());
        hasher.update(b" ");
        hasher.update(diff.as_bytes());
        chain = format!("sha256:{:x}", hasher.finalize());
    }
    chain
}

/// Host architecture in OCI platform vocabulary.
pub fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_id_single_layer_is_identity() {
        let ids = vec!["sha256:aaaa".to_string()];
        assert_eq!(chain_id(&ids), "sha256:aaaa");
    }

    #[test]
    fn chain_id_is_order_sensitive() {
        let ab = chain_id(&["sha256:a".to_string(), "sha256:b".to_string()]);
        let ba = chain_id(&["sha256:b".to_string(), "sha256:a".to_string()]);
        assert_ne!(ab, ba);
        assert!(ab.starts_with("sha256:"));
    }

    #[test]
    fn chain_id_empty_stack() {
        assert_eq!(chain_id(&[]), "");
    }

    #[test]
    fn image_config_parses_docker_casing() {
        let doc = serde_json::json!({
            "config": {
                "Env": ["PATH=/usr/bin"],
                "Cmd": ["redis-server"],
                "Entrypoint": ["docker-entrypoint.sh"],
                "WorkingDir": "/data",
                "User": "999"
            },
            "rootfs": { "type": "layers", "diff_ids": ["sha256:aa", "sha256:bb"] }
        });
        let parsed: ImageConfigFile = serde_json::from_value(doc).unwrap();
        assert_eq!(parsed.config.cmd, vec!["redis-server"]);
        assert_eq!(parsed.rootfs.diff_ids.len(), 2);
    }
}

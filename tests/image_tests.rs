//! Tests for the Docker reference grammar and image document handling.

use nomad_containerd_driver::image::{chain_id, ImageConfigFile, ImageHandle};
use nomad_containerd_driver::{normalize, parse_container_image, parse_repository_tag};

// =============================================================================
// parse_repository_tag Laws
// =============================================================================

#[test]
fn repository_tag_splits_simple_tag() {
    assert_eq!(
        parse_repository_tag("r:t"),
        ("r".to_string(), "t".to_string())
    );
}

#[test]
fn repository_tag_ignores_digest() {
    assert_eq!(
        parse_repository_tag("r@sha256:8f2e9c3a"),
        ("r".to_string(), String::new())
    );
    assert_eq!(
        parse_repository_tag("busybox:latest@sha256:8f2e9c3a"),
        ("busybox".to_string(), "latest".to_string())
    );
}

#[test]
fn repository_tag_keeps_registry_ports() {
    assert_eq!(
        parse_repository_tag("host:5000/r"),
        ("host:5000/r".to_string(), String::new())
    );
    assert_eq!(
        parse_repository_tag("host:5000/r:t@sha256:8f2e9c3a"),
        ("host:5000/r".to_string(), "t".to_string())
    );
    assert_eq!(
        parse_repository_tag("localhost.localdomain:5000/samalba/hipache:latest"),
        (
            "localhost.localdomain:5000/samalba/hipache".to_string(),
            "latest".to_string()
        )
    );
}

#[test]
fn container_image_digest_only_keeps_pinned_reference() {
    let (repo, tag) = parse_container_image("busybox@sha256:8f2e9c3a");
    assert_eq!(repo, "busybox@sha256:8f2e9c3a");
    assert_eq!(tag, "");

    let (repo, tag) = parse_container_image("busybox");
    assert_eq!(repo, "busybox");
    assert_eq!(tag, "latest");
}

// =============================================================================
// Normalization
// =============================================================================

#[test]
fn normalization_matches_docker_rules() {
    assert_eq!(
        normalize("redis").unwrap().canonical(),
        "docker.io/library/redis:latest"
    );
    assert_eq!(
        normalize("team/app").unwrap().canonical(),
        "docker.io/team/app:latest"
    );
    assert_eq!(
        normalize("ghcr.io/team/app:v2").unwrap().canonical(),
        "ghcr.io/team/app:v2"
    );
    assert_eq!(
        normalize("localhost/app").unwrap().canonical(),
        "localhost/app:latest"
    );
    assert_eq!(
        normalize("registry:5000/app").unwrap().canonical(),
        "registry:5000/app:latest"
    );
}

#[test]
fn index_name_collapses_docker_hub_aliases() {
    assert_eq!(normalize("redis").unwrap().index_name(), "docker.io");
    assert_eq!(
        normalize("index.docker.io/library/redis").unwrap().index_name(),
        "docker.io"
    );
    assert_eq!(
        normalize("quay.io/app").unwrap().index_name(),
        "quay.io"
    );
}

// =============================================================================
// Layer Chain Ids
// =============================================================================

#[test]
fn chain_id_matches_oci_formula_shape() {
    let single = chain_id(&["sha256:aaa".to_string()]);
    assert_eq!(single, "sha256:aaa");

    let double = chain_id(&["sha256:aaa".to_string(), "sha256:bbb".to_string()]);
    assert!(double.starts_with("sha256:"));
    assert_eq!(double.len(), "sha256:".len() + 64);
}

#[test]
fn image_handle_chain_id_uses_diff_ids() {
    let handle = ImageHandle {
        name: "docker.io/library/redis:7".to_string(),
        digest: "sha256:top".to_string(),
        config: Default::default(),
        diff_ids: vec!["sha256:bottom".to_string()],
    };
    assert_eq!(handle.chain_id(), "sha256:bottom");
}

// =============================================================================
// Image Config Documents
// =============================================================================

#[test]
fn image_config_defaults_when_fields_absent() {
    let parsed: ImageConfigFile = serde_json::from_value(serde_json::json!({
        "architecture": "amd64",
        "os": "linux"
    }))
    .unwrap();
    assert!(parsed.config.env.is_empty());
    assert!(parsed.config.entrypoint.is_empty());
    assert!(parsed.rootfs.diff_ids.is_empty());
}

//! Docker reference grammar.
//!
//! Image references follow the normal Docker rules: an optional registry
//! host (detected by a dot, a colon, or `localhost` in the first path
//! component), a repository path that gains a `library/` prefix for
//! single-component Docker Hub names, an optional `:tag`, and an optional
//! `@digest`. Pulls always use the fully normalized form.

use crate::error::{Error, Result};

/// Docker Hub registry host used when a reference carries none.
const DEFAULT_DOMAIN: &str = "docker.io";

/// Index name credentials helpers expect for Docker Hub.
const DOCKER_INDEX_NAME: &str = "docker.io";

/// A reference normalized per the Docker grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host, e.g. `docker.io` or `registry.example.com:5000`.
    pub domain: String,
    /// Repository path, e.g. `library/redis`.
    pub path: String,
    /// Tag, when present. Defaults to `latest` only for digest-less refs.
    pub tag: Option<String>,
    /// Digest, when present (`sha256:…`).
    pub digest: Option<String>,
}

impl ImageReference {
    /// Repository without the registry host, e.g. `library/redis`.
    pub fn repository(&self) -> &str {
        &self.path
    }

    /// Fully qualified reference string handed to the daemon.
    pub fn canonical(&self) -> String {
        let mut out = format!("{}/{}", self.domain, self.path);
        if let Some(tag) = &self.tag {
            out.push(':');
            out.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            out.push('@');
            out.push_str(digest);
        }
        out
    }

    /// Registry index name consulted for credentials. Docker Hub aliases
    /// collapse to `docker.io`; everything else keeps its host verbatim.
    pub fn index_name(&self) -> &str {
        match self.domain.as_str() {
            "docker.io" | "index.docker.io" | "registry-1.docker.io" => DOCKER_INDEX_NAME,
            other => other,
        }
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// Normalizes an image reference per the Docker grammar.
pub fn normalize(reference: &str) -> Result<ImageReference> {
    if reference.is_empty() {
        return Err(Error::InvalidImageReference {
            reference: reference.to_string(),
            reason: "empty reference".to_string(),
        });
    }
    if reference.contains(char::is_whitespace) {
        return Err(Error::InvalidImageReference {
            reference: reference.to_string(),
            reason: "contains whitespace".to_string(),
        });
    }

    // Split off the digest first; tags never contain '@'.
    let (name_and_tag, digest) = match reference.split_once('@') {
        Some((name, digest)) => {
            if !digest.contains(':') {
                return Err(Error::InvalidImageReference {
                    reference: reference.to_string(),
                    reason: "malformed digest".to_string(),
                });
            }
            (name, Some(digest.to_string()))
        }
        None => (reference, None),
    };

    let (name, tag) = split_tag(name_and_tag);

    // The first component is a registry host only when it looks like one.
    let (domain, mut path) = match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_string(), rest.to_string())
        }
        _ => (DEFAULT_DOMAIN.to_string(), name.to_string()),
    };

    if path.is_empty() {
        return Err(Error::InvalidImageReference {
            reference: reference.to_string(),
            reason: "empty repository".to_string(),
        });
    }

    // Single-component Docker Hub names live under library/.
    if domain == DEFAULT_DOMAIN && !path.contains('/') {
        path = format!("library/{path}");
    }

    // A digest pins the image; only digest-less references default the tag.
    let tag = match (tag, &digest) {
        (Some(t), _) => Some(t),
        (None, None) => Some("latest".to_string()),
        (None, Some(_)) => None,
    };

    Ok(ImageReference {
        domain,
        path,
        tag,
        digest,
    })
}

/// Splits a `name[:tag]` string, treating a colon followed by a slash as
/// part of a registry host rather than a tag separator.
fn split_tag(name: &str) -> (&str, Option<String>) {
    match name.rfind(':') {
        Some(idx) if !name[idx + 1..].contains('/') => {
            (&name[..idx], Some(name[idx + 1..].to_string()))
        }
        _ => (name, None),
    }
}

/// Splits a reference into repository and tag, ignoring any digest.
///
/// Some examples:
///
///   localhost:5000/samalba/hipache:latest -> (localhost:5000/samalba/hipache, latest)
///   localhost:5000/samalba/hipache        -> (localhost:5000/samalba/hipache, "")
///   busybox:latest@sha256:4a73…           -> (busybox, latest)
pub fn parse_repository_tag(repo_tag: &str) -> (String, String) {
    let name = repo_tag.split('@').next().unwrap_or(repo_tag);
    match split_tag(name) {
        (repo, Some(tag)) => (repo.to_string(), tag),
        (repo, None) => (repo.to_string(), String::new()),
    }
}

/// Repository and tag for a task image. Digest-only references keep the
/// digest in the repository and an empty tag; everything else defaults the
/// tag to `latest`.
pub fn parse_container_image(image: &str) -> (String, String) {
    let (repo, tag) = parse_repository_tag(image);
    if !tag.is_empty() {
        return (repo, tag);
    }
    if image.contains('@') {
        // Digest pull: the repository carries the full pinned reference.
        (image.to_string(), tag)
    } else {
        (repo, "latest".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_tag_laws() {
        assert_eq!(
            parse_repository_tag("r:t"),
            ("r".to_string(), "t".to_string())
        );
        assert_eq!(
            parse_repository_tag("r@sha256:4a731fb46adc5cef"),
            ("r".to_string(), String::new())
        );
        assert_eq!(
            parse_repository_tag("host:5000/r"),
            ("host:5000/r".to_string(), String::new())
        );
        assert_eq!(
            parse_repository_tag("host:5000/r:t@sha256:4a731fb46adc5cef"),
            ("host:5000/r".to_string(), "t".to_string())
        );
    }

    #[test]
    fn container_image_defaults_tag() {
        assert_eq!(
            parse_container_image("busybox"),
            ("busybox".to_string(), "latest".to_string())
        );
        assert_eq!(
            parse_container_image("busybox:musl"),
            ("busybox".to_string(), "musl".to_string())
        );
    }

    #[test]
    fn container_image_digest_only_keeps_full_reference() {
        let (repo, tag) = parse_container_image("busybox@sha256:4a731fb46adc5cef");
        assert_eq!(repo, "busybox@sha256:4a731fb46adc5cef");
        assert_eq!(tag, "");
    }

    #[test]
    fn normalize_bare_name() {
        let r = normalize("redis").unwrap();
        assert_eq!(r.canonical(), "docker.io/library/redis:latest");
        assert_eq!(r.index_name(), "docker.io");
    }

    #[test]
    fn normalize_private_registry() {
        let r = normalize("registry.example.com:5000/team/app:v3").unwrap();
        assert_eq!(r.domain, "registry.example.com:5000");
        assert_eq!(r.path, "team/app");
        assert_eq!(r.tag.as_deref(), Some("v3"));
        assert_eq!(r.index_name(), "registry.example.com:5000");
    }

    #[test]
    fn normalize_digest_reference_has_no_default_tag() {
        let r = normalize("busybox@sha256:4a731fb46adc5cef").unwrap();
        assert_eq!(r.tag, None);
        assert_eq!(r.digest.as_deref(), Some("sha256:4a731fb46adc5cef"));
        assert_eq!(
            r.canonical(),
            "docker.io/library/busybox@sha256:4a731fb46adc5cef"
        );
    }

    #[test]
    fn normalize_rejects_garbage() {
        assert!(normalize("").is_err());
        assert!(normalize("bad ref").is_err());
        assert!(normalize("busybox@latest").is_err());
    }
}

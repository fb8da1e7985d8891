//! The well-known image registry maps short references like `ubuntu:24.04` to
//! the canonical HTTPS URL of the corresponding cloud image.
//!
//! The registry is process-wide. Tests that need to point a short reference at
//! a local HTTP server should use [`set`] and [`reset`] rather than reaching
//! into the table; `reset` restores the built-in entries.

use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::RwLock;

/// A registered image: where to fetch it and what it is.
///
/// Upstream cloud images are re-published in place, so the built-in entries
/// intentionally carry no checksum; callers that need verification supply
/// their own SHA-256.
#[derive(Debug, Clone)]
pub struct WellKnownImage {
    pub url: String,
    pub description: String,
    pub sha256: Option<String>,
}

fn builtin() -> HashMap<String, WellKnownImage> {
    let mut table = HashMap::new();
    table.insert(
        "ubuntu:24.04".to_string(),
        WellKnownImage {
            url: "https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-amd64.img"
                .to_string(),
            description: "Ubuntu 24.04 LTS (Noble Numbat) cloud image".to_string(),
            sha256: None,
        },
    );
    table.insert(
        "ubuntu:22.04".to_string(),
        WellKnownImage {
            url: "https://cloud-images.ubuntu.com/jammy/current/jammy-server-cloudimg-amd64.img"
                .to_string(),
            description: "Ubuntu 22.04 LTS (Jammy Jellyfish) cloud image".to_string(),
            sha256: None,
        },
    );
    table.insert(
        "debian:12".to_string(),
        WellKnownImage {
            url: "https://cloud.debian.org/images/cloud/bookworm/latest/debian-12-genericcloud-amd64.qcow2"
                .to_string(),
            description: "Debian 12 (Bookworm) generic cloud image".to_string(),
            sha256: None,
        },
    );
    table.insert(
        "fedora:40".to_string(),
        WellKnownImage {
            url: "https://download.fedoraproject.org/pub/fedora/linux/releases/40/Cloud/x86_64/images/Fedora-Cloud-Base-Generic.x86_64-40-1.14.qcow2"
                .to_string(),
            description: "Fedora 40 cloud base image".to_string(),
            sha256: None,
        },
    );
    table
}

lazy_static! {
    static ref REGISTRY: RwLock<HashMap<String, WellKnownImage>> = RwLock::new(builtin());
}

/// Looks up a short reference, returning the registered image if one exists.
pub fn resolve(reference: &str) -> Option<WellKnownImage> {
    REGISTRY
        .read()
        .expect("well-known registry lock poisoned")
        .get(reference)
        .cloned()
}

/// True if the reference is registered.
pub fn is_well_known(reference: &str) -> bool {
    resolve(reference).is_some()
}

/// Registers or replaces an entry. Intended for tests.
pub fn set(reference: &str, image: WellKnownImage) {
    REGISTRY
        .write()
        .expect("well-known registry lock poisoned")
        .insert(reference.to_string(), image);
}

/// Restores the built-in table. Intended for tests.
pub fn reset() {
    *REGISTRY
        .write()
        .expect("well-known registry lock poisoned") = builtin();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_entries_resolve() {
        reset();
        let ubuntu = resolve("ubuntu:24.04").unwrap();
        assert!(ubuntu.url.starts_with("https://"));
        assert!(ubuntu.sha256.is_none());
        assert!(resolve("debian:12").is_some());
        assert!(!is_well_known("ubuntu:nope"));
    }

    #[test]
    fn set_and_reset_round_trip() {
        set(
            "ubuntu:24.04",
            WellKnownImage {
                url: "https://mirror.example.test/noble.img".to_string(),
                description: "test override".to_string(),
                sha256: Some("abc".to_string()),
            },
        );
        assert_eq!(
            resolve("ubuntu:24.04").unwrap().url,
            "https://mirror.example.test/noble.img"
        );

        reset();
        assert!(resolve("ubuntu:24.04")
            .unwrap()
            .url
            .contains("cloud-images.ubuntu.com"));
    }
}

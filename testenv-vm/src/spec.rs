//! The declarative environment spec: providers, keys, networks, VMs, images.
//!
//! Specs are written as YAML. Kind-specific fields are typed here; the
//! per-resource `providerSpec` block is opaque and passed through to the
//! provider untouched.

use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};
use std::fmt;
use std::path::{Path, PathBuf};

pub use error::{Error, Result};

/// Resource kinds the engine knows how to realize.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Key,
    Network,
    Vm,
    Image,
}

serde_plain::derive_display_from_serialize!(ResourceKind);
serde_plain::derive_fromstr_from_deserialize!(ResourceKind);

/// A (kind, name) pair identifying one resource in a spec.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    /// The caller-visible identity of a created resource.
    pub fn uri(&self) -> String {
        format!("testenv-vm://{}/{}", self.kind, self.name)
    }

    /// Parses a `testenv-vm://<kind>/<name>` URI.
    pub fn from_uri(uri: &str) -> Option<Self> {
        let rest = uri.strip_prefix("testenv-vm://")?;
        let (kind, name) = rest.split_once('/')?;
        if name.is_empty() {
            return None;
        }
        let kind = kind.parse().ok()?;
        Some(Self::new(kind, name))
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} \"{}\"", self.kind, self.name)
    }
}

/// One provider declaration: a name and the engine specifier used to launch it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProviderConfig {
    pub name: String,
    pub engine: String,
    #[serde(default)]
    pub default: bool,
}

/// A named resource of kind-specific type `T` plus its opaque provider block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource<T> {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub spec: T,
    #[serde(default, skip_serializing_if = "serde_yaml::Mapping::is_empty")]
    pub provider_spec: serde_yaml::Mapping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Rsa,
    Ed25519,
    Ecdsa,
}

serde_plain::derive_display_from_serialize!(KeyType);

impl Default for KeyType {
    fn default() -> Self {
        KeyType::Ed25519
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySpec {
    #[serde(default, rename = "type")]
    pub key_type: KeyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bits: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,
    #[serde(default)]
    pub dhcp: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attach_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmSpec {
    #[serde(rename = "memoryMiB")]
    pub memory_mib: i64,
    pub vcpus: i64,
    #[serde(default, rename = "diskGiB", skip_serializing_if = "Option::is_none")]
    pub disk_gib: Option<i64>,
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,
    #[serde(default, skip_serializing_if = "serde_yaml::Mapping::is_empty")]
    pub cloud_init: serde_yaml::Mapping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

/// A full environment spec.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub providers: Vec<ProviderConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<Resource<KeySpec>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<Resource<NetworkSpec>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vms: Vec<Resource<VmSpec>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<Resource<ImageSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_base_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_cache_dir: Option<PathBuf>,
}

impl EnvSpec {
    /// Parses a spec from raw YAML bytes.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        ensure!(
            !data.iter().all(u8::is_ascii_whitespace),
            error::EmptyInputSnafu
        );
        serde_yaml::from_slice(data).context(error::SyntaxSnafu)
    }

    /// Parses a spec from a YAML file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).context(error::FileReadSnafu { path })?;
        Self::from_slice(&data)
    }

    /// Builds a spec from an untyped mapping by round-tripping through the
    /// YAML serializer, which preserves nested typing without a bespoke
    /// coercer.
    pub fn from_mapping(mapping: serde_yaml::Mapping) -> Result<Self> {
        let text =
            serde_yaml::to_string(&serde_yaml::Value::Mapping(mapping)).context(error::ReserializeSnafu)?;
        Self::from_slice(text.as_bytes())
    }

    /// Name of the provider used when a resource names none: the explicit
    /// `defaultProvider`, else the provider carrying the `default` flag, else
    /// the sole provider.
    pub fn default_provider_name(&self) -> Option<&str> {
        if let Some(name) = &self.default_provider {
            return Some(name);
        }
        if let Some(config) = self.providers.iter().find(|p| p.default) {
            return Some(&config.name);
        }
        match self.providers.as_slice() {
            [only] => Some(&only.name),
            _ => None,
        }
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name.clone()).collect()
    }

    /// Resolves an image reference (name or alias) to the image's name.
    pub fn canonical_image_name(&self, reference: &str) -> Option<&str> {
        self.images
            .iter()
            .find(|image| {
                image.name == reference || image.spec.aliases.iter().any(|a| a == reference)
            })
            .map(|image| image.name.as_str())
    }

    /// Every (kind, name) pair defined by this spec.
    pub fn resource_refs(&self) -> Vec<ResourceRef> {
        let mut refs = Vec::new();
        refs.extend(
            self.keys
                .iter()
                .map(|r| ResourceRef::new(ResourceKind::Key, &r.name)),
        );
        refs.extend(
            self.networks
                .iter()
                .map(|r| ResourceRef::new(ResourceKind::Network, &r.name)),
        );
        refs.extend(
            self.vms
                .iter()
                .map(|r| ResourceRef::new(ResourceKind::Vm, &r.name)),
        );
        refs.extend(
            self.images
                .iter()
                .map(|r| ResourceRef::new(ResourceKind::Image, &r.name)),
        );
        refs
    }
}

mod error {
    use snafu::Snafu;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("empty input"))]
        EmptyInput,

        #[snafu(display("Failed to read spec file '{}': {}", path.display(), source))]
        FileRead {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("Failed to re-serialize spec mapping: {}", source))]
        Reserialize { source: serde_yaml::Error },

        #[snafu(display("syntax error in spec: {}", source))]
        Syntax { source: serde_yaml::Error },
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
providers:
  - name: libvirt
    engine: go://github.com/forge/provider-libvirt/cmd/provider
    default: true
keys:
  - name: test-key
    spec:
      type: ed25519
networks:
  - name: test-network
    spec:
      cidr: 192.0.2.0/24
      dhcp: true
vms:
  - name: test-vm
    spec:
      memoryMiB: 1024
      vcpus: 1
      diskGiB: 10
      network: test-network
      cloudInit:
        users:
          - name: tester
            sshAuthorizedKeys:
              - "{{ .Keys.test-key.PublicKey }}"
"#;

    #[test]
    fn basic_spec_parses() {
        let spec = EnvSpec::from_slice(BASIC.as_bytes()).unwrap();
        assert_eq!(spec.providers.len(), 1);
        assert_eq!(spec.keys[0].spec.key_type, KeyType::Ed25519);
        assert_eq!(spec.networks[0].spec.cidr.as_deref(), Some("192.0.2.0/24"));
        assert!(spec.networks[0].spec.dhcp);
        assert_eq!(spec.vms[0].spec.memory_mib, 1024);
        assert_eq!(spec.vms[0].spec.network, "test-network");
        assert_eq!(spec.default_provider_name(), Some("libvirt"));
    }

    #[test]
    fn empty_input_is_a_distinct_error() {
        let err = EnvSpec::from_slice(b"   \n  ").unwrap_err();
        assert_eq!(err.to_string(), "empty input");
    }

    #[test]
    fn syntax_errors_carry_location() {
        let err = EnvSpec::from_slice(b"providers: [unclosed").unwrap_err();
        assert!(err.to_string().contains("syntax error"));
    }

    #[test]
    fn mapping_round_trip_preserves_nesting() {
        let spec = EnvSpec::from_slice(BASIC.as_bytes()).unwrap();
        let value = serde_yaml::to_value(&spec).unwrap();
        let mapping = match value {
            serde_yaml::Value::Mapping(m) => m,
            other => panic!("expected mapping, got {:?}", other),
        };
        let reparsed = EnvSpec::from_mapping(mapping).unwrap();
        assert_eq!(spec, reparsed);
    }

    #[test]
    fn managed_uri_round_trip() {
        let vm = ResourceRef::new(ResourceKind::Vm, "test-vm");
        assert_eq!(vm.uri(), "testenv-vm://vm/test-vm");
        assert_eq!(ResourceRef::from_uri(&vm.uri()).unwrap(), vm);
        assert_eq!(ResourceRef::from_uri("testenv-vm://vm/"), None);
        assert_eq!(ResourceRef::from_uri("other://vm/x"), None);
        assert_eq!(ResourceRef::from_uri("testenv-vm://widget/x"), None);
    }

    #[test]
    fn image_aliases_resolve_to_the_canonical_name() {
        let spec = EnvSpec {
            images: vec![Resource {
                name: "noble".to_string(),
                provider: None,
                spec: ImageSpec {
                    source: "ubuntu:24.04".to_string(),
                    sha256: None,
                    aliases: vec!["ubuntu-lts".to_string()],
                },
                provider_spec: serde_yaml::Mapping::new(),
            }],
            ..Default::default()
        };
        assert_eq!(spec.canonical_image_name("noble"), Some("noble"));
        assert_eq!(spec.canonical_image_name("ubuntu-lts"), Some("noble"));
        assert_eq!(spec.canonical_image_name("jammy"), None);
    }

    #[test]
    fn default_provider_falls_back_to_the_sole_provider() {
        let spec = EnvSpec {
            providers: vec![ProviderConfig {
                name: "stub".to_string(),
                engine: "./stub-provider".to_string(),
                default: false,
            }],
            ..Default::default()
        };
        assert_eq!(spec.default_provider_name(), Some("stub"));
    }
}

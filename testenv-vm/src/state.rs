//! Environment state: the persisted record of everything a test run created.
//!
//! One JSON file per test id, written atomically (temp-file + rename) so a
//! reader always sees either the previous state or the new one, never a torn
//! write.

use crate::spec::{EnvSpec, ResourceKind, ResourceRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub use error::{Error, Result};

const STATE_SUBDIR: &str = "state";
const FILE_PREFIX: &str = "testenv-";
const FILE_SUFFIX: &str = ".json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentStatus {
    Creating,
    Ready,
    Failed,
    Destroying,
    Destroyed,
}

serde_plain::derive_display_from_serialize!(EnvironmentStatus);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    Creating,
    Ready,
    Failed,
    Destroyed,
}

serde_plain::derive_display_from_serialize!(ResourceStatus);

/// The record of one created resource: which provider realized it, where it
/// is in its lifecycle, and the opaque attribute bag the provider returned
/// (ip, mac, sshCommand, privateKeyPath, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceState {
    pub provider: String,
    pub status: ResourceStatus,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub state: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceState {
    pub fn creating(provider: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            provider: provider.into(),
            status: ResourceStatus::Creating,
            state: BTreeMap::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Convenience accessor for string-valued bag entries.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.state.get(key).and_then(serde_json::Value::as_str)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMap {
    #[serde(default)]
    pub keys: BTreeMap<String, ResourceState>,
    #[serde(default)]
    pub networks: BTreeMap<String, ResourceState>,
    #[serde(default)]
    pub vms: BTreeMap<String, ResourceState>,
}

impl ResourceMap {
    pub fn by_kind(&self, kind: ResourceKind) -> Option<&BTreeMap<String, ResourceState>> {
        match kind {
            ResourceKind::Key => Some(&self.keys),
            ResourceKind::Network => Some(&self.networks),
            ResourceKind::Vm => Some(&self.vms),
            // Images live in the shared cache, not in per-test state.
            ResourceKind::Image => None,
        }
    }

    pub fn by_kind_mut(
        &mut self,
        kind: ResourceKind,
    ) -> Option<&mut BTreeMap<String, ResourceState>> {
        match kind {
            ResourceKind::Key => Some(&mut self.keys),
            ResourceKind::Network => Some(&mut self.networks),
            ResourceKind::Vm => Some(&mut self.vms),
            ResourceKind::Image => None,
        }
    }

    pub fn get(&self, resource: &ResourceRef) -> Option<&ResourceState> {
        self.by_kind(resource.kind)?.get(&resource.name)
    }
}

/// The full persisted environment record for one test id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentState {
    pub id: String,
    pub stage: String,
    pub status: EnvironmentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub spec: EnvSpec,
    #[serde(default)]
    pub execution_plan: Vec<Vec<ResourceRef>>,
    #[serde(default)]
    pub resources: ResourceMap,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl EnvironmentState {
    pub fn new(id: impl Into<String>, spec: EnvSpec) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            stage: "create".to_string(),
            status: EnvironmentStatus::Creating,
            created_at: now,
            updated_at: now,
            spec,
            execution_plan: Vec::new(),
            resources: ResourceMap::default(),
            errors: Vec::new(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.touch();
    }

    /// URIs of every resource the environment tracks, in creation-plan order.
    pub fn managed_resources(&self) -> Vec<String> {
        let mut uris = Vec::new();
        for phase in &self.execution_plan {
            for r in phase {
                if self.resources.get(r).is_some() {
                    uris.push(r.uri());
                }
            }
        }
        uris
    }
}

/// Atomic JSON persistence of environment state keyed by test id.
#[derive(Debug, Clone)]
pub struct StateStore {
    base: PathBuf,
}

impl StateStore {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
        }
    }

    fn state_dir(&self) -> PathBuf {
        self.base.join(STATE_SUBDIR)
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        ensure!(!id.is_empty(), error::EmptyIdSnafu);
        Ok(self
            .state_dir()
            .join(format!("{}{}{}", FILE_PREFIX, id, FILE_SUFFIX)))
    }

    pub fn save(&self, state: &EnvironmentState) -> Result<()> {
        let path = self.path_for(&state.id)?;
        let dir = self.state_dir();
        fs::create_dir_all(&dir).context(error::MkdirSnafu { path: &dir })?;

        let raw = serde_json::to_string_pretty(state).context(error::SerializeSnafu)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, raw).context(error::WriteSnafu { path: &tmp })?;
        fs::rename(&tmp, &path).context(error::RenameSnafu {
            from: &tmp,
            to: &path,
        })?;
        Ok(())
    }

    pub fn load(&self, id: &str) -> Result<EnvironmentState> {
        let path = self.path_for(id)?;
        let raw = fs::read_to_string(&path).context(error::ReadSnafu { path: &path })?;
        serde_json::from_str(&raw).context(error::ParseSnafu { path: &path })
    }

    /// Lists the test ids with persisted state.
    pub fn list(&self) -> Result<Vec<String>> {
        let dir = self.state_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        let entries = fs::read_dir(&dir).context(error::ReadSnafu { path: &dir })?;
        for entry in entries {
            let entry = entry.context(error::ReadSnafu { path: &dir })?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if let Some(id) = file_name
                .strip_prefix(FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
            {
                if !id.is_empty() {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Removes the state file for `id`. Missing state is not an error.
    pub fn delete(&self, id: &str) -> Result<()> {
        let path = self.path_for(id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(error::RemoveSnafu { path }),
        }
    }
}

/// Maps a resource kind+name to its state entry, creating the entry if absent.
pub fn upsert_resource<'a>(
    state: &'a mut EnvironmentState,
    resource: &ResourceRef,
    entry: ResourceState,
) -> Result<&'a mut ResourceState> {
    let map = state
        .resources
        .by_kind_mut(resource.kind)
        .context(error::UntrackedKindSnafu {
            kind: resource.kind,
        })?;
    Ok(map.entry(resource.name.clone()).or_insert(entry))
}

mod error {
    use crate::spec::ResourceKind;
    use snafu::Snafu;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("test id must not be empty"))]
        EmptyId,

        #[snafu(display("Failed to create state directory '{}': {}", path.display(), source))]
        Mkdir {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("Failed to parse state file '{}': {}", path.display(), source))]
        Parse {
            path: PathBuf,
            source: serde_json::Error,
        },

        #[snafu(display("Failed to read state at '{}': {}", path.display(), source))]
        Read {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("Failed to remove state file '{}': {}", path.display(), source))]
        Remove {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("Failed to rename '{}' to '{}': {}", from.display(), to.display(), source))]
        Rename {
            from: PathBuf,
            to: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("Failed to serialize environment state: {}", source))]
        Serialize { source: serde_json::Error },

        #[snafu(display("resources of kind {} are not tracked in state", kind))]
        UntrackedKind { kind: ResourceKind },

        #[snafu(display("Failed to write state file '{}': {}", path.display(), source))]
        Write {
            path: PathBuf,
            source: std::io::Error,
        },
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

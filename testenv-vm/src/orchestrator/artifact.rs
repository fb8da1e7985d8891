//! Artifact assembly: the surface a calling test harness consumes.
//!
//! Key layout:
//! * metadata: `testenv-vm.<kind>.<name>.<attr>` for every string attribute a
//!   provider returned;
//! * files: `testenv-vm.key.<name>` pointing at the private key on disk;
//! * env: `TESTENV_VM_<NAME>_IP` / `_SSH` convenience variables;
//! * managed resources: `testenv-vm://<kind>/<name>` URIs in plan order.

use crate::spec::ResourceKind;
use crate::state::EnvironmentState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

const PREFIX: &str = "testenv-vm";

/// The output of a successful create.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub test_id: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub files: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub managed_resources: Vec<String>,
}

/// Builds the artifact from the final environment state.
pub(crate) fn assemble(state: &EnvironmentState) -> Artifact {
    let mut artifact = Artifact {
        test_id: state.id.clone(),
        managed_resources: state.managed_resources(),
        ..Artifact::default()
    };

    let kinds = [
        (ResourceKind::Key, &state.resources.keys),
        (ResourceKind::Network, &state.resources.networks),
        (ResourceKind::Vm, &state.resources.vms),
    ];
    for (kind, resources) in kinds {
        for (name, resource) in resources {
            for (attr, value) in &resource.state {
                if let Some(value) = value.as_str() {
                    artifact.metadata.insert(
                        format!("{}.{}.{}.{}", PREFIX, kind, name, attr),
                        value.to_string(),
                    );
                }
            }
        }
    }

    for (name, key) in &state.resources.keys {
        if let Some(path) = key.attr("privateKeyPath") {
            artifact
                .files
                .insert(format!("{}.key.{}", PREFIX, name), PathBuf::from(path));
        }
    }

    for (name, vm) in &state.resources.vms {
        if let Some(ip) = vm.attr("ip") {
            artifact
                .env
                .insert(format!("TESTENV_VM_{}_IP", env_name(name)), ip.to_string());
        }
        if let Some(ssh) = vm.attr("sshCommand") {
            artifact
                .env
                .insert(format!("TESTENV_VM_{}_SSH", env_name(name)), ssh.to_string());
        }
    }

    artifact
}

/// Uppercases a resource name into an environment-variable fragment.
fn env_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

//! Mid-test VM provisioning.
//!
//! After a successful create, the runtime provisioner owns the environment
//! state for the duration of the test phase and can add or remove VMs using
//! the same rendering, validation and provider pipeline the orchestrator
//! used. The locking discipline is strict: the state mutex is never held
//! across rendering (CPU) or provider calls (network I/O) — lock to reserve
//! the name, release, work, lock to publish the outcome.

use crate::cloud_init;
use crate::orchestrator::SharedEnv;
use crate::provider::ProviderManager;
use crate::spec::{Resource, ResourceKind, ResourceRef, VmSpec};
use crate::state::{ResourceState, ResourceStatus, StateStore};
use crate::template;
use crate::validate;
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use remote_exec::VmInfo;
use serde_json::json;
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use error::{Error, Result};

pub struct RuntimeProvisioner {
    manager: Arc<ProviderManager>,
    store: StateStore,
    shared: Arc<SharedEnv>,
}

impl RuntimeProvisioner {
    pub(crate) fn new(
        manager: Arc<ProviderManager>,
        store: StateStore,
        shared: Arc<SharedEnv>,
    ) -> Self {
        Self {
            manager,
            store,
            shared,
        }
    }

    /// Creates one VM mid-test.
    ///
    /// The name is reserved under the lock first so concurrent calls cannot
    /// race it; rendering and the provider call run with the lock released.
    pub async fn create_vm(&self, cancel: &CancellationToken, vm: Resource<VmSpec>) -> Result<()> {
        let name = vm.name.clone();
        let resource = ResourceRef::new(ResourceKind::Vm, &name);

        // Reserve the name.
        let (networks, provider_candidates, default_provider) = {
            let mut guard = self.shared.state.lock().await;
            let state = guard.as_mut().context(error::NoStateSnafu)?;
            ensure!(
                !state.resources.vms.contains_key(&name),
                error::AlreadyExistsSnafu { name: &name }
            );
            state
                .resources
                .vms
                .insert(name.clone(), ResourceState::creating(String::new()));
            (
                state
                    .spec
                    .networks
                    .iter()
                    .map(|n| n.name.clone())
                    .collect::<BTreeSet<String>>(),
                state.spec.provider_names(),
                state.spec.default_provider_name().map(str::to_string),
            )
        };

        match self
            .realize_vm(cancel, &vm, &networks, &provider_candidates, default_provider)
            .await
        {
            Ok((provider_name, bag)) => {
                let snapshot = {
                    let mut guard = self.shared.state.lock().await;
                    let state = guard.as_mut().context(error::NoStateSnafu)?;
                    if let Some(entry) = state.resources.vms.get_mut(&name) {
                        entry.provider = provider_name;
                        entry.state = bag.clone();
                        entry.status = ResourceStatus::Ready;
                        entry.updated_at = Utc::now();
                    }
                    state.spec.vms.push(vm.clone());
                    state.execution_plan.push(vec![resource.clone()]);
                    state.touch();
                    state.clone()
                };
                {
                    let mut context = self.shared.context.lock().await;
                    context.vms.insert(
                        name.clone(),
                        crate::template::VmTemplateData {
                            name: name.clone(),
                            ip: string_attr(&bag, "ip"),
                            mac: string_attr(&bag, "mac"),
                            ssh_command: string_attr(&bag, "sshCommand"),
                        },
                    );
                }
                self.store.save(&snapshot).context(error::StateSnafu)?;
                info!("Runtime VM '{}' is ready", name);
                Ok(())
            }
            Err(e) => {
                let snapshot = {
                    let mut guard = self.shared.state.lock().await;
                    let state = guard.as_mut().context(error::NoStateSnafu)?;
                    if let Some(entry) = state.resources.vms.get_mut(&name) {
                        entry.status = ResourceStatus::Failed;
                        entry.error = Some(e.to_string());
                        entry.updated_at = Utc::now();
                    }
                    state.record_error(format!("vm \"{}\": {}", name, e));
                    state.clone()
                };
                let _ = self.store.save(&snapshot);
                Err(e)
            }
        }
    }

    /// Rendering, validation and the provider call — no locks held here.
    async fn realize_vm(
        &self,
        cancel: &CancellationToken,
        vm: &Resource<VmSpec>,
        networks: &BTreeSet<String>,
        provider_candidates: &[String],
        default_provider: Option<String>,
    ) -> Result<(String, std::collections::BTreeMap<String, serde_json::Value>)> {
        let name = &vm.name;
        ensure!(
            vm.spec.memory_mib > 0 && vm.spec.vcpus > 0,
            error::InvalidShapeSnafu { name }
        );

        let context = self.shared.context.lock().await.clone();
        let rendered =
            template::render_spec(vm, &context).context(error::TemplateSnafu { name })?;
        validate::phase2_vm(name, &rendered.spec, networks)
            .context(error::ValidationSnafu)?;

        let provider_name = match &rendered.provider {
            Some(provider) => provider.clone(),
            None => self
                .manager
                .provider_for_resource(
                    ResourceKind::Vm,
                    provider_candidates,
                    default_provider.as_deref(),
                )
                .await
                .context(error::NoProviderSnafu { name })?,
        };

        let client = self
            .manager
            .client(&provider_name)
            .await
            .context(error::CallSnafu { name })?;
        let payload = json!({
            "name": name,
            "spec": encode(name, &rendered.spec)?,
            "providerSpec": encode(name, &rendered.provider_spec)?,
        });
        let result = client
            .call_with_cancel(cancel, "vm_create", payload)
            .await
            .context(error::CallSnafu { name })?;

        if !result.success {
            let message = result
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "unspecified provider failure".to_string());
            return error::ProviderFailedSnafu {
                name,
                operation: "vm_create",
                message,
            }
            .fail();
        }

        let mut bag: std::collections::BTreeMap<String, serde_json::Value> =
            match result.resource {
                serde_json::Value::Object(map) => map.into_iter().collect(),
                serde_json::Value::Null => Default::default(),
                other => std::iter::once(("value".to_string(), other)).collect(),
            };
        let cloud_init_value = encode(name, &rendered.spec.cloud_init)?;
        cloud_init::derive_ssh_attrs(&mut bag, &cloud_init_value, &context);
        Ok((provider_name, bag))
    }

    /// Deletes a runtime VM, best-effort: the state is marked destroyed and
    /// persisted whatever the provider says; the provider's error, if any, is
    /// returned afterwards.
    pub async fn delete_vm(&self, cancel: &CancellationToken, name: &str) -> Result<()> {
        let (provider_name, bag) = {
            let guard = self.shared.state.lock().await;
            let state = guard.as_ref().context(error::NoStateSnafu)?;
            let entry = state
                .resources
                .vms
                .get(name)
                .context(error::UnknownVmSnafu { name })?;
            (entry.provider.clone(), entry.state.clone())
        };

        let provider_outcome = match self.manager.client(&provider_name).await {
            Ok(client) => client
                .call_with_cancel(cancel, "vm_delete", json!({ "name": name, "state": bag }))
                .await
                .context(error::CallSnafu { name })
                .and_then(|result| {
                    if result.success {
                        Ok(())
                    } else {
                        let message = result
                            .error
                            .map(|e| e.message)
                            .unwrap_or_else(|| "unspecified provider failure".to_string());
                        error::ProviderFailedSnafu {
                            name,
                            operation: "vm_delete",
                            message,
                        }
                        .fail()
                    }
                }),
            Err(e) => Err(e).context(error::CallSnafu { name }),
        };
        if let Err(e) = &provider_outcome {
            warn!("vm_delete for '{}' failed: {}", name, e);
        }

        let snapshot = {
            let mut guard = self.shared.state.lock().await;
            let state = guard.as_mut().context(error::NoStateSnafu)?;
            if let Some(entry) = state.resources.vms.get_mut(name) {
                entry.status = ResourceStatus::Destroyed;
                entry.updated_at = Utc::now();
            }
            state.touch();
            state.clone()
        };
        self.store.save(&snapshot).context(error::StateSnafu)?;
        {
            let mut context = self.shared.context.lock().await;
            context.vms.remove(name);
        }
        debug!("Runtime VM '{}' destroyed", name);
        provider_outcome
    }

    /// Connection info for a ready VM, with explicit diagnostics for each
    /// missing attribute. The private key is re-read from disk on every call
    /// so a mid-test rekey is observed.
    pub async fn get_vm_info(&self, name: &str) -> Result<VmInfo> {
        let (status, ip, user, key_path, port) = {
            let guard = self.shared.state.lock().await;
            let state = guard.as_ref().context(error::NoStateSnafu)?;
            let entry = state
                .resources
                .vms
                .get(name)
                .context(error::UnknownVmSnafu { name })?;
            (
                entry.status,
                entry.attr("ip").map(str::to_string),
                entry.attr("sshUser").map(str::to_string),
                entry.attr("privateKeyPath").map(str::to_string),
                entry
                    .attr("sshPort")
                    .and_then(|p| p.parse::<u16>().ok())
                    .unwrap_or(22),
            )
        };

        ensure!(
            status == ResourceStatus::Ready,
            error::NotReadySnafu {
                name,
                status: status.to_string(),
            }
        );
        let host = ip.context(error::MissingAttrSnafu { name, attr: "ip" })?;
        let user = user.context(error::MissingAttrSnafu {
            name,
            attr: "sshUser",
        })?;
        let key_path = key_path.context(error::MissingAttrSnafu {
            name,
            attr: "privateKeyPath",
        })?;
        let private_key = std::fs::read(&key_path).context(error::KeyReadSnafu {
            name,
            path: key_path,
        })?;

        Ok(VmInfo {
            host,
            port,
            user,
            private_key,
        })
    }
}

#[async_trait]
impl remote_exec::ClientProvider for RuntimeProvisioner {
    async fn vm_info(&self, name: &str) -> remote_exec::Result<VmInfo> {
        self.get_vm_info(name)
            .await
            .map_err(|e| remote_exec::Error::Provider {
                vm: name.to_string(),
                message: e.to_string(),
            })
    }
}

fn string_attr(
    bag: &std::collections::BTreeMap<String, serde_json::Value>,
    key: &str,
) -> String {
    bag.get(key)
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn encode<T: serde::Serialize>(name: &str, value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).context(error::EncodeSnafu { name })
}

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("vm \"{}\" already exists", name))]
        AlreadyExists { name: String },

        #[snafu(display("provider transport failure for vm \"{}\": {}", name, source))]
        Call {
            name: String,
            source: crate::provider::Error,
        },

        #[snafu(display("Failed to encode spec of vm \"{}\": {}", name, source))]
        Encode {
            name: String,
            source: serde_json::Error,
        },

        #[snafu(display("vm \"{}\": memory and vcpus must be > 0", name))]
        InvalidShape { name: String },

        #[snafu(display(
            "Failed to read private key '{}' for vm \"{}\": {}",
            path,
            name,
            source
        ))]
        KeyRead {
            name: String,
            path: String,
            source: std::io::Error,
        },

        #[snafu(display("vm \"{}\" has no recorded {}", name, attr))]
        MissingAttr { name: String, attr: String },

        #[snafu(display("no provider supports vm \"{}\"", name))]
        NoProvider { name: String },

        #[snafu(display("no environment state is loaded"))]
        NoState,

        #[snafu(display("vm \"{}\" is not ready (status: {})", name, status))]
        NotReady { name: String, status: String },

        #[snafu(display("vm \"{}\" failed during {}: {}", name, operation, message))]
        ProviderFailed {
            name: String,
            operation: String,
            message: String,
        },

        #[snafu(display("Failed to persist environment state: {}", source))]
        State { source: crate::state::Error },

        #[snafu(display("Failed to render vm \"{}\": {}", name, source))]
        Template {
            name: String,
            source: crate::template::Error,
        },

        #[snafu(display("vm \"{}\" is not known to this environment", name))]
        UnknownVm { name: String },

        #[snafu(display("{}", source))]
        Validation { source: crate::validate::Error },
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

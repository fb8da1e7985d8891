//! The orchestrator: turns a validated spec into a running environment and
//! back.
//!
//! Create runs in phases computed by [`dag`]: within a phase every resource
//! is independent and created in parallel; a resource's attributes are
//! published into the template context only after it is `ready` and
//! persisted, so later phases always render against a consistent snapshot.
//! On failure, previously-created resources are deleted in reverse creation
//! order, best-effort.

pub mod artifact;
pub mod dag;
mod error;

pub use artifact::Artifact;
pub use error::{Error, Result};

use crate::cloud_init;
use crate::provider::ProviderManager;
use crate::spec::{EnvSpec, ResourceKind, ResourceRef};
use crate::state::{
    upsert_resource, EnvironmentState, EnvironmentStatus, ResourceState, ResourceStatus,
    StateStore,
};
use crate::template::{
    self, ImageTemplateData, KeyTemplateData, NetworkTemplateData, TemplateContext,
    VmTemplateData,
};
use crate::validate::{self, TemplatedFields};
use chrono::Utc;
use image_cache::ImageCache;
use log::{debug, info, warn};
use serde_json::json;
use snafu::{OptionExt, ResultExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Input to [`Orchestrator::create`].
#[derive(Debug, Clone)]
pub struct CreateInput {
    pub spec: EnvSpec,
    pub test_id: String,
    pub env: BTreeMap<String, String>,
    pub cleanup_on_failure: bool,
}

/// Input to [`Orchestrator::delete`].
#[derive(Debug, Clone, Default)]
pub struct DeleteInput {
    pub test_id: String,
    /// Spec snapshot to start providers from when no state file survives.
    pub spec: Option<EnvSpec>,
    /// Fallback identity list when no state file survives.
    pub managed_resources: Vec<String>,
}

/// State shared between the orchestrator and the runtime provisioner.
pub(crate) struct SharedEnv {
    pub(crate) state: Mutex<Option<EnvironmentState>>,
    pub(crate) context: Mutex<TemplateContext>,
    pub(crate) created: Mutex<Vec<ResourceRef>>,
}

pub struct Orchestrator {
    manager: Arc<ProviderManager>,
    store: StateStore,
    cache: Arc<ImageCache>,
    shared: Arc<SharedEnv>,
}

impl Orchestrator {
    pub fn new(store: StateStore, cache: Arc<ImageCache>) -> Self {
        Self {
            manager: Arc::new(ProviderManager::new()),
            store,
            cache,
            shared: Arc::new(SharedEnv {
                state: Mutex::new(None),
                context: Mutex::new(TemplateContext::default()),
                created: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn manager(&self) -> &Arc<ProviderManager> {
        &self.manager
    }

    /// Hands out a runtime provisioner sharing this orchestrator's state.
    pub fn provisioner(&self) -> crate::provision::RuntimeProvisioner {
        crate::provision::RuntimeProvisioner::new(
            Arc::clone(&self.manager),
            self.store.clone(),
            Arc::clone(&self.shared),
        )
    }

    /// Creates the environment described by `input.spec` and returns the
    /// artifact surface for the calling test harness.
    pub async fn create(
        &self,
        cancel: &CancellationToken,
        input: &CreateInput,
    ) -> Result<Artifact> {
        let templated = validate::phase1(&input.spec).context(error::ValidationSnafu)?;
        let phases = dag::compile_phases(&input.spec).context(error::DagSnafu)?;

        for config in &input.spec.providers {
            if let Err(e) = self.manager.start(config).await {
                let _ = self.manager.stop_all().await;
                return Err(e).context(error::ProviderStartSnafu { name: &config.name });
            }
        }

        {
            let mut context = self.shared.context.lock().await;
            context.env = input.env.clone();
            context.default_base_image =
                input.spec.default_base_image.clone().unwrap_or_default();
        }

        let mut state = EnvironmentState::new(&input.test_id, input.spec.clone());
        state.execution_plan = phases.clone();
        self.store.save(&state).context(error::StateSnafu)?;
        *self.shared.state.lock().await = Some(state);
        info!(
            "Creating environment '{}' in {} phases",
            input.test_id,
            phases.len()
        );

        let mut failure: Option<Error> = None;
        'phases: for (index, phase) in phases.iter().enumerate() {
            if cancel.is_cancelled() {
                failure = Some(Error::Cancelled {
                    test_id: input.test_id.clone(),
                });
                break;
            }
            debug!("Executing phase {} ({} resources)", index, phase.len());
            let results = futures::future::join_all(
                phase
                    .iter()
                    .map(|resource| self.create_resource(cancel, input, resource, &templated)),
            )
            .await;
            for result in results {
                if let Err(e) = result {
                    failure = Some(e);
                    break 'phases;
                }
            }
        }

        match failure {
            None => {
                let snapshot = self
                    .update_state(|state| {
                        state.status = EnvironmentStatus::Ready;
                        state.stage = "run".to_string();
                        Ok(())
                    })
                    .await?;
                info!("Environment '{}' is ready", input.test_id);
                Ok(artifact::assemble(&snapshot))
            }
            Some(cause) => {
                warn!(
                    "Create of '{}' failed: {}; rolling back",
                    input.test_id, cause
                );
                let rollback_errors = if input.cleanup_on_failure {
                    self.rollback(cancel).await
                } else {
                    Vec::new()
                };
                let _ = self
                    .update_state(|state| {
                        state.status = EnvironmentStatus::Failed;
                        state.record_error(cause.to_string());
                        for rollback_error in &rollback_errors {
                            state.record_error(rollback_error.clone());
                        }
                        Ok(())
                    })
                    .await;
                if rollback_errors.is_empty() {
                    Err(cause)
                } else {
                    error::RollbackIncompleteSnafu {
                        cause: cause.to_string(),
                        rollback: rollback_errors.join("; "),
                    }
                    .fail()
                }
            }
        }
    }

    /// Deletes the environment, loading state by id or reconstructing it from
    /// the input's managed-resource list. A missing environment is a no-op.
    pub async fn delete(&self, cancel: &CancellationToken, input: &DeleteInput) -> Result<()> {
        let state = match self.store.load(&input.test_id) {
            Ok(state) => state,
            Err(_) if input.managed_resources.is_empty() => return Ok(()),
            Err(_) => reconstruct_state(input),
        };

        for config in &state.spec.providers {
            if self.manager.status(&config.name).await
                != Some(crate::provider::ProviderStatus::Running)
            {
                self.manager
                    .start(config)
                    .await
                    .context(error::ProviderStartSnafu { name: &config.name })?;
            }
        }

        let plan: Vec<ResourceRef> = state
            .execution_plan
            .iter()
            .flatten()
            .filter(|r| state.resources.get(r).is_some())
            .cloned()
            .collect();
        *self.shared.state.lock().await = Some(state);

        let mut errors = Vec::new();
        for resource in plan.iter().rev() {
            if let Err(e) = self.delete_resource(cancel, resource).await {
                warn!("Failed to delete {}: {}", resource, e);
                errors.push(format!("{}: {}", resource, e));
            }
        }

        self.store.delete(&input.test_id).context(error::StateSnafu)?;
        let stop = self.manager.stop_all().await;
        *self.shared.state.lock().await = None;
        self.shared.created.lock().await.clear();

        if !errors.is_empty() {
            return error::RollbackIncompleteSnafu {
                cause: format!("delete of '{}' was incomplete", input.test_id),
                rollback: errors.join("; "),
            }
            .fail();
        }
        stop.context(error::ProviderStopSnafu)?;
        info!("Environment '{}' destroyed", input.test_id);
        Ok(())
    }

    /// Stops providers and drops the state reference. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let result = self.manager.stop_all().await;
        *self.shared.state.lock().await = None;
        self.shared.created.lock().await.clear();
        result.context(error::ProviderStopSnafu)
    }

    async fn create_resource(
        &self,
        cancel: &CancellationToken,
        input: &CreateInput,
        resource: &ResourceRef,
        templated: &TemplatedFields,
    ) -> Result<()> {
        // Snapshot the context without holding the lock over any I/O.
        let context = self.shared.context.lock().await.clone();
        match resource.kind {
            ResourceKind::Image => self.create_image(cancel, input, resource, &context).await,
            _ => {
                self.create_via_provider(cancel, input, resource, templated, &context)
                    .await
            }
        }
    }

    /// Image resources are realized through the shared cache: resolve,
    /// download if needed, and publish the local path into the context. They
    /// are shared across tests, so they are not tracked in per-test state and
    /// never rolled back.
    async fn create_image(
        &self,
        cancel: &CancellationToken,
        input: &CreateInput,
        resource: &ResourceRef,
        context: &TemplateContext,
    ) -> Result<()> {
        let image = input
            .spec
            .images
            .iter()
            .find(|image| image.name == resource.name)
            .context(error::MissingResourceSnafu {
                resource: resource.to_string(),
            })?;
        let rendered = template::render_spec(image, context).context(error::TemplateSnafu {
            resource: resource.to_string(),
        })?;

        let entry = self
            .cache
            .ensure_image(
                cancel,
                &resource.name,
                &rendered.spec.source,
                rendered.spec.sha256.as_deref(),
            )
            .await
            .context(error::ImageSnafu {
                name: &resource.name,
            })?;

        let data = ImageTemplateData {
            name: resource.name.clone(),
            path: entry.local_path.display().to_string(),
        };
        let mut context = self.shared.context.lock().await;
        for alias in &rendered.spec.aliases {
            context.images.insert(alias.clone(), data.clone());
        }
        context.images.insert(resource.name.clone(), data);
        Ok(())
    }

    async fn create_via_provider(
        &self,
        cancel: &CancellationToken,
        input: &CreateInput,
        resource: &ResourceRef,
        templated: &TemplatedFields,
        context: &TemplateContext,
    ) -> Result<()> {
        let (explicit_provider, spec_value, provider_spec_value, cloud_init_value) =
            self.render_resource(input, resource, templated, context)?;

        let provider_name = match explicit_provider {
            Some(name) => name,
            None => self
                .manager
                .provider_for_resource(
                    resource.kind,
                    &input.spec.provider_names(),
                    input.spec.default_provider_name(),
                )
                .await
                .context(error::NoProviderSnafu {
                    resource: resource.to_string(),
                })?,
        };

        self.update_state(|state| {
            upsert_resource(state, resource, ResourceState::creating(&provider_name))
                .context(error::StateSnafu)?;
            Ok(())
        })
        .await?;

        let operation = format!("{}_create", resource.kind);
        let client =
            self.manager
                .client(&provider_name)
                .await
                .context(error::CallSnafu {
                    resource: resource.to_string(),
                })?;
        let payload = json!({
            "testId": input.test_id,
            "name": resource.name,
            "spec": spec_value,
            "providerSpec": provider_spec_value,
        });

        let result = match client.call_with_cancel(cancel, &operation, payload).await {
            Ok(result) => result,
            Err(e) => {
                let message = e.to_string();
                let _ = self.mark_resource_failed(resource, &message).await;
                return Err(e).context(error::CallSnafu {
                    resource: resource.to_string(),
                });
            }
        };

        if !result.success {
            let message = result
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "unspecified provider failure".to_string());
            let _ = self.mark_resource_failed(resource, &message).await;
            return error::ResourceFailedSnafu {
                resource: resource.to_string(),
                operation,
                message,
                stderr: client.stderr_tail(),
            }
            .fail();
        }

        let mut bag: BTreeMap<String, serde_json::Value> = match result.resource {
            serde_json::Value::Object(map) => map.into_iter().collect(),
            serde_json::Value::Null => BTreeMap::new(),
            other => std::iter::once(("value".to_string(), other)).collect(),
        };
        if resource.kind == ResourceKind::Vm {
            cloud_init::derive_ssh_attrs(&mut bag, &cloud_init_value, context);
        }

        self.update_state(|state| {
            let entry = upsert_resource(state, resource, ResourceState::creating(&provider_name))
                .context(error::StateSnafu)?;
            entry.state = bag.clone();
            entry.status = ResourceStatus::Ready;
            entry.updated_at = Utc::now();
            Ok(())
        })
        .await?;
        self.shared.created.lock().await.push(resource.clone());

        // Publish attributes only now that the resource is ready and
        // persisted; same-phase resources never observe each other.
        let mut shared_context = self.shared.context.lock().await;
        publish_template_data(&mut shared_context, resource, &bag);
        debug!("{} is ready (provider '{}')", resource, provider_name);
        Ok(())
    }

    /// Renders one resource against a context snapshot and re-validates the
    /// fields Phase 1 deferred.
    #[allow(clippy::type_complexity)]
    fn render_resource(
        &self,
        input: &CreateInput,
        resource: &ResourceRef,
        templated: &TemplatedFields,
        context: &TemplateContext,
    ) -> Result<(
        Option<String>,
        serde_json::Value,
        serde_json::Value,
        serde_json::Value,
    )> {
        let missing = || error::MissingResourceSnafu {
            resource: resource.to_string(),
        };
        let template_context = |source| Error::Template {
            resource: resource.to_string(),
            source,
        };

        match resource.kind {
            ResourceKind::Key => {
                let key = input
                    .spec
                    .keys
                    .iter()
                    .find(|k| k.name == resource.name)
                    .with_context(missing)?;
                let rendered = template::render_spec(key, context).map_err(template_context)?;
                Ok((
                    rendered.provider.clone(),
                    encode(resource, &rendered.spec)?,
                    encode(resource, &rendered.provider_spec)?,
                    serde_json::Value::Null,
                ))
            }
            ResourceKind::Network => {
                let network = input
                    .spec
                    .networks
                    .iter()
                    .find(|n| n.name == resource.name)
                    .with_context(missing)?;
                let rendered = template::render_spec(network, context).map_err(template_context)?;
                if templated.has_any(resource) {
                    validate::phase2_network(&resource.name, &rendered.spec)
                        .context(error::ValidationSnafu)?;
                }
                Ok((
                    rendered.provider.clone(),
                    encode(resource, &rendered.spec)?,
                    encode(resource, &rendered.provider_spec)?,
                    serde_json::Value::Null,
                ))
            }
            ResourceKind::Vm => {
                let vm = input
                    .spec
                    .vms
                    .iter()
                    .find(|v| v.name == resource.name)
                    .with_context(missing)?;
                let rendered = template::render_spec(vm, context).map_err(template_context)?;
                if templated.is_templated(resource, "network") {
                    let networks: BTreeSet<String> = input
                        .spec
                        .networks
                        .iter()
                        .map(|n| n.name.clone())
                        .collect();
                    validate::phase2_vm(&resource.name, &rendered.spec, &networks)
                        .context(error::ValidationSnafu)?;
                }
                let cloud_init_value = encode(resource, &rendered.spec.cloud_init)?;
                Ok((
                    rendered.provider.clone(),
                    encode(resource, &rendered.spec)?,
                    encode(resource, &rendered.provider_spec)?,
                    cloud_init_value,
                ))
            }
            ResourceKind::Image => unreachable!("images are realized through the cache"),
        }
    }

    async fn mark_resource_failed(&self, resource: &ResourceRef, message: &str) -> Result<()> {
        self.update_state(|state| {
            let entry = upsert_resource(
                state,
                resource,
                ResourceState::creating(String::new()),
            )
            .context(error::StateSnafu)?;
            entry.status = ResourceStatus::Failed;
            entry.error = Some(message.to_string());
            entry.updated_at = Utc::now();
            state.record_error(format!("{}: {}", resource, message));
            Ok(())
        })
        .await
        .map(|_| ())
    }

    /// Deletes created resources most-recent-first, collecting errors instead
    /// of short-circuiting. Returns the collected error strings.
    async fn rollback(&self, cancel: &CancellationToken) -> Vec<String> {
        let created: Vec<ResourceRef> = self.shared.created.lock().await.clone();
        let mut errors = Vec::new();
        for resource in created.iter().rev() {
            if let Err(e) = self.delete_resource(cancel, resource).await {
                warn!("Rollback of {} failed: {}", resource, e);
                errors.push(format!("{}: {}", resource, e));
            }
        }
        errors
    }

    async fn delete_resource(
        &self,
        cancel: &CancellationToken,
        resource: &ResourceRef,
    ) -> Result<()> {
        let (mut provider_name, bag, candidates, default) = {
            let guard = self.shared.state.lock().await;
            let state = guard.as_ref().context(error::NoStateSnafu)?;
            let entry = state
                .resources
                .get(resource)
                .context(error::MissingResourceSnafu {
                    resource: resource.to_string(),
                })?;
            (
                entry.provider.clone(),
                entry.state.clone(),
                state.spec.provider_names(),
                state.spec.default_provider_name().map(str::to_string),
            )
        };
        if provider_name.is_empty() {
            // Reconstructed state has no recorded provider; select one.
            provider_name = self
                .manager
                .provider_for_resource(resource.kind, &candidates, default.as_deref())
                .await
                .context(error::NoProviderSnafu {
                    resource: resource.to_string(),
                })?;
        }

        let operation = format!("{}_delete", resource.kind);
        let client =
            self.manager
                .client(&provider_name)
                .await
                .context(error::CallSnafu {
                    resource: resource.to_string(),
                })?;
        let payload = json!({ "name": resource.name, "state": bag });
        let result = client
            .call_with_cancel(cancel, &operation, payload)
            .await
            .context(error::CallSnafu {
                resource: resource.to_string(),
            })?;

        if !result.success {
            let message = result
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "unspecified provider failure".to_string());
            // A resource the provider no longer knows is already gone.
            if !is_missing_resource(&message) {
                return error::ResourceFailedSnafu {
                    resource: resource.to_string(),
                    operation,
                    message,
                    stderr: client.stderr_tail(),
                }
                .fail();
            }
        }

        self.update_state(|state| {
            if let Some(map) = state.resources.by_kind_mut(resource.kind) {
                if let Some(entry) = map.get_mut(&resource.name) {
                    entry.status = ResourceStatus::Destroyed;
                    entry.updated_at = Utc::now();
                }
            }
            Ok(())
        })
        .await
        .map(|_| ())
    }

    /// Mutates the state under its lock, then persists a clone of it with the
    /// lock released; mutex-holding sections contain no I/O.
    async fn update_state<F>(&self, mutate: F) -> Result<EnvironmentState>
    where
        F: FnOnce(&mut EnvironmentState) -> Result<()>,
    {
        let snapshot = {
            let mut guard = self.shared.state.lock().await;
            let state = guard.as_mut().context(error::NoStateSnafu)?;
            mutate(state)?;
            state.touch();
            state.clone()
        };
        self.store.save(&snapshot).context(error::StateSnafu)?;
        Ok(snapshot)
    }
}

fn encode<T: serde::Serialize>(resource: &ResourceRef, value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).context(error::EncodeSnafu {
        resource: resource.to_string(),
    })
}

fn reconstruct_state(input: &DeleteInput) -> EnvironmentState {
    let mut state = EnvironmentState::new(
        &input.test_id,
        input.spec.clone().unwrap_or_default(),
    );
    for uri in &input.managed_resources {
        if let Some(resource) = ResourceRef::from_uri(uri) {
            if let Some(map) = state.resources.by_kind_mut(resource.kind) {
                let mut entry = ResourceState::creating(String::new());
                entry.status = ResourceStatus::Ready;
                map.insert(resource.name.clone(), entry);
                state.execution_plan.push(vec![resource]);
            }
        }
    }
    state
}

fn is_missing_resource(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("not found")
        || message.contains("no such")
        || message.contains("does not exist")
}

/// Projects a provider's state bag into the template context.
fn publish_template_data(
    context: &mut TemplateContext,
    resource: &ResourceRef,
    bag: &BTreeMap<String, serde_json::Value>,
) {
    let attr = |key: &str| -> String {
        bag.get(key)
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    match resource.kind {
        ResourceKind::Key => {
            context.keys.insert(
                resource.name.clone(),
                KeyTemplateData {
                    public_key: attr("publicKey"),
                    private_key_path: attr("privateKeyPath"),
                    public_key_path: attr("publicKeyPath"),
                    fingerprint: attr("fingerprint"),
                },
            );
        }
        ResourceKind::Network => {
            let name = bag
                .get("name")
                .and_then(serde_json::Value::as_str)
                .unwrap_or(&resource.name)
                .to_string();
            context.networks.insert(
                resource.name.clone(),
                NetworkTemplateData {
                    name,
                    ip: attr("ip"),
                    cidr: attr("cidr"),
                    interface_name: attr("interfaceName"),
                    uuid: attr("uuid"),
                },
            );
        }
        ResourceKind::Vm => {
            context.vms.insert(
                resource.name.clone(),
                VmTemplateData {
                    name: resource.name.clone(),
                    ip: attr("ip"),
                    mac: attr("mac"),
                    ssh_command: attr("sshCommand"),
                },
            );
        }
        ResourceKind::Image => {}
    }
}

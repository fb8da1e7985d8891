/*!
`testenv-vm` provisions short-lived virtual-machine environments for
integration tests.

A declarative YAML spec names providers, keys, networks, VMs and base images.
The engine validates the spec in two phases, orders resources into execution
phases along their template-induced dependencies, and realizes each resource
through an out-of-process provider speaking newline-delimited JSON-RPC over
stdio. Attributes of realized resources accumulate in a template context that
later resources render against. The caller gets back an artifact (IPs, key
paths, SSH env vars, managed-resource URIs) and a guarantee that everything is
torn down in reverse order, even on failure.

Base images are shared between tests through the `image-cache` crate; remote
command execution on created VMs goes through the `remote-exec` crate, fed by
this crate's runtime provisioner.
*/

mod cloud_init;
pub mod orchestrator;
pub mod provider;
pub mod provision;
pub mod spec;
pub mod state;
pub mod template;
pub mod validate;

pub use orchestrator::{Artifact, CreateInput, DeleteInput, Orchestrator};
pub use provision::RuntimeProvisioner;
pub use spec::{EnvSpec, ResourceKind, ResourceRef};
pub use state::{EnvironmentState, StateStore};

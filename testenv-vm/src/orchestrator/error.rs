use crate::orchestrator::dag;
use crate::{provider, state, template, validate};
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(super)))]
pub enum Error {
    #[snafu(display("create of '{}' was cancelled", test_id))]
    Cancelled { test_id: String },

    #[snafu(display("{}", source))]
    Dag { source: dag::Error },

    #[snafu(display("Failed to encode {} for the provider: {}", resource, source))]
    Encode {
        resource: String,
        source: serde_json::Error,
    },

    #[snafu(display("Failed to ensure image \"{}\": {}", name, source))]
    Image {
        name: String,
        source: image_cache::Error,
    },

    #[snafu(display("execution plan names unknown resource {}", resource))]
    MissingResource { resource: String },

    #[snafu(display("no provider supports {}", resource))]
    NoProvider { resource: String },

    #[snafu(display("no environment state is loaded"))]
    NoState,

    #[snafu(display("provider transport failure for {}: {}", resource, source))]
    Call {
        resource: String,
        source: provider::Error,
    },

    #[snafu(display("Failed to start provider '{}': {}", name, source))]
    ProviderStart {
        name: String,
        source: provider::Error,
    },

    #[snafu(display("Failed to stop providers: {}", source))]
    ProviderStop { source: provider::Error },

    #[snafu(display(
        "{} failed during {}: {}{}",
        resource,
        operation,
        message,
        stderr_suffix(stderr)
    ))]
    ResourceFailed {
        resource: String,
        operation: String,
        message: String,
        stderr: String,
    },

    #[snafu(display("{}; rollback errors: {}", cause, rollback))]
    RollbackIncomplete { cause: String, rollback: String },

    #[snafu(display("Failed to persist environment state: {}", source))]
    State { source: state::Error },

    #[snafu(display("Failed to render {}: {}", resource, source))]
    Template {
        resource: String,
        source: template::Error,
    },

    #[snafu(display("{}", source))]
    Validation { source: validate::Error },
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" (provider stderr: {})", stderr)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

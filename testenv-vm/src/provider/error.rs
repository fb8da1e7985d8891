use snafu::Snafu;
use std::io;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(super)))]
pub enum Error {
    #[snafu(display("provider '{}' is already running", name))]
    AlreadyRunning { name: String },

    #[snafu(display("call '{}' on provider '{}' was cancelled", tool, provider))]
    Cancelled { provider: String, tool: String },

    #[snafu(display("provider '{}' is closed", provider))]
    Closed { provider: String },

    #[snafu(display(
        "Failed to decode {} from provider '{}': {}",
        what,
        provider,
        source
    ))]
    Decode {
        provider: String,
        what: String,
        source: serde_json::Error,
    },

    #[snafu(display("engine specifier must not be empty"))]
    EmptyEngine,

    #[snafu(display("Failed to encode request for provider '{}': {}", provider, source))]
    Encode {
        provider: String,
        source: serde_json::Error,
    },

    #[snafu(display("EOF reading from provider '{}'", provider))]
    Eof { provider: String },

    #[snafu(display(
        "id mismatch from provider '{}': expected {}, got {}",
        provider,
        expected,
        got
    ))]
    IdMismatch {
        provider: String,
        expected: u64,
        got: String,
    },

    #[snafu(display(
        "internal engine 'go://{}' must not carry a version, got '@{}'",
        path,
        version
    ))]
    InternalEngineVersion { path: String, version: String },

    #[snafu(display("call worker for provider '{}' panicked: {}", provider, source))]
    Join {
        provider: String,
        source: tokio::task::JoinError,
    },

    #[snafu(display("JSON-RPC error {}: {} (provider '{}')", code, message, provider))]
    JsonRpc {
        provider: String,
        code: i64,
        message: String,
    },

    #[snafu(display("provider '{}' did not expose a {} pipe", provider, pipe))]
    MissingPipe { provider: String, pipe: String },

    #[snafu(display("provider '{}' is not initialized", provider))]
    NotInitialized { provider: String },

    #[snafu(display("provider '{}' is not running", name))]
    NotRunning { name: String },

    #[snafu(display(
        "parse error from provider '{}': {} (frame: {})",
        provider,
        source,
        frame
    ))]
    Parse {
        provider: String,
        frame: String,
        source: serde_json::Error,
    },

    #[snafu(display("Failed to read from provider '{}': {}", provider, source))]
    Read { provider: String, source: io::Error },

    #[snafu(display(
        "internal engine 'go://{}' requires the {} environment flag",
        path,
        flag
    ))]
    RunLocalDisabled { path: String, flag: String },

    #[snafu(display(
        "Failed to spawn provider '{}' ('{}'): {}",
        provider,
        program,
        source
    ))]
    Spawn {
        provider: String,
        program: String,
        source: io::Error,
    },

    #[snafu(display("Failed to stop providers: {}", errors))]
    StopAll { errors: String },

    #[snafu(display(
        "provider '{}' reported failure for '{}': {}",
        provider,
        tool,
        message
    ))]
    ToolFailed {
        provider: String,
        tool: String,
        message: String,
    },

    #[snafu(display("provider '{}' is not registered", name))]
    UnknownProvider { name: String },

    #[snafu(display("Failed to wait for provider '{}' to exit: {}", provider, source))]
    Wait { provider: String, source: io::Error },

    #[snafu(display("Failed to write to provider '{}': {}", provider, source))]
    Write { provider: String, source: io::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

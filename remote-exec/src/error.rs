use snafu::Snafu;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("SSH authentication as '{}' on '{}' was rejected", user, host))]
    AuthRejected { user: String, host: String },

    #[snafu(display("Failed to decode base64 output from '{}': {}", remote_path, source))]
    Base64Decode {
        remote_path: String,
        source: base64::DecodeError,
    },

    #[snafu(display("Operation on VM '{}' was cancelled", vm))]
    Cancelled { vm: String },

    #[snafu(display(
        "cloud-init did not finish on VM '{}': {} (stderr: {})",
        vm,
        status,
        stderr
    ))]
    CloudInitWait {
        vm: String,
        status: u32,
        stderr: String,
    },

    #[snafu(display("Remote command on VM '{}' exited {}: {}", vm, status, stderr))]
    CommandFailed {
        vm: String,
        status: u32,
        stderr: String,
    },

    #[snafu(display("SSH connection to '{}:{}' failed: {}", host, port, source))]
    Connect {
        host: String,
        port: u16,
        source: russh::Error,
    },

    #[snafu(display("invalid VM info for '{}': {}", vm, reason))]
    InvalidVmInfo { vm: String, reason: String },

    #[snafu(display("Failed to parse private key for VM '{}': {}", vm, source))]
    KeyParse {
        vm: String,
        source: russh_keys::Error,
    },

    #[snafu(display("Failed to read local file '{}': {}", path.display(), source))]
    LocalRead { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to write local file '{}': {}", path.display(), source))]
    LocalWrite { path: PathBuf, source: io::Error },

    #[snafu(display("Private key for VM '{}' is not valid UTF-8", vm))]
    PrivateKeyEncoding { vm: String },

    #[snafu(display("Failed to provide VM info for '{}': {}", vm, message))]
    Provider { vm: String, message: String },

    #[snafu(display("VM '{}' was not ready within {:?}: {}", vm, timeout, last_error))]
    ReadyTimeout {
        vm: String,
        timeout: Duration,
        last_error: String,
    },

    #[snafu(display("SSH session error on VM '{}': {}", vm, source))]
    Session { vm: String, source: russh::Error },

    #[snafu(display("Remote command on VM '{}' produced no exit status", vm))]
    NoExitStatus { vm: String },
}

pub type Result<T> = std::result::Result<T, Error>;

//! Engine specifier resolution.
//!
//! A provider's `engine` field says how to launch it:
//!
//! * a filesystem path (absolute or relative) is executed directly with
//!   `--mcp`;
//! * `go://<module-path>[@version]` — an *external* module, recognized by a
//!   dot in its first path segment — is run through the Go toolchain,
//!   defaulting to `@latest`;
//! * `go://<internal-path>` (no dot) runs a provider from the local source
//!   tree. That only makes sense on a development checkout, so it is gated
//!   behind the opt-in environment flag and must not carry a version.

use crate::provider::error::{self, Result};
use snafu::ensure;

/// Opt-in flag for running internal (in-tree) providers.
pub const RUN_LOCAL_ENV: &str = "FORGE_RUN_LOCAL_ENABLED";

const GO_SCHEME: &str = "go://";

/// Resolves an engine specifier into the argv used to launch the provider.
pub fn resolve_engine(engine: &str) -> Result<Vec<String>> {
    ensure!(!engine.is_empty(), error::EmptyEngineSnafu);

    match engine.strip_prefix(GO_SCHEME) {
        Some(reference) => resolve_go(reference),
        None => Ok(vec![engine.to_string(), "--mcp".to_string()]),
    }
}

fn resolve_go(reference: &str) -> Result<Vec<String>> {
    let (path, version) = match reference.split_once('@') {
        Some((path, version)) => (path, Some(version)),
        None => (reference, None),
    };
    ensure!(!path.is_empty(), error::EmptyEngineSnafu);

    let first_segment = path.split('/').next().unwrap_or_default();
    if first_segment.contains('.') {
        // External module: always run through the toolchain, pinned or @latest.
        let version = version.unwrap_or("latest");
        return Ok(vec![
            "go".to_string(),
            "run".to_string(),
            format!("{}@{}", path, version),
            "--mcp".to_string(),
        ]);
    }

    if let Some(version) = version {
        return error::InternalEngineVersionSnafu { path, version }.fail();
    }
    ensure!(
        run_local_enabled(),
        error::RunLocalDisabledSnafu {
            path,
            flag: RUN_LOCAL_ENV,
        }
    );

    let local = if path.starts_with("./") {
        path.to_string()
    } else {
        format!("./{}", path)
    };
    Ok(vec![
        "go".to_string(),
        "run".to_string(),
        local,
        "--mcp".to_string(),
    ])
}

/// Read once per resolution; tests that toggle the flag must save/restore it.
fn run_local_enabled() -> bool {
    std::env::var(RUN_LOCAL_ENV)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Process environment is global; serialize the tests that touch it.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        saved: Option<String>,
    }

    impl EnvGuard {
        fn set(value: Option<&str>) -> Self {
            let saved = std::env::var(RUN_LOCAL_ENV).ok();
            match value {
                Some(value) => std::env::set_var(RUN_LOCAL_ENV, value),
                None => std::env::remove_var(RUN_LOCAL_ENV),
            }
            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.saved {
                Some(value) => std::env::set_var(RUN_LOCAL_ENV, value),
                None => std::env::remove_var(RUN_LOCAL_ENV),
            }
        }
    }

    #[test]
    fn filesystem_paths_run_directly_with_mcp() {
        assert_eq!(
            resolve_engine("/usr/local/bin/provider-libvirt").unwrap(),
            vec!["/usr/local/bin/provider-libvirt", "--mcp"]
        );
        assert_eq!(
            resolve_engine("./out/provider-stub").unwrap(),
            vec!["./out/provider-stub", "--mcp"]
        );
    }

    #[test]
    fn external_module_defaults_to_latest() {
        assert_eq!(
            resolve_engine("go://github.com/x/y/cmd/z").unwrap(),
            vec!["go", "run", "github.com/x/y/cmd/z@latest", "--mcp"]
        );
    }

    #[test]
    fn external_module_keeps_a_pinned_version() {
        assert_eq!(
            resolve_engine("go://github.com/x/y/cmd/z@v1.2.3").unwrap(),
            vec!["go", "run", "github.com/x/y/cmd/z@v1.2.3", "--mcp"]
        );
    }

    #[test]
    fn external_module_resolves_regardless_of_the_local_flag() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::set(Some("true"));
        assert_eq!(
            resolve_engine("go://github.com/x/y/cmd/z").unwrap(),
            vec!["go", "run", "github.com/x/y/cmd/z@latest", "--mcp"]
        );
    }

    #[test]
    fn internal_path_requires_the_opt_in_flag() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::set(None);
        let err = resolve_engine("go://cmd/foo").unwrap_err();
        assert!(err.to_string().contains(RUN_LOCAL_ENV));
    }

    #[test]
    fn internal_path_runs_locally_when_enabled() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::set(Some("true"));
        assert_eq!(
            resolve_engine("go://cmd/foo").unwrap(),
            vec!["go", "run", "./cmd/foo", "--mcp"]
        );
    }

    #[test]
    fn internal_path_with_version_is_rejected() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::set(Some("true"));
        let err = resolve_engine("go://cmd/foo@v1.0.0").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("version"));
        assert!(msg.contains("v1.0.0"));
    }

    #[test]
    fn empty_specifiers_are_rejected() {
        assert!(resolve_engine("").is_err());
        assert!(resolve_engine("go://").is_err());
        assert!(resolve_engine("go://@v1").is_err());
    }
}

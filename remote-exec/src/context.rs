//! Execution contexts and shell command formatting.
//!
//! An [`ExecContext`] is an immutable bundle of environment variables and an
//! optional privilege-escalation prefix applied to every command the client
//! runs. The `with_*` methods return new values, so a context can be shared
//! and specialized freely.

use std::collections::BTreeMap;

/// Tokens that are shell operators and must not be quoted when formatting a
/// command line.
const SHELL_OPERATORS: &[&str] = &["&&", "||", ";", ":", "&"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrivilegeEscalation {
    pub enabled: bool,
    /// The command prefix, e.g. `["sudo", "-E"]`.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecContext {
    env: BTreeMap<String, String>,
    privilege: Option<PrivilegeEscalation>,
}

impl ExecContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy with one more environment variable set.
    pub fn with_env<K, V>(&self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut next = self.clone();
        next.env.insert(key.into(), value.into());
        next
    }

    /// Returns a copy with all entries of `vars` set.
    pub fn with_envs<I, K, V>(&self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut next = self.clone();
        next.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        next
    }

    /// Returns a copy that runs commands under the given prefix, e.g.
    /// `["sudo", "-E"]`.
    pub fn with_privilege_escalation<I, S>(&self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut next = self.clone();
        next.privilege = Some(PrivilegeEscalation {
            enabled: true,
            command: command.into_iter().map(Into::into).collect(),
        });
        next
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn privilege(&self) -> Option<&PrivilegeEscalation> {
        self.privilege.as_ref()
    }
}

/// Formats an argv into a shell command line under a context.
///
/// The output is `K="V" K2="V2" <prefix...> "arg0" "arg1" ...`: environment
/// pairs first (sorted by key), then the privilege prefix verbatim, then every
/// argv token double-quoted — except the exact shell operators
/// `&&`, `||`, `;`, `:` and `&`, which pass through unquoted so callers can
/// chain commands. A `None` context is treated as empty.
pub fn format_cmd(context: Option<&ExecContext>, args: &[&str]) -> String {
    let mut parts = Vec::new();

    if let Some(ctx) = context {
        for (key, value) in &ctx.env {
            parts.push(format!("{}=\"{}\"", key, escape_double_quoted(value)));
        }
        if let Some(privilege) = &ctx.privilege {
            if privilege.enabled {
                parts.extend(privilege.command.iter().cloned());
            }
        }
    }

    for arg in args {
        if SHELL_OPERATORS.contains(arg) {
            parts.push((*arg).to_string());
        } else {
            parts.push(format!("\"{}\"", escape_double_quoted(arg)));
        }
    }

    parts.join(" ")
}

/// Formats a raw shell fragment (one that carries its own quoting, pipes or
/// redirections) under a context: env pairs and privilege prefix are
/// prepended, the fragment itself is left untouched.
pub fn format_raw(context: Option<&ExecContext>, raw: &str) -> String {
    let mut parts = Vec::new();
    if let Some(ctx) = context {
        for (key, value) in &ctx.env {
            parts.push(format!("{}=\"{}\"", key, escape_double_quoted(value)));
        }
        if let Some(privilege) = &ctx.privilege {
            if privilege.enabled {
                parts.extend(privilege.command.iter().cloned());
            }
        }
    }
    parts.push(raw.to_string());
    parts.join(" ")
}

fn escape_double_quoted(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Wraps a remote path in single quotes, escaping embedded single quotes as
/// `'\''` so the result survives `sh` word splitting.
pub fn quote_remote_path(path: &str) -> String {
    format!("'{}'", path.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_args_are_double_quoted() {
        assert_eq!(format_cmd(None, &["echo", "hello"]), r#""echo" "hello""#);
    }

    #[test]
    fn shell_operators_pass_through_unquoted() {
        let formatted = format_cmd(None, &["mkdir", "-p", "/tmp/x", "&&", "ls", ";", "true"]);
        assert_eq!(formatted, r#""mkdir" "-p" "/tmp/x" && "ls" ; "true""#);

        for op in ["&&", "||", ";", ":", "&"] {
            let formatted = format_cmd(None, &["a", op, "b"]);
            assert!(formatted.contains(&format!(r#""a" {} "b""#, op)));
        }
    }

    #[test]
    fn env_pairs_precede_privilege_prefix_and_argv() {
        let ctx = ExecContext::new()
            .with_env("PATH", "/usr/bin")
            .with_env("DEBUG", "1")
            .with_privilege_escalation(["sudo", "-E"]);
        assert_eq!(
            format_cmd(Some(&ctx), &["systemctl", "restart", "sshd"]),
            r#"DEBUG="1" PATH="/usr/bin" sudo -E "systemctl" "restart" "sshd""#
        );
    }

    #[test]
    fn nil_context_is_treated_as_empty() {
        assert_eq!(
            format_cmd(None, &["true"]),
            format_cmd(Some(&ExecContext::new()), &["true"])
        );
    }

    #[test]
    fn with_methods_do_not_mutate_the_original() {
        let base = ExecContext::new();
        let derived = base.with_env("A", "1").with_privilege_escalation(["doas"]);
        assert!(base.env().is_empty());
        assert!(base.privilege().is_none());
        assert_eq!(derived.env().get("A").map(String::as_str), Some("1"));
        assert!(derived.privilege().unwrap().enabled);
    }

    #[test]
    fn embedded_quotes_are_escaped() {
        assert_eq!(
            format_cmd(None, &["echo", r#"say "hi""#]),
            r#""echo" "say \"hi\"""#
        );
    }

    #[test]
    fn remote_paths_are_single_quoted() {
        assert_eq!(quote_remote_path("/tmp/plain"), "'/tmp/plain'");
        assert_eq!(
            quote_remote_path("/tmp/it's here"),
            r"'/tmp/it'\''s here'"
        );
    }

    #[test]
    fn format_raw_prepends_context_only() {
        let ctx = ExecContext::new().with_env("LANG", "C");
        assert_eq!(
            format_raw(Some(&ctx), "base64 < '/etc/hosts'"),
            r#"LANG="C" base64 < '/etc/hosts'"#
        );
    }
}

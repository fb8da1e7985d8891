//! Field-wise template rendering over the accumulating environment context.
//!
//! Spec fields reference realized resources with expressions like
//! `{{ .Keys.test-key.PublicKey }}`. A small preprocessor rewrites those
//! dotted paths into handlebars path syntax — hyphen-bearing resource names
//! become `[bracketed]` segments — and the rewritten template is rendered in
//! strict mode so a reference to an absent resource fails loudly instead of
//! rendering empty.

use crate::spec::{ResourceKind, ResourceRef};
use handlebars::Handlebars;
use lazy_static::lazy_static;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use snafu::ResultExt;
use std::collections::{BTreeMap, BTreeSet};

pub use error::{Error, Result};

lazy_static! {
    /// A full template expression: `{{ .Segment.Segment... }}`.
    static ref EXPR: Regex =
        Regex::new(r"\{\{\s*\.([A-Za-z0-9_][A-Za-z0-9_.\-]*)\s*\}\}").unwrap();
    /// A resource reference inside an expression, e.g. `{{ .Keys.test-key.`.
    static ref RESOURCE_REF: Regex =
        Regex::new(r"\{\{\s*\.(Keys|Networks|VMs|Images)\.([A-Za-z0-9][A-Za-z0-9_\-]*)").unwrap();
}

/// Attributes of a realized key.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeyTemplateData {
    pub public_key: String,
    pub private_key_path: String,
    pub public_key_path: String,
    pub fingerprint: String,
}

/// Attributes of a realized network.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkTemplateData {
    pub name: String,
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(rename = "CIDR")]
    pub cidr: String,
    pub interface_name: String,
    #[serde(rename = "UUID")]
    pub uuid: String,
}

/// Attributes of a realized VM.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VmTemplateData {
    pub name: String,
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(rename = "MAC")]
    pub mac: String,
    #[serde(rename = "SSHCommand")]
    pub ssh_command: String,
}

/// Attributes of a realized (cached) image.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageTemplateData {
    pub name: String,
    pub path: String,
}

/// The accumulating map of realized-resource attributes that later phases
/// render against. Field names match the template grammar.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TemplateContext {
    #[serde(rename = "Keys")]
    pub keys: BTreeMap<String, KeyTemplateData>,
    #[serde(rename = "Networks")]
    pub networks: BTreeMap<String, NetworkTemplateData>,
    #[serde(rename = "VMs")]
    pub vms: BTreeMap<String, VmTemplateData>,
    #[serde(rename = "Images")]
    pub images: BTreeMap<String, ImageTemplateData>,
    #[serde(rename = "DefaultBaseImage")]
    pub default_base_image: String,
    #[serde(rename = "Env")]
    pub env: BTreeMap<String, String>,
}

/// Rewrites `{{ .Keys.foo-bar.Field }}` into `{{Keys.[foo-bar].[Field]}}` so
/// the handlebars grammar need not support hyphens in identifiers.
fn preprocess(template: &str) -> String {
    EXPR.replace_all(template, |captures: &regex::Captures<'_>| {
        let mut segments = captures[1].split('.');
        let mut path = String::from("{{");
        if let Some(first) = segments.next() {
            path.push_str(first);
        }
        for segment in segments {
            path.push_str(&format!(".[{}]", segment));
        }
        path.push_str("}}");
        path
    })
    .into_owned()
}

/// Renders one string against the context.
///
/// A string without `{{` is returned verbatim. Failures carry the original
/// template text.
pub fn render_str(template: &str, context: &TemplateContext) -> Result<String> {
    if !template.contains("{{") {
        return Ok(template.to_string());
    }
    let prepared = preprocess(template);
    let mut registry = Handlebars::new();
    registry.set_strict_mode(true);
    registry.register_escape_fn(handlebars::no_escape);
    registry
        .render_template(&prepared, context)
        .context(error::RenderSnafu { template })
}

/// Recursively renders every string in a JSON value tree in place.
pub fn render_value(value: &mut serde_json::Value, context: &TemplateContext) -> Result<()> {
    match value {
        serde_json::Value::String(s) => {
            *s = render_str(s, context)?;
        }
        serde_json::Value::Array(items) => {
            for item in items {
                render_value(item, context)?;
            }
        }
        serde_json::Value::Object(map) => {
            for (_key, item) in map.iter_mut() {
                render_value(item, context)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Deep-copies a typed value with every string field rendered.
///
/// The value is rebuilt through its serialized form because opaque mapping
/// slots (provider specs, cloud-init) are not addressable in place.
pub fn render_spec<T>(spec: &T, context: &TemplateContext) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    let mut value = serde_json::to_value(spec).context(error::RoundTripSnafu)?;
    render_value(&mut value, context)?;
    serde_json::from_value(value).context(error::RoundTripSnafu)
}

fn kind_for_category(category: &str) -> ResourceKind {
    match category {
        "Keys" => ResourceKind::Key,
        "Networks" => ResourceKind::Network,
        "VMs" => ResourceKind::Vm,
        "Images" => ResourceKind::Image,
        other => unreachable!("regex admitted unknown category {}", other),
    }
}

fn extract_refs_from_str(raw: &str, refs: &mut BTreeSet<ResourceRef>) {
    for captures in RESOURCE_REF.captures_iter(raw) {
        let kind = kind_for_category(&captures[1]);
        refs.insert(ResourceRef::new(kind, &captures[2]));
    }
}

fn extract_refs_from_value(value: &serde_json::Value, refs: &mut BTreeSet<ResourceRef>) {
    match value {
        serde_json::Value::String(s) => extract_refs_from_str(s, refs),
        serde_json::Value::Array(items) => {
            for item in items {
                extract_refs_from_value(item, refs);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values() {
                extract_refs_from_value(item, refs);
            }
        }
        _ => {}
    }
}

/// Collects every resource reference appearing in template expressions
/// anywhere inside `spec`, deduplicated by (kind, name).
///
/// References to `Env` and `DefaultBaseImage` are runtime-supplied and
/// intentionally not reported.
pub fn extract_refs<T: Serialize>(spec: &T) -> Result<BTreeSet<ResourceRef>> {
    let value = serde_json::to_value(spec).context(error::RoundTripSnafu)?;
    let mut refs = BTreeSet::new();
    extract_refs_from_value(&value, &mut refs);
    Ok(refs)
}

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Failed to render template '{}': {}", template, source))]
        Render {
            template: String,
            source: handlebars::RenderError,
        },

        #[snafu(display("Failed to round-trip value for rendering: {}", source))]
        RoundTrip { source: serde_json::Error },
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{Resource, VmSpec};

    fn context() -> TemplateContext {
        let mut ctx = TemplateContext::default();
        ctx.keys.insert(
            "test-key".to_string(),
            KeyTemplateData {
                public_key: "ssh-ed25519 AAAA test".to_string(),
                private_key_path: "/tmp/keys/test-key".to_string(),
                public_key_path: "/tmp/keys/test-key.pub".to_string(),
                fingerprint: "SHA256:abcdef".to_string(),
            },
        );
        ctx.networks.insert(
            "parent".to_string(),
            NetworkTemplateData {
                name: "parent".to_string(),
                ip: "192.0.2.1".to_string(),
                cidr: "192.0.2.0/24".to_string(),
                interface_name: "virbr7".to_string(),
                uuid: "9e107d9d-372b-4e6e-9f3a-000000000000".to_string(),
            },
        );
        ctx.env.insert("RUN_ID".to_string(), "r-42".to_string());
        ctx.default_base_image = "noble".to_string();
        ctx
    }

    #[test]
    fn strings_without_markers_pass_through() {
        let ctx = context();
        assert_eq!(render_str("plain text", &ctx).unwrap(), "plain text");
    }

    #[test]
    fn hyphenated_resource_names_render() {
        let ctx = context();
        assert_eq!(
            render_str("{{ .Keys.test-key.PublicKey }}", &ctx).unwrap(),
            "ssh-ed25519 AAAA test"
        );
        assert_eq!(
            render_str("{{ .Networks.parent.InterfaceName }}", &ctx).unwrap(),
            "virbr7"
        );
    }

    #[test]
    fn env_and_default_base_image_render() {
        let ctx = context();
        assert_eq!(render_str("{{ .Env.RUN_ID }}", &ctx).unwrap(), "r-42");
        assert_eq!(render_str("{{ .DefaultBaseImage }}", &ctx).unwrap(), "noble");
    }

    #[test]
    fn unknown_reference_fails_with_the_template_text() {
        let ctx = context();
        let err = render_str("{{ .Networks.absent.IP }}", &ctx).unwrap_err();
        assert!(err.to_string().contains("{{ .Networks.absent.IP }}"));
    }

    #[test]
    fn values_are_not_html_escaped() {
        let mut ctx = context();
        ctx.vms.insert(
            "db".to_string(),
            VmTemplateData {
                name: "db".to_string(),
                ip: "192.0.2.9".to_string(),
                mac: "52:54:00:00:00:09".to_string(),
                ssh_command: r#"ssh -o IdentitiesOnly=yes "root"@192.0.2.9"#.to_string(),
            },
        );
        assert_eq!(
            render_str("{{ .VMs.db.SSHCommand }}", &ctx).unwrap(),
            r#"ssh -o IdentitiesOnly=yes "root"@192.0.2.9"#
        );
    }

    #[test]
    fn render_spec_reaches_nested_untyped_maps() {
        let ctx = context();
        let vm: Resource<VmSpec> = serde_yaml::from_str(
            r#"
name: test-vm
spec:
  memoryMiB: 1024
  vcpus: 1
  network: "{{ .Networks.parent.Name }}"
  cloudInit:
    users:
      - name: tester
        sshAuthorizedKeys:
          - "{{ .Keys.test-key.PublicKey }}"
"#,
        )
        .unwrap();

        let rendered = render_spec(&vm, &ctx).unwrap();
        assert_eq!(rendered.spec.network, "parent");
        let cloud_init = serde_yaml::to_string(&rendered.spec.cloud_init).unwrap();
        assert!(cloud_init.contains("ssh-ed25519 AAAA test"));
    }

    #[test]
    fn extract_refs_deduplicates_and_skips_env() {
        let spec: serde_json::Value = serde_json::json!({
            "a": "{{ .Keys.test-key.PublicKey }}",
            "b": ["{{ .Keys.test-key.Fingerprint }}", "{{ .Networks.parent.IP }}"],
            "c": { "nested": "{{ .VMs.db.IP }} and {{ .Images.noble.Path }}" },
            "d": "{{ .Env.RUN_ID }} {{ .DefaultBaseImage }}",
        });
        let refs = extract_refs(&spec).unwrap();
        let expected: BTreeSet<ResourceRef> = [
            ResourceRef::new(ResourceKind::Key, "test-key"),
            ResourceRef::new(ResourceKind::Network, "parent"),
            ResourceRef::new(ResourceKind::Vm, "db"),
            ResourceRef::new(ResourceKind::Image, "noble"),
        ]
        .into_iter()
        .collect();
        assert_eq!(refs, expected);
    }
}

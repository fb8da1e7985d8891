//! Two-phase spec validation.
//!
//! Phase 1 runs once on the raw spec: structural invariants per kind,
//! provider references, template references, and literal inter-resource
//! references. Fields that carry template syntax cannot be checked yet; they
//! are recorded in a [`TemplatedFields`] side-table and re-validated in
//! Phase 2 after rendering, just before the owning resource is created.

use crate::spec::{EnvSpec, NetworkSpec, Resource, ResourceKind, ResourceRef, VmSpec};
use crate::template;
use snafu::ensure;
use std::collections::{BTreeMap, BTreeSet};

pub use error::{Error, Result};

/// Marker for template syntax in a field. Anything carrying this is deferred
/// to Phase 2.
const TEMPLATE_MARKER: &str = "{{";

/// Side-table of (resource, field) pairs whose validation was deferred.
#[derive(Debug, Clone, Default)]
pub struct TemplatedFields {
    entries: BTreeMap<ResourceRef, BTreeSet<String>>,
}

impl TemplatedFields {
    fn record(&mut self, resource: &ResourceRef, field: &str) {
        self.entries
            .entry(resource.clone())
            .or_default()
            .insert(field.to_string());
    }

    pub fn is_templated(&self, resource: &ResourceRef, field: &str) -> bool {
        self.entries
            .get(resource)
            .map(|fields| fields.contains(field))
            .unwrap_or(false)
    }

    pub fn has_any(&self, resource: &ResourceRef) -> bool {
        self.entries.contains_key(resource)
    }
}

fn is_templated(raw: &str) -> bool {
    raw.contains(TEMPLATE_MARKER)
}

/// Phase 1: validates the raw spec and returns the deferred-field table.
pub fn phase1(spec: &EnvSpec) -> Result<TemplatedFields> {
    validate_providers(spec)?;

    let mut templated = TemplatedFields::default();
    let network_names = validate_unique(&spec.networks, ResourceKind::Network)?;
    validate_unique(&spec.keys, ResourceKind::Key)?;
    validate_unique(&spec.vms, ResourceKind::Vm)?;
    let image_names = validate_unique(&spec.images, ResourceKind::Image)?;

    validate_provider_refs(spec)?;
    validate_images(spec, &image_names)?;
    validate_networks(spec, &mut templated)?;
    validate_vms(spec, &network_names, &mut templated)?;
    validate_template_refs(spec)?;

    Ok(templated)
}

/// Phase 2 for a rendered network: `attachTo` must be non-empty and must not
/// point the network at itself. Whether the rendered value names a real
/// interface is the provider's call.
pub fn phase2_network(name: &str, rendered: &NetworkSpec) -> Result<()> {
    if let Some(attach_to) = &rendered.attach_to {
        ensure!(
            !attach_to.is_empty(),
            error::EmptyAttachToSnafu { name }
        );
        ensure!(
            attach_to != name,
            error::SelfAttachSnafu { name }
        );
    }
    Ok(())
}

/// Phase 2 for a rendered VM: the rendered network must be one the spec
/// defines.
pub fn phase2_vm(name: &str, rendered: &VmSpec, defined_networks: &BTreeSet<String>) -> Result<()> {
    ensure!(
        defined_networks.contains(&rendered.network),
        error::UnknownVmNetworkSnafu {
            vm: name,
            network: &rendered.network,
        }
    );
    Ok(())
}

fn validate_providers(spec: &EnvSpec) -> Result<()> {
    let mut seen = BTreeSet::new();
    for provider in &spec.providers {
        ensure!(!provider.name.is_empty(), error::EmptyProviderNameSnafu);
        ensure!(
            seen.insert(provider.name.as_str()),
            error::DuplicateProviderSnafu {
                name: &provider.name,
            }
        );
    }

    let flagged: Vec<&str> = spec
        .providers
        .iter()
        .filter(|p| p.default)
        .map(|p| p.name.as_str())
        .collect();
    ensure!(
        flagged.len() <= 1,
        error::MultipleDefaultProvidersSnafu {
            names: flagged.join(", "),
        }
    );

    if let Some(name) = &spec.default_provider {
        ensure!(
            seen.contains(name.as_str()),
            error::UnknownDefaultProviderSnafu { name }
        );
    } else if spec.providers.len() > 1 {
        ensure!(
            flagged.len() == 1,
            error::NoDefaultProviderSnafu {
                count: spec.providers.len(),
            }
        );
    }
    Ok(())
}

fn validate_unique<T>(resources: &[Resource<T>], kind: ResourceKind) -> Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for resource in resources {
        ensure!(
            !resource.name.is_empty(),
            error::EmptyResourceNameSnafu { kind }
        );
        ensure!(
            names.insert(resource.name.clone()),
            error::DuplicateResourceSnafu {
                kind,
                name: &resource.name,
            }
        );
    }
    Ok(names)
}

fn validate_provider_refs(spec: &EnvSpec) -> Result<()> {
    let provider_names: BTreeSet<&str> =
        spec.providers.iter().map(|p| p.name.as_str()).collect();
    let mut check = |kind: ResourceKind, name: &str, provider: &Option<String>| -> Result<()> {
        if let Some(provider) = provider {
            ensure!(
                provider_names.contains(provider.as_str()),
                error::UnknownProviderSnafu {
                    kind,
                    name,
                    provider,
                }
            );
        }
        Ok(())
    };

    for r in &spec.keys {
        check(ResourceKind::Key, &r.name, &r.provider)?;
    }
    for r in &spec.networks {
        check(ResourceKind::Network, &r.name, &r.provider)?;
    }
    for r in &spec.vms {
        check(ResourceKind::Vm, &r.name, &r.provider)?;
    }
    for r in &spec.images {
        check(ResourceKind::Image, &r.name, &r.provider)?;
    }
    Ok(())
}

fn validate_images(spec: &EnvSpec, image_names: &BTreeSet<String>) -> Result<()> {
    let mut aliases = BTreeSet::new();
    for image in &spec.images {
        let source = &image.spec.source;
        let well_known = image_cache::registry::is_well_known(source);
        ensure!(
            well_known || source.starts_with("https://"),
            error::BadImageSourceSnafu {
                name: &image.name,
                source,
            }
        );
        if !well_known {
            ensure!(
                image.spec.sha256.is_some(),
                error::MissingImageChecksumSnafu { name: &image.name }
            );
        }
        for alias in &image.spec.aliases {
            ensure!(
                !image_names.contains(alias),
                error::AliasCollidesWithImageSnafu {
                    alias,
                    name: &image.name,
                }
            );
            ensure!(
                aliases.insert(alias.clone()),
                error::DuplicateAliasSnafu { alias }
            );
        }
    }
    Ok(())
}

fn validate_networks(spec: &EnvSpec, templated: &mut TemplatedFields) -> Result<()> {
    for network in &spec.networks {
        let name = &network.name;
        let r = ResourceRef::new(ResourceKind::Network, name);

        match &network.spec.cidr {
            Some(cidr) if is_templated(cidr) => templated.record(&r, "cidr"),
            Some(cidr) => validate_cidr(name, cidr)?,
            None => {
                ensure!(!network.spec.dhcp, error::MissingCidrSnafu { name });
            }
        }

        if let Some(attach_to) = &network.spec.attach_to {
            if is_templated(attach_to) {
                templated.record(&r, "attachTo");
            } else {
                phase2_network(name, &network.spec)?;
            }
        }
    }
    Ok(())
}

fn validate_vms(
    spec: &EnvSpec,
    network_names: &BTreeSet<String>,
    templated: &mut TemplatedFields,
) -> Result<()> {
    for vm in &spec.vms {
        let name = &vm.name;
        let r = ResourceRef::new(ResourceKind::Vm, name);

        ensure!(
            vm.spec.memory_mib > 0,
            error::NonPositiveMemorySnafu {
                name,
                value: vm.spec.memory_mib,
            }
        );
        ensure!(
            vm.spec.vcpus > 0,
            error::NonPositiveVcpusSnafu {
                name,
                value: vm.spec.vcpus,
            }
        );
        if let Some(disk) = vm.spec.disk_gib {
            ensure!(
                disk > 0,
                error::NonPositiveDiskSnafu { name, value: disk }
            );
        }

        ensure!(
            !vm.spec.network.is_empty(),
            error::MissingVmNetworkSnafu { name }
        );
        if is_templated(&vm.spec.network) {
            templated.record(&r, "network");
        } else {
            phase2_vm(name, &vm.spec, network_names)?;
        }

        if let Some(base_image) = &vm.spec.base_image {
            if is_templated(base_image) {
                templated.record(&r, "baseImage");
            }
        }
    }
    Ok(())
}

fn validate_cidr(name: &str, cidr: &str) -> Result<()> {
    let valid = match cidr.split_once('/') {
        Some((addr, prefix)) => {
            addr.parse::<std::net::IpAddr>().is_ok()
                && prefix.parse::<u8>().map(|p| p <= 128).unwrap_or(false)
        }
        None => false,
    };
    ensure!(valid, error::BadCidrSnafu { name, cidr });
    Ok(())
}

/// Every template reference in the spec must point at a defined resource.
/// Image references may use aliases.
fn validate_template_refs(spec: &EnvSpec) -> Result<()> {
    let defined: BTreeSet<ResourceRef> = spec.resource_refs().into_iter().collect();
    let refs = template::extract_refs(spec).map_err(|source| Error::RefExtraction {
        message: source.to_string(),
    })?;
    for r in refs {
        let resolved = match r.kind {
            ResourceKind::Image => spec
                .canonical_image_name(&r.name)
                .map(|name| ResourceRef::new(ResourceKind::Image, name)),
            _ => Some(r.clone()),
        };
        let exists = resolved
            .map(|resolved| defined.contains(&resolved))
            .unwrap_or(false);
        ensure!(
            exists,
            error::UnknownTemplateRefSnafu {
                kind: r.kind,
                name: &r.name,
            }
        );
    }
    Ok(())
}

mod error {
    use crate::spec::ResourceKind;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display(
            "image \"{}\": alias \"{}\" collides with an image name",
            name,
            alias
        ))]
        AliasCollidesWithImage { alias: String, name: String },

        #[snafu(display("network \"{}\": invalid CIDR \"{}\"", name, cidr))]
        BadCidr { name: String, cidr: String },

        #[snafu(display(
            "image \"{}\": source \"{}\" is neither a well-known reference nor an HTTPS URL",
            name,
            source
        ))]
        BadImageSource {
            name: String,
            #[snafu(source(false))]
            source: String,
        },

        #[snafu(display("image alias \"{}\" is defined more than once", alias))]
        DuplicateAlias { alias: String },

        #[snafu(display("provider \"{}\" is defined more than once", name))]
        DuplicateProvider { name: String },

        #[snafu(display("{} \"{}\" is defined more than once", kind, name))]
        DuplicateResource { kind: ResourceKind, name: String },

        #[snafu(display("network \"{}\": attachTo must not be empty", name))]
        EmptyAttachTo { name: String },

        #[snafu(display("provider name must not be empty"))]
        EmptyProviderName,

        #[snafu(display("{} name must not be empty", kind))]
        EmptyResourceName { kind: ResourceKind },

        #[snafu(display("network \"{}\": cidr is required when dhcp is enabled", name))]
        MissingCidr { name: String },

        #[snafu(display("image \"{}\": custom URL sources require a sha256", name))]
        MissingImageChecksum { name: String },

        #[snafu(display("vm \"{}\": network must not be empty", name))]
        MissingVmNetwork { name: String },

        #[snafu(display(
            "more than one provider is marked default: {}",
            names
        ))]
        MultipleDefaultProviders { names: String },

        #[snafu(display(
            "{} providers are defined but none is marked default",
            count
        ))]
        NoDefaultProvider { count: usize },

        #[snafu(display("vm \"{}\": disk must be > 0, got {}", name, value))]
        NonPositiveDisk { name: String, value: i64 },

        #[snafu(display("vm \"{}\": memory must be > 0, got {}", name, value))]
        NonPositiveMemory { name: String, value: i64 },

        #[snafu(display("vm \"{}\": vcpus must be > 0, got {}", name, value))]
        NonPositiveVcpus { name: String, value: i64 },

        #[snafu(display("Failed to extract template references: {}", message))]
        RefExtraction { message: String },

        #[snafu(display("network \"{}\": attachTo must not reference itself", name))]
        SelfAttach { name: String },

        #[snafu(display("defaultProvider \"{}\" is not defined", name))]
        UnknownDefaultProvider { name: String },

        #[snafu(display(
            "{} \"{}\": provider \"{}\" is not defined",
            kind,
            name,
            provider
        ))]
        UnknownProvider {
            kind: ResourceKind,
            name: String,
            provider: String,
        },

        #[snafu(display(
            "template reference to undefined {} \"{}\"",
            kind,
            name
        ))]
        UnknownTemplateRef { kind: ResourceKind, name: String },

        #[snafu(display("vm \"{}\": network \"{}\" is not defined", vm, network))]
        UnknownVmNetwork { vm: String, network: String },
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::EnvSpec;

    fn parse(yaml: &str) -> EnvSpec {
        EnvSpec::from_slice(yaml.as_bytes()).unwrap()
    }

    const VALID: &str = r#"
providers:
  - name: libvirt
    engine: ./provider-libvirt
    default: true
keys:
  - name: test-key
    spec: {}
networks:
  - name: test-network
    spec:
      cidr: 192.0.2.0/24
      dhcp: true
vms:
  - name: test-vm
    spec:
      memoryMiB: 1024
      vcpus: 1
      network: test-network
      cloudInit:
        users:
          - name: tester
            sshAuthorizedKeys:
              - "{{ .Keys.test-key.PublicKey }}"
"#;

    #[test]
    fn valid_spec_passes_phase1() {
        let templated = phase1(&parse(VALID)).unwrap();
        assert!(!templated.has_any(&ResourceRef::new(ResourceKind::Vm, "test-vm")));
    }

    #[test]
    fn duplicate_resource_names_are_rejected() {
        let mut spec = parse(VALID);
        let dup = spec.keys[0].clone();
        spec.keys.push(dup);
        let err = phase1(&spec).unwrap_err();
        assert_eq!(err.to_string(), r#"key "test-key" is defined more than once"#);
    }

    #[test]
    fn non_positive_memory_is_rejected_with_path() {
        let mut spec = parse(VALID);
        spec.vms[0].spec.memory_mib = 0;
        let err = phase1(&spec).unwrap_err();
        assert_eq!(err.to_string(), r#"vm "test-vm": memory must be > 0, got 0"#);
    }

    #[test]
    fn dhcp_requires_cidr() {
        let mut spec = parse(VALID);
        spec.networks[0].spec.cidr = None;
        let err = phase1(&spec).unwrap_err();
        assert!(err.to_string().contains("cidr is required when dhcp"));
    }

    #[test]
    fn unknown_literal_vm_network_fails_phase1() {
        let mut spec = parse(VALID);
        spec.vms[0].spec.network = "absent".to_string();
        let err = phase1(&spec).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"vm "test-vm": network "absent" is not defined"#
        );
    }

    #[test]
    fn templated_vm_network_is_deferred_to_phase2() {
        let mut spec = parse(VALID);
        spec.vms[0].spec.network = "{{ .Networks.test-network.Name }}".to_string();
        let templated = phase1(&spec).unwrap();
        let r = ResourceRef::new(ResourceKind::Vm, "test-vm");
        assert!(templated.is_templated(&r, "network"));

        let defined: BTreeSet<String> = ["test-network".to_string()].into_iter().collect();
        let mut rendered = spec.vms[0].spec.clone();
        rendered.network = "test-network".to_string();
        phase2_vm("test-vm", &rendered, &defined).unwrap();

        rendered.network = "rendered-to-nothing".to_string();
        assert!(phase2_vm("test-vm", &rendered, &defined).is_err());
    }

    #[test]
    fn templated_attach_to_is_recorded_and_checked_after_render() {
        let mut spec = parse(VALID);
        spec.networks.push(crate::spec::Resource {
            name: "child".to_string(),
            provider: None,
            spec: NetworkSpec {
                cidr: Some("198.51.100.0/24".to_string()),
                dhcp: false,
                attach_to: Some("{{ .Networks.test-network.InterfaceName }}".to_string()),
                domain: None,
            },
            provider_spec: serde_yaml::Mapping::new(),
        });
        let templated = phase1(&spec).unwrap();
        assert!(templated.is_templated(
            &ResourceRef::new(ResourceKind::Network, "child"),
            "attachTo"
        ));

        // Any non-empty rendered value is accepted; self-reference is not.
        let mut rendered = spec.networks[1].spec.clone();
        rendered.attach_to = Some("virbr0".to_string());
        phase2_network("child", &rendered).unwrap();

        rendered.attach_to = Some("child".to_string());
        assert!(phase2_network("child", &rendered).is_err());

        rendered.attach_to = Some(String::new());
        assert!(phase2_network("child", &rendered).is_err());
    }

    #[test]
    fn template_ref_to_undefined_resource_is_rejected() {
        let mut spec = parse(VALID);
        spec.vms[0]
            .spec
            .cloud_init
            .insert(
                serde_yaml::Value::String("extra".to_string()),
                serde_yaml::Value::String("{{ .Keys.absent.PublicKey }}".to_string()),
            );
        let err = phase1(&spec).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"template reference to undefined key "absent""#
        );
    }

    #[test]
    fn env_references_are_always_accepted() {
        let mut spec = parse(VALID);
        spec.vms[0].spec.cloud_init.insert(
            serde_yaml::Value::String("runId".to_string()),
            serde_yaml::Value::String("{{ .Env.RUN_ID }}".to_string()),
        );
        phase1(&spec).unwrap();
    }

    #[test]
    fn image_alias_references_count_as_defined() {
        let mut spec = parse(VALID);
        spec.images.push(crate::spec::Resource {
            name: "noble".to_string(),
            provider: None,
            spec: crate::spec::ImageSpec {
                source: "ubuntu:24.04".to_string(),
                sha256: None,
                aliases: vec!["lts".to_string()],
            },
            provider_spec: serde_yaml::Mapping::new(),
        });
        spec.vms[0].spec.base_image = Some("{{ .Images.lts.Path }}".to_string());
        phase1(&spec).unwrap();
    }

    #[test]
    fn custom_image_urls_require_a_checksum() {
        let mut spec = parse(VALID);
        spec.images.push(crate::spec::Resource {
            name: "custom".to_string(),
            provider: None,
            spec: crate::spec::ImageSpec {
                source: "https://images.example.test/custom.qcow2".to_string(),
                sha256: None,
                aliases: vec![],
            },
            provider_spec: serde_yaml::Mapping::new(),
        });
        let err = phase1(&spec).unwrap_err();
        assert!(err.to_string().contains("require a sha256"));
    }

    #[test]
    fn two_providers_need_a_default() {
        let mut spec = parse(VALID);
        spec.providers[0].default = false;
        spec.providers.push(crate::spec::ProviderConfig {
            name: "stub".to_string(),
            engine: "./stub".to_string(),
            default: false,
        });
        let err = phase1(&spec).unwrap_err();
        assert!(err.to_string().contains("none is marked default"));

        spec.providers[1].default = true;
        phase1(&spec).unwrap();
    }

    #[test]
    fn unknown_provider_reference_is_rejected() {
        let mut spec = parse(VALID);
        spec.vms[0].provider = Some("vsphere".to_string());
        let err = phase1(&spec).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"vm "test-vm": provider "vsphere" is not defined"#
        );
    }
}

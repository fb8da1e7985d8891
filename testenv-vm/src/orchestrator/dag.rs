//! Dependency ordering: template references induce a DAG over the spec's
//! resources, which is layered into execution phases.
//!
//! Phase `n` holds the resources whose dependencies all live in phases
//! `0..n`. Resources inside one phase are independent of each other and may
//! be created in parallel; phases execute strictly in order.

use crate::spec::{EnvSpec, ResourceKind, ResourceRef};
use crate::template;
use snafu::Snafu;
use std::collections::{BTreeMap, BTreeSet};

/// Computes the execution phases for a validated spec.
pub fn compile_phases(spec: &EnvSpec) -> Result<Vec<Vec<ResourceRef>>> {
    let defined: BTreeSet<ResourceRef> = spec.resource_refs().into_iter().collect();
    let mut dependencies: BTreeMap<ResourceRef, BTreeSet<ResourceRef>> = BTreeMap::new();
    let mut order: Vec<ResourceRef> = Vec::new();

    let mut add = |resource: ResourceRef, deps: BTreeSet<ResourceRef>| {
        order.push(resource.clone());
        dependencies.insert(resource, deps);
    };

    for key in &spec.keys {
        let r = ResourceRef::new(ResourceKind::Key, &key.name);
        add(r, extract(spec, ResourceKind::Key, &key.name, key, &defined)?);
    }
    for image in &spec.images {
        let r = ResourceRef::new(ResourceKind::Image, &image.name);
        add(
            r,
            extract(spec, ResourceKind::Image, &image.name, image, &defined)?,
        );
    }
    for network in &spec.networks {
        let r = ResourceRef::new(ResourceKind::Network, &network.name);
        add(
            r,
            extract(spec, ResourceKind::Network, &network.name, network, &defined)?,
        );
    }
    for vm in &spec.vms {
        let r = ResourceRef::new(ResourceKind::Vm, &vm.name);
        let mut deps = extract(spec, ResourceKind::Vm, &vm.name, vm, &defined)?;

        // A VM's literal (non-templated) references are edges too: its
        // network, and its base image when one is named.
        if !vm.spec.network.contains("{{") {
            let network = ResourceRef::new(ResourceKind::Network, &vm.spec.network);
            if defined.contains(&network) {
                deps.insert(network);
            }
        }
        if let Some(base_image) = &vm.spec.base_image {
            if !base_image.contains("{{") {
                if let Some(name) = spec.canonical_image_name(base_image) {
                    deps.insert(ResourceRef::new(ResourceKind::Image, name));
                }
            }
        }
        add(r, deps);
    }

    layer(order, dependencies)
}

/// Template references of one resource, canonicalized (image aliases resolve
/// to the image's name) and restricted to resources the spec defines.
fn extract<T: serde::Serialize>(
    spec: &EnvSpec,
    kind: ResourceKind,
    name: &str,
    resource: &T,
    defined: &BTreeSet<ResourceRef>,
) -> Result<BTreeSet<ResourceRef>> {
    let resource_ref = ResourceRef::new(kind, name);
    let refs = template::extract_refs(resource).map_err(|source| Error::RefExtraction {
        resource: resource_ref.to_string(),
        message: source.to_string(),
    })?;

    Ok(refs
        .into_iter()
        .filter_map(|r| match r.kind {
            ResourceKind::Image => spec
                .canonical_image_name(&r.name)
                .map(|canonical| ResourceRef::new(ResourceKind::Image, canonical)),
            _ => Some(r),
        })
        .filter(|r| defined.contains(r) && *r != resource_ref)
        .collect())
}

fn layer(
    order: Vec<ResourceRef>,
    dependencies: BTreeMap<ResourceRef, BTreeSet<ResourceRef>>,
) -> Result<Vec<Vec<ResourceRef>>> {
    let mut placed: BTreeSet<ResourceRef> = BTreeSet::new();
    let mut remaining = order;
    let mut phases = Vec::new();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<ResourceRef>, Vec<ResourceRef>) =
            remaining.into_iter().partition(|r| {
                dependencies
                    .get(r)
                    .map(|deps| deps.iter().all(|d| placed.contains(d)))
                    .unwrap_or(true)
            });

        if ready.is_empty() {
            return Err(Error::Cycle {
                cycle: describe_cycle(&blocked, &dependencies),
            });
        }
        placed.extend(ready.iter().cloned());
        phases.push(ready);
        remaining = blocked;
    }
    Ok(phases)
}

/// Walks unmet dependencies until a resource repeats, then formats the loop.
/// Every blocked resource has at least one unmet dependency, so the walk
/// always closes.
fn describe_cycle(
    blocked: &[ResourceRef],
    dependencies: &BTreeMap<ResourceRef, BTreeSet<ResourceRef>>,
) -> String {
    let blocked_set: BTreeSet<&ResourceRef> = blocked.iter().collect();
    let mut path: Vec<&ResourceRef> = Vec::new();
    let mut current = &blocked[0];

    loop {
        if let Some(position) = path.iter().position(|r| *r == current) {
            let mut names: Vec<String> = path[position..].iter().map(|r| r.to_string()).collect();
            names.push(current.to_string());
            return names.join(" -> ");
        }
        path.push(current);
        current = dependencies
            .get(current)
            .and_then(|deps| deps.iter().find(|d| blocked_set.contains(d)))
            .unwrap_or(current);
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cyclic dependency through {}", cycle))]
    Cycle { cycle: String },

    #[snafu(display("Failed to extract references of {}: {}", resource, message))]
    RefExtraction { resource: String, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::EnvSpec;

    fn phases_of(yaml: &str) -> Vec<Vec<ResourceRef>> {
        let spec = EnvSpec::from_slice(yaml.as_bytes()).unwrap();
        compile_phases(&spec).unwrap()
    }

    #[test]
    fn independent_resources_share_the_first_phase() {
        let phases = phases_of(
            r#"
keys:
  - name: test-key
    spec: {}
networks:
  - name: test-network
    spec: {}
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
"#,
        );
        assert_eq!(phases.len(), 2);
        assert_eq!(phases[0].len(), 2);
        assert_eq!(
            phases[1],
            vec![ResourceRef::new(ResourceKind::Vm, "test-vm")]
        );
    }

    #[test]
    fn chained_references_stack_phases() {
        let phases = phases_of(
            r#"
networks:
  - name: parent
    spec: {}
  - name: child
    spec:
      attachTo: "{{ .Networks.parent.InterfaceName }}"
vms:
  - name: leaf
    spec:
      memoryMiB: 512
      vcpus: 1
      network: child
"#,
        );
        assert_eq!(phases.len(), 3);
        assert_eq!(
            phases[0],
            vec![ResourceRef::new(ResourceKind::Network, "parent")]
        );
        assert_eq!(
            phases[1],
            vec![ResourceRef::new(ResourceKind::Network, "child")]
        );
        assert_eq!(phases[2], vec![ResourceRef::new(ResourceKind::Vm, "leaf")]);
    }

    #[test]
    fn literal_base_image_is_an_edge_through_its_alias() {
        let phases = phases_of(
            r#"
images:
  - name: noble
    spec:
      source: ubuntu:24.04
      aliases: [lts]
vms:
  - name: box
    spec:
      memoryMiB: 512
      vcpus: 1
      network: lan
      baseImage: lts
networks:
  - name: lan
    spec: {}
"#,
        );
        assert_eq!(phases.len(), 2);
        assert!(phases[0].contains(&ResourceRef::new(ResourceKind::Image, "noble")));
        assert_eq!(phases[1], vec![ResourceRef::new(ResourceKind::Vm, "box")]);
    }

    #[test]
    fn cycles_are_reported_with_their_members() {
        let spec = EnvSpec::from_slice(
            br#"
networks:
  - name: a
    spec:
      attachTo: "{{ .Networks.b.InterfaceName }}"
  - name: b
    spec:
      attachTo: "{{ .Networks.a.InterfaceName }}"
"#,
        )
        .unwrap();
        let err = compile_phases(&spec).unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("cyclic dependency through"));
        assert!(msg.contains(r#"network "a""#));
        assert!(msg.contains(r#"network "b""#));
    }

    #[test]
    fn dependency_chain_spans_at_least_three_phases() {
        // Three keys, two networks, two VMs with cross-references.
        let phases = phases_of(
            r#"
keys:
  - name: k1
    spec: {}
  - name: k2
    spec: {}
  - name: k3
    spec: {}
networks:
  - name: mgmt
    spec: {}
  - name: data
    spec:
      attachTo: "{{ .Networks.mgmt.InterfaceName }}"
vms:
  - name: front
    spec:
      memoryMiB: 512
      vcpus: 1
      network: mgmt
      cloudInit:
        users:
          - name: ops
            sshAuthorizedKeys: ["{{ .Keys.k1.PublicKey }}"]
  - name: back
    spec:
      memoryMiB: 512
      vcpus: 1
      network: data
      cloudInit:
        hostAlias: "{{ .VMs.front.IP }}"
        users:
          - name: ops
            sshAuthorizedKeys: ["{{ .Keys.k2.PublicKey }}", "{{ .Keys.k3.PublicKey }}"]
"#,
        );
        assert!(phases.len() >= 3, "got {} phases", phases.len());
        let total: usize = phases.iter().map(Vec::len).sum();
        assert_eq!(total, 7);
    }
}

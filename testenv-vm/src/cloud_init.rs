//! Cloud-init introspection shared by the orchestrator and the runtime
//! provisioner.
//!
//! Providers usually return `sshUser` and `privateKeyPath` themselves; when
//! they do not, both creation paths fall back to the VM's rendered
//! cloud-init: the first declared user (else `root`), and the private key
//! whose public half appears among the authorized keys.

use crate::template::TemplateContext;
use std::collections::BTreeMap;

/// Fills `sshUser` and `privateKeyPath` in a VM's state bag when the
/// provider did not supply them.
pub(crate) fn derive_ssh_attrs(
    bag: &mut BTreeMap<String, serde_json::Value>,
    cloud_init: &serde_json::Value,
    context: &TemplateContext,
) {
    if !bag.contains_key("sshUser") {
        let user = first_user_name(cloud_init).unwrap_or_else(|| "root".to_string());
        bag.insert("sshUser".to_string(), serde_json::Value::String(user));
    }
    if !bag.contains_key("privateKeyPath") {
        for authorized in authorized_keys(cloud_init) {
            if let Some(data) = context
                .keys
                .values()
                .find(|data| !data.public_key.is_empty() && data.public_key == authorized)
            {
                bag.insert(
                    "privateKeyPath".to_string(),
                    serde_json::Value::String(data.private_key_path.clone()),
                );
                break;
            }
        }
    }
}

/// The name of the first cloud-init user, if any.
pub(crate) fn first_user_name(cloud_init: &serde_json::Value) -> Option<String> {
    cloud_init
        .get("users")?
        .as_array()?
        .first()?
        .get("name")?
        .as_str()
        .map(str::to_string)
}

/// Every authorized key across all cloud-init users, in declaration order.
pub(crate) fn authorized_keys(cloud_init: &serde_json::Value) -> Vec<String> {
    cloud_init
        .get("users")
        .and_then(serde_json::Value::as_array)
        .map(|users| {
            users
                .iter()
                .filter_map(|user| user.get("sshAuthorizedKeys"))
                .filter_map(serde_json::Value::as_array)
                .flatten()
                .filter_map(serde_json::Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

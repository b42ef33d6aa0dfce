//! Composite identifiers for protected items and their containers.
//!
//! A protected VM is not addressed by a single key. The control plane wants a
//! vault, a resource group, a container name and a protected item name, and
//! the last two are themselves `;`-joined composites of the resource group and
//! the VM name. Everything here is pure and deterministic, so callers rebuild
//! the identity on every call instead of persisting it.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Fixed segments of the IaaS VM container/item names.
const CONTAINER_PREFIX: &str = "iaasvmcontainer";
const CONTAINER_TYPE: &str = "iaasvmcontainerv2";
const ITEM_PREFIX: &str = "VM";

/// Provider namespace and fabric used by VM backup.
pub const RECOVERY_SERVICES_PROVIDER: &str = "Microsoft.RecoveryServices";
pub const BACKUP_FABRIC: &str = "Azure";

/// Path key that carries the VM name in a compute resource ID.
const VIRTUAL_MACHINES_KEY: &str = "virtualMachines";

/// Identity errors. These are input errors and are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("Malformed resource ID '{id}': {reason}")]
    Malformed { id: String, reason: String },

    #[error("Resource ID '{id}' has no '{key}' segment")]
    MissingSegment { id: String, key: String },

    #[error("Invalid {field} '{value}': {reason}")]
    InvalidSegment {
        field: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("Invalid import ID '{id}': {reason}")]
    InvalidImportId { id: String, reason: String },
}

pub type Result<T> = std::result::Result<T, IdentityError>;

/// A parsed ARM resource ID.
///
/// `/subscriptions/{s}/resourceGroups/{g}/providers/{p}/{type}/{name}/...`
/// is split into key/value pairs. The subscription is mandatory, the resource
/// group and provider are optional, everything else lands in `path` in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceId {
    pub subscription_id: String,
    pub resource_group: Option<String>,
    pub provider: Option<String>,
    pub path: Vec<(String, String)>,
}

impl ResourceId {
    /// Look up the value of a path segment by key.
    pub fn segment(&self, key: &str) -> Option<&str> {
        self.path
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl FromStr for ResourceId {
    type Err = IdentityError;

    fn from_str(id: &str) -> Result<Self> {
        let malformed = |reason: &str| IdentityError::Malformed {
            id: id.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(malformed("empty"));
        }
        let rest = trimmed
            .strip_prefix('/')
            .ok_or_else(|| malformed("must start with '/'"))?;
        let rest = rest.strip_suffix('/').unwrap_or(rest);

        let components: Vec<&str> = rest.split('/').collect();
        if components.iter().any(|c| c.is_empty()) {
            return Err(malformed("contains an empty segment"));
        }
        if components.len() % 2 != 0 {
            return Err(malformed("number of segments is not even"));
        }

        let mut subscription_id = None;
        let mut resource_group = None;
        let mut provider = None;
        let mut path = Vec::with_capacity(components.len() / 2);

        for pair in components.chunks(2) {
            let (key, value) = (pair[0], pair[1]);
            if key.eq_ignore_ascii_case("subscriptions") && subscription_id.is_none() {
                subscription_id = Some(value.to_string());
            } else if key.eq_ignore_ascii_case("resourceGroups") && resource_group.is_none() {
                resource_group = Some(value.to_string());
            } else if key.eq_ignore_ascii_case("providers") && provider.is_none() {
                provider = Some(value.to_string());
            } else {
                path.push((key.to_string(), value.to_string()));
            }
        }

        let subscription_id = subscription_id.ok_or_else(|| IdentityError::MissingSegment {
            id: id.to_string(),
            key: "subscriptions".to_string(),
        })?;

        Ok(Self {
            subscription_id,
            resource_group,
            provider,
            path,
        })
    }
}

/// Extract the VM name from a compute resource ID.
///
/// Fails with [`IdentityError::Malformed`] when the ID cannot be tokenised and
/// with [`IdentityError::MissingSegment`] when it has no `virtualMachines`
/// segment.
pub fn extract_vm_name(vm_id: &str) -> Result<String> {
    let parsed: ResourceId = vm_id.parse()?;
    parsed
        .segment(VIRTUAL_MACHINES_KEY)
        .map(str::to_string)
        .ok_or_else(|| IdentityError::MissingSegment {
            id: vm_id.to_string(),
            key: VIRTUAL_MACHINES_KEY.to_string(),
        })
}

/// Build `(container_name, protected_item_name)` for a resource group and VM.
pub fn encode(resource_group: &str, vm_name: &str) -> (String, String) {
    let container = format!("{CONTAINER_PREFIX};{CONTAINER_TYPE};{resource_group};{vm_name}");
    let item = format!("{ITEM_PREFIX};{CONTAINER_TYPE};{resource_group};{vm_name}");
    (container, item)
}

/// Split a protected item name back into `(resource_group, vm_name)`.
fn decode_item_name(item: &str) -> Option<(&str, &str)> {
    match item.split(';').collect::<Vec<_>>().as_slice() {
        [prefix, kind, rg, vm]
            if prefix.eq_ignore_ascii_case(ITEM_PREFIX)
                && kind.eq_ignore_ascii_case(CONTAINER_TYPE)
                && !rg.is_empty()
                && !vm.is_empty() =>
        {
            Some((*rg, *vm))
        }
        _ => None,
    }
}

/// Split a container name back into `(resource_group, vm_name)`.
fn decode_container_name(container: &str) -> Option<(&str, &str)> {
    match container.split(';').collect::<Vec<_>>().as_slice() {
        [prefix, kind, rg, vm]
            if prefix.eq_ignore_ascii_case(CONTAINER_PREFIX)
                && kind.eq_ignore_ascii_case(CONTAINER_TYPE)
                && !rg.is_empty()
                && !vm.is_empty() =>
        {
            Some((*rg, *vm))
        }
        _ => None,
    }
}

fn validate_segment(field: &'static str, value: &str) -> Result<()> {
    let invalid = |reason| IdentityError::InvalidSegment {
        field,
        value: value.to_string(),
        reason,
    };
    if value.trim().is_empty() {
        return Err(invalid("must not be empty"));
    }
    if value.contains(';') {
        return Err(invalid("must not contain ';'"));
    }
    if value.contains('/') {
        return Err(invalid("must not contain '/'"));
    }
    Ok(())
}

/// Address of a single protection binding.
///
/// The container and item names are derived, never stored, so both always
/// carry the same resource group and VM segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProtectedItemIdentity {
    resource_group: String,
    vm_name: String,
    vault_name: String,
}

impl ProtectedItemIdentity {
    pub fn new(
        resource_group: impl Into<String>,
        vm_name: impl Into<String>,
        vault_name: impl Into<String>,
    ) -> Result<Self> {
        let identity = Self {
            resource_group: resource_group.into(),
            vm_name: vm_name.into(),
            vault_name: vault_name.into(),
        };
        validate_segment("resource group", &identity.resource_group)?;
        validate_segment("VM name", &identity.vm_name)?;
        validate_segment("vault name", &identity.vault_name)?;
        Ok(identity)
    }

    /// Derive the identity from a VM resource ID plus the vault coordinates.
    pub fn from_vm_id(vm_id: &str, resource_group: &str, vault_name: &str) -> Result<Self> {
        let vm_name = extract_vm_name(vm_id)?;
        Self::new(resource_group, vm_name, vault_name)
    }

    pub fn resource_group(&self) -> &str {
        &self.resource_group
    }

    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }

    pub fn vault_name(&self) -> &str {
        &self.vault_name
    }

    pub fn container_name(&self) -> String {
        encode(&self.resource_group, &self.vm_name).0
    }

    pub fn protected_item_name(&self) -> String {
        encode(&self.resource_group, &self.vm_name).1
    }

    /// Full ARM ID of the protected item. Also the import identifier.
    pub fn resource_id(&self, subscription_id: &str) -> String {
        let (container, item) = encode(&self.resource_group, &self.vm_name);
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/{}/vaults/{}/backupFabrics/{}/protectionContainers/{}/protectedItems/{}",
            subscription_id,
            self.resource_group,
            RECOVERY_SERVICES_PROVIDER,
            self.vault_name,
            BACKUP_FABRIC,
            container,
            item
        )
    }
}

impl fmt::Display for ProtectedItemIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (vault: {}, resource group: {})",
            self.protected_item_name(),
            self.vault_name,
            self.resource_group
        )
    }
}

/// A parsed import identifier: the full ARM ID of a protected item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportId {
    pub subscription_id: String,
    pub identity: ProtectedItemIdentity,
}

impl ImportId {
    pub fn parse(id: &str) -> Result<Self> {
        let invalid = |reason: &str| IdentityError::InvalidImportId {
            id: id.to_string(),
            reason: reason.to_string(),
        };

        let parsed: ResourceId = id.parse()?;
        let resource_group = parsed
            .resource_group
            .clone()
            .ok_or_else(|| invalid("missing resourceGroups segment"))?;

        match parsed.provider.as_deref() {
            Some(p) if p.eq_ignore_ascii_case(RECOVERY_SERVICES_PROVIDER) => {}
            _ => return Err(invalid("provider must be Microsoft.RecoveryServices")),
        }

        let vault = parsed
            .segment("vaults")
            .ok_or_else(|| invalid("missing vaults segment"))?;
        match parsed.segment("backupFabrics") {
            Some(f) if f.eq_ignore_ascii_case(BACKUP_FABRIC) => {}
            _ => return Err(invalid("backup fabric must be Azure")),
        }
        let container = parsed
            .segment("protectionContainers")
            .ok_or_else(|| invalid("missing protectionContainers segment"))?;
        let item = parsed
            .segment("protectedItems")
            .ok_or_else(|| invalid("missing protectedItems segment"))?;

        let (item_rg, vm_name) =
            decode_item_name(item).ok_or_else(|| invalid("unrecognised protected item name"))?;
        let (container_rg, container_vm) = decode_container_name(container)
            .ok_or_else(|| invalid("unrecognised protection container name"))?;

        // The control plane lower-cases container names, so compare loosely.
        if !item_rg.eq_ignore_ascii_case(container_rg) || !vm_name.eq_ignore_ascii_case(container_vm)
        {
            return Err(invalid("container and protected item disagree"));
        }
        if !item_rg.eq_ignore_ascii_case(&resource_group) {
            return Err(invalid("protected item belongs to a different resource group"));
        }

        let identity = ProtectedItemIdentity::new(resource_group, vm_name, vault)?;
        Ok(Self {
            subscription_id: parsed.subscription_id,
            identity,
        })
    }
}

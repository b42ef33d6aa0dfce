//! Audit events for protection lifecycle changes.
//!
//! Events go to the `audit` tracing target with the component name and the
//! IDs of the objects involved. Logging never fails and never blocks the
//! reconciliation that emits it.

use crate::identity::ProtectedItemIdentity;

/// Severity of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditLevel {
    Audit,
    Info,
    Warn,
}

/// Audit logger for one component.
#[derive(Debug, Clone)]
pub struct AuditLogger {
    component: String,
}

impl AuditLogger {
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
        }
    }

    /// Log an audit event.
    pub fn log(&self, level: AuditLevel, message: impl Into<String>, object_ids: Vec<String>) {
        let message = message.into();
        match level {
            AuditLevel::Audit | AuditLevel::Info => {
                tracing::info!(target: "audit", component = %self.component, objects = ?object_ids, "{}", message)
            }
            AuditLevel::Warn => {
                tracing::warn!(target: "audit", component = %self.component, objects = ?object_ids, "{}", message)
            }
        }
    }

    fn ids(identity: &ProtectedItemIdentity) -> Vec<String> {
        vec![
            identity.vault_name().to_string(),
            identity.protected_item_name(),
        ]
    }

    pub fn protected(&self, identity: &ProtectedItemIdentity, policy_id: &str) {
        self.log(
            AuditLevel::Audit,
            format!("VM {} protected with policy {}", identity.vm_name(), policy_id),
            Self::ids(identity),
        );
    }

    pub fn unprotected(&self, identity: &ProtectedItemIdentity) {
        self.log(
            AuditLevel::Audit,
            format!("Protection stopped for VM {}", identity.vm_name()),
            Self::ids(identity),
        );
    }

    pub fn drift(&self, identity: &ProtectedItemIdentity, detail: &str) {
        self.log(
            AuditLevel::Warn,
            format!("Drift detected for VM {}: {}", identity.vm_name(), detail),
            Self::ids(identity),
        );
    }

    pub fn imported(&self, identity: &ProtectedItemIdentity, address: &str) {
        self.log(
            AuditLevel::Info,
            format!("Imported VM {} as {}", identity.vm_name(), address),
            Self::ids(identity),
        );
    }

    pub fn vault_deleted(&self, resource_group: &str, vault_name: &str) {
        self.log(
            AuditLevel::Audit,
            format!("Vault {} deleted (resource group: {})", vault_name, resource_group),
            vec![vault_name.to_string()],
        );
    }
}

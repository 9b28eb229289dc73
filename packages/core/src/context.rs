use serde::{Deserialize, Serialize};

/// Authenticated identity on whose behalf a message is processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Unique identifier for the authenticated entity.
    pub id: String,
    /// Roles assigned to this principal for authorization checks.
    pub roles: Vec<String>,
}

impl Principal {
    /// Principal with the given id and roles.
    pub fn new(id: impl Into<String>, roles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            id: id.into(),
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether `role` is among the principal's roles.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Per-dispatch context carrying identity, tenancy, and correlation information.
/// Threaded through every handler and module invoked for one inbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Authenticated principal, if the caller is authenticated.
    pub principal: Option<Principal>,
    /// Tenant scope for multi-tenant isolation. `None` for single-tenant deployments.
    pub tenant_id: Option<String>,
    /// Caller-supplied correlation identifier for log correlation.
    pub correlation_id: Option<String>,
}

impl RequestContext {
    /// Context with no principal.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Context authenticated as `principal`.
    #[must_use]
    pub fn for_principal(principal: Principal) -> Self {
        Self {
            principal: Some(principal),
            ..Self::default()
        }
    }

    /// Same context with `correlation_id` set.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Whether a principal is attached.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.principal.is_some()
    }
}

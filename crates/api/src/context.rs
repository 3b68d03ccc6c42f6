use velopay_auth::{Principal, PrincipalId, Role};

/// Principal context for a request (resolved identity + roles).
///
/// Populated by [`crate::middleware::principal_middleware`] from the
/// headers the upstream auth gateway injects. Immutable for the duration
/// of the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalContext {
    principal: Principal,
}

impl PrincipalContext {
    pub fn new(principal: Principal) -> Self {
        Self { principal }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn principal_id(&self) -> PrincipalId {
        self.principal.id
    }

    pub fn roles(&self) -> &[Role] {
        &self.principal.roles
    }
}

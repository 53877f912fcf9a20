//! Capability grants: the whitelist the sandboxes consult.
//!
//! Two views of the same authority: a synchronous in-memory whitelist for
//! hot-path checks, and signed tokens (see [`crate::token`]) for bearers that
//! cross the sandbox boundary. The invariant is that every token the
//! sandboxes accept originated from a grant recorded here.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

use helion_guard::Capability;

use crate::token::TokenService;

/// The result of a grant: the surviving capability set plus one token each.
#[derive(Debug, Clone)]
pub struct Grant {
    /// Capabilities that survived the intersection with the closed set.
    pub capabilities: Vec<Capability>,
    /// One signed token per granted capability.
    pub tokens: HashMap<Capability, String>,
}

/// Per-app capability whitelist and token issuance.
pub struct CapabilityService {
    tokens: TokenService,
    granted: RwLock<HashMap<String, HashSet<Capability>>>,
    issued: RwLock<HashMap<String, Vec<String>>>,
}

impl CapabilityService {
    /// Create the service around an initialized token signer.
    pub fn new(tokens: TokenService) -> Self {
        Self {
            tokens,
            granted: RwLock::new(HashMap::new()),
            issued: RwLock::new(HashMap::new()),
        }
    }

    /// Grant capabilities to an app and sign one token per capability.
    ///
    /// Requests outside the closed set have already been dropped by parsing
    /// ([`Capability`] is a closed enum); duplicates collapse here. A second
    /// grant for the same app extends the whitelist rather than replacing it.
    pub fn grant(&self, app_id: &str, requested: &[Capability]) -> Grant {
        let mut unique: Vec<Capability> = Vec::new();
        for cap in requested {
            if !unique.contains(cap) {
                unique.push(*cap);
            }
        }

        let mut tokens = HashMap::new();
        {
            let mut granted = self.granted.write();
            let entry = granted.entry(app_id.to_string()).or_default();
            for cap in &unique {
                entry.insert(*cap);
            }
        }
        {
            let mut issued = self.issued.write();
            let entry = issued.entry(app_id.to_string()).or_default();
            for cap in &unique {
                let token = self.tokens.issue(app_id, *cap);
                entry.push(token.clone());
                tokens.insert(*cap, token);
            }
        }

        tracing::debug!(app_id, count = unique.len(), "granted capabilities");
        Grant {
            capabilities: unique,
            tokens,
        }
    }

    /// Synchronous whitelist check.
    pub fn check(&self, app_id: &str, cap: Capability) -> bool {
        self.granted
            .read()
            .get(app_id)
            .is_some_and(|set| set.contains(&cap))
    }

    /// The app's full granted set (empty when unknown).
    pub fn granted_set(&self, app_id: &str) -> HashSet<Capability> {
        self.granted.read().get(app_id).cloned().unwrap_or_default()
    }

    /// Verify a bearer token. See [`TokenService::verify`].
    pub fn verify(&self, token: &str) -> crate::token::Verification {
        self.tokens.verify(token)
    }

    /// Revoke one token.
    pub fn revoke_token(&self, token: &str) {
        self.tokens.revoke(token);
    }

    /// Revoke every token issued to an app and clear its whitelist entry.
    pub fn revoke_all(&self, app_id: &str) {
        let tokens = self.issued.write().remove(app_id).unwrap_or_default();
        for token in &tokens {
            self.tokens.revoke(token);
        }
        self.granted.write().remove(app_id);
        tracing::debug!(app_id, revoked = tokens.len(), "revoked all capabilities");
    }

    /// Apps that currently hold at least one grant.
    pub fn apps(&self) -> Vec<String> {
        self.granted.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> CapabilityService {
        CapabilityService::new(TokenService::new())
    }

    #[test]
    fn grant_issues_one_token_per_capability() {
        let svc = service();
        let grant = svc.grant("app", &[Capability::UiWindow, Capability::TimerBasic]);
        assert_eq!(grant.capabilities.len(), 2);
        assert_eq!(grant.tokens.len(), 2);
        for token in grant.tokens.values() {
            assert!(svc.verify(token).valid);
        }
    }

    #[test]
    fn duplicate_requests_collapse() {
        let svc = service();
        let grant = svc.grant("app", &[Capability::UiWindow, Capability::UiWindow]);
        assert_eq!(grant.capabilities, vec![Capability::UiWindow]);
    }

    #[test]
    fn check_reflects_grants() {
        let svc = service();
        assert!(!svc.check("app", Capability::StorageLocal));
        svc.grant("app", &[Capability::StorageLocal]);
        assert!(svc.check("app", Capability::StorageLocal));
        assert!(!svc.check("app", Capability::NetworkHttp));
        assert!(!svc.check("other", Capability::StorageLocal));
    }

    #[test]
    fn revoke_all_invalidates_tokens_and_whitelist() {
        let svc = service();
        let grant = svc.grant("app", &[Capability::UiWindow, Capability::StorageLocal]);
        svc.revoke_all("app");

        assert!(!svc.check("app", Capability::UiWindow));
        for token in grant.tokens.values() {
            let v = svc.verify(token);
            assert!(!v.valid);
            assert_eq!(v.error, Some(crate::token::TokenError::Revoked));
        }
    }

    #[test]
    fn revoke_single_token_leaves_whitelist() {
        let svc = service();
        let grant = svc.grant("app", &[Capability::UiWindow]);
        let token = &grant.tokens[&Capability::UiWindow];
        svc.revoke_token(token);

        assert!(!svc.verify(token).valid);
        // The synchronous whitelist is untouched by single-token revocation.
        assert!(svc.check("app", Capability::UiWindow));
    }

    #[test]
    fn second_grant_extends() {
        let svc = service();
        svc.grant("app", &[Capability::UiWindow]);
        svc.grant("app", &[Capability::TimerBasic]);
        assert!(svc.check("app", Capability::UiWindow));
        assert!(svc.check("app", Capability::TimerBasic));
    }
}

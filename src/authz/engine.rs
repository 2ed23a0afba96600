use std::sync::Arc;

use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use serde::Serialize;

use crate::authz::errors::{ConfigError, QueryFault};
use crate::authz::matcher::EvalContext;
use crate::authz::model::Model;
use crate::authz::roles::RoleOptions;
use crate::authz::store::{PolicyRule, PolicyStore};

/// Outcome of one query. A deny is a normal result, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    /// Insertion index of the rule that determined the outcome.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<PolicyRule>,
}

/// Decide one request against `store`, which must have been built for `model`.
///
/// Rules are visited in insertion order; when nothing matches the request is
/// denied.
pub fn enforce(
    model: &Model,
    store: &PolicyStore,
    request: &[&str],
) -> Result<Decision, QueryFault> {
    let expected = model.request().len();
    if request.len() != expected {
        return Err(QueryFault::ArityMismatch {
            expected,
            found: request.len(),
        });
    }

    let mut merger = model.effect().merger();
    for (index, (rule, eft)) in store.rules_with_effect().enumerate() {
        let ctx = EvalContext {
            request,
            rule: rule.values(),
            roles: store,
        };
        if model.matcher().evaluate(&ctx)? && merger.push(index, eft) {
            break;
        }
    }

    let (allowed, rule_index) = merger.finish();
    tracing::debug!(?request, allowed, ?rule_index, "authorization decision");

    Ok(Decision {
        allowed,
        rule_index,
        rule: rule_index.and_then(|i| store.rule(i)).cloned(),
    })
}

/// A model bound to a swappable policy snapshot.
///
/// Queries run against an `Arc` snapshot and never hold the lock while
/// evaluating. Mutations build a new snapshot and swap it in, so in-flight
/// queries finish against the policy they started with.
#[derive(Debug)]
pub struct Enforcer {
    model: Arc<Model>,
    store: RwLock<Arc<PolicyStore>>,
}

impl Enforcer {
    /// `store` must have been built for `model`.
    pub fn new(model: Model, store: PolicyStore) -> Self {
        Self {
            model: Arc::new(model),
            store: RwLock::new(Arc::new(store)),
        }
    }

    pub fn from_text(model_text: &str, policy_text: &str) -> Result<Self, ConfigError> {
        Self::from_text_with(model_text, policy_text, RoleOptions::default())
    }

    pub fn from_text_with(
        model_text: &str,
        policy_text: &str,
        options: RoleOptions,
    ) -> Result<Self, ConfigError> {
        let model = Model::parse(model_text)?;
        let store = PolicyStore::load_with(policy_text, &model, options)?;
        tracing::info!(
            rules = store.len(),
            role_facts = store.role_fact_count(),
            effect = ?model.effect(),
            "Loaded authorization model and policy"
        );
        Ok(Self::new(model, store))
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// The policy currently in force.
    pub fn snapshot(&self) -> Arc<PolicyStore> {
        self.store.read().clone()
    }

    /// Decide a request with one value per request attribute, in order.
    pub fn enforce(&self, request: &[&str]) -> Result<Decision, QueryFault> {
        let snapshot = self.snapshot();
        enforce(&self.model, &snapshot, request)
    }

    /// Shorthand for the common `sub, obj, act` request shape.
    pub fn check(&self, subject: &str, object: &str, action: &str) -> Result<bool, QueryFault> {
        self.enforce(&[subject, object, action])
            .map(|decision| decision.allowed)
    }

    pub fn add_policy(&self, values: &[&str]) -> Result<bool, ConfigError> {
        self.update(|store| store.add_policy(values))
    }

    pub fn remove_policy(&self, values: &[&str]) -> Result<bool, ConfigError> {
        self.update(|store| store.remove_policy(values))
    }

    pub fn remove_filtered_policy(
        &self,
        field_index: usize,
        values: &[&str],
    ) -> Result<usize, ConfigError> {
        self.update(|store| store.remove_filtered_policy(field_index, values))
    }

    pub fn add_role_fact(&self, relation: &str, values: &[&str]) -> Result<bool, ConfigError> {
        self.update(|store| store.add_role_fact(relation, values))
    }

    pub fn remove_role_fact(&self, relation: &str, values: &[&str]) -> Result<bool, ConfigError> {
        self.update(|store| store.remove_role_fact(relation, values))
    }

    /// Replace the whole policy. On error the current policy stays in force.
    pub fn reload(&self, policy_text: &str) -> Result<(), ConfigError> {
        let guard = self.store.upgradable_read();
        let next = match PolicyStore::load_with(policy_text, &self.model, guard.options()) {
            Ok(store) => store,
            Err(e) => {
                tracing::warn!(error = %e, "Policy reload rejected, keeping current policy");
                return Err(e);
            }
        };
        tracing::info!(
            rules = next.len(),
            role_facts = next.role_fact_count(),
            "Reloaded policy"
        );
        *RwLockUpgradableReadGuard::upgrade(guard) = Arc::new(next);
        Ok(())
    }

    /// Every role `member` inherits through `relation`, nearest first.
    pub fn implicit_roles_for(
        &self,
        relation: &str,
        member: &str,
        domain: Option<&str>,
    ) -> Vec<String> {
        self.snapshot()
            .role_graph(relation)
            .map(|g| g.implicit_roles_for(member, domain))
            .unwrap_or_default()
    }

    /// Copy-on-write mutation. The upgradable read admits readers but only
    /// one writer at a time.
    fn update<T>(
        &self,
        mutate: impl FnOnce(&mut PolicyStore) -> Result<T, ConfigError>,
    ) -> Result<T, ConfigError> {
        let guard = self.store.upgradable_read();
        let mut next = PolicyStore::clone(&guard);
        let out = mutate(&mut next).map_err(|e| {
            tracing::warn!(error = %e, "Policy mutation rejected");
            e
        })?;
        *RwLockUpgradableReadGuard::upgrade(guard) = Arc::new(next);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODEL: &str = r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act, eft

[role_definition]
g = _, _

[policy_effect]
e = some(where (p.eft == allow)) && !some(where (p.eft == deny))

[matchers]
m = g(r.sub, p.sub) && r.obj == p.obj && r.act == p.act
"#;

    const POLICY: &str = r#"
p, admin, /admin/dashboard, GET, allow
p, admin, /admin/posts, GET, allow
p, admin, /admin/posts, POST, allow
p, admin, /admin/users, POST, allow
p, intern, /admin/users, POST, deny

g, alice, admin
g, dave, intern
g, dave, admin
"#;

    fn enforcer() -> Enforcer {
        Enforcer::from_text(MODEL, POLICY).unwrap()
    }

    #[test]
    fn test_allow_through_role() {
        let e = enforcer();
        assert!(e.check("alice", "/admin/dashboard", "GET").unwrap());
        assert!(e.check("alice", "/admin/posts", "POST").unwrap());
    }

    #[test]
    fn test_default_deny() {
        let e = enforcer();
        assert!(!e.check("bob", "/admin/dashboard", "GET").unwrap());
        assert!(!e.check("alice", "/admin/dashboard", "POST").unwrap());
        let decision = e.enforce(&["alice", "/", "GET"]).unwrap();
        assert_eq!(
            decision,
            Decision {
                allowed: false,
                rule_index: None,
                rule: None
            }
        );
    }

    #[test]
    fn test_deny_overrides_allow() {
        let e = enforcer();
        // dave is admin (allow) and intern (deny) on the same route
        let decision = e.enforce(&["dave", "/admin/users", "POST"]).unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.rule_index, Some(4));
        // but still allowed elsewhere
        assert!(e.check("dave", "/admin/posts", "GET").unwrap());
    }

    #[test]
    fn test_reports_first_deciding_rule() {
        let e = enforcer();
        let decision = e.enforce(&["alice", "/admin/posts", "GET"]).unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.rule_index, Some(1));
        assert_eq!(
            decision.rule.unwrap().values(),
            ["admin", "/admin/posts", "GET", "allow"]
        );
    }

    #[test]
    fn test_arity_mismatch_is_a_fault() {
        let e = enforcer();
        assert_eq!(
            e.enforce(&["alice", "/admin/dashboard"]).unwrap_err(),
            QueryFault::ArityMismatch {
                expected: 3,
                found: 2
            }
        );
        assert!(e.enforce(&["alice", "/admin/dashboard", "GET", "x"]).is_err());
    }

    #[test]
    fn test_mutations_swap_snapshot() {
        let e = enforcer();
        let before = e.snapshot();

        assert!(e.add_role_fact("g", &["bob", "admin"]).unwrap());
        assert!(e.check("bob", "/admin/dashboard", "GET").unwrap());
        // the earlier snapshot is unaffected
        assert!(!enforce(e.model(), &before, &["bob", "/admin/dashboard", "GET"])
            .unwrap()
            .allowed);

        assert!(e.remove_role_fact("g", &["bob", "admin"]).unwrap());
        assert!(!e.check("bob", "/admin/dashboard", "GET").unwrap());

        assert!(e.add_policy(&["bob", "/reports", "GET", "allow"]).unwrap());
        assert!(e.check("bob", "/reports", "GET").unwrap());
        assert!(e.remove_policy(&["bob", "/reports", "GET", "allow"]).unwrap());
        assert!(!e.check("bob", "/reports", "GET").unwrap());

        assert_eq!(e.remove_filtered_policy(0, &["admin"]).unwrap(), 4);
        assert!(!e.check("alice", "/admin/dashboard", "GET").unwrap());
    }

    #[test]
    fn test_rejected_mutation_keeps_policy() {
        let e = enforcer();
        assert!(e.add_policy(&["bob", "/x", "GET", "perhaps"]).is_err());
        assert!(e.add_role_fact("g9", &["bob", "admin"]).is_err());
        assert_eq!(e.snapshot().len(), 5);
    }

    #[test]
    fn test_reload() {
        let e = enforcer();
        e.reload("p, bob, /admin/dashboard, GET, allow").unwrap();
        assert!(e.check("bob", "/admin/dashboard", "GET").unwrap());
        assert!(!e.check("alice", "/admin/dashboard", "GET").unwrap());

        assert!(e.reload("p, broken").is_err());
        assert!(e.check("bob", "/admin/dashboard", "GET").unwrap());
    }

    #[test]
    fn test_implicit_roles() {
        let e = enforcer();
        assert_eq!(e.implicit_roles_for("g", "dave", None), vec!["intern", "admin"]);
        assert!(e.implicit_roles_for("g2", "dave", None).is_empty());
    }

    #[test]
    fn test_decision_serializes() {
        let e = enforcer();
        let json = serde_json::to_value(e.enforce(&["alice", "/admin/dashboard", "GET"]).unwrap())
            .unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "allowed": true,
                "rule_index": 0,
                "rule": ["admin", "/admin/dashboard", "GET", "allow"]
            })
        );
        let json = serde_json::to_value(e.enforce(&["bob", "/", "GET"]).unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({ "allowed": false }));
    }
}

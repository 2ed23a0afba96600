use std::fmt;

use indexmap::IndexMap;
use serde::Serialize;

use crate::authz::effect::Eft;
use crate::authz::errors::ConfigError;
use crate::authz::matcher::RoleLookup;
use crate::authz::model::Model;
use crate::authz::roles::{RoleFact, RoleGraph, RoleOptions};

/// One policy record: a value per attribute of the policy shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct PolicyRule(Vec<String>);

impl PolicyRule {
    pub fn values(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for PolicyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(", "))
    }
}

/// Policy rules and role-assignment facts for one model.
///
/// A plain value: concurrent readers share it behind an `Arc`, and writers
/// mutate a clone (see `Enforcer`).
#[derive(Debug, Clone)]
pub struct PolicyStore {
    options: RoleOptions,
    policy_key: String,
    policy_arity: usize,
    effect_column: Option<usize>,
    /// Rules keyed by their full tuple, in insertion order.
    rules: IndexMap<PolicyRule, Eft>,
    /// Role definition names, parallel to `roles`.
    role_names: Vec<String>,
    roles: Vec<RoleGraph>,
}

impl PolicyStore {
    /// An empty store shaped by `model`.
    pub fn new(model: &Model, options: RoleOptions) -> Self {
        Self {
            options,
            policy_key: model.policy().key.clone(),
            policy_arity: model.policy().len(),
            effect_column: model.effect_column(),
            rules: IndexMap::new(),
            role_names: model.roles().iter().map(|r| r.name.clone()).collect(),
            roles: model
                .roles()
                .iter()
                .map(|r| RoleGraph::new(r.domain, options))
                .collect(),
        }
    }

    /// Parse line-oriented policy text such as
    ///
    /// ```text
    /// p, admin, /admin/dashboard, GET, allow
    /// g, alice, admin
    /// ```
    pub fn load(text: &str, model: &Model) -> Result<Self, ConfigError> {
        Self::load_with(text, model, RoleOptions::default())
    }

    pub fn load_with(text: &str, model: &Model, options: RoleOptions) -> Result<Self, ConfigError> {
        let mut store = Self::new(model, options);
        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = split_record(line);
            let tag = fields.remove(0);
            let values: Vec<&str> = fields.iter().map(String::as_str).collect();
            store
                .insert_record(&tag, &values)
                .map_err(|e| e.on_line(n + 1))?;
        }
        Ok(store)
    }

    fn insert_record(&mut self, tag: &str, values: &[&str]) -> Result<bool, ConfigError> {
        if tag == self.policy_key {
            self.add_policy(values)
        } else {
            self.add_role_fact(tag, values)
        }
    }

    /// Role options every graph in this store was built with.
    pub fn options(&self) -> RoleOptions {
        self.options
    }

    /// Rules in insertion order.
    pub fn policy_rules(&self) -> impl Iterator<Item = &PolicyRule> {
        self.rules.keys()
    }

    /// Rules with their effect, in insertion order.
    pub(crate) fn rules_with_effect(&self) -> impl Iterator<Item = (&PolicyRule, Eft)> {
        self.rules.iter().map(|(rule, eft)| (rule, *eft))
    }

    pub fn rule(&self, index: usize) -> Option<&PolicyRule> {
        self.rules.get_index(index).map(|(rule, _)| rule)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Facts of one role relation; empty for an unknown relation.
    pub fn role_facts(&self, relation: &str) -> Vec<&RoleFact> {
        self.role_graph(relation)
            .map(|g| g.facts().collect())
            .unwrap_or_default()
    }

    pub fn role_graph(&self, relation: &str) -> Option<&RoleGraph> {
        self.role_names
            .iter()
            .position(|n| n == relation)
            .map(|i| &self.roles[i])
    }

    pub fn role_fact_count(&self) -> usize {
        self.roles.iter().map(RoleGraph::len).sum()
    }

    /// Returns `false` if an identical rule is already stored.
    pub fn add_policy(&mut self, values: &[&str]) -> Result<bool, ConfigError> {
        let (rule, eft) = self.policy_record(values)?;
        if self.rules.contains_key(&rule) {
            return Ok(false);
        }
        self.rules.insert(rule, eft);
        Ok(true)
    }

    /// Returns `false` if no such rule was stored.
    pub fn remove_policy(&mut self, values: &[&str]) -> Result<bool, ConfigError> {
        let (rule, _) = self.policy_record(values)?;
        Ok(self.rules.shift_remove(&rule).is_some())
    }

    /// Remove every rule whose fields, starting at `field_index`, equal
    /// `values`. An empty value matches any field. Returns how many rules
    /// were removed.
    pub fn remove_filtered_policy(
        &mut self,
        field_index: usize,
        values: &[&str],
    ) -> Result<usize, ConfigError> {
        if values.is_empty() || field_index + values.len() > self.policy_arity {
            return Err(ConfigError::ArityMismatch {
                line: None,
                relation: self.policy_key.clone(),
                expected: self.policy_arity,
                found: field_index + values.len(),
            });
        }
        let before = self.rules.len();
        self.rules.retain(|rule, _| {
            !values
                .iter()
                .zip(&rule.values()[field_index..])
                .all(|(want, have)| want.is_empty() || *want == have.as_str())
        });
        Ok(before - self.rules.len())
    }

    /// Returns `false` if the fact is already stored.
    pub fn add_role_fact(&mut self, relation: &str, values: &[&str]) -> Result<bool, ConfigError> {
        let (graph, fact) = self.role_record(relation, values)?;
        Ok(graph.add(fact))
    }

    /// Returns `false` if no such fact was stored.
    pub fn remove_role_fact(
        &mut self,
        relation: &str,
        values: &[&str],
    ) -> Result<bool, ConfigError> {
        let (graph, fact) = self.role_record(relation, values)?;
        Ok(graph.remove(&fact))
    }

    fn policy_record(&self, values: &[&str]) -> Result<(PolicyRule, Eft), ConfigError> {
        if values.len() != self.policy_arity {
            return Err(ConfigError::ArityMismatch {
                line: None,
                relation: self.policy_key.clone(),
                expected: self.policy_arity,
                found: values.len(),
            });
        }
        let eft = match self.effect_column {
            Some(col) => values[col]
                .parse::<Eft>()
                .map_err(|_| ConfigError::InvalidEffect {
                    line: None,
                    value: values[col].to_string(),
                })?,
            None => Eft::Allow,
        };
        let rule = PolicyRule(values.iter().map(|v| v.to_string()).collect());
        Ok((rule, eft))
    }

    fn role_record(
        &mut self,
        relation: &str,
        values: &[&str],
    ) -> Result<(&mut RoleGraph, RoleFact), ConfigError> {
        let idx = self
            .role_names
            .iter()
            .position(|n| n == relation)
            .ok_or_else(|| ConfigError::UnknownRelation {
                line: None,
                relation: relation.to_string(),
            })?;
        let graph = &mut self.roles[idx];
        let expected = if graph.is_domain_scoped() { 3 } else { 2 };
        if values.len() != expected {
            return Err(ConfigError::ArityMismatch {
                line: None,
                relation: relation.to_string(),
                expected,
                found: values.len(),
            });
        }
        let values: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        Ok((graph, RoleFact::from_values(&values)))
    }
}

impl RoleLookup for PolicyStore {
    fn has_role(&self, relation: usize, member: &str, role: &str, domain: Option<&str>) -> bool {
        self.roles
            .get(relation)
            .is_some_and(|g| g.has_role(member, role, domain))
    }
}

/// Split a record on commas, trimming each field. Double quotes group a
/// field that contains commas.
fn split_record(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in line.chars() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                fields.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    fields.push(current.trim().to_string());
    fields
}

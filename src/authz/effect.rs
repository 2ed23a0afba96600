//! Policy effect strategies: how the effects of matching rules combine into
//! one decision. Every strategy denies when nothing matches.

use std::fmt;
use std::str::FromStr;

use crate::authz::errors::ConfigError;

const ALLOW_OVERRIDE: &str = "some(where(p.eft==allow))";
const ALLOW_AND_DENY: &str = "some(where(p.eft==allow))&&!some(where(p.eft==deny))";
const FIRST_MATCH: &str = "priority(p.eft)||deny";
const DENY_OVERRIDE: &str = "!some(where(p.eft==deny))";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Permit if any matching rule allows.
    AllowOverride,
    /// Permit if some matching rule allows and none denies.
    AllowAndDeny,
    /// The first matching rule, in insertion order, decides.
    FirstMatch,
}

impl Effect {
    /// Resolve a `[policy_effect]` expression. Whitespace is insignificant.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let normalized: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        match normalized.as_str() {
            ALLOW_OVERRIDE => Ok(Effect::AllowOverride),
            ALLOW_AND_DENY => Ok(Effect::AllowAndDeny),
            FIRST_MATCH => Ok(Effect::FirstMatch),
            DENY_OVERRIDE => Err(ConfigError::UnsupportedEffect(format!(
                "{} (allows when nothing matches)",
                text.trim()
            ))),
            _ => Err(ConfigError::UnsupportedEffect(text.trim().to_string())),
        }
    }

    pub fn merger(self) -> EffectMerger {
        EffectMerger {
            effect: self,
            first_allow: None,
            first_deny: None,
        }
    }
}

/// The effect column of a single policy rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eft {
    Allow,
    Deny,
}

impl FromStr for Eft {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Eft::Allow),
            "deny" => Ok(Eft::Deny),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Eft {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Eft::Allow => f.write_str("allow"),
            Eft::Deny => f.write_str("deny"),
        }
    }
}

/// Accumulates matching rules for one query.
#[derive(Debug)]
pub struct EffectMerger {
    effect: Effect,
    first_allow: Option<usize>,
    first_deny: Option<usize>,
}

impl EffectMerger {
    /// Record a matching rule. Returns `true` once the outcome can no longer
    /// change, so the caller may stop iterating.
    pub fn push(&mut self, rule: usize, eft: Eft) -> bool {
        match eft {
            Eft::Allow => {
                self.first_allow.get_or_insert(rule);
            }
            Eft::Deny => {
                self.first_deny.get_or_insert(rule);
            }
        }
        match self.effect {
            Effect::AllowOverride => self.first_allow.is_some(),
            Effect::AllowAndDeny => self.first_deny.is_some(),
            Effect::FirstMatch => true,
        }
    }

    /// Final outcome and the rule that determined it, if any.
    pub fn finish(self) -> (bool, Option<usize>) {
        match self.effect {
            Effect::AllowOverride => (self.first_allow.is_some(), self.first_allow),
            Effect::AllowAndDeny => match (self.first_allow, self.first_deny) {
                (_, Some(deny)) => (false, Some(deny)),
                (Some(allow), None) => (true, Some(allow)),
                (None, None) => (false, None),
            },
            Effect::FirstMatch => match (self.first_allow, self.first_deny) {
                (Some(a), Some(d)) if a < d => (true, Some(a)),
                (_, Some(d)) => (false, Some(d)),
                (Some(a), None) => (true, Some(a)),
                (None, None) => (false, None),
            },
        }
    }
}

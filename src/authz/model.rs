//! Parser for the sectioned model text.
//!
//! ```text
//! [request_definition]
//! r = sub, obj, act
//!
//! [policy_definition]
//! p = sub, obj, act, eft
//!
//! [role_definition]
//! g = _, _
//!
//! [policy_effect]
//! e = some(where (p.eft == allow)) && !some(where (p.eft == deny))
//!
//! [matchers]
//! m = g(r.sub, p.sub) && r.obj == p.obj && r.act == p.act
//! ```

use std::collections::HashSet;

use crate::authz::effect::Effect;
use crate::authz::errors::ConfigError;
use crate::authz::matcher::{Bindings, Matcher};

const REQUEST_SECTION: &str = "request_definition";
const POLICY_SECTION: &str = "policy_definition";
const ROLE_SECTION: &str = "role_definition";
const EFFECT_SECTION: &str = "policy_effect";
const MATCHER_SECTION: &str = "matchers";
const EFFECT_KEY: &str = "e";
const MATCHER_KEY: &str = "m";

/// Name of the policy column holding `allow`/`deny`.
pub const EFFECT_COLUMN: &str = "eft";

/// An ordered list of attribute names under a key such as `r` or `p`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape {
    pub key: String,
    pub attributes: Vec<String>,
}

impl Shape {
    pub fn new(key: &str, attributes: &[&str]) -> Self {
        Self {
            key: key.to_string(),
            attributes: attributes.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn parse(key: &str, value: &str) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        let mut attributes = Vec::new();
        for attr in value.split(',').map(str::trim) {
            if attr.is_empty() {
                return Err(ConfigError::EmptyAttribute {
                    shape: key.to_string(),
                });
            }
            if !seen.insert(attr) {
                return Err(ConfigError::DuplicateAttribute {
                    shape: key.to_string(),
                    attribute: attr.to_string(),
                });
            }
            attributes.push(attr.to_string());
        }
        Ok(Self {
            key: key.to_string(),
            attributes,
        })
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.attributes.iter().position(|a| a == name)
    }
}

/// A role-inheritance relation such as `g = _, _` or, domain scoped,
/// `g2 = _, _, _`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleDefinition {
    pub name: String,
    pub domain: bool,
}

impl RoleDefinition {
    pub fn new(name: &str, domain: bool) -> Self {
        Self {
            name: name.to_string(),
            domain,
        }
    }

    fn parse(name: &str, value: &str) -> Result<Self, ConfigError> {
        let parts: Vec<&str> = value.split(',').map(str::trim).collect();
        if parts.iter().any(|p| *p != "_") || !(2..=3).contains(&parts.len()) {
            return Err(ConfigError::InvalidModel(format!(
                "role definition `{name} = {value}` must be `_, _` or `_, _, _`"
            )));
        }
        Ok(Self::new(name, parts.len() == 3))
    }

    /// Number of values in a fact (and arguments in a matcher call).
    pub fn arity(&self) -> usize {
        if self.domain {
            3
        } else {
            2
        }
    }
}

/// A parsed model. Immutable; the matcher is compiled during parsing.
#[derive(Debug, Clone)]
pub struct Model {
    request: Shape,
    policy: Shape,
    roles: Vec<RoleDefinition>,
    effect: Effect,
    matcher: Matcher,
}

#[derive(Default)]
struct Sections {
    request: Option<(String, String)>,
    policy: Option<(String, String)>,
    roles: Vec<(String, String)>,
    effect: Option<String>,
    matcher: Option<String>,
}

impl Model {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let sections = split_sections(text)?;

        let (key, value) = sections.request.ok_or_else(|| missing(REQUEST_SECTION))?;
        let request = Shape::parse(&key, &value)?;
        let (key, value) = sections.policy.ok_or_else(|| missing(POLICY_SECTION))?;
        let policy = Shape::parse(&key, &value)?;
        if request.key == policy.key {
            return Err(ConfigError::InvalidModel(format!(
                "request and policy definitions share the key `{}`",
                request.key
            )));
        }

        let mut roles: Vec<RoleDefinition> = Vec::new();
        for (name, value) in &sections.roles {
            if roles.iter().any(|r| &r.name == name) || *name == policy.key {
                return Err(ConfigError::InvalidModel(format!(
                    "role definition `{name}` clashes with another definition"
                )));
            }
            roles.push(RoleDefinition::parse(name, value)?);
        }

        let effect = Effect::parse(&sections.effect.ok_or_else(|| missing(EFFECT_SECTION))?)?;
        if effect != Effect::AllowOverride && policy.index_of(EFFECT_COLUMN).is_none() {
            return Err(ConfigError::InvalidModel(format!(
                "policy effect references p.{EFFECT_COLUMN} but `{}` has no `{EFFECT_COLUMN}` column",
                policy.key
            )));
        }

        let matcher_text = sections.matcher.ok_or_else(|| missing(MATCHER_SECTION))?;
        let matcher = Matcher::compile(
            &matcher_text,
            &Bindings {
                request: &request,
                policy: &policy,
                roles: &roles,
            },
        )?;

        Ok(Self {
            request,
            policy,
            roles,
            effect,
            matcher,
        })
    }

    pub fn request(&self) -> &Shape {
        &self.request
    }

    pub fn policy(&self) -> &Shape {
        &self.policy
    }

    pub fn roles(&self) -> &[RoleDefinition] {
        &self.roles
    }

    pub fn role_index(&self, name: &str) -> Option<usize> {
        self.roles.iter().position(|r| r.name == name)
    }

    pub fn effect(&self) -> Effect {
        self.effect
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    /// Position of the `eft` column, if the policy shape has one.
    pub fn effect_column(&self) -> Option<usize> {
        self.policy.index_of(EFFECT_COLUMN)
    }
}

fn expect_key(key: &str, expected: &str, section: &str) -> Result<(), ConfigError> {
    if key == expected {
        Ok(())
    } else {
        Err(ConfigError::InvalidModel(format!(
            "unknown key `{key}` in [{section}], expected `{expected}`"
        )))
    }
}

fn missing(section: &str) -> ConfigError {
    ConfigError::MissingSection {
        section: section.to_string(),
    }
}

/// Split model text into `key = value` entries per section, joining lines
/// that end in `\`.
fn split_sections(text: &str) -> Result<Sections, ConfigError> {
    let mut sections = Sections::default();
    let mut current: Option<String> = None;
    let mut pending = String::new();

    for raw in text.lines() {
        let line = raw.trim();
        if pending.is_empty() && (line.is_empty() || line.starts_with('#')) {
            continue;
        }
        if let Some(continued) = line.strip_suffix('\\') {
            pending.push_str(continued);
            pending.push(' ');
            continue;
        }
        let line = if pending.is_empty() {
            line.to_string()
        } else {
            let joined = std::mem::take(&mut pending) + line;
            joined.trim().to_string()
        };

        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = name.trim();
            if ![
                REQUEST_SECTION,
                POLICY_SECTION,
                ROLE_SECTION,
                EFFECT_SECTION,
                MATCHER_SECTION,
            ]
            .contains(&name)
            {
                return Err(ConfigError::InvalidModel(format!("unknown section `[{name}]`")));
            }
            current = Some(name.to_string());
            continue;
        }

        let Some(section) = current.as_deref() else {
            return Err(ConfigError::InvalidModel(format!(
                "`{line}` appears before any section header"
            )));
        };
        let (key, value) = line.split_once('=').ok_or_else(|| {
            ConfigError::InvalidModel(format!("expected `key = value` in [{section}], got `{line}`"))
        })?;
        let key = key.trim().to_string();
        let value = value.trim().to_string();
        if key.is_empty() {
            return Err(ConfigError::InvalidModel(format!(
                "empty key in [{section}]"
            )));
        }

        let slot = match section {
            REQUEST_SECTION => {
                set_once(&mut sections.request, (key, value), section)?;
                continue;
            }
            POLICY_SECTION => {
                set_once(&mut sections.policy, (key, value), section)?;
                continue;
            }
            ROLE_SECTION => {
                sections.roles.push((key, value));
                continue;
            }
            EFFECT_SECTION => {
                expect_key(&key, EFFECT_KEY, section)?;
                &mut sections.effect
            }
            _ => {
                expect_key(&key, MATCHER_KEY, section)?;
                &mut sections.matcher
            }
        };
        set_once(slot, value, section)?;
    }

    if !pending.is_empty() {
        return Err(ConfigError::InvalidModel(
            "model text ends with a line continuation".into(),
        ));
    }
    Ok(sections)
}

fn set_once<T>(slot: &mut Option<T>, value: T, section: &str) -> Result<(), ConfigError> {
    if slot.is_some() {
        return Err(ConfigError::InvalidModel(format!(
            "[{section}] may only hold one definition"
        )));
    }
    *slot = Some(value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RBAC_MODEL: &str = r#"
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

    fn without(section: &str) -> String {
        let mut out = String::new();
        let mut skip = false;
        for line in RBAC_MODEL.lines() {
            if line.starts_with('[') {
                skip = line == format!("[{section}]");
            }
            if !skip {
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }

    #[test]
    fn test_parse_rbac_model() {
        let model = Model::parse(RBAC_MODEL).unwrap();
        assert_eq!(model.request().key, "r");
        assert_eq!(model.request().attributes, vec!["sub", "obj", "act"]);
        assert_eq!(model.policy().attributes, vec!["sub", "obj", "act", "eft"]);
        assert_eq!(model.roles(), &[RoleDefinition::new("g", false)]);
        assert_eq!(model.effect(), Effect::AllowAndDeny);
        assert_eq!(model.effect_column(), Some(3));
        assert_eq!(
            model.matcher().source(),
            "g(r.sub, p.sub) && r.obj == p.obj && r.act == p.act"
        );
    }

    #[test]
    fn test_missing_sections_are_named() {
        for section in [REQUEST_SECTION, POLICY_SECTION, EFFECT_SECTION, MATCHER_SECTION] {
            let err = Model::parse(&without(section)).unwrap_err();
            assert!(
                matches!(&err, ConfigError::MissingSection { section: s } if s == section),
                "unexpected error for {section}: {err:?}"
            );
        }
    }

    #[test]
    fn test_role_definition_is_optional() {
        let text = without(ROLE_SECTION).replace("g(r.sub, p.sub)", "r.sub == p.sub");
        let model = Model::parse(&text).unwrap();
        assert!(model.roles().is_empty());
    }

    #[test]
    fn test_matcher_without_role_definition_fails() {
        let err = Model::parse(&without(ROLE_SECTION)).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownFunction(name) if name == "g"));
    }

    #[test]
    fn test_rejects_empty_and_duplicate_attributes() {
        let text = RBAC_MODEL.replace("r = sub, obj, act", "r = sub, , act");
        assert!(matches!(
            Model::parse(&text).unwrap_err(),
            ConfigError::EmptyAttribute { shape } if shape == "r"
        ));

        let text = RBAC_MODEL.replace("r = sub, obj, act", "r = sub, obj, sub");
        assert!(matches!(
            Model::parse(&text).unwrap_err(),
            ConfigError::DuplicateAttribute { attribute, .. } if attribute == "sub"
        ));
    }

    #[test]
    fn test_dangling_matcher_reference_fails_at_parse() {
        let text = RBAC_MODEL.replace("r.act == p.act", "r.act == p.verb");
        assert!(matches!(
            Model::parse(&text).unwrap_err(),
            ConfigError::UnknownAttribute(name) if name == "p.verb"
        ));
    }

    #[test]
    fn test_matcher_syntax_error_fails_at_parse() {
        let text = RBAC_MODEL.replace("r.act == p.act", "r.act == (p.act");
        assert!(matches!(
            Model::parse(&text).unwrap_err(),
            ConfigError::InvalidExpression(_)
        ));
    }

    #[test]
    fn test_domain_role_definition() {
        let text = RBAC_MODEL
            .replace("r = sub, obj, act", "r = sub, dom, obj, act")
            .replace("p = sub, obj, act, eft", "p = sub, dom, obj, act, eft")
            .replace("g = _, _", "g = _, _, _")
            .replace("g(r.sub, p.sub)", "g(r.sub, p.sub, r.dom) && r.dom == p.dom");
        let model = Model::parse(&text).unwrap();
        assert!(model.roles()[0].domain);
        assert_eq!(model.roles()[0].arity(), 3);
    }

    #[test]
    fn test_invalid_role_definition() {
        let text = RBAC_MODEL.replace("g = _, _", "g = _");
        assert!(matches!(
            Model::parse(&text).unwrap_err(),
            ConfigError::InvalidModel(_)
        ));
    }

    #[test]
    fn test_comments_and_line_continuation() {
        let text = RBAC_MODEL.replace(
            "m = g(r.sub, p.sub) && r.obj == p.obj && r.act == p.act",
            "# routes\nm = g(r.sub, p.sub) && \\\n    r.obj == p.obj && r.act == p.act",
        );
        let model = Model::parse(&text).unwrap();
        assert!(model.matcher().source().contains("r.obj == p.obj"));
    }

    #[test]
    fn test_unknown_effect_and_matcher_keys() {
        let text = RBAC_MODEL.replace("\ne = ", "\nfoo = ");
        match Model::parse(&text) {
            Err(ConfigError::InvalidModel(msg)) => assert!(msg.contains("`foo`")),
            other => panic!("unexpected result: {other:?}"),
        }
        let text = RBAC_MODEL.replace("\nm = ", "\nmatch = ");
        assert!(matches!(
            Model::parse(&text),
            Err(ConfigError::InvalidModel(_))
        ));
    }

    #[test]
    fn test_unknown_section() {
        let text = format!("{RBAC_MODEL}\n[extras]\nx = 1\n");
        assert!(matches!(
            Model::parse(&text).unwrap_err(),
            ConfigError::InvalidModel(_)
        ));
    }

    #[test]
    fn test_effect_needs_eft_column() {
        let text = RBAC_MODEL.replace("p = sub, obj, act, eft", "p = sub, obj, act");
        assert!(matches!(
            Model::parse(&text).unwrap_err(),
            ConfigError::InvalidModel(_)
        ));

        let text = text.replace(
            "e = some(where (p.eft == allow)) && !some(where (p.eft == deny))",
            "e = some(where (p.eft == allow))",
        );
        let model = Model::parse(&text).unwrap();
        assert_eq!(model.effect_column(), None);
    }
}

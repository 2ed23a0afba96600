/// `sub, obj, act` with one role relation and deny overriding allow.
pub const RBAC_MODEL: &str = r#"
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

/// Roles granted per tenant.
pub const DOMAIN_MODEL: &str = r#"
[request_definition]
r = sub, dom, obj, act

[policy_definition]
p = sub, dom, obj, act

[role_definition]
g = _, _, _

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = g(r.sub, p.sub, r.dom) && r.dom == p.dom && r.obj == p.obj && r.act == p.act
"#;

/// Subject roles in `g`, object groups in `g2`.
pub const RESOURCE_ROLE_MODEL: &str = r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act

[role_definition]
g = _, _
g2 = _, _

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = g(r.sub, p.sub) && g2(r.obj, p.obj) && r.act == p.act
"#;

/// Builds a `sub, obj, act[, eft]` model around a custom effect and matcher.
pub struct ModelBuilder {
    effect: String,
    matcher: String,
    with_eft: bool,
    roles: bool,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self {
            effect: "some(where (p.eft == allow)) && !some(where (p.eft == deny))".to_string(),
            matcher: "r.sub == p.sub && r.obj == p.obj && r.act == p.act".to_string(),
            with_eft: true,
            roles: false,
        }
    }

    pub fn with_effect(mut self, effect: &str) -> Self {
        self.effect = effect.to_string();
        self
    }

    pub fn with_matcher(mut self, matcher: &str) -> Self {
        self.matcher = matcher.to_string();
        self
    }

    pub fn without_eft(mut self) -> Self {
        self.with_eft = false;
        self
    }

    pub fn with_roles(mut self) -> Self {
        self.roles = true;
        self
    }

    pub fn build(self) -> String {
        let policy = if self.with_eft {
            "sub, obj, act, eft"
        } else {
            "sub, obj, act"
        };
        let roles = if self.roles {
            "[role_definition]\ng = _, _\n\n"
        } else {
            ""
        };
        format!(
            "[request_definition]\nr = sub, obj, act\n\n\
             [policy_definition]\np = {policy}\n\n\
             {roles}\
             [policy_effect]\ne = {}\n\n\
             [matchers]\nm = {}\n",
            self.effect, self.matcher
        )
    }
}

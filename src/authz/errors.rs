use miette::Diagnostic;
use thiserror::Error;

/// Malformed model or policy text. Fatal at load: an enforcer is never built
/// (or a reload never applied) from input that produced one of these.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("Failed to read `{path}`")]
    #[diagnostic(
        code(pathguard::config::read),
        help("Check that the file exists and is readable")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Model is missing the `[{section}]` section")]
    #[diagnostic(
        code(pathguard::model::missing_section),
        help("A model needs [request_definition], [policy_definition], [policy_effect] and [matchers]")
    )]
    MissingSection { section: String },

    #[error("Invalid model: {0}")]
    #[diagnostic(code(pathguard::model::invalid))]
    InvalidModel(String),

    #[error("Empty attribute name in `{shape}`")]
    #[diagnostic(
        code(pathguard::model::empty_attribute),
        help("Attribute lists look like: r = sub, obj, act")
    )]
    EmptyAttribute { shape: String },

    #[error("Duplicate attribute `{attribute}` in `{shape}`")]
    #[diagnostic(code(pathguard::model::duplicate_attribute))]
    DuplicateAttribute { shape: String, attribute: String },

    #[error("Unsupported policy effect `{0}`")]
    #[diagnostic(
        code(pathguard::model::effect),
        help("Supported: `some(where (p.eft == allow))`, `some(where (p.eft == allow)) && !some(where (p.eft == deny))`, `priority(p.eft) || deny`")
    )]
    UnsupportedEffect(String),

    #[error("Invalid matcher expression: {0}")]
    #[diagnostic(
        code(pathguard::matcher::invalid),
        help("Supported operators: ==, !=, >, <, >=, <=, &&, ||, !, in. Attributes use dot notation (e.g. r.sub, p.obj)")
    )]
    InvalidExpression(String),

    #[error("Unknown attribute `{0}` in matcher")]
    #[diagnostic(
        code(pathguard::matcher::unknown_attribute),
        help("Every attribute must be declared in [request_definition] or [policy_definition]")
    )]
    UnknownAttribute(String),

    #[error("Unknown function `{0}` in matcher")]
    #[diagnostic(
        code(pathguard::matcher::unknown_function),
        help("Call a role definition (e.g. g) or one of keyMatch, keyMatch2")
    )]
    UnknownFunction(String),

    #[error("{}unknown relation `{relation}`", at_line(.line))]
    #[diagnostic(
        code(pathguard::policy::unknown_relation),
        help("The first field must name the policy definition (e.g. p) or a role definition (e.g. g)")
    )]
    UnknownRelation {
        line: Option<usize>,
        relation: String,
    },

    #[error("{}`{relation}` expects {expected} values, found {found}", at_line(.line))]
    #[diagnostic(code(pathguard::policy::arity))]
    ArityMismatch {
        line: Option<usize>,
        relation: String,
        expected: usize,
        found: usize,
    },

    #[error("{}invalid effect `{value}`", at_line(.line))]
    #[diagnostic(
        code(pathguard::policy::effect),
        help("The eft column must be `allow` or `deny`")
    )]
    InvalidEffect { line: Option<usize>, value: String },
}

impl ConfigError {
    /// Attach the 1-based policy text line to a record-level error.
    pub(crate) fn on_line(self, n: usize) -> Self {
        match self {
            ConfigError::UnknownRelation { relation, .. } => ConfigError::UnknownRelation {
                line: Some(n),
                relation,
            },
            ConfigError::ArityMismatch {
                relation,
                expected,
                found,
                ..
            } => ConfigError::ArityMismatch {
                line: Some(n),
                relation,
                expected,
                found,
            },
            ConfigError::InvalidEffect { value, .. } => ConfigError::InvalidEffect {
                line: Some(n),
                value,
            },
            other => other,
        }
    }
}

fn at_line(line: &Option<usize>) -> String {
    match line {
        Some(n) => format!("line {n}: "),
        None => String::new(),
    }
}

/// A query the engine could not answer. Distinct from a deny: the caller
/// must surface it as a server error, not as an authorization failure.
#[derive(Debug, Error, Diagnostic, PartialEq)]
pub enum QueryFault {
    #[error("Request has {found} values, the model expects {expected}")]
    #[diagnostic(
        code(pathguard::query::arity),
        help("Pass one value per attribute of [request_definition], in order")
    )]
    ArityMismatch { expected: usize, found: usize },

    #[error("Matcher evaluation failed: {0}")]
    #[diagnostic(code(pathguard::query::evaluation))]
    Evaluation(String),
}

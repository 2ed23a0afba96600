//! Model-driven authorization: a model file declares the request and policy
//! shapes, role relations, an effect strategy and a matcher expression; a
//! policy file supplies the rules and role facts the matcher runs against.

pub mod effect;
pub mod engine;
pub mod errors;
pub mod loader;
pub mod matcher;
pub mod model;
pub mod roles;
pub mod store;

pub use effect::{Effect, Eft};
pub use engine::{enforce, Decision, Enforcer};
pub use errors::{ConfigError, QueryFault};
pub use model::Model;
pub use roles::{RoleFact, RoleGraph, RoleOptions};
pub use store::{PolicyRule, PolicyStore};

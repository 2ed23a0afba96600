//! Pathguard - model-driven request authorization
//!
//! Decides whether a (subject, object, action) style request is permitted by
//! a declarative model and a policy of rules and role facts.

pub mod authz;
pub mod settings;

pub mod models;

pub use models::{ModelBuilder, DOMAIN_MODEL, RBAC_MODEL, RESOURCE_ROLE_MODEL};

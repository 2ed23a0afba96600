use std::path::Path;

use crate::authz::engine::Enforcer;
use crate::authz::errors::ConfigError;
use crate::authz::model::Model;
use crate::authz::roles::RoleOptions;
use crate::authz::store::PolicyStore;

/// Read a model file and a policy file and build an enforcer from them.
pub fn load_enforcer(
    model_path: &Path,
    policy_path: &Path,
    options: RoleOptions,
) -> Result<Enforcer, ConfigError> {
    let model = load_model(model_path)?;
    let policy_text = read_source(policy_path)?;
    let store = PolicyStore::load_with(&policy_text, &model, options)?;

    tracing::info!(
        model = %model_path.display(),
        policy = %policy_path.display(),
        rules = store.len(),
        role_facts = store.role_fact_count(),
        role_definitions = model.roles().len(),
        effect = ?model.effect(),
        "Loaded authorization model and policy"
    );

    Ok(Enforcer::new(model, store))
}

pub fn load_model(path: &Path) -> Result<Model, ConfigError> {
    Model::parse(&read_source(path)?)
}

/// Re-read the policy file into a running enforcer. The model is not
/// re-read; on error the enforcer keeps its current policy.
pub fn reload_policy(enforcer: &Enforcer, policy_path: &Path) -> Result<(), ConfigError> {
    enforcer.reload(&read_source(policy_path)?)
}

fn read_source(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })
}

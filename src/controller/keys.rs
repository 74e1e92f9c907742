use crate::crds::{
    defs::{GROUP, KIND},
    Function,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use thiserror::Error as ThisError;

#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
#[error("Invalid key {0:?}, expected `namespace/name`")]
pub struct InvalidKey(pub String);

/// Splits a `namespace/name` key. Both parts must be present and non-empty.
pub fn split_key(key: &str) -> Result<(&str, &str), InvalidKey> {
    match key.split_once('/') {
        Some((namespace, name))
            if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
        {
            Ok((namespace, name))
        }
        _ => Err(InvalidKey(key.to_string())),
    }
}

pub fn key_for(function: &Function) -> Option<String> {
    let namespace = function.namespace()?;
    Some(format!("{}/{}", namespace, function.name_any()))
}

/// Controller owner reference for objects managed on behalf of the Function.
/// `None` if the Function has not been persisted yet (no uid).
pub fn owner_reference(function: &Function) -> Option<OwnerReference> {
    let mut owner = function.controller_owner_ref(&())?;
    owner.block_owner_deletion = Some(true);
    Some(owner)
}

/// Whether the reference points at a Function, whatever its version.
pub fn is_function_owner(owner: &OwnerReference) -> bool {
    let group = owner.api_version.split('/').next().unwrap_or_default();

    owner.kind == KIND && group == GROUP
}

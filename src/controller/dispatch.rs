//! Dynamic patch dispatcher
//!
//! Resolves a patch request's group/version/kind against API discovery and
//! submits the merge patch through a dynamically typed client. Kinds the
//! discovery does not list yet (a warm-up race right after CRD install) come
//! back as `ResourceNotFound`, which callers treat as retryable.

use kube::api::{Api, Patch, PatchParams};
use kube::core::DynamicObject;
use kube::{Client, Discovery};
use thiserror::Error;
use tracing::debug;

use super::strategy::executor::PatchRequest;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("could not find resource for kind {kind:?} in {group}/{version}")]
    ResourceNotFound {
        group: String,
        version: String,
        kind: String,
    },

    #[error("invalid patch body: {0}")]
    InvalidPatch(#[from] serde_json::Error),
}

/// Apply one patch request in the given namespace
pub async fn apply(
    client: &Client,
    namespace: &str,
    request: &PatchRequest,
) -> Result<(), DispatchError> {
    let discovery = Discovery::new(client.clone())
        .filter(&[&request.gvk.group])
        .run()
        .await?;

    let (resource, _capabilities) =
        discovery
            .resolve_gvk(&request.gvk)
            .ok_or_else(|| DispatchError::ResourceNotFound {
                group: request.gvk.group.clone(),
                version: request.gvk.version.clone(),
                kind: request.gvk.kind.clone(),
            })?;

    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, &resource);
    let body: serde_json::Value = serde_json::from_slice(&request.bytes)?;
    let params = PatchParams::default();

    debug!(
        name = %request.name,
        kind = %request.gvk.kind,
        status = request.status_subresource,
        "Dispatching merge patch"
    );

    if request.status_subresource {
        api.patch_status(&request.name, &params, &Patch::Merge(&body))
            .await?;
    } else {
        api.patch(&request.name, &params, &Patch::Merge(&body))
            .await?;
    }

    Ok(())
}

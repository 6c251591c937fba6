//! Removal of agent-owned CRDs
//!
//! CRDs are cluster scoped and may be shared with unrelated components, so
//! only definitions whose `spec.group` equals the requested API group are
//! touched.

use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::remote::RemoteClusterApi;
use crate::retry::cancellable;
use crate::{Error, Result};

/// Delete every CRD in `group`
///
/// Returns whether at least one CRD was removed. No matching CRDs (or no CRD
/// API at all) is `Ok(false)`. On a failed delete, returns
/// [`Error::CrdDeletion`] whose `any_removed` reflects the deletions that
/// succeeded before it; later CRDs are left in place.
pub async fn remove_crds_by_group(
    api: &dyn RemoteClusterApi,
    cluster: &str,
    group: &str,
    cancel: &CancellationToken,
) -> Result<bool> {
    let crds = match cancellable(cancel, "list_crds", api.list_crds()).await {
        Ok(crds) => crds,
        Err(e) if e.is_not_found() => {
            debug!(cluster = %cluster, group = %group, "No CRD API on cluster");
            return Ok(false);
        }
        Err(e) => return Err(e),
    };

    let mut any_removed = false;
    for crd in crds.iter().filter(|c| c.spec.group == group) {
        let name = crd.name_any();
        match cancellable(cancel, "delete_crd", api.delete_crd(&name)).await {
            Ok(()) => {
                info!(cluster = %cluster, crd = %name, "Deleted CRD");
                any_removed = true;
            }
            Err(e) if e.is_not_found() => {
                debug!(cluster = %cluster, crd = %name, "CRD already deleted");
            }
            Err(e) => {
                warn!(cluster = %cluster, crd = %name, error = %e, "Failed to delete CRD");
                return Err(Error::CrdDeletion {
                    cluster: cluster.to_string(),
                    crd: name,
                    any_removed,
                    source: Box::new(e),
                });
            }
        }
    }

    if !any_removed {
        debug!(cluster = %cluster, group = %group, "No CRDs matched group");
    }
    Ok(any_removed)
}

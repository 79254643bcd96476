//! Endpoint creation and deletion.

use std::sync::Arc;

use tether_common::{TetherError, TetherResult, validate_name};

use super::{Endpoint, EndpointOptions};
use crate::network::Network;
use crate::rollback::Rollback;

/// Create an endpoint on `network`.
pub(crate) async fn create(
    network: &Arc<Network>,
    name: &str,
    options: EndpointOptions,
) -> TetherResult<Arc<Endpoint>> {
    validate_name(name)?;

    if network.endpoint_by_name(name).await.is_ok() {
        return Err(TetherError::EndpointExists {
            name: name.to_string(),
        });
    }

    let controller = network.controller().clone();
    let network = controller.network_from_store(&network.id()).await?;
    let endpoint = Arc::new(Endpoint::new(network.clone(), name, options));

    let mut rollback = Rollback::new("create endpoint");

    rollback.step(endpoint.assign_address()).await?;
    {
        let endpoint = endpoint.clone();
        rollback.push("release address", move || async move {
            endpoint.release_address().await;
        });
    }

    rollback.step(network.add_endpoint(&endpoint)).await?;
    {
        let endpoint = endpoint.clone();
        rollback.push("driver endpoint", move || async move {
            if let Err(e) = endpoint.delete_from_driver().await {
                tracing::warn!(
                    endpoint = %endpoint.name(),
                    error = %e,
                    "Failed to remove endpoint from driver during rollback"
                );
            }
        });
    }

    rollback.step(controller.save_endpoint(&endpoint)).await?;
    {
        let endpoint = endpoint.clone();
        let controller = controller.clone();
        rollback.push("endpoint record", move || async move {
            if let Err(e) = controller.delete_endpoint_record(&endpoint).await {
                tracing::warn!(
                    endpoint = %endpoint.name(),
                    error = %e,
                    "Failed to remove endpoint record during rollback"
                );
            }
        });
    }

    rollback.step(network.inc_endpoint_count()).await?;
    rollback.commit();

    tracing::info!(
        endpoint = %name,
        id = %endpoint.id(),
        network = %network.name(),
        address = ?endpoint.address(),
        "Endpoint created"
    );
    Ok(endpoint)
}

impl Endpoint {
    /// Delete the endpoint.
    ///
    /// The record is removed and the network's endpoint count decremented
    /// before the driver is asked to tear the endpoint down. Addresses are
    /// released last.
    ///
    /// # Errors
    ///
    /// Returns `EndpointInUse` while joined to a sandbox, `Forbidden` if the
    /// driver refuses, or the store error of a failed write.
    pub async fn delete(self: &Arc<Self>) -> TetherResult<()> {
        let controller = self.network.controller().clone();
        let name = self.name();

        if let Some(sandbox) = controller.attached_sandbox(&self.id()) {
            return Err(TetherError::EndpointInUse {
                name,
                sandbox: sandbox.id().to_string(),
            });
        }

        let network = controller.network_from_store(&self.network_id()).await?;
        let endpoint = controller.endpoint_from_store(&network, &self.id()).await?;

        let mut rollback = Rollback::new("delete endpoint");

        rollback
            .step(controller.delete_endpoint_record(&endpoint))
            .await?;
        {
            let endpoint = endpoint.clone();
            let controller = controller.clone();
            rollback.push("endpoint record", move || async move {
                endpoint.mark_missing();
                if let Err(e) = controller.save_endpoint(&endpoint).await {
                    tracing::warn!(
                        endpoint = %endpoint.name(),
                        error = %e,
                        "Failed to restore endpoint record during rollback"
                    );
                }
            });
        }

        rollback.step(network.dec_endpoint_count()).await?;
        {
            let network = network.clone();
            rollback.push("endpoint count", move || async move {
                if let Err(e) = network.inc_endpoint_count().await {
                    tracing::warn!(
                        network = %network.name(),
                        error = %e,
                        "Failed to restore endpoint count during rollback"
                    );
                }
            });
        }

        rollback.step(endpoint.delete_from_driver()).await?;
        rollback.commit();

        endpoint.release_address().await;

        tracing::info!(endpoint = %name, network = %network.name(), "Endpoint deleted");
        Ok(())
    }
}

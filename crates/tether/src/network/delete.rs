//! Network deletion.

use std::sync::Arc;

use tether_common::{TetherError, TetherResult};

use super::Network;
use crate::rollback::Rollback;

impl Network {
    /// Tear the network down in its driver, tolerating anything but a refusal.
    async fn delete_from_driver(&self) -> TetherResult<()> {
        let driver = self.driver().await?;
        self.ensure_registered().await?;

        if let Err(e) = driver.delete_network(&self.id()).await {
            if e.is_forbidden() {
                return Err(e);
            }
            tracing::warn!(
                network = %self.name(),
                error = %e,
                "Driver error deleting network, proceeding anyway"
            );
        }
        Ok(())
    }

    /// Delete the network.
    ///
    /// The network is re-read first, so the endpoint check and the store
    /// delete act on the latest stored version. Its pools are released
    /// only once the record is gone.
    ///
    /// # Errors
    ///
    /// Returns `ActiveEndpoints` while endpoints remain, `Forbidden` if the
    /// driver refuses, and `OperationInProgress` if another controller
    /// modified the network in the meantime.
    pub async fn delete(&self) -> TetherResult<()> {
        let name = self.name();
        let id = self.id();
        let controller = self.controller.clone();

        let network: Arc<Self> = controller.network_from_store(&id).await.map_err(|e| {
            tracing::debug!(network = %name, error = %e, "Network vanished before delete");
            TetherError::NetworkNotFound {
                name: name.clone(),
                id: id.clone(),
            }
        })?;

        if network.endpoint_count() != 0 {
            return Err(TetherError::ActiveEndpoints {
                name: network.name(),
                id: network.id(),
            });
        }

        network.delete_from_driver().await?;

        let mut rollback = Rollback::new("delete network");
        {
            let network = network.clone();
            rollback.push("driver network", move || async move {
                if let Err(e) = network.controller.add_network(&network).await {
                    tracing::warn!(
                        network = %network.name(),
                        error = %e,
                        "Failed to restore network in driver after failed delete"
                    );
                }
            });
        }

        rollback
            .step(async {
                controller
                    .delete_network_record(&network)
                    .await
                    .map_err(|e| match e {
                        TetherError::KeyModified { .. } => TetherError::OperationInProgress {
                            name: network.name(),
                        },
                        other => other,
                    })
            })
            .await?;
        rollback.commit();
        controller.forget_latch(&id);

        network.ipam_release().await;
        controller.clear_svc_records(&id);

        tracing::info!(network = %name, id = %id, "Network deleted");
        Ok(())
    }
}

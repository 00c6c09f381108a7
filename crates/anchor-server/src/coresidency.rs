//! Co-residency queries over cached snapshots.

use anchor_core::db::{DatabaseError, unix_timestamp};
use anchor_core::model::ServerRef;
use serde::Serialize;
use tracing::debug;

use crate::store::CacheStore;

/// Outcome of checking one cataloged server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostCheck {
    /// More than one server shares the host.
    pub duplicate: bool,
    /// Every server on the host, the checked server included.
    pub host_servers: Vec<ServerRef>,
}

/// A server is alone when it is the only one on its host.
pub const fn is_alone(host_servers: &[ServerRef]) -> bool {
    host_servers.len() == 1
}

#[derive(Clone)]
pub struct CoResidency {
    store: CacheStore,
}

impl CoResidency {
    pub const fn new(store: CacheStore) -> Self {
        Self { store }
    }

    /// Servers whose `host_id` is `host_id`, across the account's fresh snapshots in `region`.
    pub async fn servers_sharing_host(
        &self,
        account_number: &str,
        region: &str,
        host_id: &str,
    ) -> Result<Vec<ServerRef>, DatabaseError> {
        self.store
            .servers_on_host(account_number, region, host_id, unix_timestamp())
            .await
    }

    /// Look up a cataloged server and everything sharing its host.
    ///
    /// Returns `None` when no fresh snapshot holds `server_id`. A server with no
    /// known host is reported as alone.
    pub async fn check_server(
        &self,
        account_number: &str,
        region: &str,
        server_id: &str,
    ) -> Result<Option<HostCheck>, DatabaseError> {
        let Some(server) = self
            .store
            .find_server(account_number, region, server_id, unix_timestamp())
            .await?
        else {
            return Ok(None);
        };

        let host_servers = match server.host_id.as_deref() {
            Some(host_id) => {
                self.servers_sharing_host(account_number, region, host_id)
                    .await?
            }
            None => vec![server.to_ref()],
        };
        let duplicate = !is_alone(&host_servers);
        debug!(
            account_number,
            server_id,
            sharing = host_servers.len(),
            duplicate,
            "Checked server co-residency"
        );
        Ok(Some(HostCheck {
            duplicate,
            host_servers,
        }))
    }
}

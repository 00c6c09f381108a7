//! Account snapshot builder.
//!
//! Enumerates an account's servers or volumes for one lookup dimension and
//! assembles an [`AccountSnapshot`]. Fetch failures never abort a build; the
//! snapshot simply holds whatever was retrieved.

use std::time::Duration;

use anchor_core::config::CacheConfig;
use anchor_core::db::unix_millis;
use anchor_core::model::{AccountSnapshot, LookupType, Records, ServerRecord, VolumeRecord};
use anchor_core::normalize::{CurrentServer, LegacyServer, parse_servers, parse_volumes};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::cloud::CloudClient;

#[derive(Debug, Clone)]
pub struct SnapshotBuilder {
    cloud: CloudClient,
    ttl_secs: i64,
    deadline: Duration,
}

impl SnapshotBuilder {
    pub fn new(cloud: CloudClient, cache: &CacheConfig) -> Self {
        let deadline = Duration::from_secs(cloud.config().build_deadline_secs);
        Self {
            cloud,
            ttl_secs: cache.ttl_secs,
            deadline,
        }
    }

    pub const fn cloud(&self) -> &CloudClient {
        &self.cloud
    }

    pub const fn ttl_secs(&self) -> i64 {
        self.ttl_secs
    }

    /// Build a snapshot of `account_number` in `region` for `lookup_type`.
    ///
    /// - `host_server`: every page of the current generation plus the legacy listing.
    /// - `public_ip_zone`: current generation only.
    /// - `cbs_host`: the block-storage volume listing.
    pub async fn build(
        &self,
        account_number: &str,
        token: &str,
        region: &str,
        lookup_type: LookupType,
    ) -> AccountSnapshot {
        let built_at = unix_millis();
        let deadline = Instant::now() + self.deadline;

        let records = match lookup_type {
            LookupType::HostServer => {
                let mut servers = self
                    .current_servers(account_number, token, region, lookup_type, deadline)
                    .await;
                servers.extend(
                    self.legacy_servers(account_number, token, region, lookup_type, deadline)
                        .await,
                );
                Records::Servers(servers)
            }
            LookupType::PublicIpZone => Records::Servers(
                self.current_servers(account_number, token, region, lookup_type, deadline)
                    .await,
            ),
            LookupType::CbsHost => {
                Records::Volumes(self.volumes(account_number, token, region).await)
            }
        };

        let snapshot = AccountSnapshot::new(
            account_number,
            region,
            lookup_type,
            token,
            records,
            built_at,
            self.ttl_secs,
        );

        info!(
            account_number,
            region = %snapshot.region,
            lookup_type = %lookup_type,
            records = snapshot.records.len(),
            keys = snapshot.grouping_keys.len(),
            "Snapshot built"
        );
        snapshot
    }

    async fn current_servers(
        &self,
        account_number: &str,
        token: &str,
        region: &str,
        lookup_type: LookupType,
        deadline: Instant,
    ) -> Vec<ServerRecord> {
        let listing = self
            .cloud
            .list_servers(account_number, token, region, Some(deadline))
            .await;
        if !listing.complete {
            warn!(
                account_number,
                region,
                pages = listing.pages,
                "Storing partial current-generation listing"
            );
        }
        parse_servers::<CurrentServer>(listing.servers, lookup_type)
    }

    async fn legacy_servers(
        &self,
        account_number: &str,
        token: &str,
        region: &str,
        lookup_type: LookupType,
        deadline: Instant,
    ) -> Vec<ServerRecord> {
        if Instant::now() >= deadline {
            warn!(account_number, region, "Build deadline passed before legacy listing");
            return Vec::new();
        }
        match tokio::time::timeout_at(
            deadline,
            self.cloud.list_legacy_servers(account_number, token, region),
        )
        .await
        {
            Ok(Some(raw)) => parse_servers::<LegacyServer>(raw, lookup_type),
            Ok(None) => Vec::new(),
            Err(_) => {
                warn!(account_number, region, "Build deadline passed during legacy listing");
                Vec::new()
            }
        }
    }

    async fn volumes(&self, account_number: &str, token: &str, region: &str) -> Vec<VolumeRecord> {
        match tokio::time::timeout(
            self.deadline,
            self.cloud.list_volumes(account_number, token, region),
        )
        .await
        {
            Ok(Some(raw)) => parse_volumes(raw),
            Ok(None) => Vec::new(),
            Err(_) => {
                warn!(account_number, region, "Build deadline passed during volume listing");
                Vec::new()
            }
        }
    }
}

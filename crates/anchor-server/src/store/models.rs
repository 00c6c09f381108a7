//! Row types for the cache store tables and their conversion to records.

use anchor_core::db::DatabaseError;
use anchor_core::model::{Addresses, Generation, ServerRecord, VolumeRecord};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AccountRow {
    pub id: String,
    pub account_number: String,
    pub region: String,
    pub lookup_type: String,
    pub token: String,
    pub cache_expiration: i64,
    pub built_at: i64,
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ServerRow {
    pub server_id: String,
    pub host_id: Option<String>,
    pub public_zone: Option<String>,
    pub name: String,
    pub state: Option<String>,
    pub created: Option<String>,
    pub flavor: Option<String>,
    /// JSON object of address class to address list.
    pub addresses: String,
    pub reboot_window: Option<String>,
    pub generation: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VolumeRow {
    pub volume_id: String,
    pub host: Option<String>,
    pub display_name: Option<String>,
    pub status: Option<String>,
    pub size: i64,
    pub bootable: bool,
    pub availability_zone: Option<String>,
    pub created: Option<String>,
    pub volume_type: Option<String>,
}

impl TryFrom<ServerRow> for ServerRecord {
    type Error = DatabaseError;

    fn try_from(row: ServerRow) -> Result<Self, Self::Error> {
        let addresses: Addresses = serde_json::from_str(&row.addresses)?;
        let generation: Generation = row
            .generation
            .parse()
            .map_err(|e: anchor_core::Error| DatabaseError::Serialization(e.to_string()))?;
        Ok(Self {
            id: row.server_id,
            host_id: row.host_id,
            public_zone: row.public_zone,
            name: row.name,
            state: row.state,
            created: row.created,
            flavor: row.flavor,
            addresses,
            reboot_window: row.reboot_window,
            generation,
        })
    }
}

impl From<VolumeRow> for VolumeRecord {
    fn from(row: VolumeRow) -> Self {
        Self {
            id: row.volume_id,
            host: row.host,
            display_name: row.display_name,
            status: row.status,
            size: u64::try_from(row.size).unwrap_or_default(),
            bootable: row.bootable,
            availability_zone: row.availability_zone,
            created: row.created,
            volume_type: row.volume_type,
        }
    }
}

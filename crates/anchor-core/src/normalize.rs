//! Normalization of raw upstream records into canonical records.
//!
//! Each API generation gets its own deserialization shape and a
//! [`ServerShape`] implementation; callers pick the shape once per listing
//! and hand the raw JSON items to [`parse_servers`].

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::warn;

use crate::model::{AddressClass, Addresses, Generation, LookupType, ServerRecord, VolumeRecord};

/// Metadata key under which the provider publishes the maintenance window.
pub const REBOOT_WINDOW_KEY: &str = "rax:reboot_window";

/// Metadata key holding the storage node of a volume.
pub const STORAGE_NODE_KEY: &str = "storage-node";

/// A raw server shape from one API generation.
pub trait ServerShape: DeserializeOwned {
    const GENERATION: Generation;

    /// Convert into the canonical record for the given lookup dimension.
    fn into_record(self, lookup: LookupType) -> ServerRecord;
}

/// Flavor reference on current-generation servers.
#[derive(Debug, Clone, Deserialize)]
pub struct FlavorRef {
    pub id: String,
}

/// One entry in a current-generation address bucket.
#[derive(Debug, Clone, Deserialize)]
pub struct RawAddress {
    #[serde(default)]
    pub version: Option<u8>,
    pub addr: String,
}

impl RawAddress {
    fn is_v4(&self) -> bool {
        match self.version {
            Some(v) => v == 4,
            None => matches!(self.addr.parse::<IpAddr>(), Ok(IpAddr::V4(_))),
        }
    }
}

/// Server as returned by the current-generation compute API.
#[derive(Debug, Clone, Deserialize)]
pub struct CurrentServer {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "hostId", default)]
    pub host_id: Option<String>,
    #[serde(rename = "OS-EXT-STS:vm_state", default)]
    pub vm_state: Option<String>,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub flavor: Option<FlavorRef>,
    #[serde(default)]
    pub addresses: BTreeMap<String, Vec<RawAddress>>,
    #[serde(rename = "accessIPv4", default)]
    pub access_ipv4: Option<String>,
    #[serde(rename = "RAX-PUBLIC-IP-ZONE-ID:publicIPZoneId", default)]
    pub public_zone: Option<String>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, Value>>,
}

/// Address lists on legacy-generation servers (no class metadata).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LegacyAddresses {
    #[serde(default)]
    pub public: Vec<String>,
    #[serde(default)]
    pub private: Vec<String>,
}

/// Server as returned by the legacy-generation compute API.
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyServer {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "hostId", default)]
    pub host_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(rename = "flavorId", default, deserialize_with = "opt_id_string")]
    pub flavor_id: Option<String>,
    #[serde(default)]
    pub addresses: LegacyAddresses,
    #[serde(default)]
    pub metadata: Option<HashMap<String, Value>>,
}

/// Block-storage volume as returned by the volume API.
#[derive(Debug, Clone, Deserialize)]
pub struct RawVolume {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default, deserialize_with = "loose_bool")]
    pub bootable: bool,
    #[serde(default)]
    pub availability_zone: Option<String>,
    #[serde(default, alias = "created")]
    pub created_at: Option<String>,
    #[serde(default)]
    pub volume_type: Option<String>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, Value>>,
}

fn id_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

fn opt_id_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

/// The volume API has published `bootable` both as a JSON bool and as "true"/"false".
fn loose_bool<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    match Option::<Value>::deserialize(d)? {
        Some(Value::Bool(b)) => Ok(b),
        Some(Value::String(s)) => Ok(s.eq_ignore_ascii_case("true")),
        _ => Ok(false),
    }
}

fn metadata_string(metadata: Option<&HashMap<String, Value>>, key: &str) -> Option<String> {
    match metadata?.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn push_unique(list: &mut Vec<String>, addr: String) {
    if !list.contains(&addr) {
        list.push(addr);
    }
}

/// Normalize current-generation address buckets.
///
/// Buckets other than `public`/`private` collapse into `custom`. In the
/// `public` bucket the first IPv4 entry is replaced by `accessIPv4` when the
/// two differ, and a `public` bucket is synthesized from `accessIPv4` when
/// the server has none.
pub fn normalize_addresses(
    buckets: BTreeMap<String, Vec<RawAddress>>,
    access_ipv4: Option<&str>,
) -> Addresses {
    let access_ipv4 = access_ipv4.filter(|a| !a.is_empty());
    let mut out = Addresses::new();
    for (label, entries) in buckets {
        let class = AddressClass::from_label(&label);
        let mut replaced = false;
        let list = out.entry(class).or_default();
        for entry in entries {
            let addr = match access_ipv4 {
                Some(access) if class == AddressClass::Public && !replaced && entry.is_v4() => {
                    replaced = true;
                    access.to_string()
                }
                _ => entry.addr,
            };
            push_unique(list, addr);
        }
    }
    if let Some(access) = access_ipv4 {
        out.entry(AddressClass::Public)
            .or_insert_with(|| vec![access.to_string()]);
    }
    out.retain(|_, list| !list.is_empty());
    out
}

impl ServerShape for CurrentServer {
    const GENERATION: Generation = Generation::Current;

    fn into_record(self, lookup: LookupType) -> ServerRecord {
        let reboot_window = metadata_string(self.metadata.as_ref(), REBOOT_WINDOW_KEY);
        let addresses = normalize_addresses(self.addresses, self.access_ipv4.as_deref());
        ServerRecord {
            id: self.id,
            host_id: non_empty(self.host_id),
            public_zone: match lookup {
                LookupType::PublicIpZone => non_empty(self.public_zone),
                _ => None,
            },
            name: self.name,
            state: self.vm_state,
            created: self.created,
            flavor: self.flavor.map(|f| f.id),
            addresses,
            reboot_window,
            generation: Self::GENERATION,
        }
    }
}

impl ServerShape for LegacyServer {
    const GENERATION: Generation = Generation::Legacy;

    fn into_record(self, _lookup: LookupType) -> ServerRecord {
        let reboot_window = metadata_string(self.metadata.as_ref(), REBOOT_WINDOW_KEY);
        let mut addresses = Addresses::new();
        if !self.addresses.public.is_empty() {
            addresses.insert(AddressClass::Public, self.addresses.public);
        }
        if !self.addresses.private.is_empty() {
            addresses.insert(AddressClass::Private, self.addresses.private);
        }
        ServerRecord {
            id: self.id,
            host_id: non_empty(self.host_id),
            public_zone: None,
            name: self.name,
            state: self.status.map(|s| s.to_ascii_lowercase()),
            created: None,
            flavor: self.flavor_id,
            addresses,
            reboot_window,
            generation: Self::GENERATION,
        }
    }
}

impl From<RawVolume> for VolumeRecord {
    fn from(raw: RawVolume) -> Self {
        Self {
            host: non_empty(metadata_string(raw.metadata.as_ref(), STORAGE_NODE_KEY)),
            id: raw.id,
            display_name: raw.display_name,
            status: raw.status,
            size: raw.size,
            bootable: raw.bootable,
            availability_zone: raw.availability_zone,
            created: raw.created_at,
            volume_type: raw.volume_type,
        }
    }
}

/// Normalize one raw server of shape `S`.
pub fn parse_server<S: ServerShape>(raw: Value, lookup: LookupType) -> Option<ServerRecord> {
    match serde_json::from_value::<S>(raw) {
        Ok(shape) => Some(shape.into_record(lookup)),
        Err(e) => {
            warn!(
                generation = S::GENERATION.as_str(),
                error = %e,
                "Skipping server record that does not match its API shape"
            );
            None
        }
    }
}

/// Normalize a listing of raw servers of shape `S`, skipping malformed entries.
pub fn parse_servers<S: ServerShape>(raw: Vec<Value>, lookup: LookupType) -> Vec<ServerRecord> {
    raw.into_iter()
        .filter_map(|item| parse_server::<S>(item, lookup))
        .collect()
}

/// Normalize a listing of raw volumes, skipping malformed entries.
pub fn parse_volumes(raw: Vec<Value>) -> Vec<VolumeRecord> {
    raw.into_iter()
        .filter_map(|item| match serde_json::from_value::<RawVolume>(item) {
            Ok(v) => Some(v.into()),
            Err(e) => {
                warn!(error = %e, "Skipping malformed volume record");
                None
            }
        })
        .collect()
}

//! Canonical records and the cached account snapshot.
//!
//! Every upstream server shape is normalized into [`ServerRecord`] (see
//! [`crate::normalize`]); volumes become [`VolumeRecord`]. An
//! [`AccountSnapshot`] holds one enumeration of an account for a single
//! [`LookupType`], together with the distinct grouping keys observed.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::Error;

/// Grouping axis used for a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupType {
    /// Servers grouped by physical hypervisor.
    HostServer,
    /// Servers grouped by public IP zone.
    PublicIpZone,
    /// Block-storage volumes grouped by storage node.
    CbsHost,
}

impl LookupType {
    pub const ALL: [Self; 3] = [Self::HostServer, Self::PublicIpZone, Self::CbsHost];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HostServer => "host_server",
            Self::PublicIpZone => "public_ip_zone",
            Self::CbsHost => "cbs_host",
        }
    }

    /// Document field holding the distinct grouping keys.
    pub const fn keys_field(self) -> &'static str {
        match self {
            Self::HostServer => "host_servers",
            Self::PublicIpZone => "public_zones",
            Self::CbsHost => "cbs_hosts",
        }
    }

    /// Whether snapshots of this type hold volumes instead of servers.
    pub const fn is_volume(self) -> bool {
        matches!(self, Self::CbsHost)
    }
}

impl fmt::Display for LookupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LookupType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::UnknownLookupType(s.to_string()))
    }
}

/// API generation a server record was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Generation {
    Current,
    Legacy,
}

impl Generation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::Legacy => "legacy",
        }
    }
}

impl FromStr for Generation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "current" => Ok(Self::Current),
            "legacy" => Ok(Self::Legacy),
            other => Err(Error::Config(format!("unknown server generation '{other}'"))),
        }
    }
}

/// Address bucket after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressClass {
    Public,
    Private,
    Custom,
}

impl AddressClass {
    /// Map an upstream bucket label onto a class; anything unrecognised is custom.
    pub fn from_label(label: &str) -> Self {
        match label {
            "public" => Self::Public,
            "private" => Self::Private,
            _ => Self::Custom,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
            Self::Custom => "custom",
        }
    }
}

/// Ordered address lists keyed by class.
pub type Addresses = BTreeMap<AddressClass, Vec<String>>;

/// One compute instance in canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: String,
    pub host_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_zone: Option<String>,
    pub name: String,
    pub state: Option<String>,
    pub created: Option<String>,
    pub flavor: Option<String>,
    #[serde(default)]
    pub addresses: Addresses,
    #[serde(default)]
    pub reboot_window: Option<String>,
    #[serde(rename = "type")]
    pub generation: Generation,
}

impl ServerRecord {
    /// Value this record is grouped by for the given dimension.
    pub fn grouping_key(&self, lookup: LookupType) -> Option<&str> {
        match lookup {
            LookupType::HostServer => self.host_id.as_deref(),
            LookupType::PublicIpZone => self.public_zone.as_deref(),
            LookupType::CbsHost => None,
        }
    }

    pub fn addresses_of(&self, class: AddressClass) -> &[String] {
        self.addresses.get(&class).map_or(&[], Vec::as_slice)
    }

    pub fn to_ref(&self) -> ServerRef {
        ServerRef {
            name: self.name.clone(),
            id: self.id.clone(),
        }
    }
}

/// One block-storage volume in canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub id: String,
    pub host: Option<String>,
    pub display_name: Option<String>,
    pub status: Option<String>,
    pub size: u64,
    pub bootable: bool,
    pub availability_zone: Option<String>,
    pub created: Option<String>,
    pub volume_type: Option<String>,
}

impl VolumeRecord {
    pub fn to_ref(&self) -> ServerRef {
        ServerRef {
            name: self.display_name.clone().unwrap_or_default(),
            id: self.id.clone(),
        }
    }
}

/// Minimal `{name, id}` projection returned by co-residency queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ServerRef {
    pub name: String,
    pub id: String,
}

/// Records held by a snapshot; which variant depends on the lookup type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Records {
    Servers(Vec<ServerRecord>),
    Volumes(Vec<VolumeRecord>),
}

impl Records {
    pub fn empty_for(lookup: LookupType) -> Self {
        if lookup.is_volume() {
            Self::Volumes(Vec::new())
        } else {
            Self::Servers(Vec::new())
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Servers(s) => s.len(),
            Self::Volumes(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Records that share one grouping key, in first-seen order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyGroup {
    pub key: Option<String>,
    pub members: Vec<ServerRef>,
}

/// Collect distinct keys preserving first-seen order. Absent keys are skipped.
pub fn distinct_keys<'a, I>(keys: I) -> Vec<String>
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for key in keys.into_iter().flatten() {
        if seen.insert(key) {
            out.push(key.to_string());
        }
    }
    out
}

/// Regions are stored lower-case regardless of how callers spell them.
pub fn normalize_region(region: &str) -> String {
    region.trim().to_ascii_lowercase()
}

/// Cached enumeration of one account/region for one lookup dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSnapshot {
    /// Store identity; stable across upserts of the same key.
    pub id: String,
    pub account_number: String,
    pub region: String,
    pub lookup_type: LookupType,
    pub records: Records,
    /// Distinct grouping keys across `records`.
    pub grouping_keys: Vec<String>,
    pub token: String,
    /// Unix seconds after which the snapshot is stale.
    pub cache_expiration: i64,
    /// Unix milliseconds at which the build that produced this snapshot started.
    pub built_at: i64,
    /// Incremented by the store on every accepted write.
    pub version: i64,
}

impl AccountSnapshot {
    /// Assemble a snapshot from freshly normalized records.
    ///
    /// Grouping keys are derived from the records, so the distinct-key
    /// invariant holds by construction.
    pub fn new(
        account_number: &str,
        region: &str,
        lookup_type: LookupType,
        token: &str,
        records: Records,
        built_at: i64,
        ttl_secs: i64,
    ) -> Self {
        let grouping_keys = match &records {
            Records::Servers(servers) => {
                distinct_keys(servers.iter().map(|s| s.grouping_key(lookup_type)))
            }
            Records::Volumes(volumes) => distinct_keys(volumes.iter().map(|v| v.host.as_deref())),
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            account_number: account_number.to_string(),
            region: normalize_region(region),
            lookup_type,
            records,
            grouping_keys,
            token: token.to_string(),
            cache_expiration: built_at / 1000 + ttl_secs,
            built_at,
            version: 0,
        }
    }

    pub fn servers(&self) -> &[ServerRecord] {
        match &self.records {
            Records::Servers(s) => s,
            Records::Volumes(_) => &[],
        }
    }

    pub fn volumes(&self) -> &[VolumeRecord] {
        match &self.records {
            Records::Volumes(v) => v,
            Records::Servers(_) => &[],
        }
    }

    /// Stale once `now > cache_expiration`.
    ///
    /// The expiration second itself still counts as fresh, matching the store's
    /// `cache_expiration >= now` filter, so a snapshot served by a fresh read is
    /// never reported stale in the same second.
    pub const fn is_stale(&self, now: i64) -> bool {
        now > self.cache_expiration
    }

    fn record_keys(&self) -> Vec<Option<&str>> {
        match &self.records {
            Records::Servers(s) => s.iter().map(|r| r.grouping_key(self.lookup_type)).collect(),
            Records::Volumes(v) => v.iter().map(|r| r.host.as_deref()).collect(),
        }
    }

    /// Every record has a grouping key and every such key is listed in
    /// `grouping_keys`.
    pub fn keys_consistent(&self) -> bool {
        self.record_keys()
            .iter()
            .all(|k| k.is_some_and(|k| self.grouping_keys.iter().any(|g| g == k)))
    }

    /// Flag shown alongside a breakdown.
    ///
    /// Set when the keys are not consistent, or, for host and storage-node
    /// lookups, when the number of records differs from the number of
    /// distinct keys (some key is shared). Zone lookups naturally hold many
    /// servers per zone, so the count comparison does not apply there.
    pub fn mismatch(&self) -> bool {
        if !self.keys_consistent() {
            return true;
        }
        match self.lookup_type {
            LookupType::PublicIpZone => false,
            LookupType::HostServer | LookupType::CbsHost => {
                self.records.len() != self.grouping_keys.len()
            }
        }
    }

    /// Group records by grouping key, ordered by first appearance.
    pub fn grouped(&self) -> Vec<KeyGroup> {
        let refs: Vec<(Option<&str>, ServerRef)> = match &self.records {
            Records::Servers(s) => s
                .iter()
                .map(|r| (r.grouping_key(self.lookup_type), r.to_ref()))
                .collect(),
            Records::Volumes(v) => v.iter().map(|r| (r.host.as_deref(), r.to_ref())).collect(),
        };
        let mut groups: Vec<KeyGroup> = Vec::new();
        let mut index: HashMap<Option<&str>, usize> = HashMap::new();
        for (key, member) in refs {
            let slot = *index.entry(key).or_insert_with(|| {
                groups.push(KeyGroup {
                    key: key.map(str::to_string),
                    members: Vec::new(),
                });
                groups.len() - 1
            });
            groups[slot].members.push(member);
        }
        groups
    }

    /// Document view of the snapshot; the token is never included.
    pub fn to_document(&self) -> Value {
        let mut doc = json!({
            "id": self.id,
            "account_number": self.account_number,
            "region": self.region,
            "lookup_type": self.lookup_type,
            "cache_expiration": self.cache_expiration,
            "version": self.version,
        });
        let records = match &self.records {
            Records::Servers(s) => ("servers", json!(s)),
            Records::Volumes(v) => ("volumes", json!(v)),
        };
        if let Some(obj) = doc.as_object_mut() {
            obj.insert(records.0.to_string(), records.1);
            obj.insert(
                self.lookup_type.keys_field().to_string(),
                json!(self.grouping_keys),
            );
        }
        doc
    }
}

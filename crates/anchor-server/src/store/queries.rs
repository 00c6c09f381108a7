//! Queries for the account cache store.

use anchor_core::db::{DatabaseError, unix_timestamp};
use anchor_core::model::{
    AccountSnapshot, LookupType, Records, ServerRecord, ServerRef, VolumeRecord, normalize_region,
};
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

use super::db::CacheStore;
use super::models::{AccountRow, ServerRow, VolumeRow};

const SELECT_SERVER_COLUMNS: &str = "SELECT server_id, host_id, public_zone, name, state, created, \
     flavor, addresses, reboot_window, generation FROM servers";

async fn insert_server(
    conn: &mut SqliteConnection,
    account_id: &str,
    position: i64,
    server: &ServerRecord,
) -> Result<(), DatabaseError> {
    let addresses = serde_json::to_string(&server.addresses)?;
    sqlx::query(
        "INSERT INTO servers (account_id, position, server_id, host_id, public_zone, name, state, \
         created, flavor, addresses, reboot_window, generation) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(account_id)
    .bind(position)
    .bind(&server.id)
    .bind(&server.host_id)
    .bind(&server.public_zone)
    .bind(&server.name)
    .bind(&server.state)
    .bind(&server.created)
    .bind(&server.flavor)
    .bind(addresses)
    .bind(&server.reboot_window)
    .bind(server.generation.as_str())
    .execute(conn)
    .await?;
    Ok(())
}

async fn insert_volume(
    conn: &mut SqliteConnection,
    account_id: &str,
    position: i64,
    volume: &VolumeRecord,
) -> Result<(), DatabaseError> {
    sqlx::query(
        "INSERT INTO volumes (account_id, position, volume_id, host, display_name, status, size, \
         bootable, availability_zone, created, volume_type) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(account_id)
    .bind(position)
    .bind(&volume.id)
    .bind(&volume.host)
    .bind(&volume.display_name)
    .bind(&volume.status)
    .bind(i64::try_from(volume.size).unwrap_or(i64::MAX))
    .bind(volume.bootable)
    .bind(&volume.availability_zone)
    .bind(&volume.created)
    .bind(&volume.volume_type)
    .execute(conn)
    .await?;
    Ok(())
}

async fn insert_key(
    conn: &mut SqliteConnection,
    account_id: &str,
    position: i64,
    key: &str,
) -> Result<(), DatabaseError> {
    sqlx::query("INSERT INTO grouping_keys (account_id, position, key) VALUES (?, ?, ?)")
        .bind(account_id)
        .bind(position)
        .bind(key)
        .execute(conn)
        .await?;
    Ok(())
}

#[allow(clippy::cast_possible_wrap)]
const fn position(index: usize) -> i64 {
    index as i64
}

impl CacheStore {
    // =========================================================================
    // Snapshot writes
    // =========================================================================

    /// Store `snapshot`, replacing any snapshot with the same
    /// `(account_number, region, lookup_type)`.
    ///
    /// Returns `false` without writing when the stored snapshot came from a
    /// build that started later than this one. On success the snapshot's `id`
    /// and `version` are updated to the stored values; the id of an existing
    /// row is kept.
    pub async fn upsert(&self, snapshot: &mut AccountSnapshot) -> Result<bool, DatabaseError> {
        let region = normalize_region(&snapshot.region);
        let mut tx = self.begin_write().await?;

        let existing = sqlx::query_as::<_, (String, i64, i64)>(
            "SELECT id, built_at, version FROM accounts \
             WHERE account_number = ? AND region = ? AND lookup_type = ?",
        )
        .bind(&snapshot.account_number)
        .bind(&region)
        .bind(snapshot.lookup_type.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let now = unix_timestamp();
        let (id, version) = match existing {
            Some((_, stored_built_at, _)) if stored_built_at > snapshot.built_at => {
                warn!(
                    account_number = %snapshot.account_number,
                    region = %region,
                    lookup_type = %snapshot.lookup_type,
                    stored_built_at,
                    built_at = snapshot.built_at,
                    "Discarding snapshot older than the stored one"
                );
                return Ok(false);
            }
            Some((id, _, version)) => {
                sqlx::query(
                    "UPDATE accounts SET token = ?, cache_expiration = ?, built_at = ?, \
                     version = ?, updated_at = ? WHERE id = ?",
                )
                .bind(&snapshot.token)
                .bind(snapshot.cache_expiration)
                .bind(snapshot.built_at)
                .bind(version + 1)
                .bind(now)
                .bind(&id)
                .execute(&mut *tx)
                .await?;
                for table in ["servers", "volumes", "grouping_keys"] {
                    sqlx::query(&format!("DELETE FROM {table} WHERE account_id = ?"))
                        .bind(&id)
                        .execute(&mut *tx)
                        .await?;
                }
                (id, version + 1)
            }
            None => {
                sqlx::query(
                    "INSERT INTO accounts (id, account_number, region, lookup_type, token, \
                     cache_expiration, built_at, version, created_at, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
                )
                .bind(&snapshot.id)
                .bind(&snapshot.account_number)
                .bind(&region)
                .bind(snapshot.lookup_type.as_str())
                .bind(&snapshot.token)
                .bind(snapshot.cache_expiration)
                .bind(snapshot.built_at)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                (snapshot.id.clone(), 1)
            }
        };

        match &snapshot.records {
            Records::Servers(servers) => {
                for (i, server) in servers.iter().enumerate() {
                    insert_server(&mut *tx, &id, position(i), server).await?;
                }
            }
            Records::Volumes(volumes) => {
                for (i, volume) in volumes.iter().enumerate() {
                    insert_volume(&mut *tx, &id, position(i), volume).await?;
                }
            }
        }
        for (i, key) in snapshot.grouping_keys.iter().enumerate() {
            insert_key(&mut *tx, &id, position(i), key).await?;
        }

        tx.commit().await?;

        info!(
            account_number = %snapshot.account_number,
            region = %region,
            lookup_type = %snapshot.lookup_type,
            records = snapshot.records.len(),
            keys = snapshot.grouping_keys.len(),
            version,
            "Snapshot stored"
        );
        snapshot.id = id;
        snapshot.region = region;
        snapshot.version = version;
        Ok(true)
    }

    /// Append one server to the snapshot stored under `snapshot.id`.
    ///
    /// Returns whether the server's grouping key was already present in that
    /// snapshot before the append. A novel key is added to the snapshot's
    /// grouping keys; a server without a key is appended and reported as not
    /// a duplicate.
    pub async fn append_server(
        &self,
        snapshot: &AccountSnapshot,
        server: &ServerRecord,
    ) -> Result<bool, DatabaseError> {
        let mut tx = self.begin_write().await?;

        let lookup = sqlx::query_scalar::<_, String>("SELECT lookup_type FROM accounts WHERE id = ?")
            .bind(&snapshot.id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Snapshot {}", snapshot.id)))?
            .parse::<LookupType>()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        if lookup.is_volume() {
            return Err(DatabaseError::Invalid(format!(
                "cannot append a server to {lookup} snapshot {}",
                snapshot.id
            )));
        }

        let key = server.grouping_key(lookup);
        let duplicate = match key {
            Some(key) => {
                sqlx::query_scalar::<_, bool>(
                    "SELECT EXISTS(SELECT 1 FROM grouping_keys WHERE account_id = ? AND key = ?)",
                )
                .bind(&snapshot.id)
                .bind(key)
                .fetch_one(&mut *tx)
                .await?
            }
            None => false,
        };

        let next = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM servers WHERE account_id = ?",
        )
        .bind(&snapshot.id)
        .fetch_one(&mut *tx)
        .await?;
        insert_server(&mut *tx, &snapshot.id, next, server).await?;

        if let Some(key) = key
            && !duplicate
        {
            let next_key = sqlx::query_scalar::<_, i64>(
                "SELECT COALESCE(MAX(position) + 1, 0) FROM grouping_keys WHERE account_id = ?",
            )
            .bind(&snapshot.id)
            .fetch_one(&mut *tx)
            .await?;
            insert_key(&mut *tx, &snapshot.id, next_key, key).await?;
        }

        sqlx::query("UPDATE accounts SET version = version + 1, updated_at = ? WHERE id = ?")
            .bind(unix_timestamp())
            .bind(&snapshot.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(
            snapshot_id = %snapshot.id,
            server_id = %server.id,
            duplicate,
            "Server appended to snapshot"
        );
        Ok(duplicate)
    }

    /// Delete every snapshot for an account and region. Returns the number removed.
    pub async fn delete(&self, account_number: &str, region: &str) -> Result<u64, DatabaseError> {
        let region = normalize_region(region);
        let result = sqlx::query("DELETE FROM accounts WHERE account_number = ? AND region = ?")
            .bind(account_number)
            .bind(&region)
            .execute(self.pool())
            .await?;

        info!(
            account_number,
            region = %region,
            removed = result.rows_affected(),
            "Account snapshots deleted"
        );
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Snapshot reads
    // =========================================================================

    async fn load(&self, row: AccountRow) -> Result<AccountSnapshot, DatabaseError> {
        let lookup_type: LookupType = row
            .lookup_type
            .parse()
            .map_err(|e: anchor_core::Error| DatabaseError::Serialization(e.to_string()))?;

        let records = if lookup_type.is_volume() {
            let rows = sqlx::query_as::<_, VolumeRow>(
                "SELECT volume_id, host, display_name, status, size, bootable, availability_zone, \
                 created, volume_type FROM volumes WHERE account_id = ? ORDER BY position",
            )
            .bind(&row.id)
            .fetch_all(self.pool())
            .await?;
            Records::Volumes(rows.into_iter().map(VolumeRecord::from).collect())
        } else {
            let rows = sqlx::query_as::<_, ServerRow>(&format!(
                "{SELECT_SERVER_COLUMNS} WHERE account_id = ? ORDER BY position"
            ))
            .bind(&row.id)
            .fetch_all(self.pool())
            .await?;
            Records::Servers(
                rows.into_iter()
                    .map(ServerRecord::try_from)
                    .collect::<Result<_, _>>()?,
            )
        };

        let grouping_keys = sqlx::query_scalar::<_, String>(
            "SELECT key FROM grouping_keys WHERE account_id = ? ORDER BY position",
        )
        .bind(&row.id)
        .fetch_all(self.pool())
        .await?;

        Ok(AccountSnapshot {
            id: row.id,
            account_number: row.account_number,
            region: row.region,
            lookup_type,
            records,
            grouping_keys,
            token: row.token,
            cache_expiration: row.cache_expiration,
            built_at: row.built_at,
            version: row.version,
        })
    }

    /// Read the snapshot for a key regardless of age.
    pub async fn read(
        &self,
        account_number: &str,
        region: &str,
        lookup_type: LookupType,
    ) -> Result<Option<AccountSnapshot>, DatabaseError> {
        let row = sqlx::query_as::<_, AccountRow>(
            "SELECT * FROM accounts WHERE account_number = ? AND region = ? AND lookup_type = ?",
        )
        .bind(account_number)
        .bind(normalize_region(region))
        .bind(lookup_type.as_str())
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(row) => Ok(Some(self.load(row).await?)),
            None => Ok(None),
        }
    }

    /// Read the snapshot for a key only if it is not stale at `now`.
    pub async fn read_fresh(
        &self,
        account_number: &str,
        region: &str,
        lookup_type: LookupType,
        now: i64,
    ) -> Result<Option<AccountSnapshot>, DatabaseError> {
        let row = sqlx::query_as::<_, AccountRow>(
            "SELECT * FROM accounts WHERE account_number = ? AND region = ? AND lookup_type = ? \
             AND cache_expiration >= ?",
        )
        .bind(account_number)
        .bind(normalize_region(region))
        .bind(lookup_type.as_str())
        .bind(now)
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(row) => Ok(Some(self.load(row).await?)),
            None => Ok(None),
        }
    }

    /// Read a snapshot by its store identity.
    pub async fn read_by_id(&self, id: &str) -> Result<AccountSnapshot, DatabaseError> {
        let row = sqlx::query_as::<_, AccountRow>("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Snapshot {id}")))?;
        self.load(row).await
    }

    // =========================================================================
    // Server lookups
    // =========================================================================

    // Stale snapshots are invisible to every lookup below.

    /// Whether a fresh snapshot for the account and region already holds `server_id`.
    pub async fn server_cataloged(
        &self,
        account_number: &str,
        region: &str,
        server_id: &str,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let found = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM servers s JOIN accounts a ON a.id = s.account_id \
             WHERE a.account_number = ? AND a.region = ? AND s.server_id = ? \
             AND a.cache_expiration >= ?)",
        )
        .bind(account_number)
        .bind(normalize_region(region))
        .bind(server_id)
        .bind(now)
        .fetch_one(self.pool())
        .await?;
        Ok(found)
    }

    /// Find a fresh server record, preferring host lookups and newer builds.
    pub async fn find_server(
        &self,
        account_number: &str,
        region: &str,
        server_id: &str,
        now: i64,
    ) -> Result<Option<ServerRecord>, DatabaseError> {
        let row = sqlx::query_as::<_, ServerRow>(
            "SELECT s.server_id, s.host_id, s.public_zone, s.name, s.state, s.created, s.flavor, \
             s.addresses, s.reboot_window, s.generation \
             FROM servers s JOIN accounts a ON a.id = s.account_id \
             WHERE a.account_number = ? AND a.region = ? AND s.server_id = ? \
             AND a.cache_expiration >= ? \
             ORDER BY a.lookup_type = 'host_server' DESC, a.built_at DESC, s.position DESC \
             LIMIT 1",
        )
        .bind(account_number)
        .bind(normalize_region(region))
        .bind(server_id)
        .bind(now)
        .fetch_optional(self.pool())
        .await?;

        row.map(ServerRecord::try_from).transpose()
    }

    /// Distinct servers on `host_id` across every fresh snapshot of the account and region.
    pub async fn servers_on_host(
        &self,
        account_number: &str,
        region: &str,
        host_id: &str,
        now: i64,
    ) -> Result<Vec<ServerRef>, DatabaseError> {
        let refs = sqlx::query_as::<_, ServerRef>(
            "SELECT MIN(s.name) AS name, s.server_id AS id \
             FROM servers s JOIN accounts a ON a.id = s.account_id \
             WHERE a.account_number = ? AND a.region = ? AND s.host_id = ? \
             AND a.cache_expiration >= ? \
             GROUP BY s.server_id ORDER BY MIN(s.position), s.server_id",
        )
        .bind(account_number)
        .bind(normalize_region(region))
        .bind(host_id)
        .bind(now)
        .fetch_all(self.pool())
        .await?;
        Ok(refs)
    }
}

//! Storage layer tests for the account cache.

use anchor_core::db::{DatabaseError, unix_timestamp};
use anchor_core::model::{
    AccountSnapshot, AddressClass, Addresses, Generation, LookupType, Records, ServerRecord,
    VolumeRecord,
};

use super::db::CacheStore;

async fn test_store() -> CacheStore {
    CacheStore::open_in_memory().await.unwrap()
}

fn server(id: &str, host: Option<&str>) -> ServerRecord {
    let mut addresses = Addresses::new();
    addresses.insert(AddressClass::Public, vec!["104.104.104.104".into()]);
    ServerRecord {
        id: id.into(),
        host_id: host.map(Into::into),
        public_zone: None,
        name: format!("web-{id}"),
        state: Some("active".into()),
        created: Some("2024-01-01T00:00:00Z".into()),
        flavor: Some("performance1-1".into()),
        addresses,
        reboot_window: None,
        generation: Generation::Current,
    }
}

fn host_snapshot(servers: Vec<ServerRecord>, built_at: i64) -> AccountSnapshot {
    AccountSnapshot::new(
        "123456",
        "IAD",
        LookupType::HostServer,
        "tok",
        Records::Servers(servers),
        built_at,
        86_400,
    )
}

fn now_millis() -> i64 {
    unix_timestamp() * 1000
}

// === Upsert / read ===

#[tokio::test]
async fn upsert_then_read_roundtrips_records() {
    let store = test_store().await;
    let mut snap = host_snapshot(
        vec![server("1", Some("A")), server("2", Some("B"))],
        now_millis(),
    );
    assert!(store.upsert(&mut snap).await.unwrap());
    assert_eq!(snap.version, 1);

    let stored = store
        .read("123456", "iad", LookupType::HostServer)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.id, snap.id);
    assert_eq!(stored.region, "iad");
    assert_eq!(stored.servers(), snap.servers());
    assert_eq!(stored.grouping_keys, vec!["A", "B"]);
    assert_eq!(stored.token, "tok");
}

#[tokio::test]
async fn read_missing_key_is_none() {
    let store = test_store().await;
    assert!(
        store
            .read("123456", "iad", LookupType::CbsHost)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn upsert_replaces_records_and_keeps_id() {
    let store = test_store().await;
    let built = now_millis();
    let mut first = host_snapshot(vec![server("1", Some("A"))], built);
    store.upsert(&mut first).await.unwrap();

    let mut second = host_snapshot(
        vec![server("2", Some("B")), server("3", Some("C"))],
        built + 10,
    );
    assert!(store.upsert(&mut second).await.unwrap());
    assert_eq!(second.id, first.id);
    assert_eq!(second.version, 2);

    let stored = store.read_by_id(&first.id).await.unwrap();
    let ids: Vec<_> = stored.servers().iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["2", "3"]);
    assert_eq!(stored.grouping_keys, vec!["B", "C"]);
}

#[tokio::test]
async fn older_build_does_not_clobber_newer_snapshot() {
    let store = test_store().await;
    let built = now_millis();
    let mut newer = host_snapshot(vec![server("new", Some("A"))], built);
    store.upsert(&mut newer).await.unwrap();

    let mut older = host_snapshot(vec![server("old", Some("B"))], built - 5_000);
    assert!(!store.upsert(&mut older).await.unwrap());

    let stored = store.read_by_id(&newer.id).await.unwrap();
    assert_eq!(stored.servers()[0].id, "new");
    assert_eq!(stored.version, 1);
}

#[tokio::test]
async fn lookup_types_are_stored_independently() {
    let store = test_store().await;
    let built = now_millis();
    let mut hosts = host_snapshot(vec![server("1", Some("A"))], built);
    store.upsert(&mut hosts).await.unwrap();

    let volume = VolumeRecord {
        id: "v1".into(),
        host: Some("node-1".into()),
        display_name: Some("data".into()),
        status: Some("in-use".into()),
        size: 100,
        bootable: false,
        availability_zone: Some("nova".into()),
        created: None,
        volume_type: Some("SSD".into()),
    };
    let mut volumes = AccountSnapshot::new(
        "123456",
        "iad",
        LookupType::CbsHost,
        "tok",
        Records::Volumes(vec![volume.clone()]),
        built,
        86_400,
    );
    store.upsert(&mut volumes).await.unwrap();
    assert_ne!(volumes.id, hosts.id);

    let stored = store
        .read("123456", "IAD", LookupType::CbsHost)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.volumes(), &[volume]);
    assert_eq!(stored.grouping_keys, vec!["node-1"]);
}

// === Freshness ===

#[tokio::test]
async fn stale_snapshot_excluded_from_fresh_read() {
    let store = test_store().await;
    let two_days_ago = (unix_timestamp() - 2 * 86_400) * 1000;
    let mut snap = host_snapshot(vec![server("1", Some("A"))], two_days_ago);
    store.upsert(&mut snap).await.unwrap();

    let now = unix_timestamp();
    assert!(
        store
            .read_fresh("123456", "iad", LookupType::HostServer, now)
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        store
            .read("123456", "iad", LookupType::HostServer)
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn fresh_snapshot_returned_by_fresh_read() {
    let store = test_store().await;
    let mut snap = host_snapshot(vec![server("1", Some("A"))], now_millis());
    store.upsert(&mut snap).await.unwrap();

    let fresh = store
        .read_fresh("123456", "iad", LookupType::HostServer, unix_timestamp())
        .await
        .unwrap();
    assert_eq!(fresh.map(|s| s.id), Some(snap.id));
}

// === Incremental append ===

#[tokio::test]
async fn append_onto_existing_host_is_duplicate() {
    let store = test_store().await;
    let mut snap = host_snapshot(vec![server("1", Some("A"))], now_millis());
    store.upsert(&mut snap).await.unwrap();

    assert!(store.append_server(&snap, &server("2", Some("A"))).await.unwrap());

    let stored = store.read_by_id(&snap.id).await.unwrap();
    assert_eq!(stored.servers().len(), 2);
    assert_eq!(stored.grouping_keys, vec!["A"]);
    assert_eq!(stored.version, 2);
}

#[tokio::test]
async fn append_onto_novel_host_is_not_duplicate() {
    let store = test_store().await;
    let mut snap = host_snapshot(vec![server("1", Some("A"))], now_millis());
    store.upsert(&mut snap).await.unwrap();

    assert!(!store.append_server(&snap, &server("2", Some("B"))).await.unwrap());

    let stored = store.read_by_id(&snap.id).await.unwrap();
    assert_eq!(stored.servers().len(), 2);
    assert_eq!(stored.servers()[1].id, "2");
    assert_eq!(stored.grouping_keys, vec!["A", "B"]);
    assert!(!stored.mismatch());
}

#[tokio::test]
async fn append_without_host_is_not_duplicate() {
    let store = test_store().await;
    let mut snap = host_snapshot(vec![server("1", Some("A"))], now_millis());
    store.upsert(&mut snap).await.unwrap();

    assert!(!store.append_server(&snap, &server("2", None)).await.unwrap());
    let stored = store.read_by_id(&snap.id).await.unwrap();
    assert_eq!(stored.servers().len(), 2);
    assert!(stored.mismatch());
}

#[tokio::test]
async fn append_to_unknown_snapshot_is_not_found() {
    let store = test_store().await;
    let snap = host_snapshot(vec![], now_millis());
    let err = store
        .append_server(&snap, &server("1", Some("A")))
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::NotFound(_)));
}

// === Delete ===

#[tokio::test]
async fn delete_removes_all_lookup_types_for_region() {
    let store = test_store().await;
    let built = now_millis();
    let mut hosts = host_snapshot(vec![server("1", Some("A"))], built);
    store.upsert(&mut hosts).await.unwrap();
    let mut zones = AccountSnapshot::new(
        "123456",
        "iad",
        LookupType::PublicIpZone,
        "tok",
        Records::Servers(vec![server("1", Some("A"))]),
        built,
        86_400,
    );
    store.upsert(&mut zones).await.unwrap();
    let mut other_region = AccountSnapshot::new(
        "123456",
        "dfw",
        LookupType::HostServer,
        "tok",
        Records::Servers(vec![]),
        built,
        86_400,
    );
    store.upsert(&mut other_region).await.unwrap();

    assert_eq!(store.delete("123456", "IAD").await.unwrap(), 2);
    assert!(store.read_by_id(&hosts.id).await.is_err());
    assert!(
        !store
            .server_cataloged("123456", "iad", "1", unix_timestamp())
            .await
            .unwrap()
    );
    assert!(store.read_by_id(&other_region.id).await.is_ok());
}

// === Server lookups ===

#[tokio::test]
async fn servers_on_host_returns_all_sharing_servers() {
    let store = test_store().await;
    let mut snap = host_snapshot(
        vec![
            server("1", Some("H")),
            server("2", Some("H")),
            server("3", Some("X")),
        ],
        now_millis(),
    );
    store.upsert(&mut snap).await.unwrap();

    let shared = store.servers_on_host("123456", "iad", "H", unix_timestamp()).await.unwrap();
    let ids: Vec<_> = shared.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2"]);
    assert_eq!(shared[0].name, "web-1");

    let alone = store.servers_on_host("123456", "iad", "X", unix_timestamp()).await.unwrap();
    assert_eq!(alone.len(), 1);
}

#[tokio::test]
async fn servers_on_host_dedupes_across_lookup_types() {
    let store = test_store().await;
    let built = now_millis();
    let mut hosts = host_snapshot(vec![server("1", Some("H"))], built);
    store.upsert(&mut hosts).await.unwrap();
    let mut zones = AccountSnapshot::new(
        "123456",
        "iad",
        LookupType::PublicIpZone,
        "tok",
        Records::Servers(vec![server("1", Some("H"))]),
        built,
        86_400,
    );
    store.upsert(&mut zones).await.unwrap();

    let shared = store.servers_on_host("123456", "iad", "H", unix_timestamp()).await.unwrap();
    assert_eq!(shared.len(), 1);
}

#[tokio::test]
async fn find_server_and_cataloged() {
    let store = test_store().await;
    let mut snap = host_snapshot(vec![server("1", Some("A"))], now_millis());
    store.upsert(&mut snap).await.unwrap();

    assert!(store.server_cataloged("123456", "iad", "1", unix_timestamp()).await.unwrap());
    assert!(!store.server_cataloged("123456", "iad", "9", unix_timestamp()).await.unwrap());

    let found = store.find_server("123456", "IAD", "1", unix_timestamp()).await.unwrap().unwrap();
    assert_eq!(found.host_id.as_deref(), Some("A"));
    assert_eq!(
        found.addresses_of(AddressClass::Public),
        &["104.104.104.104".to_string()]
    );
    assert!(store.find_server("123456", "iad", "9", unix_timestamp()).await.unwrap().is_none());
}

#[tokio::test]
async fn snapshots_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("anchor.db");

    let id = {
        let store = CacheStore::open(&path).await.unwrap();
        let mut snap = host_snapshot(vec![server("1", Some("A"))], now_millis());
        store.upsert(&mut snap).await.unwrap();
        snap.id
    };

    let store = CacheStore::open(&path).await.unwrap();
    let stored = store
        .read("123456", "iad", LookupType::HostServer)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.id, id);
    assert_eq!(stored.grouping_keys, vec!["A"]);
}

#[tokio::test]
async fn snapshot_is_fresh_at_its_expiration_second() {
    let store = test_store().await;
    let mut snap = host_snapshot(vec![server("1", Some("A"))], now_millis());
    store.upsert(&mut snap).await.unwrap();
    let expires = snap.cache_expiration;

    let at = store
        .read_fresh("123456", "iad", LookupType::HostServer, expires)
        .await
        .unwrap();
    assert!(at.is_some());
    let after = store
        .read_fresh("123456", "iad", LookupType::HostServer, expires + 1)
        .await
        .unwrap();
    assert!(after.is_none());
}

#[tokio::test]
async fn expired_snapshot_hidden_from_server_lookups() {
    let store = test_store().await;
    let two_days_ago = (unix_timestamp() - 2 * 86_400) * 1000;
    let mut snap = host_snapshot(
        vec![server("1", Some("H")), server("2", Some("H"))],
        two_days_ago,
    );
    store.upsert(&mut snap).await.unwrap();
    let now = unix_timestamp();

    assert!(store.servers_on_host("123456", "iad", "H", now).await.unwrap().is_empty());
    assert!(store.find_server("123456", "iad", "1", now).await.unwrap().is_none());
    assert!(!store.server_cataloged("123456", "iad", "1", now).await.unwrap());

    // Still visible to a lookup made before it expired.
    let then = snap.cache_expiration;
    assert_eq!(store.servers_on_host("123456", "iad", "H", then).await.unwrap().len(), 2);
    assert!(store.server_cataloged("123456", "iad", "1", then).await.unwrap());
}

// === Concurrent writers ===

async fn file_store() -> (tempfile::TempDir, CacheStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = CacheStore::open(&dir.path().join("anchor.db")).await.unwrap();
    (dir, store)
}

fn account_snapshot(account: &str, servers: Vec<ServerRecord>) -> AccountSnapshot {
    AccountSnapshot::new(
        account,
        "iad",
        LookupType::HostServer,
        "tok",
        Records::Servers(servers),
        now_millis(),
        86_400,
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_upserts_all_succeed_on_file_store() {
    let (_dir, store) = file_store().await;

    let handles: Vec<_> = (0..40)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                let mut snap = account_snapshot(
                    &format!("acct-{i}"),
                    vec![server("1", Some("A")), server("2", Some("B"))],
                );
                store.upsert(&mut snap).await
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.await.unwrap().unwrap());
    }
    for i in 0..40 {
        let stored = store
            .read(&format!("acct-{i}"), "iad", LookupType::HostServer)
            .await
            .unwrap();
        assert!(stored.is_some());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upsert_and_append_interleave_on_file_store() {
    let (_dir, store) = file_store().await;
    let mut base = account_snapshot("123456", vec![server("1", Some("A"))]);
    store.upsert(&mut base).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..20 {
        let appender = store.clone();
        let target = base.clone();
        handles.push(tokio::spawn(async move {
            appender
                .append_server(&target, &server(&format!("new-{i}"), Some("A")))
                .await
                .map(|_| ())
        }));
        let refresher = store.clone();
        handles.push(tokio::spawn(async move {
            let mut other = account_snapshot(&format!("other-{i}"), vec![server("9", Some("Z"))]);
            refresher.upsert(&mut other).await.map(|_| ())
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    let stored = store.read_by_id(&base.id).await.unwrap();
    assert_eq!(stored.servers().len(), 21);
    assert_eq!(stored.grouping_keys, vec!["A"]);
}

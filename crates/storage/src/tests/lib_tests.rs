use super::*;

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("push_storage_test_{suffix}"));
    let db_path = temp_root.join("nested").join("storage.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}

#[tokio::test]
async fn missing_inbox_version_loads_as_none() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let version = storage
        .load_inbox_version(UserId(42))
        .await
        .expect("load");
    assert_eq!(version, None);
}

#[tokio::test]
async fn stores_and_loads_inbox_version() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .store_inbox_version(UserId(1), InboxVersion(7))
        .await
        .expect("store");
    storage
        .store_inbox_version(UserId(1), InboxVersion(9))
        .await
        .expect("store newer");

    let version = storage.load_inbox_version(UserId(1)).await.expect("load");
    assert_eq!(version, Some(InboxVersion(9)));
}

#[tokio::test]
async fn stored_inbox_version_is_never_lowered() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .store_inbox_version(UserId(1), InboxVersion(12))
        .await
        .expect("store");
    storage
        .store_inbox_version(UserId(1), InboxVersion(4))
        .await
        .expect("store older");

    let version = storage.load_inbox_version(UserId(1)).await.expect("load");
    assert_eq!(version, Some(InboxVersion(12)));
}

#[tokio::test]
async fn inbox_versions_are_tracked_per_user() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .store_inbox_version(UserId(2), InboxVersion(3))
        .await
        .expect("store bob");
    storage
        .store_inbox_version(UserId(1), InboxVersion(5))
        .await
        .expect("store alice");

    let listed = storage.list_inbox_versions().await.expect("list");
    let pairs: Vec<_> = listed.iter().map(|v| (v.user_id, v.version)).collect();
    assert_eq!(
        pairs,
        vec![(UserId(1), InboxVersion(5)), (UserId(2), InboxVersion(3))]
    );

    assert!(storage.clear_inbox_version(UserId(1)).await.expect("clear"));
    assert!(!storage.clear_inbox_version(UserId(1)).await.expect("clear again"));
    assert_eq!(
        storage.load_inbox_version(UserId(1)).await.expect("load"),
        None
    );
}

#[tokio::test]
async fn inbox_version_survives_reopen() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("push_storage_reopen_{suffix}"));
    let db_path = temp_root.join("push.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    {
        let storage = Storage::new(&database_url).await.expect("db");
        storage
            .store_inbox_version(UserId(8), InboxVersion(31))
            .await
            .expect("store");
        storage.pool().close().await;
    }

    let reopened = Storage::new(&database_url).await.expect("reopen");
    assert_eq!(
        reopened.load_inbox_version(UserId(8)).await.expect("load"),
        Some(InboxVersion(31))
    );
    reopened.pool().close().await;

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}

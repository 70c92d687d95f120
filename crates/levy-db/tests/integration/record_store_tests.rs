use levy_core::pool::PoolConfig;
use levy_core::traits::{ConnectionManager, RecordStore};
use levy_db::PgConnectionManager;
use serde_json::json;

use crate::common::setup_test_db;

#[tokio::test]
async fn put_and_get_record() {
    let (_db, config, _container) = setup_test_db().await;
    let manager = PgConnectionManager::new(&config).unwrap();
    let mut conn = manager.connect().await.unwrap();

    assert_eq!(conn.get("job:missing").await.unwrap(), None);

    conn.put("job:1", &json!({"status": "pending"})).await.unwrap();
    assert_eq!(
        conn.get("job:1").await.unwrap(),
        Some(json!({"status": "pending"}))
    );
}

#[tokio::test]
async fn upsert_replaces_and_inserts_in_one_batch() {
    let (_db, config, _container) = setup_test_db().await;
    let manager = PgConnectionManager::new(&config).unwrap();
    let mut conn = manager.connect().await.unwrap();

    conn.put("job:1", &json!({"status": "running"})).await.unwrap();
    let written = conn
        .upsert(&[
            ("job:1".into(), json!({"status": "completed"})),
            ("outcome:1:p-1".into(), json!({"success": true})),
            ("outcome:1:p-2".into(), json!({"success": false})),
        ])
        .await
        .unwrap();

    assert_eq!(written, 3);
    assert_eq!(
        conn.get("job:1").await.unwrap(),
        Some(json!({"status": "completed"}))
    );
    assert!(conn.get("outcome:1:p-2").await.unwrap().is_some());
}

#[tokio::test]
async fn pooled_connections_pass_health_probe() {
    let (db, _config, _container) = setup_test_db().await;
    let pool = db
        .record_pool(PoolConfig::default().with_sizes(1, 3, 0))
        .await
        .unwrap();

    {
        let mut a = pool.acquire_default().await.unwrap();
        let mut b = pool.acquire_default().await.unwrap();
        a.put("k:a", &json!(1)).await.unwrap();
        assert_eq!(b.get("k:a").await.unwrap(), Some(json!(1)));
    }

    let stats = pool.stats();
    assert_eq!(stats.active, 0);
    assert!(stats.idle >= 2);
    pool.close();
}

//! Schema created by init_database_pool

mod helpers;

use helpers::{create_test_db, has_column};

#[tokio::test]
async fn test_records_table_columns() {
    let (_dir, pool) = create_test_db().await.unwrap();

    for column in [
        "id",
        "secondary_key",
        "title",
        "classification",
        "category",
        "link",
        "coarse_score",
        "coarse_votes",
        "detail",
        "status",
        "is_candidate",
        "stale_after",
        "last_error",
        "retry_count",
    ] {
        assert!(has_column(&pool, "records", column).await.unwrap(), "missing records.{}", column);
    }
}

#[tokio::test]
async fn test_checkpoint_table_columns() {
    let (_dir, pool) = create_test_db().await.unwrap();

    for column in ["batch_key", "state", "record_count", "updated_at"] {
        assert!(has_column(&pool, "run_checkpoints", column).await.unwrap());
    }
}

#[tokio::test]
async fn test_reopen_keeps_data() {
    let (dir, pool) = create_test_db().await.unwrap();
    helpers::seed_records(&pool, &[helpers::done_record("keep", "I", 8.0, 20)])
        .await
        .unwrap();
    pool.close().await;

    let reopened = bibscout_enrich::db::init_database_pool(&dir.path().join("test_bibscout.db"))
        .await
        .unwrap();
    let record = helpers::stored(&reopened, "keep").await;
    assert_eq!(record.coarse_votes, Some(20));
}

use crate::db::*;
use crate::types::EntityId;
use tempfile::NamedTempFile;

#[tokio::test]
async fn test_shutdown_state_initial() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    assert!(
        db.was_unclean_shutdown().await.unwrap(),
        "a fresh database has no clean shutdown recorded"
    );
    db.close().await;
}

#[tokio::test]
async fn test_shutdown_state_unclean_detection() {
    let temp_file = NamedTempFile::new().unwrap();

    // start without shutting down, as after a crash
    {
        let db = Database::new(temp_file.path()).await.unwrap();
        db.set_clean_start().await.unwrap();
        db.close().await;
    }

    {
        let db = Database::new(temp_file.path()).await.unwrap();
        assert!(db.was_unclean_shutdown().await.unwrap());
        db.set_clean_start().await.unwrap();
        db.set_clean_shutdown().await.unwrap();
        db.close().await;
    }

    {
        let db = Database::new(temp_file.path()).await.unwrap();
        assert!(!db.was_unclean_shutdown().await.unwrap());
        db.close().await;
    }
}

#[tokio::test]
async fn test_next_id_never_below_stored_rows() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    assert_eq!(db.load_next_id().await.unwrap(), None);

    db.save_next_id(EntityId(5)).await.unwrap();
    assert_eq!(db.load_next_id().await.unwrap(), Some(EntityId(5)));

    sqlx::query("INSERT INTO files (id, data) VALUES (9, '{}')")
        .execute(db.pool())
        .await
        .unwrap();
    assert_eq!(db.load_next_id().await.unwrap(), Some(EntityId(10)));
    db.close().await;
}

//! Pagination checkpoints.
//!
//! The coordinator stores the cursor of the next unprocessed page after
//! every fully processed page, keyed by pipeline (`"classify:inbox"`,
//! `"mirror:task"`, ...). A finished pass clears its checkpoint.

use sqlx::SqlitePool;

use crate::error::Result;

pub async fn get_checkpoint(pool: &SqlitePool, source: &str) -> Result<Option<String>> {
    let cursor: Option<String> =
        sqlx::query_scalar("SELECT cursor FROM checkpoints WHERE source = ?")
            .bind(source)
            .fetch_optional(pool)
            .await?;
    Ok(cursor)
}

pub async fn set_checkpoint(pool: &SqlitePool, source: &str, cursor: &str) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO checkpoints (source, cursor, updated_at) VALUES (?, ?, ?)
        ON CONFLICT(source) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at
        "#,
    )
    .bind(source)
    .bind(cursor)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn clear_checkpoint(pool: &SqlitePool, source: &str) -> Result<()> {
    sqlx::query("DELETE FROM checkpoints WHERE source = ?")
        .bind(source)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};

    #[tokio::test]
    async fn set_get_clear() {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::connect_path(&dir.path().join("prism.sqlite")).await.unwrap();
        migrate::apply(&pool).await.unwrap();

        assert_eq!(get_checkpoint(&pool, "classify:inbox").await.unwrap(), None);
        set_checkpoint(&pool, "classify:inbox", "cursor-1").await.unwrap();
        set_checkpoint(&pool, "classify:inbox", "cursor-2").await.unwrap();
        assert_eq!(
            get_checkpoint(&pool, "classify:inbox").await.unwrap().as_deref(),
            Some("cursor-2")
        );
        clear_checkpoint(&pool, "classify:inbox").await.unwrap();
        assert_eq!(get_checkpoint(&pool, "classify:inbox").await.unwrap(), None);
    }
}

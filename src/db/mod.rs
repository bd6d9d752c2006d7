pub mod models;
pub mod queries;

use anyhow::Result;
use sqlx::{Pool, Sqlite, SqlitePool};

pub async fn init_pool(database_url: &str) -> Result<Pool<Sqlite>> {
    let pool = SqlitePool::connect(database_url).await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}


#[cfg(test)]
pub async fn test_pool() -> Pool<Sqlite> {
    use sqlx::sqlite::SqlitePoolOptions;

    // A single connection keeps the in-memory database shared across all
    // acquires in a test.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations");

    pool
}

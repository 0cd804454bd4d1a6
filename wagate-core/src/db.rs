use crate::config::DatabaseConfig;
use sqlx::{postgres::PgPoolOptions, PgPool};

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await
}

pub async fn health_check(pool: &PgPool) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT version()").fetch_one(pool).await?;
    Ok(row.0)
}

/// Self-migrating schema bootstrap, run once at startup.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS sessions (
            id BIGSERIAL PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            session_name TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'DISCONNECTED',
            number TEXT NOT NULL DEFAULT '',
            profile_name TEXT NOT NULL DEFAULT '',
            profile_pic TEXT NOT NULL DEFAULT '',
            profile_status TEXT NOT NULL DEFAULT '',
            qr_code TEXT NOT NULL DEFAULT '',
            reject_call BOOLEAN NOT NULL DEFAULT FALSE,
            msg_call TEXT NOT NULL DEFAULT '',
            groups_ignore BOOLEAN NOT NULL DEFAULT FALSE,
            always_online BOOLEAN NOT NULL DEFAULT FALSE,
            read_messages BOOLEAN NOT NULL DEFAULT FALSE,
            read_status BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS sessions_tenant_idx \
         ON sessions (tenant_id, id DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

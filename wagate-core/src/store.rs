//! Session persistence.
//!
//! `SessionStore` is the seam between the reconciliation/lifecycle logic and
//! storage. `PgSessionStore` is the production Postgres implementation;
//! `MemorySessionStore` backs tests and ephemeral single-process
//! deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::Mutex;

use crate::error::WagateError;
use crate::models::session::{ConnectionStatus, Session, SettingsFlags};

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// The tenant's authoritative session, newest row by id when legacy
    /// duplicates exist.
    async fn get(&self, tenant_id: &str) -> Result<Option<Session>, WagateError>;

    /// Update the tenant's existing row, or insert one when absent.
    async fn upsert(&self, session: &Session) -> Result<(), WagateError>;

    /// Remove the tenant's session record(s).
    async fn clear(&self, tenant_id: &str) -> Result<(), WagateError>;
}

// ============================================================================
// Postgres implementation
// ============================================================================

#[derive(Debug, Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: i64,
    tenant_id: String,
    session_name: String,
    status: String,
    number: String,
    profile_name: String,
    profile_pic: String,
    profile_status: String,
    qr_code: String,
    reject_call: bool,
    msg_call: String,
    groups_ignore: bool,
    always_online: bool,
    read_messages: bool,
    read_status: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Session {
            id: row.id,
            tenant_id: row.tenant_id,
            session_name: row.session_name,
            status: ConnectionStatus::parse(&row.status),
            number: row.number,
            profile_name: row.profile_name,
            profile_pic: row.profile_pic,
            profile_status: row.profile_status,
            qr_code: row.qr_code,
            settings: SettingsFlags {
                reject_call: row.reject_call,
                msg_call: row.msg_call,
                groups_ignore: row.groups_ignore,
                always_online: row.always_online,
                read_messages: row.read_messages,
                read_status: row.read_status,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const SESSION_COLUMNS: &str = "id, tenant_id, session_name, status, number, \
     profile_name, profile_pic, profile_status, qr_code, reject_call, \
     msg_call, groups_ignore, always_online, read_messages, read_status, \
     created_at, updated_at";

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn get(&self, tenant_id: &str) -> Result<Option<Session>, WagateError> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE tenant_id = $1 \
             ORDER BY id DESC LIMIT 1"
        );
        let row: Option<SessionRow> = sqlx::query_as(&query)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Session::from))
    }

    async fn upsert(&self, session: &Session) -> Result<(), WagateError> {
        let updated = sqlx::query(
            "UPDATE sessions SET session_name = $2, status = $3, number = $4, \
             profile_name = $5, profile_pic = $6, profile_status = $7, \
             qr_code = $8, reject_call = $9, msg_call = $10, \
             groups_ignore = $11, always_online = $12, read_messages = $13, \
             read_status = $14, updated_at = NOW() \
             WHERE id = (SELECT id FROM sessions WHERE tenant_id = $1 \
                         ORDER BY id DESC LIMIT 1)",
        )
        .bind(&session.tenant_id)
        .bind(&session.session_name)
        .bind(session.status.as_str())
        .bind(&session.number)
        .bind(&session.profile_name)
        .bind(&session.profile_pic)
        .bind(&session.profile_status)
        .bind(&session.qr_code)
        .bind(session.settings.reject_call)
        .bind(&session.settings.msg_call)
        .bind(session.settings.groups_ignore)
        .bind(session.settings.always_online)
        .bind(session.settings.read_messages)
        .bind(session.settings.read_status)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            sqlx::query(
                "INSERT INTO sessions (tenant_id, session_name, status, \
                 number, profile_name, profile_pic, profile_status, qr_code, \
                 reject_call, msg_call, groups_ignore, always_online, \
                 read_messages, read_status) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, \
                 $13, $14)",
            )
            .bind(&session.tenant_id)
            .bind(&session.session_name)
            .bind(session.status.as_str())
            .bind(&session.number)
            .bind(&session.profile_name)
            .bind(&session.profile_pic)
            .bind(&session.profile_status)
            .bind(&session.qr_code)
            .bind(session.settings.reject_call)
            .bind(&session.settings.msg_call)
            .bind(session.settings.groups_ignore)
            .bind(session.settings.always_online)
            .bind(session.settings.read_messages)
            .bind(session.settings.read_status)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    async fn clear(&self, tenant_id: &str) -> Result<(), WagateError> {
        sqlx::query("DELETE FROM sessions WHERE tenant_id = $1")
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Default)]
pub struct MemorySessionStore {
    inner: Mutex<HashMap<String, Session>>,
    next_id: AtomicI64,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, tenant_id: &str) -> Result<Option<Session>, WagateError> {
        let map = self.inner.lock().await;
        Ok(map.get(tenant_id).cloned())
    }

    async fn upsert(&self, session: &Session) -> Result<(), WagateError> {
        let mut map = self.inner.lock().await;
        let mut stored = session.clone();
        stored.updated_at = Utc::now();
        match map.get(&session.tenant_id) {
            Some(existing) => {
                stored.id = existing.id;
                stored.created_at = existing.created_at;
            }
            None => {
                stored.id = self.next_id.fetch_add(1, Ordering::Relaxed);
                stored.created_at = stored.updated_at;
            }
        }
        map.insert(stored.tenant_id.clone(), stored);
        Ok(())
    }

    async fn clear(&self, tenant_id: &str) -> Result<(), WagateError> {
        let mut map = self.inner.lock().await;
        map.remove(tenant_id);
        Ok(())
    }
}

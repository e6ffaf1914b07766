//! Persisted [`DeviceSyncState`].

use crate::db::{opt_from_millis, to_millis, Pool};
use crate::error::{ClientError, Result};
use sqlx::{Row, SqliteConnection};
use tillsync_engine::{DeviceId, DeviceStatus, DeviceSyncState};

#[derive(Debug, Clone)]
pub struct DeviceStateStore {
    pool: Pool,
    device_id: DeviceId,
}

impl DeviceStateStore {
    pub fn new(pool: Pool, device_id: impl Into<DeviceId>) -> Self {
        Self {
            pool,
            device_id: device_id.into(),
        }
    }

    /// Current state, or a fresh one for a device that never synced.
    pub async fn load(&self) -> Result<DeviceSyncState> {
        let mut conn = self.pool.acquire().await?;
        Self::load_in(&mut conn, &self.device_id).await
    }

    pub async fn load_in(conn: &mut SqliteConnection, device_id: &str) -> Result<DeviceSyncState> {
        let row = sqlx::query(
            r#"
            SELECT last_successful_sync_at, last_acked_sequence, status, last_error, schema_blocked
            FROM device_sync_state
            WHERE device_id = ?
            "#,
        )
        .bind(device_id)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(row) = row else {
            return Ok(DeviceSyncState::new(device_id));
        };
        let status: String = row.try_get("status")?;
        Ok(DeviceSyncState {
            device_id: device_id.to_string(),
            last_successful_sync_at: opt_from_millis(row.try_get("last_successful_sync_at")?)?,
            last_acked_sequence: row.try_get::<i64, _>("last_acked_sequence")? as u64,
            status: DeviceStatus::parse(&status)
                .ok_or_else(|| ClientError::CorruptRow(format!("device status {status}")))?,
            last_error: row.try_get("last_error")?,
            schema_blocked: row.try_get("schema_blocked")?,
        })
    }

    /// Update the live indicators without touching the cursor.
    pub async fn set_status(
        &self,
        status: DeviceStatus,
        last_error: Option<&str>,
        schema_blocked: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO device_sync_state (device_id, status, last_error, schema_blocked)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (device_id) DO UPDATE SET
                status = excluded.status,
                last_error = excluded.last_error,
                schema_blocked = excluded.schema_blocked
            "#,
        )
        .bind(&self.device_id)
        .bind(status.as_str())
        .bind(last_error)
        .bind(schema_blocked)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Write the whole state, cursor included. Callers run this in the
    /// transaction that applied the pulled changes.
    pub async fn commit_in(conn: &mut SqliteConnection, state: &DeviceSyncState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO device_sync_state (
                device_id, last_successful_sync_at, last_acked_sequence,
                status, last_error, schema_blocked
            )
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (device_id) DO UPDATE SET
                last_successful_sync_at = excluded.last_successful_sync_at,
                last_acked_sequence = excluded.last_acked_sequence,
                status = excluded.status,
                last_error = excluded.last_error,
                schema_blocked = excluded.schema_blocked
            "#,
        )
        .bind(&state.device_id)
        .bind(state.last_successful_sync_at.map(to_millis))
        .bind(state.last_acked_sequence as i64)
        .bind(state.status.as_str())
        .bind(&state.last_error)
        .bind(state.schema_blocked)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }
}

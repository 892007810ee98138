use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use sqlx::PgPool;

use crate::error::SettingsError;
use crate::model::Settings;
use crate::settings_store::SettingsStore;

const SETTINGS_ROW_ID: i32 = 1;

type SettingsRow = (i32, i64, f64, i64, Option<i64>, Option<String>, DateTime<Utc>);

pub struct PostgresSettingsStore {
    pool: PgPool,
}

impl PostgresSettingsStore {
    /// Connect to Postgres at `connection_string` and run migrations.
    pub async fn connect(connection_string: &str) -> Result<Self, Report<SettingsError>> {
        let pool = PgPool::connect(connection_string)
            .await
            .change_context(SettingsError::Migration)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .change_context(SettingsError::Migration)?;

        Ok(Self { pool })
    }
}

impl SettingsStore for PostgresSettingsStore {
    fn get(&self) -> BoxFuture<'_, Result<Settings, Report<SettingsError>>> {
        Box::pin(async move {
            let row: SettingsRow = sqlx::query_as(
                "SELECT id, interval, min_multiplier, timeout, chat_id, bot_token, created_at \
                 FROM settings WHERE id = $1",
            )
            .bind(SETTINGS_ROW_ID)
            .fetch_one(&self.pool)
            .await
            .change_context(SettingsError::Query)?;

            Ok(Settings {
                id: row.0,
                interval_seconds: row.1,
                min_multiplier: row.2,
                timeout_seconds: row.3,
                chat_id: row.4,
                bot_token: row.5,
                created_at: row.6,
            })
        })
    }

    fn create_if_absent(&self) -> BoxFuture<'_, Result<(), Report<SettingsError>>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO settings (id, interval, min_multiplier, timeout, created_at) \
                 VALUES ($1, 60, 50.0, 60, now()) \
                 ON CONFLICT (id) DO NOTHING",
            )
            .bind(SETTINGS_ROW_ID)
            .execute(&self.pool)
            .await
            .change_context(SettingsError::Insert)?;

            Ok(())
        })
    }
}

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::error::{Error, Result};
use crate::storage::{LauncherStorage, LayerStorage, NetworkStorage};
use crate::types::{EnvVarsInstanceInfo, InstanceData, InstanceIdent, InstanceInfo, LayerData, LayerState, NetworkInfo};

const KEY_OPERATION_VERSION: &str = "operation_version";
const KEY_OVERRIDE_ENV_VARS: &str = "override_env_vars";
const KEY_ONLINE_TIME: &str = "online_time";

/// SQLite-backed implementation of all subsystem storage traits over one
/// connection pool.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn new(database_path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", database_path.display()))
            .map_err(|err| Error::invalid_argument(format!("bad database path: {err}")))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new().max_connections(4).connect_with(options).await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        tracing::info!(path = %database_path.display(), "storage initialized");

        Ok(storage)
    }

    /// In-memory database for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:").unwrap())
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn initialize_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                service_id TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                instance INTEGER NOT NULL,
                instance_id TEXT NOT NULL,
                info TEXT NOT NULL,
                PRIMARY KEY (service_id, subject_id, instance)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS layers (
                digest TEXT PRIMARY KEY,
                layer_id TEXT NOT NULL,
                version TEXT NOT NULL,
                path TEXT NOT NULL,
                os_version TEXT NOT NULL,
                size INTEGER NOT NULL,
                state TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS networks (
                network_id TEXT PRIMARY KEY,
                subnet TEXT NOT NULL,
                ip TEXT NOT NULL,
                vlan_id INTEGER NOT NULL,
                vlan_if_name TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS traffic (
                chain TEXT PRIMARY KEY,
                time INTEGER NOT NULL,
                value INTEGER NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_config_value(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO config (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_config_value(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(value)
    }
}

#[async_trait]
impl LauncherStorage for SqliteStorage {
    async fn add_instance(&self, instance: &InstanceData) -> Result<()> {
        let info = serde_json::to_string(&instance.info)?;

        sqlx::query(
            r#"
            INSERT INTO instances (service_id, subject_id, instance, instance_id, info)
            VALUES (?, ?, ?, ?, ?)
        "#,
        )
        .bind(&instance.info.ident.service_id)
        .bind(&instance.info.ident.subject_id)
        .bind(instance.info.ident.instance as i64)
        .bind(&instance.instance_id)
        .bind(info)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_instance(&self, instance: &InstanceData) -> Result<()> {
        let info = serde_json::to_string(&instance.info)?;

        let result = sqlx::query(
            r#"
            UPDATE instances SET instance_id = ?, info = ?
            WHERE service_id = ? AND subject_id = ? AND instance = ?
        "#,
        )
        .bind(&instance.instance_id)
        .bind(info)
        .bind(&instance.info.ident.service_id)
        .bind(&instance.info.ident.subject_id)
        .bind(instance.info.ident.instance as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("instance {} not stored", instance.info.ident)));
        }

        Ok(())
    }

    async fn remove_instance(&self, ident: &InstanceIdent) -> Result<()> {
        sqlx::query("DELETE FROM instances WHERE service_id = ? AND subject_id = ? AND instance = ?")
            .bind(&ident.service_id)
            .bind(&ident.subject_id)
            .bind(ident.instance as i64)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_all_instances(&self) -> Result<Vec<InstanceData>> {
        let rows = sqlx::query("SELECT instance_id, info FROM instances ORDER BY service_id, subject_id, instance")
            .fetch_all(&self.pool)
            .await?;

        let mut instances = Vec::with_capacity(rows.len());

        for row in rows {
            let info: InstanceInfo = serde_json::from_str(row.get("info"))?;

            instances.push(InstanceData { info, instance_id: row.get("instance_id") });
        }

        Ok(instances)
    }

    async fn get_operation_version(&self) -> Result<Option<u64>> {
        let value = self.get_config_value(KEY_OPERATION_VERSION).await?;

        value
            .map(|raw| {
                raw.parse::<u64>()
                    .map_err(|_| Error::runtime(format!("bad operation version: {raw}")))
            })
            .transpose()
    }

    async fn set_operation_version(&self, version: u64) -> Result<()> {
        self.set_config_value(KEY_OPERATION_VERSION, &version.to_string()).await
    }

    async fn get_override_env_vars(&self) -> Result<Vec<EnvVarsInstanceInfo>> {
        match self.get_config_value(KEY_OVERRIDE_ENV_VARS).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    async fn set_override_env_vars(&self, env_vars: &[EnvVarsInstanceInfo]) -> Result<()> {
        let raw = serde_json::to_string(env_vars)?;

        self.set_config_value(KEY_OVERRIDE_ENV_VARS, &raw).await
    }

    async fn get_online_time(&self) -> Result<Option<DateTime<Utc>>> {
        let value = self.get_config_value(KEY_ONLINE_TIME).await?;

        value
            .map(|raw| {
                let secs = raw
                    .parse::<i64>()
                    .map_err(|_| Error::runtime(format!("bad online time: {raw}")))?;

                Utc.timestamp_opt(secs, 0)
                    .single()
                    .ok_or_else(|| Error::runtime(format!("bad online time: {raw}")))
            })
            .transpose()
    }

    async fn set_online_time(&self, time: DateTime<Utc>) -> Result<()> {
        self.set_config_value(KEY_ONLINE_TIME, &time.timestamp().to_string()).await
    }
}

#[async_trait]
impl LayerStorage for SqliteStorage {
    async fn add_layer(&self, layer: &LayerData) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO layers (digest, layer_id, version, path, os_version, size, state, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        )
        .bind(&layer.layer_digest)
        .bind(&layer.layer_id)
        .bind(&layer.version)
        .bind(layer.path.to_string_lossy().into_owned())
        .bind(&layer.os_version)
        .bind(layer.size as i64)
        .bind(layer.state.to_string())
        .bind(layer.timestamp.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_layer(&self, layer: &LayerData) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE layers SET layer_id = ?, version = ?, path = ?, os_version = ?, size = ?, state = ?, timestamp = ?
            WHERE digest = ?
        "#,
        )
        .bind(&layer.layer_id)
        .bind(&layer.version)
        .bind(layer.path.to_string_lossy().into_owned())
        .bind(&layer.os_version)
        .bind(layer.size as i64)
        .bind(layer.state.to_string())
        .bind(layer.timestamp.timestamp())
        .bind(&layer.layer_digest)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("layer {} not stored", layer.layer_digest)));
        }

        Ok(())
    }

    async fn remove_layer(&self, digest: &str) -> Result<()> {
        sqlx::query("DELETE FROM layers WHERE digest = ?")
            .bind(digest)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_layer(&self, digest: &str) -> Result<LayerData> {
        let row = sqlx::query("SELECT * FROM layers WHERE digest = ?")
            .bind(digest)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found(format!("layer {digest} not found")))?;

        layer_from_row(&row)
    }

    async fn get_all_layers(&self) -> Result<Vec<LayerData>> {
        let rows = sqlx::query("SELECT * FROM layers ORDER BY timestamp")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(layer_from_row).collect()
    }
}

fn layer_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<LayerData> {
    let state: String = row.get("state");
    let timestamp: i64 = row.get("timestamp");
    let size: i64 = row.get("size");
    let path: String = row.get("path");

    Ok(LayerData {
        layer_digest: row.get("digest"),
        layer_id: row.get("layer_id"),
        version: row.get("version"),
        path: path.into(),
        os_version: row.get("os_version"),
        size: size as u64,
        state: state.parse::<LayerState>()?,
        timestamp: Utc
            .timestamp_opt(timestamp, 0)
            .single()
            .ok_or_else(|| Error::runtime(format!("bad layer timestamp: {timestamp}")))?,
    })
}

#[async_trait]
impl NetworkStorage for SqliteStorage {
    async fn add_network_info(&self, info: &NetworkInfo) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO networks (network_id, subnet, ip, vlan_id, vlan_if_name)
            VALUES (?, ?, ?, ?, ?)
        "#,
        )
        .bind(&info.network_id)
        .bind(&info.subnet)
        .bind(&info.ip)
        .bind(info.vlan_id as i64)
        .bind(&info.vlan_if_name)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove_network_info(&self, network_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM networks WHERE network_id = ?")
            .bind(network_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_networks_info(&self) -> Result<Vec<NetworkInfo>> {
        let rows = sqlx::query("SELECT * FROM networks ORDER BY network_id")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let vlan_id: i64 = row.get("vlan_id");

                NetworkInfo {
                    network_id: row.get("network_id"),
                    subnet: row.get("subnet"),
                    ip: row.get("ip"),
                    vlan_id: vlan_id as u64,
                    vlan_if_name: row.get("vlan_if_name"),
                }
            })
            .collect())
    }

    async fn set_traffic_monitor_data(&self, chain: &str, time: DateTime<Utc>, value: u64) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO traffic (chain, time, value) VALUES (?, ?, ?)")
            .bind(chain)
            .bind(time.timestamp())
            .bind(value as i64)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_traffic_monitor_data(&self, chain: &str) -> Result<(DateTime<Utc>, u64)> {
        let row = sqlx::query("SELECT time, value FROM traffic WHERE chain = ?")
            .bind(chain)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found(format!("no traffic data for chain {chain}")))?;

        let time: i64 = row.get("time");
        let value: i64 = row.get("value");

        Ok((
            Utc.timestamp_opt(time, 0)
                .single()
                .ok_or_else(|| Error::runtime(format!("bad traffic timestamp: {time}")))?,
            value as u64,
        ))
    }

    async fn remove_traffic_monitor_data(&self, chain: &str) -> Result<()> {
        sqlx::query("DELETE FROM traffic WHERE chain = ?")
            .bind(chain)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use async_trait::async_trait;
use scanfleet_common::keys;
use scanfleet_common::records::{ProcessRecord, RunningTarget, TargetLockHolder, WorkerAddress};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{CleanupScope, CoordinationStore, StoreError, parse_pid, parse_running_target, ttl_secs};

/// Redis backend shared by every worker of the fleet.
#[derive(Clone)]
pub struct RedisStore {
    connection_manager: ConnectionManager,
    tool: String,
}

impl RedisStore {
    pub async fn connect(url: &str, tool: impl Into<String>) -> Result<Self, StoreError> {
        let client = ::redis::Client::open(url)?;
        let connection_manager = ConnectionManager::new(client).await?;
        Self::from_manager(connection_manager, tool).await
    }

    pub async fn from_manager(
        connection_manager: ConnectionManager,
        tool: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let mut conn = connection_manager.clone();
        ::redis::cmd("PING").query_async::<String>(&mut conn).await?;
        debug!("Connected to coordination store");

        Ok(Self {
            connection_manager,
            tool: tool.into(),
        })
    }

    /// A connection for callers that speak to the same Redis directly (job intake).
    pub fn connection(&self) -> ConnectionManager {
        self.connection_manager.clone()
    }

    fn registry_key(&self, host: &str) -> String {
        keys::running_tool(&self.tool, host)
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn acquire_target_lock(
        &self,
        project: &Uuid,
        ip: &IpAddr,
        holder: &TargetLockHolder,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection();
        let value: String = serde_json::to_string(holder)?;

        let reply: Option<String> = ::redis::cmd("SET")
            .arg(keys::target_lock(project, ip))
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;

        Ok(reply.is_some())
    }

    async fn release_target_lock(&self, project: &Uuid, ip: &IpAddr) -> Result<(), StoreError> {
        let mut conn = self.connection();
        ::redis::cmd("DEL")
            .arg(keys::target_lock(project, ip))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn target_lock_holder(
        &self,
        project: &Uuid,
        ip: &IpAddr,
    ) -> Result<Option<TargetLockHolder>, StoreError> {
        let mut conn = self.connection();
        let value: Option<String> = ::redis::cmd("GET")
            .arg(keys::target_lock(project, ip))
            .query_async(&mut conn)
            .await?;

        match value {
            Some(json) => match serde_json::from_str(&json) {
                Ok(holder) => Ok(Some(holder)),
                Err(e) => {
                    warn!("Target lock for {ip} holds an unreadable value: {e}");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn track_process(&self, record: &ProcessRecord) -> Result<(), StoreError> {
        let mut conn = self.connection();
        ::redis::cmd("HSET")
            .arg(self.registry_key(&record.host))
            .arg(&record.job_id)
            .arg(record.pid)
            .query_async::<()>(&mut conn)
            .await?;
        debug!("Tracking pid {} for job {}", record.pid, record.job_id);
        Ok(())
    }

    async fn untrack_process(&self, job_id: &str, host: &str) -> Result<(), StoreError> {
        let mut conn = self.connection();
        ::redis::cmd("HDEL")
            .arg(self.registry_key(host))
            .arg(job_id)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn lookup_process(&self, job_id: &str, host: &str) -> Result<Option<u32>, StoreError> {
        let mut conn = self.connection();
        let value: Option<String> = ::redis::cmd("HGET")
            .arg(self.registry_key(host))
            .arg(job_id)
            .query_async(&mut conn)
            .await?;
        Ok(value.and_then(|raw| parse_pid(job_id, &raw)))
    }

    async fn list_processes(&self, host: &str) -> Result<Vec<ProcessRecord>, StoreError> {
        let mut conn = self.connection();
        let entries: HashMap<String, String> = ::redis::cmd("HGETALL")
            .arg(self.registry_key(host))
            .query_async(&mut conn)
            .await?;

        let mut records: Vec<ProcessRecord> = entries
            .into_iter()
            .filter_map(|(job_id, raw)| {
                let pid: u32 = parse_pid(&job_id, &raw)?;
                Some(ProcessRecord::new(job_id, pid, host))
            })
            .collect();
        records.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        Ok(records)
    }

    async fn add_running_target(
        &self,
        project: &Uuid,
        entry: &RunningTarget,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection();
        ::redis::cmd("RPUSH")
            .arg(keys::running_targets(project))
            .arg(serde_json::to_string(entry)?)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove_running_target(
        &self,
        project: &Uuid,
        ip: &IpAddr,
        worker: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection();
        let key: String = keys::running_targets(project);
        let raw_entries: Vec<String> = ::redis::cmd("LRANGE")
            .arg(&key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;

        let Some(raw) = raw_entries.into_iter().find(|raw| {
            parse_running_target(raw).is_some_and(|entry| entry.matches(ip, worker))
        }) else {
            return Ok(false);
        };

        let removed: i64 = ::redis::cmd("LREM")
            .arg(&key)
            .arg(1)
            .arg(raw)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn running_targets(&self, project: &Uuid) -> Result<Vec<RunningTarget>, StoreError> {
        let mut conn = self.connection();
        let raw_entries: Vec<String> = ::redis::cmd("LRANGE")
            .arg(keys::running_targets(project))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(raw_entries
            .iter()
            .filter_map(|raw| parse_running_target(raw))
            .collect())
    }

    async fn record_running_task(
        &self,
        job_id: &str,
        host: &str,
        entry: &RunningTarget,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection();
        ::redis::cmd("RPUSH")
            .arg(keys::running_tasks(job_id, host))
            .arg(serde_json::to_string(entry)?)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn cleanup_job(&self, scope: &CleanupScope) -> Result<(), StoreError> {
        let mut conn = self.connection();
        ::redis::pipe()
            .atomic()
            .cmd("HDEL")
            .arg(self.registry_key(&scope.host))
            .arg(&scope.job_id)
            .ignore()
            .cmd("DEL")
            .arg(keys::running_tasks(&scope.job_id, &scope.host))
            .ignore()
            .cmd("SREM")
            .arg(keys::project_task_ids(&scope.project))
            .arg(&scope.job_id)
            .ignore()
            .cmd("SREM")
            .arg(keys::user_task_ids(&scope.user))
            .arg(&scope.job_id)
            .ignore()
            .cmd("SREM")
            .arg(keys::project_ip_task_ids(&scope.project, &scope.ip))
            .arg(&scope.job_id)
            .ignore()
            .cmd("DEL")
            .arg(keys::target_lock(&scope.project, &scope.ip))
            .ignore()
            .cmd("DEL")
            .arg(keys::task_metadata(&self.tool, &scope.job_id))
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        info!(
            "Cleaned up job {} for {} (ports {})",
            scope.job_id, scope.ip, scope.port_set
        );
        Ok(())
    }

    async fn register_worker_address(
        &self,
        host: &str,
        address: &WorkerAddress,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection();
        ::redis::cmd("SETEX")
            .arg(keys::worker_address(host))
            .arg(ttl_secs(ttl))
            .arg(serde_json::to_string(address)?)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn worker_address(&self, host: &str) -> Result<Option<WorkerAddress>, StoreError> {
        let mut conn = self.connection();
        let value: Option<String> = ::redis::cmd("GET")
            .arg(keys::worker_address(host))
            .query_async(&mut conn)
            .await?;
        Ok(match value {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        })
    }
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝

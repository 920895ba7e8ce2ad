use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use scanfleet_common::job::Job;
use scanfleet_common::keys;
use scanfleet_common::records::{ProcessRecord, RunningTarget, TargetLockHolder, WorkerAddress};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{CleanupScope, CoordinationStore, StoreError, parse_pid, parse_running_target};

/// Single-process store with the same key layout as the Redis backend.
///
/// Each Redis data type gets its own map; empty containers are dropped the
/// way Redis drops empty keys.
#[derive(Clone)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
    tool: String,
}

#[derive(Default)]
struct State {
    strings: HashMap<String, (String, Option<Instant>)>,
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, Vec<String>>,
    sets: HashMap<String, HashSet<String>>,
}

impl State {
    fn get_string(&self, key: &str) -> Option<&str> {
        match self.strings.get(key) {
            Some((value, Some(expires_at))) if *expires_at > Instant::now() => Some(value.as_str()),
            Some((value, None)) => Some(value.as_str()),
            _ => None,
        }
    }

    fn set_string(&mut self, key: String, value: String, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.strings.insert(key, (value, expires_at));
    }

    fn hdel(&mut self, key: &str, field: &str) {
        if let Some(hash) = self.hashes.get_mut(key) {
            hash.remove(field);
            if hash.is_empty() {
                self.hashes.remove(key);
            }
        }
    }

    fn srem(&mut self, key: &str, member: &str) {
        if let Some(set) = self.sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                self.sets.remove(key);
            }
        }
    }

    fn del(&mut self, key: &str) {
        self.strings.remove(key);
        self.hashes.remove(key);
        self.lists.remove(key);
        self.sets.remove(key);
    }

    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.strings
            .retain(|_, (_, expires_at)| expires_at.is_none_or(|at| at > now));
    }
}

impl InMemoryStore {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            tool: tool.into(),
        }
    }

    fn registry_key(&self, host: &str) -> String {
        keys::running_tool(&self.tool, host)
    }

    /// Adds `job` to its project, user and (project, ip) task-id sets, the way
    /// the scheduler does when it enqueues a job.
    pub async fn seed_task_ids(&self, job: &Job) {
        let mut state = self.state.write().await;
        for key in [
            keys::project_task_ids(&job.project),
            keys::user_task_ids(&job.user),
            keys::project_ip_task_ids(&job.project, &job.ip),
        ] {
            state.sets.entry(key).or_default().insert(job.id.clone());
        }
    }

    pub async fn seed_metadata(&self, job_id: &str, value: &str) {
        let mut state = self.state.write().await;
        state.set_string(keys::task_metadata(&self.tool, job_id), value.to_string(), None);
    }

    /// Writes a registry value as-is, valid pid or not.
    pub async fn seed_raw_process(&self, job_id: &str, host: &str, raw_pid: &str) {
        let mut state = self.state.write().await;
        state
            .hashes
            .entry(self.registry_key(host))
            .or_default()
            .insert(job_id.to_string(), raw_pid.to_string());
    }

    /// Appends a running-target entry as-is, valid JSON or not.
    pub async fn seed_raw_running_target(&self, project: &Uuid, raw: &str) {
        let mut state = self.state.write().await;
        state
            .lists
            .entry(keys::running_targets(project))
            .or_default()
            .push(raw.to_string());
    }

    pub async fn task_ids(&self, key: &str) -> HashSet<String> {
        let state = self.state.read().await;
        state.sets.get(key).cloned().unwrap_or_default()
    }

    pub async fn running_tasks(&self, job_id: &str, host: &str) -> Vec<String> {
        let state = self.state.read().await;
        state
            .lists
            .get(&keys::running_tasks(job_id, host))
            .cloned()
            .unwrap_or_default()
    }

    /// Every live key, sorted. Expired entries are purged first.
    pub async fn keys(&self) -> Vec<String> {
        let mut state = self.state.write().await;
        state.purge_expired();

        let mut keys: Vec<String> = state
            .strings
            .keys()
            .chain(state.hashes.keys())
            .chain(state.lists.keys())
            .chain(state.sets.keys())
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    async fn acquire_target_lock(
        &self,
        project: &Uuid,
        ip: &IpAddr,
        holder: &TargetLockHolder,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let value: String = serde_json::to_string(holder)?;
        let key: String = keys::target_lock(project, ip);
        let mut state = self.state.write().await;

        if state.get_string(&key).is_some() {
            return Ok(false);
        }
        state.set_string(key, value, Some(ttl));
        Ok(true)
    }

    async fn release_target_lock(&self, project: &Uuid, ip: &IpAddr) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.del(&keys::target_lock(project, ip));
        Ok(())
    }

    async fn target_lock_holder(
        &self,
        project: &Uuid,
        ip: &IpAddr,
    ) -> Result<Option<TargetLockHolder>, StoreError> {
        let state = self.state.read().await;
        match state.get_string(&keys::target_lock(project, ip)) {
            Some(json) => Ok(Some(serde_json::from_str(json)?)),
            None => Ok(None),
        }
    }

    async fn track_process(&self, record: &ProcessRecord) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state
            .hashes
            .entry(self.registry_key(&record.host))
            .or_default()
            .insert(record.job_id.clone(), record.pid.to_string());
        debug!("Tracking pid {} for job {}", record.pid, record.job_id);
        Ok(())
    }

    async fn untrack_process(&self, job_id: &str, host: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.hdel(&self.registry_key(host), job_id);
        Ok(())
    }

    async fn lookup_process(&self, job_id: &str, host: &str) -> Result<Option<u32>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .hashes
            .get(&self.registry_key(host))
            .and_then(|hash| hash.get(job_id))
            .and_then(|raw| parse_pid(job_id, raw)))
    }

    async fn list_processes(&self, host: &str) -> Result<Vec<ProcessRecord>, StoreError> {
        let state = self.state.read().await;
        let mut records: Vec<ProcessRecord> = state
            .hashes
            .get(&self.registry_key(host))
            .map(|hash| {
                hash.iter()
                    .filter_map(|(job_id, raw)| {
                        Some(ProcessRecord::new(job_id, parse_pid(job_id, raw)?, host))
                    })
                    .collect()
            })
            .unwrap_or_default();
        records.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        Ok(records)
    }

    async fn add_running_target(
        &self,
        project: &Uuid,
        entry: &RunningTarget,
    ) -> Result<(), StoreError> {
        let value: String = serde_json::to_string(entry)?;
        let mut state = self.state.write().await;
        state
            .lists
            .entry(keys::running_targets(project))
            .or_default()
            .push(value);
        Ok(())
    }

    async fn remove_running_target(
        &self,
        project: &Uuid,
        ip: &IpAddr,
        worker: &str,
    ) -> Result<bool, StoreError> {
        let key: String = keys::running_targets(project);
        let mut state = self.state.write().await;
        let Some(list) = state.lists.get_mut(&key) else {
            return Ok(false);
        };

        let Some(position) = list.iter().position(|raw| {
            parse_running_target(raw).is_some_and(|entry| entry.matches(ip, worker))
        }) else {
            return Ok(false);
        };

        list.remove(position);
        if list.is_empty() {
            state.lists.remove(&key);
        }
        Ok(true)
    }

    async fn running_targets(&self, project: &Uuid) -> Result<Vec<RunningTarget>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .lists
            .get(&keys::running_targets(project))
            .map(|list| list.iter().filter_map(|raw| parse_running_target(raw)).collect())
            .unwrap_or_default())
    }

    async fn record_running_task(
        &self,
        job_id: &str,
        host: &str,
        entry: &RunningTarget,
    ) -> Result<(), StoreError> {
        let value: String = serde_json::to_string(entry)?;
        let mut state = self.state.write().await;
        state
            .lists
            .entry(keys::running_tasks(job_id, host))
            .or_default()
            .push(value);
        Ok(())
    }

    async fn cleanup_job(&self, scope: &CleanupScope) -> Result<(), StoreError> {
        // One write guard for the whole batch: readers see all of it or none.
        let mut state = self.state.write().await;
        state.hdel(&self.registry_key(&scope.host), &scope.job_id);
        state.del(&keys::running_tasks(&scope.job_id, &scope.host));
        state.srem(&keys::project_task_ids(&scope.project), &scope.job_id);
        state.srem(&keys::user_task_ids(&scope.user), &scope.job_id);
        state.srem(
            &keys::project_ip_task_ids(&scope.project, &scope.ip),
            &scope.job_id,
        );
        state.del(&keys::target_lock(&scope.project, &scope.ip));
        state.del(&keys::task_metadata(&self.tool, &scope.job_id));
        Ok(())
    }

    async fn register_worker_address(
        &self,
        host: &str,
        address: &WorkerAddress,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let value: String = serde_json::to_string(address)?;
        let mut state = self.state.write().await;
        state.set_string(keys::worker_address(host), value, Some(ttl));
        Ok(())
    }

    async fn worker_address(&self, host: &str) -> Result<Option<WorkerAddress>, StoreError> {
        let state = self.state.read().await;
        match state.get_string(&keys::worker_address(host)) {
            Some(json) => Ok(Some(serde_json::from_str(json)?)),
            None => Ok(None),
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use scanfleet_common::job::ImportMode;

    const HOST: &str = "worker-a";

    fn job() -> Job {
        Job {
            id: "job-42".into(),
            ip: "10.0.0.5".parse().unwrap(),
            hostnames: vec!["db1.internal".into()],
            project: Uuid::new_v4(),
            user: "alice".into(),
            discovery_opts: "-p- --open".into(),
            enrichment_opts: "-sV".into(),
            timeout_secs: 60,
            include_enrichment: true,
            mode: ImportMode::Insert,
        }
    }

    fn holder(worker: &str) -> TargetLockHolder {
        TargetLockHolder {
            worker: worker.into(),
            job_id: "job-42".into(),
            ports: "-".into(),
        }
    }

    #[tokio::test]
    async fn lock_is_mutually_exclusive() {
        let store = InMemoryStore::new("nmap");
        let job = job();
        let ttl = Duration::from_secs(60);

        assert!(store.acquire_target_lock(&job.project, &job.ip, &holder("a"), ttl).await.unwrap());
        assert!(!store.acquire_target_lock(&job.project, &job.ip, &holder("b"), ttl).await.unwrap());
        assert_eq!(
            store.target_lock_holder(&job.project, &job.ip).await.unwrap(),
            Some(holder("a"))
        );

        // a different project does not contend
        let other = Uuid::new_v4();
        assert!(store.acquire_target_lock(&other, &job.ip, &holder("b"), ttl).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_acquires_have_one_winner() {
        let store = InMemoryStore::new("nmap");
        let job = job();

        let attempts = (0..16).map(|n| {
            let store = store.clone();
            let job = job.clone();
            tokio::spawn(async move {
                store
                    .acquire_target_lock(
                        &job.project,
                        &job.ip,
                        &holder(&format!("w{n}")),
                        Duration::from_secs(60),
                    )
                    .await
                    .unwrap()
            })
        });

        let mut winners = 0;
        for attempt in attempts.collect::<Vec<_>>() {
            if attempt.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn lock_expires_after_ttl() {
        let store = InMemoryStore::new("nmap");
        let job = job();

        assert!(
            store
                .acquire_target_lock(&job.project, &job.ip, &holder("a"), Duration::from_millis(50))
                .await
                .unwrap()
        );
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(store.target_lock_holder(&job.project, &job.ip).await.unwrap().is_none());
        assert!(
            store
                .acquire_target_lock(&job.project, &job.ip, &holder("b"), Duration::from_secs(60))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let store = InMemoryStore::new("nmap");
        let job = job();

        store.release_target_lock(&job.project, &job.ip).await.unwrap();
        store
            .acquire_target_lock(&job.project, &job.ip, &holder("a"), Duration::from_secs(60))
            .await
            .unwrap();
        store.release_target_lock(&job.project, &job.ip).await.unwrap();
        store.release_target_lock(&job.project, &job.ip).await.unwrap();

        assert!(store.keys().await.is_empty());
    }

    #[tokio::test]
    async fn registry_is_scoped_per_host() {
        let store = InMemoryStore::new("nmap");
        store.track_process(&ProcessRecord::new("job-1", 100, HOST)).await.unwrap();

        assert_eq!(store.lookup_process("job-1", HOST).await.unwrap(), Some(100));
        assert_eq!(store.lookup_process("job-1", "worker-b").await.unwrap(), None);

        store.untrack_process("job-1", HOST).await.unwrap();
        assert_eq!(store.lookup_process("job-1", HOST).await.unwrap(), None);
        assert!(store.keys().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_registry_entries_are_skipped() {
        let store = InMemoryStore::new("nmap");
        store.track_process(&ProcessRecord::new("job-1", 100, HOST)).await.unwrap();
        store.seed_raw_process("job-2", HOST, "not-a-pid").await;

        let records = store.list_processes(HOST).await.unwrap();
        assert_eq!(records, vec![ProcessRecord::new("job-1", 100, HOST)]);
        assert_eq!(store.lookup_process("job-2", HOST).await.unwrap(), None);
    }

    #[tokio::test]
    async fn remove_running_target_takes_first_match_only() {
        let store = InMemoryStore::new("nmap");
        let project = Uuid::new_v4();
        let ip: IpAddr = "10.0.0.5".parse().unwrap();

        let mut first = RunningTarget::new(ip, vec![], HOST);
        first.started_at = 1;
        let mut second = first.clone();
        second.started_at = 2;
        let other = RunningTarget::new(ip, vec![], "worker-b");

        store.seed_raw_running_target(&project, "{broken").await;
        store.add_running_target(&project, &other).await.unwrap();
        store.add_running_target(&project, &first).await.unwrap();
        store.add_running_target(&project, &second).await.unwrap();

        assert!(store.remove_running_target(&project, &ip, HOST).await.unwrap());
        assert_eq!(
            store.running_targets(&project).await.unwrap(),
            vec![other.clone(), second]
        );

        assert!(store.remove_running_target(&project, &ip, HOST).await.unwrap());
        assert!(!store.remove_running_target(&project, &ip, HOST).await.unwrap());
        assert_eq!(store.running_targets(&project).await.unwrap(), vec![other]);
    }

    #[tokio::test]
    async fn cleanup_removes_everything_for_the_job() {
        let store = InMemoryStore::new("nmap");
        let job = job();
        let scope = CleanupScope::for_job(&job, HOST);

        store.seed_task_ids(&job).await;
        store.seed_metadata(&job.id, "{}").await;
        store
            .acquire_target_lock(&job.project, &job.ip, &holder(HOST), Duration::from_secs(60))
            .await
            .unwrap();
        store.track_process(&ProcessRecord::new(&job.id, 100, HOST)).await.unwrap();
        let entry = RunningTarget::new(job.ip, job.hostnames.clone(), HOST);
        store.record_running_task(&job.id, HOST, &entry).await.unwrap();
        assert_eq!(store.running_tasks(&job.id, HOST).await.len(), 1);

        store.cleanup_job(&scope).await.unwrap();

        assert!(store.keys().await.is_empty(), "left behind: {:?}", store.keys().await);
    }

    #[tokio::test]
    async fn cleanup_keeps_other_jobs() {
        let store = InMemoryStore::new("nmap");
        let job = job();
        let mut sibling = job.clone();
        sibling.id = "job-43".into();

        store.seed_task_ids(&job).await;
        store.seed_task_ids(&sibling).await;
        store.track_process(&ProcessRecord::new(&sibling.id, 200, HOST)).await.unwrap();

        store.cleanup_job(&CleanupScope::for_job(&job, HOST)).await.unwrap();

        let remaining = store.task_ids(&keys::project_task_ids(&job.project)).await;
        assert_eq!(remaining, HashSet::from(["job-43".to_string()]));
        assert_eq!(store.lookup_process(&sibling.id, HOST).await.unwrap(), Some(200));
    }

    #[tokio::test]
    async fn worker_address_expires() {
        let store = InMemoryStore::new("nmap");
        let address = WorkerAddress {
            ip: "203.0.113.7".into(),
            last_updated: 1_700_000_000,
        };

        store
            .register_worker_address(HOST, &address, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(store.worker_address(HOST).await.unwrap(), Some(address));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.worker_address(HOST).await.unwrap(), None);
    }
}

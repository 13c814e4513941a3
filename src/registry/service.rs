//! Registration/heartbeat protocol service: the sole writer to the store.
//!
//! Every operation runs sweep-then-mutate-then-resolve inside one write
//! lock, so callers always observe fully applied batches and resolutions
//! computed against the state their own change produced. An agent's
//! standing assignments are released from the load counts before its own
//! requirements re-resolve, so an unchanged mesh yields the same
//! assignments back. Requests from the same agent are additionally
//! serialized on a per-agent async lock, which keeps retries and delayed
//! duplicates from interleaving; lock entries are dropped together with
//! the agents they guard.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::clock::Clock;
use crate::config::MeshConfig;
use crate::errors::{RegistryError, SnapshotError};
use crate::registry::health::HealthPolicy;
use crate::registry::resolver;
use crate::registry::snapshot::{SnapshotStore, SqliteSnapshotStore, StoreSnapshot};
use crate::registry::store::StoreInner;
use crate::registry::types::{
    AgentSummary, CapabilitySummary, FastHeartbeatStatus, HeartbeatRequest, HeartbeatResponse,
    RegisterRequest, RegisterResponse, ResolutionMap,
};
use crate::registry::validation;

const STATUS_SUCCESS: &str = "success";

/// Shared registry service. Clone-cheap via `Arc` at the call sites.
pub struct RegistryService {
    store: RwLock<StoreInner>,
    agent_locks: DashMap<String, Arc<Mutex<()>>>,
    clock: Arc<dyn Clock>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    durability_degraded: AtomicBool,
}

impl RegistryService {
    pub fn new(policy: HealthPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: RwLock::new(StoreInner::new(policy)),
            agent_locks: DashMap::new(),
            clock,
            snapshots: None,
            durability_degraded: AtomicBool::new(false),
        }
    }

    /// Attaches a snapshot store for durable state.
    pub fn with_snapshots(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Builds a service from configuration, wiring up SQLite snapshots
    /// when a path is configured.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] when the snapshot database cannot be
    /// opened or created.
    pub fn from_config(config: &MeshConfig, clock: Arc<dyn Clock>) -> Result<Self, SnapshotError> {
        let service = Self::new(HealthPolicy::from_config(config), clock);
        match &config.snapshot_path {
            Some(path) => {
                let store = SqliteSnapshotStore::new(path.clone())?;
                Ok(service.with_snapshots(Arc::new(store)))
            }
            None => Ok(service),
        }
    }

    // -----------------------------------------------------------------------
    // Protocol operations
    // -----------------------------------------------------------------------

    /// Registers an agent with its full tool set and resolves every
    /// requirement it declared.
    ///
    /// Idempotent: an identical retry refreshes the heartbeat timestamp
    /// and returns the same resolutions without advancing the revision.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Validation`] when the payload is
    /// malformed; the store is left untouched.
    pub async fn register(
        &self,
        request: RegisterRequest,
    ) -> Result<RegisterResponse, RegistryError> {
        validation::validate_register(&request)?;

        let (response, changed, evicted) = {
            let _guard = self.agent_guard(&request.agent_id).await;
            let now = self.clock.now();
            let mut store = self.store.write();
            let evicted = store.sweep(now);
            let changed = store.upsert_agent(
                request.agent_id.clone(),
                request.endpoint.unwrap_or_default(),
                request.transports,
                request.tools,
                request.metadata,
                now,
            );
            store.take_assignments(&request.agent_id);
            let resolutions = resolver::resolve_for_agent(&store, &request.agent_id, now);
            store.record_sent(&request.agent_id, resolutions.clone());
            let response = RegisterResponse {
                status: STATUS_SUCCESS.to_string(),
                agent_id: request.agent_id,
                revision: store.revision(),
                resolutions,
            };
            (response, changed, evicted)
        };

        self.discard_idle_locks(&evicted);
        if changed || !evicted.is_empty() {
            self.persist().await;
        }
        Ok(response)
    }

    /// Heartbeat: refreshes liveness and returns resolution deltas.
    ///
    /// When the store revision matches the agent's last contact the
    /// response is a bare acknowledgement. Otherwise resolutions are
    /// recomputed and only entries differing from what the agent last
    /// received are returned, with `null` marking requirements that
    /// became unresolved.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownAgent`] when the agent is not in
    /// the store (typically after eviction); nothing is created for it.
    pub async fn heartbeat(
        &self,
        request: HeartbeatRequest,
    ) -> Result<HeartbeatResponse, RegistryError> {
        validation::validate_agent_id(&request.agent_id)?;

        let (result, evicted) = {
            let _guard = self.agent_guard(&request.agent_id).await;
            let now = self.clock.now();
            let mut store = self.store.write();
            let evicted = store.sweep(now);
            let result = if !store.touch(&request.agent_id, request.metadata, now) {
                Err(RegistryError::UnknownAgent {
                    agent_id: request.agent_id,
                })
            } else {
                let revision = store.revision();
                let up_to_date = store
                    .session(&request.agent_id)
                    .is_some_and(|session| session.last_seen_revision == revision);

                if up_to_date {
                    Ok(HeartbeatResponse {
                        status: STATUS_SUCCESS.to_string(),
                        agent_id: request.agent_id,
                        revision,
                        changed: false,
                        resolutions: ResolutionMap::new(),
                    })
                } else {
                    let previous = store.take_assignments(&request.agent_id);
                    let fresh = resolver::resolve_for_agent(&store, &request.agent_id, now);
                    let delta = diff_resolutions(&previous, &fresh);
                    store.record_sent(&request.agent_id, fresh);
                    Ok(HeartbeatResponse {
                        status: STATUS_SUCCESS.to_string(),
                        agent_id: request.agent_id,
                        revision,
                        changed: !delta.is_empty(),
                        resolutions: delta,
                    })
                }
            };
            (result, evicted)
        };

        if let Err(RegistryError::UnknownAgent { agent_id }) = &result {
            self.discard_idle_lock(agent_id);
        }
        self.discard_idle_locks(&evicted);
        if !evicted.is_empty() {
            self.persist().await;
        }
        result
    }

    /// Cheap liveness refresh carrying its verdict in a status code:
    /// whether the agent should follow up with a full heartbeat.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Validation`] for a malformed agent id.
    pub async fn fast_heartbeat(
        &self,
        agent_id: &str,
    ) -> Result<FastHeartbeatStatus, RegistryError> {
        validation::validate_agent_id(agent_id)?;

        let (status, evicted) = {
            let _guard = self.agent_guard(agent_id).await;
            let now = self.clock.now();
            let mut store = self.store.write();
            let evicted = store.sweep(now);
            let status = if !store.touch(agent_id, HashMap::new(), now) {
                FastHeartbeatStatus::AgentUnknown
            } else {
                let up_to_date = store
                    .session(agent_id)
                    .is_some_and(|session| session.last_seen_revision == store.revision());
                if up_to_date {
                    FastHeartbeatStatus::NoChanges
                } else {
                    // Not marked seen: the agent fetches deltas with a
                    // full heartbeat.
                    FastHeartbeatStatus::TopologyChanged
                }
            };
            (status, evicted)
        };

        if status == FastHeartbeatStatus::AgentUnknown {
            self.discard_idle_lock(agent_id);
        }
        self.discard_idle_locks(&evicted);
        if !evicted.is_empty() {
            self.persist().await;
        }
        Ok(status)
    }

    /// Removes an agent and everything it provided. Idempotent; returns
    /// whether the agent existed.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Validation`] for a malformed agent id.
    pub async fn unregister(&self, agent_id: &str) -> Result<bool, RegistryError> {
        validation::validate_agent_id(agent_id)?;

        let (removed, evicted) = {
            let _guard = self.agent_guard(agent_id).await;
            let now = self.clock.now();
            let mut store = self.store.write();
            let evicted = store.sweep(now);
            let removed = store.remove_agent(agent_id);
            (removed, evicted)
        };

        self.discard_idle_lock(agent_id);
        self.discard_idle_locks(&evicted);
        if removed || !evicted.is_empty() {
            self.persist().await;
        }
        if removed {
            log::info!("agent {agent_id} unregistered");
        }
        Ok(removed)
    }

    /// Evicts expired agents outside any protocol operation. Driven by
    /// the optional background task; returns the number evicted.
    pub async fn sweep_now(&self) -> usize {
        let now = self.clock.now();
        let evicted = {
            let mut store = self.store.write();
            store.sweep(now)
        };
        self.discard_idle_locks(&evicted);
        if !evicted.is_empty() {
            self.persist().await;
        }
        evicted.len()
    }

    // -----------------------------------------------------------------------
    // Read-only views
    // -----------------------------------------------------------------------

    pub fn list_agents(&self) -> Vec<AgentSummary> {
        let now = self.clock.now();
        self.store.read().agent_summaries(now)
    }

    pub fn list_capabilities(&self) -> Vec<CapabilitySummary> {
        let now = self.clock.now();
        self.store.read().capability_summaries(now)
    }

    pub fn revision(&self) -> u64 {
        self.store.read().revision()
    }

    pub fn agent_count(&self) -> usize {
        self.store.read().agent_count()
    }

    /// True after a snapshot write has failed and not yet succeeded
    /// again. Surfaced by the ready probe.
    pub fn durability_degraded(&self) -> bool {
        self.durability_degraded.load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Restores state from the snapshot store, if one is attached and has
    /// a snapshot. Returns whether anything was restored.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] when the snapshot exists but cannot be
    /// read or decoded.
    pub fn restore_from_snapshots(&self) -> Result<bool, SnapshotError> {
        let Some(snapshots) = &self.snapshots else {
            return Ok(false);
        };
        match snapshots.load()? {
            Some(snapshot) => {
                self.store.write().restore(snapshot);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Current durable view of the store.
    pub fn snapshot(&self) -> StoreSnapshot {
        self.store.read().to_snapshot()
    }

    async fn persist(&self) {
        let Some(snapshots) = &self.snapshots else {
            return;
        };
        let snapshot = self.store.read().to_snapshot();
        let snapshots = Arc::clone(snapshots);
        let result = tokio::task::spawn_blocking(move || snapshots.save(&snapshot)).await;
        match result {
            Ok(Ok(())) => {
                if self.durability_degraded.swap(false, Ordering::Relaxed) {
                    log::info!("snapshot persistence recovered");
                }
            }
            Ok(Err(err)) => {
                log::error!("snapshot save failed, durability degraded: {err}");
                self.durability_degraded.store(true, Ordering::Relaxed);
            }
            Err(err) => {
                log::error!("snapshot task panicked: {err}");
                self.durability_degraded.store(true, Ordering::Relaxed);
            }
        }
    }

    async fn agent_guard(&self, agent_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let entry = self
                .agent_locks
                .entry(agent_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())));
            Arc::clone(entry.value())
        };
        lock.lock_owned().await
    }

    /// Drops the lock entry for an agent that is gone from the store.
    /// The entry survives while any task still holds or awaits it; the
    /// last party out removes it, and callers must have released their
    /// own guard first.
    fn discard_idle_lock(&self, agent_id: &str) {
        self.agent_locks
            .remove_if(agent_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn discard_idle_locks(&self, agent_ids: &[String]) {
        for agent_id in agent_ids {
            self.discard_idle_lock(agent_id);
        }
    }
}

/// Entries in `current` that differ from `previous` at the same
/// (tool, index) key. `None` values survive as explicit unresolved
/// markers; keys absent from `current` are not reported.
fn diff_resolutions(previous: &ResolutionMap, current: &ResolutionMap) -> ResolutionMap {
    let mut delta = ResolutionMap::new();
    for (tool_name, by_index) in current {
        for (index, provider) in by_index {
            let unchanged = previous
                .get(tool_name)
                .and_then(|m| m.get(index))
                .is_some_and(|prev| prev == provider);
            if !unchanged {
                delta
                    .entry(tool_name.clone())
                    .or_default()
                    .insert(*index, provider.clone());
            }
        }
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::types::{Requirement, ToolSpec, Transport};
    use std::collections::BTreeMap;

    fn service_with_clock() -> (Arc<RegistryService>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::fixed());
        let service = Arc::new(RegistryService::new(
            HealthPolicy::new(60, 120),
            clock.clone(),
        ));
        (service, clock)
    }

    fn provider_request(agent_id: &str, capability: &str, version: &str) -> RegisterRequest {
        RegisterRequest {
            agent_id: agent_id.to_string(),
            endpoint: Some(format!("http://{agent_id}:8080")),
            transports: vec![Transport::Http],
            tools: vec![ToolSpec {
                tool_name: "serve".to_string(),
                capability: capability.to_string(),
                version: version.to_string(),
                tags: Vec::new(),
                dependencies: Vec::new(),
            }],
            metadata: HashMap::new(),
        }
    }

    fn consumer_request(agent_id: &str, requirements: Vec<Requirement>) -> RegisterRequest {
        RegisterRequest {
            agent_id: agent_id.to_string(),
            endpoint: None,
            transports: vec![Transport::Stdio],
            tools: vec![ToolSpec {
                tool_name: "work".to_string(),
                capability: "consumer_side".to_string(),
                version: "1.0.0".to_string(),
                tags: Vec::new(),
                dependencies: requirements,
            }],
            metadata: HashMap::new(),
        }
    }

    fn heartbeat_request(agent_id: &str) -> HeartbeatRequest {
        HeartbeatRequest {
            agent_id: agent_id.to_string(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_register_resolves_declared_requirements() {
        let (service, _clock) = service_with_clock();
        service
            .register(provider_request("weather-00000001", "weather", "1.2.0"))
            .await
            .unwrap();

        let response = service
            .register(consumer_request(
                "consumer-00000002",
                vec![
                    Requirement::capability("weather"),
                    Requirement::capability("nonexistent"),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(response.status, "success");
        let by_index = &response.resolutions["work"];
        let resolved = by_index[&0].as_ref().unwrap();
        assert_eq!(resolved.agent_id, "weather-00000001");
        assert_eq!(resolved.endpoint, "http://weather-00000001:8080");
        assert!(by_index[&1].is_none());
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let (service, _clock) = service_with_clock();
        let first = service
            .register(provider_request("weather-00000001", "weather", "1.2.0"))
            .await
            .unwrap();
        let second = service
            .register(provider_request("weather-00000001", "weather", "1.2.0"))
            .await
            .unwrap();

        assert_eq!(first.revision, second.revision);
        assert_eq!(first.resolutions, second.resolutions);
        assert_eq!(service.agent_count(), 1);
    }

    #[tokio::test]
    async fn test_idempotent_reregister_leaves_others_unchanged() {
        let (service, _clock) = service_with_clock();
        service
            .register(provider_request("weather-00000001", "weather", "1.2.0"))
            .await
            .unwrap();
        service
            .register(consumer_request(
                "consumer-00000002",
                vec![Requirement::capability("weather")],
            ))
            .await
            .unwrap();

        // Retry of an identical registration must not disturb anyone.
        service
            .register(provider_request("weather-00000001", "weather", "1.2.0"))
            .await
            .unwrap();

        let response = service
            .heartbeat(heartbeat_request("consumer-00000002"))
            .await
            .unwrap();
        assert!(!response.changed);
        assert!(response.resolutions.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_agent() {
        let (service, _clock) = service_with_clock();
        let err = service
            .heartbeat(heartbeat_request("ghost-00000000"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownAgent { .. }));
        assert_eq!(service.agent_count(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_delta_contains_only_changes() {
        let (service, _clock) = service_with_clock();
        service
            .register(provider_request("geo-00000001", "geocoding", "1.0.0"))
            .await
            .unwrap();
        service
            .register(provider_request("weather-00000002", "weather", "1.0.0"))
            .await
            .unwrap();
        service
            .register(consumer_request(
                "consumer-00000003",
                vec![
                    Requirement::capability("weather"),
                    Requirement::capability("geocoding"),
                ],
            ))
            .await
            .unwrap();

        // A better weather provider appears; geocoding is untouched.
        service
            .register(provider_request("weather2-00000004", "weather", "2.0.0"))
            .await
            .unwrap();

        let response = service
            .heartbeat(heartbeat_request("consumer-00000003"))
            .await
            .unwrap();
        assert!(response.changed);
        let by_index = &response.resolutions["work"];
        assert_eq!(
            by_index[&0].as_ref().unwrap().agent_id,
            "weather2-00000004"
        );
        assert!(!by_index.contains_key(&1));
    }

    #[tokio::test]
    async fn test_unrelated_topology_change_acknowledges_without_delta() {
        let (service, _clock) = service_with_clock();
        service
            .register(consumer_request(
                "consumer-00000001",
                vec![Requirement::capability("weather")],
            ))
            .await
            .unwrap();
        // A provider of something nobody consumes registers.
        service
            .register(provider_request("other-00000002", "unrelated", "1.0.0"))
            .await
            .unwrap();

        let response = service
            .heartbeat(heartbeat_request("consumer-00000001"))
            .await
            .unwrap();
        // Revision moved, resolutions did not.
        assert!(!response.changed);
        assert!(response.resolutions.is_empty());

        // The session caught up, so the next heartbeat takes the cheap
        // path too.
        let response = service
            .heartbeat(heartbeat_request("consumer-00000001"))
            .await
            .unwrap();
        assert!(!response.changed);
    }

    #[tokio::test]
    async fn test_assignment_stable_between_equal_providers() {
        let (service, _clock) = service_with_clock();
        service
            .register(provider_request("geo-a-00000001", "geo", "1.0.0"))
            .await
            .unwrap();
        service
            .register(provider_request("geo-b-00000002", "geo", "1.0.0"))
            .await
            .unwrap();
        let response = service
            .register(consumer_request(
                "consumer-00000003",
                vec![Requirement::capability("geo")],
            ))
            .await
            .unwrap();
        let assigned = response.resolutions["work"][&0]
            .as_ref()
            .unwrap()
            .agent_id
            .clone();

        // Registrations of unconsumed capabilities bump the revision but
        // must not shuffle a standing assignment between equal providers.
        for other in ["other-00000004", "other-00000005"] {
            service
                .register(provider_request(other, "unrelated", "1.0.0"))
                .await
                .unwrap();
            let response = service
                .heartbeat(heartbeat_request("consumer-00000003"))
                .await
                .unwrap();
            assert!(!response.changed, "assignment moved off {assigned}");
            assert!(response.resolutions.is_empty());
        }

        // The standing assignment still counts against its provider: a
        // second consumer lands on the other one.
        let response = service
            .register(consumer_request(
                "consumer-00000006",
                vec![Requirement::capability("geo")],
            ))
            .await
            .unwrap();
        let second = response.resolutions["work"][&0].as_ref().unwrap();
        assert_ne!(second.agent_id, assigned);
    }

    #[tokio::test]
    async fn test_eviction_flips_dependents_to_unresolved() {
        let (service, clock) = service_with_clock();
        service
            .register(provider_request("weather-00000001", "weather", "1.0.0"))
            .await
            .unwrap();
        service
            .register(consumer_request(
                "consumer-00000002",
                vec![Requirement::capability("weather")],
            ))
            .await
            .unwrap();

        // The provider goes silent; the consumer keeps heartbeating.
        clock.advance_secs(70);
        service
            .heartbeat(heartbeat_request("consumer-00000002"))
            .await
            .unwrap();
        clock.advance_secs(55);

        // 125s of provider silence is past the eviction window.
        let response = service
            .heartbeat(heartbeat_request("consumer-00000002"))
            .await
            .unwrap();
        assert!(response.changed);
        assert_eq!(response.resolutions["work"][&0], None);
        assert_eq!(service.agent_count(), 1);

        // The evicted agent's next heartbeat is rejected.
        let err = service
            .heartbeat(heartbeat_request("weather-00000001"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownAgent { .. }));

        // Re-registration restores the resolution at the next pass.
        service
            .register(provider_request("weather-00000001", "weather", "1.0.0"))
            .await
            .unwrap();
        let response = service
            .heartbeat(heartbeat_request("consumer-00000002"))
            .await
            .unwrap();
        assert!(response.changed);
        assert_eq!(
            response.resolutions["work"][&0].as_ref().unwrap().agent_id,
            "weather-00000001"
        );
    }

    #[tokio::test]
    async fn test_constrained_tagged_resolution_unresolves_after_eviction() {
        let (service, clock) = service_with_clock();
        let mut provider = provider_request("clock-00000001", "clock", "1.0.0");
        provider.tools[0].tags = vec!["prod".to_string()];
        service.register(provider).await.unwrap();

        let response = service
            .register(consumer_request(
                "consumer-00000002",
                vec![Requirement {
                    capability: "clock".to_string(),
                    version_constraint: Some(">=1.0.0".to_string()),
                    tags: vec!["prod".to_string()],
                }],
            ))
            .await
            .unwrap();
        let resolved = response.resolutions["work"][&0].as_ref().unwrap();
        assert_eq!(resolved.agent_id, "clock-00000001");
        assert_eq!(resolved.endpoint, "http://clock-00000001:8080");

        // The provider goes silent past the eviction window while the
        // consumer keeps heartbeating.
        clock.advance_secs(70);
        service
            .heartbeat(heartbeat_request("consumer-00000002"))
            .await
            .unwrap();
        clock.advance_secs(55);
        let response = service
            .heartbeat(heartbeat_request("consumer-00000002"))
            .await
            .unwrap();
        assert!(response.changed);
        assert_eq!(response.resolutions["work"][&0], None);
    }

    #[tokio::test]
    async fn test_degraded_provider_still_resolves_until_evicted() {
        let (service, clock) = service_with_clock();
        service
            .register(provider_request("weather-00000001", "weather", "1.0.0"))
            .await
            .unwrap();

        clock.advance_secs(90);
        let response = service
            .register(consumer_request(
                "consumer-00000002",
                vec![Requirement::capability("weather")],
            ))
            .await
            .unwrap();
        // 90s old: degraded, still the only candidate.
        assert_eq!(
            response.resolutions["work"][&0].as_ref().unwrap().agent_id,
            "weather-00000001"
        );
    }

    #[tokio::test]
    async fn test_fast_heartbeat_status_flow() {
        let (service, _clock) = service_with_clock();
        service
            .register(provider_request("weather-00000001", "weather", "1.0.0"))
            .await
            .unwrap();

        assert_eq!(
            service.fast_heartbeat("weather-00000001").await.unwrap(),
            FastHeartbeatStatus::NoChanges
        );

        service
            .register(provider_request("geo-00000002", "geocoding", "1.0.0"))
            .await
            .unwrap();
        assert_eq!(
            service.fast_heartbeat("weather-00000001").await.unwrap(),
            FastHeartbeatStatus::TopologyChanged
        );

        // Still changed until a full heartbeat collects the delta.
        assert_eq!(
            service.fast_heartbeat("weather-00000001").await.unwrap(),
            FastHeartbeatStatus::TopologyChanged
        );
        service
            .heartbeat(heartbeat_request("weather-00000001"))
            .await
            .unwrap();
        assert_eq!(
            service.fast_heartbeat("weather-00000001").await.unwrap(),
            FastHeartbeatStatus::NoChanges
        );

        assert_eq!(
            service.fast_heartbeat("ghost-00000000").await.unwrap(),
            FastHeartbeatStatus::AgentUnknown
        );
    }

    #[tokio::test]
    async fn test_fast_heartbeat_refreshes_liveness() {
        let (service, clock) = service_with_clock();
        service
            .register(provider_request("weather-00000001", "weather", "1.0.0"))
            .await
            .unwrap();

        // HEAD checks alone keep the agent alive across three eviction
        // windows.
        for _ in 0..6 {
            clock.advance_secs(59);
            let status = service.fast_heartbeat("weather-00000001").await.unwrap();
            assert_ne!(status, FastHeartbeatStatus::AgentUnknown);
        }
        assert_eq!(service.agent_count(), 1);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent_and_propagates() {
        let (service, _clock) = service_with_clock();
        service
            .register(provider_request("weather-00000001", "weather", "1.0.0"))
            .await
            .unwrap();
        service
            .register(consumer_request(
                "consumer-00000002",
                vec![Requirement::capability("weather")],
            ))
            .await
            .unwrap();

        assert!(service.unregister("weather-00000001").await.unwrap());
        assert!(!service.unregister("weather-00000001").await.unwrap());

        let response = service
            .heartbeat(heartbeat_request("consumer-00000002"))
            .await
            .unwrap();
        assert!(response.changed);
        assert_eq!(response.resolutions["work"][&0], None);
    }

    #[tokio::test]
    async fn test_agent_locks_go_with_their_agents() {
        let (service, clock) = service_with_clock();
        service
            .register(provider_request("weather-00000001", "weather", "1.0.0"))
            .await
            .unwrap();
        service
            .register(provider_request("geo-00000002", "geocoding", "1.0.0"))
            .await
            .unwrap();
        assert!(service.agent_locks.contains_key("weather-00000001"));

        service.unregister("weather-00000001").await.unwrap();
        assert!(!service.agent_locks.contains_key("weather-00000001"));

        clock.advance_secs(121);
        assert_eq!(service.sweep_now().await, 1);
        assert!(!service.agent_locks.contains_key("geo-00000002"));
        assert!(service.agent_locks.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_ids_leave_no_lock_entry() {
        let (service, _clock) = service_with_clock();
        let err = service
            .heartbeat(heartbeat_request("ghost-00000000"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownAgent { .. }));
        assert_eq!(
            service.fast_heartbeat("ghost2-00000000").await.unwrap(),
            FastHeartbeatStatus::AgentUnknown
        );
        service.unregister("ghost3-00000000").await.unwrap();
        assert!(service.agent_locks.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_restore_resyncs_resolutions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshots.db");
        let clock = Arc::new(ManualClock::fixed());

        {
            let snapshots = Arc::new(SqliteSnapshotStore::new(path.clone()).unwrap());
            let service = RegistryService::new(HealthPolicy::new(60, 120), clock.clone())
                .with_snapshots(snapshots);
            service
                .register(provider_request("weather-00000001", "weather", "1.0.0"))
                .await
                .unwrap();
            service
                .register(consumer_request(
                    "consumer-00000002",
                    vec![Requirement::capability("weather")],
                ))
                .await
                .unwrap();
        }

        // A new process restores the same state.
        let snapshots = Arc::new(SqliteSnapshotStore::new(path).unwrap());
        let service = RegistryService::new(HealthPolicy::new(60, 120), clock.clone())
            .with_snapshots(snapshots);
        assert!(service.restore_from_snapshots().unwrap());
        assert_eq!(service.agent_count(), 2);

        // Sessions did not survive, so the first heartbeat resends the
        // full resolution set.
        let response = service
            .heartbeat(heartbeat_request("consumer-00000002"))
            .await
            .unwrap();
        assert!(response.changed);
        assert_eq!(
            response.resolutions["work"][&0].as_ref().unwrap().agent_id,
            "weather-00000001"
        );
    }

    struct FailingSnapshotStore;

    impl SnapshotStore for FailingSnapshotStore {
        fn save(&self, _snapshot: &StoreSnapshot) -> Result<(), SnapshotError> {
            Err(SnapshotError::Storage {
                message: "disk full".to_string(),
            })
        }

        fn load(&self) -> Result<Option<StoreSnapshot>, SnapshotError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_snapshot_failure_degrades_durability_not_serving() {
        let clock = Arc::new(ManualClock::fixed());
        let service = RegistryService::new(HealthPolicy::new(60, 120), clock)
            .with_snapshots(Arc::new(FailingSnapshotStore));

        let response = service
            .register(provider_request("weather-00000001", "weather", "1.0.0"))
            .await;
        assert!(response.is_ok());
        assert!(service.durability_degraded());
        assert_eq!(service.agent_count(), 1);
    }

    #[tokio::test]
    async fn test_validation_rejects_whole_batch() {
        let (service, _clock) = service_with_clock();
        let mut request = provider_request("weather-00000001", "weather", "1.0.0");
        request.tools.push(ToolSpec {
            tool_name: "bad name!".to_string(),
            capability: "weather".to_string(),
            version: "1.0.0".to_string(),
            tags: Vec::new(),
            dependencies: Vec::new(),
        });

        let err = service.register(request).await.unwrap_err();
        assert!(matches!(err, RegistryError::Validation { .. }));
        assert_eq!(service.agent_count(), 0);
    }

    #[test]
    fn test_diff_reports_changed_and_new_entries_only() {
        let provider = |agent: &str| {
            Some(crate::registry::types::ResolvedProvider {
                agent_id: agent.to_string(),
                tool_name: "serve".to_string(),
                capability: "cap".to_string(),
                endpoint: format!("http://{agent}:8080"),
                version: "1.0.0".to_string(),
            })
        };

        let mut previous = ResolutionMap::new();
        previous.insert(
            "work".to_string(),
            BTreeMap::from([(0usize, provider("a-00000001")), (1usize, provider("b-00000002"))]),
        );

        let mut current = ResolutionMap::new();
        current.insert(
            "work".to_string(),
            BTreeMap::from([
                (0usize, provider("a-00000001")),
                (1usize, None),
                (2usize, provider("c-00000003")),
            ]),
        );

        let delta = diff_resolutions(&previous, &current);
        let by_index = &delta["work"];
        assert!(!by_index.contains_key(&0));
        assert_eq!(by_index[&1], None);
        assert_eq!(by_index[&2].as_ref().unwrap().agent_id, "c-00000003");
    }
}

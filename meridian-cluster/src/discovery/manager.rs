//! Service registry and coordination primitive host
//!
//! Instances and primitives share one mutex. Watchers are always invoked
//! after the lock is released; broadcast events are sent while it is held
//! so their order matches the order of the mutations.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::events::{DiscoveryEvent, ServiceChange};
use super::instance::{
    ServiceHealth, ServiceHealthStatus, ServiceInstance, ServiceQuery, ServiceRegistration,
};
use super::watch::{WatchHandle, Watchers};
use crate::coordination::{
    CoordinationPrimitive, DistributedBarrier, DistributedLock, DistributedQueue,
    DistributedSemaphore, LeaderElection, PrimitiveKind, QueueItem,
};
use crate::error::{Error, Result};
use crate::health::{cycle_interval, CheckStatus, HealthCheck, ProbeRegistry};
use crate::timers::TimerSet;
use meridian_core::config::DiscoveryConfig;
use meridian_core::metrics::coordination;
use meridian_core::metrics::discovery::{SERVICE_CHANGES, SERVICE_INSTANCES};

const CLEANUP_TIMER: &str = "cleanup";

fn health_timer(name: &str, instance_id: &str) -> String {
    format!("health:{name}/{instance_id}")
}

/// What one cleanup pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub expired_instances: usize,
    pub expired_locks: usize,
    pub expired_permits: usize,
    pub expired_items: usize,
}

impl CleanupReport {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.expired_instances == 0
            && self.expired_locks == 0
            && self.expired_permits == 0
            && self.expired_items == 0
    }
}

/// Access to one variant of [`CoordinationPrimitive`]
trait PrimitiveVariant: Sized {
    const KIND: PrimitiveKind;

    fn variant_mut(primitive: &mut CoordinationPrimitive) -> Option<&mut Self>;
}

macro_rules! primitive_variant {
    ($ty:ty, $variant:ident) => {
        impl PrimitiveVariant for $ty {
            const KIND: PrimitiveKind = PrimitiveKind::$variant;

            fn variant_mut(primitive: &mut CoordinationPrimitive) -> Option<&mut Self> {
                match primitive {
                    CoordinationPrimitive::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

primitive_variant!(DistributedLock, Lock);
primitive_variant!(DistributedSemaphore, Semaphore);
primitive_variant!(DistributedBarrier, Barrier);
primitive_variant!(DistributedQueue, Queue);
primitive_variant!(LeaderElection, Election);

#[derive(Default)]
struct DiscoveryState {
    services: BTreeMap<String, IndexMap<String, ServiceInstance>>,
    primitives: BTreeMap<String, CoordinationPrimitive>,
}

impl DiscoveryState {
    fn instance_count(&self) -> usize {
        self.services.values().map(IndexMap::len).sum()
    }

    fn instance_mut(&mut self, name: &str, instance_id: &str) -> Option<&mut ServiceInstance> {
        self.services.get_mut(name)?.get_mut(instance_id)
    }

    /// Remove an instance, dropping its bucket once empty
    fn remove_instance(&mut self, name: &str, instance_id: &str) -> Option<ServiceInstance> {
        let bucket = self.services.get_mut(name)?;
        let removed = bucket.shift_remove(instance_id)?;
        if bucket.is_empty() {
            self.services.remove(name);
        }
        Some(removed)
    }
}

struct Shared {
    config: DiscoveryConfig,
    probes: ProbeRegistry,
    state: Mutex<DiscoveryState>,
    watchers: Arc<Watchers>,
    events: broadcast::Sender<DiscoveryEvent>,
    timers: TimerSet,
    running: AtomicBool,
    lifecycle: tokio::sync::Mutex<()>,
}

/// Service discovery manager
///
/// Keeps a registry of named service instances with TTL heartbeats and
/// per-instance health checks, and hosts the coordination primitives.
/// Cloning is cheap; clones share the same registry.
#[derive(Clone)]
pub struct ServiceDiscoveryManager {
    shared: Arc<Shared>,
}

impl ServiceDiscoveryManager {
    pub fn new(config: DiscoveryConfig, probes: ProbeRegistry) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.event_channel_capacity);

        info!(
            default_ttl_secs = config.default_ttl_secs,
            cleanup_interval_secs = config.cleanup_interval_secs,
            "Service discovery manager created"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                probes,
                state: Mutex::new(DiscoveryState::default()),
                watchers: Arc::new(Watchers::default()),
                events,
                timers: TimerSet::new(),
                running: AtomicBool::new(false),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &DiscoveryConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Start the cleanup timer and a health timer for every instance
    pub async fn start(&self) {
        let _lifecycle = self.shared.lifecycle.lock().await;
        if self.is_running() {
            return;
        }
        self.shared.timers.reset();
        self.shared.running.store(true, Ordering::Release);

        let default_interval = self.shared.config.health_check_interval();
        let instances: Vec<(String, String, Duration)> = {
            let state = self.shared.state.lock();
            state
                .services
                .values()
                .flat_map(IndexMap::values)
                .map(|i| {
                    (
                        i.name.clone(),
                        i.id.clone(),
                        cycle_interval(&i.health.checks, default_interval),
                    )
                })
                .collect()
        };
        for (name, instance_id, period) in &instances {
            self.spawn_health_timer(name, instance_id, *period);
        }
        self.spawn_cleanup_timer();

        info!(instances = instances.len(), "Service discovery started");
    }

    /// Stop every timer; no health check runs after this returns
    pub async fn stop(&self) {
        let _lifecycle = self.shared.lifecycle.lock().await;
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared
            .timers
            .shutdown(self.shared.config.stop_grace_period())
            .await;
        info!("Service discovery stopped");
    }

    /// Receive every registry and coordination event sent from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.shared.events.subscribe()
    }

    fn emit(&self, event: DiscoveryEvent) {
        // No receivers is fine
        let _ = self.shared.events.send(event);
    }

    fn record_change(state: &DiscoveryState, change: &str) {
        SERVICE_CHANGES.with_label_values(&[change]).inc();
        SERVICE_INSTANCES.set(i64::try_from(state.instance_count()).unwrap_or(i64::MAX));
    }

    // ---- Registry ----

    /// Register a service instance.
    ///
    /// The registry assigns the id and timestamps; the instance starts
    /// healthy.
    pub fn register_service(&self, registration: ServiceRegistration) -> Result<ServiceInstance> {
        if registration.name.trim().is_empty() {
            return Err(Error::InvalidInput("service name must not be empty".to_string()));
        }
        if registration.address.trim().is_empty() {
            return Err(Error::InvalidInput(format!(
                "service {} has no address",
                registration.name
            )));
        }

        let now = Utc::now();
        let ttl = registration
            .ttl
            .unwrap_or_else(|| self.shared.config.default_ttl());
        let instance = ServiceInstance {
            id: format!("svc_{}", nanoid::nanoid!(12)),
            name: registration.name,
            version: registration.version,
            address: registration.address,
            port: registration.port,
            protocol: registration.protocol,
            tags: registration.tags,
            metadata: registration.metadata,
            health: ServiceHealth {
                status: ServiceHealthStatus::Healthy,
                checks: registration.checks,
                last_updated: now,
            },
            registered_at: now,
            last_heartbeat: now,
            ttl,
        };

        {
            let mut state = self.shared.state.lock();
            state
                .services
                .entry(instance.name.clone())
                .or_default()
                .insert(instance.id.clone(), instance.clone());
            Self::record_change(&state, "registered");
            self.emit(DiscoveryEvent::ServiceRegistered {
                name: instance.name.clone(),
                instance_id: instance.id.clone(),
                endpoint: instance.endpoint(),
                timestamp: now,
            });
        }

        if self.is_running() {
            let period = cycle_interval(
                &instance.health.checks,
                self.shared.config.health_check_interval(),
            );
            self.spawn_health_timer(&instance.name, &instance.id, period);
        }

        info!(
            service = %instance.name,
            instance_id = %instance.id,
            endpoint = %instance.endpoint(),
            "Service registered"
        );
        self.shared.watchers.notify(
            &instance.name,
            &ServiceChange::Registered {
                instance: instance.clone(),
            },
        );
        Ok(instance)
    }

    /// Remove an instance; `false` if it is unknown
    pub fn deregister_service(&self, name: &str, instance_id: &str) -> bool {
        let removed = {
            let mut state = self.shared.state.lock();
            let Some(instance) = state.remove_instance(name, instance_id) else {
                return false;
            };
            Self::record_change(&state, "deregistered");
            self.emit(DiscoveryEvent::ServiceDeregistered {
                name: name.to_string(),
                instance_id: instance_id.to_string(),
                expired: false,
                timestamp: Utc::now(),
            });
            instance
        };

        self.shared.timers.cancel(&health_timer(name, instance_id));
        info!(service = %name, instance_id = %instance_id, "Service deregistered");
        self.shared.watchers.notify(
            name,
            &ServiceChange::Deregistered {
                instance: removed,
                expired: false,
            },
        );
        true
    }

    /// Instances matching `query`, ordered by name then registration
    #[must_use]
    pub fn discover_services(&self, query: &ServiceQuery) -> Vec<ServiceInstance> {
        let state = self.shared.state.lock();
        let buckets: Vec<&IndexMap<String, ServiceInstance>> = match &query.service_name {
            Some(name) => state.services.get(name).into_iter().collect(),
            None => state.services.values().collect(),
        };
        buckets
            .into_iter()
            .flat_map(IndexMap::values)
            .filter(|i| query.matches(i))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn get_service(&self, name: &str, instance_id: &str) -> Option<ServiceInstance> {
        self.shared
            .state
            .lock()
            .services
            .get(name)?
            .get(instance_id)
            .cloned()
    }

    /// Names with at least one registered instance, sorted
    #[must_use]
    pub fn list_service_names(&self) -> Vec<String> {
        self.shared.state.lock().services.keys().cloned().collect()
    }

    /// Call `callback` for every change to instances named `name`.
    ///
    /// Callbacks run on the thread performing the change, after the
    /// registry lock is released. A panicking callback is logged and does
    /// not affect the registry or other watchers.
    pub fn watch_service<F>(&self, name: &str, callback: F) -> WatchHandle
    where
        F: Fn(&ServiceChange) + Send + Sync + 'static,
    {
        let id = self.shared.watchers.add(name, Arc::new(callback));
        debug!(service = %name, watcher = id, "Service watch added");
        WatchHandle::new(id, name, &self.shared.watchers)
    }

    /// Record a heartbeat; health is re-evaluated by the next check
    pub fn heartbeat(&self, name: &str, instance_id: &str) -> bool {
        let mut state = self.shared.state.lock();
        let Some(instance) = state.instance_mut(name, instance_id) else {
            return false;
        };
        instance.last_heartbeat = Utc::now();
        true
    }

    /// Run the TTL check and the configured probes of one instance.
    ///
    /// Returns the resulting status, or `None` if the instance is gone.
    pub async fn run_service_health_check(
        &self,
        name: &str,
        instance_id: &str,
    ) -> Option<ServiceHealthStatus> {
        let (checks, target) = {
            let state = self.shared.state.lock();
            let instance = state.services.get(name)?.get(instance_id)?;
            (instance.health.checks.clone(), instance.probe_target())
        };

        let results = self.shared.probes.run_checks(&target, &checks).await;

        let now = Utc::now();
        let change = {
            let mut state = self.shared.state.lock();
            let instance = state.instance_mut(name, instance_id)?;

            let status = evaluate(instance, &results, now);
            let previous = instance.health.status;
            instance.health.status = status;
            instance.health.checks = results;
            instance.health.last_updated = now;

            if status == previous {
                return Some(status);
            }
            let instance = instance.clone();
            Self::record_change(&state, "health_changed");
            self.emit(DiscoveryEvent::ServiceHealthChanged {
                name: name.to_string(),
                instance_id: instance_id.to_string(),
                previous,
                current: status,
                timestamp: now,
            });
            ServiceChange::HealthChanged { instance, previous }
        };

        let current = change.instance().health.status;
        if current == ServiceHealthStatus::Healthy {
            info!(service = %name, instance_id = %instance_id, "Service instance recovered");
        } else {
            warn!(
                service = %name,
                instance_id = %instance_id,
                status = current.as_str(),
                "Service instance health degraded"
            );
        }
        self.shared.watchers.notify(name, &change);
        Some(current)
    }

    /// Sweep expired instances, lock ownerships, permits and queue items
    pub fn cleanup_expired(&self) -> CleanupReport {
        let now = Utc::now();
        let mut report = CleanupReport::default();
        let mut removed = Vec::new();

        {
            let mut state = self.shared.state.lock();

            let expired: Vec<(String, String)> = state
                .services
                .values()
                .flat_map(IndexMap::values)
                .filter(|i| i.is_expired(now))
                .map(|i| (i.name.clone(), i.id.clone()))
                .collect();
            for (name, instance_id) in expired {
                if let Some(instance) = state.remove_instance(&name, &instance_id) {
                    Self::record_change(&state, "expired");
                    self.emit(DiscoveryEvent::ServiceDeregistered {
                        name,
                        instance_id,
                        expired: true,
                        timestamp: now,
                    });
                    removed.push(instance);
                }
            }
            report.expired_instances = removed.len();

            for primitive in state.primitives.values_mut() {
                match primitive {
                    CoordinationPrimitive::Lock(lock) => {
                        if lock.expire(now) {
                            report.expired_locks += 1;
                            self.emit(DiscoveryEvent::LockExpired {
                                lock_id: lock.id.clone(),
                                timestamp: now,
                            });
                        }
                    }
                    CoordinationPrimitive::Semaphore(semaphore) => {
                        report.expired_permits += semaphore.sweep(now);
                    }
                    CoordinationPrimitive::Queue(queue) => {
                        report.expired_items += queue.sweep(now);
                    }
                    CoordinationPrimitive::Barrier(_) | CoordinationPrimitive::Election(_) => {}
                }
            }
        }

        for instance in removed {
            self.shared
                .timers
                .cancel(&health_timer(&instance.name, &instance.id));
            warn!(
                service = %instance.name,
                instance_id = %instance.id,
                "Service instance expired"
            );
            let name = instance.name.clone();
            self.shared.watchers.notify(
                &name,
                &ServiceChange::Deregistered {
                    instance,
                    expired: true,
                },
            );
        }

        if !report.is_empty() {
            debug!(?report, "Cleanup pass removed expired entries");
        }
        report
    }

    // ---- Coordination primitives ----

    fn insert_primitive(&self, primitive: CoordinationPrimitive) -> Result<CoordinationPrimitive> {
        let id = primitive.id().to_string();
        let kind = primitive.kind();
        if id.trim().is_empty() {
            return Err(Error::InvalidInput(format!("{kind} id must not be empty")));
        }

        let mut state = self.shared.state.lock();
        if let Some(existing) = state.primitives.get(&id) {
            coordination::record(kind.as_str(), "create", false);
            return Err(Error::AlreadyExists(format!(
                "{} {id}",
                existing.kind()
            )));
        }
        state.primitives.insert(id.clone(), primitive.clone());
        coordination::record(kind.as_str(), "create", true);
        debug!(primitive = %id, kind = kind.as_str(), "Coordination primitive created");
        Ok(primitive)
    }

    pub fn create_lock(&self, id: &str) -> Result<CoordinationPrimitive> {
        self.insert_primitive(CoordinationPrimitive::Lock(DistributedLock::new(id)))
    }

    pub fn create_semaphore(&self, id: &str, capacity: u32) -> Result<CoordinationPrimitive> {
        if capacity == 0 {
            return Err(Error::InvalidInput(format!(
                "semaphore {id} needs a capacity of at least 1"
            )));
        }
        self.insert_primitive(CoordinationPrimitive::Semaphore(DistributedSemaphore::new(
            id, capacity,
        )))
    }

    pub fn create_barrier(&self, id: &str, required_participants: u32) -> Result<CoordinationPrimitive> {
        if required_participants == 0 {
            return Err(Error::InvalidInput(format!(
                "barrier {id} needs at least one participant"
            )));
        }
        self.insert_primitive(CoordinationPrimitive::Barrier(DistributedBarrier::new(
            id,
            required_participants,
        )))
    }

    pub fn create_queue(
        &self,
        id: &str,
        fifo: bool,
        max_size: Option<usize>,
    ) -> Result<CoordinationPrimitive> {
        if max_size == Some(0) {
            return Err(Error::InvalidInput(format!("queue {id} cannot have max_size 0")));
        }
        self.insert_primitive(CoordinationPrimitive::Queue(DistributedQueue::new(
            id, fifo, max_size,
        )))
    }

    pub fn create_election(&self, id: &str) -> Result<CoordinationPrimitive> {
        self.insert_primitive(CoordinationPrimitive::Election(LeaderElection::new(id)))
    }

    #[must_use]
    pub fn get_primitive(&self, id: &str) -> Option<CoordinationPrimitive> {
        self.shared.state.lock().primitives.get(id).cloned()
    }

    pub fn delete_primitive(&self, id: &str) -> bool {
        let removed = self.shared.state.lock().primitives.remove(id);
        if let Some(primitive) = &removed {
            coordination::record(primitive.kind().as_str(), "delete", true);
            debug!(primitive = %id, "Coordination primitive deleted");
        }
        removed.is_some()
    }

    /// All primitives, sorted by id
    #[must_use]
    pub fn list_primitives(&self) -> Vec<CoordinationPrimitive> {
        self.shared.state.lock().primitives.values().cloned().collect()
    }

    /// Run `op` on primitive `id` if it exists and has type `P`
    fn with_primitive<P, R>(&self, id: &str, op: impl FnOnce(&mut P) -> R) -> Option<R>
    where
        P: PrimitiveVariant,
    {
        let mut state = self.shared.state.lock();
        let Some(primitive) = state.primitives.get_mut(id) else {
            debug!(primitive = %id, "Unknown coordination primitive");
            return None;
        };
        let actual = primitive.kind();
        let Some(inner) = P::variant_mut(primitive) else {
            debug!(
                primitive = %id,
                expected = P::KIND.as_str(),
                actual = actual.as_str(),
                "Coordination primitive has another type"
            );
            return None;
        };
        Some(op(inner))
    }

    /// Take the lock for `ttl` (default from config).
    ///
    /// Fails while anyone, including `owner`, holds an unexpired lease.
    pub fn acquire_lock(&self, id: &str, owner: &str, ttl: Option<Duration>) -> bool {
        let ttl = ttl.unwrap_or_else(|| self.shared.config.default_lock_ttl());
        let acquired = self
            .with_primitive(id, |lock: &mut DistributedLock| {
                let now = Utc::now();
                let acquired = lock.acquire(owner, ttl, now);
                if acquired {
                    self.emit(DiscoveryEvent::LockAcquired {
                        lock_id: id.to_string(),
                        owner: owner.to_string(),
                        expires_at: lock.expires_at,
                        timestamp: now,
                    });
                }
                acquired
            })
            .unwrap_or(false);

        coordination::record(PrimitiveKind::Lock.as_str(), "acquire", acquired);
        debug!(primitive = %id, owner = %owner, acquired = acquired, "Lock acquire");
        acquired
    }

    pub fn release_lock(&self, id: &str, owner: &str) -> bool {
        let released = self
            .with_primitive(id, |lock: &mut DistributedLock| {
                let now = Utc::now();
                let released = lock.release(owner, now);
                if released {
                    self.emit(DiscoveryEvent::LockReleased {
                        lock_id: id.to_string(),
                        owner: owner.to_string(),
                        timestamp: now,
                    });
                }
                released
            })
            .unwrap_or(false);

        coordination::record(PrimitiveKind::Lock.as_str(), "release", released);
        if !released {
            debug!(primitive = %id, owner = %owner, "Lock release refused");
        }
        released
    }

    /// Push the lease of the current holder to `now + ttl`
    pub fn extend_lock(&self, id: &str, owner: &str, ttl: Duration) -> bool {
        let extended = self
            .with_primitive(id, |lock: &mut DistributedLock| {
                lock.extend(owner, ttl, Utc::now())
            })
            .unwrap_or(false);
        coordination::record(PrimitiveKind::Lock.as_str(), "extend", extended);
        extended
    }

    /// Take one permit for `ttl` (default from config); expired holders are
    /// swept first
    pub fn acquire_permit(&self, id: &str, holder: &str, ttl: Option<Duration>) -> bool {
        let ttl = ttl.unwrap_or_else(|| self.shared.config.default_permit_ttl());
        let acquired = self
            .with_primitive(id, |semaphore: &mut DistributedSemaphore| {
                let now = Utc::now();
                let acquired = semaphore.acquire(holder, ttl, now);
                if acquired {
                    self.emit(DiscoveryEvent::PermitAcquired {
                        semaphore_id: id.to_string(),
                        holder: holder.to_string(),
                        available: semaphore.available,
                        timestamp: now,
                    });
                }
                acquired
            })
            .unwrap_or(false);

        coordination::record(PrimitiveKind::Semaphore.as_str(), "acquire", acquired);
        debug!(primitive = %id, holder = %holder, acquired = acquired, "Permit acquire");
        acquired
    }

    pub fn release_permit(&self, id: &str, holder: &str) -> bool {
        let released = self
            .with_primitive(id, |semaphore: &mut DistributedSemaphore| {
                let now = Utc::now();
                let released = semaphore.release(holder, now);
                if released {
                    self.emit(DiscoveryEvent::PermitReleased {
                        semaphore_id: id.to_string(),
                        holder: holder.to_string(),
                        available: semaphore.available,
                        timestamp: now,
                    });
                }
                released
            })
            .unwrap_or(false);

        coordination::record(PrimitiveKind::Semaphore.as_str(), "release", released);
        released
    }

    /// Join a barrier; returns whether it is released.
    ///
    /// `None` if the barrier does not exist.
    pub fn join_barrier(&self, id: &str, participant: &str) -> Option<bool> {
        let released = self.with_primitive(id, |barrier: &mut DistributedBarrier| {
            let now = Utc::now();
            if barrier.join(participant, now) {
                info!(
                    primitive = %id,
                    participants = barrier.current_participants.len(),
                    "Barrier released"
                );
                self.emit(DiscoveryEvent::BarrierReleased {
                    barrier_id: id.to_string(),
                    participants: barrier.current_participants.iter().cloned().collect(),
                    timestamp: now,
                });
            }
            barrier.released
        });

        coordination::record(PrimitiveKind::Barrier.as_str(), "join", released.is_some());
        released
    }

    /// Add an item; `false` if the queue is unknown or full
    pub fn enqueue(
        &self,
        id: &str,
        payload: serde_json::Value,
        priority: i32,
        ttl: Option<Duration>,
    ) -> bool {
        let item = self
            .with_primitive(id, |queue: &mut DistributedQueue| {
                queue.enqueue(payload, priority, ttl, Utc::now())
            })
            .flatten();

        coordination::record(PrimitiveKind::Queue.as_str(), "enqueue", item.is_some());
        if item.is_none() {
            debug!(primitive = %id, "Enqueue rejected");
        }
        item.is_some()
    }

    pub fn dequeue(&self, id: &str) -> Option<QueueItem> {
        let item = self
            .with_primitive(id, |queue: &mut DistributedQueue| queue.dequeue(Utc::now()))
            .flatten();
        coordination::record(PrimitiveKind::Queue.as_str(), "dequeue", item.is_some());
        item
    }

    /// Unexpired items waiting in the queue
    #[must_use]
    pub fn queue_len(&self, id: &str) -> Option<usize> {
        self.with_primitive(id, |queue: &mut DistributedQueue| {
            queue.sweep(Utc::now());
            queue.len()
        })
    }

    fn leader_elected(&self, election: &LeaderElection, now: DateTime<Utc>) {
        info!(
            primitive = %election.id,
            leader = election.current_leader.as_deref().unwrap_or("none"),
            term = election.term,
            "Election leader changed"
        );
        self.emit(DiscoveryEvent::LeaderElected {
            election_id: election.id.clone(),
            leader: election.current_leader.clone(),
            term: election.term,
            timestamp: now,
        });
    }

    /// Insert or update a candidate and recompute the leader.
    ///
    /// `false` if the election does not exist.
    pub fn register_candidate(&self, id: &str, candidate: &str, priority: i64) -> bool {
        let registered = self
            .with_primitive(id, |election: &mut LeaderElection| {
                let now = Utc::now();
                if election.register(candidate, priority, now) {
                    self.leader_elected(election, now);
                }
            })
            .is_some();
        coordination::record(PrimitiveKind::Election.as_str(), "register", registered);
        registered
    }

    /// Remove a candidate; `false` if it was not registered
    pub fn withdraw_candidate(&self, id: &str, candidate: &str) -> bool {
        let withdrawn = self
            .with_primitive(id, |election: &mut LeaderElection| {
                let changed = election.withdraw(candidate)?;
                if changed {
                    self.leader_elected(election, Utc::now());
                }
                Some(())
            })
            .flatten()
            .is_some();
        coordination::record(PrimitiveKind::Election.as_str(), "withdraw", withdrawn);
        withdrawn
    }

    /// Current leader and term of an election
    #[must_use]
    pub fn current_leader(&self, id: &str) -> Option<(String, u64)> {
        self.with_primitive(id, |election: &mut LeaderElection| {
            election.leader().map(|(leader, term)| (leader.to_string(), term))
        })
        .flatten()
    }

    // ---- Timers ----

    fn spawn_health_timer(&self, name: &str, instance_id: &str, period: Duration) {
        let weak = Arc::downgrade(&self.shared);
        let name = name.to_string();
        let instance_id = instance_id.to_string();
        self.shared
            .timers
            .spawn(health_timer(&name, &instance_id), period, move || {
                let weak = weak.clone();
                let name = name.clone();
                let instance_id = instance_id.clone();
                async move {
                    if let Some(shared) = weak.upgrade() {
                        ServiceDiscoveryManager { shared }
                            .run_service_health_check(&name, &instance_id)
                            .await;
                    }
                }
            });
    }

    fn spawn_cleanup_timer(&self) {
        let weak = Arc::downgrade(&self.shared);
        let period = self.shared.config.cleanup_interval();
        self.shared.timers.spawn(CLEANUP_TIMER, period, move || {
            let weak = weak.clone();
            async move {
                if let Some(shared) = weak.upgrade() {
                    ServiceDiscoveryManager { shared }.cleanup_expired();
                }
            }
        });
    }
}

/// Status of an instance after a check cycle: a missed heartbeat or any
/// failing check is critical, any warning check is a warning
fn evaluate(
    instance: &ServiceInstance,
    results: &[HealthCheck],
    now: DateTime<Utc>,
) -> ServiceHealthStatus {
    if instance.is_stale(now) || results.iter().any(|c| c.status == Some(CheckStatus::Fail)) {
        ServiceHealthStatus::Critical
    } else if results.iter().any(|c| c.status == Some(CheckStatus::Warn)) {
        ServiceHealthStatus::Warning
    } else {
        ServiceHealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{CheckKind, CheckType, HealthProbe, ProbeOutcome, ProbeTarget};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct WarnProbe;

    #[async_trait]
    impl HealthProbe for WarnProbe {
        async fn execute(&self, _: &ProbeTarget, _: &HealthCheck) -> Result<ProbeOutcome> {
            Ok(ProbeOutcome::warn("slow"))
        }
    }

    fn manager() -> ServiceDiscoveryManager {
        ServiceDiscoveryManager::new(DiscoveryConfig::default(), ProbeRegistry::new()).unwrap()
    }

    fn backdate(manager: &ServiceDiscoveryManager, name: &str, id: &str, secs: i64) {
        let mut state = manager.shared.state.lock();
        let instance = state.instance_mut(name, id).unwrap();
        instance.last_heartbeat -= chrono::Duration::seconds(secs);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = DiscoveryConfig {
            event_channel_capacity: 0,
            ..Default::default()
        };
        let result = ServiceDiscoveryManager::new(config, ProbeRegistry::new());
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_register_assigns_defaults() {
        let manager = manager();
        let instance = manager
            .register_service(ServiceRegistration::new("auth", "10.0.0.5", 8080))
            .unwrap();

        assert!(instance.id.starts_with("svc_"));
        assert_eq!(instance.ttl, Duration::from_secs(30));
        assert!(instance.is_healthy());
        assert_eq!(
            manager.get_service("auth", &instance.id).unwrap().endpoint(),
            "10.0.0.5:8080"
        );

        let empty = manager.register_service(ServiceRegistration::new(" ", "10.0.0.5", 1));
        assert!(matches!(empty, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_deregister_drops_empty_bucket() {
        let manager = manager();
        let a = manager
            .register_service(ServiceRegistration::new("auth", "10.0.0.5", 1))
            .unwrap();
        let b = manager
            .register_service(ServiceRegistration::new("auth", "10.0.0.6", 1))
            .unwrap();

        assert!(manager.deregister_service("auth", &a.id));
        assert!(!manager.deregister_service("auth", &a.id));
        assert_eq!(manager.list_service_names(), vec!["auth".to_string()]);

        assert!(manager.deregister_service("auth", &b.id));
        assert!(manager.list_service_names().is_empty());
    }

    #[test]
    fn test_discover_orders_by_name() {
        let manager = manager();
        manager
            .register_service(ServiceRegistration::new("billing", "10.0.0.7", 1).with_tag("eu"))
            .unwrap();
        manager
            .register_service(ServiceRegistration::new("auth", "10.0.0.5", 1).with_tag("eu"))
            .unwrap();
        manager
            .register_service(ServiceRegistration::new("auth", "10.0.0.6", 1))
            .unwrap();

        let eu = manager.discover_services(&ServiceQuery::default().with_tag("eu"));
        let names: Vec<&str> = eu.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["auth", "billing"]);

        assert_eq!(manager.discover_services(&ServiceQuery::named("auth")).len(), 2);
        assert!(manager.discover_services(&ServiceQuery::named("gateway")).is_empty());
    }

    #[tokio::test]
    async fn test_stale_heartbeat_is_critical() {
        let manager = manager();
        let instance = manager
            .register_service(ServiceRegistration::new("auth", "10.0.0.5", 1))
            .unwrap();

        assert_eq!(
            manager.run_service_health_check("auth", &instance.id).await,
            Some(ServiceHealthStatus::Healthy)
        );

        backdate(&manager, "auth", &instance.id, 31);
        assert_eq!(
            manager.run_service_health_check("auth", &instance.id).await,
            Some(ServiceHealthStatus::Critical)
        );
        assert!(manager
            .discover_services(&ServiceQuery::named("auth").healthy_only())
            .is_empty());

        assert!(manager.heartbeat("auth", &instance.id));
        assert_eq!(
            manager.run_service_health_check("auth", &instance.id).await,
            Some(ServiceHealthStatus::Healthy)
        );
        assert!(manager.run_service_health_check("auth", "missing").await.is_none());
    }

    #[tokio::test]
    async fn test_warning_probe_changes_status() {
        let probes = ProbeRegistry::new().with_probe(CheckType::Custom, Arc::new(WarnProbe));
        let manager = ServiceDiscoveryManager::new(DiscoveryConfig::default(), probes).unwrap();
        let check = HealthCheck::new("latency", CheckKind::Custom { name: "latency".to_string() });
        let instance = manager
            .register_service(ServiceRegistration::new("auth", "10.0.0.5", 1).with_check(check))
            .unwrap();
        let mut events = manager.subscribe();

        assert_eq!(
            manager.run_service_health_check("auth", &instance.id).await,
            Some(ServiceHealthStatus::Warning)
        );
        match events.try_recv().unwrap() {
            DiscoveryEvent::ServiceHealthChanged { previous, current, .. } => {
                assert_eq!(previous, ServiceHealthStatus::Healthy);
                assert_eq!(current, ServiceHealthStatus::Warning);
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Unchanged status sends nothing
        manager.run_service_health_check("auth", &instance.id).await;
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_cleanup_sweeps_expired_instances() {
        let manager = manager();
        let stale = manager
            .register_service(ServiceRegistration::new("auth", "10.0.0.5", 1))
            .unwrap();
        let fresh = manager
            .register_service(ServiceRegistration::new("auth", "10.0.0.6", 1))
            .unwrap();

        let expired = Arc::new(AtomicUsize::new(0));
        let counter = expired.clone();
        manager.watch_service("auth", move |change: &ServiceChange| {
            if let ServiceChange::Deregistered { expired: true, .. } = change {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        backdate(&manager, "auth", &stale.id, 45);
        assert!(manager.cleanup_expired().is_empty());

        backdate(&manager, "auth", &stale.id, 30);
        let report = manager.cleanup_expired();
        assert_eq!(report.expired_instances, 1);
        assert!(manager.get_service("auth", &stale.id).is_none());
        assert!(manager.get_service("auth", &fresh.id).is_some());
        assert_eq!(expired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_primitive_factories() {
        let manager = manager();
        manager.create_lock("jobs").unwrap();
        assert!(matches!(manager.create_semaphore("jobs", 2), Err(Error::AlreadyExists(_))));
        assert!(matches!(manager.create_semaphore("pool", 0), Err(Error::InvalidInput(_))));
        assert!(matches!(manager.create_barrier("start", 0), Err(Error::InvalidInput(_))));
        assert!(matches!(manager.create_queue("work", true, Some(0)), Err(Error::InvalidInput(_))));

        manager.create_election("leader").unwrap();
        let ids: Vec<String> = manager.list_primitives().iter().map(|p| p.id().to_string()).collect();
        assert_eq!(ids, vec!["jobs".to_string(), "leader".to_string()]);

        assert!(manager.delete_primitive("jobs"));
        assert!(!manager.delete_primitive("jobs"));
        assert!(manager.get_primitive("jobs").is_none());
    }

    #[test]
    fn test_wrong_primitive_type_is_not_found() {
        let manager = manager();
        manager.create_semaphore("pool", 1).unwrap();

        assert!(!manager.acquire_lock("pool", "a", None));
        assert!(manager.join_barrier("pool", "a").is_none());
        assert!(!manager.enqueue("pool", json!(1), 0, None));
        assert!(!manager.acquire_lock("missing", "a", None));
        assert!(manager.acquire_permit("pool", "a", None));
    }

    #[test]
    fn test_lock_lifecycle_events() {
        let manager = manager();
        manager.create_lock("jobs").unwrap();
        let mut events = manager.subscribe();

        assert!(manager.acquire_lock("jobs", "a", Some(Duration::from_secs(10))));
        assert!(!manager.acquire_lock("jobs", "b", None));
        assert!(manager.extend_lock("jobs", "a", Duration::from_secs(60)));
        assert!(!manager.release_lock("jobs", "b"));
        assert!(manager.release_lock("jobs", "a"));

        let types: Vec<&str> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.event_type())
            .collect();
        assert_eq!(types, vec!["lock_acquired", "lock_released"]);
    }

    #[test]
    fn test_cleanup_expires_lock() {
        let manager = manager();
        manager.create_lock("jobs").unwrap();
        assert!(manager.acquire_lock("jobs", "a", Some(Duration::from_secs(5))));

        if let Some(CoordinationPrimitive::Lock(lock)) =
            manager.shared.state.lock().primitives.get_mut("jobs")
        {
            lock.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        }

        assert_eq!(manager.cleanup_expired().expired_locks, 1);
        assert!(manager.acquire_lock("jobs", "b", None));
    }

    #[test]
    fn test_barrier_releases_once() {
        let manager = manager();
        manager.create_barrier("start", 2).unwrap();
        let mut events = manager.subscribe();

        assert_eq!(manager.join_barrier("start", "a"), Some(false));
        assert_eq!(manager.join_barrier("start", "b"), Some(true));
        assert_eq!(manager.join_barrier("start", "c"), Some(true));

        let released = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| e.event_type() == "barrier_released")
            .count();
        assert_eq!(released, 1);
    }

    #[test]
    fn test_priority_queue_through_manager() {
        let manager = manager();
        manager.create_queue("work", false, None).unwrap();

        assert!(manager.enqueue("work", json!("low"), 1, None));
        assert!(manager.enqueue("work", json!("high"), 9, None));
        assert_eq!(manager.queue_len("work"), Some(2));

        let first = manager.dequeue("work").unwrap();
        assert_eq!(first.payload, json!("high"));
        assert_eq!(first.dequeue_attempts, 1);
        assert_eq!(manager.dequeue("work").unwrap().payload, json!("low"));
        assert!(manager.dequeue("work").is_none());
    }

    #[test]
    fn test_election_through_manager() {
        let manager = manager();
        manager.create_election("scheduler").unwrap();
        let mut events = manager.subscribe();

        assert!(manager.register_candidate("scheduler", "a", 10));
        assert!(manager.register_candidate("scheduler", "b", 20));
        assert!(manager.register_candidate("scheduler", "c", 5));
        assert_eq!(manager.current_leader("scheduler"), Some(("b".to_string(), 2)));

        assert!(manager.withdraw_candidate("scheduler", "b"));
        assert!(!manager.withdraw_candidate("scheduler", "b"));
        assert_eq!(manager.current_leader("scheduler"), Some(("a".to_string(), 3)));

        let elected = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| e.event_type() == "leader_elected")
            .count();
        assert_eq!(elected, 3);
        assert!(!manager.register_candidate("missing", "a", 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_manages_timers() {
        let manager = manager();
        let instance = manager
            .register_service(ServiceRegistration::new("auth", "10.0.0.5", 1))
            .unwrap();

        manager.start().await;
        manager.start().await;
        assert!(manager.shared.timers.contains(&health_timer("auth", &instance.id)));
        assert!(manager.shared.timers.contains(CLEANUP_TIMER));

        manager.deregister_service("auth", &instance.id);
        assert!(!manager.shared.timers.contains(&health_timer("auth", &instance.id)));

        manager.stop().await;
        manager.stop().await;
        assert!(!manager.is_running());
        assert!(manager.shared.timers.is_empty());
    }
}

//! Startup supervisor.
//!
//! Every service gets its own startup task: it waits for its dependencies,
//! passes their readiness gates, then launches its instances. One-shot
//! services run to completion before their dependents may start. Once the
//! stack is up, a single control loop owns per-instance health state and
//! acts on probe reports: routing changes and restarts.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::prober::Prober;
use super::runtime::{InstanceId, ServiceRuntime};
use crate::domain::{
    DependencyCondition, HealthAction, HealthState, ProbeKind, ResolvedSecrets, ServiceDescriptor, Topology,
};
use crate::error::{SecretError, SupervisorError};
use crate::gate::{Connector, GateTarget, ReadinessGate, DEFAULT_POLL_INTERVAL};

/// Restarts allowed per instance before the run is abandoned
pub const DEFAULT_MAX_RESTARTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub max_restarts: u32,
    /// Replaces every endpoint host, e.g. `127.0.0.1` when services run as local processes
    pub host_override: Option<String>,
    /// Interval between readiness gate attempts
    pub poll_interval: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            max_restarts: DEFAULT_MAX_RESTARTS,
            host_override: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Instance slots currently receiving traffic, per service
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: RwLock<BTreeMap<String, BTreeSet<u32>>>,
}

impl RoutingTable {
    pub async fn add(&self, service: &str, slot: u32) -> bool {
        self.routes
            .write()
            .await
            .entry(service.to_string())
            .or_default()
            .insert(slot)
    }

    pub async fn remove(&self, service: &str, slot: u32) -> bool {
        let mut routes = self.routes.write().await;
        let Some(slots) = routes.get_mut(service) else {
            return false;
        };
        let removed = slots.remove(&slot);
        if slots.is_empty() {
            routes.remove(service);
        }
        removed
    }

    pub async fn routable(&self, service: &str) -> Vec<u32> {
        self.routes
            .read()
            .await
            .get(service)
            .map(|slots| slots.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn snapshot(&self) -> BTreeMap<String, BTreeSet<u32>> {
        self.routes.read().await.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupEventKind {
    GatePassed { dependency: String },
    Started { slot: u32 },
    Completed,
    Restarted { slot: u32, restarts: u32 },
    Stopped { slot: u32 },
}

/// Something the supervisor did, stamped with the time since it was created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupEvent {
    pub service: String,
    pub kind: StartupEventKind,
    pub at: Duration,
}

/// Merge a service's literal environment with its secret bindings
pub fn service_environment(
    service: &ServiceDescriptor,
    secrets: &ResolvedSecrets,
) -> Result<BTreeMap<String, String>, SecretError> {
    let mut env = service.environment.clone();
    env.extend(secrets.bind(&service.secrets)?);
    Ok(env)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

type SlotKey = (String, u32);

enum Report {
    Probe {
        key: SlotKey,
        generation: u64,
        kind: ProbeKind,
        success: bool,
    },
    Exited {
        key: SlotKey,
        generation: u64,
        code: Option<i32>,
    },
}

struct Shared {
    topology: Topology,
    environments: BTreeMap<String, BTreeMap<String, String>>,
    runtime: Arc<dyn ServiceRuntime>,
    prober: Arc<dyn Prober>,
    connector: Arc<dyn Connector>,
    options: SupervisorOptions,
    routing: Arc<RoutingTable>,
    events: Mutex<Vec<StartupEvent>>,
    /// Live instances in start order
    running: Mutex<Vec<(SlotKey, InstanceId)>>,
    origin: Instant,
}

impl Shared {
    fn environment(&self, service: &str) -> &BTreeMap<String, String> {
        static EMPTY: BTreeMap<String, String> = BTreeMap::new();
        self.environments.get(service).unwrap_or(&EMPTY)
    }

    fn host_for(&self, service: &ServiceDescriptor) -> String {
        match (&self.options.host_override, &service.endpoint) {
            (Some(host), _) => host.clone(),
            (None, Some(endpoint)) => endpoint.host.clone(),
            (None, None) => service.name.clone(),
        }
    }

    async fn record(&self, service: &str, kind: StartupEventKind) {
        self.events.lock().await.push(StartupEvent {
            service: service.to_string(),
            kind,
            at: self.origin.elapsed(),
        });
    }

    async fn launch(&self, service: &ServiceDescriptor, slot: u32) -> Result<InstanceId> {
        let id = self
            .runtime
            .start(service, self.environment(&service.name))
            .await
            .with_context(|| format!("Failed to start {}[{}]", service.name, slot))?;
        info!("▶ Started {}[{}] ({})", service.name, slot, id);
        self.running.lock().await.push(((service.name.clone(), slot), id));
        self.record(&service.name, StartupEventKind::Started { slot }).await;
        Ok(id)
    }

    async fn forget(&self, id: InstanceId) {
        self.running.lock().await.retain(|(_, running)| *running != id);
    }

    async fn replace(&self, key: &SlotKey, id: InstanceId) {
        if let Some(entry) = self.running.lock().await.iter_mut().find(|(k, _)| k == key) {
            entry.1 = id;
        }
    }

    /// Gate on one dependency, rewriting the host when overridden
    fn gate_for(&self, service: &ServiceDescriptor, dependency: &str) -> Option<ReadinessGate> {
        self.topology
            .gates_for(service)
            .into_iter()
            .find(|g| g.dependency == dependency)
            .map(|g| {
                let target = match &self.options.host_override {
                    Some(host) => GateTarget::new(host.clone(), g.gate.target().port),
                    None => g.gate.target().clone(),
                };
                ReadinessGate::new(target, g.gate.timeout()).with_poll_interval(self.options.poll_interval)
            })
    }
}

/// Runs a topology: gated startup, health monitoring, restarts and shutdown
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl Supervisor {
    pub fn new(
        topology: Topology,
        environments: BTreeMap<String, BTreeMap<String, String>>,
        runtime: Arc<dyn ServiceRuntime>,
        prober: Arc<dyn Prober>,
        connector: Arc<dyn Connector>,
        options: SupervisorOptions,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                topology,
                environments,
                runtime,
                prober,
                connector,
                options,
                routing: Arc::new(RoutingTable::default()),
                events: Mutex::new(Vec::new()),
                running: Mutex::new(Vec::new()),
                origin: Instant::now(),
            }),
        }
    }

    pub fn routing(&self) -> Arc<RoutingTable> {
        Arc::clone(&self.shared.routing)
    }

    pub async fn events(&self) -> Vec<StartupEvent> {
        self.shared.events.lock().await.clone()
    }

    /// Start everything, then supervise until `shutdown` resolves or a fatal
    /// error occurs. Running instances are stopped in reverse start order
    /// either way.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let started = tokio::select! {
            result = self.start_all() => result,
            _ = &mut shutdown => {
                info!("Shutdown requested during startup");
                self.stop_all().await;
                return Ok(());
            }
        };
        if let Err(e) = started {
            error!("Startup failed: {:#}", e);
            self.stop_all().await;
            return Err(e);
        }
        info!("✓ All services of '{}' started", self.shared.topology.name());

        let (reports_tx, mut reports) = mpsc::channel(256);
        let mut control = ControlLoop {
            shared: Arc::clone(&self.shared),
            reports: reports_tx,
            instances: HashMap::new(),
        };
        let running = self.shared.running.lock().await.clone();
        for (key, id) in running {
            control.watch(key, id).await;
        }

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                Some(report) = reports.recv() => {
                    if let Err(e) = control.apply(report).await {
                        error!("{:#}", e);
                        break Err(e);
                    }
                }
            }
        };

        control.abort_monitors();
        self.stop_all().await;
        result
    }

    async fn start_all(&self) -> Result<()> {
        let statuses: Arc<HashMap<String, watch::Sender<ServiceStatus>>> = Arc::new(
            self.shared
                .topology
                .services()
                .iter()
                .map(|s| (s.name.clone(), watch::channel(ServiceStatus::Pending).0))
                .collect(),
        );

        let mut tasks = JoinSet::new();
        for service in self.shared.topology.services() {
            let shared = Arc::clone(&self.shared);
            let statuses = Arc::clone(&statuses);
            let name = service.name.clone();
            tasks.spawn(async move {
                let result = start_service(&shared, &name, &statuses).await;
                let status = match &result {
                    Ok(status) => *status,
                    Err(_) => ServiceStatus::Failed,
                };
                if let Some(tx) = statuses.get(&name) {
                    tx.send_replace(status);
                }
                result.map(|_| ())
            });
        }

        // The first root failure aborts the rest; anything already launched
        // is in `running` and gets stopped by the caller.
        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if !is_dependency_failure(&e) {
                        tasks.abort_all();
                    }
                    failures.push(e);
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    tasks.abort_all();
                    failures.push(anyhow::Error::from(e).context("Startup task panicked"));
                }
            }
        }

        if failures.is_empty() {
            return Ok(());
        }
        // Prefer the failure that took the others down
        let index = failures.iter().position(|e| !is_dependency_failure(e)).unwrap_or(0);
        Err(failures.swap_remove(index))
    }

    async fn stop_all(&self) {
        let running = std::mem::take(&mut *self.shared.running.lock().await);
        for ((service, slot), id) in running.into_iter().rev() {
            self.shared.routing.remove(&service, slot).await;
            match self.shared.runtime.stop(id).await {
                Ok(()) => {
                    info!("■ Stopped {}[{}]", service, slot);
                    self.shared.record(&service, StartupEventKind::Stopped { slot }).await;
                }
                Err(e) => warn!("Failed to stop {}[{}]: {:#}", service, slot, e),
            }
        }
    }
}

fn is_dependency_failure(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<SupervisorError>(),
        Some(SupervisorError::DependencyFailed { .. })
    )
}

async fn start_service(
    shared: &Shared,
    name: &str,
    statuses: &HashMap<String, watch::Sender<ServiceStatus>>,
) -> Result<ServiceStatus> {
    let service = shared
        .topology
        .service(name)
        .with_context(|| format!("Unknown service {}", name))?;

    for dependency in &service.depends_on {
        let failed = || SupervisorError::DependencyFailed {
            service: service.name.clone(),
            dependency: dependency.service.clone(),
        };

        let mut status_rx = statuses.get(&dependency.service).ok_or_else(failed)?.subscribe();
        let status = *status_rx
            .wait_for(|status| match dependency.condition {
                DependencyCondition::Reachable => *status != ServiceStatus::Pending,
                DependencyCondition::Completed => {
                    matches!(status, ServiceStatus::Completed | ServiceStatus::Failed)
                }
            })
            .await
            .map_err(|_| failed())?;

        if status == ServiceStatus::Failed {
            return Err(failed().into());
        }

        if dependency.condition == DependencyCondition::Reachable {
            if let Some(gate) = shared.gate_for(service, &dependency.service) {
                debug!("{} waiting for {} at {}", service.name, dependency.service, gate.target());
                gate.wait_with(shared.connector.as_ref()).await?;
            }
        }
        shared
            .record(
                &service.name,
                StartupEventKind::GatePassed {
                    dependency: dependency.service.clone(),
                },
            )
            .await;
    }

    if service.role.is_one_shot() {
        let mut ids = Vec::with_capacity(service.replicas as usize);
        for slot in 0..service.replicas {
            ids.push(shared.launch(service, slot).await?);
        }
        if let Some(tx) = statuses.get(name) {
            tx.send_replace(ServiceStatus::Running);
        }

        for id in ids {
            let code = shared.runtime.wait_exit(id).await?;
            shared.forget(id).await;
            if code != Some(0) {
                return Err(SupervisorError::OneShotFailed {
                    service: service.name.clone(),
                    code,
                }
                .into());
            }
        }
        info!("✓ {} completed", service.name);
        shared.record(&service.name, StartupEventKind::Completed).await;
        return Ok(ServiceStatus::Completed);
    }

    for slot in 0..service.replicas {
        shared.launch(service, slot).await?;
    }
    Ok(ServiceStatus::Running)
}

struct InstanceState {
    id: InstanceId,
    generation: u64,
    health: HealthState,
    monitors: Vec<JoinHandle<()>>,
}

/// Owns every instance's health state; the only writer of restarts
struct ControlLoop {
    shared: Arc<Shared>,
    reports: mpsc::Sender<Report>,
    instances: HashMap<SlotKey, InstanceState>,
}

impl ControlLoop {
    async fn watch(&mut self, key: SlotKey, id: InstanceId) {
        let Some(service) = self.shared.topology.service(&key.0) else {
            return;
        };
        let health = HealthState::new(&service.probes);
        if health.is_serving() {
            self.shared.routing.add(&key.0, key.1).await;
        }
        let monitors = spawn_monitors(&self.shared, &self.reports, &key, id, 0);
        self.instances.insert(
            key,
            InstanceState {
                id,
                generation: 0,
                health,
                monitors,
            },
        );
    }

    async fn apply(&mut self, report: Report) -> Result<()> {
        let (key, generation) = match &report {
            Report::Probe { key, generation, .. } | Report::Exited { key, generation, .. } => {
                (key.clone(), *generation)
            }
        };
        let Some(state) = self.instances.get_mut(&key) else {
            return Ok(());
        };
        // Reports from before a restart
        if state.generation != generation {
            return Ok(());
        }

        let actions = match report {
            Report::Probe { kind, success, .. } => {
                debug!("{}[{}] {} probe: {}", key.0, key.1, kind, if success { "ok" } else { "failed" });
                state.health.observe(kind, success)
            }
            Report::Exited { code, .. } => {
                warn!("{}[{}] exited unexpectedly (status {:?})", key.0, key.1, code);
                let mut actions = Vec::with_capacity(2);
                if state.health.is_serving() {
                    actions.push(HealthAction::RemoveFromRouting);
                }
                actions.push(HealthAction::Restart);
                actions
            }
        };

        for action in actions {
            match action {
                HealthAction::Started => info!("✓ {}[{}] passed its startup probe", key.0, key.1),
                HealthAction::AddToRouting => {
                    info!("{}[{}] is ready; routing traffic to it", key.0, key.1);
                    self.shared.routing.add(&key.0, key.1).await;
                }
                HealthAction::RemoveFromRouting => {
                    warn!("{}[{}] is not ready; removed from routing", key.0, key.1);
                    self.shared.routing.remove(&key.0, key.1).await;
                }
                HealthAction::StartupFailed => {
                    warn!("{}[{}] failed to start", key.0, key.1);
                    self.restart(&key).await?;
                }
                HealthAction::Restart => self.restart(&key).await?,
            }
        }
        Ok(())
    }

    async fn restart(&mut self, key: &SlotKey) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let Some(service) = shared.topology.service(&key.0) else {
            return Ok(());
        };
        let Some(state) = self.instances.get_mut(key) else {
            return Ok(());
        };

        if state.health.restarts() >= shared.options.max_restarts {
            return Err(SupervisorError::RestartBudgetExhausted {
                service: key.0.clone(),
                restarts: state.health.restarts(),
            }
            .into());
        }

        for monitor in state.monitors.drain(..) {
            monitor.abort();
        }
        shared.routing.remove(&key.0, key.1).await;
        if let Err(e) = shared.runtime.stop(state.id).await {
            warn!("Failed to stop {}[{}] before restart: {:#}", key.0, key.1, e);
        }

        let id = shared
            .runtime
            .start(service, shared.environment(&service.name))
            .await
            .with_context(|| format!("Failed to restart {}[{}]", key.0, key.1))?;

        state.id = id;
        state.generation += 1;
        state.health.restarted();
        shared.replace(key, id).await;

        let restarts = state.health.restarts();
        info!("↻ Restarted {}[{}] as {} (restart {}/{})", key.0, key.1, id, restarts, shared.options.max_restarts);
        shared
            .record(&key.0, StartupEventKind::Restarted { slot: key.1, restarts })
            .await;

        if state.health.is_serving() {
            shared.routing.add(&key.0, key.1).await;
        }
        state.monitors = spawn_monitors(&shared, &self.reports, key, id, state.generation);
        Ok(())
    }

    fn abort_monitors(&mut self) {
        for state in self.instances.values_mut() {
            for monitor in state.monitors.drain(..) {
                monitor.abort();
            }
        }
    }
}

/// One task per probe plus one watching for process exit
fn spawn_monitors(
    shared: &Arc<Shared>,
    reports: &mpsc::Sender<Report>,
    key: &SlotKey,
    id: InstanceId,
    generation: u64,
) -> Vec<JoinHandle<()>> {
    let Some(service) = shared.topology.service(&key.0) else {
        return Vec::new();
    };
    let host = shared.host_for(service);

    let mut monitors: Vec<JoinHandle<()>> = service
        .probes
        .iter()
        .map(|(kind, spec)| {
            let prober = Arc::clone(&shared.prober);
            let reports = reports.clone();
            let spec = spec.clone();
            let host = host.clone();
            let key = key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(spec.initial_delay).await;
                loop {
                    let success = prober.probe(&host, &spec).await;
                    let report = Report::Probe {
                        key: key.clone(),
                        generation,
                        kind,
                        success,
                    };
                    if reports.send(report).await.is_err() {
                        break;
                    }
                    tokio::time::sleep(spec.period).await;
                }
            })
        })
        .collect();

    let runtime = Arc::clone(&shared.runtime);
    let reports = reports.clone();
    let key = key.clone();
    monitors.push(tokio::spawn(async move {
        if let Ok(code) = runtime.wait_exit(id).await {
            let _ = reports.send(Report::Exited { key, generation, code }).await;
        }
    }));

    monitors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Dependency, EdgeProxySettings, ProbeSet, ProbeSpec, SecretRegistry, SecretSpec, ServiceRole, Profile,
    };
    use crate::error::{exit_code_for, GateError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MockRuntime {
        instances: StdMutex<HashMap<InstanceId, (String, bool)>>,
        starts: StdMutex<Vec<(String, Instant)>>,
        stops: StdMutex<Vec<String>>,
        exit_codes: HashMap<String, i32>,
    }

    impl MockRuntime {
        fn failing(service: &str, code: i32) -> Self {
            Self {
                exit_codes: HashMap::from([(service.to_string(), code)]),
                ..Default::default()
            }
        }

        fn started_at(&self, service: &str) -> Option<Instant> {
            self.starts
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(name, _)| name == service)
                .map(|(_, at)| *at)
        }

        fn start_count(&self, service: &str) -> usize {
            self.starts.lock().unwrap().iter().filter(|(name, _)| name == service).count()
        }
    }

    #[async_trait]
    impl ServiceRuntime for MockRuntime {
        async fn start(&self, service: &ServiceDescriptor, _env: &BTreeMap<String, String>) -> Result<InstanceId> {
            let id = InstanceId::new();
            self.instances
                .lock()
                .unwrap()
                .insert(id, (service.name.clone(), service.role.is_one_shot()));
            self.starts.lock().unwrap().push((service.name.clone(), Instant::now()));
            Ok(id)
        }

        async fn wait_exit(&self, id: InstanceId) -> Result<Option<i32>> {
            let Some((name, one_shot)) = self.instances.lock().unwrap().get(&id).cloned() else {
                return Ok(None);
            };
            if !one_shot {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(Some(self.exit_codes.get(&name).copied().unwrap_or(0)))
        }

        async fn stop(&self, id: InstanceId) -> Result<()> {
            if let Some((name, _)) = self.instances.lock().unwrap().remove(&id) {
                self.stops.lock().unwrap().push(name);
            }
            Ok(())
        }
    }

    /// A host accepts connections once its service has been up for `warmup`
    struct WarmupConnector {
        runtime: Arc<MockRuntime>,
        warmup: Duration,
    }

    #[async_trait]
    impl Connector for WarmupConnector {
        async fn connect(&self, target: &GateTarget, _budget: Duration) -> std::io::Result<()> {
            match self.runtime.started_at(&target.host) {
                Some(at) if at.elapsed() >= self.warmup => Ok(()),
                _ => Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused)),
            }
        }
    }

    struct ScriptedProber<F>(F);

    #[async_trait]
    impl<F> Prober for ScriptedProber<F>
    where
        F: Fn(&str, &ProbeSpec) -> bool + Send + Sync,
    {
        async fn probe(&self, host: &str, spec: &ProbeSpec) -> bool {
            (self.0)(host, spec)
        }
    }

    fn stack() -> Topology {
        let services = vec![
            ServiceDescriptor::new("postgres", ServiceRole::Store, "postgres").with_endpoint("postgres", 5432),
            ServiceDescriptor::new("initializer", ServiceRole::Initializer, "init")
                .with_dependency(Dependency::reachable("postgres")),
            ServiceDescriptor::new("uwsgi", ServiceRole::AppServer, "django")
                .with_endpoint("uwsgi", 3031)
                .with_dependency(Dependency::reachable("postgres"))
                .with_dependency(Dependency::completed("initializer")),
            ServiceDescriptor::new("nginx", ServiceRole::EdgeProxy, "nginx")
                .with_endpoint("nginx", 8080)
                .with_dependency(Dependency::reachable("uwsgi")),
        ];
        Topology::new(
            "test",
            services,
            Vec::new(),
            SecretRegistry::default(),
            EdgeProxySettings::default(),
        )
        .unwrap()
    }

    fn single(probes: ProbeSet) -> Topology {
        let services = vec![ServiceDescriptor::new("uwsgi", ServiceRole::AppServer, "django")
            .with_endpoint("uwsgi", 3031)
            .with_probes(probes)];
        Topology::new(
            "single",
            services,
            Vec::new(),
            SecretRegistry::default(),
            EdgeProxySettings::default(),
        )
        .unwrap()
    }

    fn supervisor(
        topology: Topology,
        runtime: Arc<MockRuntime>,
        prober: impl Prober + 'static,
        options: SupervisorOptions,
    ) -> Supervisor {
        let connector = WarmupConnector {
            runtime: Arc::clone(&runtime),
            warmup: Duration::from_secs(3),
        };
        Supervisor::new(
            topology,
            BTreeMap::new(),
            runtime,
            Arc::new(prober),
            Arc::new(connector),
            options,
        )
    }

    fn always(result: bool) -> ScriptedProber<impl Fn(&str, &ProbeSpec) -> bool + Send + Sync> {
        ScriptedProber(move |_: &str, _: &ProbeSpec| result)
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependents_start_after_dependencies() {
        let runtime = Arc::new(MockRuntime::default());
        let sup = supervisor(stack(), Arc::clone(&runtime), always(true), SupervisorOptions::default());

        sup.run(tokio::time::sleep(Duration::from_secs(60))).await.unwrap();

        let postgres = runtime.started_at("postgres").unwrap();
        let initializer = runtime.started_at("initializer").unwrap();
        let uwsgi = runtime.started_at("uwsgi").unwrap();
        let nginx = runtime.started_at("nginx").unwrap();

        // Each gate needs its target warm for 3s; the initializer runs for 1s
        assert!(initializer - postgres >= Duration::from_secs(3));
        assert!(uwsgi - initializer >= Duration::from_secs(1));
        assert!(nginx - uwsgi >= Duration::from_secs(3));

        let events = sup.events().await;
        let completed = events
            .iter()
            .position(|e| e.service == "initializer" && e.kind == StartupEventKind::Completed)
            .unwrap();
        let uwsgi_started = events
            .iter()
            .position(|e| e.service == "uwsgi" && e.kind == StartupEventKind::Started { slot: 0 })
            .unwrap();
        assert!(completed < uwsgi_started);

        // Reverse start order; the finished one-shot is not stopped
        assert_eq!(*runtime.stops.lock().unwrap(), vec!["nginx", "uwsgi", "postgres"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_instances_without_probes_are_routable() {
        let runtime = Arc::new(MockRuntime::default());
        let sup = supervisor(stack(), Arc::clone(&runtime), always(true), SupervisorOptions::default());
        let routing = sup.routing();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let sup = Arc::new(sup);
        let handle = {
            let sup = Arc::clone(&sup);
            tokio::spawn(async move {
                sup.run(async {
                    let _ = stop_rx.await;
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(routing.routable("uwsgi").await, vec![0]);
        assert_eq!(routing.routable("initializer").await, Vec::<u32>::new());

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert!(routing.snapshot().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_timeout_is_fatal() {
        let runtime = Arc::new(MockRuntime::default());
        let never = WarmupConnector {
            runtime: Arc::clone(&runtime),
            warmup: Duration::from_secs(3600),
        };
        let sup = Supervisor::new(
            stack(),
            BTreeMap::new(),
            Arc::clone(&runtime) as Arc<dyn ServiceRuntime>,
            Arc::new(always(true)),
            Arc::new(never),
            SupervisorOptions::default(),
        );

        let started = Instant::now();
        let err = sup.run(std::future::pending()).await.unwrap_err();

        assert!(matches!(err.downcast_ref::<GateError>(), Some(GateError::Timeout { .. })));
        assert_eq!(exit_code_for(&err), 124);
        assert!(started.elapsed() <= Duration::from_secs(31));
        assert_eq!(runtime.start_count("initializer"), 0);
        assert_eq!(runtime.start_count("uwsgi"), 0);
        assert_eq!(*runtime.stops.lock().unwrap(), vec!["postgres"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_failure_abandons_slower_gates() {
        let mut fast = ServiceDescriptor::new("fast", ServiceRole::Worker, "x").with_dependency(Dependency::reachable("db"));
        fast.readiness_timeout = Duration::from_secs(5);
        let mut slow =
            ServiceDescriptor::new("slow", ServiceRole::Worker, "x").with_dependency(Dependency::reachable("cache"));
        slow.readiness_timeout = Duration::from_secs(120);
        let services = vec![
            ServiceDescriptor::new("db", ServiceRole::Store, "postgres").with_endpoint("db", 5432),
            ServiceDescriptor::new("cache", ServiceRole::Broker, "redis").with_endpoint("cache", 6379),
            fast,
            slow,
        ];
        let topology = Topology::new(
            "split",
            services,
            Vec::new(),
            SecretRegistry::default(),
            EdgeProxySettings::default(),
        )
        .unwrap();

        let runtime = Arc::new(MockRuntime::default());
        let never = WarmupConnector {
            runtime: Arc::clone(&runtime),
            warmup: Duration::from_secs(3600),
        };
        let sup = Supervisor::new(
            topology,
            BTreeMap::new(),
            Arc::clone(&runtime) as Arc<dyn ServiceRuntime>,
            Arc::new(always(true)),
            Arc::new(never),
            SupervisorOptions::default(),
        );

        let started = Instant::now();
        let err = sup.run(std::future::pending()).await.unwrap_err();

        assert_eq!(exit_code_for(&err), 124);
        // Returns on the 5s gate instead of sitting out the 120s one
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(runtime.start_count("fast"), 0);
        assert_eq!(runtime.start_count("slow"), 0);

        let mut stopped = runtime.stops.lock().unwrap().clone();
        stopped.sort();
        assert_eq!(stopped, vec!["cache", "db"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_one_shot_stops_startup() {
        let runtime = Arc::new(MockRuntime::failing("initializer", 2));
        let sup = supervisor(stack(), Arc::clone(&runtime), always(true), SupervisorOptions::default());

        let err = sup.run(std::future::pending()).await.unwrap_err();

        match err.downcast_ref::<SupervisorError>() {
            Some(SupervisorError::OneShotFailed { service, code }) => {
                assert_eq!(service, "initializer");
                assert_eq!(*code, Some(2));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(exit_code_for(&err), 1);
        assert_eq!(runtime.start_count("uwsgi"), 0);
        assert_eq!(runtime.start_count("nginx"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_failures_restart_until_budget_exhausted() {
        let probes = ProbeSet {
            liveness: Some(ProbeSpec::tcp(3031).with_period(Duration::from_secs(1))),
            ..Default::default()
        };
        let runtime = Arc::new(MockRuntime::default());
        let options = SupervisorOptions {
            max_restarts: 2,
            ..Default::default()
        };
        let sup = supervisor(single(probes), Arc::clone(&runtime), always(false), options);

        let err = sup.run(std::future::pending()).await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<SupervisorError>(),
            Some(SupervisorError::RestartBudgetExhausted { restarts: 2, .. })
        ));
        assert_eq!(runtime.start_count("uwsgi"), 3);

        let restarts: Vec<u32> = sup
            .events()
            .await
            .into_iter()
            .filter_map(|e| match e.kind {
                StartupEventKind::Restarted { restarts, .. } => Some(restarts),
                _ => None,
            })
            .collect();
        assert_eq!(restarts, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_toggles_routing_without_restart() {
        let ready = Arc::new(AtomicBool::new(true));
        let probes = ProbeSet {
            readiness: Some(ProbeSpec::tcp(3031).with_period(Duration::from_secs(1))),
            ..Default::default()
        };
        let prober = {
            let ready = Arc::clone(&ready);
            ScriptedProber(move |_: &str, _: &ProbeSpec| ready.load(Ordering::SeqCst))
        };
        let runtime = Arc::new(MockRuntime::default());
        let sup = Arc::new(supervisor(single(probes), Arc::clone(&runtime), prober, SupervisorOptions::default()));
        let routing = sup.routing();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = {
            let sup = Arc::clone(&sup);
            tokio::spawn(async move {
                sup.run(async {
                    let _ = stop_rx.await;
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(routing.routable("uwsgi").await, vec![0]);

        ready.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(routing.routable("uwsgi").await.is_empty());

        ready.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(routing.routable("uwsgi").await, vec![0]);

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(runtime.start_count("uwsgi"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_override_applies_to_probes() {
        let probed = Arc::new(StdMutex::new(Vec::new()));
        let probes = ProbeSet {
            liveness: Some(ProbeSpec::tcp(3031)),
            ..Default::default()
        };
        let prober = {
            let probed = Arc::clone(&probed);
            ScriptedProber(move |host: &str, _: &ProbeSpec| {
                probed.lock().unwrap().push(host.to_string());
                true
            })
        };
        let options = SupervisorOptions {
            host_override: Some("127.0.0.1".to_string()),
            ..Default::default()
        };
        let runtime = Arc::new(MockRuntime::default());
        let sup = supervisor(single(probes), runtime, prober, options);

        sup.run(tokio::time::sleep(Duration::from_secs(5))).await.unwrap();
        assert!(probed.lock().unwrap().iter().all(|h| h == "127.0.0.1"));
        assert!(!probed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_service_environment_merges_secrets() {
        let registry = SecretRegistry::new([SecretSpec {
            name: "database_password".to_string(),
            env: "DD_DATABASE_PASSWORD".to_string(),
            insecure_default: Some("defectdojo".to_string()),
        }]);
        let secrets = registry.resolve(Profile::Evaluation, |_| None).unwrap();

        let mut service = ServiceDescriptor::new("postgres", ServiceRole::Store, "postgres")
            .with_secret("POSTGRES_PASSWORD", "database_password");
        service
            .environment
            .insert("POSTGRES_DB".to_string(), "defectdojo".to_string());

        let env = service_environment(&service, &secrets).unwrap();
        assert_eq!(env.get("POSTGRES_DB").map(String::as_str), Some("defectdojo"));
        assert_eq!(env.get("POSTGRES_PASSWORD").map(String::as_str), Some("defectdojo"));
    }
}

//! Test helpers for orchestrator and recovery tests
//!
//! Provides an in-memory database, a scripted agent fleet running on top of
//! the real [`AgentManager`], scripted placement collaborators and a
//! [`TestEnvironment`] wiring all of it into an [`Orchestrator`].

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use redb::{backends::InMemoryBackend, Database};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::{
    agent::{
        command::{
            CheckVmStateAnswer, CheckVmStateCommand, MigrateWithStorageAnswer,
            MigrateWithStorageCommand, MigrateWithStorageCompleteCommand,
            MigrateWithStorageReceiveAnswer, MigrateWithStorageReceiveCommand, VolumePath,
            VolumeTarget,
        },
        AgentCommand, AgentDispatcher, AgentManager, AgentRequest, Answer,
    },
    config::StratusConfig,
    error::{StratusError, StratusResult},
    guru::{GuruRegistry, VmGuru},
    orchestrator::{Orchestrator, OrchestratorDeps, SnapshotTracker},
    placement::{
        CapacityManager, DeploymentPlanner, ExcludeList, PersistentResourceCounter,
        PlacementRequest, ResourceAccounting,
    },
    recovery::RecoveryScanner,
    state_machine::{StateMachine, TransitionRequest},
    state_table::{Event, State},
    storage::{init_database_tables, Inventory, VmRecordStore},
    types::*,
    work_ledger::WorkLedger,
};

/// Fresh in-memory database with every table created.
pub fn in_memory_database() -> StratusResult<Arc<Database>> {
    let database = Arc::new(Database::builder().create_with_backend(InMemoryBackend::new())?);
    init_database_tables(&database)?;
    Ok(database)
}

/// How the fleet answers one command
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Succeed(Bytes),
    Fail(String),
    /// Hold the request without answering so the dispatcher times out
    Timeout,
    /// Drop the request so the dispatcher sees the agent go away
    Drop,
}

#[derive(Default)]
struct FleetState {
    scripts: HashMap<(HostId, String), VecDeque<ScriptedReply>>,
    power: HashMap<HostId, PowerState>,
    log: Vec<(HostId, String)>,
    held: Vec<AgentRequest>,
}

impl FleetState {
    fn handle(&mut self, host_id: HostId, request: AgentRequest) {
        let kind = request.command.kind.clone();
        self.log.push((host_id, kind.clone()));

        let scripted = self
            .scripts
            .get_mut(&(host_id, kind.clone()))
            .and_then(|queue| queue.pop_front());

        let answer = match scripted {
            Some(ScriptedReply::Succeed(payload)) => Answer::success(payload),
            Some(ScriptedReply::Fail(details)) => Answer::failure(details),
            Some(ScriptedReply::Timeout) => {
                self.held.push(request);
                return;
            }
            Some(ScriptedReply::Drop) => return,
            None => self.default_answer(host_id, &kind, &request.command.payload),
        };
        request.respond(answer);
    }

    fn default_answer(&self, host_id: HostId, kind: &str, payload: &[u8]) -> Answer {
        let answer = match kind {
            k if k == CheckVmStateCommand::KIND => Answer::with_body(&CheckVmStateAnswer {
                power_state: self
                    .power
                    .get(&host_id)
                    .copied()
                    .unwrap_or(PowerState::Unknown),
            }),
            k if k == MigrateWithStorageCommand::KIND => {
                bincode::deserialize::<MigrateWithStorageCommand>(payload)
                    .map_err(StratusError::from)
                    .and_then(|command| Answer::with_body(&migrated_paths(&command.volumes)))
            }
            k if k == MigrateWithStorageCompleteCommand::KIND => {
                bincode::deserialize::<MigrateWithStorageCompleteCommand>(payload)
                    .map_err(StratusError::from)
                    .and_then(|command| Answer::with_body(&migrated_paths(&command.volumes)))
            }
            k if k == MigrateWithStorageReceiveCommand::KIND => {
                bincode::deserialize::<MigrateWithStorageReceiveCommand>(payload)
                    .map_err(StratusError::from)
                    .and_then(|command| {
                        Answer::with_body(&MigrateWithStorageReceiveAnswer {
                            token: format!("token-{}", command.vm_uuid),
                            volume_to_storage: command
                                .volumes
                                .iter()
                                .map(|v| (v.volume_id, format!("sr-{}", v.pool_id)))
                                .collect(),
                            nic_to_network: vec![("nic-0".to_string(), "guest-net".to_string())],
                        })
                    })
            }
            _ => Ok(Answer::success(Bytes::new())),
        };
        answer.unwrap_or_else(|e| Answer::failure(e.to_string()))
    }
}

fn migrated_paths(volumes: &[VolumeTarget]) -> MigrateWithStorageAnswer {
    MigrateWithStorageAnswer {
        volumes: volumes
            .iter()
            .map(|v| VolumePath {
                volume_id: v.volume_id,
                path: format!("{}/{}-migrated", v.pool_path, v.volume_id),
            })
            .collect(),
    }
}

/// Host agents that answer from a script and record every dispatch.
///
/// Unscripted commands succeed. Status probes answer from the power state
/// set with [`set_power_state`](Self::set_power_state), `Unknown` otherwise.
#[derive(Clone)]
pub struct ScriptedAgentFleet {
    manager: Arc<AgentManager>,
    state: Arc<Mutex<FleetState>>,
}

impl ScriptedAgentFleet {
    pub fn new(channel_depth: usize) -> Self {
        Self {
            manager: Arc::new(AgentManager::new(channel_depth)),
            state: Arc::new(Mutex::new(FleetState::default())),
        }
    }

    pub fn dispatcher(&self) -> Arc<dyn AgentDispatcher> {
        self.manager.clone()
    }

    /// Attach a scripted agent for `host_id`. Needs a running tokio runtime.
    pub fn connect(&self, host_id: HostId) {
        let session = self.manager.connect(host_id);
        let state = self.state.clone();
        session.serve(move |request| state.lock().handle(host_id, request));
    }

    pub fn disconnect(&self, host_id: HostId) {
        self.manager.disconnect(host_id);
    }

    pub fn script<C: AgentCommand>(&self, host_id: HostId, reply: ScriptedReply) {
        self.state
            .lock()
            .scripts
            .entry((host_id, C::KIND.to_string()))
            .or_default()
            .push_back(reply);
    }

    pub fn succeed_with<C: AgentCommand>(&self, host_id: HostId, answer: &C::Answer) {
        let payload = Bytes::from(bincode::serialize(answer).unwrap_or_default());
        self.script::<C>(host_id, ScriptedReply::Succeed(payload));
    }

    pub fn fail<C: AgentCommand>(&self, host_id: HostId, details: &str) {
        self.script::<C>(host_id, ScriptedReply::Fail(details.to_string()));
    }

    pub fn time_out<C: AgentCommand>(&self, host_id: HostId) {
        self.script::<C>(host_id, ScriptedReply::Timeout);
    }

    pub fn drop_request<C: AgentCommand>(&self, host_id: HostId) {
        self.script::<C>(host_id, ScriptedReply::Drop);
    }

    pub fn set_power_state(&self, host_id: HostId, power_state: PowerState) {
        self.state.lock().power.insert(host_id, power_state);
    }

    /// Every dispatch in arrival order, probes included.
    pub fn dispatches(&self) -> Vec<(HostId, String)> {
        self.state.lock().log.clone()
    }

    /// Dispatches other than status probes.
    pub fn operations(&self) -> Vec<(HostId, String)> {
        self.dispatches()
            .into_iter()
            .filter(|(_, kind)| kind != CheckVmStateCommand::KIND)
            .collect()
    }

    pub fn count_of<C: AgentCommand>(&self) -> usize {
        self.dispatches()
            .iter()
            .filter(|(_, kind)| kind == C::KIND)
            .count()
    }

    pub fn clear_dispatches(&self) {
        self.state.lock().log.clear();
    }
}

/// Planner returning candidates in a fixed order, honoring the preferred
/// host when it is a candidate.
#[derive(Default)]
pub struct StaticPlanner {
    candidates: Mutex<Vec<HostId>>,
    calls: Mutex<Vec<ExcludeList>>,
}

impl StaticPlanner {
    pub fn new(candidates: Vec<HostId>) -> Self {
        Self {
            candidates: Mutex::new(candidates),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_candidates(&self, candidates: Vec<HostId>) {
        *self.candidates.lock() = candidates;
    }

    /// Exclusion set seen by each call
    pub fn calls(&self) -> Vec<ExcludeList> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl DeploymentPlanner for StaticPlanner {
    async fn select_host(
        &self,
        request: &PlacementRequest,
        exclude: &ExcludeList,
    ) -> StratusResult<Option<HostId>> {
        self.calls.lock().push(exclude.clone());
        let candidates = self.candidates.lock();
        if let Some(preferred) = request.preferred_host {
            if candidates.contains(&preferred) && !exclude.should_avoid(preferred) {
                return Ok(Some(preferred));
            }
        }
        Ok(candidates
            .iter()
            .copied()
            .find(|host| !exclude.should_avoid(*host)))
    }
}

/// Capacity probe that denies a configurable set of hosts
#[derive(Default)]
pub struct ScriptedCapacity {
    denied: Mutex<HashSet<HostId>>,
    probed: Mutex<Vec<HostId>>,
}

impl ScriptedCapacity {
    pub fn deny(&self, host_id: HostId) {
        self.denied.lock().insert(host_id);
    }

    pub fn probed(&self) -> Vec<HostId> {
        self.probed.lock().clone()
    }
}

#[async_trait]
impl CapacityManager for ScriptedCapacity {
    async fn host_has_capacity(
        &self,
        host_id: HostId,
        _delta: &ComputeResources,
    ) -> StratusResult<bool> {
        self.probed.lock().push(host_id);
        Ok(!self.denied.lock().contains(&host_id))
    }
}

/// Guru that records callbacks and can refuse starts
#[derive(Default)]
pub struct RecordingGuru {
    events: Mutex<Vec<String>>,
    refuse_start: Mutex<bool>,
}

impl RecordingGuru {
    pub fn refuse_start(&self, refuse: bool) {
        *self.refuse_start.lock() = refuse;
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl VmGuru for RecordingGuru {
    async fn finalize_start(
        &self,
        vm: &VirtualMachineInstance,
        host_id: HostId,
    ) -> StratusResult<()> {
        self.events
            .lock()
            .push(format!("finalize_start:{}:{}", vm.id, host_id));
        if *self.refuse_start.lock() {
            return Err(StratusError::runtime_fault(
                "guest did not report in",
            ));
        }
        Ok(())
    }

    async fn prepare_stop(&self, vm: &VirtualMachineInstance) -> StratusResult<()> {
        self.events.lock().push(format!("prepare_stop:{}", vm.id));
        Ok(())
    }

    async fn finalize_stop(&self, vm: &VirtualMachineInstance) -> StratusResult<()> {
        self.events.lock().push(format!("finalize_stop:{}", vm.id));
        Ok(())
    }
}

/// Snapshot tracker with a settable set of busy VMs
#[derive(Default)]
pub struct SnapshotFlags {
    pending: Mutex<HashSet<VmId>>,
}

impl SnapshotFlags {
    pub fn set_pending(&self, vm_id: VmId) {
        self.pending.lock().insert(vm_id);
    }
}

#[async_trait]
impl SnapshotTracker for SnapshotFlags {
    async fn has_pending_snapshot(&self, vm_id: VmId) -> StratusResult<bool> {
        Ok(self.pending.lock().contains(&vm_id))
    }
}

/// Host in `cluster` (pod 1, zone 1), up, enabled, running kvm guests.
pub fn host(id: u64, cluster: u64) -> HostRecord {
    HostRecord {
        id: HostId(id),
        name: format!("host-{}", id),
        zone_id: ZoneId(1),
        pod_id: PodId(1),
        cluster_id: ClusterId(cluster),
        status: HostStatus::Up,
        enabled: true,
        max_guests: 50,
        capabilities: vec!["kvm".to_string()],
    }
}

/// Cluster-scoped shared pool, or a host-local pool when `local` is set.
pub fn pool(id: u64, cluster: u64, local: bool) -> StoragePoolRecord {
    StoragePoolRecord {
        id: PoolId(id),
        name: format!("pool-{}", id),
        scope: if local { PoolScope::Host } else { PoolScope::Cluster },
        path: format!("/mnt/pool-{}", id),
        pod_id: Some(PodId(1)),
        cluster_id: Some(ClusterId(cluster)),
    }
}

pub fn volume(id: u64, vm_id: u64, pool_id: u64, use_local_storage: bool) -> VolumeRecord {
    VolumeRecord {
        id: VolumeId(id),
        vm_id: Some(VmId(vm_id)),
        name: format!("vol-{}", id),
        pool_id: PoolId(pool_id),
        last_pool_id: None,
        path: format!("vol-{}-path", id),
        folder: None,
        pod_id: Some(PodId(1)),
        use_local_storage,
    }
}

/// Stopped user VM with 2 vCPU / 2 GiB in account 1, zone 1.
pub fn vm(id: u64) -> VirtualMachineInstance {
    let mut vm = VirtualMachineInstance::new(VmId(id), format!("vm-{}", id), AccountId(1), ZoneId(1));
    vm.uuid = format!("vm-uuid-{}", id);
    vm.pod_id = Some(PodId(1));
    vm.resources = ComputeResources::new(2, 2048);
    vm
}

/// Everything an orchestrator test needs, sharing one database
pub struct TestEnvironment {
    pub config: StratusConfig,
    pub database: Arc<Database>,
    pub store: Arc<VmRecordStore>,
    pub engine: Arc<StateMachine>,
    pub ledger: Arc<WorkLedger>,
    pub inventory: Arc<Inventory>,
    pub fleet: ScriptedAgentFleet,
    pub planner: Arc<StaticPlanner>,
    pub capacity: Arc<ScriptedCapacity>,
    pub accounting: Arc<PersistentResourceCounter>,
    pub guru: Arc<RecordingGuru>,
    pub snapshots: Arc<SnapshotFlags>,
    pub orchestrator: Arc<Orchestrator>,
}

impl TestEnvironment {
    pub fn new() -> StratusResult<Self> {
        Self::with_config(StratusConfig::test())
    }

    pub fn with_config(config: StratusConfig) -> StratusResult<Self> {
        Self::with_database(in_memory_database()?, config)
    }

    /// Build on an existing database, e.g. one reopened after a simulated
    /// restart.
    pub fn with_database(database: Arc<Database>, config: StratusConfig) -> StratusResult<Self> {
        init_database_tables(&database)?;
        let store = Arc::new(VmRecordStore::new(database.clone()));
        let engine = Arc::new(StateMachine::new(store.clone()));
        let ledger = Arc::new(WorkLedger::new(
            database.clone(),
            NodeId(config.node_id),
            config.work.lock_wait,
        ));
        let inventory = Arc::new(Inventory::new(database.clone()));
        let fleet = ScriptedAgentFleet::new(config.agent.channel_depth);
        let planner = Arc::new(StaticPlanner::default());
        let capacity = Arc::new(ScriptedCapacity::default());
        let accounting = Arc::new(PersistentResourceCounter::new(database.clone()));
        let guru = Arc::new(RecordingGuru::default());
        let snapshots = Arc::new(SnapshotFlags::default());

        let orchestrator = Arc::new(Orchestrator::new(
            &config,
            OrchestratorDeps {
                engine: engine.clone(),
                ledger: ledger.clone(),
                dispatcher: fleet.dispatcher(),
                inventory: inventory.clone(),
                planner: planner.clone(),
                capacity: capacity.clone(),
                accounting: accounting.clone() as Arc<dyn ResourceAccounting>,
                gurus: Arc::new(GuruRegistry::with_all(guru.clone())),
                snapshots: snapshots.clone(),
            },
        ));

        Ok(Self {
            config,
            database,
            store,
            engine,
            ledger,
            inventory,
            fleet,
            planner,
            capacity,
            accounting,
            guru,
            snapshots,
            orchestrator,
        })
    }

    /// Register a host and attach a scripted agent for it.
    pub fn add_host(&self, host: HostRecord) -> StratusResult<()> {
        self.inventory.put_host(&host)?;
        self.fleet.connect(host.id);
        Ok(())
    }

    pub fn add_vm(&self, vm: &VirtualMachineInstance) -> StratusResult<()> {
        self.store.create(vm)
    }

    /// Drive a registered VM to `Running` on `host_id` without dispatching.
    pub fn place_running(&self, vm_id: VmId, host_id: HostId) -> StratusResult<VirtualMachineInstance> {
        self.engine.transition(
            TransitionRequest::new(vm_id, State::Stopped, Event::StartRequested).on_host(host_id),
        )?;
        self.engine.transition(TransitionRequest::new(
            vm_id,
            State::Starting,
            Event::OperationSucceeded,
        ))
    }

    pub fn recovery_scanner(&self) -> RecoveryScanner {
        RecoveryScanner::new(
            self.ledger.clone(),
            self.engine.clone(),
            self.inventory.clone(),
            self.fleet.dispatcher(),
            self.config.agent.probe_wait,
        )
    }
}

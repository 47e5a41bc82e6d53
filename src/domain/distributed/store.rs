use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::api::snapshot_dto::StateSnapshotDto;
use crate::domain::codec::ValueCodec;
use crate::domain::distributed::comm::{Communicator, Tag};
use crate::domain::distributed::framing;
use crate::domain::distributed::identity::WorkerIdentity;
use crate::domain::distributed::protocol::{self, ControlMsg};
use crate::domain::executor::{NodeExecutor, ResolvedInput, ResolvedInputs};
use crate::domain::node::{InputSpec, NodeData, NodeId, NodeOutputs, NodeValue, WorkerId};
use crate::domain::specialization::SpecializationTable;
use crate::domain::state_store::NodeStateStore;
use crate::error::{Error, Result};

/// Coordinator rank. The worker that wins every announcement broadcast.
pub(crate) const COORDINATOR: WorkerId = WorkerId(0);

pub(crate) struct CoordState {
    /// Ownership decisions, converged across the group.
    pub(crate) assignments: HashMap<NodeId, WorkerId>,

    /// Nodes whose owners have announced a produced output, by announcing
    /// rank. Advisory; the fetch path never consults it.
    pub(crate) announced: HashMap<NodeId, WorkerId>,

    /// Number of announcement collectives this worker has entered. Workers
    /// of one group must agree on it at every quiet point; a difference
    /// means the registration streams diverged.
    pub(crate) collective_seq: u64,
}

pub(crate) struct Shared<V> {
    pub(crate) identity: WorkerIdentity,
    pub(crate) table: SpecializationTable,
    pub(crate) local: NodeStateStore<V>,
    pub(crate) codec: Arc<dyn ValueCodec<V>>,
    pub(crate) comm: Option<Arc<dyn Communicator>>,
    pub(crate) coord: Mutex<CoordState>,

    /// Serializes outbound fetches so request/reply exchanges with owners
    /// cannot interleave, and numbers each exchange. Held across the await,
    /// unlike `coord`.
    pub(crate) fetch_gate: tokio::sync::Mutex<u64>,

    /// Patience for one fetch exchange. `None` waits indefinitely, matching
    /// device-group semantics where a lost peer stalls the group anyway.
    pub(crate) fetch_timeout: Option<Duration>,
}

/// Per-process handle on the distributed node state.
///
/// Owns the local store, the converged assignment table and the group
/// communicator. Reads and writes of node outputs go through here so that
/// remote ownership stays invisible to the engine: `get_output` on a node
/// owned elsewhere turns into a fetch, everything else stays local.
///
/// Clones share one underlying state; hand a clone to the output service
/// and to every engine thread.
pub struct DistributedNodeStore<V> {
    pub(crate) shared: Arc<Shared<V>>,
}

impl<V> Clone for DistributedNodeStore<V> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<V: NodeValue> DistributedNodeStore<V> {
    /// Store for a process that runs alone. Every node is owned locally and
    /// nothing is ever announced or fetched.
    pub fn single_process(codec: Arc<dyn ValueCodec<V>>) -> Self {
        Self::build(WorkerIdentity::single_process(), SpecializationTable::new(), codec, None, None)
    }

    /// Store for a member of a worker group.
    ///
    /// # Returns
    /// Returns `Error::ConfigError` when a distributed identity arrives
    /// without a communicator, or when the communicator's membership does
    /// not match the identity.
    pub fn new(
        identity: WorkerIdentity,
        table: SpecializationTable,
        codec: Arc<dyn ValueCodec<V>>,
        comm: Option<Arc<dyn Communicator>>,
        fetch_timeout: Option<Duration>,
    ) -> Result<Self> {
        if identity.distributed {
            let group = comm
                .as_ref()
                .ok_or_else(|| Error::ConfigError("a distributed identity needs a communicator".to_string()))?;

            if group.rank() != identity.rank || group.world_size() != identity.world_size {
                return Err(Error::ConfigError(format!(
                    "communicator membership (rank {}, world size {}) does not match the worker identity (rank {}, world size {})",
                    group.rank(),
                    group.world_size(),
                    identity.rank,
                    identity.world_size,
                )));
            }
        }

        Ok(Self::build(identity, table, codec, comm, fetch_timeout))
    }

    fn build(
        identity: WorkerIdentity,
        table: SpecializationTable,
        codec: Arc<dyn ValueCodec<V>>,
        comm: Option<Arc<dyn Communicator>>,
        fetch_timeout: Option<Duration>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                identity,
                table,
                local: NodeStateStore::new(),
                codec,
                comm,
                coord: Mutex::new(CoordState {
                    assignments: HashMap::new(),
                    announced: HashMap::new(),
                    collective_seq: 0,
                }),
                fetch_gate: tokio::sync::Mutex::new(0),
                fetch_timeout,
            }),
        }
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.shared.identity
    }

    /// The local state store behind this handle. Execution engines use it
    /// for instance binding and other strictly process-local state.
    pub fn local(&self) -> &NodeStateStore<V> {
        &self.shared.local
    }

    /// How many announcement collectives this worker has entered so far.
    /// Group members must agree on this number at every quiet point.
    pub fn collective_seq(&self) -> u64 {
        self.lock_coord().collective_seq
    }

    /// The converged owner of `node_id`, if an assignment exists.
    pub fn owner_of(&self, node_id: &NodeId) -> Option<WorkerId> {
        self.lock_coord().assignments.get(node_id).copied()
    }

    /// Whether some worker has announced an output for `node_id`.
    pub fn is_output_announced(&self, node_id: &NodeId) -> bool {
        self.lock_coord().announced.contains_key(node_id)
    }

    /// The rank that last announced an output for `node_id`.
    pub fn announced_source(&self, node_id: &NodeId) -> Option<WorkerId> {
        self.lock_coord().announced.get(node_id).copied()
    }

    /// Registers a node group-wide.
    ///
    /// Ownership resolves from the specialization table by the node's type;
    /// an unclaimed type falls back to the registering worker's own rank.
    /// In a group, the decision is then announced on the collective path and
    /// the coordinator's version is adopted everywhere, so every member must
    /// register the same nodes in the same order. Only the final owner keeps
    /// the full registration record.
    ///
    /// # Returns
    /// Returns the converged owner of the node.
    pub async fn register(&self, node_id: NodeId, data: NodeData) -> Result<WorkerId> {
        let me = self.shared.identity.rank;

        let mut owner = if self.shared.identity.distributed {
            self.shared.table.resolve_owner(&data.class_type).unwrap_or(me)
        } else {
            me
        };

        // Record the local decision before the announcement round so the
        // serve loop never observes the node as unassigned in between.
        self.lock_coord().assignments.insert(node_id.clone(), owner);

        if self.shared.identity.distributed {
            owner = self.announce_assignment(&node_id, owner).await?;
        }

        if owner == me {
            self.shared.local.register(node_id.clone(), data);
            log::info!("registered node {node_id} locally as owner (worker {me})");
        } else {
            log::info!("registered node {node_id} remotely; owner is worker {owner}");
        }

        Ok(owner)
    }

    /// One announcement collective. Every member contributes its locally
    /// resolved decision by entering the broadcast; the coordinator's bytes
    /// win and everyone adopts them.
    async fn announce_assignment(&self, node_id: &NodeId, owner: WorkerId) -> Result<WorkerId> {
        let comm = self.communicator()?;

        let payload = if comm.rank() == COORDINATOR {
            Some(protocol::encode_control(&ControlMsg::Assignment { node_id: node_id.clone(), owner })?)
        } else {
            None
        };

        let announced = framing::broadcast_framed(comm.as_ref(), COORDINATOR, payload.as_deref()).await?;
        self.lock_coord().collective_seq += 1;

        match protocol::decode_control(&announced)? {
            ControlMsg::Assignment { node_id: announced_id, owner: announced_owner } => {
                self.apply_assignment(announced_id.clone(), announced_owner);

                if announced_id != *node_id {
                    // The group decided about a different node than this
                    // caller entered with: the registration streams diverged.
                    return Err(Error::ProtocolError(format!(
                        "assignment announcement for node {announced_id} arrived while registering node {node_id}"
                    )));
                }

                Ok(announced_owner)
            }
            other => Err(Error::ProtocolError(format!(
                "expected an assignment announcement, got {other:?}"
            ))),
        }
    }

    /// The value in output slot `slot` of `node_id`, wherever it lives.
    ///
    /// Locally owned and unassigned nodes are answered from the local store.
    /// A node owned by a peer turns into one fetch exchange with that peer.
    ///
    /// # Returns
    /// Returns `Ok(None)` when the node has not produced that slot yet, on
    /// whichever worker owns it. A missing output is an expected state, not
    /// a fault.
    pub async fn get_output(&self, node_id: &NodeId, slot: usize) -> Result<Option<V>> {
        if !self.shared.identity.distributed {
            return Ok(self.shared.local.get_output(node_id, slot));
        }

        match self.owner_of(node_id) {
            Some(owner) if owner != self.shared.identity.rank => self.fetch_remote(node_id, slot, owner).await,
            // An unassigned node never causes a network round-trip.
            _ => Ok(self.shared.local.get_output(node_id, slot)),
        }
    }

    /// Stores the output record of `node_id` in the local store and, in a
    /// group, announces its availability to every peer.
    ///
    /// A worker only ever writes its own store; peers that want the value
    /// fetch it from here. The announcement is point-to-point fan-out, not a
    /// collective, so workers that never produce a given node owe no
    /// matching call.
    pub async fn set_output(&self, node_id: &NodeId, outputs: NodeOutputs<V>) -> Result<()> {
        self.shared.local.set_output(node_id.clone(), outputs);
        log::debug!("stored output of node {node_id} on worker {}", self.shared.identity.rank);

        if self.shared.identity.distributed {
            self.announce_availability(node_id).await?;
        }

        Ok(())
    }

    async fn announce_availability(&self, node_id: &NodeId) -> Result<()> {
        let comm = self.communicator()?;
        let me = self.shared.identity.rank;

        let msg = protocol::encode_control(&ControlMsg::Availability {
            node_id: node_id.clone(),
            has_output: self.shared.local.has_output(node_id),
            source: me,
        })?;

        for peer in 0..comm.world_size() as u32 {
            let peer = WorkerId(peer);
            if peer != me {
                framing::send_framed(comm.as_ref(), peer, Tag::Control, &msg).await?;
            }
        }

        Ok(())
    }

    /// Sets one custom input of `node_id` on this worker. Custom inputs are
    /// process-local; peers resolve their own.
    pub fn set_custom_input(&self, node_id: &NodeId, name: impl Into<String>, value: serde_json::Value) {
        self.shared.local.set_custom_input(node_id.clone(), name, value);
    }

    pub fn get_custom_inputs(&self, node_id: &NodeId) -> HashMap<String, serde_json::Value> {
        self.shared.local.get_custom_inputs(node_id)
    }

    /// Resolves the declared inputs of a locally registered node.
    ///
    /// Custom inputs shadow declared inputs of the same name and are also
    /// injected when they shadow nothing. Link inputs go through
    /// [`DistributedNodeStore::get_output`], so upstream nodes owned by
    /// peers are fetched transparently.
    pub async fn resolve_inputs(&self, node_id: &NodeId) -> Result<ResolvedInputs<V>> {
        let data = self
            .shared
            .local
            .node_data(node_id)
            .ok_or_else(|| Error::UnknownNode(node_id.clone()))?;
        let custom = self.shared.local.get_custom_inputs(node_id);

        let mut resolved = ResolvedInputs::new();

        for (name, spec) in data.inputs {
            if let Some(value) = custom.get(&name) {
                resolved.insert(name, ResolvedInput::Literal(value.clone()));
                continue;
            }

            match spec {
                InputSpec::Literal(value) => {
                    resolved.insert(name, ResolvedInput::Literal(value));
                }
                InputSpec::Link(source, slot) => match self.get_output(&source, slot).await? {
                    Some(value) => {
                        resolved.insert(name, ResolvedInput::Computed(value));
                    }
                    None => {
                        return Err(Error::ExecutionError(format!(
                            "input '{name}' of node {node_id} references node {source} slot {slot}, which has no output yet"
                        )));
                    }
                },
            }
        }

        for (name, value) in custom {
            resolved.entry(name).or_insert_with(|| ResolvedInput::Literal(value));
        }

        Ok(resolved)
    }

    /// Runs one locally owned node through the engine: resolve inputs,
    /// execute, stamp the record, store and announce the outputs.
    ///
    /// # Returns
    /// Returns the outputs the engine produced. `Error::UnknownNode` when
    /// this worker does not own the node; execution never happens on
    /// non-owners.
    pub async fn execute_node(&self, node_id: &NodeId, executor: &dyn NodeExecutor<V>) -> Result<NodeOutputs<V>> {
        let data = self
            .shared
            .local
            .node_data(node_id)
            .ok_or_else(|| Error::UnknownNode(node_id.clone()))?;

        let inputs = self.resolve_inputs(node_id).await?;

        let outputs = executor
            .execute(node_id, &data, inputs)
            .await
            .map_err(Error::ExecutionError)?;

        self.shared.local.mark_executed(node_id)?;
        self.set_output(node_id, outputs.clone()).await?;

        log::info!("executed node {node_id} ({} output slots)", outputs.len());
        Ok(outputs)
    }

    /// Debug export of this worker's view: local records plus the converged
    /// assignment table.
    pub fn export_snapshot(&self) -> StateSnapshotDto {
        let mut snapshot = self.shared.local.export_snapshot();
        snapshot.distributed = self.shared.identity.distributed;
        snapshot.worker = Some(self.shared.identity.rank.0);

        let coord = self.lock_coord();
        for (node_id, owner) in &coord.assignments {
            snapshot.assignments.insert(node_id.as_str().to_string(), owner.0);

            if let Some(node) = snapshot.nodes.get_mut(node_id.as_str()) {
                node.owner = Some(owner.0);
            }
        }

        snapshot
    }

    pub(crate) fn apply_assignment(&self, node_id: NodeId, owner: WorkerId) {
        log::debug!("adopting assignment: node {node_id} -> worker {owner}");
        self.lock_coord().assignments.insert(node_id, owner);
    }

    pub(crate) fn apply_availability(&self, node_id: NodeId, has_output: bool, source: WorkerId) {
        let mut coord = self.lock_coord();
        if has_output {
            coord.announced.insert(node_id, source);
        } else {
            coord.announced.remove(&node_id);
        }
    }

    pub(crate) fn communicator(&self) -> Result<Arc<dyn Communicator>> {
        self.shared
            .comm
            .clone()
            .ok_or_else(|| Error::ConfigError("no communicator attached to this store".to_string()))
    }

    pub(crate) fn lock_coord(&self) -> MutexGuard<'_, CoordState> {
        self.shared.coord.lock().expect("Mutex poisoned")
    }
}

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use futures::future::select_all;
use serde_json::json;

use flowmesh::domain::codec::JsonCodec;
use flowmesh::domain::distributed::comm::{ChannelGroup, Communicator, TcpGroup};
use flowmesh::domain::distributed::{DistributedNodeStore, OutputService, WorkerIdentity};
use flowmesh::domain::executor::{NodeExecutor, ResolvedInput, ResolvedInputs};
use flowmesh::domain::graph::execution_order;
use flowmesh::domain::node::{NodeData, NodeId, NodeOutputs, WorkerId};
use flowmesh::domain::specialization::SpecializationTable;
use flowmesh::loader::parser::load_spec_table;
use flowmesh::{load_graph, logger};

#[derive(Parser)]
#[command(name = "flowmesh", about = "Distributed node state coordination for dataflow graphs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a whole worker group inside this process and execute a graph.
    Local {
        /// Graph definition file (JSON object keyed by node id).
        #[arg(long)]
        graph: PathBuf,

        /// Specialization table file (JSON list of {worker, types} entries).
        /// Without one, worker 0 claims every node type.
        #[arg(long)]
        spec: Option<PathBuf>,

        /// Number of workers in the in-process group.
        #[arg(long, default_value_t = 2)]
        workers: usize,
    },

    /// Join a TCP worker group. Identity comes from the RANK, WORLD_SIZE
    /// and LOCAL_RANK environment variables, launcher style.
    Worker {
        /// Graph definition file (JSON object keyed by node id).
        #[arg(long)]
        graph: PathBuf,

        /// Specialization table file (JSON list of {worker, types} entries).
        #[arg(long)]
        spec: Option<PathBuf>,

        /// Listen addresses of all ranks, comma separated, in rank order.
        #[arg(long, value_delimiter = ',')]
        peers: Vec<SocketAddr>,
    },
}

/// Placeholder engine for the demo binary: every node "computes" a JSON
/// object echoing its resolved inputs, so cross-worker links are visible in
/// the final snapshot without a real engine attached.
struct EchoExecutor;

#[async_trait]
impl NodeExecutor<serde_json::Value> for EchoExecutor {
    async fn execute(
        &self,
        node_id: &NodeId,
        data: &NodeData,
        inputs: ResolvedInputs<serde_json::Value>,
    ) -> Result<NodeOutputs<serde_json::Value>, String> {
        let mut echoed = serde_json::Map::new();
        for (name, input) in inputs {
            let value = match input {
                ResolvedInput::Literal(value) => value,
                ResolvedInput::Computed(value) => value,
            };
            echoed.insert(name, value);
        }

        Ok(NodeOutputs::Single(json!({
            "node": node_id.as_str(),
            "class_type": data.class_type,
            "inputs": echoed,
        })))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logger::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Local { graph, spec, workers } => run_local(&graph, spec.as_deref(), workers).await,
        Command::Worker { graph, spec, peers } => run_tcp(&graph, spec.as_deref(), peers).await,
    }
}

async fn run_local(graph: &Path, spec: Option<&Path>, workers: usize) -> anyhow::Result<()> {
    anyhow::ensure!(workers > 0, "a group needs at least one worker");

    let nodes = load_graph(path_str(graph)?)?;
    let table = load_table(spec)?;

    let mut handles = Vec::new();
    for group in ChannelGroup::create(workers) {
        let rank = group.rank();
        let identity = WorkerIdentity::new(rank, workers, rank.index());
        let comm: Arc<dyn Communicator> = Arc::new(group);

        handles.push(tokio::spawn(run_worker(identity, table.clone(), comm, nodes.clone())));
    }

    // A worker that fails before a barrier leaves its peers blocked in it;
    // surface the first failure instead of waiting on the survivors.
    let mut pending = handles;
    while !pending.is_empty() {
        let (finished, _, rest) = select_all(pending).await;
        pending = rest;
        finished??;
    }

    Ok(())
}

async fn run_tcp(graph: &Path, spec: Option<&Path>, peers: Vec<SocketAddr>) -> anyhow::Result<()> {
    let identity = WorkerIdentity::from_env()?;
    anyhow::ensure!(
        peers.len() == identity.world_size,
        "{} peer addresses given for WORLD_SIZE {}",
        peers.len(),
        identity.world_size
    );

    let nodes = load_graph(path_str(graph)?)?;
    let table = load_table(spec)?;

    let group = TcpGroup::join(identity.rank, &peers).await?;
    let comm: Arc<dyn Communicator> = Arc::new(group);

    run_worker(identity, table, comm, nodes).await
}

/// One worker's whole life: register the graph, execute owned nodes in
/// lock-step with the group, print the snapshot on the coordinator.
async fn run_worker(
    identity: WorkerIdentity,
    table: SpecializationTable,
    comm: Arc<dyn Communicator>,
    nodes: Vec<(NodeId, NodeData)>,
) -> anyhow::Result<()> {
    let me = identity.rank;
    let store = DistributedNodeStore::new(identity, table, Arc::new(JsonCodec), Some(comm.clone()), None)?;
    let service = OutputService::spawn(store.clone());

    for (node_id, data) in &nodes {
        store.register(node_id.clone(), data.clone()).await?;
    }

    // Registration order is the collective order, identical on every
    // member. Execution follows the link dependencies instead; the barrier
    // keeps every fetch behind the write it depends on.
    let schedule = execution_order(&nodes)?;
    let executor = EchoExecutor;
    for node_id in &schedule {
        if store.owner_of(node_id) == Some(me) {
            store.execute_node(node_id, &executor).await?;
        }
        comm.barrier().await?;
    }

    if me == WorkerId(0) {
        let snapshot = store.export_snapshot();
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }

    service.shutdown().await;
    Ok(())
}

fn load_table(spec: Option<&Path>) -> anyhow::Result<SpecializationTable> {
    match spec {
        Some(path) => Ok(load_spec_table(path_str(path)?)?),
        None => {
            let mut table = SpecializationTable::new();
            table.add_worker(WorkerId(0), ["*"]);
            Ok(table)
        }
    }
}

fn path_str(path: &Path) -> anyhow::Result<&str> {
    path.to_str().with_context(|| format!("path {} is not valid UTF-8", path.display()))
}

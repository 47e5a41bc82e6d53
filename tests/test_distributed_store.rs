use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use flowmesh::domain::codec::JsonCodec;
use flowmesh::domain::distributed::comm::{ChannelGroup, Communicator};
use flowmesh::domain::distributed::{DistributedNodeStore, OutputService, ServiceHandle, WorkerIdentity};
use flowmesh::domain::executor::{NodeExecutor, ResolvedInputs};
use flowmesh::domain::graph::execution_order;
use flowmesh::domain::node::{NodeData, NodeId, NodeOutputs, WorkerId};
use flowmesh::domain::specialization::SpecializationTable;
use flowmesh::error::Error;

type JsonStore = DistributedNodeStore<serde_json::Value>;

/// Worker 0 loads checkpoints, worker 1 takes everything else.
fn loader_and_wildcard_table() -> SpecializationTable {
    let mut table = SpecializationTable::new();
    table.add_worker(WorkerId(0), ["CheckpointLoader"]);
    table.add_worker(WorkerId(1), ["*"]);
    table
}

fn build_store(group: ChannelGroup, world_size: usize, table: &SpecializationTable, fetch_timeout: Option<Duration>) -> JsonStore {
    let rank = group.rank();
    let identity = WorkerIdentity::new(rank, world_size, rank.index());
    let comm: Arc<dyn Communicator> = Arc::new(group);

    DistributedNodeStore::new(identity, table.clone(), Arc::new(JsonCodec), Some(comm), fetch_timeout)
        .expect("store construction")
}

/// A group of stores in rank order, each with its output service running.
fn spawn_group(world_size: usize, table: SpecializationTable) -> (Vec<JsonStore>, Vec<ServiceHandle>) {
    let mut stores = Vec::new();
    let mut services = Vec::new();

    for group in ChannelGroup::create(world_size) {
        let store = build_store(group, world_size, &table, None);
        services.push(OutputService::spawn(store.clone()));
        stores.push(store);
    }

    (stores, services)
}

/// Registers one node on every member, in rank order, the way the group
/// protocol requires.
async fn register_everywhere(stores: &[JsonStore], node_id: &NodeId, data: &NodeData) -> Vec<WorkerId> {
    let mut owners = Vec::new();
    for store in stores {
        owners.push(store.register(node_id.clone(), data.clone()).await.unwrap());
    }
    owners
}

async fn shutdown(services: Vec<ServiceHandle>) {
    for service in services {
        tokio::time::timeout(Duration::from_secs(1), service.shutdown())
            .await
            .expect("service shutdown must be prompt");
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within the wait budget");
}

#[tokio::test]
async fn test_remote_fetch_returns_the_owners_output() {
    let (stores, services) = spawn_group(2, loader_and_wildcard_table());
    let loader = NodeId::new("1");

    let owners = register_everywhere(&stores, &loader, &NodeData::new("CheckpointLoader")).await;
    assert_eq!(owners, vec![WorkerId(0), WorkerId(0)]);

    // Only the owner keeps the full record.
    assert!(stores[0].local().contains(&loader));
    assert!(!stores[1].local().contains(&loader));

    stores[0]
        .set_output(&loader, NodeOutputs::Slots(vec![json!("model-handle"), json!("clip-handle")]))
        .await
        .unwrap();

    let fetched = stores[1].get_output(&loader, 1).await.unwrap();
    assert_eq!(fetched, Some(json!("clip-handle")));

    // The availability fan-out reaches the non-owner's service.
    wait_until(|| stores[1].is_output_announced(&loader)).await;
    assert_eq!(stores[1].announced_source(&loader), Some(WorkerId(0)));

    shutdown(services).await;
}

#[tokio::test]
async fn test_wildcard_owner_receives_everything_else() {
    let (stores, services) = spawn_group(2, loader_and_wildcard_table());
    let sampler = NodeId::new("3");

    let owners = register_everywhere(&stores, &sampler, &NodeData::new("KSampler")).await;
    assert_eq!(owners, vec![WorkerId(1), WorkerId(1)]);

    assert!(!stores[0].local().contains(&sampler));
    assert!(stores[1].local().contains(&sampler));

    shutdown(services).await;
}

#[tokio::test]
async fn test_unmatched_type_converges_on_the_coordinators_default() {
    // No wildcard anywhere, so an unclaimed type falls back to a local
    // default; the coordinator's own rank is the one that sticks.
    let mut table = SpecializationTable::new();
    table.add_worker(WorkerId(0), ["CheckpointLoader"]);
    table.add_worker(WorkerId(1), ["KSampler"]);

    let (stores, services) = spawn_group(2, table);
    let custom = NodeId::new("9");

    let owners = register_everywhere(&stores, &custom, &NodeData::new("TotallyCustomNode")).await;
    assert_eq!(owners, vec![WorkerId(0), WorkerId(0)]);

    assert_eq!(stores[0].owner_of(&custom), Some(WorkerId(0)));
    assert_eq!(stores[1].owner_of(&custom), Some(WorkerId(0)));
    assert!(stores[0].local().contains(&custom));
    assert!(!stores[1].local().contains(&custom));

    shutdown(services).await;
}

#[tokio::test]
async fn test_single_process_register_needs_no_table_and_no_network() {
    let store: JsonStore = DistributedNodeStore::single_process(Arc::new(JsonCodec));
    let node = NodeId::new("9");

    let owner = store.register(node.clone(), NodeData::new("TotallyCustomNode")).await.unwrap();
    assert_eq!(owner, store.identity().rank);
    assert!(store.local().contains(&node));

    // Missing output is an expected state, not an error.
    assert_eq!(store.get_output(&node, 0).await.unwrap(), None);
}

#[tokio::test]
async fn test_fetch_of_an_unproduced_output_returns_none_without_hanging() {
    let (stores, services) = spawn_group(2, loader_and_wildcard_table());
    let loader = NodeId::new("1");

    register_everywhere(&stores, &loader, &NodeData::new("CheckpointLoader")).await;

    // Nothing was executed; the owner must answer "absent", not stall.
    let fetched = tokio::time::timeout(Duration::from_secs(5), stores[1].get_output(&loader, 0))
        .await
        .expect("an absent output must still produce a reply")
        .unwrap();
    assert_eq!(fetched, None);

    shutdown(services).await;
}

#[tokio::test]
async fn test_announcement_collectives_stay_symmetric() {
    let (stores, services) = spawn_group(2, loader_and_wildcard_table());

    register_everywhere(&stores, &NodeId::new("1"), &NodeData::new("CheckpointLoader")).await;
    register_everywhere(&stores, &NodeId::new("2"), &NodeData::new("TextEncode")).await;

    // Every member entered exactly one collective per registration.
    assert_eq!(stores[0].collective_seq(), 2);
    assert_eq!(stores[1].collective_seq(), 2);

    shutdown(services).await;
}

#[tokio::test]
async fn test_fetch_timeout_fires_when_the_owner_never_replies() {
    let table = loader_and_wildcard_table();
    let mut groups = ChannelGroup::create(2);
    let worker_one = groups.pop().unwrap();
    let worker_zero = groups.pop().unwrap();

    // Worker 0 gets no output service, so fetch requests to it pile up
    // unanswered.
    let silent_owner = build_store(worker_zero, 2, &table, None);
    let requester = build_store(worker_one, 2, &table, Some(Duration::from_millis(50)));

    let loader = NodeId::new("1");
    silent_owner.register(loader.clone(), NodeData::new("CheckpointLoader")).await.unwrap();
    requester.register(loader.clone(), NodeData::new("CheckpointLoader")).await.unwrap();

    let err = requester.get_output(&loader, 0).await.unwrap_err();
    assert!(matches!(err, Error::FetchTimeout { .. }));
}

#[tokio::test]
async fn test_fetch_after_timeout_returns_the_owners_current_value() {
    let table = loader_and_wildcard_table();
    let mut groups = ChannelGroup::create(2);
    let worker_one = groups.pop().unwrap();
    let worker_zero = groups.pop().unwrap();

    let owner = build_store(worker_zero, 2, &table, None);
    let requester = build_store(worker_one, 2, &table, Some(Duration::from_millis(200)));

    let loader = NodeId::new("1");
    owner.register(loader.clone(), NodeData::new("CheckpointLoader")).await.unwrap();
    requester.register(loader.clone(), NodeData::new("CheckpointLoader")).await.unwrap();

    owner.set_output(&loader, NodeOutputs::Single(json!("first"))).await.unwrap();

    // The owner's service is not up yet, so this fetch runs out of patience
    // and leaves its request queued on the owner's side.
    let err = requester.get_output(&loader, 0).await.unwrap_err();
    assert!(matches!(err, Error::FetchTimeout { .. }));

    // Now the service comes up and answers the abandoned request while the
    // old value is still the stored one; that late reply sits in the
    // requester's queue.
    let service = OutputService::spawn(owner.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;

    owner.set_output(&loader, NodeOutputs::Single(json!("second"))).await.unwrap();

    // The next fetch must not take the late reply for its own answer.
    let fetched = requester.get_output(&loader, 0).await.unwrap();
    assert_eq!(fetched, Some(json!("second")));

    shutdown(vec![service]).await;
}

#[tokio::test]
async fn test_unassigned_node_reads_locally_and_never_fetches() {
    let (stores, services) = spawn_group(2, loader_and_wildcard_table());
    let stray = NodeId::new("stray");

    // No registration, no assignment. A read must not turn into network
    // traffic, and with nothing stored locally it comes back empty.
    let value = tokio::time::timeout(Duration::from_secs(1), stores[0].get_output(&stray, 0))
        .await
        .expect("unassigned reads must not block")
        .unwrap();
    assert_eq!(value, None);

    stores[0].local().set_output(stray.clone(), NodeOutputs::Single(json!("local-only")));
    assert_eq!(stores[0].get_output(&stray, 0).await.unwrap(), Some(json!("local-only")));

    shutdown(services).await;
}

#[tokio::test]
async fn test_snapshot_reflects_the_converged_assignments() {
    let (stores, services) = spawn_group(2, loader_and_wildcard_table());

    register_everywhere(&stores, &NodeId::new("1"), &NodeData::new("CheckpointLoader")).await;
    register_everywhere(&stores, &NodeId::new("2"), &NodeData::new("VAEDecode")).await;

    let snapshot = stores[0].export_snapshot();
    assert!(snapshot.distributed);
    assert_eq!(snapshot.worker, Some(0));
    assert_eq!(snapshot.assignments["1"], 0);
    assert_eq!(snapshot.assignments["2"], 1);

    // Worker 0 only holds the record it owns, and it is marked as its own.
    assert_eq!(snapshot.nodes.len(), 1);
    assert_eq!(snapshot.nodes["1"].owner, Some(0));

    shutdown(services).await;
}

/// Minimal engine for the pipeline tests: loaders produce two handles,
/// encoders combine an upstream handle with a literal.
struct StubEngine;

#[async_trait]
impl NodeExecutor<serde_json::Value> for StubEngine {
    async fn execute(
        &self,
        _node_id: &NodeId,
        data: &NodeData,
        inputs: ResolvedInputs<serde_json::Value>,
    ) -> Result<NodeOutputs<serde_json::Value>, String> {
        match data.class_type.as_str() {
            "CheckpointLoader" => Ok(NodeOutputs::Slots(vec![json!("model-handle"), json!("clip-handle")])),
            "TextEncode" => {
                let model = inputs
                    .get("model")
                    .and_then(|input| input.as_computed())
                    .cloned()
                    .ok_or("missing model input")?;
                let text = inputs
                    .get("text")
                    .and_then(|input| input.as_literal())
                    .cloned()
                    .ok_or("missing text input")?;

                Ok(NodeOutputs::Single(json!({ "conditioning": [model, text] })))
            }
            other => Err(format!("unknown class type {other}")),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_execution_resolves_links_across_workers() {
    let (stores, services) = spawn_group(2, loader_and_wildcard_table());

    let loader = NodeId::new("1");
    let encode = NodeId::new("2");
    let encode_data = NodeData::new("TextEncode")
        .with_link("model", loader.clone(), 0)
        .with_literal("text", json!("a photo of a cat"));

    register_everywhere(&stores, &loader, &NodeData::new("CheckpointLoader")).await;
    register_everywhere(&stores, &encode, &encode_data).await;

    let engine = StubEngine;

    // Worker 0 owns the loader, worker 1 owns the encoder; the encoder's
    // model input crosses the worker boundary.
    stores[0].execute_node(&loader, &engine).await.unwrap();
    let outputs = stores[1].execute_node(&encode, &engine).await.unwrap();

    let expected = json!({ "conditioning": ["model-handle", "a photo of a cat"] });
    assert_eq!(outputs.slot(0), Some(&expected));

    // And the encoder's result is fetchable in the other direction.
    assert_eq!(stores[0].get_output(&encode, 0).await.unwrap(), Some(expected));

    assert!(stores[0].local().last_executed(&loader).is_some());
    assert!(stores[1].local().last_executed(&encode).is_some());

    shutdown(services).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_execution_follows_links_not_id_order() {
    let table = loader_and_wildcard_table();

    let mut stores = Vec::new();
    let mut services = Vec::new();
    let mut comms: Vec<Arc<dyn Communicator>> = Vec::new();

    for group in ChannelGroup::create(2) {
        let rank = group.rank();
        let identity = WorkerIdentity::new(rank, 2, rank.index());
        let comm: Arc<dyn Communicator> = Arc::new(group);
        let store = DistributedNodeStore::new(identity, table.clone(), Arc::new(JsonCodec), Some(comm.clone()), None)
            .expect("store construction");

        services.push(OutputService::spawn(store.clone()));
        comms.push(comm);
        stores.push(store);
    }

    // The consumer's id sorts before its source's, the order a graph file
    // keyed by id imposes on registration.
    let nodes = vec![
        (
            NodeId::new("3"),
            NodeData::new("TextEncode")
                .with_link("model", NodeId::new("4"), 0)
                .with_literal("text", json!("a photo of a cat")),
        ),
        (NodeId::new("4"), NodeData::new("CheckpointLoader")),
    ];

    for (node_id, data) in &nodes {
        register_everywhere(&stores, node_id, data).await;
    }

    let schedule = execution_order(&nodes).unwrap();
    assert_eq!(schedule, vec![NodeId::new("4"), NodeId::new("3")]);

    // Each member walks the same schedule; the barrier keeps the encoder's
    // fetch behind the loader's write.
    let mut workers = Vec::new();
    for (store, comm) in stores.iter().cloned().zip(comms) {
        let schedule = schedule.clone();
        workers.push(tokio::spawn(async move {
            let me = store.identity().rank;
            for node_id in &schedule {
                if store.owner_of(node_id) == Some(me) {
                    store.execute_node(node_id, &StubEngine).await.unwrap();
                }
                comm.barrier().await.unwrap();
            }
        }));
    }

    for worker in workers {
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .expect("the walk must finish for every member")
            .unwrap();
    }

    let expected = json!({ "conditioning": ["model-handle", "a photo of a cat"] });
    assert_eq!(stores[0].get_output(&NodeId::new("3"), 0).await.unwrap(), Some(expected));

    shutdown(services).await;
}

#[tokio::test]
async fn test_execution_is_refused_on_non_owners() {
    let (stores, services) = spawn_group(2, loader_and_wildcard_table());
    let loader = NodeId::new("1");

    register_everywhere(&stores, &loader, &NodeData::new("CheckpointLoader")).await;

    let err = stores[1].execute_node(&loader, &StubEngine).await.unwrap_err();
    assert!(matches!(err, Error::UnknownNode(_)));

    shutdown(services).await;
}

#[tokio::test]
async fn test_custom_inputs_shadow_declared_inputs_during_resolution() {
    let store: JsonStore = DistributedNodeStore::single_process(Arc::new(JsonCodec));
    let node = NodeId::new("4");

    store
        .register(node.clone(), NodeData::new("KSampler").with_literal("seed", json!(1)))
        .await
        .unwrap();
    store.set_custom_input(&node, "seed", json!(7));
    store.set_custom_input(&node, "cfg", json!(8.5));

    let resolved = store.resolve_inputs(&node).await.unwrap();
    assert_eq!(resolved["seed"].as_literal(), Some(&json!(7)));
    assert_eq!(resolved["cfg"].as_literal(), Some(&json!(8.5)));
}

#[tokio::test]
async fn test_resolution_fails_when_an_upstream_output_is_missing() {
    let store: JsonStore = DistributedNodeStore::single_process(Arc::new(JsonCodec));
    let node = NodeId::new("2");

    store
        .register(node.clone(), NodeData::new("TextEncode").with_link("model", NodeId::new("1"), 0))
        .await
        .unwrap();

    let err = store.resolve_inputs(&node).await.unwrap_err();
    assert!(matches!(err, Error::ExecutionError(_)));
}

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::distributed::comm::{CommError, Communicator, RecvFrom, Tag};
use crate::domain::distributed::framing;
use crate::domain::distributed::protocol::{self, ControlMsg, FetchResponse};
use crate::domain::distributed::store::DistributedNodeStore;
use crate::domain::node::{NodeId, NodeValue, WorkerId};
use crate::error::{Error, Result};

/// Handle on a running output service. Dropping it does not stop the loop;
/// call [`ServiceHandle::shutdown`] for a deterministic teardown.
pub struct ServiceHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ServiceHandle {
    /// Stops the serve loop and waits until it has wound down.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            log::error!("output service task ended abnormally: {e}");
        }
    }
}

/// Background responder that makes one worker's outputs reachable by its
/// peers.
///
/// The loop owns the control tag of the communicator: fetch requests are
/// answered from the local store, availability and assignment announcements
/// are folded into the shared coordination state. A malformed or failing
/// request is logged and the loop keeps serving; only cancellation or a
/// closed group ends it.
pub struct OutputService;

impl OutputService {
    pub fn spawn<V: NodeValue>(store: DistributedNodeStore<V>) -> ServiceHandle {
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            serve_requests(store, loop_cancel).await;
        });

        ServiceHandle { cancel, task }
    }
}

async fn serve_requests<V: NodeValue>(store: DistributedNodeStore<V>, cancel: CancellationToken) {
    let comm = match store.communicator() {
        Ok(comm) => comm,
        Err(_) => {
            log::warn!("output service started without a communicator; nothing to serve");
            return;
        }
    };
    let me = store.identity().rank;

    log::info!("output service on worker {me} is serving peer requests");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("output service on worker {me} shutting down");
                break;
            }
            inbound = framing::recv_framed(comm.as_ref(), RecvFrom::Any, Tag::Control) => {
                match inbound {
                    Ok((from, payload)) => {
                        if let Err(e) = handle_control(&store, comm.as_ref(), from, &payload).await {
                            log::error!("worker {me}: failed to serve a request from worker {from}: {e}");
                        }
                    }
                    Err(CommError::Closed) => {
                        log::info!("worker group closed; output service on worker {me} exiting");
                        break;
                    }
                    Err(e) => {
                        log::error!("worker {me}: receive failed in the output service: {e}");
                    }
                }
            }
        }
    }
}

async fn handle_control<V: NodeValue>(
    store: &DistributedNodeStore<V>,
    comm: &dyn Communicator,
    from: WorkerId,
    payload: &[u8],
) -> Result<()> {
    match protocol::decode_control(payload)? {
        ControlMsg::FetchRequest { node_id, slot, requester, seq } => {
            // Answered strictly from the local store; this path must never
            // recurse into a remote fetch.
            let output = match store.local().get_output(&node_id, slot) {
                Some(value) => Some(store.shared.codec.encode(&value)?),
                None => None,
            };

            log::debug!(
                "serving fetch of node {node_id} slot {slot} for worker {requester}: {}",
                if output.is_some() { "present" } else { "absent" }
            );

            let reply = protocol::encode_response(&FetchResponse { output, seq })?;
            framing::send_framed(comm, requester, Tag::Reply, &reply).await?;
            Ok(())
        }
        ControlMsg::Availability { node_id, has_output, source } => {
            log::debug!("worker {source} announced node {node_id} (has_output = {has_output})");
            store.apply_availability(node_id, has_output, source);
            Ok(())
        }
        ControlMsg::Assignment { node_id, owner } => {
            // Assignments normally travel on the collective path; accept
            // the point-to-point form too so a coordinator can re-announce.
            log::debug!("worker {from} sent a direct assignment: node {node_id} -> worker {owner}");
            store.apply_assignment(node_id, owner);
            Ok(())
        }
    }
}

impl<V: NodeValue> DistributedNodeStore<V> {
    /// One fetch exchange with the owner of `node_id`: a framed request on
    /// the control tag, a framed [`FetchResponse`] back on the reply tag.
    ///
    /// The gate serializes outbound fetches and numbers every exchange; the
    /// owner echoes the number back. A caller that ran out of patience
    /// leaves an orphaned request behind, and the owner still answers it
    /// eventually, so replies carrying an older number are dropped instead
    /// of being taken for the current answer. No store lock is held while
    /// waiting.
    pub(crate) async fn fetch_remote(&self, node_id: &NodeId, slot: usize, owner: WorkerId) -> Result<Option<V>> {
        let comm = self.communicator()?;
        let me = self.shared.identity.rank;

        let mut gate = self.shared.fetch_gate.lock().await;
        *gate += 1;
        let seq = *gate;

        let request = protocol::encode_control(&ControlMsg::FetchRequest {
            node_id: node_id.clone(),
            slot,
            requester: me,
            seq,
        })?;
        framing::send_framed(comm.as_ref(), owner, Tag::Control, &request).await?;

        let exchange = self.matching_reply(comm.as_ref(), owner, seq);
        let response = match self.shared.fetch_timeout {
            Some(patience) => tokio::time::timeout(patience, exchange)
                .await
                .map_err(|_| Error::FetchTimeout { node_id: node_id.clone(), owner })??,
            None => exchange.await?,
        };

        match response.output {
            Some(bytes) => {
                log::debug!("fetched node {node_id} slot {slot} from worker {owner} ({} bytes)", bytes.len());
                Ok(Some(self.shared.codec.decode(&bytes)?))
            }
            None => {
                log::debug!("worker {owner} has no output for node {node_id} slot {slot} yet");
                Ok(None)
            }
        }
    }

    /// Waits for the reply numbered `seq` from `owner`. Replies to
    /// exchanges this worker abandoned earlier arrive first on the same
    /// queue and are dropped.
    async fn matching_reply(&self, comm: &dyn Communicator, owner: WorkerId, seq: u64) -> Result<FetchResponse> {
        loop {
            let (_, reply) = framing::recv_framed(comm, RecvFrom::Peer(owner), Tag::Reply).await?;
            let response = protocol::decode_response(&reply)?;

            if response.seq == seq {
                return Ok(response);
            }

            log::debug!(
                "dropping a late reply from worker {owner} (exchange {}, waiting for {seq})",
                response.seq
            );
        }
    }
}

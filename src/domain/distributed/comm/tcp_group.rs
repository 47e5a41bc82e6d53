use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::domain::distributed::comm::{CommError, Communicator, MAX_FRAME_BYTES, Mailbox, RecvFrom, Tag};
use crate::domain::node::WorkerId;

const DIAL_ATTEMPTS: u32 = 60;
const DIAL_RETRY_DELAY: Duration = Duration::from_millis(250);
const PEER_CHANNEL_CAPACITY: usize = 256;

/// Frames exchanged on a mesh connection. Length-delimited on the wire,
/// bincode inside.
#[derive(Serialize, Deserialize, Debug)]
enum WireFrame {
    /// Identity of the dialing side, first frame on every connection.
    Hello { rank: u32 },
    Direct { tag: Tag, payload: Vec<u8> },
    Collective { root: u32, payload: Vec<u8> },
}

/// TCP-backed worker group, one socket per peer pair.
///
/// `addrs[r]` is the listen address of rank `r`. Each member dials every
/// lower rank and accepts from every higher rank, identifying itself with a
/// handshake frame, so the mesh comes up without a rendezvous server. Per
/// connection, a reader task feeds the member's mailbox and a writer task
/// drains an outbound queue.
pub struct TcpGroup {
    rank: WorkerId,
    world_size: usize,
    mailbox: Arc<Mailbox>,
    peers: Vec<Option<mpsc::Sender<WireFrame>>>,
    io_tasks: Vec<JoinHandle<()>>,
}

impl TcpGroup {
    /// Joins the group as `rank`. Blocks until the full mesh is up; a peer
    /// that never comes up fails the join after the dial budget runs out.
    pub async fn join(rank: WorkerId, addrs: &[SocketAddr]) -> Result<TcpGroup, CommError> {
        let world_size = addrs.len();
        if rank.index() >= world_size {
            return Err(CommError::UnknownPeer(rank));
        }

        let listen_addr = addrs[rank.index()];
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|e| CommError::Transport(format!("failed to bind {listen_addr}: {e}")))?;

        let mut connections: Vec<Option<Framed<TcpStream, LengthDelimitedCodec>>> =
            (0..world_size).map(|_| None).collect();

        // Dial every lower rank; they are already listening or soon will be.
        for peer in 0..rank.index() {
            let stream = Self::dial(addrs[peer]).await?;
            let mut framed = Framed::new(stream, wire_codec());

            framed
                .send(encode_frame(&WireFrame::Hello { rank: rank.0 })?)
                .await
                .map_err(|e| CommError::Transport(format!("handshake to worker {peer} failed: {e}")))?;

            connections[peer] = Some(framed);
        }

        // Accept one connection from every higher rank; the first frame
        // tells us which one just arrived.
        for _ in rank.index() + 1..world_size {
            let (stream, remote_addr) = listener
                .accept()
                .await
                .map_err(|e| CommError::Transport(format!("accept on {listen_addr} failed: {e}")))?;
            let mut framed = Framed::new(stream, wire_codec());

            let first = framed
                .next()
                .await
                .ok_or_else(|| CommError::Transport(format!("{remote_addr} hung up before the handshake")))?
                .map_err(|e| CommError::Transport(format!("handshake read from {remote_addr} failed: {e}")))?;

            match decode_frame(&first)? {
                WireFrame::Hello { rank: peer_rank } => {
                    let peer = peer_rank as usize;
                    if peer <= rank.index() || peer >= world_size || connections[peer].is_some() {
                        return Err(CommError::Transport(format!(
                            "unexpected handshake from rank {peer_rank} at {remote_addr}"
                        )));
                    }
                    connections[peer] = Some(framed);
                }
                other => {
                    return Err(CommError::Transport(format!(
                        "first frame from {remote_addr} was not a handshake: {other:?}"
                    )));
                }
            }
        }

        let mailbox = Arc::new(Mailbox::new());
        let mut peers: Vec<Option<mpsc::Sender<WireFrame>>> = (0..world_size).map(|_| None).collect();
        let mut io_tasks = Vec::new();

        for (peer, connection) in connections.into_iter().enumerate() {
            let Some(framed) = connection else { continue };
            let peer = WorkerId(peer as u32);

            let (sink, stream) = framed.split();
            let (tx, rx) = mpsc::channel(PEER_CHANNEL_CAPACITY);

            io_tasks.push(tokio::spawn(write_frames(peer, sink, rx)));
            io_tasks.push(tokio::spawn(read_frames(peer, stream, Arc::clone(&mailbox))));
            peers[peer.index()] = Some(tx);
        }

        log::info!("worker {rank} joined a tcp group of {world_size} on {listen_addr}");

        Ok(TcpGroup { rank, world_size, mailbox, peers, io_tasks })
    }

    async fn dial(addr: SocketAddr) -> Result<TcpStream, CommError> {
        let mut last_error = None;

        for _ in 0..DIAL_ATTEMPTS {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    last_error = Some(e);
                    sleep(DIAL_RETRY_DELAY).await;
                }
            }
        }

        Err(CommError::Transport(match last_error {
            Some(e) => format!("could not reach {addr} after {DIAL_ATTEMPTS} attempts: {e}"),
            None => format!("could not reach {addr}"),
        }))
    }

    /// Tears the member down: aborts the per-connection tasks and closes the
    /// mailbox so blocked receivers resolve with `Closed`.
    pub fn shutdown(&self) {
        for task in &self.io_tasks {
            task.abort();
        }
        self.mailbox.close();
    }
}

impl Drop for TcpGroup {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl Communicator for TcpGroup {
    fn rank(&self) -> WorkerId {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn broadcast(&self, root: WorkerId, buf: &mut [u8]) -> Result<(), CommError> {
        if root.index() >= self.world_size {
            return Err(CommError::UnknownPeer(root));
        }

        if self.rank == root {
            for sender in self.peers.iter().flatten() {
                sender
                    .send(WireFrame::Collective { root: root.0, payload: buf.to_vec() })
                    .await
                    .map_err(|_| CommError::Closed)?;
            }
            return Ok(());
        }

        let payload = self.mailbox.pop_collective(root).await?;
        if payload.len() != buf.len() {
            return Err(CommError::SizeMismatch { expected: buf.len(), got: payload.len() });
        }

        buf.copy_from_slice(&payload);
        Ok(())
    }

    async fn send(&self, dst: WorkerId, tag: Tag, buf: &[u8]) -> Result<(), CommError> {
        if dst == self.rank {
            // A self-send loops straight into the own mailbox.
            self.mailbox.push_direct(self.rank, tag, buf.to_vec());
            return Ok(());
        }

        let sender = self
            .peers
            .get(dst.index())
            .and_then(Option::as_ref)
            .ok_or(CommError::UnknownPeer(dst))?;

        sender
            .send(WireFrame::Direct { tag, payload: buf.to_vec() })
            .await
            .map_err(|_| CommError::Closed)
    }

    async fn recv(&self, src: RecvFrom, tag: Tag, buf: &mut [u8]) -> Result<WorkerId, CommError> {
        if let RecvFrom::Peer(peer) = src {
            if peer.index() >= self.world_size {
                return Err(CommError::UnknownPeer(peer));
            }
        }

        let (from, payload) = self.mailbox.pop_direct(src, tag).await?;
        if payload.len() != buf.len() {
            return Err(CommError::SizeMismatch { expected: buf.len(), got: payload.len() });
        }

        buf.copy_from_slice(&payload);
        Ok(from)
    }
}

fn wire_codec() -> LengthDelimitedCodec {
    // Room for the payload plus the enum framing around it.
    LengthDelimitedCodec::builder().max_frame_length(MAX_FRAME_BYTES + 1024).new_codec()
}

fn encode_frame(frame: &WireFrame) -> Result<Bytes, CommError> {
    let bytes = bincode::serialize(frame).map_err(|e| CommError::Transport(format!("frame encoding failed: {e}")))?;
    Ok(Bytes::from(bytes))
}

fn decode_frame(bytes: &BytesMut) -> Result<WireFrame, CommError> {
    bincode::deserialize(bytes).map_err(|e| CommError::Transport(format!("frame decoding failed: {e}")))
}

async fn write_frames(
    peer: WorkerId,
    mut sink: SplitSink<Framed<TcpStream, LengthDelimitedCodec>, Bytes>,
    mut outbound: mpsc::Receiver<WireFrame>,
) {
    while let Some(frame) = outbound.recv().await {
        let encoded = match encode_frame(&frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("dropping undeliverable frame for worker {peer}: {e}");
                continue;
            }
        };

        if let Err(e) = sink.send(encoded).await {
            log::error!("connection to worker {peer} failed on write: {e}");
            break;
        }
    }
}

async fn read_frames(peer: WorkerId, mut inbound: SplitStream<Framed<TcpStream, LengthDelimitedCodec>>, mailbox: Arc<Mailbox>) {
    while let Some(frame) = inbound.next().await {
        match frame {
            Ok(bytes) => match decode_frame(&bytes) {
                Ok(WireFrame::Direct { tag, payload }) => mailbox.push_direct(peer, tag, payload),
                Ok(WireFrame::Collective { root, payload }) => mailbox.push_collective(WorkerId(root), payload),
                Ok(WireFrame::Hello { .. }) => {
                    log::warn!("worker {peer} repeated its handshake mid-stream");
                }
                Err(e) => log::error!("undecodable frame from worker {peer}: {e}"),
            },
            Err(e) => {
                log::error!("connection to worker {peer} failed on read: {e}");
                break;
            }
        }
    }

    // A lost peer makes collectives impossible; fail the whole member.
    mailbox.close();
}

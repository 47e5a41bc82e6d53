use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::node::WorkerId;

mod channel_group;
mod mailbox;
mod tcp_group;

pub use channel_group::ChannelGroup;
pub use tcp_group::TcpGroup;

pub(crate) use mailbox::Mailbox;

/// Upper bound on a single transmitted payload. A corrupt or hostile length
/// announcement must not be able to commit a receiver to an absurd
/// allocation.
pub const MAX_FRAME_BYTES: usize = 1 << 30;

/// Point-to-point channel label.
///
/// Service traffic and fetch replies travel on separate tags so that a serve
/// loop doing receive-any can never swallow a reply addressed to a caller
/// blocked inside a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tag {
    /// Requests and announcements consumed by the per-worker serve loop.
    Control,
    /// Responses consumed by the caller that sent the matching request.
    Reply,
    /// Rendezvous tokens exchanged by [`Communicator::barrier`].
    Barrier,
}

/// Source selector for a point-to-point receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvFrom {
    Any,
    Peer(WorkerId),
}

#[derive(Debug, Error)]
pub enum CommError {
    #[error("Worker group is closed")]
    Closed,

    #[error("Worker {0} is not a member of this group")]
    UnknownPeer(WorkerId),

    #[error("Received {got} bytes where the caller declared {expected}")]
    SizeMismatch { expected: usize, got: usize },

    #[error("Frame of {0} bytes exceeds the frame ceiling")]
    FrameTooLarge(usize),

    #[error("Transport failure: {0}")]
    Transport(String),
}

/// Group communication primitives the coordination layer is built on.
///
/// The shape follows the collective/point-to-point split of a device process
/// group: buffer sizes are declared by the caller, a receive blocks until a
/// matching message arrives, and a collective has to be entered by every
/// group member with the same root in the same order. Breaking the
/// collective discipline does not corrupt data, it deadlocks the group; the
/// caller owns that discipline.
#[async_trait]
pub trait Communicator: Send + Sync {
    /// Rank of this member.
    fn rank(&self) -> WorkerId;

    /// Number of members in the group.
    fn world_size(&self) -> usize;

    /// Collective broadcast: the root's buffer content is copied into every
    /// other member's buffer. `buf` must have the same length on every
    /// member.
    async fn broadcast(&self, root: WorkerId, buf: &mut [u8]) -> Result<(), CommError>;

    /// Delivers exactly `buf.len()` bytes to `dst` on `tag`. Completion
    /// means handed to the transport, not processed by the peer.
    async fn send(&self, dst: WorkerId, tag: Tag, buf: &[u8]) -> Result<(), CommError>;

    /// Fills `buf` from the next message matching `src` and `tag`; the
    /// message must carry exactly `buf.len()` bytes.
    ///
    /// # Returns
    /// Returns the rank the message actually came from, which matters for
    /// `RecvFrom::Any`.
    async fn recv(&self, src: RecvFrom, tag: Tag, buf: &mut [u8]) -> Result<WorkerId, CommError>;

    /// Collective rendezvous: returns only after every member has entered.
    /// Rank 0 gathers one token from each member, then releases the group
    /// with a broadcast. Same ordering discipline as any collective.
    async fn barrier(&self) -> Result<(), CommError> {
        let root = WorkerId(0);
        let mut token = [0u8; 1];

        if self.rank() == root {
            for _ in 1..self.world_size() {
                self.recv(RecvFrom::Any, Tag::Barrier, &mut token).await?;
            }
            self.broadcast(root, &mut token).await
        } else {
            self.send(root, Tag::Barrier, &token).await?;
            self.broadcast(root, &mut token).await
        }
    }
}

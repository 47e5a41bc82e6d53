use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::distributed::comm::{CommError, Communicator, Mailbox, RecvFrom, Tag};
use crate::domain::node::WorkerId;

/// In-process worker group: every member lives in the same process and
/// messages travel through shared mailboxes. Used by the local demo mode and
/// by tests; semantics match [`TcpGroup`] exactly, minus the sockets.
///
/// Broadcast is eager on the root side. The root deposits its payload into
/// every peer mailbox and returns without waiting, the way a device
/// broadcast completes locally once the data is on the wire.
pub struct ChannelGroup {
    rank: WorkerId,
    mailboxes: Arc<Vec<Arc<Mailbox>>>,
}

impl ChannelGroup {
    /// Creates a fully connected group of `world_size` members.
    ///
    /// # Returns
    /// Returns one handle per rank, in rank order.
    pub fn create(world_size: usize) -> Vec<ChannelGroup> {
        let mailboxes: Arc<Vec<Arc<Mailbox>>> =
            Arc::new((0..world_size).map(|_| Arc::new(Mailbox::new())).collect());

        (0..world_size)
            .map(|rank| ChannelGroup { rank: WorkerId(rank as u32), mailboxes: Arc::clone(&mailboxes) })
            .collect()
    }

    /// Closes every mailbox of the group. Blocked receivers on any member
    /// resolve with `Closed` once their buffers drain.
    pub fn shutdown(&self) {
        for mailbox in self.mailboxes.iter() {
            mailbox.close();
        }
    }

    fn mailbox_of(&self, worker: WorkerId) -> Result<&Arc<Mailbox>, CommError> {
        self.mailboxes.get(worker.index()).ok_or(CommError::UnknownPeer(worker))
    }

    fn own_mailbox(&self) -> &Arc<Mailbox> {
        &self.mailboxes[self.rank.index()]
    }
}

#[async_trait]
impl Communicator for ChannelGroup {
    fn rank(&self) -> WorkerId {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.mailboxes.len()
    }

    async fn broadcast(&self, root: WorkerId, buf: &mut [u8]) -> Result<(), CommError> {
        if root.index() >= self.world_size() {
            return Err(CommError::UnknownPeer(root));
        }

        if self.rank == root {
            for (index, mailbox) in self.mailboxes.iter().enumerate() {
                if index != root.index() {
                    mailbox.push_collective(root, buf.to_vec());
                }
            }
            return Ok(());
        }

        let payload = self.own_mailbox().pop_collective(root).await?;
        if payload.len() != buf.len() {
            return Err(CommError::SizeMismatch { expected: buf.len(), got: payload.len() });
        }

        buf.copy_from_slice(&payload);
        Ok(())
    }

    async fn send(&self, dst: WorkerId, tag: Tag, buf: &[u8]) -> Result<(), CommError> {
        self.mailbox_of(dst)?.push_direct(self.rank, tag, buf.to_vec());
        Ok(())
    }

    async fn recv(&self, src: RecvFrom, tag: Tag, buf: &mut [u8]) -> Result<WorkerId, CommError> {
        if let RecvFrom::Peer(peer) = src {
            if peer.index() >= self.world_size() {
                return Err(CommError::UnknownPeer(peer));
            }
        }

        let (from, payload) = self.own_mailbox().pop_direct(src, tag).await?;
        if payload.len() != buf.len() {
            return Err(CommError::SizeMismatch { expected: buf.len(), got: payload.len() });
        }

        buf.copy_from_slice(&payload);
        Ok(from)
    }
}

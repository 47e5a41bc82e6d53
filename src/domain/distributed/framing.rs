use crate::domain::distributed::comm::{CommError, Communicator, MAX_FRAME_BYTES, RecvFrom, Tag};
use crate::domain::node::WorkerId;

// Variable-length messaging on top of size-declared primitives. A
// communicator receive must know its byte count up front, so every logical
// message travels as two transmissions: an 8-byte little-endian length
// header, then the payload itself. Both sides of an exchange must use the
// same framing; a desynchronized pair would misread payload bytes as a
// length.

/// Sends `payload` to `dst` on `tag`, header first.
pub async fn send_framed(comm: &dyn Communicator, dst: WorkerId, tag: Tag, payload: &[u8]) -> Result<(), CommError> {
    if payload.len() > MAX_FRAME_BYTES {
        return Err(CommError::FrameTooLarge(payload.len()));
    }

    let header = (payload.len() as u64).to_le_bytes();
    comm.send(dst, tag, &header).await?;
    comm.send(dst, tag, payload).await
}

/// Receives one framed message matching `src` and `tag`.
///
/// The payload is read from the same peer the header came from, so that
/// with `RecvFrom::Any` two senders cannot interleave their halves.
///
/// # Returns
/// Returns the sending rank and the payload.
pub async fn recv_framed(comm: &dyn Communicator, src: RecvFrom, tag: Tag) -> Result<(WorkerId, Vec<u8>), CommError> {
    let mut header = [0u8; 8];
    let from = comm.recv(src, tag, &mut header).await?;

    let declared = u64::from_le_bytes(header) as usize;
    if declared > MAX_FRAME_BYTES {
        return Err(CommError::FrameTooLarge(declared));
    }

    let mut payload = vec![0u8; declared];
    comm.recv(RecvFrom::Peer(from), tag, &mut payload).await?;

    Ok((from, payload))
}

/// Collective counterpart of the framed pair: length header first, payload
/// second, both broadcast from `root`. The root passes `Some(payload)`,
/// everyone else passes `None` and receives the root's bytes.
pub async fn broadcast_framed(
    comm: &dyn Communicator,
    root: WorkerId,
    payload: Option<&[u8]>,
) -> Result<Vec<u8>, CommError> {
    if comm.rank() == root {
        let payload = payload
            .ok_or_else(|| CommError::Transport("broadcast root called without a payload".to_string()))?;
        if payload.len() > MAX_FRAME_BYTES {
            return Err(CommError::FrameTooLarge(payload.len()));
        }

        let mut header = (payload.len() as u64).to_le_bytes();
        comm.broadcast(root, &mut header).await?;

        let mut buf = payload.to_vec();
        comm.broadcast(root, &mut buf).await?;
        Ok(buf)
    } else {
        let mut header = [0u8; 8];
        comm.broadcast(root, &mut header).await?;

        let declared = u64::from_le_bytes(header) as usize;
        if declared > MAX_FRAME_BYTES {
            return Err(CommError::FrameTooLarge(declared));
        }

        let mut buf = vec![0u8; declared];
        comm.broadcast(root, &mut buf).await?;
        Ok(buf)
    }
}

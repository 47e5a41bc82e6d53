use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use flowmesh::domain::distributed::comm::{ChannelGroup, CommError, Communicator, RecvFrom, Tag};
use flowmesh::domain::distributed::framing::{broadcast_framed, recv_framed, send_framed};
use flowmesh::domain::node::WorkerId;

#[tokio::test]
async fn test_framed_messages_round_trip_across_sizes() {
    let groups = ChannelGroup::create(2);

    for payload in [Vec::new(), vec![7u8; 5], vec![42u8; 100_000]] {
        send_framed(&groups[0], WorkerId(1), Tag::Control, &payload).await.unwrap();

        let (from, received) = recv_framed(&groups[1], RecvFrom::Any, Tag::Control).await.unwrap();
        assert_eq!(from, WorkerId(0));
        assert_eq!(received, payload);
    }
}

#[tokio::test]
async fn test_broadcast_framed_delivers_root_bytes_to_every_member() {
    let groups = ChannelGroup::create(3);
    let payload = b"ownership decision".to_vec();

    let root_copy = broadcast_framed(&groups[0], WorkerId(0), Some(&payload)).await.unwrap();
    assert_eq!(root_copy, payload);

    for member in &groups[1..] {
        let received = broadcast_framed(member, WorkerId(0), None).await.unwrap();
        assert_eq!(received, payload);
    }
}

#[tokio::test]
async fn test_declared_size_must_match_the_transmission() {
    let groups = ChannelGroup::create(2);
    groups[0].send(WorkerId(1), Tag::Control, &[1, 2, 3, 4]).await.unwrap();

    let mut buf = [0u8; 8];
    let err = groups[1].recv(RecvFrom::Peer(WorkerId(0)), Tag::Control, &mut buf).await.unwrap_err();
    assert!(matches!(err, CommError::SizeMismatch { expected: 8, got: 4 }));
}

#[tokio::test]
async fn test_absurd_length_announcement_is_rejected() {
    let groups = ChannelGroup::create(2);

    // A bare header declaring more bytes than any frame may carry.
    groups[0].send(WorkerId(1), Tag::Control, &u64::MAX.to_le_bytes()).await.unwrap();

    let err = recv_framed(&groups[1], RecvFrom::Any, Tag::Control).await.unwrap_err();
    assert!(matches!(err, CommError::FrameTooLarge(_)));
}

#[tokio::test]
async fn test_receive_any_reports_the_true_source() {
    let groups = ChannelGroup::create(3);
    groups[1].send(WorkerId(0), Tag::Control, b"one").await.unwrap();
    groups[2].send(WorkerId(0), Tag::Control, b"two").await.unwrap();

    let mut buf = [0u8; 3];
    let first = groups[0].recv(RecvFrom::Any, Tag::Control, &mut buf).await.unwrap();
    assert_eq!(first, WorkerId(1));
    assert_eq!(&buf, b"one");

    let second = groups[0].recv(RecvFrom::Any, Tag::Control, &mut buf).await.unwrap();
    assert_eq!(second, WorkerId(2));
    assert_eq!(&buf, b"two");
}

#[tokio::test]
async fn test_tags_keep_streams_apart() {
    let groups = ChannelGroup::create(2);

    groups[0].send(WorkerId(1), Tag::Control, b"request").await.unwrap();
    groups[0].send(WorkerId(1), Tag::Reply, b"answer!").await.unwrap();

    // The reply is readable first even though it was sent second.
    let mut buf = [0u8; 7];
    groups[1].recv(RecvFrom::Peer(WorkerId(0)), Tag::Reply, &mut buf).await.unwrap();
    assert_eq!(&buf, b"answer!");

    groups[1].recv(RecvFrom::Peer(WorkerId(0)), Tag::Control, &mut buf).await.unwrap();
    assert_eq!(&buf, b"request");
}

#[tokio::test]
async fn test_closed_group_unblocks_receivers() {
    let mut groups = ChannelGroup::create(2);
    let receiver = groups.pop().unwrap();
    let closer = groups.pop().unwrap();

    let waiter = tokio::spawn(async move { recv_framed(&receiver, RecvFrom::Any, Tag::Control).await });

    tokio::task::yield_now().await;
    closer.shutdown();

    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(CommError::Closed)));
}

#[tokio::test]
async fn test_barrier_waits_for_every_member() {
    let groups = ChannelGroup::create(3);
    let arrived = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for (index, group) in groups.into_iter().enumerate() {
        let arrived = Arc::clone(&arrived);
        handles.push(tokio::spawn(async move {
            // Skewed arrivals; the barrier must still hold everyone.
            tokio::time::sleep(Duration::from_millis(10 * index as u64)).await;
            arrived.fetch_add(1, Ordering::SeqCst);
            group.barrier().await.unwrap();
            arrived.load(Ordering::SeqCst)
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap(), 3);
    }
}

use std::sync::Arc;
use std::time::Duration;

use tandem_proto::RoomId;
use tandem_relay::rooms::RoomRegistry;
use tokio::sync::mpsc;

use crate::delivery::{Author, DeliveryState, Stamper, SystemClock};
use crate::room::{AssistClients, RoomCommand, RoomController, RoomEvent, RoomHandle, RoomOptions};
use crate::signaling::{self, DEFAULT_PING_INTERVAL};
use crate::transport::PeerConnectionFactory;
use crate::transport::mock::MockFactory;

async fn start_relay() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let registry = RoomRegistry::new(Duration::from_secs(600));
    tokio::spawn(async move {
        let _ = tandem_relay::serve(listener, registry).await;
    });
    format!("ws://{addr}")
}

async fn join(
    relay_url: &str,
    room: &RoomId,
    factory: Arc<dyn PeerConnectionFactory>,
    options: RoomOptions,
) -> (RoomHandle, mpsc::UnboundedReceiver<RoomEvent>) {
    let relay = signaling::connect(relay_url, room, DEFAULT_PING_INTERVAL)
        .await
        .unwrap();
    let (handle, mut events) = RoomController::start(
        room.clone(),
        relay,
        factory,
        Arc::new(Stamper::new(Arc::new(SystemClock))),
        options,
        AssistClients::default(),
    );
    match events.recv().await {
        Some(RoomEvent::Joined { .. }) => {}
        other => panic!("expected join confirmation, got {other:?}"),
    }
    (handle, events)
}

async fn next_matching<F>(events: &mut mpsc::UnboundedReceiver<RoomEvent>, pred: F) -> RoomEvent
where
    F: Fn(&RoomEvent) -> bool,
{
    loop {
        let event = events.recv().await.expect("room closed");
        if pred(&event) {
            return event;
        }
    }
}

#[test_timeout::timeout]
async fn two_members_chat_and_share_a_file_through_the_relay() {
    let relay_url = start_relay().await;
    let room = RoomId::parse("2468024").unwrap();
    let (first, second) = MockFactory::pair();
    let inbox = tempfile::tempdir().unwrap();

    let (alice, mut alice_events) = join(&relay_url, &room, first, RoomOptions::default()).await;
    let (bob, mut bob_events) = join(
        &relay_url,
        &room,
        second,
        RoomOptions {
            download_dir: Some(inbox.path().to_path_buf()),
            ..RoomOptions::default()
        },
    )
    .await;
    next_matching(&mut alice_events, |e| matches!(e, RoomEvent::MemberJoined(_))).await;

    alice.command(RoomCommand::SendText("hello bob".into())).unwrap();
    let RoomEvent::Received(entry) =
        next_matching(&mut bob_events, |e| matches!(e, RoomEvent::Received(_))).await
    else {
        unreachable!()
    };
    assert_eq!(entry.text.as_deref(), Some("hello bob"));
    assert_eq!(entry.author, Author::Remote(None));

    let RoomEvent::Delivered { state, .. } =
        next_matching(&mut alice_events, |e| matches!(e, RoomEvent::Delivered { .. })).await
    else {
        unreachable!()
    };
    assert_ne!(state, DeliveryState::Pending);

    let outbox = tempfile::tempdir().unwrap();
    let path = outbox.path().join("photo.png");
    let bytes: Vec<u8> = (0..50_000u32).map(|i| (i % 256) as u8).collect();
    std::fs::write(&path, &bytes).unwrap();
    alice.command(RoomCommand::SendFile(path)).unwrap();

    let RoomEvent::Received(entry) =
        next_matching(&mut bob_events, |e| matches!(e, RoomEvent::Received(_))).await
    else {
        unreachable!()
    };
    let metadata = entry.file.expect("file entry");
    assert_eq!(metadata.kind, "image");
    assert_eq!(metadata.size, bytes.len() as u64);
    let saved = entry.saved_to.expect("saved to inbox");
    assert!(saved.starts_with(inbox.path()));
    assert_eq!(std::fs::read(saved).unwrap(), bytes);

    next_matching(&mut alice_events, |e| matches!(e, RoomEvent::Delivered { .. })).await;

    let log = alice.leave().await;
    assert_eq!(log.entries().len(), 2);
    assert!(log.entries().iter().all(|e| e.delivery != DeliveryState::Pending));
    next_matching(&mut bob_events, |e| matches!(e, RoomEvent::MemberLeft(_))).await;
    bob.leave().await;
}

use super::harness::{Endpoint, connected_pair};
use crate::delivery::Outgoing;
use crate::session::{SessionCommand, SessionConfig, SessionInput, SessionUpdate};

#[test_timeout::timeout]
async fn peer_loss_replaces_the_remote_endpoint() {
    let (a, mut b) = connected_pair().await;
    let first_connection = b.factory.latest().unwrap();

    a.route.disconnect();
    b.route.disconnect();
    let a_factory = a.factory.clone();
    a.handle.shutdown().await;

    b.handle.send(SessionInput::PeerLeft).unwrap();
    b.next_update(|u| *u == SessionUpdate::Reset).await;
    assert!(first_connection.is_closed());
    assert_eq!(b.factory.created(), 2);

    // The rebuilt connection offers straight away; nobody is there to hear it.
    let offer = b.route.next_offer().await;
    assert!(offer.sdp.contains("gen2"), "offer from the rebuilt connection: {}", offer.sdp);

    // A comes back. B, already present, is told about the join and becomes
    // the impolite side; the returning A is polite.
    b.route.hold();
    b.handle.send(SessionInput::PeerJoined).unwrap();
    let mut a = Endpoint::spawn(
        a_factory,
        SessionConfig {
            polite: true,
            ..SessionConfig::default()
        },
        Some(b.handle.inputs()),
    )
    .await;
    b.route.connect(&a.handle);

    a.wait_connected().await;
    b.wait_connected().await;

    b.handle
        .command(SessionCommand::Send(Outgoing::Text {
            text: "welcome back".into(),
            timestamp: 4_000,
        }))
        .unwrap();
    assert_eq!(a.next_chat().await, "welcome back");
    assert!(matches!(
        b.next_update(|u| matches!(u, SessionUpdate::Acknowledged(_)))
            .await,
        SessionUpdate::Acknowledged(ack) if ack.id == 4_000
    ));
}

#[test_timeout::timeout]
async fn queue_survives_peer_loss() {
    let (a, mut b) = connected_pair().await;
    a.route.disconnect();
    b.route.disconnect();
    let a_factory = a.factory.clone();
    a.handle.shutdown().await;
    b.handle.send(SessionInput::PeerLeft).unwrap();
    b.next_update(|u| *u == SessionUpdate::Reset).await;

    b.handle
        .command(SessionCommand::Send(Outgoing::Text {
            text: "while you were out".into(),
            timestamp: 6_000,
        }))
        .unwrap();

    b.route.hold();
    b.handle.send(SessionInput::PeerJoined).unwrap();
    let mut a = Endpoint::spawn(
        a_factory,
        SessionConfig {
            polite: true,
            ..SessionConfig::default()
        },
        Some(b.handle.inputs()),
    )
    .await;
    b.route.connect(&a.handle);

    assert_eq!(a.next_chat().await, "while you were out");
}

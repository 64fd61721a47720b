use boardsync::{
    BoardId, Color, Config, DirectoryServer, EditOutcome, Path, Peer, Point, SubscriptionState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::sleep;

async fn start_directory() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = Arc::new(DirectoryServer::new(Config::default().replication.max_frame_bytes));
    tokio::spawn(server.run(listener));
    addr
}

async fn start_peer(directory: &str) -> Peer {
    let mut config = Config::default();
    config.peer.listen_addr = "127.0.0.1:0".to_string();
    config.peer.advertise_host = "127.0.0.1".to_string();
    config.directory.addr = directory.to_string();
    config.replication.connect_timeout_ms = 1000;
    Peer::start(config).await.unwrap()
}

fn path(color: Color, n: i32) -> Path {
    Path::new(color, vec![Point::new(n, 0), Point::new(n, 10), Point::new(n + 5, 10)]).unwrap()
}

/// Poll an async condition for up to five seconds
macro_rules! eventually {
    ($what:expr, $check:expr) => {{
        let mut reached = false;
        for _ in 0..500 {
            if $check {
                reached = true;
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(reached, "timed out waiting for {}", $what);
    }};
}

async fn synced(peer: &Peer, id: &BoardId) -> bool {
    peer.board_info(id)
        .await
        .is_some_and(|info| info.subscription == Some(SubscriptionState::Synced))
}

async fn same_content(a: &Peer, b: &Peer, id: &BoardId) -> bool {
    match (a.board_info(id).await, b.board_info(id).await) {
        (Some(a), Some(b)) => a.snapshot == b.snapshot,
        _ => false,
    }
}

/// Share, catch up, edit from both sides, late joiner
#[tokio::test]
async fn test_shared_board_converges() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let directory = start_directory().await;
    let alice = start_peer(&directory).await;
    let bob = start_peer(&directory).await;

    let id = alice.create_local_board().await.unwrap();
    alice.append_path_locally(path(Color::Black, 1)).await.unwrap();
    alice.append_path_locally(path(Color::Red, 2)).await.unwrap();
    alice.set_shared(true).await.unwrap();

    eventually!(
        "bob to catch up",
        synced(&bob, &id).await && same_content(&alice, &bob, &id).await
    );
    let info = bob.board_info(&id).await.unwrap();
    assert!(info.is_remote);
    assert_eq!(info.snapshot.version, 2);

    // Subscriber edit goes through the owner
    assert!(bob.select(&id).await);
    assert_eq!(
        bob.append_path_locally(path(Color::Rgb(0, 128, 255), 3))
            .await
            .unwrap(),
        EditOutcome::Proposed
    );
    eventually!(
        "alice to accept bob's path",
        alice.board_info(&id).await.unwrap().snapshot.version == 3
    );
    eventually!("bob to agree", same_content(&alice, &bob, &id).await);

    // Owner edits are broadcast
    alice.undo_locally().await.unwrap();
    alice.clear_locally().await.unwrap();
    eventually!(
        "bob to follow undo and clear",
        bob.board_info(&id)
            .await
            .is_some_and(|info| info.snapshot.version == 5 && info.snapshot.paths.is_empty())
    );

    // A peer arriving later learns about the board from the directory
    let carol = start_peer(&directory).await;
    eventually!(
        "carol to catch up",
        synced(&carol, &id).await && same_content(&alice, &carol, &id).await
    );
    assert_eq!(alice.board_info(&id).await.unwrap().listeners, 2);

    carol.shutdown().await;
    bob.shutdown().await;
    alice.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let directory = start_directory().await;
    let alice = start_peer(&directory).await;
    let bob = start_peer(&directory).await;

    let id = alice.create_local_board().await.unwrap();
    alice.set_shared(true).await.unwrap();
    eventually!("bob to subscribe", synced(&bob, &id).await);
    bob.select(&id).await;

    for n in 0..10 {
        // Either side may lose; the loser is discarded or re-bootstrapped
        let _ = tokio::join!(
            alice.append_path_locally(path(Color::Black, n)),
            bob.append_path_locally(path(Color::Red, n))
        );
    }

    eventually!(
        "replicas to converge",
        synced(&bob, &id).await && same_content(&alice, &bob, &id).await
    );
    let info = alice.board_info(&id).await.unwrap();
    assert!(info.snapshot.version >= 1);
    assert_eq!(info.snapshot.version as usize, info.snapshot.paths.len());

    bob.shutdown().await;
    alice.shutdown().await;
}

#[tokio::test]
async fn test_unshare_and_delete_withdraw_replicas() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let directory = start_directory().await;
    let alice = start_peer(&directory).await;
    let bob = start_peer(&directory).await;

    let first = alice.create_local_board().await.unwrap();
    alice.set_shared(true).await.unwrap();
    let second = alice.create_local_board().await.unwrap();
    alice.set_shared(true).await.unwrap();
    eventually!(
        "bob to subscribe to both",
        synced(&bob, &first).await && synced(&bob, &second).await
    );

    alice.select(&first).await;
    alice.set_shared(false).await.unwrap();
    eventually!("first board to disappear", bob.board_info(&first).await.is_none());
    assert!(alice.board_info(&first).await.is_some());

    alice.delete_board(&second).await.unwrap();
    eventually!("second board to disappear", bob.board_info(&second).await.is_none());

    // Sharing again is announced again
    alice.set_shared(true).await.unwrap();
    eventually!("first board to come back", synced(&bob, &first).await);

    bob.shutdown().await;
    alice.shutdown().await;
}

#[tokio::test]
async fn test_subscriber_delete_keeps_owner_board() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let directory = start_directory().await;
    let alice = start_peer(&directory).await;
    let bob = start_peer(&directory).await;

    let id = alice.create_local_board().await.unwrap();
    alice.append_path_locally(path(Color::Red, 7)).await.unwrap();
    alice.set_shared(true).await.unwrap();
    eventually!("bob to subscribe", synced(&bob, &id).await);

    let bob_board = bob.create_local_board().await.unwrap();
    bob.delete_board(&id).await.unwrap();
    eventually!(
        "alice to lose the listener",
        alice.board_info(&id).await.unwrap().listeners == 0
    );
    let info = alice.board_info(&id).await.unwrap();
    assert!(info.is_shared);
    assert_eq!(info.snapshot.version, 1);
    assert_eq!(bob.list_board_names().await, vec![bob_board]);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_owner_shutdown_withdraws_boards() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let directory = start_directory().await;
    let alice = start_peer(&directory).await;
    let bob = start_peer(&directory).await;

    let id = alice.create_local_board().await.unwrap();
    alice.set_shared(true).await.unwrap();
    eventually!("bob to subscribe", synced(&bob, &id).await);
    bob.select(&id).await;

    alice.shutdown().await;
    eventually!("bob to drop the board", bob.board_info(&id).await.is_none());
    assert_eq!(bob.selected().await, None);

    bob.shutdown().await;
}

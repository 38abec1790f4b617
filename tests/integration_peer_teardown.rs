use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use xipc::{Connection, Endpoint, ErrorCode, Event, Kind, Object};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[derive(Debug, PartialEq, Eq)]
enum Observation {
    Reply { error: bool },
    ConnectionError,
}

/// Two in-flight calls, then the server drops the peer without replying:
/// each reply handler fires exactly once with a `CONNECTION_INVALID` error
/// value, and the client's event handler fires exactly once on top.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn peer_death_resolves_every_pending_call() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let endpoint = Endpoint::unix(dir.path().join("teardown.sock"));

    let listener = Connection::listener(endpoint.clone(), None).await?;
    listener.set_event_handler(|event| {
        if let Event::Connection(peer) = event {
            let victim = peer.clone();
            let seen = Arc::new(AtomicUsize::new(0));
            peer.set_event_handler(move |event| {
                if let Event::Message(_) = event {
                    // Swallow both requests, then hang up mid-conversation.
                    if seen.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                        victim.cancel();
                    }
                }
            });
            peer.resume();
        }
    });
    listener.resume();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = Connection::client(endpoint, None).await?;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Observation>();

    let events = tx.clone();
    client.set_event_handler(move |event| {
        if let Event::Error(err) = event {
            assert_eq!(err.error_code(), Some(ErrorCode::ConnectionInvalid));
            let _ = events.send(Observation::ConnectionError);
        }
    });
    client.resume();

    for _ in 0..2 {
        let request = Object::dictionary();
        request.dictionary_set_string("op", "never-answered");
        let replies = tx.clone();
        client.send_message_with_reply(&request, None, move |reply| {
            let error = reply.kind() == Kind::Error
                && reply.error_code() == Some(ErrorCode::ConnectionInvalid);
            let _ = replies.send(Observation::Reply { error });
        })?;
    }

    let mut reply_errors = 0;
    let mut connection_errors = 0;
    for _ in 0..3 {
        let observation = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await?
            .expect("expected three observations");
        match observation {
            Observation::Reply { error } => {
                assert!(error, "pending call must resolve with CONNECTION_INVALID");
                reply_errors += 1;
            }
            Observation::ConnectionError => connection_errors += 1,
        }
    }
    assert_eq!(reply_errors, 2);
    assert_eq!(connection_errors, 1);

    // Nothing fires twice.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());

    // The dead connection now refuses work up front.
    let late = Object::dictionary();
    late.dictionary_set_bool("late", true);
    assert!(client.send_message(&late).is_err());
    Ok(())
}

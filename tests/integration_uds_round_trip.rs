use std::time::Duration;

use anyhow::Result;
use xipc::{Connection, Endpoint, Event, Object};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Wire a listener into an echo server: every request gets a reply with
/// `ok = true` and the request's `n` copied over.
fn serve_echo(listener: &Connection) {
    listener.set_event_handler(|event| {
        if let Event::Connection(peer) = event {
            let responder = peer.clone();
            peer.set_event_handler(move |event| {
                if let Event::Message(request) = event {
                    if let Some(reply) = request.dictionary_create_reply() {
                        reply.dictionary_set_bool("ok", true);
                        reply.dictionary_set_uint64("n", request.dictionary_get_uint64("n"));
                        let _ = responder.send_message(&reply);
                    }
                }
            });
            peer.resume();
        }
    });
    listener.resume();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn echo_round_trip() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let endpoint = Endpoint::unix(dir.path().join("echo.sock"));

    let listener = Connection::listener(endpoint.clone(), None).await?;
    serve_echo(&listener);

    // Give the acceptor a moment to come up.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = Connection::client(endpoint, None).await?;
    client.resume();

    let request = Object::dictionary();
    request.dictionary_set_uint64("n", 42);

    let reply = tokio::time::timeout(
        Duration::from_secs(5),
        client.send_message_with_reply_async(&request),
    )
    .await??;

    assert!(reply.dictionary_get_bool("ok"));
    assert_eq!(reply.dictionary_get_uint64("n"), 42);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sync_reply_from_a_blocking_thread() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let endpoint = Endpoint::unix(dir.path().join("echo_sync.sock"));

    let listener = Connection::listener(endpoint.clone(), None).await?;
    serve_echo(&listener);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = Connection::client(endpoint, None).await?;
    client.resume();

    let reply = tokio::task::spawn_blocking(move || {
        let request = Object::dictionary();
        request.dictionary_set_uint64("n", 7);
        client.send_message_with_reply_sync(&request)
    })
    .await??;

    assert!(reply.dictionary_get_bool("ok"));
    assert_eq!(reply.dictionary_get_uint64("n"), 7);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reply_handler_runs_on_the_requested_queue() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let endpoint = Endpoint::unix(dir.path().join("echo_queue.sock"));

    let listener = Connection::listener(endpoint.clone(), None).await?;
    serve_echo(&listener);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = Connection::client(endpoint, None).await?;
    client.resume();

    let reply_queue = xipc::SerialQueue::new("test.replies");
    let (tx, rx) = tokio::sync::oneshot::channel();
    let request = Object::dictionary();
    request.dictionary_set_uint64("n", 9);
    client.send_message_with_reply(&request, Some(&reply_queue), move |reply| {
        let _ = tx.send(reply.dictionary_get_uint64("n"));
    })?;

    let n = tokio::time::timeout(Duration::from_secs(5), rx).await??;
    assert_eq!(n, 9);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn structured_payloads_survive_the_trip() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let endpoint = Endpoint::unix(dir.path().join("structured.sock"));

    let listener = Connection::listener(endpoint.clone(), None).await?;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Object>();
    listener.set_event_handler(move |event| {
        if let Event::Connection(peer) = event {
            let tx = tx.clone();
            peer.set_event_handler(move |event| {
                if let Event::Message(message) = event {
                    let _ = tx.send(message);
                }
            });
            peer.resume();
        }
    });
    listener.resume();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = Connection::client(endpoint, None).await?;
    client.resume();

    let message = Object::dictionary();
    message.dictionary_set_value(
        "items",
        Object::array([Object::uint64(1), Object::string("two"), Object::boolean(true)]),
    );
    let inner = Object::dictionary();
    inner.dictionary_set_string("name", "nested");
    message.dictionary_set_value("inner", inner);
    message.dictionary_set_data("blob", &[0xDE, 0xAD, 0xBE, 0xEF]);
    client.send_message(&message)?;

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await?
        .expect("server should observe the message");

    assert!(received.equal(&message));
    let items = received.dictionary_get_value("items").expect("items");
    assert_eq!(items.array_get_string(1).as_deref(), Some("two"));
    assert_eq!(
        received.dictionary_get_data("blob").as_deref(),
        Some([0xDE, 0xAD, 0xBE, 0xEF].as_slice())
    );
    Ok(())
}

//! Connection lifecycle: close semantics and failure of in-flight work.

mod common;

use std::time::Duration;

use blip::{Connection, ConnectionError, MessageBuilder, SendError};
use common::{DelegateEvent, blackhole, connected_pair, forwarding_delegate, within};

#[tokio::test]
async fn close_fails_every_outstanding_response_future() {
    let (transport, events) = blackhole();
    let (delegate, mut delegate_events) = forwarding_delegate();
    let connection = Connection::new(transport, events, delegate);

    let mut pending = Vec::new();
    for _ in 0..3 {
        pending.push(
            connection
                .send_request(MessageBuilder::request("ping"))
                .expect("send"),
        );
    }
    connection.close();

    for result in futures::future::join_all(pending).await {
        assert_eq!(result.expect_err("future must fail"), ConnectionError::Closed);
    }
    assert!(matches!(
        within(delegate_events.recv()).await,
        Some(DelegateEvent::Close(status)) if status.normal
    ));
}

#[tokio::test]
async fn repeated_close_calls_report_exactly_one_closure() {
    let (transport, events) = blackhole();
    let (delegate, mut delegate_events) = forwarding_delegate();
    let connection = Connection::new(transport, events, delegate);

    connection.close();
    connection.close();
    connection.close();

    assert!(matches!(
        within(delegate_events.recv()).await,
        Some(DelegateEvent::Close(_))
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        delegate_events.try_recv().is_err(),
        "the delegate may hear about the close only once"
    );
}

#[tokio::test]
async fn sending_after_close_reports_the_connection_as_closed() {
    let (transport, events) = blackhole();
    let connection = Connection::new(transport, events, common::DefaultDelegate);
    connection.close();

    // Give the engine a moment to tear down.
    tokio::time::sleep(Duration::from_millis(50)).await;

    expect_closed(&connection).await;
}

/// A send after closure either fails to enqueue or fails its future;
/// which one depends on whether the engine task has fully wound down.
async fn expect_closed(connection: &Connection) {
    match connection.send_request(MessageBuilder::request("ping")) {
        Err(SendError::Closed) => {}
        Err(other) => panic!("unexpected send failure: {other}"),
        Ok(request) => {
            let result = within(request).await;
            assert_eq!(result.expect_err("no reply can come"), ConnectionError::Closed);
        }
    }
}

#[tokio::test]
async fn dropping_the_last_handle_closes_both_peers() {
    let ((a_end, a_events), (b_end, b_events)) = blip::loopback_pair();
    let client = Connection::new(a_end, a_events, common::DefaultDelegate);
    let (delegate, mut server_events) = forwarding_delegate();
    let _server = Connection::new(b_end, b_events, delegate);

    // Skip the connect notification.
    assert!(matches!(
        within(server_events.recv()).await,
        Some(DelegateEvent::Connect)
    ));

    drop(client);

    loop {
        match within(server_events.recv()).await {
            Some(DelegateEvent::Close(_)) => break,
            Some(_) => continue,
            None => panic!("server delegate hung up before reporting the close"),
        }
    }
}

#[tokio::test]
async fn peer_close_shuts_the_other_side_down_too() {
    let (client, server) = connected_pair();

    client.close();
    tokio::time::sleep(Duration::from_millis(50)).await;

    expect_closed(&server).await;
}

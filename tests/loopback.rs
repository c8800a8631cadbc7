//! End-to-end exchanges between two engines over a loopback transport.

mod common;

use blip::{MessageBuilder, MessageType};
use common::{DelegateEvent, connected_pair, forwarding_delegate, within};
use tokio::sync::mpsc;

#[tokio::test]
async fn ping_reaches_its_profile_handler_and_returns() {
    let (client, server) = connected_pair();
    server.set_request_handler("ping", |request| {
        let mut reply = MessageBuilder::response_to(&request);
        reply.add_property("seen", "yes").write(b"pong");
        request.respond(reply)?;
        Ok(())
    });

    let request = client
        .send_request(MessageBuilder::request("ping"))
        .expect("send");
    let response = within(request).await.expect("response");

    assert_eq!(response.message_type(), MessageType::Response);
    assert_eq!(response.property("seen"), Some("yes"));
    assert_eq!(response.body(), b"pong");
}

#[tokio::test]
async fn large_bodies_fragment_and_reassemble_unchanged() {
    let (client, server) = connected_pair();
    server.set_request_handler("echo", |request| {
        let mut reply = MessageBuilder::response_to(&request);
        reply.write(request.body());
        request.respond(reply)?;
        Ok(())
    });

    let body: Vec<u8> = (0..100 * 1024).map(|i| (i * 7 % 251) as u8).collect();
    let mut builder = MessageBuilder::request("echo");
    builder.write(&body);

    let response = within(client.send_request(builder).expect("send"))
        .await
        .expect("response");
    assert_eq!(response.body(), body.as_slice());
}

#[tokio::test]
async fn flow_control_drains_large_transfers_in_both_directions() {
    // Three hundred KiB forces the sender through freeze/thaw rounds: the
    // unacked-byte threshold parks the message until the receiver's ACKs
    // arrive, in each direction.
    let (client, server) = connected_pair();
    server.set_request_handler("echo", |request| {
        let mut reply = MessageBuilder::response_to(&request);
        reply.write(request.body());
        request.respond(reply)?;
        Ok(())
    });

    let body: Vec<u8> = (0..300 * 1024).map(|i| (i % 256) as u8).collect();
    let mut builder = MessageBuilder::request("echo");
    builder.write(&body);

    let response = within(client.send_request(builder).expect("send"))
        .await
        .expect("response");
    assert_eq!(response.body(), body.as_slice());
}

#[tokio::test]
async fn compressed_bodies_are_transparent_to_the_receiver() {
    let (client, server) = connected_pair();
    server.set_request_handler("echo", |request| {
        let mut reply = MessageBuilder::response_to(&request);
        reply.compressed = true;
        reply.write(request.body());
        request.respond(reply)?;
        Ok(())
    });

    let body = b"highly repetitive payload ".repeat(4096);
    let mut builder = MessageBuilder::request("echo");
    builder.compressed = true;
    builder.write(&body);

    let response = within(client.send_request(builder).expect("send"))
        .await
        .expect("response");
    assert_eq!(response.body(), body.as_slice());
}

#[tokio::test]
async fn json_bodies_round_trip_through_the_accessor() {
    let (client, server) = connected_pair();
    server.set_request_handler("getCheckpoint", |request| {
        let mut reply = MessageBuilder::response_to(&request);
        reply.add_property("Content-Type", "application/json");
        reply.write(br#"{"seq": 42, "ok": true}"#);
        request.respond(reply)?;
        Ok(())
    });

    let response = within(
        client
            .send_request(MessageBuilder::request("getCheckpoint"))
            .expect("send"),
    )
    .await
    .expect("response");

    assert_eq!(response.property("Content-Type"), Some("application/json"));
    let value: serde_json::Value = response.json_body().expect("valid JSON");
    assert_eq!(value["seq"], 42);
    assert_eq!(value["ok"], true);
}

#[tokio::test]
async fn failing_handler_turns_into_a_blip_501_error_reply() {
    let (client, server) = connected_pair();
    server.set_request_handler("boom", |_request| Err("the handler exploded".into()));

    let response = within(
        client
            .send_request(MessageBuilder::request("boom"))
            .expect("send"),
    )
    .await
    .expect("an error reply is still a completed response");

    assert!(response.is_error());
    let error = response.error().expect("error details");
    assert_eq!(error.domain, "BLIP");
    assert_eq!(error.code, 501);
    assert_eq!(error.message, "the handler exploded");
}

#[tokio::test]
async fn unhandled_requests_are_answered_with_blip_404() {
    let (client, _server) = connected_pair();

    let response = within(
        client
            .send_request(MessageBuilder::request("no-such-profile"))
            .expect("send"),
    )
    .await
    .expect("response");

    assert!(response.is_error());
    let error = response.error().expect("error details");
    assert_eq!(error.domain, "BLIP");
    assert_eq!(error.code, 404);
}

#[tokio::test]
async fn both_peers_issue_requests_concurrently() {
    let (client, server) = connected_pair();
    for connection in [&client, &server] {
        connection.set_request_handler("double", |request| {
            let value = request.int_property("n", 0);
            let mut reply = MessageBuilder::response_to(&request);
            reply.add_int_property("n", value * 2);
            request.respond(reply)?;
            Ok(())
        });
    }

    let mut pending = Vec::new();
    for n in 1..=10 {
        let from = if n % 2 == 0 { &client } else { &server };
        let mut builder = MessageBuilder::request("double");
        builder.add_int_property("n", n);
        pending.push((n, from.send_request(builder).expect("send")));
    }

    for (n, request) in pending {
        let response = within(request).await.expect("response");
        assert_eq!(response.int_property("n", 0), n * 2);
    }
}

#[tokio::test]
async fn no_reply_requests_are_delivered_but_never_answered() {
    let (client, server) = connected_pair();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    server.set_request_handler("log", move |request| {
        assert!(request.is_no_reply());
        // A handler may still try to respond; the attempt is dropped.
        request.respond(MessageBuilder::response_to(&request))?;
        let _ = seen_tx.send(String::from_utf8_lossy(request.body()).into_owned());
        Ok(())
    });

    client
        .send({
            let mut builder = MessageBuilder::request("log");
            builder.write(b"fire and forget");
            builder
        })
        .expect("send");

    let seen = within(seen_rx.recv()).await.expect("request delivered");
    assert_eq!(seen, "fire and forget");

    // The connection stays healthy afterwards.
    server.set_request_handler("ping", |request| {
        request.respond(MessageBuilder::response_to(&request))?;
        Ok(())
    });
    let response = within(
        client
            .send_request(MessageBuilder::request("ping"))
            .expect("send"),
    )
    .await;
    assert!(response.is_ok());
}

#[tokio::test]
async fn delegates_learn_about_connection_and_responses() {
    let ((a_end, a_events), (b_end, b_events)) = blip::loopback_pair();
    let (delegate, mut events) = forwarding_delegate();
    let client = blip::Connection::new(a_end, a_events, delegate);
    let server = blip::Connection::new(b_end, b_events, common::DefaultDelegate);

    assert!(matches!(
        within(events.recv()).await,
        Some(DelegateEvent::Connect)
    ));

    server.set_request_handler("ping", |request| {
        request.respond(MessageBuilder::response_to(&request))?;
        Ok(())
    });
    let response = within(
        client
            .send_request(MessageBuilder::request("ping"))
            .expect("send"),
    )
    .await
    .expect("response");
    assert!(!response.is_error());

    // The delegate hears about the response as well as the future.
    match within(events.recv()).await {
        Some(DelegateEvent::Response(seen)) => assert_eq!(seen.number(), response.number()),
        other => panic!("expected a response event, got {other:?}"),
    }
}

#[tokio::test]
async fn responses_resolve_even_when_the_connection_handle_is_dropped_first() {
    let (client, server) = connected_pair();
    server.set_request_handler("ping", |request| {
        request.respond(MessageBuilder::response_to(&request))?;
        Ok(())
    });

    let request = client
        .send_request(MessageBuilder::request("ping"))
        .expect("send");
    drop(client);

    // The outstanding future keeps the connection alive until it resolves.
    let response = within(request).await.expect("response");
    assert!(!response.is_error());
}

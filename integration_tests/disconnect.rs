//! Disconnect handling: every request in flight when the socket closes must
//! complete exactly once, with `TransportError::ConnectionLost`.

mod support;

use std::time::Duration;

use support::{MockReply, MockServer};
use tuplestore_client::{Client, Config, ClientError, TransportError};

async fn connect_to(server: &MockServer) -> Client {
    let config = Config::builder(server.addr.ip().to_string(), server.addr.port()).build();
    tokio::time::timeout(Duration::from_secs(5), Client::connect(config))
        .await
        .expect("connect timed out")
        .expect("connect failed")
}

#[tokio::test]
async fn hangup_completes_pending_request_with_connection_lost() {
    let server = MockServer::start(vec![MockReply::Hangup]).await;
    let client = connect_to(&server).await;

    let err = client.ping().await.expect_err("ping should fail after hangup");
    match err {
        ClientError::Transport(TransportError::ConnectionLost(_)) => {}
        other => panic!("expected ConnectionLost, got {:?}", other),
    }
}

#[tokio::test]
async fn every_pending_request_is_resolved_once_on_disconnect() {
    // No replies at all: the server accepts, greets, then the test drops
    // the server's listener task by never answering — each concurrently
    // issued ping must still resolve (with an error) rather than hang.
    let server = MockServer::start(vec![MockReply::Hangup]).await;
    let client = connect_to(&server).await;

    let (a, b, c) = tokio::join!(client.ping(), client.ping(), client.ping());
    for result in [a, b, c] {
        assert!(result.is_err(), "every in-flight ping must complete, not hang");
    }
}

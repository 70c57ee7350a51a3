//! Update-operation wire encoding and the retry-on-stale-schema path.

mod support;

use std::time::Duration;

use support::{num, vindex_row, vspace_row, MockReply, MockServer};
use tuplestore_client::error::ERROR_FLAG;
use tuplestore_client::ops::{BitwiseOp, FieldRef, Space, UpdateOp};
use tuplestore_client::schema::value::Value;
use tuplestore_client::{Client, Config};

async fn connect_to(server: &MockServer) -> Client {
    let config = Config::builder(server.addr.ip().to_string(), server.addr.port()).build();
    tokio::time::timeout(Duration::from_secs(5), Client::connect(config))
        .await
        .expect("connect timed out")
        .expect("connect failed")
}

fn discovery_replies() -> Vec<MockReply> {
    vec![
        MockReply::Rows(
            None,
            vec![vspace_row(512, "widgets", &[("id", "unsigned"), ("flags", "unsigned")])],
        ),
        MockReply::Rows(
            None,
            vec![vindex_row(512, 0, "primary", &[(0, "unsigned")])],
        ),
        MockReply::Tuples(Some(1), vec![]),
    ]
}

#[tokio::test]
async fn update_with_bitwise_op_round_trips() {
    let mut script = discovery_replies();
    script.push(MockReply::Tuples(
        Some(1),
        vec![vec![num(1), num(0b1010)]],
    ));
    let server = MockServer::start(script).await;
    let client = connect_to(&server).await;

    let updated = client
        .update(
            Space::name("widgets"),
            vec![Value::U32(1)],
            vec![UpdateOp::Bitwise {
                op: BitwiseOp::Or,
                field: FieldRef::Name("flags".into()),
                mask: 0b0010,
            }],
        )
        .await
        .expect("update failed");

    assert_eq!(updated.len(), 1);
    assert_eq!(updated.first().unwrap().get(1).unwrap().as_u32(), Some(0b1010));

    let requests = server.requests_seen();
    let update_request = requests.last().unwrap();
    assert_eq!(
        update_request.request_type,
        tuplestore_client::wire::request_type::UPDATE
    );
}

#[tokio::test]
async fn update_with_splice_op_round_trips() {
    let mut script = discovery_replies();
    script.push(MockReply::Tuples(Some(1), vec![vec![num(1), num(7)]]));
    let server = MockServer::start(script).await;
    let client = connect_to(&server).await;

    let updated = client
        .update(
            Space::name("widgets"),
            vec![Value::U32(1)],
            vec![UpdateOp::Splice {
                field: FieldRef::Name("flags".into()),
                offset: 0,
                count: 4,
                insert: 7u32.to_le_bytes().to_vec(),
            }],
        )
        .await
        .expect("update failed");

    assert_eq!(updated.len(), 1);

    let requests = server.requests_seen();
    assert_eq!(
        requests.last().unwrap().request_type,
        tuplestore_client::wire::request_type::UPDATE
    );
}

#[tokio::test]
async fn stale_schema_error_triggers_exactly_one_retry() {
    let mut script = discovery_replies();
    // First select attempt fails with a stale-schema error...
    script.push(MockReply::Error(Some(1), 109, "schema version mismatch"));
    // ...which forces a second discovery round...
    script.push(MockReply::Rows(
        None,
        vec![vspace_row(512, "widgets", &[("id", "unsigned"), ("flags", "unsigned")])],
    ));
    script.push(MockReply::Rows(
        None,
        vec![vindex_row(512, 0, "primary", &[(0, "unsigned")])],
    ));
    script.push(MockReply::Tuples(Some(2), vec![]));
    // ...and the retried select succeeds.
    script.push(MockReply::Tuples(
        Some(2),
        vec![vec![num(1), num(0)]],
    ));
    let server = MockServer::start(script).await;
    let client = connect_to(&server).await;

    let result = client
        .select(
            Space::name("widgets"),
            Space::name("primary"),
            vec![Value::U32(1)],
            Default::default(),
        )
        .await
        .expect("select should succeed after one retry");

    assert_eq!(result.len(), 1);
    assert_eq!(server.request_count(), 8);

    let select_calls = server
        .requests_seen()
        .into_iter()
        .filter(|r| r.request_type == tuplestore_client::wire::request_type::SELECT)
        .count();
    // Each round is 2 discovery selects + 1 user select (first attempt,
    // then the retry after invalidation) = 3 per round, 6 total.
    assert_eq!(select_calls, 6);
}

#[tokio::test]
async fn second_failure_after_retry_is_surfaced_as_is() {
    let mut script = discovery_replies();
    script.push(MockReply::Error(Some(1), 109, "schema version mismatch"));
    script.push(MockReply::Rows(
        None,
        vec![vspace_row(512, "widgets", &[("id", "unsigned"), ("flags", "unsigned")])],
    ));
    script.push(MockReply::Rows(
        None,
        vec![vindex_row(512, 0, "primary", &[(0, "unsigned")])],
    ));
    script.push(MockReply::Tuples(Some(2), vec![]));
    script.push(MockReply::Error(Some(2), 5, "no such tuple"));
    let server = MockServer::start(script).await;
    let client = connect_to(&server).await;

    let err = client
        .select(
            Space::name("widgets"),
            Space::name("primary"),
            vec![Value::U32(1)],
            Default::default(),
        )
        .await
        .expect_err("second failure should surface, not retry again");

    match err {
        tuplestore_client::ClientError::Server(server_err) => {
            assert_eq!(server_err.code, ERROR_FLAG | 5);
            assert_eq!(server_err.name, "ER_TUPLE_NOT_FOUND");
        }
        other => panic!("expected a server error, got {:?}", other),
    }
}

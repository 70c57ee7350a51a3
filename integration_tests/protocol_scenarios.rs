//! End-to-end scenarios against the mock server: connect, basic CRUD, and
//! pagination, exercising the full encode → wire → decode path.

mod support;

use std::time::Duration;

use support::{num, text, vindex_row, vspace_row, MockReply, MockServer};
use tuplestore_client::ops::{Space, SelectOptions};
use tuplestore_client::schema::value::Value;
use tuplestore_client::{Client, Config};

fn widgets_space() -> Vec<MockReply> {
    vec![MockReply::Rows(
        None,
        vec![vspace_row(512, "widgets", &[("id", "unsigned"), ("label", "string")])],
    )]
}

async fn connect_to(server: &MockServer) -> Client {
    let config = Config::builder(server.addr.ip().to_string(), server.addr.port()).build();
    tokio::time::timeout(Duration::from_secs(5), Client::connect(config))
        .await
        .expect("connect timed out")
        .expect("connect failed")
}

#[tokio::test]
async fn connect_and_ping_succeeds() {
    let server = MockServer::start(vec![MockReply::Tuples(Some(1), vec![])]).await;
    let client = connect_to(&server).await;

    client.ping().await.expect("ping failed");
    assert_eq!(server.request_count(), 1);
}

#[tokio::test]
async fn insert_then_duplicate_key_surfaces_server_error() {
    let server = MockServer::start(vec![
        // discovery: _vspace, _vindex
        MockReply::Rows(
            None,
            vec![vspace_row(512, "widgets", &[("id", "unsigned"), ("label", "string")])],
        ),
        MockReply::Rows(
            None,
            vec![vindex_row(512, 0, "primary", &[(0, "unsigned")])],
        ),
        MockReply::Tuples(Some(7), vec![]), // ping to harvest schema_id
        MockReply::Tuples(Some(7), vec![vec![num(1), text("left")]]), // insert ok
        MockReply::Error(Some(7), 4, "duplicate key exists"), // ER_TUPLE_FOUND
    ])
    .await;
    let client = connect_to(&server).await;

    let inserted = client
        .insert(Space::name("widgets"), vec![Value::U32(1), Value::from("left")])
        .await
        .expect("first insert should succeed");
    assert_eq!(inserted.len(), 1);
    assert_eq!(inserted.first().unwrap().get(0).unwrap().as_u32(), Some(1));

    let err = client
        .insert(Space::name("widgets"), vec![Value::U32(1), Value::from("right")])
        .await
        .expect_err("duplicate insert should fail");
    match err {
        tuplestore_client::ClientError::Server(server_err) => {
            assert_eq!(server_err.name, "ER_TUPLE_FOUND");
        }
        other => panic!("expected a server error, got {:?}", other),
    }
}

#[tokio::test]
async fn select_applies_limit_and_offset() {
    let mut script = widgets_space();
    script.push(MockReply::Rows(
        None,
        vec![vindex_row(512, 0, "primary", &[(0, "unsigned")])],
    ));
    script.push(MockReply::Tuples(Some(3), vec![]));
    script.push(MockReply::Tuples(
        Some(3),
        vec![
            vec![num(2), text("second")],
            vec![num(3), text("third")],
        ],
    ));
    let server = MockServer::start(script).await;
    let client = connect_to(&server).await;

    let options = SelectOptions {
        limit: 2,
        offset: 1,
        iterator: Default::default(),
    };
    let page = client
        .select(Space::name("widgets"), Space::name("primary"), vec![], options)
        .await
        .expect("select failed");

    assert_eq!(page.len(), 2);
    let ids: Vec<u32> = page.iter().map(|t| t.get(0).unwrap().as_u32().unwrap()).collect();
    assert_eq!(ids, vec![2, 3]);

    let requests = server.requests_seen();
    let select_request = requests.last().unwrap();
    assert_eq!(
        select_request.request_type,
        tuplestore_client::wire::request_type::SELECT
    );
}

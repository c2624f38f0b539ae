//! End-to-end dispatcher coverage using the in-memory `OplogSource` the
//! design notes call for (§9): a fake driving real routing/ensure-all-fields
//! logic with no live replica set or Postgres instance.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use mongodb::bson::{doc, Bson};
use moresql::config::{fan_key, load_str, Config};
use moresql::dispatcher::Dispatcher;
use moresql::oplog::{OpKind, OpTimestamp, OperationRecord, OplogError, OplogSource};

struct FakeOplogSource {
    ops: Vec<OperationRecord>,
}

#[async_trait]
impl OplogSource for FakeOplogSource {
    async fn open(&self, _start: OpTimestamp) -> moresql::Result<(BoxStream<'static, OperationRecord>, BoxStream<'static, OplogError>)> {
        let ops = self.ops.clone();
        Ok((stream::iter(ops).boxed(), stream::empty().boxed()))
    }
}

fn widgets_config() -> Config {
    load_str(
        r#"{"db": {"collections": {"widgets": {
            "mongo_collection": "widgets",
            "pg_table": "widgets",
            "fields": {"_id": "id", "name": "text", "age": "integer"}
        }}}}"#,
    )
    .unwrap()
}

fn op(id: &str, kind: OpKind, data: mongodb::bson::Document) -> OperationRecord {
    OperationRecord {
        database: "db".into(),
        collection: "widgets".into(),
        kind,
        id: Bson::String(id.into()),
        timestamp: OpTimestamp::new(1, 1),
        data,
    }
}

/// `Dispatcher::dispatch` sends onto a collection's inbound channel
/// regardless of whether [`Dispatcher::take_route`] has already claimed its
/// receiver/workers (only the receiver side is taken) — so we can take the
/// inbound receiver up front, drive the fake source's ops through `dispatch`,
/// and assert on what lands in that receiver directly, with no worker pool
/// or Postgres pool needed.
#[tokio::test]
async fn dispatched_ops_land_on_the_configured_collection_channel_with_fields_filled() {
    let config = widgets_config();
    let mut dispatcher = Dispatcher::new(&config);
    let config = Arc::new(config);

    let key = fan_key("db", "widgets");
    let (mut inbound_rx, _ring, _worker_senders, _worker_receivers) =
        dispatcher.take_route(&key).expect("route exists for a configured collection");

    let source = FakeOplogSource {
        ops: vec![
            op("alice", OpKind::Insert, doc! { "name": "Alice" }),
            op("bob", OpKind::Insert, doc! { "name": "Bob", "age": 30 }),
        ],
    };
    let (mut ops, _errors) = source.open(OpTimestamp::new(0, 1)).await.unwrap();
    while let Some(record) = ops.next().await {
        dispatcher.dispatch(&config, record).await;
    }
    drop(dispatcher);

    let first = inbound_rx.recv().await.expect("alice's op was dispatched");
    // §4.3: `ensure_all_fields` must have filled `age`, which Alice's
    // document never set, before the op reached the channel.
    assert!(first.data.contains_key("age"));
    assert_eq!(first.data.get("age"), Some(&Bson::Null));

    let second = inbound_rx.recv().await.expect("bob's op was dispatched");
    assert_eq!(second.data.get("age"), Some(&Bson::Int32(30)));

    assert!(inbound_rx.recv().await.is_none(), "channel closes once the dispatcher is dropped");
}

#[tokio::test]
async fn ops_for_an_unconfigured_collection_are_dropped() {
    let config = widgets_config();
    let dispatcher = Dispatcher::new(&config);
    let config = Arc::new(config);

    let stray = OperationRecord {
        database: "db".into(),
        collection: "not_configured".into(),
        kind: OpKind::Insert,
        id: Bson::String("x".into()),
        timestamp: OpTimestamp::new(1, 1),
        data: doc! {},
    };

    // No channel exists for this fan key; dispatch must return without
    // panicking and the counters must reflect the skip.
    dispatcher.dispatch(&config, stray).await;
    let counters = dispatcher.counters();
    assert_eq!(counters.skipped.load(std::sync::atomic::Ordering::Relaxed), 1);
}

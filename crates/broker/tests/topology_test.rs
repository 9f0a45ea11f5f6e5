//! Topology declaration against the in-memory broker.

use std::time::Duration;

use watchrabbit_broker::memory::{MemoryBroker, MemoryConnector};
use watchrabbit_broker::topology::declare;
use watchrabbit_broker::{BrokerError, Connector, ExchangeSpec, Topology};

const DEADLINE: Duration = Duration::from_secs(1);

#[tokio::test]
async fn declaring_twice_is_idempotent() {
    let connector = MemoryConnector::new(MemoryBroker::new());
    let topology = Topology::standard("biomarker", true);

    let first = connector.connect().await.unwrap();
    declare(&*first.channel, &topology, DEADLINE).await.unwrap();
    let bindings = connector.broker().binding_count();

    let second = connector.connect().await.unwrap();
    declare(&*second.channel, &topology, DEADLINE).await.unwrap();

    assert_eq!(connector.broker().binding_count(), bindings);
    assert_eq!(bindings, 6);
    assert_eq!(connector.broker().exchange_count(), 4);
    assert_eq!(connector.broker().queue_count(), 6);
}

#[tokio::test]
async fn inequivalent_redeclare_fails() {
    let connector = MemoryConnector::new(MemoryBroker::new());
    let session = connector.connect().await.unwrap();
    declare(&*session.channel, &Topology::standard("biomarker", false), DEADLINE)
        .await
        .unwrap();

    let conflicting = Topology {
        exchanges: vec![ExchangeSpec {
            name: "biomarker.file.events".into(),
            durable: false,
            auto_delete: true,
        }],
        ..Topology::default()
    };
    let err = declare(&*session.channel, &conflicting, DEADLINE).await.unwrap_err();
    assert!(matches!(err, BrokerError::Topology(_)));
}

#[tokio::test]
async fn declaring_on_closed_channel_fails() {
    let connector = MemoryConnector::new(MemoryBroker::new());
    let session = connector.connect().await.unwrap();
    connector.sever_all();

    let err = declare(&*session.channel, &Topology::standard("biomarker", false), DEADLINE)
        .await
        .unwrap_err();
    assert!(err.is_connection_fault());
    assert_eq!(connector.broker().exchange_count(), 0);
}

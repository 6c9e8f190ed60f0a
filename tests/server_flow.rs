//! End-to-end flows over loopback TCP: listeners, registry routing, the
//! outbound dispatcher and the publish retry task.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use astm_interface::broker::{InMemoryBroker, MessageBroker};
use astm_interface::config::{Config, InstrumentConfig, MessagingConfig, RetryConfig};
use astm_interface::model::{OrderMessageStatus, ServerMessageStatus};
use astm_interface::protocol::astm::{
    AstmMessage, HeaderRecord, MessageType, OrderRecord, TerminatorRecord,
};
use astm_interface::storage::{
    InMemoryRepository, OrderMessageRepository, ServerMessageRepository,
};
use astm_interface::Application;

use common::{analyzer_receive, analyzer_send, eventually, FlakyBroker, RESULT_UPLOAD};

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn test_config(port: u16, max_connections: usize, max_attempts: u32) -> Arc<Config> {
    Arc::new(Config {
        instruments: vec![InstrumentConfig {
            name: "vision-1".to_string(),
            port,
            max_connections,
            connection_timeout_seconds: 1,
            ..Default::default()
        }],
        messaging: MessagingConfig {
            retry: RetryConfig {
                max_attempts,
                batch_size: 20,
                // Minutes are too coarse for a test; zero makes rescheduled
                // orders due immediately
                collision_delay_minutes: 0,
                connection_delay_minutes: 0,
                schedule_interval_ms: 50,
            },
            ..Default::default()
        },
        ..Default::default()
    })
}

struct App {
    application: Application,
    repository: Arc<InMemoryRepository>,
    broker: Arc<InMemoryBroker>,
    config: Arc<Config>,
}

async fn start_app(port: u16, max_connections: usize, max_attempts: u32) -> App {
    let config = test_config(port, max_connections, max_attempts);
    let repository = Arc::new(InMemoryRepository::new());
    let broker = Arc::new(InMemoryBroker::new());

    let application = Application::build_with(
        Arc::clone(&config),
        Arc::clone(&repository) as Arc<dyn ServerMessageRepository>,
        Arc::clone(&repository) as Arc<dyn OrderMessageRepository>,
        Arc::clone(&broker) as Arc<dyn MessageBroker>,
    )
    .unwrap();
    application.start().await.unwrap();

    App {
        application,
        repository,
        broker,
        config,
    }
}

fn order_json() -> String {
    let message = AstmMessage {
        instrument_name: "vision-1".to_string(),
        message_type: Some(MessageType::Order),
        header: Some(HeaderRecord {
            delimiter_definition: "\\^&".to_string(),
            sender_id: "LIS^Host".to_string(),
            processing_id: "P".to_string(),
            version_number: "LIS2-A".to_string(),
            timestamp: "20250101120000".to_string(),
            ..Default::default()
        }),
        order_records: vec![OrderRecord {
            sequence_number: "1".to_string(),
            specimen_id: "S7".to_string(),
            universal_test_id: "ABO".to_string(),
            action_code: "N".to_string(),
            ..Default::default()
        }],
        terminator: Some(TerminatorRecord {
            sequence_number: "1".to_string(),
            termination_code: "N".to_string(),
        }),
        ..Default::default()
    };
    serde_json::to_string(&message).unwrap()
}

#[tokio::test]
async fn upload_over_tcp_reaches_the_broker() {
    let port = free_port();
    let app = start_app(port, 5, 5).await;

    let mut analyzer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    analyzer_send(&mut analyzer, RESULT_UPLOAD.as_bytes()).await;

    let broker = app.broker.clone();
    assert!(
        eventually(|| {
            let broker = broker.clone();
            async move { broker.published_count("lis.results").await == 1 }
        })
        .await
    );

    let published = app
        .repository
        .find_by_status(ServerMessageStatus::Published, 10)
        .await
        .unwrap();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].message_type, MessageType::Result);
    assert!(published[0].remote_address.starts_with("127.0.0.1"));

    let status = app.application.server.status().await;
    assert!(status.running);
    assert_eq!(status.instruments[0].connection_count, 1);

    app.application.stop().await;
    let status = app.application.server.status().await;
    assert!(!status.running);
}

#[tokio::test]
async fn order_published_to_queue_is_downloaded_by_the_analyzer() {
    let port = free_port();
    let app = start_app(port, 5, 5).await;

    let mut analyzer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    // Wait for the controller to register before routing an order at it
    let server = app.application.server.clone();
    assert!(
        eventually(|| {
            let server = server.clone();
            async move { server.status().await.instruments[0].connection_count == 1 }
        })
        .await
    );

    let queue = app.config.instruments[0].order_queue(&app.config.messaging);
    app.broker
        .publish(&queue, &order_json(), &HashMap::new())
        .await
        .unwrap();

    // The dispatcher persists the order and hands it to the controller;
    // the analyzer sees a normal download
    let content = analyzer_receive(&mut analyzer).await;
    let message = AstmMessage::parse(&content, "vision-1").unwrap();
    assert_eq!(message.message_type(), MessageType::Order);
    assert_eq!(message.order_records[0].specimen_id, "S7");
    assert_eq!(message.order_records[0].action_code, "N");

    let repository = app.repository.clone();
    assert!(
        eventually(|| {
            let repository = repository.clone();
            async move {
                repository
                    .find_by_instrument("vision-1")
                    .await
                    .unwrap()
                    .first()
                    .map(|o| o.status == OrderMessageStatus::Success)
                    .unwrap_or(false)
            }
        })
        .await,
        "order never reached SUCCESS"
    );

    app.application.stop().await;
}

#[tokio::test]
async fn order_for_disconnected_instrument_fails_after_budget() {
    let port = free_port();
    // Two attempts, then the third scan marks the order FAILED
    let app = start_app(port, 5, 2).await;

    let queue = app.config.instruments[0].order_queue(&app.config.messaging);
    app.broker
        .publish(&queue, &order_json(), &HashMap::new())
        .await
        .unwrap();

    let repository = app.repository.clone();
    assert!(
        eventually(|| {
            let repository = repository.clone();
            async move {
                repository
                    .find_by_instrument("vision-1")
                    .await
                    .unwrap()
                    .first()
                    .map(|o| o.status == OrderMessageStatus::Failed)
                    .unwrap_or(false)
            }
        })
        .await,
        "order never exhausted its retry budget"
    );

    let order = app
        .repository
        .find_by_instrument("vision-1")
        .await
        .unwrap()
        .remove(0);
    assert_eq!(order.retry_count, 2);
    assert_eq!(order.error_message.as_deref(), Some("retry budget exhausted"));

    app.application.stop().await;
}

#[tokio::test]
async fn connection_cap_refuses_excess_connections() {
    let port = free_port();
    let app = start_app(port, 1, 5).await;

    let _first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let server = app.application.server.clone();
    assert!(
        eventually(|| {
            let server = server.clone();
            async move { server.status().await.instruments[0].connection_count == 1 }
        })
        .await
    );

    // The second connection is accepted then immediately closed
    let mut second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut buffer = [0u8; 1];
    let read = second.read(&mut buffer).await.unwrap();
    assert_eq!(read, 0, "excess connection should be closed by the server");

    let status = app.application.server.status().await;
    assert_eq!(status.instruments[0].connection_count, 1);

    app.application.stop().await;
}

#[tokio::test]
async fn publish_retry_task_republishes_after_transient_outage() {
    let port = free_port();
    let config = test_config(port, 5, 5);
    let repository = Arc::new(InMemoryRepository::new());
    // First publish fails, every later one succeeds
    let broker = Arc::new(FlakyBroker::new(1));

    let application = Application::build_with(
        Arc::clone(&config),
        Arc::clone(&repository) as Arc<dyn ServerMessageRepository>,
        Arc::clone(&repository) as Arc<dyn OrderMessageRepository>,
        Arc::clone(&broker) as Arc<dyn MessageBroker>,
    )
    .unwrap();
    application.start().await.unwrap();

    let mut analyzer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    analyzer_send(&mut analyzer, RESULT_UPLOAD.as_bytes()).await;

    // The failed publish parks the row, then the periodic task replays it
    let repo = repository.clone();
    assert!(
        eventually(|| {
            let repo = repo.clone();
            async move {
                !repo
                    .find_by_status(ServerMessageStatus::Published, 10)
                    .await
                    .unwrap()
                    .is_empty()
            }
        })
        .await,
        "audit row was never republished"
    );

    assert_eq!(broker.published_count("lis.results").await, 1);
    application.stop().await;
}

#[tokio::test]
async fn sustained_broker_outage_exhausts_publish_attempts() {
    let port = free_port();
    let config = test_config(port, 5, 2);
    let repository = Arc::new(InMemoryRepository::new());
    let broker = Arc::new(FlakyBroker::new(usize::MAX));

    let application = Application::build_with(
        Arc::clone(&config),
        Arc::clone(&repository) as Arc<dyn ServerMessageRepository>,
        Arc::clone(&repository) as Arc<dyn OrderMessageRepository>,
        Arc::clone(&broker) as Arc<dyn MessageBroker>,
    )
    .unwrap();
    application.start().await.unwrap();

    let mut analyzer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    analyzer_send(&mut analyzer, RESULT_UPLOAD.as_bytes()).await;

    let repo = repository.clone();
    assert!(
        eventually(|| {
            let repo = repo.clone();
            async move {
                repo.find_by_status(ServerMessageStatus::Error, 10)
                    .await
                    .unwrap()
                    .iter()
                    .any(|m| {
                        m.last_error.as_deref() == Some("publish retry budget exhausted")
                    })
            }
        })
        .await,
        "audit row should end in ERROR once the publish budget is spent"
    );

    application.stop().await;
}

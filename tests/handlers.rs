use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;

use pacsnode::probe::{Availability, CapacityProbe, FilesystemProbe};
use pacsnode::services::{
    AvailabilityNotifier, AvailabilityUpdate, EchoHandler, InMemoryAvailabilityLedger,
    InstanceAvailability, NotifyHandler, StoreHandler,
};
use pacsnode::storage::{FilesystemStorage, PayloadStore};
use ulink::types::{codes, tags};
use ulink::{
    AssociationId, Command, CommandField, HandlerError, Message, RequestContext, ServiceHandler,
    Status,
};

fn context(capability: &str) -> RequestContext {
    RequestContext {
        association_id: AssociationId::new(),
        calling_entity: "MODALITY".to_string(),
        called_entity: "ARCHIVE".to_string(),
        capability: capability.to_string(),
        encoding: "RAW".to_string(),
        context_id: 1,
        exchange_id: 7,
    }
}

fn notify(attributes: &[(u32, &str)]) -> Message {
    let command = attributes
        .iter()
        .fold(Command::request(CommandField::NOTIFY_RQ), |command, (tag, value)| {
            command.with_attribute(*tag, *value)
        });
    Message::new(command, None)
}

struct Fixture {
    _dir: TempDir,
    ledger: Arc<InMemoryAvailabilityLedger>,
    handler: NotifyHandler,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().expect("temp dir");
    let probe = FilesystemProbe::new([
        ("nearline".to_string(), dir.path().to_path_buf()),
        ("tape".to_string(), dir.path().join("not-mounted")),
    ]);
    let ledger = Arc::new(InMemoryAvailabilityLedger::new());
    let handler = NotifyHandler::new(ledger.clone(), Arc::new(probe));
    Fixture {
        _dir: dir,
        ledger,
        handler,
    }
}

#[tokio::test]
async fn notify_records_valid_update() {
    let f = fixture();
    let request = notify(&[
        (tags::STUDY_INSTANCE_UID, "1.2.3"),
        (tags::INSTANCE_AVAILABILITY, "NEARLINE"),
        (tags::RETRIEVE_LOCATION, "nearline"),
    ]);

    let reply = f.handler.handle(&context("NOTIFY"), &request).await.unwrap();
    assert_eq!(reply.status, Status::Success);

    let update = f.ledger.latest("1.2.3").expect("update recorded");
    assert_eq!(update.availability, InstanceAvailability::Nearline);
    assert_eq!(update.retrieve_location.as_deref(), Some("nearline"));
    assert_eq!(update.reported_by, "MODALITY");
}

#[tokio::test]
async fn notify_requires_study_and_availability() {
    let f = fixture();

    let err = f
        .handler
        .handle(&context("NOTIFY"), &notify(&[(tags::INSTANCE_AVAILABILITY, "ONLINE")]))
        .await
        .unwrap_err();
    assert!(matches!(err, HandlerError::MissingAttribute(tags::STUDY_INSTANCE_UID)));
    assert_eq!(err.status(), Status::Failure(codes::MISSING_ATTRIBUTE));

    let err = f
        .handler
        .handle(&context("NOTIFY"), &notify(&[(tags::STUDY_INSTANCE_UID, "1.2.3")]))
        .await
        .unwrap_err();
    assert!(matches!(err, HandlerError::MissingAttribute(tags::INSTANCE_AVAILABILITY)));
    assert!(f.ledger.is_empty());
}

#[tokio::test]
async fn notify_rejects_unknown_availability_value() {
    let f = fixture();
    let err = f
        .handler
        .handle(
            &context("NOTIFY"),
            &notify(&[
                (tags::STUDY_INSTANCE_UID, "1.2.3"),
                (tags::INSTANCE_AVAILABILITY, "SOMEWHERE"),
            ]),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        HandlerError::InvalidValue { tag: tags::INSTANCE_AVAILABILITY, .. }
    ));
}

#[tokio::test]
async fn notify_checks_the_retrieve_location() {
    let f = fixture();
    let unavailable = notify(&[
        (tags::STUDY_INSTANCE_UID, "1.2.3"),
        (tags::INSTANCE_AVAILABILITY, "OFFLINE"),
        (tags::RETRIEVE_LOCATION, "tape"),
    ]);
    let err = f.handler.handle(&context("NOTIFY"), &unavailable).await.unwrap_err();
    assert!(matches!(err, HandlerError::Unavailable(_)));

    let unknown = notify(&[
        (tags::STUDY_INSTANCE_UID, "1.2.3"),
        (tags::INSTANCE_AVAILABILITY, "OFFLINE"),
        (tags::RETRIEVE_LOCATION, "mars"),
    ]);
    let err = f.handler.handle(&context("NOTIFY"), &unknown).await.unwrap_err();
    assert!(matches!(
        err,
        HandlerError::InvalidValue { tag: tags::RETRIEVE_LOCATION, .. }
    ));
    assert!(f.ledger.is_empty());
}

struct FailingNotifier;

#[async_trait]
impl AvailabilityNotifier for FailingNotifier {
    async fn record(&self, _update: AvailabilityUpdate) -> Result<(), String> {
        Err("ledger offline".to_string())
    }
}

#[derive(Debug)]
struct AlwaysAvailable;

#[async_trait]
impl CapacityProbe for AlwaysAvailable {
    async fn probe(&self, _location: &str) -> Availability {
        Availability::Available
    }
}

#[tokio::test]
async fn notifier_failure_is_a_processing_failure() {
    let handler = NotifyHandler::new(Arc::new(FailingNotifier), Arc::new(AlwaysAvailable));
    let err = handler
        .handle(
            &context("NOTIFY"),
            &notify(&[
                (tags::STUDY_INSTANCE_UID, "1.2.3"),
                (tags::INSTANCE_AVAILABILITY, "ONLINE"),
            ]),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status(), Status::Failure(codes::PROCESSING_FAILURE));
}

#[tokio::test]
async fn ledger_keeps_the_newest_update() {
    let ledger = InMemoryAvailabilityLedger::new();
    let newer = AvailabilityUpdate {
        study_instance_uid: "1.2.3".to_string(),
        availability: InstanceAvailability::Offline,
        retrieve_location: None,
        reported_by: "A".to_string(),
        received_at: chrono::Utc::now(),
    };
    let older = AvailabilityUpdate {
        availability: InstanceAvailability::Online,
        received_at: newer.received_at - chrono::Duration::seconds(5),
        ..newer.clone()
    };

    ledger.record(newer.clone()).await.unwrap();
    ledger.record(older).await.unwrap();
    assert_eq!(ledger.latest("1.2.3"), Some(newer));
    assert_eq!(ledger.len(), 1);
}

#[tokio::test]
async fn store_persists_payload() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(FilesystemStorage::new(dir.path()).unwrap());
    let handler = StoreHandler::new(storage.clone());

    let request = Message::new(
        Command::request(CommandField::STORE_RQ).with_attribute(tags::AFFECTED_INSTANCE_UID, "1.2.3.4"),
        Some(Bytes::from_static(b"pixel data")),
    );
    let reply = handler.handle(&context("STORE"), &request).await.unwrap();
    assert_eq!(reply.status, Status::Success);
    assert_eq!(storage.load("1.2.3.4").await.unwrap(), b"pixel data");
}

#[tokio::test]
async fn store_rejects_incomplete_requests() {
    let dir = TempDir::new().unwrap();
    let handler = StoreHandler::new(Arc::new(FilesystemStorage::new(dir.path()).unwrap()));

    let no_payload = Message::new(
        Command::request(CommandField::STORE_RQ).with_attribute(tags::AFFECTED_INSTANCE_UID, "1.2.3.4"),
        None,
    );
    assert!(matches!(
        handler.handle(&context("STORE"), &no_payload).await,
        Err(HandlerError::MissingPayload)
    ));

    let no_uid = Message::new(
        Command::request(CommandField::STORE_RQ),
        Some(Bytes::from_static(b"x")),
    );
    assert!(matches!(
        handler.handle(&context("STORE"), &no_uid).await,
        Err(HandlerError::MissingAttribute(tags::AFFECTED_INSTANCE_UID))
    ));

    let bad_uid = Message::new(
        Command::request(CommandField::STORE_RQ).with_attribute(tags::AFFECTED_INSTANCE_UID, "../../etc"),
        Some(Bytes::from_static(b"x")),
    );
    assert!(matches!(
        handler.handle(&context("STORE"), &bad_uid).await,
        Err(HandlerError::InvalidValue { .. })
    ));
}

#[tokio::test]
async fn echo_answers_only_echo_requests() {
    let echo = EchoHandler;
    let reply = echo
        .handle(&context("VERIFY"), &Message::new(Command::request(CommandField::ECHO_RQ), None))
        .await
        .unwrap();
    assert_eq!(reply.status, Status::Success);

    let reply = echo
        .handle(&context("VERIFY"), &Message::new(Command::request(CommandField::STORE_RQ), None))
        .await
        .unwrap();
    assert_eq!(reply.status, Status::Failure(codes::UNRECOGNIZED_OPERATION));
}

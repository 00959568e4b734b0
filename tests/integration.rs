//! End-to-end session tests over the in-memory transport.
//!
//! Each test drives two real sessions (or one session against a
//! frame-level peer) through negotiation and steady-state traffic.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use etpwire::codec::{self, MessageEncoding};
use etpwire::error::{ErrorCode, EtpError};
use etpwire::handler::{
    Contract, GrowingObjectCustomer, GrowingObjectStore, GrowingStoreProvider, HandlerCore,
    ProtocolHandler, StoreCustomer, StoreProvider, StoreStore,
};
use etpwire::messages::{
    Body, DataObject, EtpVersion, GetObject, ObjectPart, OpenSession, ProtocolException,
    RangeEndpoint, RangeValue, Role, SupportedProtocol,
};
use etpwire::protocol::{flags, message_types, protocols, MessageCatalog, MessageHeader};
use etpwire::session::{Session, SessionBuilder, SessionConfig, SessionState};
use etpwire::transport::{mem, HandshakeHeaders, TransportSink, TransportStream, WireFrame};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn customer_config(encoding: MessageEncoding) -> SessionConfig {
    SessionConfig {
        application_name: "etpwire-test-customer".to_string(),
        default_encoding: encoding,
        negotiation_timeout: Duration::from_secs(2),
        ..SessionConfig::default()
    }
}

fn store_config() -> SessionConfig {
    SessionConfig {
        application_name: "etpwire-test-store".to_string(),
        negotiation_timeout: Duration::from_secs(2),
        ..SessionConfig::default()
    }
}

/// Open two connected sessions over the in-memory transport.
async fn open_pair(
    customer: SessionBuilder,
    store: SessionBuilder,
    encoding: MessageEncoding,
) -> (Session, Session) {
    let ((customer_sink, customer_stream), (store_sink, store_stream)) = mem::pair();
    let mut headers = HandshakeHeaders::new();
    headers.insert("etp-encoding", encoding.header_value());

    let store_task = tokio::spawn(async move {
        store
            .open_store(store_sink, store_stream, &headers)
            .await
            .expect("store open")
    });
    let customer = customer
        .open_customer(customer_sink, customer_stream)
        .await
        .expect("customer open");
    let store = store_task.await.expect("store task");
    (customer, store)
}

/// In-memory object store backing the store-side handlers.
#[derive(Default)]
struct MemoryStore {
    objects: Mutex<HashMap<String, DataObject>>,
}

#[async_trait]
impl StoreProvider for MemoryStore {
    async fn get(&self, uri: &str) -> Result<DataObject, ProtocolException> {
        self.objects.lock().unwrap().get(uri).cloned().ok_or_else(|| {
            ProtocolException::new(ErrorCode::InvalidUri, format!("no object at {}", uri))
        })
    }

    async fn put(&self, data_object: DataObject) -> Result<(), ProtocolException> {
        self.objects
            .lock()
            .unwrap()
            .insert(data_object.uri.clone(), data_object);
        Ok(())
    }

    async fn delete(&self, uri: &str) -> Result<(), ProtocolException> {
        self.objects
            .lock()
            .unwrap()
            .remove(uri)
            .map(|_| ())
            .ok_or_else(|| {
                ProtocolException::new(ErrorCode::InvalidUri, format!("no object at {}", uri))
            })
    }
}

/// Growing-object provider serving a fixed fragment list per range call.
struct FixedParts(Vec<ObjectPart>);

#[async_trait]
impl GrowingStoreProvider for FixedParts {
    async fn get_part(&self, _uri: &str, uid: &str) -> Result<ObjectPart, ProtocolException> {
        self.0
            .iter()
            .find(|part| part.uid == uid)
            .cloned()
            .ok_or_else(|| ProtocolException::new(ErrorCode::InvalidUri, "no such part"))
    }

    async fn get_range(
        &self,
        _uri: &str,
        _from: &RangeEndpoint,
        _to: &RangeEndpoint,
    ) -> Result<Vec<ObjectPart>, ProtocolException> {
        Ok(self.0.clone())
    }

    async fn put_part(&self, _uri: &str, _part: ObjectPart) -> Result<(), ProtocolException> {
        Ok(())
    }

    async fn delete_part(&self, _uri: &str, _uid: &str) -> Result<(), ProtocolException> {
        Ok(())
    }

    async fn delete_range(
        &self,
        _uri: &str,
        _from: &RangeEndpoint,
        _to: &RangeEndpoint,
    ) -> Result<(), ProtocolException> {
        Ok(())
    }

    async fn replace_parts_by_range(
        &self,
        _uri: &str,
        _from: &RangeEndpoint,
        _to: &RangeEndpoint,
        _parts: Vec<ObjectPart>,
    ) -> Result<(), ProtocolException> {
        Ok(())
    }
}

fn sample_part(uid: &str) -> ObjectPart {
    ObjectPart {
        uid: uid.to_string(),
        content_type: "application/x-witsml+xml".to_string(),
        data: Bytes::from(format!("<data uid=\"{}\"/>", uid)),
    }
}

fn depth(value: f64) -> RangeEndpoint {
    RangeEndpoint {
        value: RangeValue::Double(value),
        uom: "m".to_string(),
        depth_datum: "KB".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Negotiation
// ---------------------------------------------------------------------------

/// Customer handler that records lifecycle callbacks, for observing
/// `on_session_opened` ordering.
struct RecordingCustomer {
    core: HandlerCore,
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl RecordingCustomer {
    fn store(log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            core: HandlerCore::new(protocols::STORE, Role::Customer, Contract::StoreCustomer),
            name: "store-customer",
            log,
        }
    }

    fn growing(log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            core: HandlerCore::new(
                protocols::GROWING_OBJECT,
                Role::Customer,
                Contract::GrowingObjectCustomer,
            ),
            name: "growing-customer",
            log,
        }
    }
}

#[async_trait]
impl ProtocolHandler for RecordingCustomer {
    fn handler_core(&self) -> &HandlerCore {
        &self.core
    }

    async fn handle_message(&self, _header: &MessageHeader, _body: Body) -> etpwire::Result<()> {
        Ok(())
    }

    fn on_session_opened(&self, requested: &[SupportedProtocol], negotiated: &[SupportedProtocol]) {
        assert!(!requested.is_empty());
        assert!(!negotiated.is_empty());
        self.log
            .lock()
            .unwrap()
            .push(format!("opened:{}", self.name));
    }

    fn on_session_closed(&self) {
        self.log
            .lock()
            .unwrap()
            .push(format!("closed:{}", self.name));
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[tokio::test]
async fn negotiation_happy_path() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let customer = Session::builder(customer_config(MessageEncoding::Binary))
        .register(Arc::new(RecordingCustomer::store(log.clone())))
        .register(Arc::new(RecordingCustomer::growing(log.clone())));
    let store = Session::builder(store_config())
        .register(Arc::new(StoreStore::new(Arc::new(MemoryStore::default()))))
        .register(Arc::new(GrowingObjectStore::new(Arc::new(FixedParts(
            vec![],
        )))));

    let (customer, store) = open_pair(customer, store, MessageEncoding::Binary).await;

    assert_eq!(customer.state(), SessionState::Open);
    assert_eq!(store.state(), SessionState::Open);

    // The store assigned the id; both sides agree on it.
    let session_id = store.session_id().expect("store session id");
    assert_eq!(customer.session_id(), Some(session_id));

    // Both customer handlers survived and saw on_session_opened, in
    // registration order.
    assert!(customer.can_handle(Contract::StoreCustomer));
    assert!(customer.can_handle(Contract::GrowingObjectCustomer));
    assert_eq!(
        *log.lock().unwrap(),
        vec!["opened:store-customer", "opened:growing-customer"]
    );

    // The negotiated list carries the store's roles.
    let negotiated = customer.negotiated_protocols();
    assert_eq!(negotiated.len(), 2);
    assert!(negotiated
        .iter()
        .all(|sp| sp.role == Role::Store && sp.protocol_version == EtpVersion::V11.version()));
}

#[tokio::test]
async fn negotiation_prunes_unsupported_handlers() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let customer = Session::builder(customer_config(MessageEncoding::Binary))
        .register(Arc::new(RecordingCustomer::store(log.clone())))
        .register(Arc::new(RecordingCustomer::growing(log.clone())));
    // The store only offers the Store protocol.
    let store = Session::builder(store_config())
        .register(Arc::new(StoreStore::new(Arc::new(MemoryStore::default()))));

    let (customer, _store) = open_pair(customer, store, MessageEncoding::Binary).await;

    assert!(customer.can_handle(Contract::StoreCustomer));
    assert!(!customer.can_handle(Contract::GrowingObjectCustomer));
    assert!(matches!(
        customer.handler(Contract::GrowingObjectCustomer),
        Err(EtpError::NotRegistered(Contract::GrowingObjectCustomer))
    ));
    // Only the surviving handler was opened.
    assert_eq!(*log.lock().unwrap(), vec!["opened:store-customer"]);
}

// ---------------------------------------------------------------------------
// Store round trips
// ---------------------------------------------------------------------------

#[tokio::test]
async fn store_get_put_delete_roundtrip() {
    let customer = Session::builder(customer_config(MessageEncoding::Binary))
        .register(Arc::new(StoreCustomer::new()));
    let store = Session::builder(store_config())
        .register(Arc::new(StoreStore::new(Arc::new(MemoryStore::default()))));
    let (customer, _store) = open_pair(customer, store, MessageEncoding::Binary).await;

    let handler = customer
        .handler_as::<StoreCustomer>(Contract::StoreCustomer)
        .unwrap();

    let object = DataObject {
        uri: "eml://well/1".to_string(),
        content_type: "application/x-witsml+xml".to_string(),
        data: Bytes::from_static(b"<well/>"),
    };

    // Put, then get it back.
    let put_id = handler.put_object(object.clone()).await.unwrap();
    customer.await_response(put_id).await.unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let events_sink = events.clone();
    handler.on_object.subscribe(move |event| {
        events_sink.lock().unwrap().push(event.clone());
    });

    let get_id = handler.get_object("eml://well/1").await.unwrap();
    let set = customer.await_response(get_id).await.unwrap();
    assert_eq!(set.len(), 1);
    assert!(matches!(
        &set[0],
        Body::Object(object_msg) if object_msg.data_object == object
    ));

    let events = events.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].correlation_id, get_id);
    assert!(events[0].final_part);

    // Delete, then a second get fails with the provider's code.
    let delete_id = handler.delete_object("eml://well/1").await.unwrap();
    customer.await_response(delete_id).await.unwrap();

    let missing_id = handler.get_object("eml://well/1").await.unwrap();
    let err = customer.await_response(missing_id).await.unwrap_err();
    assert!(matches!(
        err,
        EtpError::Remote {
            code: ErrorCode::InvalidUri,
            ..
        }
    ));
}

// ---------------------------------------------------------------------------
// Multipart assembly
// ---------------------------------------------------------------------------

#[tokio::test]
async fn multipart_fragments_assemble_and_release_tracker_entry() {
    let parts = vec![sample_part("p-1"), sample_part("p-2"), sample_part("p-3")];
    let customer = Session::builder(customer_config(MessageEncoding::Binary))
        .register(Arc::new(GrowingObjectCustomer::new()));
    let store = Session::builder(store_config()).register(Arc::new(GrowingObjectStore::new(
        Arc::new(FixedParts(parts.clone())),
    )));
    let (customer, _store) = open_pair(customer, store, MessageEncoding::Binary).await;

    let handler = customer
        .handler_as::<GrowingObjectCustomer>(Contract::GrowingObjectCustomer)
        .unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let events_sink = events.clone();
    handler.on_fragment.subscribe(move |event| {
        events_sink
            .lock()
            .unwrap()
            .push((event.part.uid.clone(), event.final_part));
    });

    let request_id = handler
        .get_range("eml://log/7", depth(100.0), depth(200.0))
        .await
        .unwrap();
    let set = customer.await_response(request_id).await.unwrap();

    // One assembled set, in order, and the tracker entry is gone.
    assert_eq!(set.len(), 3);
    for (body, part) in set.iter().zip(&parts) {
        assert!(matches!(
            body,
            Body::ObjectFragment(fragment) if fragment.part == *part
        ));
    }
    assert_eq!(customer.outstanding_requests(), 0);

    // One event per part; only the last is final.
    let events = events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            ("p-1".to_string(), false),
            ("p-2".to_string(), false),
            ("p-3".to_string(), true)
        ]
    );
}

#[tokio::test]
async fn empty_range_reply_closes_exchange() {
    let customer = Session::builder(customer_config(MessageEncoding::Binary))
        .register(Arc::new(GrowingObjectCustomer::new()));
    let store = Session::builder(store_config())
        .register(Arc::new(GrowingObjectStore::new(Arc::new(FixedParts(
            vec![],
        )))));
    let (customer, _store) = open_pair(customer, store, MessageEncoding::Binary).await;

    let handler = customer
        .handler_as::<GrowingObjectCustomer>(Contract::GrowingObjectCustomer)
        .unwrap();
    let request_id = handler
        .get_range("eml://log/7", depth(0.0), depth(1.0))
        .await
        .unwrap();
    let set = customer.await_response(request_id).await.unwrap();
    assert!(set.is_empty());
    assert_eq!(customer.outstanding_requests(), 0);
}

// ---------------------------------------------------------------------------
// Frame-level scenarios (session against a hand-driven peer)
// ---------------------------------------------------------------------------

/// Accept a customer's negotiation at frame level. Returns the peer's
/// `RequestSession` message id.
async fn puppet_accept(
    sink: &mut mem::MemorySink,
    stream: &mut mem::MemoryStream,
    catalog: &MessageCatalog,
    encoding: MessageEncoding,
) -> i64 {
    let frame = stream.recv().await.unwrap().expect("request frame");
    let decoded = codec::decode(&frame, catalog).unwrap();
    let request_id = decoded.header.message_id;
    assert_eq!(request_id, 1, "first allocated id on a session is 1");
    assert!(matches!(decoded.body.unwrap(), Body::RequestSession(_)));

    let mut header = MessageHeader::response(
        protocols::CORE,
        message_types::core::OPEN_SESSION,
        request_id,
    )
    .with_flags(flags::FINAL_PART);
    header.message_id = 1;
    let body = Body::OpenSession(OpenSession {
        session_id: "S1".to_string(),
        application_name: "puppet-store".to_string(),
        application_version: "0".to_string(),
        supported_protocols: vec![
            SupportedProtocol::new(protocols::STORE, EtpVersion::V11, Role::Store),
            SupportedProtocol::new(protocols::GROWING_OBJECT, EtpVersion::V11, Role::Store),
        ],
    });
    let frame = codec::encode(encoding, &header, &body).unwrap();
    sink.send(frame).await.unwrap();
    request_id
}

#[tokio::test]
async fn unknown_protocol_answered_on_core() {
    let ((customer_sink, customer_stream), (mut peer_sink, mut peer_stream)) = mem::pair();
    let catalog = MessageCatalog::for_version(EtpVersion::V11);

    let customer_task = tokio::spawn(async move {
        Session::builder(customer_config(MessageEncoding::Binary))
            .register(Arc::new(StoreCustomer::new()))
            .open_customer(customer_sink, customer_stream)
            .await
            .unwrap()
    });
    puppet_accept(
        &mut peer_sink,
        &mut peer_stream,
        &catalog,
        MessageEncoding::Binary,
    )
    .await;
    let _customer = customer_task.await.unwrap();

    // Protocol 99 does not exist; encode its body as a valid record so only
    // the protocol id is at fault.
    let mut header = MessageHeader::request(99, 1);
    header.message_id = 7;
    let mut frame = Vec::new();
    header.encode_avro(&mut frame);
    Body::GetObject(GetObject {
        uri: "eml://well/1".to_string(),
    })
    .encode_avro(&mut frame);
    peer_sink.send(WireFrame::Binary(frame)).await.unwrap();

    // The reply is a ProtocolException on Core echoing message id 7.
    let frame = peer_stream.recv().await.unwrap().expect("exception frame");
    let decoded = codec::decode(&frame, &catalog).unwrap();
    assert_eq!(decoded.header.protocol, protocols::CORE);
    assert_eq!(decoded.header.correlation_id, 7);
    match decoded.body.unwrap() {
        Body::ProtocolException(exception) => {
            assert_eq!(
                exception.code(),
                ErrorCode::UnsupportedProtocol,
                "{}",
                exception.error_message
            );
        }
        other => panic!("expected ProtocolException, got {}", other.name()),
    }
}

#[tokio::test]
async fn concurrent_sends_allocate_contiguous_ids_in_wire_order() {
    let ((customer_sink, customer_stream), (mut peer_sink, mut peer_stream)) = mem::pair();
    let catalog = Arc::new(MessageCatalog::for_version(EtpVersion::V11));

    let customer_task = tokio::spawn(async move {
        Session::builder(customer_config(MessageEncoding::Binary))
            .register(Arc::new(GrowingObjectCustomer::new()))
            .open_customer(customer_sink, customer_stream)
            .await
            .unwrap()
    });
    puppet_accept(
        &mut peer_sink,
        &mut peer_stream,
        &catalog,
        MessageEncoding::Binary,
    )
    .await;
    let customer = Arc::new(customer_task.await.unwrap());

    let handler = customer
        .handler_as::<GrowingObjectCustomer>(Contract::GrowingObjectCustomer)
        .unwrap();

    // Ten concurrent callers on the same session.
    let mut tasks = Vec::new();
    for i in 0..10 {
        let handler = handler.clone();
        tasks.push(tokio::spawn(async move {
            handler
                .get("eml://log/7", &format!("p-{}", i))
                .await
                .unwrap()
        }));
    }
    let mut allocated = Vec::new();
    for task in tasks {
        allocated.push(task.await.unwrap());
    }

    // Exactly ten frames, ids unique and monotonically increasing on the
    // wire, and contiguous after the negotiation message (id 1).
    let mut wire_ids = Vec::new();
    for _ in 0..10 {
        let frame = peer_stream.recv().await.unwrap().expect("request frame");
        let decoded = codec::decode(&frame, &catalog).unwrap();
        assert!(matches!(decoded.body.unwrap(), Body::GetPart(_)));
        wire_ids.push(decoded.header.message_id);
    }
    let expected: Vec<i64> = (2..=11).collect();
    assert_eq!(wire_ids, expected, "wire order must equal id order");

    allocated.sort_unstable();
    assert_eq!(allocated, expected, "each caller got a unique id");
}

// ---------------------------------------------------------------------------
// Handler failure
// ---------------------------------------------------------------------------

/// Store-side handler that fails on every inbound message.
struct FailingStore {
    core: HandlerCore,
}

impl FailingStore {
    fn new() -> Self {
        Self {
            core: HandlerCore::new(protocols::STORE, Role::Store, Contract::StoreStore),
        }
    }
}

#[async_trait]
impl ProtocolHandler for FailingStore {
    fn handler_core(&self) -> &HandlerCore {
        &self.core
    }

    async fn handle_message(&self, _header: &MessageHeader, _body: Body) -> etpwire::Result<()> {
        Err(EtpError::Protocol("store backend exploded".to_string()))
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[tokio::test]
async fn handler_failure_becomes_invalid_state_and_session_survives() {
    let customer = Session::builder(customer_config(MessageEncoding::Binary))
        .register(Arc::new(StoreCustomer::new()));
    let store = Session::builder(store_config()).register(Arc::new(FailingStore::new()));
    let (customer, store) = open_pair(customer, store, MessageEncoding::Binary).await;

    let handler = customer
        .handler_as::<StoreCustomer>(Contract::StoreCustomer)
        .unwrap();
    let request_id = handler.get_object("eml://well/1").await.unwrap();
    let err = customer.await_response(request_id).await.unwrap_err();
    assert!(matches!(
        err,
        EtpError::Remote {
            code: ErrorCode::InvalidState,
            ..
        }
    ));

    // The failure was contained; both sessions stay open and usable.
    assert_eq!(store.state(), SessionState::Open);
    assert_eq!(customer.state(), SessionState::Open);
    let second = handler.get_object("eml://well/2").await.unwrap();
    assert!(customer.await_response(second).await.is_err());
}

// ---------------------------------------------------------------------------
// JSON framing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn json_framing_end_to_end() {
    let ((customer_sink, customer_stream), (mut peer_sink, mut peer_stream)) = mem::pair();
    let catalog = MessageCatalog::for_version(EtpVersion::V11);

    let customer_task = tokio::spawn(async move {
        Session::builder(customer_config(MessageEncoding::Json))
            .register(Arc::new(StoreCustomer::new()))
            .open_customer(customer_sink, customer_stream)
            .await
            .unwrap()
    });
    puppet_accept(
        &mut peer_sink,
        &mut peer_stream,
        &catalog,
        MessageEncoding::Json,
    )
    .await;
    let customer = customer_task.await.unwrap();
    assert_eq!(customer.encoding(), MessageEncoding::Json);

    let handler = customer
        .handler_as::<StoreCustomer>(Contract::StoreCustomer)
        .unwrap();
    let request_id = handler.get_object("eml://well/1").await.unwrap();

    // The wire frame is text: a two-element JSON array with camelCase
    // header fields (field order immaterial).
    let frame = peer_stream.recv().await.unwrap().expect("request frame");
    let WireFrame::Text(text) = frame else {
        panic!("expected a text frame");
    };
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(
        value,
        serde_json::json!([
            {
                "protocol": 4,
                "messageType": 1,
                "messageId": request_id,
                "correlationId": 0,
                "messageFlags": 0
            },
            { "uri": "eml://well/1" }
        ])
    );
}

// ---------------------------------------------------------------------------
// Close semantics
// ---------------------------------------------------------------------------

/// Provider that never answers, for exercising close with in-flight
/// requests.
struct NeverReplies;

#[async_trait]
impl StoreProvider for NeverReplies {
    async fn get(&self, _uri: &str) -> Result<DataObject, ProtocolException> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        unreachable!("test provider never resolves");
    }

    async fn put(&self, _data_object: DataObject) -> Result<(), ProtocolException> {
        Ok(())
    }

    async fn delete(&self, _uri: &str) -> Result<(), ProtocolException> {
        Ok(())
    }
}

#[tokio::test]
async fn close_completes_pending_and_is_idempotent() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let customer = Session::builder(customer_config(MessageEncoding::Binary))
        .register(Arc::new(RecordingCustomer::store(log.clone())));
    let store =
        Session::builder(store_config()).register(Arc::new(StoreStore::new(Arc::new(NeverReplies))));
    let (customer, _store) = open_pair(customer, store, MessageEncoding::Binary).await;

    // A request that will never be answered.
    let header = MessageHeader::request(protocols::STORE, message_types::store::GET_OBJECT);
    let body = Body::GetObject(GetObject {
        uri: "eml://well/1".to_string(),
    });
    let request_id = customer.send_request(header, body).await.unwrap();
    assert_eq!(customer.outstanding_requests(), 1);

    customer.close("test finished").await;
    assert_eq!(customer.state(), SessionState::Closed);

    // Pending correlations complete with SessionClosed.
    let err = customer.await_response(request_id).await.unwrap_err();
    assert!(matches!(err, EtpError::SessionClosed));
    assert_eq!(customer.outstanding_requests(), 0);

    // on_session_closed fired exactly once; a second close is a no-op.
    let closings = |log: &Arc<Mutex<Vec<String>>>| {
        log.lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.starts_with("closed:"))
            .count()
    };
    assert_eq!(closings(&log), 1);
    customer.close("again").await;
    assert_eq!(customer.state(), SessionState::Closed);
    assert_eq!(closings(&log), 1);

    // Sends after close fail locally, with no wire traffic.
    let header = MessageHeader::request(protocols::STORE, message_types::store::GET_OBJECT);
    let body = Body::GetObject(GetObject {
        uri: "eml://well/2".to_string(),
    });
    assert!(matches!(
        customer.send_message(header, &body, None).await,
        Err(EtpError::SessionClosed)
    ));
}

#[tokio::test]
async fn request_timeout_completes_without_wire_traffic() {
    let config = SessionConfig {
        request_timeout: Some(Duration::from_millis(50)),
        ..customer_config(MessageEncoding::Binary)
    };
    let customer = Session::builder(config).register(Arc::new(StoreCustomer::new()));
    let store =
        Session::builder(store_config()).register(Arc::new(StoreStore::new(Arc::new(NeverReplies))));
    let (customer, store) = open_pair(customer, store, MessageEncoding::Binary).await;

    let handler = customer
        .handler_as::<StoreCustomer>(Contract::StoreCustomer)
        .unwrap();
    let request_id = handler.get_object("eml://well/1").await.unwrap();
    let err = customer.await_response(request_id).await.unwrap_err();
    assert!(matches!(err, EtpError::Timeout));
    assert_eq!(customer.outstanding_requests(), 0);

    // Expiry is local; both sessions remain open.
    assert_eq!(customer.state(), SessionState::Open);
    assert_eq!(store.state(), SessionState::Open);
}

#[tokio::test]
async fn peer_close_notification_closes_session() {
    let customer = Session::builder(customer_config(MessageEncoding::Binary))
        .register(Arc::new(StoreCustomer::new()));
    let store = Session::builder(store_config())
        .register(Arc::new(StoreStore::new(Arc::new(MemoryStore::default()))));
    let (customer, store) = open_pair(customer, store, MessageEncoding::Binary).await;

    customer.close("customer going away").await;

    // The store sees CloseSession and winds down on its own.
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if store.state() == SessionState::Closed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("store should close after peer CloseSession");
}

//! Session module - the session-and-dispatch engine.
//!
//! A [`Session`] owns the transport, the message-id allocator, the handler
//! registry, the correlation tracker, and the codec latched at open. It has
//! two long-lived logical tasks: the spawned receive loop (reads frames,
//! routes to handlers) and any caller of [`Session::send_message`].
//!
//! A single session-wide send lock serializes header-stamping, encode, and
//! transport write; that is the only way to guarantee `messageId`s appear
//! on the wire in allocation order. Receive never contends with send.

mod correlation;

pub use correlation::{CorrelationTracker, ResponseSet};

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::codec::{self, MessageEncoding, ENCODING_HEADER};
use crate::error::{ErrorCode, EtpError, Result};
use crate::handler::{Contract, CoreHandler, HandlerRegistry, ProtocolHandler};
use crate::messages::{
    Body, CloseSession, EtpVersion, OpenSession, ProtocolException, RequestSession, Role,
    SupportedProtocol,
};
use crate::protocol::{flags, message_types, protocols, MessageCatalog, MessageHeader};
use crate::transport::{HandshakeHeaders, TransportSink, TransportStream, WireFrame};

/// Session lifecycle states. Terminal states discard all pending
/// correlations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport is up, ETP negotiation in progress.
    Negotiating,
    /// Negotiation complete; steady-state traffic.
    Open,
    /// Close initiated; in-flight sends draining.
    Closing,
    /// Transport released; nothing more will be sent or delivered.
    Closed,
}

/// Session construction parameters. Injected at construction; there is no
/// process-wide mutable state.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Application name advertised during negotiation.
    pub application_name: String,
    /// Application version advertised during negotiation.
    pub application_version: String,
    /// Wire version this session speaks.
    pub version: EtpVersion,
    /// Name of the handshake header that selects the encoding.
    pub encoding_header: String,
    /// Encoding used when the handshake carries no encoding header, and the
    /// encoding a customer requests when connecting.
    pub default_encoding: MessageEncoding,
    /// Upper bound for one encoded frame.
    pub max_frame_size: usize,
    /// Deadline for the negotiation exchange.
    pub negotiation_timeout: Duration,
    /// Optional per-request deadline; expiry completes the correlation with
    /// `Timeout` and sends nothing on the wire.
    pub request_timeout: Option<Duration>,
    /// Bounded wait for in-flight sends while closing.
    pub close_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            application_name: "etpwire".to_string(),
            application_version: env!("CARGO_PKG_VERSION").to_string(),
            version: EtpVersion::V11,
            encoding_header: ENCODING_HEADER.to_string(),
            default_encoding: MessageEncoding::Binary,
            max_frame_size: 16 * 1024 * 1024,
            negotiation_timeout: Duration::from_secs(10),
            request_timeout: None,
            close_timeout: Duration::from_secs(5),
        }
    }
}

struct SessionInner {
    config: SessionConfig,
    role: Role,
    encoding: MessageEncoding,
    catalog: MessageCatalog,
    state: RwLock<SessionState>,
    session_id: RwLock<Option<String>>,
    registry: RwLock<HandlerRegistry>,
    next_message_id: AtomicI64,
    sink: AsyncMutex<Box<dyn TransportSink>>,
    tracker: CorrelationTracker,
    requested: RwLock<Vec<SupportedProtocol>>,
    negotiated: RwLock<Vec<SupportedProtocol>>,
    close_started: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

/// Builder for configuring handlers and opening a session (customer or
/// store side).
pub struct SessionBuilder {
    config: SessionConfig,
    handlers: Vec<Arc<dyn ProtocolHandler>>,
}

impl SessionBuilder {
    /// Start a builder with the given configuration.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            handlers: Vec::new(),
        }
    }

    /// Add a protocol handler. Registration errors (duplicate protocol ids)
    /// surface when the session opens.
    pub fn register(mut self, handler: Arc<dyn ProtocolHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Open the customer side: send `RequestSession`, await `OpenSession`,
    /// prune unsupported handlers, fire `on_session_opened`, start the
    /// receive loop.
    pub async fn open_customer<K, S>(self, sink: K, stream: S) -> Result<Session>
    where
        K: TransportSink + 'static,
        S: TransportStream + 'static,
    {
        let encoding = self.config.default_encoding;
        let inner = self.into_inner(Role::Customer, encoding, Box::new(sink))?;
        Session::negotiate_customer(inner, Box::new(stream)).await
    }

    /// Open the store side: await `RequestSession`, reply `OpenSession` (or
    /// `ProtocolException`), prune unsupported handlers, fire
    /// `on_session_opened`, start the receive loop.
    ///
    /// The upgrade `headers` are captured at construction; the encoding
    /// header value latches the codec for the session lifetime.
    pub async fn open_store<K, S>(
        self,
        sink: K,
        stream: S,
        headers: &HandshakeHeaders,
    ) -> Result<Session>
    where
        K: TransportSink + 'static,
        S: TransportStream + 'static,
    {
        let encoding = headers
            .get(&self.config.encoding_header)
            .and_then(MessageEncoding::from_header_value)
            .unwrap_or(self.config.default_encoding);
        let inner = self.into_inner(Role::Store, encoding, Box::new(sink))?;
        Session::negotiate_store(inner, Box::new(stream)).await
    }

    fn into_inner(
        self,
        role: Role,
        encoding: MessageEncoding,
        sink: Box<dyn TransportSink>,
    ) -> Result<Arc<SessionInner>> {
        let (closed_tx, _) = watch::channel(false);
        let catalog = MessageCatalog::for_version(self.config.version);
        let inner = Arc::new(SessionInner {
            catalog,
            role,
            encoding,
            state: RwLock::new(SessionState::Negotiating),
            session_id: RwLock::new(None),
            registry: RwLock::new(HandlerRegistry::new()),
            next_message_id: AtomicI64::new(0),
            sink: AsyncMutex::new(sink),
            tracker: CorrelationTracker::new(),
            requested: RwLock::new(Vec::new()),
            negotiated: RwLock::new(Vec::new()),
            close_started: AtomicBool::new(false),
            closed_tx,
            config: self.config,
        });

        let handle = SessionHandle {
            inner: Arc::downgrade(&inner),
        };
        {
            let mut registry = inner.registry.write().expect("registry poisoned");
            // Core is always present.
            let mut handlers = self.handlers;
            if !handlers
                .iter()
                .any(|handler| handler.contract() == Contract::Core)
            {
                handlers.insert(0, Arc::new(CoreHandler::new(inner.config.version)));
            }
            for handler in handlers {
                registry.register(handler.clone())?;
                handler.handler_core().bind(handle.clone());
                handler.on_registered();
            }
        }
        Ok(inner)
    }
}

/// An open ETP session.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Start building a session.
    pub fn builder(config: SessionConfig) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    /// A weak handle for handlers and background tasks.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.inner.state.read().expect("state poisoned")
    }

    /// Server-assigned session identity, once negotiated.
    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id.read().expect("id poisoned").clone()
    }

    /// Wire version this session speaks.
    pub fn version(&self) -> EtpVersion {
        self.inner.config.version
    }

    /// Which side of the session this endpoint plays.
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Codec latched at open.
    pub fn encoding(&self) -> MessageEncoding {
        self.inner.encoding
    }

    /// Protocols negotiated for this session.
    pub fn negotiated_protocols(&self) -> Vec<SupportedProtocol> {
        self.inner.negotiated.read().expect("negotiated poisoned").clone()
    }

    /// Protocols requested at negotiation (the local list on the customer
    /// side, the peer's list on the store side).
    pub fn requested_protocols(&self) -> Vec<SupportedProtocol> {
        self.inner.requested.read().expect("requested poisoned").clone()
    }

    /// Number of requests awaiting replies.
    pub fn outstanding_requests(&self) -> usize {
        self.inner.tracker.outstanding()
    }

    /// Fetch a handler by contract identity.
    pub fn handler(&self, contract: Contract) -> Result<Arc<dyn ProtocolHandler>> {
        self.inner
            .registry
            .read()
            .expect("registry poisoned")
            .by_contract(contract)
            .ok_or(EtpError::NotRegistered(contract))
    }

    /// Fetch a handler by contract with its concrete type.
    pub fn handler_as<T: ProtocolHandler>(&self, contract: Contract) -> Result<Arc<T>> {
        self.handler(contract)?
            .as_any()
            .downcast::<T>()
            .map_err(|_| EtpError::NotRegistered(contract))
    }

    /// Check whether a contract survived negotiation.
    pub fn can_handle(&self, contract: Contract) -> bool {
        self.inner
            .registry
            .read()
            .expect("registry poisoned")
            .contains(contract)
    }

    /// Send one message. Under the send lock this stamps the next message
    /// id, invokes `on_before_send` (so callers can record correlation
    /// before the bytes hit the wire), encodes, and writes. Returns the
    /// allocated id.
    pub async fn send_message(
        &self,
        header: MessageHeader,
        body: &Body,
        on_before_send: Option<&mut (dyn FnMut(&MessageHeader) + Send)>,
    ) -> Result<i64> {
        SessionInner::send_message(&self.inner, header, body, on_before_send).await
    }

    /// Send a request and register it with the correlation tracker.
    pub async fn send_request(&self, header: MessageHeader, body: Body) -> Result<i64> {
        SessionInner::send_request(&self.inner, header, body).await
    }

    /// Await the assembled reply set for a request sent with
    /// [`Session::send_request`].
    pub async fn await_response(&self, message_id: i64) -> Result<ResponseSet> {
        let receiver = self
            .inner
            .tracker
            .take_receiver(message_id)
            .ok_or_else(|| {
                EtpError::Protocol(format!("no pending request with id {}", message_id))
            })?;
        receiver.await.map_err(|_| EtpError::SessionClosed)?
    }

    /// Close the session: best-effort Core `CloseSession`, bounded wait for
    /// in-flight sends, transport close, complete all pending correlations
    /// with `SessionClosed`, fire `on_session_closed`. Idempotent.
    pub async fn close(&self, reason: &str) {
        SessionInner::shutdown(&self.inner, reason, true).await;
    }

    // ------------------------------------------------------------------
    // Negotiation
    // ------------------------------------------------------------------

    async fn negotiate_customer(
        inner: Arc<SessionInner>,
        mut stream: Box<dyn TransportStream>,
    ) -> Result<Session> {
        let requested = requested_protocols(&inner);
        *inner.requested.write().expect("requested poisoned") = requested.clone();

        let header =
            MessageHeader::request(protocols::CORE, message_types::core::REQUEST_SESSION);
        let body = Body::RequestSession(RequestSession {
            application_name: inner.config.application_name.clone(),
            application_version: inner.config.application_version.clone(),
            requested_protocols: requested.clone(),
        });
        let request_id = SessionInner::send_message(&inner, header, &body, None).await?;

        let reply = recv_one(&inner, &mut stream).await?;
        match reply.1 {
            Body::OpenSession(open) if reply.0.correlation_id == request_id => {
                info!(session_id = %open.session_id, "session opened");
                *inner.session_id.write().expect("id poisoned") = Some(open.session_id.clone());
                finish_open(&inner, &requested, open.supported_protocols, true);
                Ok(Session::spawn_receive(inner, stream))
            }
            Body::ProtocolException(exception) => Err(EtpError::Remote {
                code: ErrorCode::from_i32(exception.error_code),
                message: exception.error_message,
            }),
            other => Err(EtpError::Protocol(format!(
                "unexpected negotiation reply {}",
                other.name()
            ))),
        }
    }

    async fn negotiate_store(
        inner: Arc<SessionInner>,
        mut stream: Box<dyn TransportStream>,
    ) -> Result<Session> {
        let (request_header, request_body) = recv_one(&inner, &mut stream).await?;
        let request = match request_body {
            Body::RequestSession(request) => request,
            other => {
                let exception = ProtocolException::new(
                    ErrorCode::InvalidState,
                    "expected RequestSession",
                );
                let _ = SessionInner::send_exception(
                    &inner,
                    protocols::CORE,
                    request_header.message_id,
                    exception,
                )
                .await;
                return Err(EtpError::Protocol(format!(
                    "expected RequestSession, peer sent {}",
                    other.name()
                )));
            }
        };
        *inner.requested.write().expect("requested poisoned") =
            request.requested_protocols.clone();

        // Intersect the peer's requested (protocol, role, version) tuples
        // with the local registry. The peer advertises the roles *it*
        // plays, so a local handler matches on the counterpart role.
        let supported: Vec<SupportedProtocol> = {
            let registry = inner.registry.read().expect("registry poisoned");
            let mut supported = Vec::new();
            for sp in &request.requested_protocols {
                let version_matches =
                    EtpVersion::from_version(&sp.protocol_version) == Some(inner.config.version);
                let local = registry.by_protocol(sp.protocol);
                if let Some(handler) = local {
                    if version_matches
                        && handler.role() == sp.role.counterpart()
                        && !supported
                            .iter()
                            .any(|s: &SupportedProtocol| s.key() == (sp.protocol, handler.role()))
                    {
                        supported.push(SupportedProtocol::new(
                            sp.protocol,
                            inner.config.version,
                            handler.role(),
                        ));
                    }
                }
            }
            supported
        };

        if supported.is_empty() {
            let exception = ProtocolException::new(
                ErrorCode::UnsupportedProtocol,
                "no requested protocol is supported",
            );
            let _ = SessionInner::send_exception(
                &inner,
                protocols::CORE,
                request_header.message_id,
                exception,
            )
            .await;
            return Err(EtpError::Protocol(
                "no requested protocol is supported".to_string(),
            ));
        }

        let session_id = Uuid::new_v4().to_string();
        *inner.session_id.write().expect("id poisoned") = Some(session_id.clone());

        let header = MessageHeader::response(
            protocols::CORE,
            message_types::core::OPEN_SESSION,
            request_header.message_id,
        )
        .with_flags(flags::FINAL_PART);
        let body = Body::OpenSession(OpenSession {
            session_id: session_id.clone(),
            application_name: inner.config.application_name.clone(),
            application_version: inner.config.application_version.clone(),
            supported_protocols: supported.clone(),
        });
        SessionInner::send_message(&inner, header, &body, None).await?;
        info!(session_id = %session_id, "session opened");

        finish_open(&inner, &request.requested_protocols, supported, false);
        Ok(Session::spawn_receive(inner, stream))
    }

    fn spawn_receive(inner: Arc<SessionInner>, stream: Box<dyn TransportStream>) -> Session {
        let closed_rx = inner.closed_tx.subscribe();
        let loop_inner = inner.clone();
        tokio::spawn(receive_loop(loop_inner, stream, closed_rx));
        Session { inner }
    }
}

/// Cheap cloneable handle used by handlers and background tasks. All
/// operations fail with `SessionClosed` once the session is gone.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Weak<SessionInner>,
}

impl SessionHandle {
    fn upgrade(&self) -> Result<Arc<SessionInner>> {
        self.inner.upgrade().ok_or(EtpError::SessionClosed)
    }

    /// Send one message without correlation bookkeeping.
    pub async fn send(&self, header: MessageHeader, body: Body) -> Result<i64> {
        let inner = self.upgrade()?;
        SessionInner::send_message(&inner, header, &body, None).await
    }

    /// Send a request and register it with the correlation tracker.
    pub async fn send_request(&self, header: MessageHeader, body: Body) -> Result<i64> {
        let inner = self.upgrade()?;
        SessionInner::send_request(&inner, header, body).await
    }

    /// Send a `ProtocolException` reply on `protocol`.
    pub async fn send_exception(
        &self,
        protocol: u16,
        correlation_id: i64,
        exception: ProtocolException,
    ) -> Result<i64> {
        let inner = self.upgrade()?;
        SessionInner::send_exception(&inner, protocol, correlation_id, exception).await
    }

    /// Wire version of the owning session.
    pub fn version(&self) -> Result<EtpVersion> {
        Ok(self.upgrade()?.config.version)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> Result<SessionState> {
        Ok(*self.upgrade()?.state.read().expect("state poisoned"))
    }

    /// Begin closing the session. `send_close` controls whether a Core
    /// `CloseSession` notification is emitted first.
    pub async fn shutdown(&self, reason: &str, send_close: bool) {
        if let Ok(inner) = self.upgrade() {
            SessionInner::shutdown(&inner, reason, send_close).await;
        }
    }
}

impl SessionInner {
    /// The send critical section: stamp, notify, encode, write.
    async fn send_message(
        inner: &Arc<SessionInner>,
        mut header: MessageHeader,
        body: &Body,
        mut on_before_send: Option<&mut (dyn FnMut(&MessageHeader) + Send)>,
    ) -> Result<i64> {
        {
            let state = *inner.state.read().expect("state poisoned");
            if matches!(state, SessionState::Closing | SessionState::Closed) {
                return Err(EtpError::SessionClosed);
            }
        }

        let mut sink = inner.sink.lock().await;

        let message_id = inner.next_message_id.fetch_add(1, Ordering::SeqCst) + 1;
        header.message_id = message_id;
        if let Some(callback) = on_before_send.take() {
            callback(&header);
        }

        let frame = match codec::encode(inner.encoding, &header, body) {
            Ok(frame) if frame.len() <= inner.config.max_frame_size => frame,
            Ok(frame) => {
                let err = EtpError::Codec(format!(
                    "encoded frame of {} bytes exceeds the {} byte limit",
                    frame.len(),
                    inner.config.max_frame_size
                ));
                Self::report_encode_failure(inner, &mut **sink, &header, &err).await;
                inner.tracker.fail(message_id, err);
                return Ok(message_id);
            }
            Err(err) => {
                Self::report_encode_failure(inner, &mut **sink, &header, &err).await;
                inner.tracker.fail(message_id, err);
                return Ok(message_id);
            }
        };

        match sink.send(frame).await {
            Ok(()) => {
                debug!(
                    protocol = header.protocol,
                    message_type = header.message_type,
                    message_id,
                    correlation_id = header.correlation_id,
                    body = body.name(),
                    "sent message"
                );
                Ok(message_id)
            }
            Err(err) => {
                // Transport failures are fatal for the session.
                drop(sink);
                error!(message_id, error = %err, "transport write failed");
                if !inner.close_started.swap(true, Ordering::SeqCst) {
                    info!("closing session: transport write failed");
                    Self::teardown(inner).await;
                }
                Err(err)
            }
        }
    }

    /// Emit the local-failure `ProtocolException` while the send lock is
    /// still held, so its message id stays contiguous with the failing
    /// send and cannot interleave with another caller.
    async fn report_encode_failure(
        inner: &Arc<SessionInner>,
        sink: &mut dyn TransportSink,
        failed: &MessageHeader,
        err: &EtpError,
    ) {
        warn!(
            protocol = failed.protocol,
            message_id = failed.message_id,
            error = %err,
            "message encoding failed"
        );
        let exception =
            ProtocolException::new(ErrorCode::InvalidState, format!("send failed: {}", err));
        let header = MessageHeader::response(
            failed.protocol,
            message_types::PROTOCOL_EXCEPTION,
            failed.message_id,
        )
        .with_flags(flags::FINAL_PART);
        let mut exception_header = header;
        exception_header.message_id = inner.next_message_id.fetch_add(1, Ordering::SeqCst) + 1;
        match codec::encode(
            inner.encoding,
            &exception_header,
            &Body::ProtocolException(exception),
        ) {
            Ok(frame) => {
                if let Err(e) = sink.send(frame).await {
                    warn!(error = %e, "failed to report encode failure to peer");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode ProtocolException"),
        }
    }

    async fn send_request(
        inner: &Arc<SessionInner>,
        header: MessageHeader,
        body: Body,
    ) -> Result<i64> {
        let protocol = header.protocol;
        let tracker = &inner.tracker;
        let message_id = Self::send_message(
            inner,
            header,
            &body,
            Some(&mut |stamped: &MessageHeader| {
                tracker.register(stamped.message_id, protocol);
            }),
        )
        .await?;

        if let Some(timeout) = inner.config.request_timeout {
            let weak = Arc::downgrade(inner);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(inner) = weak.upgrade() {
                    inner.tracker.expire(message_id);
                }
            });
        }
        Ok(message_id)
    }

    async fn send_exception(
        inner: &Arc<SessionInner>,
        protocol: u16,
        correlation_id: i64,
        exception: ProtocolException,
    ) -> Result<i64> {
        let header = MessageHeader::response(
            protocol,
            message_types::PROTOCOL_EXCEPTION,
            correlation_id,
        )
        .with_flags(flags::FINAL_PART);
        Self::send_message(inner, header, &Body::ProtocolException(exception), None).await
    }

    async fn shutdown(inner: &Arc<SessionInner>, reason: &str, send_close: bool) {
        if inner.close_started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(reason, "closing session");

        if send_close {
            let header =
                MessageHeader::request(protocols::CORE, message_types::core::CLOSE_SESSION);
            let body = Body::CloseSession(CloseSession {
                reason: reason.to_string(),
            });
            let send = Self::send_message(inner, header, &body, None);
            match tokio::time::timeout(inner.config.close_timeout, send).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!(error = %e, "CloseSession not delivered"),
                Err(_) => warn!("timed out sending CloseSession"),
            }
        }

        Self::teardown(inner).await;
    }

    /// The non-sending half of close: drain, release the transport, and
    /// complete everything. Runs exactly once per session.
    async fn teardown(inner: &Arc<SessionInner>) {
        *inner.state.write().expect("state poisoned") = SessionState::Closing;
        let _ = inner.closed_tx.send(true);

        // Bounded wait for in-flight sends, then release the transport.
        let close = async {
            let mut sink = inner.sink.lock().await;
            let _ = sink.close().await;
        };
        if tokio::time::timeout(inner.config.close_timeout, close)
            .await
            .is_err()
        {
            warn!("timed out waiting for in-flight sends");
        }

        inner.tracker.complete_all_closed();
        *inner.state.write().expect("state poisoned") = SessionState::Closed;

        let handlers = inner.registry.read().expect("registry poisoned").in_order();
        for handler in handlers {
            handler.on_session_closed();
        }
    }
}

/// Build the requested-protocols list from the registered handlers, Core
/// excluded, deduplicated on `(protocol, role)`.
fn requested_protocols(inner: &Arc<SessionInner>) -> Vec<SupportedProtocol> {
    let registry = inner.registry.read().expect("registry poisoned");
    let mut requested: Vec<SupportedProtocol> = Vec::new();
    for handler in registry.in_order() {
        if handler.protocol() == protocols::CORE {
            continue;
        }
        let candidate =
            SupportedProtocol::new(handler.protocol(), inner.config.version, handler.role());
        if !requested.iter().any(|sp| sp.key() == candidate.key()) {
            requested.push(candidate);
        }
    }
    requested
}

/// Apply the negotiation outcome: prune handlers outside the negotiated
/// set, record both lists, transition to `Open`, and fire
/// `on_session_opened` in registration order.
fn finish_open(
    inner: &Arc<SessionInner>,
    requested: &[SupportedProtocol],
    negotiated: Vec<SupportedProtocol>,
    peer_roles: bool,
) {
    // The negotiated list carries the advertising side's roles; convert to
    // the local-role view before pruning.
    let local_view: Vec<(u16, Role)> = negotiated
        .iter()
        .map(|sp| {
            let role = if peer_roles {
                sp.role.counterpart()
            } else {
                sp.role
            };
            (sp.protocol, role)
        })
        .collect();

    let removed = inner
        .registry
        .write()
        .expect("registry poisoned")
        .unregister_unsupported(&local_view);
    if !removed.is_empty() {
        debug!(count = removed.len(), "pruned handlers after negotiation");
    }

    *inner.negotiated.write().expect("negotiated poisoned") = negotiated;
    *inner.state.write().expect("state poisoned") = SessionState::Open;

    let requested = requested.to_vec();
    let negotiated = inner.negotiated.read().expect("negotiated poisoned").clone();
    let handlers = inner.registry.read().expect("registry poisoned").in_order();
    for handler in handlers {
        handler.on_session_opened(&requested, &negotiated);
    }
}

/// Read one decoded message during negotiation, before the receive loop
/// starts.
async fn recv_one(
    inner: &Arc<SessionInner>,
    stream: &mut Box<dyn TransportStream>,
) -> Result<(MessageHeader, Body)> {
    let deadline = inner.config.negotiation_timeout;
    let frame = tokio::time::timeout(deadline, stream.recv())
        .await
        .map_err(|_| EtpError::Timeout)??
        .ok_or(EtpError::ConnectionClosed)?;
    let decoded = codec::decode(&frame, &inner.catalog)?;
    let body = decoded.body?;
    Ok((decoded.header, body))
}

/// The receive task: read frames, decode, route, reply to failures.
async fn receive_loop(
    inner: Arc<SessionInner>,
    mut stream: Box<dyn TransportStream>,
    mut closed_rx: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            _ = closed_rx.changed() => break,
            frame = stream.recv() => frame,
        };
        match frame {
            Ok(Some(frame)) => dispatch_frame(&inner, frame).await,
            Ok(None) => {
                debug!("transport closed by peer");
                SessionInner::shutdown(&inner, "transport closed by peer", false).await;
                break;
            }
            Err(e) => {
                error!(error = %e, "transport read failed");
                SessionInner::shutdown(&inner, "transport read failed", false).await;
                break;
            }
        }
    }
    debug!("receive loop stopped");
}

/// Route one inbound frame. Messages are dispatched in arrival order; this
/// function never reorders multipart fragments.
async fn dispatch_frame(inner: &Arc<SessionInner>, frame: WireFrame) {
    if frame.len() > inner.config.max_frame_size {
        warn!(len = frame.len(), "dropping oversized frame");
        return;
    }

    let decoded = match codec::decode(&frame, &inner.catalog) {
        Ok(decoded) => decoded,
        Err(e) => {
            // Without a header there is nothing to correlate an error to.
            warn!(error = %e, "dropping undecodable frame");
            return;
        }
    };
    let header = decoded.header;

    // Unknown protocol: drop the message, answer on Core echoing the
    // offending message id.
    let handler = inner
        .registry
        .read()
        .expect("registry poisoned")
        .by_protocol(header.protocol);
    let Some(handler) = handler else {
        debug!(protocol = header.protocol, "message for unsupported protocol");
        let exception = ProtocolException::new(
            ErrorCode::UnsupportedProtocol,
            format!("protocol {} is not supported", header.protocol),
        );
        if let Err(e) =
            SessionInner::send_exception(inner, protocols::CORE, header.message_id, exception)
                .await
        {
            debug!(error = %e, "could not report unsupported protocol");
        }
        return;
    };

    let body = match decoded.body {
        Ok(body) => body,
        Err(EtpError::UnknownMessage {
            protocol,
            message_type,
        }) => {
            let exception = ProtocolException::new(
                ErrorCode::InvalidMessageType,
                format!("message type {} is not valid for protocol {}", message_type, protocol),
            );
            if let Err(e) =
                SessionInner::send_exception(inner, header.protocol, header.message_id, exception)
                    .await
            {
                debug!(error = %e, "could not report invalid message type");
            }
            return;
        }
        Err(e) => {
            let exception =
                ProtocolException::new(ErrorCode::InvalidArgument, format!("malformed body: {}", e));
            if let Err(e) =
                SessionInner::send_exception(inner, header.protocol, header.message_id, exception)
                    .await
            {
                debug!(error = %e, "could not report malformed body");
            }
            return;
        }
    };

    // Correlated messages feed the tracker; an unmatched reply is an
    // orphan (e.g. it arrived after its deadline) and is dropped.
    if header.correlation_id != 0 {
        let tracked = inner.tracker.accept(&header, &body);
        if !tracked {
            debug!(
                correlation_id = header.correlation_id,
                body = body.name(),
                "orphan reply dropped"
            );
            return;
        }
    }

    debug!(
        protocol = header.protocol,
        message_id = header.message_id,
        correlation_id = header.correlation_id,
        body = body.name(),
        "dispatching message"
    );
    if let Err(e) = handler.handle_message(&header, body).await {
        warn!(
            protocol = header.protocol,
            message_id = header.message_id,
            error = %e,
            "handler failed"
        );
        let exception =
            ProtocolException::new(ErrorCode::InvalidState, format!("handler failed: {}", e));
        if let Err(e) =
            SessionInner::send_exception(inner, header.protocol, header.message_id, exception).await
        {
            debug!(error = %e, "could not report handler failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.version, EtpVersion::V11);
        assert_eq!(config.default_encoding, MessageEncoding::Binary);
        assert_eq!(config.encoding_header, ENCODING_HEADER);
        assert!(config.request_timeout.is_none());
    }

    #[test]
    fn test_dead_handle_operations_fail() {
        let handle = SessionHandle { inner: Weak::new() };
        assert!(handle.version().is_err());
        assert!(handle.state().is_err());
    }

    #[tokio::test]
    async fn test_dead_handle_send_fails() {
        let handle = SessionHandle { inner: Weak::new() };
        let header = MessageHeader::request(protocols::STORE, 1);
        let body = Body::GetObject(crate::messages::GetObject {
            uri: "eml://well/1".to_string(),
        });
        assert!(matches!(
            handle.send(header, body).await,
            Err(EtpError::SessionClosed)
        ));
    }
}

//! Handler module - per-protocol state and dispatch.
//!
//! A [`ProtocolHandler`] owns everything protocol-scoped: its numeric id,
//! the local role, inbound dispatch, and typed send helpers. The session
//! routes each inbound message to the handler registered under the
//! header's protocol id; the handler matches exhaustively over [`Body`].
//!
//! Handler events are multicast subscriber lists ([`EventHub`]): subscribing
//! returns a token for unsubscription and delivery is synchronous on the
//! dispatch task. Sending on the same protocol from inside a subscriber is
//! not supported.

mod core;
mod growing_object;
mod registry;
mod store;

pub use self::core::CoreHandler;
pub use self::growing_object::{
    GrowingObjectCustomer, GrowingObjectStore, GrowingStoreProvider, PartEvent,
};
pub use self::registry::HandlerRegistry;
pub use self::store::{ObjectEvent, StoreCustomer, StoreProvider, StoreStore};

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use crate::error::{EtpError, Result};
use crate::messages::{Body, Role, SupportedProtocol};
use crate::protocol::MessageHeader;
use crate::session::SessionHandle;

/// Stable identity of a handler's abstract interface.
///
/// Application code fetches handlers by contract; the receive path indexes
/// by protocol id. One handler appears under both keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Contract {
    /// Core session protocol (negotiation, errors, close). Never removed.
    Core,
    /// Store protocol, customer side.
    StoreCustomer,
    /// Store protocol, store side.
    StoreStore,
    /// GrowingObject protocol, customer side.
    GrowingObjectCustomer,
    /// GrowingObject protocol, store side.
    GrowingObjectStore,
}

/// Per-protocol state dispatched by the session.
#[async_trait]
pub trait ProtocolHandler: Send + Sync + 'static {
    /// Shared identity and session binding.
    fn handler_core(&self) -> &HandlerCore;

    /// Dispatch one inbound message. Uncaught failures are converted by the
    /// session into a `ProtocolException(InvalidState)` reply.
    async fn handle_message(&self, header: &MessageHeader, body: Body) -> Result<()>;

    /// Called when the handler is installed into a session.
    fn on_registered(&self) {}

    /// Called after negotiation, in registration order, with both the
    /// requested and the negotiated protocol lists.
    fn on_session_opened(&self, requested: &[SupportedProtocol], negotiated: &[SupportedProtocol]) {
        let _ = (requested, negotiated);
    }

    /// Called when the session closes, in registration order.
    fn on_session_closed(&self) {}

    /// Upcast for contract-typed access through the session.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Numeric protocol id this handler serves.
    fn protocol(&self) -> u16 {
        self.handler_core().protocol
    }

    /// Role this endpoint plays for the protocol.
    fn role(&self) -> Role {
        self.handler_core().role
    }

    /// Contract identity.
    fn contract(&self) -> Contract {
        self.handler_core().contract
    }
}

/// Identity and session binding shared by every handler implementation.
pub struct HandlerCore {
    protocol: u16,
    role: Role,
    contract: Contract,
    session: RwLock<Option<SessionHandle>>,
}

impl HandlerCore {
    /// Create an unbound handler core.
    pub fn new(protocol: u16, role: Role, contract: Contract) -> Self {
        Self {
            protocol,
            role,
            contract,
            session: RwLock::new(None),
        }
    }

    /// Bind the owning session. Called by the session at registration;
    /// re-registration rebinds.
    pub(crate) fn bind(&self, handle: SessionHandle) {
        *self.session.write().expect("session slot poisoned") = Some(handle);
    }

    /// The owning session, or an error before registration / after the
    /// session is gone.
    pub fn session(&self) -> Result<SessionHandle> {
        self.session
            .read()
            .expect("session slot poisoned")
            .clone()
            .ok_or(EtpError::SessionClosed)
    }
}

/// Token returned by [`EventHub::subscribe`]; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionToken(u64);

type Subscriber<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Multicast event list with token-based unsubscription.
///
/// Delivery is synchronous on the emitting task, in subscription order.
pub struct EventHub<T> {
    subscribers: Mutex<Vec<(u64, Subscriber<T>)>>,
    next_token: AtomicU64,
}

impl<T> EventHub<T> {
    /// Empty hub.
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Add a subscriber; returns its unsubscription token.
    pub fn subscribe(&self, subscriber: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionToken {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("subscriber list poisoned")
            .push((token, Arc::new(subscriber)));
        SubscriptionToken(token)
    }

    /// Remove a subscriber. Returns false if the token was already gone.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut subscribers = self.subscribers.lock().expect("subscriber list poisoned");
        let before = subscribers.len();
        subscribers.retain(|(id, _)| *id != token.0);
        subscribers.len() != before
    }

    /// Deliver one event to every subscriber.
    ///
    /// The list is snapshotted first, so a subscriber may subscribe or
    /// unsubscribe from inside its callback.
    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Subscriber<T>> = self
            .subscribers
            .lock()
            .expect("subscriber list poisoned")
            .iter()
            .map(|(_, subscriber)| subscriber.clone())
            .collect();
        for subscriber in snapshot {
            subscriber(event);
        }
    }
}

impl<T> Default for EventHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

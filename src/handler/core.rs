//! Core protocol handler (id 0): negotiation, acknowledge, close, errors.
//!
//! Negotiation itself is driven by the session while it opens; once the
//! session is up this handler owns the steady-state Core traffic. It is
//! exempt from `unregister_unsupported` and always present.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{ErrorCode, Result};
use crate::messages::{
    Acknowledge, Body, CloseSession, EtpVersion, ProtocolException, Role,
};
use crate::protocol::{flags, message_types, protocols, MessageHeader};

use super::{Contract, EventHub, HandlerCore, ProtocolHandler};

/// Handler for the Core protocol.
pub struct CoreHandler {
    core: HandlerCore,
    version: EtpVersion,
    /// Fired when the peer announces it is closing the session.
    pub on_close_session: EventHub<CloseSession>,
}

impl CoreHandler {
    /// Create a Core handler for one wire version.
    pub fn new(version: EtpVersion) -> Self {
        Self {
            core: HandlerCore::new(protocols::CORE, Role::Customer, Contract::Core),
            version,
            on_close_session: EventHub::new(),
        }
    }

    /// Wire version this handler negotiates.
    pub fn version(&self) -> EtpVersion {
        self.version
    }

    /// Send a `CloseSession` notification.
    pub async fn close_session(&self, reason: &str) -> Result<i64> {
        let header = MessageHeader::request(protocols::CORE, message_types::core::CLOSE_SESSION);
        let body = Body::CloseSession(CloseSession {
            reason: reason.to_string(),
        });
        self.core.session()?.send(header, body).await
    }

    /// Send an `Acknowledge` receipt for `correlation_id`.
    pub async fn acknowledge(&self, correlation_id: i64) -> Result<i64> {
        let header =
            MessageHeader::response(protocols::CORE, message_types::ACKNOWLEDGE, correlation_id)
                .with_flags(flags::FINAL_PART | flags::NO_DATA);
        self.core
            .session()?
            .send(header, Body::Acknowledge(Acknowledge {}))
            .await
    }

    /// Send a `ProtocolException` on the Core protocol.
    pub async fn protocol_exception(
        &self,
        correlation_id: i64,
        exception: ProtocolException,
    ) -> Result<i64> {
        self.core
            .session()?
            .send_exception(protocols::CORE, correlation_id, exception)
            .await
    }
}

#[async_trait]
impl ProtocolHandler for CoreHandler {
    fn handler_core(&self) -> &HandlerCore {
        &self.core
    }

    async fn handle_message(&self, header: &MessageHeader, body: Body) -> Result<()> {
        match body {
            Body::CloseSession(close) => {
                info!(reason = %close.reason, "peer closed the session");
                self.on_close_session.emit(&close);
                // Peer is gone; no CloseSession echo.
                if let Ok(session) = self.core.session() {
                    session.shutdown(&close.reason, false).await;
                }
                Ok(())
            }
            Body::ProtocolException(exception) => {
                // Correlated exceptions are completed by the tracker before
                // dispatch reaches this point; anything left is unsolicited.
                debug!(
                    code = exception.error_code,
                    message = %exception.error_message,
                    correlation_id = header.correlation_id,
                    "protocol exception"
                );
                Ok(())
            }
            Body::Acknowledge(_) => Ok(()),
            Body::RequestSession(_) | Body::OpenSession(_) => {
                // Negotiation is over once the session is open.
                warn!(
                    message_id = header.message_id,
                    "negotiation message after session open"
                );
                if let Ok(session) = self.core.session() {
                    session
                        .send_exception(
                            protocols::CORE,
                            header.message_id,
                            ProtocolException::new(
                                ErrorCode::InvalidState,
                                "session is already open",
                            ),
                        )
                        .await?;
                }
                Ok(())
            }
            other => {
                debug!(body = other.name(), "unexpected body on Core protocol");
                Ok(())
            }
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

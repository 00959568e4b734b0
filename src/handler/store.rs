//! Store protocol handlers (id 4): whole-object get/put/delete.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::messages::{
    Acknowledge, Body, DataObject, DeleteObject, GetObject, Object, ProtocolException, PutObject,
    Role,
};
use crate::protocol::{flags, message_types, protocols, MessageHeader};

use super::{Contract, EventHub, HandlerCore, ProtocolHandler};

/// Event emitted by [`StoreCustomer`] for each inbound `Object` reply. A
/// request answered by a multipart set emits one event per part.
#[derive(Debug, Clone)]
pub struct ObjectEvent {
    /// Message id of the request this object answers.
    pub correlation_id: i64,
    /// The returned object (or one slice of it).
    pub data_object: DataObject,
    /// True on the last part of the response set.
    pub final_part: bool,
}

/// Customer side of the Store protocol.
pub struct StoreCustomer {
    core: HandlerCore,
    /// Fired once per inbound `Object` reply.
    pub on_object: EventHub<ObjectEvent>,
}

impl StoreCustomer {
    /// Create an unbound Store customer.
    pub fn new() -> Self {
        Self {
            core: HandlerCore::new(protocols::STORE, Role::Customer, Contract::StoreCustomer),
            on_object: EventHub::new(),
        }
    }

    /// Request one object. Returns the allocated message id; the reply set
    /// arrives as [`ObjectEvent`]s and through the session's correlation
    /// tracker.
    pub async fn get_object(&self, uri: &str) -> Result<i64> {
        let header = MessageHeader::request(protocols::STORE, message_types::store::GET_OBJECT);
        let body = Body::GetObject(GetObject {
            uri: uri.to_string(),
        });
        self.core.session()?.send_request(header, body).await
    }

    /// Upsert one object. Returns the allocated message id.
    pub async fn put_object(&self, data_object: DataObject) -> Result<i64> {
        let header = MessageHeader::request(protocols::STORE, message_types::store::PUT_OBJECT);
        let body = Body::PutObject(PutObject { data_object });
        self.core.session()?.send_request(header, body).await
    }

    /// Delete one object. Returns the allocated message id.
    pub async fn delete_object(&self, uri: &str) -> Result<i64> {
        let header = MessageHeader::request(protocols::STORE, message_types::store::DELETE_OBJECT);
        let body = Body::DeleteObject(DeleteObject {
            uri: uri.to_string(),
        });
        self.core.session()?.send_request(header, body).await
    }
}

impl Default for StoreCustomer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolHandler for StoreCustomer {
    fn handler_core(&self) -> &HandlerCore {
        &self.core
    }

    async fn handle_message(&self, header: &MessageHeader, body: Body) -> Result<()> {
        match body {
            Body::Object(object) => {
                self.on_object.emit(&ObjectEvent {
                    correlation_id: header.correlation_id,
                    data_object: object.data_object,
                    final_part: header.is_final_part() || !header.is_multi_part(),
                });
                Ok(())
            }
            Body::Acknowledge(_) => Ok(()),
            Body::ProtocolException(exception) => {
                debug!(
                    code = exception.error_code,
                    correlation_id = header.correlation_id,
                    "store request failed"
                );
                Ok(())
            }
            other => Err(crate::error::EtpError::Protocol(format!(
                "store customer cannot handle {}",
                other.name()
            ))),
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Application seam for the store side: the session core routes Store
/// requests here and turns the outcome into wire replies.
///
/// Returning `Err(ProtocolException)` picks the wire error directly.
#[async_trait]
pub trait StoreProvider: Send + Sync + 'static {
    /// Resolve one object by uri.
    async fn get(&self, uri: &str) -> std::result::Result<DataObject, ProtocolException>;

    /// Upsert one object.
    async fn put(&self, data_object: DataObject) -> std::result::Result<(), ProtocolException>;

    /// Delete one object by uri.
    async fn delete(&self, uri: &str) -> std::result::Result<(), ProtocolException>;
}

/// Store side of the Store protocol: serves `GetObject`, `PutObject`,
/// `DeleteObject`; replies with `Object`, `Acknowledge`, or
/// `ProtocolException`.
pub struct StoreStore {
    core: HandlerCore,
    provider: Arc<dyn StoreProvider>,
}

impl StoreStore {
    /// Create a store-side handler over an application provider.
    pub fn new(provider: Arc<dyn StoreProvider>) -> Self {
        Self {
            core: HandlerCore::new(protocols::STORE, Role::Store, Contract::StoreStore),
            provider,
        }
    }

    async fn reply_object(&self, correlation_id: i64, data_object: DataObject) -> Result<i64> {
        let header =
            MessageHeader::response(protocols::STORE, message_types::store::OBJECT, correlation_id)
                .with_flags(flags::FINAL_PART);
        self.core
            .session()?
            .send(header, Body::Object(Object { data_object }))
            .await
    }

    async fn reply_acknowledge(&self, correlation_id: i64) -> Result<i64> {
        let header = MessageHeader::response(
            protocols::STORE,
            message_types::ACKNOWLEDGE,
            correlation_id,
        )
        .with_flags(flags::FINAL_PART | flags::NO_DATA);
        self.core
            .session()?
            .send(header, Body::Acknowledge(Acknowledge {}))
            .await
    }

    async fn reply_exception(
        &self,
        correlation_id: i64,
        exception: ProtocolException,
    ) -> Result<i64> {
        self.core
            .session()?
            .send_exception(protocols::STORE, correlation_id, exception)
            .await
    }
}

#[async_trait]
impl ProtocolHandler for StoreStore {
    fn handler_core(&self) -> &HandlerCore {
        &self.core
    }

    async fn handle_message(&self, header: &MessageHeader, body: Body) -> Result<()> {
        match body {
            Body::GetObject(get) => match self.provider.get(&get.uri).await {
                Ok(data_object) => {
                    self.reply_object(header.message_id, data_object).await?;
                    Ok(())
                }
                Err(exception) => {
                    self.reply_exception(header.message_id, exception).await?;
                    Ok(())
                }
            },
            Body::PutObject(put) => match self.provider.put(put.data_object).await {
                Ok(()) => {
                    self.reply_acknowledge(header.message_id).await?;
                    Ok(())
                }
                Err(exception) => {
                    self.reply_exception(header.message_id, exception).await?;
                    Ok(())
                }
            },
            Body::DeleteObject(delete) => match self.provider.delete(&delete.uri).await {
                Ok(()) => {
                    self.reply_acknowledge(header.message_id).await?;
                    Ok(())
                }
                Err(exception) => {
                    self.reply_exception(header.message_id, exception).await?;
                    Ok(())
                }
            },
            other => Err(crate::error::EtpError::Protocol(format!(
                "store cannot handle {}",
                other.name()
            ))),
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_customer_identity() {
        let customer = StoreCustomer::new();
        assert_eq!(customer.protocol(), protocols::STORE);
        assert_eq!(customer.role(), Role::Customer);
        assert_eq!(customer.contract(), Contract::StoreCustomer);
    }

    #[tokio::test]
    async fn test_unbound_customer_send_fails() {
        let customer = StoreCustomer::new();
        assert!(customer.get_object("eml://well/1").await.is_err());
    }
}

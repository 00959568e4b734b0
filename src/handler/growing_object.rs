//! GrowingObject protocol handlers (id 6): part and range operations.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{EtpError, Result};
use crate::messages::{
    Acknowledge, Body, DeletePart, DeleteRange, EtpVersion, GetPart, GetRange, ObjectFragment,
    ObjectPart, ProtocolException, PutPart, RangeEndpoint, ReplacePartsByRange, Role,
};
use crate::protocol::{flags, message_types, protocols, MessageHeader};

use super::{Contract, EventHub, HandlerCore, ProtocolHandler};

/// Event emitted by [`GrowingObjectCustomer`] for each inbound
/// `ObjectFragment`. A range reply emits one event per part.
#[derive(Debug, Clone)]
pub struct PartEvent {
    /// Message id of the request this fragment answers.
    pub correlation_id: i64,
    /// Parent object uri.
    pub uri: String,
    /// The returned part.
    pub part: ObjectPart,
    /// True on the last fragment of the response set.
    pub final_part: bool,
}

/// Customer side of the GrowingObject protocol.
pub struct GrowingObjectCustomer {
    core: HandlerCore,
    /// Fired once per inbound `ObjectFragment`.
    pub on_fragment: EventHub<PartEvent>,
}

impl GrowingObjectCustomer {
    /// Create an unbound GrowingObject customer.
    pub fn new() -> Self {
        Self {
            core: HandlerCore::new(
                protocols::GROWING_OBJECT,
                Role::Customer,
                Contract::GrowingObjectCustomer,
            ),
            on_fragment: EventHub::new(),
        }
    }

    /// Request a single part by uid. Returns the allocated message id.
    pub async fn get(&self, uri: &str, uid: &str) -> Result<i64> {
        let header = MessageHeader::request(
            protocols::GROWING_OBJECT,
            message_types::growing_object::GET_PART,
        );
        let body = Body::GetPart(GetPart {
            uri: uri.to_string(),
            uid: uid.to_string(),
        });
        self.core.session()?.send_request(header, body).await
    }

    /// Request every part inside a range. The reply is a multipart
    /// fragment set; returns the allocated message id.
    pub async fn get_range(
        &self,
        uri: &str,
        from: RangeEndpoint,
        to: RangeEndpoint,
    ) -> Result<i64> {
        let header = MessageHeader::request(
            protocols::GROWING_OBJECT,
            message_types::growing_object::GET_RANGE,
        );
        let body = Body::GetRange(GetRange {
            uri: uri.to_string(),
            from,
            to,
        });
        self.core.session()?.send_request(header, body).await
    }

    /// Append or replace one part. Returns the allocated message id.
    pub async fn put_part(&self, uri: &str, part: ObjectPart) -> Result<i64> {
        let header = MessageHeader::request(
            protocols::GROWING_OBJECT,
            message_types::growing_object::PUT_PART,
        );
        let body = Body::PutPart(PutPart {
            uri: uri.to_string(),
            part,
        });
        self.core.session()?.send_request(header, body).await
    }

    /// Delete one part by uid. Returns the allocated message id.
    pub async fn delete_part(&self, uri: &str, uid: &str) -> Result<i64> {
        let header = MessageHeader::request(
            protocols::GROWING_OBJECT,
            message_types::growing_object::DELETE_PART,
        );
        let body = Body::DeletePart(DeletePart {
            uri: uri.to_string(),
            uid: uid.to_string(),
        });
        self.core.session()?.send_request(header, body).await
    }

    /// Delete every part inside a range. Returns the allocated message id.
    pub async fn delete_range(
        &self,
        uri: &str,
        from: RangeEndpoint,
        to: RangeEndpoint,
    ) -> Result<i64> {
        let header = MessageHeader::request(
            protocols::GROWING_OBJECT,
            message_types::growing_object::DELETE_RANGE,
        );
        let body = Body::DeleteRange(DeleteRange {
            uri: uri.to_string(),
            from,
            to,
        });
        self.core.session()?.send_request(header, body).await
    }

    /// Atomically delete a range and insert replacement parts. Requires an
    /// ETP 1.2 session.
    pub async fn replace_parts_by_range(
        &self,
        uri: &str,
        from: RangeEndpoint,
        to: RangeEndpoint,
        parts: Vec<ObjectPart>,
    ) -> Result<i64> {
        let session = self.core.session()?;
        if session.version()? != EtpVersion::V12 {
            return Err(EtpError::Protocol(
                "ReplacePartsByRange requires an ETP 1.2 session".to_string(),
            ));
        }
        let header = MessageHeader::request(
            protocols::GROWING_OBJECT,
            message_types::growing_object::REPLACE_PARTS_BY_RANGE,
        );
        let body = Body::ReplacePartsByRange(ReplacePartsByRange {
            uri: uri.to_string(),
            from,
            to,
            parts,
        });
        session.send_request(header, body).await
    }
}

impl Default for GrowingObjectCustomer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolHandler for GrowingObjectCustomer {
    fn handler_core(&self) -> &HandlerCore {
        &self.core
    }

    async fn handle_message(&self, header: &MessageHeader, body: Body) -> Result<()> {
        match body {
            Body::ObjectFragment(fragment) => {
                // An empty final frame only closes the set.
                if !header.is_no_data() {
                    self.on_fragment.emit(&PartEvent {
                        correlation_id: header.correlation_id,
                        uri: fragment.uri,
                        part: fragment.part,
                        final_part: header.is_final_part() || !header.is_multi_part(),
                    });
                }
                Ok(())
            }
            Body::Acknowledge(_) => Ok(()),
            Body::ProtocolException(exception) => {
                debug!(
                    code = exception.error_code,
                    correlation_id = header.correlation_id,
                    "growing object request failed"
                );
                Ok(())
            }
            other => Err(EtpError::Protocol(format!(
                "growing object customer cannot handle {}",
                other.name()
            ))),
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Application seam for the store side of the GrowingObject protocol.
#[async_trait]
pub trait GrowingStoreProvider: Send + Sync + 'static {
    /// Resolve one part by uid.
    async fn get_part(
        &self,
        uri: &str,
        uid: &str,
    ) -> std::result::Result<ObjectPart, ProtocolException>;

    /// Resolve every part inside a range, in index order.
    async fn get_range(
        &self,
        uri: &str,
        from: &RangeEndpoint,
        to: &RangeEndpoint,
    ) -> std::result::Result<Vec<ObjectPart>, ProtocolException>;

    /// Append or replace one part.
    async fn put_part(
        &self,
        uri: &str,
        part: ObjectPart,
    ) -> std::result::Result<(), ProtocolException>;

    /// Delete one part by uid.
    async fn delete_part(&self, uri: &str, uid: &str)
        -> std::result::Result<(), ProtocolException>;

    /// Delete every part inside a range.
    async fn delete_range(
        &self,
        uri: &str,
        from: &RangeEndpoint,
        to: &RangeEndpoint,
    ) -> std::result::Result<(), ProtocolException>;

    /// Atomically delete a range and insert replacement parts (ETP 1.2).
    async fn replace_parts_by_range(
        &self,
        uri: &str,
        from: &RangeEndpoint,
        to: &RangeEndpoint,
        parts: Vec<ObjectPart>,
    ) -> std::result::Result<(), ProtocolException>;
}

/// Store side of the GrowingObject protocol.
pub struct GrowingObjectStore {
    core: HandlerCore,
    provider: Arc<dyn GrowingStoreProvider>,
}

impl GrowingObjectStore {
    /// Create a store-side handler over an application provider.
    pub fn new(provider: Arc<dyn GrowingStoreProvider>) -> Self {
        Self {
            core: HandlerCore::new(
                protocols::GROWING_OBJECT,
                Role::Store,
                Contract::GrowingObjectStore,
            ),
            provider,
        }
    }

    /// Send one reply fragment set for `correlation_id`.
    ///
    /// Every set closes with exactly one final part: `n-1` fragments flagged
    /// `MULTI_PART`, then the last flagged `MULTI_PART | FINAL_PART`. An
    /// empty set closes with a single empty `NO_DATA` final frame.
    async fn reply_fragments(
        &self,
        correlation_id: i64,
        uri: &str,
        parts: Vec<ObjectPart>,
    ) -> Result<()> {
        let session = self.core.session()?;
        if parts.is_empty() {
            let header = MessageHeader::response(
                protocols::GROWING_OBJECT,
                message_types::growing_object::OBJECT_FRAGMENT,
                correlation_id,
            )
            .with_flags(flags::FINAL_PART | flags::NO_DATA);
            let body = Body::ObjectFragment(ObjectFragment {
                uri: uri.to_string(),
                part: ObjectPart {
                    uid: String::new(),
                    content_type: String::new(),
                    data: bytes::Bytes::new(),
                },
            });
            session.send(header, body).await?;
            return Ok(());
        }

        let last = parts.len() - 1;
        for (index, part) in parts.into_iter().enumerate() {
            let part_flags = if index == last {
                flags::MULTI_PART_AND_FINAL_PART
            } else {
                flags::MULTI_PART
            };
            let header = MessageHeader::response(
                protocols::GROWING_OBJECT,
                message_types::growing_object::OBJECT_FRAGMENT,
                correlation_id,
            )
            .with_flags(part_flags);
            let body = Body::ObjectFragment(ObjectFragment {
                uri: uri.to_string(),
                part,
            });
            session.send(header, body).await?;
        }
        Ok(())
    }

    async fn reply_acknowledge(&self, correlation_id: i64) -> Result<()> {
        let header = MessageHeader::response(
            protocols::GROWING_OBJECT,
            message_types::ACKNOWLEDGE,
            correlation_id,
        )
        .with_flags(flags::FINAL_PART | flags::NO_DATA);
        self.core
            .session()?
            .send(header, Body::Acknowledge(Acknowledge {}))
            .await?;
        Ok(())
    }

    async fn reply_outcome(
        &self,
        correlation_id: i64,
        outcome: std::result::Result<(), ProtocolException>,
    ) -> Result<()> {
        match outcome {
            Ok(()) => self.reply_acknowledge(correlation_id).await,
            Err(exception) => {
                self.core
                    .session()?
                    .send_exception(protocols::GROWING_OBJECT, correlation_id, exception)
                    .await?;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ProtocolHandler for GrowingObjectStore {
    fn handler_core(&self) -> &HandlerCore {
        &self.core
    }

    async fn handle_message(&self, header: &MessageHeader, body: Body) -> Result<()> {
        match body {
            Body::GetPart(get) => match self.provider.get_part(&get.uri, &get.uid).await {
                Ok(part) => {
                    self.reply_fragments(header.message_id, &get.uri, vec![part])
                        .await
                }
                Err(exception) => self.reply_outcome(header.message_id, Err(exception)).await,
            },
            Body::GetRange(range) => {
                match self
                    .provider
                    .get_range(&range.uri, &range.from, &range.to)
                    .await
                {
                    Ok(parts) => self.reply_fragments(header.message_id, &range.uri, parts).await,
                    Err(exception) => self.reply_outcome(header.message_id, Err(exception)).await,
                }
            }
            Body::PutPart(put) => {
                let outcome = self.provider.put_part(&put.uri, put.part).await;
                self.reply_outcome(header.message_id, outcome).await
            }
            Body::DeletePart(delete) => {
                let outcome = self.provider.delete_part(&delete.uri, &delete.uid).await;
                self.reply_outcome(header.message_id, outcome).await
            }
            Body::DeleteRange(delete) => {
                let outcome = self
                    .provider
                    .delete_range(&delete.uri, &delete.from, &delete.to)
                    .await;
                self.reply_outcome(header.message_id, outcome).await
            }
            Body::ReplacePartsByRange(replace) => {
                let outcome = self
                    .provider
                    .replace_parts_by_range(&replace.uri, &replace.from, &replace.to, replace.parts)
                    .await;
                self.reply_outcome(header.message_id, outcome).await
            }
            other => Err(EtpError::Protocol(format!(
                "growing object store cannot handle {}",
                other.name()
            ))),
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

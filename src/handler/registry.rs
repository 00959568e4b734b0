//! Handler registry: dual-keyed container for per-protocol handlers.
//!
//! One canonical map from protocol id to handler plus a secondary map from
//! contract tag to protocol id. Registration order is recorded because
//! lifecycle callbacks fire in insertion order and that ordering is
//! observable.
//!
//! The registry is mutated only while a session opens (registration, then
//! `unregister_unsupported` after negotiation); steady-state lookup is
//! read-only.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{EtpError, Result};
use crate::messages::Role;
use crate::protocol::protocols;

use super::{Contract, ProtocolHandler};

/// Dual-keyed handler container.
#[derive(Default)]
pub struct HandlerRegistry {
    by_protocol: HashMap<u16, Arc<dyn ProtocolHandler>>,
    by_contract: HashMap<Contract, u16>,
    order: Vec<u16>,
}

impl HandlerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handler under both keys.
    ///
    /// A duplicate contract replaces the previous handler with a warning; a
    /// duplicate protocol id under a different contract is rejected.
    pub fn register(&mut self, handler: Arc<dyn ProtocolHandler>) -> Result<()> {
        let protocol = handler.protocol();
        let contract = handler.contract();

        if let Some(&existing_protocol) = self.by_contract.get(&contract) {
            warn!(
                ?contract,
                protocol = existing_protocol,
                "replacing handler registered under the same contract"
            );
            self.remove(existing_protocol);
        }
        if self.by_protocol.contains_key(&protocol) {
            return Err(EtpError::DuplicateProtocol(protocol));
        }

        self.by_contract.insert(contract, protocol);
        self.by_protocol.insert(protocol, handler);
        self.order.push(protocol);
        Ok(())
    }

    /// Lookup by protocol id (the receive path).
    pub fn by_protocol(&self, protocol: u16) -> Option<Arc<dyn ProtocolHandler>> {
        self.by_protocol.get(&protocol).cloned()
    }

    /// Lookup by contract identity (application code).
    pub fn by_contract(&self, contract: Contract) -> Option<Arc<dyn ProtocolHandler>> {
        self.by_contract
            .get(&contract)
            .and_then(|protocol| self.by_protocol.get(protocol))
            .cloned()
    }

    /// Check whether a contract is registered.
    pub fn contains(&self, contract: Contract) -> bool {
        self.by_contract.contains_key(&contract)
    }

    /// Handlers in registration order.
    pub fn in_order(&self) -> Vec<Arc<dyn ProtocolHandler>> {
        self.order
            .iter()
            .filter_map(|protocol| self.by_protocol.get(protocol).cloned())
            .collect()
    }

    /// `(protocol, role)` pairs of every registered handler.
    pub fn registered_pairs(&self) -> Vec<(u16, Role)> {
        self.in_order()
            .iter()
            .map(|handler| (handler.protocol(), handler.role()))
            .collect()
    }

    /// Remove every handler whose `(protocol, role)` is outside the
    /// negotiated set. Core (protocol 0) is never removed. Returns the
    /// removed handlers so the session can drop them after negotiation.
    pub fn unregister_unsupported(
        &mut self,
        supported: &[(u16, Role)],
    ) -> Vec<Arc<dyn ProtocolHandler>> {
        let doomed: Vec<u16> = self
            .in_order()
            .iter()
            .filter(|handler| {
                handler.protocol() != protocols::CORE
                    && !supported.contains(&(handler.protocol(), handler.role()))
            })
            .map(|handler| handler.protocol())
            .collect();

        let mut removed = Vec::with_capacity(doomed.len());
        for protocol in doomed {
            if let Some(handler) = self.remove(protocol) {
                debug!(
                    protocol,
                    contract = ?handler.contract(),
                    "unregistered handler outside negotiated set"
                );
                removed.push(handler);
            }
        }
        removed
    }

    fn remove(&mut self, protocol: u16) -> Option<Arc<dyn ProtocolHandler>> {
        let handler = self.by_protocol.remove(&protocol)?;
        self.by_contract.remove(&handler.contract());
        self.order.retain(|p| *p != protocol);
        Some(handler)
    }
}

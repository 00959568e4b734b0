//! # etpwire
//!
//! Client/server session runtime for the Energistics Transfer Protocol
//! (ETP): a bidirectional, message-oriented protocol carried over WebSocket
//! used to exchange subsurface data objects between a *store* and a
//! *customer*.
//!
//! This crate is the session-and-dispatch core that concrete protocol
//! handlers are composed on:
//!
//! - **Framing and codec selection**: Avro-binary or JSON framing, latched
//!   per session by the `etp-encoding` handshake header
//! - **Message-id allocation and send serialization**: one send lock, ids
//!   contiguous in wire order
//! - **Handler registry and negotiation**: dual-keyed by contract and
//!   protocol id, pruned to the negotiated protocol set
//! - **Inbound routing and multipart correlation**: per-protocol dispatch,
//!   assembly of multipart reply sets, protocol-error propagation
//!
//! Wire versions 1.1 and 1.2 are supported side-by-side through
//! version-parameterized message catalogs.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use etpwire::codec::MessageEncoding;
//! use etpwire::handler::{Contract, StoreCustomer};
//! use etpwire::session::{Session, SessionConfig};
//! use etpwire::transport::ws;
//!
//! #[tokio::main]
//! async fn main() -> etpwire::error::Result<()> {
//!     let (sink, stream) = ws::connect("ws://localhost:8080", MessageEncoding::Binary).await?;
//!     let session = Session::builder(SessionConfig::default())
//!         .register(Arc::new(StoreCustomer::new()))
//!         .open_customer(sink, stream)
//!         .await?;
//!
//!     let store = session.handler_as::<StoreCustomer>(Contract::StoreCustomer)?;
//!     let request_id = store.get_object("eml://well/1").await?;
//!     let reply = session.await_response(request_id).await?;
//!     println!("{} part(s)", reply.len());
//!
//!     session.close("done").await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod error;
pub mod handler;
pub mod messages;
pub mod protocol;
pub mod session;
pub mod transport;

pub use error::{ErrorCode, EtpError, Result};
pub use session::{Session, SessionBuilder, SessionConfig, SessionHandle, SessionState};

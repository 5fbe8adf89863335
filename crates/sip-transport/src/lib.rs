//! SIP transport layer for the rvoip stack
//!
//! This crate owns the connection lifecycle: reference-counted
//! [`Connection`]s kept in a [`ConnectionTable`], a single-threaded mio
//! reactor handing ready sockets to a [`WorkQueue`], stream and datagram
//! framing, and a sans-IO TLS engine built on rustls. [`TransportRuntime`]
//! ties these together and delivers every framed inbound message to a
//! [`MessageSink`].

pub mod binding;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod framing;
pub mod queue;
pub mod reactor;
pub mod runtime;
pub mod transport;
pub mod unreachable;

// Internal modules
#[cfg(test)]
mod tests;

pub use binding::{BindingInfo, TlsSessionInfo, Transport};
pub use config::{DiscardPolicy, QueueConfig, TransportConfig};
pub use connection::{
    Connection, ConnectionBarrier, ConnectionKey, ConnectionTable, Link, MemoryLink,
};
pub use error::{Error, Result};
pub use events::{ConnectionEvent, ConnectionListener};
pub use queue::{UnitOfWork, WorkQueue, WorkerContext, work};
pub use reactor::{ReactorHandle, Readiness, ReadyHandler, Rearm};
pub use runtime::TransportRuntime;
pub use transport::{MessageSink, ReadOutcome, StreamRead};
pub use transport::tls::TlsSettings;
pub use unreachable::UnreachableDestinationTable;

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        BindingInfo, Connection, ConnectionEvent, ConnectionListener, ConnectionTable, Error,
        MessageSink, Result, Transport, TransportConfig, TransportRuntime, WorkQueue,
        WorkerContext,
    };
}

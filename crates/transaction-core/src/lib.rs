//! SIP transaction layer for the rvoip stack
//!
//! Transactions are driven by enumerated state tables ([`state`]) and a
//! small [`StateMachine`](machine::StateMachine) that logs every
//! transition. The [`TransactionManager`] sits on top of the transport as
//! its [`MessageSink`](rvoip_sip_transport::MessageSink), matches inbound
//! messages against the [`TransactionTable`](table::TransactionTable) and
//! hands new requests to a [`RequestInterface`].
//!
//! Message handling is minimal: [`message::SipMessage`]
//! parses only what transaction matching and response generation need.

pub mod config;
pub mod error;
pub mod helper;
pub mod interfaces;
pub mod key;
pub mod machine;
pub mod manager;
pub mod message;
pub mod state;
pub mod table;
pub mod transaction;

#[cfg(test)]
mod test_support;

pub use config::{RequestQueueConfig, TimerConfig, TransactionConfig};
pub use error::{Error, Result};
pub use helper::{RedirectHelper, RejectHelper, RequestQueueHelper};
pub use interfaces::{ClientTransactionInterface, DiscardInterface, RequestInterface};
pub use key::{KeyContext, MapKey, TransactionKey};
pub use manager::TransactionManager;
pub use message::{Method, SipMessage, Via};
pub use state::{Input, StateTable, TransactionState};
pub use table::TableSnapshot;
pub use transaction::{ClientTransaction, ServerTransaction, TimerKind};

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        ClientTransaction, ClientTransactionInterface, Error, Method, RequestInterface, Result,
        ServerTransaction, SipMessage, TransactionConfig, TransactionKey, TransactionManager,
        TransactionState,
    };
}

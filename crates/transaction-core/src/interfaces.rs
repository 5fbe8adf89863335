//! Callbacks from the transaction layer to the transaction user (TU).
//!
//! Every callback runs after the transaction has released its own lock, so
//! an implementation may call straight back into the transaction (send a
//! response, pick the next server, ...).

use std::sync::Arc;

use rvoip_sip_transport::Connection;

use crate::message::SipMessage;
use crate::transaction::{ClientTransaction, ServerTransaction};

/// Receives inbound requests
pub trait RequestInterface: Send + Sync {
    /// A new server transaction; the TU owes it a final response
    fn request(&self, tx: ServerTransaction);

    /// The INVITE behind `tx` was cancelled by `cancel`
    fn cancel(&self, _tx: &ServerTransaction, _cancel: &SipMessage) {}

    /// ACK for a 2xx arrived
    fn ack(&self, _tx: &ServerTransaction, _ack: &SipMessage) {}

    /// The transaction gave up waiting for an ACK or PRACK, or outlived Tn
    fn timeout(&self, _tx: &ServerTransaction) {}

    /// A message no transaction claims: stray ACK, CANCEL, PRACK or response
    fn stray(&self, _message: &SipMessage, _connection: &Arc<Connection>) {}
}

/// Receives the outcome of one outbound request
pub trait ClientTransactionInterface: Send + Sync {
    fn provisional(&self, _tx: &ClientTransaction, _response: &SipMessage) {}

    /// Final response; called again for each 2xx retransmission or fork
    /// until the TU sends an ACK through the transaction
    fn final_response(&self, tx: &ClientTransaction, response: &SipMessage);

    fn timeout(&self, _tx: &ClientTransaction) {}

    /// Sending failed. The transaction waits for [`ClientTransaction::next_server`]
    /// or [`ClientTransaction::no_server`]; by default it gives up.
    fn transport_error(&self, tx: &ClientTransaction, _error: &str) {
        tx.no_server();
    }

    /// 503 received on a transaction with failover enabled
    fn service_unavailable(&self, tx: &ClientTransaction, response: &SipMessage) {
        self.final_response(tx, response);
        tx.no_server();
    }

    fn terminated(&self, _tx: &ClientTransaction) {}
}

/// Invoked for requests dropped under overload
pub trait DiscardInterface: Send + Sync {
    fn discard(&self, tx: &ServerTransaction);
}

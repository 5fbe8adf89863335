//! # Transaction manager
//!
//! The manager is the transport's [`MessageSink`]: every framed inbound
//! message is parsed and matched against the transaction table.
//!
//! * requests go through find-or-create; new transactions are handed to the
//!   [`RequestInterface`], retransmissions are absorbed
//! * ACK is routed to the INVITE it acknowledges
//! * CANCEL gets its own transaction, is answered 200 (or 481 when stray)
//!   and is reported to the INVITE it cancels
//! * PRACK gets its own transaction and stops the reliable provisional
//!   retransmissions of its INVITE
//! * responses are routed to the client transaction that sent the request
//!
//! Outbound requests start client transactions through
//! [`TransactionManager::send_request`].

use std::sync::Arc;

use bytes::Bytes;
use rvoip_sip_transport::{Connection, MessageSink, Transport, WorkerContext};
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use crate::config::TransactionConfig;
use crate::error::{Error, Result};
use crate::interfaces::{ClientTransactionInterface, RequestInterface};
use crate::key::TransactionKey;
use crate::message::{Method, SipMessage, create_cancel, generate_branch};
use crate::state::TransactionState;
use crate::table::{ServerLookup, TableSnapshot};
use crate::transaction::{ClientInner, ClientTransaction, ServerInner, ServerTransaction, Shared};

/// Owns the transaction table; cheap to clone
#[derive(Clone)]
pub struct TransactionManager {
    shared: Arc<Shared>,
}

impl TransactionManager {
    /// Timers run on `handle`
    pub fn new(config: TransactionConfig, handle: Handle) -> Self {
        Self {
            shared: Shared::new(config, handle),
        }
    }

    pub fn set_request_interface(&self, interface: Arc<dyn RequestInterface>) {
        *self.shared.request_interface.write() = Some(interface);
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.shared.config
    }

    pub fn snapshot(&self) -> TableSnapshot {
        self.shared.table.snapshot()
    }

    /// Live transactions across all maps
    pub fn len(&self) -> usize {
        self.shared.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.table.is_empty()
    }

    pub fn find_server(&self, key: &TransactionKey) -> Option<ServerTransaction> {
        self.shared.table.find_server(key).map(ServerTransaction)
    }

    pub fn find_client(&self, key: &TransactionKey) -> Option<ClientTransaction> {
        self.shared.table.find_client(key).map(ClientTransaction)
    }

    /// Starts a client transaction for `request` over `connection`. A
    /// request without a Via gets one with a fresh branch.
    pub fn send_request(
        &self,
        mut request: SipMessage,
        connection: Arc<Connection>,
        interface: Arc<dyn ClientTransactionInterface>,
    ) -> Result<ClientTransaction> {
        match request.method() {
            None => return Err(Error::InvalidOperation("send_request needs a request".to_string())),
            Some(Method::Ack) => {
                return Err(Error::InvalidOperation(
                    "ACK is sent without a client transaction".to_string(),
                ));
            }
            Some(_) => {}
        }
        match request.top_via() {
            Some(via) if via.branch.is_none() => {
                return Err(Error::InvalidMessage("top Via has no branch".to_string()));
            }
            Some(_) => {}
            None => {
                let transport = match connection.transport() {
                    Transport::Multicast => Transport::Udp,
                    other => other,
                };
                let local = connection.local_addr();
                request.prepend_header(
                    "Via",
                    format!("SIP/2.0/{} {};branch={}", transport, local, generate_branch()),
                );
            }
        }

        let key = TransactionKey::from_message(&request)?;
        let inner = ClientInner::new(key, request, connection, interface, &self.shared);
        self.shared.table.add_client(inner.clone())?;
        let tx = ClientTransaction(inner);
        tx.start();
        Ok(tx)
    }

    /// Sends CANCEL for a pending INVITE; returns the CANCEL's own transaction
    pub fn cancel(
        &self,
        invite: &ClientTransaction,
        interface: Arc<dyn ClientTransactionInterface>,
    ) -> Result<ClientTransaction> {
        if !invite.key().is_invite() {
            return Err(Error::InvalidOperation("only INVITE can be cancelled".to_string()));
        }
        match invite.state() {
            TransactionState::Calling
            | TransactionState::Proceeding
            | TransactionState::RelProceeding => {}
            state => {
                return Err(Error::InvalidOperation(format!("cannot cancel in state {}", state)));
            }
        }
        let cancel = create_cancel(invite.request());
        let cancel_tx = self.send_request(cancel, invite.connection(), interface)?;
        invite.cancel_sent();
        Ok(cancel_tx)
    }

    /// Sends outside any transaction (2xx ACK, stateless responses)
    pub fn send_stateless(&self, message: &SipMessage, connection: &Connection) -> Result<()> {
        connection.send(&message.to_bytes())?;
        Ok(())
    }

    /// Routes one parsed message
    pub fn handle_message(&self, message: SipMessage, connection: &Arc<Connection>) {
        let key = match TransactionKey::from_message(&message) {
            Ok(key) => key,
            Err(e) => {
                warn!(peer = %connection.remote_addr(), error = %e, "cannot key message; dropping");
                return;
            }
        };
        trace!(id = %key, message = %message, "inbound");
        if message.is_request() {
            self.handle_request(key, message, connection);
        } else {
            self.handle_response(key, message, connection);
        }
    }

    fn stray(&self, message: &SipMessage, connection: &Arc<Connection>) {
        debug!(peer = %connection.remote_addr(), message = %message, "stray message");
        if let Some(iface) = self.shared.request_interface() {
            iface.stray(message, connection);
        }
    }

    fn deliver(&self, tx: ServerTransaction) {
        match self.shared.request_interface() {
            Some(iface) => iface.request(tx),
            None => {
                warn!(id = %tx.key(), "no request interface; rejecting request");
                let response = tx.create_response(500);
                if let Err(e) = tx.send_response(response) {
                    debug!(id = %tx.key(), error = %e, "reject failed");
                }
            }
        }
    }

    fn new_server(
        &self,
        key: &TransactionKey,
        message: &SipMessage,
        connection: &Arc<Connection>,
        merged: bool,
    ) -> Arc<ServerInner> {
        ServerInner::new(key.clone(), message.clone(), connection.clone(), merged, &self.shared)
    }

    fn handle_request(
        &self,
        key: TransactionKey,
        message: SipMessage,
        connection: &Arc<Connection>,
    ) {
        let table = &self.shared.table;
        match key.method {
            Method::Ack => match table.find_ack_target(&key) {
                Some(tx) => ServerTransaction(tx).ack_received(message),
                None => self.stray(&message, connection),
            },
            Method::Cancel => {
                let target = table.find_cancel_target(&key);
                let create = || self.new_server(&key, &message, connection, false);
                let (tx, created) = table.find_or_create_cancel(&key, create);
                let cancel_tx = ServerTransaction(tx);
                if !created {
                    cancel_tx.request_retransmitted();
                    return;
                }
                cancel_tx.start();
                match target {
                    Some(target) => {
                        respond(&cancel_tx, 200);
                        let target = ServerTransaction(target);
                        target.cancel_received(message);
                        let unanswered = target.last_status().is_none_or(|s| s < 200);
                        if self.shared.config.auto_cancel_response && unanswered {
                            respond(&target, 487);
                        }
                    }
                    None => {
                        respond(&cancel_tx, 481);
                        self.stray(&message, connection);
                    }
                }
            }
            Method::Prack => {
                let target = match key.prack_target(&message) {
                    Ok(target_key) => table.find_prack_target(&target_key),
                    Err(e) => {
                        warn!(id = %key, error = %e, "PRACK without usable RAck");
                        None
                    }
                };
                let create = || self.new_server(&key, &message, connection, false);
                let (tx, created) = table.find_or_create_prack(&key, create);
                let prack_tx = ServerTransaction(tx);
                if !created {
                    prack_tx.request_retransmitted();
                    return;
                }
                prack_tx.start();
                match target {
                    Some(target) => {
                        ServerTransaction(target).prack_received();
                        self.deliver(prack_tx);
                    }
                    None => respond(&prack_tx, 481),
                }
            }
            _ => {
                let create = |merged| self.new_server(&key, &message, connection, merged);
                let lookup = table.find_or_create_server(&key, create);
                match lookup {
                    ServerLookup::Retransmission(tx) => {
                        ServerTransaction(tx).request_retransmitted()
                    }
                    ServerLookup::Created(tx) | ServerLookup::Merged(tx) => {
                        let tx = ServerTransaction(tx);
                        tx.start();
                        self.deliver(tx);
                    }
                }
            }
        }
    }

    fn handle_response(
        &self,
        key: TransactionKey,
        message: SipMessage,
        connection: &Arc<Connection>,
    ) {
        match self.shared.table.find_client_for_response(&key) {
            Some(tx) => ClientTransaction(tx).response_received(message),
            None => self.stray(&message, connection),
        }
    }
}

fn respond(tx: &ServerTransaction, status: u16) {
    if let Err(e) = tx.send_response(tx.create_response(status)) {
        debug!(id = %tx.key(), status, error = %e, "automatic response not sent");
    }
}

impl MessageSink for TransactionManager {
    fn on_message(&self, message: Bytes, connection: &Arc<Connection>, ctx: &WorkerContext) {
        match SipMessage::parse(&message) {
            Ok(parsed) => self.handle_message(parsed, connection),
            Err(e) => debug!(
                peer = %connection.remote_addr(),
                worker = ctx.worker_id,
                error = %e,
                "unparsable message dropped"
            ),
        }
    }
}

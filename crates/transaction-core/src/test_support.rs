//! Fixtures shared by the unit tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rvoip_sip_transport::{BindingInfo, Connection, MemoryLink, Transport};

use crate::interfaces::{ClientTransactionInterface, RequestInterface};
use crate::message::{Method, SipMessage};
use crate::transaction::{ClientTransaction, ServerTransaction};

pub(crate) fn connection(transport: Transport) -> (Arc<Connection>, Arc<MemoryLink>) {
    let local: SocketAddr = "10.0.0.1:5060".parse().unwrap();
    let remote: SocketAddr = "10.0.0.2:5060".parse().unwrap();
    let link = MemoryLink::new();
    let connection = Connection::new(
        BindingInfo::new(local, remote, transport),
        Box::new(link.clone()),
        Duration::from_secs(60),
    );
    (Arc::new(connection), link)
}

/// A request as the peer at 10.0.0.2 would send it
pub(crate) fn request(method: Method, branch: &str, call_id: &str, cseq: u32) -> SipMessage {
    SipMessage::new_request(method.clone(), "sip:bob@biloxi.example.com")
        .with_header("Via", format!("SIP/2.0/UDP 10.0.0.2:5060;branch={}", branch))
        .with_header("Max-Forwards", "70")
        .with_header("From", "Alice <sip:alice@atlanta.example.com>;tag=1928301774")
        .with_header("To", "Bob <sip:bob@biloxi.example.com>")
        .with_header("Call-ID", call_id)
        .with_header("CSeq", format!("{} {}", cseq, method))
}

pub(crate) fn sent(link: &MemoryLink) -> Vec<SipMessage> {
    link.take_sent()
        .into_iter()
        .map(|(_, bytes)| SipMessage::parse(&bytes).unwrap())
        .collect()
}

pub(crate) fn statuses(link: &MemoryLink) -> Vec<u16> {
    sent(link).iter().filter_map(SipMessage::status).collect()
}

#[derive(Default)]
pub(crate) struct RecordingTu {
    pub requests: Mutex<Vec<ServerTransaction>>,
    pub cancels: Mutex<Vec<SipMessage>>,
    pub acks: Mutex<usize>,
    pub timeouts: Mutex<usize>,
    pub strays: Mutex<Vec<SipMessage>>,
}

impl RequestInterface for RecordingTu {
    fn request(&self, tx: ServerTransaction) {
        self.requests.lock().push(tx);
    }

    fn cancel(&self, _tx: &ServerTransaction, cancel: &SipMessage) {
        self.cancels.lock().push(cancel.clone());
    }

    fn ack(&self, _tx: &ServerTransaction, _ack: &SipMessage) {
        *self.acks.lock() += 1;
    }

    fn timeout(&self, _tx: &ServerTransaction) {
        *self.timeouts.lock() += 1;
    }

    fn stray(&self, message: &SipMessage, _connection: &Arc<Connection>) {
        self.strays.lock().push(message.clone());
    }
}

#[derive(Default)]
pub(crate) struct RecordingClient {
    pub provisionals: Mutex<Vec<u16>>,
    pub finals: Mutex<Vec<u16>>,
    pub timeouts: Mutex<usize>,
    pub transport_errors: Mutex<usize>,
    pub terminated: Mutex<usize>,
}

impl ClientTransactionInterface for RecordingClient {
    fn provisional(&self, _tx: &ClientTransaction, response: &SipMessage) {
        self.provisionals.lock().extend(response.status());
    }

    fn final_response(&self, _tx: &ClientTransaction, response: &SipMessage) {
        self.finals.lock().extend(response.status());
    }

    fn timeout(&self, _tx: &ClientTransaction) {
        *self.timeouts.lock() += 1;
    }

    fn transport_error(&self, tx: &ClientTransaction, _error: &str) {
        *self.transport_errors.lock() += 1;
        tx.no_server();
    }

    fn terminated(&self, _tx: &ClientTransaction) {
        *self.terminated.lock() += 1;
    }
}

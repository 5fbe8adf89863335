#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rvoip_sip_transport::{BindingInfo, Connection, MemoryLink, Transport};
use rvoip_transaction_core::prelude::*;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn connection(transport: Transport) -> (Arc<Connection>, Arc<MemoryLink>) {
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
pub fn request(method: Method, branch: &str, call_id: &str, cseq: u32) -> SipMessage {
    SipMessage::new_request(method.clone(), "sip:bob@biloxi.example.com")
        .with_header("Via", format!("SIP/2.0/UDP 10.0.0.2:5060;branch={}", branch))
        .with_header("Max-Forwards", "70")
        .with_header("From", "Alice <sip:alice@atlanta.example.com>;tag=1928301774")
        .with_header("To", "Bob <sip:bob@biloxi.example.com>")
        .with_header("Call-ID", call_id)
        .with_header("CSeq", format!("{} {}", cseq, method))
}

/// A request we originate; the manager adds the Via
pub fn outbound(method: Method, call_id: &str) -> SipMessage {
    SipMessage::new_request(method.clone(), "sip:bob@10.0.0.2")
        .with_header("Max-Forwards", "70")
        .with_header("From", "Alice <sip:alice@atlanta.example.com>;tag=a73kszlfl")
        .with_header("To", "Bob <sip:bob@biloxi.example.com>")
        .with_header("Call-ID", call_id)
        .with_header("CSeq", format!("1 {}", method))
}

pub fn sent(link: &MemoryLink) -> Vec<SipMessage> {
    link.take_sent()
        .into_iter()
        .map(|(_, bytes)| SipMessage::parse(&bytes).unwrap())
        .collect()
}

pub fn statuses(link: &MemoryLink) -> Vec<u16> {
    sent(link).iter().filter_map(SipMessage::status).collect()
}

pub async fn advance(millis: u64) {
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

#[derive(Default)]
pub struct RecordingTu {
    pub requests: Mutex<Vec<ServerTransaction>>,
    pub cancels: Mutex<Vec<SipMessage>>,
    pub acks: Mutex<usize>,
    pub timeouts: Mutex<usize>,
    pub strays: Mutex<Vec<SipMessage>>,
}

impl RecordingTu {
    pub fn last(&self) -> ServerTransaction {
        self.requests.lock().last().cloned().unwrap()
    }
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
pub struct RecordingClient {
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

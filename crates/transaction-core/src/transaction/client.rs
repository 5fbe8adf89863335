//! Client transactions: INVITE and non-INVITE.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rvoip_sip_transport::Connection;
use tracing::{debug, info};

use super::timers::{TimerKind, Timers};
use super::{FollowUps, Shared, backoff, transmit};
use crate::config::TimerConfig;
use crate::error::{Error, Result};
use crate::interfaces::ClientTransactionInterface;
use crate::key::TransactionKey;
use crate::machine::{Change, StateMachine};
use crate::message::{Method, SipMessage, create_ack};
use crate::state::{Input, StateTable, TransactionState};
use crate::table::TableEntry;

enum Notice {
    Provisional(SipMessage),
    Final(SipMessage),
    ServiceUnavailable(SipMessage),
    TransportError(String),
    Timeout,
    Terminated,
}

struct ClientState {
    machine: StateMachine,
    timers: Timers,
    connection: Arc<Connection>,
    /// Replacement connection for the next `NextServer` input
    next_connection: Option<Arc<Connection>>,
    /// Response (or TU-supplied ACK) being processed
    message: Option<SipMessage>,
    /// ACK to resend when the final response is retransmitted
    ack: Option<Bytes>,
    interval: Duration,
    failover: bool,
    released: bool,
}

pub(crate) struct ClientInner {
    key: TransactionKey,
    request: SipMessage,
    request_bytes: Bytes,
    interface: Arc<dyn ClientTransactionInterface>,
    timer_config: TimerConfig,
    shared: Weak<Shared>,
    state: Mutex<ClientState>,
}

impl TableEntry for ClientInner {
    fn key(&self) -> &TransactionKey {
        &self.key
    }
}

impl ClientInner {
    pub(crate) fn new(
        key: TransactionKey,
        request: SipMessage,
        connection: Arc<Connection>,
        interface: Arc<dyn ClientTransactionInterface>,
        shared: &Arc<Shared>,
    ) -> Arc<Self> {
        let table = if key.is_invite() {
            StateTable::ClientInvite
        } else {
            StateTable::ClientNonInvite
        };
        connection.add_reference();
        let timer_config = shared.config.timers.clone();
        Arc::new(Self {
            key,
            request_bytes: request.to_bytes(),
            request,
            interface,
            state: Mutex::new(ClientState {
                machine: StateMachine::new(table),
                timers: Timers::new(shared.handle.clone()),
                connection,
                next_connection: None,
                message: None,
                ack: None,
                interval: timer_config.t1(),
                failover: false,
                released: false,
            }),
            timer_config,
            shared: Arc::downgrade(shared),
        })
    }

    fn is_invite(&self) -> bool {
        self.key.is_invite()
    }

    fn process(
        self: &Arc<Self>,
        input: Input,
        message: Option<SipMessage>,
        timer: Option<(TimerKind, u64)>,
    ) -> bool {
        let mut notices = Vec::new();
        let accepted;
        let finished;
        let released_connection;
        {
            let mut st = self.state.lock();
            if let Some((kind, generation)) = timer {
                if !st.timers.claim(kind, generation) {
                    return false;
                }
            }
            st.message = message;
            let mut follow_ups: FollowUps = VecDeque::from([input]);
            let mut first = None;
            while let Some(next) = follow_ups.pop_front() {
                let change = st.machine.switch_state(next, &self.key);
                first.get_or_insert(change.is_some());
                if let Some(change) = change {
                    match st.machine.table() {
                        StateTable::ClientInviteX => {
                            self.act_x(&mut st, next, change, &mut follow_ups, &mut notices)
                        }
                        _ => self.act(&mut st, next, change, &mut follow_ups, &mut notices),
                    }
                }
            }
            st.message = None;
            accepted = first.unwrap_or(false);
            finished = st.machine.is_terminated() && !st.released;
            released_connection = if finished {
                st.timers.cancel_all();
                st.released = true;
                notices.push(Notice::Terminated);
                Some(st.connection.clone())
            } else {
                None
            };
        }
        if let Some(connection) = released_connection {
            debug!(id = %self.key, "client transaction terminated");
            connection.remove_reference();
            if let Some(shared) = self.shared.upgrade() {
                shared.table.remove_client(self);
            }
        }
        self.notify(notices);
        accepted
    }

    fn notify(self: &Arc<Self>, notices: Vec<Notice>) {
        if notices.is_empty() {
            return;
        }
        let tx = ClientTransaction(self.clone());
        for notice in notices {
            match notice {
                Notice::Provisional(response) => self.interface.provisional(&tx, &response),
                Notice::Final(response) => self.interface.final_response(&tx, &response),
                Notice::ServiceUnavailable(response) => {
                    self.interface.service_unavailable(&tx, &response)
                }
                Notice::TransportError(error) => self.interface.transport_error(&tx, &error),
                Notice::Timeout => self.interface.timeout(&tx),
                Notice::Terminated => self.interface.terminated(&tx),
            }
        }
    }

    fn schedule(
        self: &Arc<Self>,
        st: &mut ClientState,
        kind: TimerKind,
        delay: Duration,
        follow_ups: &mut FollowUps,
    ) {
        if delay.is_zero() {
            follow_ups.push_back(kind.input());
            return;
        }
        let weak = Arc::downgrade(self);
        st.timers.start(kind, delay, move |generation| {
            if let Some(inner) = weak.upgrade() {
                inner.process(kind.input(), None, Some((kind, generation)));
            }
        });
    }

    fn send_request(&self, st: &ClientState, follow_ups: &mut FollowUps) {
        transmit(&self.key, &st.connection, &self.request_bytes, follow_ups);
    }

    /// Builds and sends the hop-by-hop ACK for the non-2xx in `st.message`
    fn send_ack(&self, st: &mut ClientState, follow_ups: &mut FollowUps) {
        if let Some(response) = &st.message {
            let ack = create_ack(&self.request, response).to_bytes();
            transmit(&self.key, &st.connection, &ack, follow_ups);
            st.ack = Some(ack);
        }
    }

    fn resend_ack(&self, st: &ClientState, follow_ups: &mut FollowUps) {
        if let Some(ack) = &st.ack {
            transmit(&self.key, &st.connection, ack, follow_ups);
        }
    }

    fn linger(st: &ClientState, unreliable: Duration) -> Duration {
        if st.connection.transport().is_reliable() {
            Duration::ZERO
        } else {
            unreliable
        }
    }

    fn act(
        self: &Arc<Self>,
        st: &mut ClientState,
        input: Input,
        change: Change,
        follow_ups: &mut FollowUps,
        notices: &mut Vec<Notice>,
    ) {
        let timers = self.timer_config.clone();
        let invite = self.is_invite();
        let in_progress = !matches!(change.from, TransactionState::Completed);
        match input {
            Input::Start => {
                self.send_request(st, follow_ups);
                st.interval = timers.t1();
                if !st.connection.transport().is_reliable() {
                    self.schedule(st, TimerKind::T1, timers.t1(), follow_ups);
                }
                self.schedule(st, TimerKind::T1Expired, timers.t1_expired(), follow_ups);
                if !st.timers.is_running(TimerKind::Tn) {
                    self.schedule(st, TimerKind::Tn, timers.tn(), follow_ups);
                }
            }
            Input::T1 => match change.to {
                TransactionState::Calling => {
                    self.send_request(st, follow_ups);
                    let cap = if invite { None } else { Some(timers.t2()) };
                    st.interval = backoff(st.interval, cap);
                    let interval = st.interval;
                    self.schedule(st, TimerKind::T1, interval, follow_ups);
                }
                TransactionState::Proceeding if !invite => {
                    self.send_request(st, follow_ups);
                    st.interval = timers.t2();
                    self.schedule(st, TimerKind::T1, timers.t2(), follow_ups);
                }
                _ => {}
            },
            Input::Provisional | Input::RelProvisional => {
                if !in_progress {
                    return;
                }
                if invite {
                    st.timers.cancel(TimerKind::T1);
                    st.timers.cancel(TimerKind::T1Expired);
                    self.schedule(st, TimerKind::Tp, timers.tp(), follow_ups);
                }
                if let Some(response) = st.message.take() {
                    notices.push(Notice::Provisional(response));
                }
            }
            Input::Success if invite => {
                st.timers.cancel_all();
                if let Some(response) = st.message.take() {
                    notices.push(Notice::Final(response));
                }
                st.machine.switch_table(StateTable::ClientInviteX);
                follow_ups.push_front(Input::Start);
            }
            Input::Final if invite => {
                if in_progress {
                    for kind in
                        [TimerKind::T1, TimerKind::T1Expired, TimerKind::Tp, TimerKind::Cancel]
                    {
                        st.timers.cancel(kind);
                    }
                    self.send_ack(st, follow_ups);
                    let linger = Self::linger(st, timers.t1_expired());
                    if let Some(response) = st.message.take() {
                        notices.push(Notice::Final(response));
                    }
                    self.schedule(st, TimerKind::Timeout, linger, follow_ups);
                } else {
                    self.resend_ack(st, follow_ups);
                }
            }
            Input::Success | Input::Final => {
                if in_progress {
                    st.timers.cancel(TimerKind::T1);
                    st.timers.cancel(TimerKind::T1Expired);
                    if let Some(response) = st.message.take() {
                        notices.push(Notice::Final(response));
                    }
                    let linger = Self::linger(st, timers.t4());
                    self.schedule(st, TimerKind::Timeout, linger, follow_ups);
                }
            }
            Input::ServiceUnavailable => {
                if invite {
                    if in_progress {
                        self.send_ack(st, follow_ups);
                    } else {
                        self.resend_ack(st, follow_ups);
                    }
                }
                if in_progress {
                    for kind in [TimerKind::T1, TimerKind::T1Expired, TimerKind::Tp] {
                        st.timers.cancel(kind);
                    }
                    if let Some(response) = st.message.take() {
                        notices.push(Notice::ServiceUnavailable(response));
                    }
                }
            }
            Input::NextServer => {
                if let Some(next) = st.next_connection.take() {
                    let previous = std::mem::replace(&mut st.connection, next);
                    previous.remove_reference();
                }
                st.ack = None;
                follow_ups.push_back(Input::Start);
            }
            Input::Cancel if invite => {
                self.schedule(st, TimerKind::Cancel, timers.t1_expired(), follow_ups);
            }
            Input::T1Expired | Input::Tp | Input::CancelTimer => notices.push(Notice::Timeout),
            Input::Tn => {
                if in_progress {
                    notices.push(Notice::Timeout);
                }
            }
            Input::IoException => {
                if change.to == TransactionState::Calling {
                    st.timers.cancel(TimerKind::T1);
                    st.timers.cancel(TimerKind::T1Expired);
                    let peer = st.connection.remote_addr();
                    notices.push(Notice::TransportError(format!("cannot send to {}", peer)));
                }
            }
            _ => {}
        }
    }

    /// Actions after a 2xx to an INVITE
    fn act_x(
        self: &Arc<Self>,
        st: &mut ClientState,
        input: Input,
        _change: Change,
        follow_ups: &mut FollowUps,
        notices: &mut Vec<Notice>,
    ) {
        match input {
            Input::Start => {
                let linger = self.timer_config.t1_expired();
                self.schedule(st, TimerKind::Timeout, linger, follow_ups);
            }
            Input::Success => {
                if st.ack.is_some() {
                    self.resend_ack(st, follow_ups);
                } else if let Some(response) = st.message.take() {
                    notices.push(Notice::Final(response));
                }
            }
            Input::Ack => {
                if let Some(ack) = st.message.take() {
                    let bytes = ack.to_bytes();
                    transmit(&self.key, &st.connection, &bytes, follow_ups);
                    st.ack = Some(bytes);
                }
            }
            Input::Provisional => debug!(id = %self.key, "provisional after 2xx ignored"),
            _ => {}
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        if !st.released {
            st.connection.remove_reference();
        }
        if let Some(next) = st.next_connection.take() {
            next.remove_reference();
        }
    }
}

/// Handle to a client transaction; clones share the transaction
#[derive(Clone)]
pub struct ClientTransaction(pub(crate) Arc<ClientInner>);

impl ClientTransaction {
    pub fn key(&self) -> &TransactionKey {
        &self.0.key
    }

    pub fn request(&self) -> &SipMessage {
        &self.0.request
    }

    pub fn method(&self) -> &Method {
        &self.0.key.method
    }

    pub fn state(&self) -> TransactionState {
        self.0.state.lock().machine.state()
    }

    pub fn connection(&self) -> Arc<Connection> {
        self.0.state.lock().connection.clone()
    }

    /// Treat 503 as a cue to try another server instead of a final answer
    pub fn set_failover(&self, failover: bool) {
        self.0.state.lock().failover = failover;
    }

    /// Retries the request over `connection` after a transport error or 503
    pub fn next_server(&self, connection: Arc<Connection>) -> Result<()> {
        connection.add_reference();
        if let Some(stale) = self.0.state.lock().next_connection.replace(connection) {
            stale.remove_reference();
        }
        if self.0.process(Input::NextServer, None, None) {
            info!(id = %self.0.key, "trying next server");
            Ok(())
        } else {
            if let Some(unused) = self.0.state.lock().next_connection.take() {
                unused.remove_reference();
            }
            Err(Error::InvalidOperation(format!("next_server in state {}", self.state())))
        }
    }

    /// Gives up after a transport error or 503
    pub fn no_server(&self) {
        self.0.process(Input::NoServer, None, None);
    }

    /// Sends the ACK for a 2xx; later 2xx retransmissions are answered with it
    pub fn send_ack(&self, ack: SipMessage) -> Result<()> {
        if ack.method() != Some(&Method::Ack) {
            return Err(Error::InvalidOperation("send_ack needs an ACK request".to_string()));
        }
        if self.0.process(Input::Ack, Some(ack), None) {
            Ok(())
        } else {
            Err(Error::InvalidOperation(format!("ACK not allowed in state {}", self.state())))
        }
    }

    /// Records that the TU answered a reliable provisional
    pub fn prack_sent(&self) {
        self.0.process(Input::Prack, None, None);
    }

    pub(crate) fn start(&self) {
        self.0.process(Input::Start, None, None);
    }

    pub(crate) fn cancel_sent(&self) -> bool {
        self.0.process(Input::Cancel, None, None)
    }

    pub(crate) fn response_received(&self, response: SipMessage) {
        let Some(status) = response.status() else {
            return;
        };
        let failover = self.0.state.lock().failover;
        let input = match status {
            100..=199 if self.0.is_invite() && response.is_reliable_provisional() => {
                Input::RelProvisional
            }
            100..=199 => Input::Provisional,
            200..=299 => Input::Success,
            503 if failover => Input::ServiceUnavailable,
            _ => Input::Final,
        };
        self.0.process(input, Some(response), None);
    }
}

impl fmt::Debug for ClientTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTransaction").field("key", &self.0.key).finish()
    }
}

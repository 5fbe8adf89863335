//! Server transactions: INVITE and non-INVITE.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rvoip_sip_transport::Connection;
use tracing::{debug, warn};

use super::timers::{TimerKind, Timers};
use super::{FollowUps, Shared, backoff, transmit};
use crate::config::TimerConfig;
use crate::error::{Error, Result};
use crate::key::TransactionKey;
use crate::machine::{Change, StateMachine};
use crate::message::{Method, SipMessage, create_response, generate_tag};
use crate::state::{Input, StateTable, TransactionState};
use crate::table::TableEntry;

enum Notice {
    Timeout,
    Cancel(SipMessage),
    Ack(SipMessage),
}

struct ServerState {
    machine: StateMachine,
    timers: Timers,
    /// Response handed in by the TU, or the CANCEL/ACK being processed
    message: Option<SipMessage>,
    last_response: Option<Bytes>,
    last_status: Option<u16>,
    reliable_provisional: Option<Bytes>,
    interval: Duration,
    cancelled: bool,
    released: bool,
}

pub(crate) struct ServerInner {
    key: TransactionKey,
    merged: bool,
    request: SipMessage,
    to_tag: String,
    connection: Arc<Connection>,
    timer_config: TimerConfig,
    shared: Weak<Shared>,
    state: Mutex<ServerState>,
}

impl TableEntry for ServerInner {
    fn key(&self) -> &TransactionKey {
        &self.key
    }

    fn is_merged(&self) -> bool {
        self.merged
    }
}

impl ServerInner {
    pub(crate) fn new(
        key: TransactionKey,
        request: SipMessage,
        connection: Arc<Connection>,
        merged: bool,
        shared: &Arc<Shared>,
    ) -> Arc<Self> {
        let table = if key.is_invite() {
            StateTable::ServerInvite
        } else {
            StateTable::ServerNonInvite
        };
        let to_tag = request.to_tag().map(str::to_string).unwrap_or_else(generate_tag);
        connection.add_reference();
        let timer_config = shared.config.timers.clone();
        Arc::new(Self {
            key,
            merged,
            request,
            to_tag,
            connection,
            state: Mutex::new(ServerState {
                machine: StateMachine::new(table),
                timers: Timers::new(shared.handle.clone()),
                message: None,
                last_response: None,
                last_status: None,
                reliable_provisional: None,
                interval: timer_config.t1(),
                cancelled: false,
                released: false,
            }),
            timer_config,
            shared: Arc::downgrade(shared),
        })
    }

    fn is_invite(&self) -> bool {
        self.key.is_invite()
    }

    fn reliable(&self) -> bool {
        self.connection.transport().is_reliable()
    }

    /// Applies `input` and everything it triggers; false when the table has
    /// no transition for `input` (or `timer` was stale)
    fn process(
        self: &Arc<Self>,
        input: Input,
        message: Option<SipMessage>,
        timer: Option<(TimerKind, u64)>,
    ) -> bool {
        let mut notices = Vec::new();
        let accepted;
        let finished;
        {
            let mut st = self.state.lock();
            if let Some((kind, generation)) = timer {
                if !st.timers.claim(kind, generation) {
                    return false;
                }
            }
            st.message = message;
            let mut follow_ups: FollowUps = VecDeque::from([input]);
            let mut first = true;
            let mut first_accepted = false;
            while let Some(next) = follow_ups.pop_front() {
                let change = st.machine.switch_state(next, &self.key);
                if first {
                    first_accepted = change.is_some();
                    first = false;
                }
                if let Some(change) = change {
                    match st.machine.table() {
                        StateTable::ServerInviteX => {
                            self.act_x(&mut st, next, change, &mut follow_ups, &mut notices)
                        }
                        _ => self.act(&mut st, next, change, &mut follow_ups, &mut notices),
                    }
                }
            }
            st.message = None;
            accepted = first_accepted;
            finished = st.machine.is_terminated() && !st.released;
            if finished {
                st.timers.cancel_all();
                st.released = true;
            }
        }
        if finished {
            self.finish();
        }
        self.notify(notices);
        accepted
    }

    fn finish(self: &Arc<Self>) {
        debug!(id = %self.key, "server transaction terminated");
        self.connection.remove_reference();
        if let Some(shared) = self.shared.upgrade() {
            shared.table.remove_server(self);
        }
    }

    fn notify(self: &Arc<Self>, notices: Vec<Notice>) {
        if notices.is_empty() {
            return;
        }
        let Some(iface) = self.shared.upgrade().and_then(|s| s.request_interface()) else {
            return;
        };
        let tx = ServerTransaction(self.clone());
        for notice in notices {
            match notice {
                Notice::Timeout => iface.timeout(&tx),
                Notice::Cancel(cancel) => iface.cancel(&tx, &cancel),
                Notice::Ack(ack) => iface.ack(&tx, &ack),
            }
        }
    }

    fn schedule(
        self: &Arc<Self>,
        st: &mut ServerState,
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

    fn send_outgoing(&self, st: &mut ServerState, follow_ups: &mut FollowUps) {
        if let Some(response) = st.message.take() {
            let bytes = response.to_bytes();
            transmit(&self.key, &self.connection, &bytes, follow_ups);
            st.last_status = response.status();
            st.last_response = Some(bytes);
        }
    }

    fn resend_last(&self, st: &ServerState, follow_ups: &mut FollowUps) {
        if let Some(bytes) = &st.last_response {
            transmit(&self.key, &self.connection, bytes, follow_ups);
        }
    }

    fn linger(&self, unreliable: Duration) -> Duration {
        if self.reliable() { Duration::ZERO } else { unreliable }
    }

    fn act(
        self: &Arc<Self>,
        st: &mut ServerState,
        input: Input,
        change: Change,
        follow_ups: &mut FollowUps,
        notices: &mut Vec<Notice>,
    ) {
        let timers = self.timer_config.clone();
        match input {
            Input::Start => {
                self.schedule(st, TimerKind::Tn, timers.tn(), follow_ups);
                if self.is_invite() {
                    self.schedule(st, TimerKind::TProvisional, timers.trying_delay(), follow_ups);
                }
            }
            Input::Request => self.resend_last(st, follow_ups),
            Input::TProvisional => {
                if change.from == TransactionState::Calling {
                    st.message = Some(create_response(&self.request, 100, None));
                    self.send_outgoing(st, follow_ups);
                }
            }
            Input::Provisional => {
                st.timers.cancel(TimerKind::TProvisional);
                self.send_outgoing(st, follow_ups);
            }
            Input::RelProvisional => {
                st.timers.cancel(TimerKind::TProvisional);
                self.send_outgoing(st, follow_ups);
                st.reliable_provisional = st.last_response.clone();
                st.interval = timers.t1();
                self.schedule(st, TimerKind::T1, timers.t1(), follow_ups);
                self.schedule(st, TimerKind::T1Expired, timers.t1_expired(), follow_ups);
            }
            Input::Prack => {
                st.timers.cancel(TimerKind::T1);
                st.timers.cancel(TimerKind::T1Expired);
            }
            Input::Success if self.is_invite() => {
                st.timers.cancel_all();
                // X table first so a send failure is processed there
                st.machine.switch_table(StateTable::ServerInviteX);
                follow_ups.push_front(Input::Start);
                self.send_outgoing(st, follow_ups);
            }
            Input::Final if self.is_invite() => {
                st.timers.cancel(TimerKind::TProvisional);
                st.timers.cancel(TimerKind::T1);
                st.timers.cancel(TimerKind::T1Expired);
                self.send_outgoing(st, follow_ups);
                st.interval = timers.t1();
                if !self.reliable() {
                    self.schedule(st, TimerKind::T1, timers.t1(), follow_ups);
                }
                self.schedule(st, TimerKind::T1Expired, timers.t1_expired(), follow_ups);
            }
            Input::Success | Input::Final => {
                st.timers.cancel(TimerKind::TProvisional);
                self.send_outgoing(st, follow_ups);
                if change.from != TransactionState::Completed {
                    let linger = self.linger(timers.t1_expired());
                    self.schedule(st, TimerKind::Timeout, linger, follow_ups);
                }
            }
            Input::T1 => match change.to {
                TransactionState::Completed => {
                    self.resend_last(st, follow_ups);
                    st.interval = backoff(st.interval, Some(timers.t2()));
                    let interval = st.interval;
                    self.schedule(st, TimerKind::T1, interval, follow_ups);
                }
                TransactionState::WaitPrack => {
                    if let Some(bytes) = &st.reliable_provisional {
                        transmit(&self.key, &self.connection, bytes, follow_ups);
                    }
                    st.interval = backoff(st.interval, None);
                    let interval = st.interval;
                    self.schedule(st, TimerKind::T1, interval, follow_ups);
                }
                _ => {}
            },
            Input::T1Expired => notices.push(Notice::Timeout),
            Input::Ack => {
                if change.from == TransactionState::Completed {
                    st.timers.cancel(TimerKind::T1);
                    st.timers.cancel(TimerKind::T1Expired);
                    self.schedule(st, TimerKind::Timeout, self.linger(timers.t4()), follow_ups);
                }
            }
            Input::Tn => {
                let answered = matches!(
                    change.from,
                    TransactionState::Completed | TransactionState::Confirmed
                );
                if !answered {
                    notices.push(Notice::Timeout);
                }
            }
            Input::Cancel => {
                let answered = matches!(
                    change.from,
                    TransactionState::Completed | TransactionState::Confirmed
                );
                if !answered && !st.cancelled {
                    st.cancelled = true;
                    if let Some(cancel) = st.message.take() {
                        notices.push(Notice::Cancel(cancel));
                    }
                }
            }
            Input::IoException => {
                warn!(id = %self.key, "cannot reach the client");
                follow_ups.push_back(Input::NoClient);
            }
            _ => {}
        }
    }

    /// Actions after a 2xx to an INVITE
    fn act_x(
        self: &Arc<Self>,
        st: &mut ServerState,
        input: Input,
        change: Change,
        follow_ups: &mut FollowUps,
        notices: &mut Vec<Notice>,
    ) {
        let timers = self.timer_config.clone();
        match input {
            Input::Start => {
                st.interval = timers.t1();
                if !self.reliable() {
                    self.schedule(st, TimerKind::T1, timers.t1(), follow_ups);
                }
                self.schedule(st, TimerKind::T1Expired, timers.t1_expired(), follow_ups);
            }
            Input::Request => self.resend_last(st, follow_ups),
            Input::T1 => {
                self.resend_last(st, follow_ups);
                st.interval = backoff(st.interval, Some(timers.t2()));
                let interval = st.interval;
                self.schedule(st, TimerKind::T1, interval, follow_ups);
            }
            Input::T1Expired => notices.push(Notice::Timeout),
            Input::Ack if change.from == TransactionState::XCompleted => {
                st.timers.cancel(TimerKind::T1);
                st.timers.cancel(TimerKind::T1Expired);
                self.schedule(st, TimerKind::Timeout, self.linger(timers.t4()), follow_ups);
                if let Some(ack) = st.message.take() {
                    notices.push(Notice::Ack(ack));
                }
            }
            _ => {}
        }
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        if !self.state.get_mut().released {
            self.connection.remove_reference();
        }
    }
}

/// Handle to a server transaction; clones share the transaction
#[derive(Clone)]
pub struct ServerTransaction(pub(crate) Arc<ServerInner>);

impl ServerTransaction {
    pub fn key(&self) -> &TransactionKey {
        &self.0.key
    }

    pub fn request(&self) -> &SipMessage {
        &self.0.request
    }

    pub fn method(&self) -> &Method {
        &self.0.key.method
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.0.connection
    }

    pub fn state(&self) -> TransactionState {
        self.0.state.lock().machine.state()
    }

    pub fn is_merged(&self) -> bool {
        self.0.merged
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.state.lock().cancelled
    }

    /// Status of the last response sent
    pub fn last_status(&self) -> Option<u16> {
        self.0.state.lock().last_status
    }

    /// To tag this transaction puts on its responses
    pub fn to_tag(&self) -> &str {
        &self.0.to_tag
    }

    /// Response to the request, with this transaction's To tag
    pub fn create_response(&self, status: u16) -> SipMessage {
        let mut response = create_response(&self.0.request, status, None);
        if status > 100 {
            response.set_to_tag(&self.0.to_tag);
        }
        response
    }

    /// Sends `response` and moves the state machine accordingly
    pub fn send_response(&self, mut response: SipMessage) -> Result<()> {
        let status = response
            .status()
            .ok_or_else(|| Error::InvalidOperation("send_response needs a response".to_string()))?;
        let state = self.state();
        if !matches!(
            state,
            TransactionState::Initial
                | TransactionState::Calling
                | TransactionState::Proceeding
                | TransactionState::WaitPrack
                | TransactionState::RelProceeding
        ) {
            return Err(Error::InvalidOperation(format!(
                "cannot send {} in state {}",
                status, state
            )));
        }
        if status > 100 {
            response.set_to_tag(&self.0.to_tag);
        }
        let input = match status {
            100..=199 if self.0.is_invite() && response.is_reliable_provisional() => {
                Input::RelProvisional
            }
            100..=199 => Input::Provisional,
            200..=299 => Input::Success,
            _ => Input::Final,
        };
        if self.0.process(input, Some(response), None) {
            Ok(())
        } else {
            Err(Error::InvalidOperation(format!(
                "{} not allowed in state {}",
                status,
                self.state()
            )))
        }
    }

    pub(crate) fn start(&self) {
        self.0.process(Input::Start, None, None);
    }

    pub(crate) fn request_retransmitted(&self) {
        self.0.process(Input::Request, None, None);
    }

    pub(crate) fn cancel_received(&self, cancel: SipMessage) {
        self.0.process(Input::Cancel, Some(cancel), None);
    }

    pub(crate) fn ack_received(&self, ack: SipMessage) {
        self.0.process(Input::Ack, Some(ack), None);
    }

    pub(crate) fn prack_received(&self) {
        self.0.process(Input::Prack, None, None);
    }
}

impl fmt::Debug for ServerTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTransaction")
            .field("key", &self.0.key)
            .field("merged", &self.0.merged)
            .finish()
    }
}

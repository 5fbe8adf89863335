//! Transition tables for the six transaction classes.
//!
//! Every table maps `(state, input)` to the next state. Pairs a table does
//! not list yield [`Transition::Undefined`]; the caller logs it and keeps the
//! current state. Terminal states have no outgoing transitions at all.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    Initial,
    Calling,
    Proceeding,
    /// Reliable provisional sent (server) or received (client)
    RelProceeding,
    /// Reliable provisional sent, PRACK outstanding
    WaitPrack,
    Completed,
    Confirmed,
    Terminated,
    XInitial,
    XCompleted,
    XConfirmed,
    XTerminated,
}

impl TransactionState {
    pub const ALL: [TransactionState; 12] = [
        TransactionState::Initial,
        TransactionState::Calling,
        TransactionState::Proceeding,
        TransactionState::RelProceeding,
        TransactionState::WaitPrack,
        TransactionState::Completed,
        TransactionState::Confirmed,
        TransactionState::Terminated,
        TransactionState::XInitial,
        TransactionState::XCompleted,
        TransactionState::XConfirmed,
        TransactionState::XTerminated,
    ];

    pub fn label(self) -> &'static str {
        match self {
            TransactionState::Initial => "INITIAL",
            TransactionState::Calling => "CALLING",
            TransactionState::Proceeding => "PROCEEDING",
            TransactionState::RelProceeding => "RELPROCEEDING",
            TransactionState::WaitPrack => "WAITPRACK",
            TransactionState::Completed => "COMPLETED",
            TransactionState::Confirmed => "CONFIRMED",
            TransactionState::Terminated => "TERMINATED",
            TransactionState::XInitial => "XINITIAL",
            TransactionState::XCompleted => "XCOMPLETED",
            TransactionState::XConfirmed => "XCONFIRMED",
            TransactionState::XTerminated => "XTERMINATED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Terminated | TransactionState::XTerminated)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Inputs fed to a state machine. Client and server tables each use a
/// subset; the rest are undefined for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Input {
    Start,
    /// Request retransmission (server)
    Request,
    T1,
    T1Expired,
    /// Provisional guard (client INVITE)
    Tp,
    /// Automatic 100 Trying delay (server INVITE)
    TProvisional,
    Timeout,
    /// Maximum transaction lifetime
    Tn,
    Cancel,
    CancelTimer,
    Ack,
    Provisional,
    RelProvisional,
    /// 2xx
    Success,
    /// 3xx-6xx
    Final,
    /// 503 the TU wants to fail over on
    ServiceUnavailable,
    NextServer,
    NoServer,
    NextClient,
    NoClient,
    IoException,
    OtherException,
    Prack,
}

impl Input {
    pub const ALL: [Input; 23] = [
        Input::Start,
        Input::Request,
        Input::T1,
        Input::T1Expired,
        Input::Tp,
        Input::TProvisional,
        Input::Timeout,
        Input::Tn,
        Input::Cancel,
        Input::CancelTimer,
        Input::Ack,
        Input::Provisional,
        Input::RelProvisional,
        Input::Success,
        Input::Final,
        Input::ServiceUnavailable,
        Input::NextServer,
        Input::NoServer,
        Input::NextClient,
        Input::NoClient,
        Input::IoException,
        Input::OtherException,
        Input::Prack,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Input::Start => "START",
            Input::Request => "REQUEST",
            Input::T1 => "T1",
            Input::T1Expired => "T1_EXPIRED",
            Input::Tp => "TP",
            Input::TProvisional => "TPROVISIONAL",
            Input::Timeout => "TIMEOUT",
            Input::Tn => "TN",
            Input::Cancel => "CANCEL",
            Input::CancelTimer => "CANCEL_TIMER",
            Input::Ack => "ACK",
            Input::Provisional => "PROVISIONAL",
            Input::RelProvisional => "REL_PROVISIONAL",
            Input::Success => "2XX",
            Input::Final => "3XX_TO_6XX",
            Input::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Input::NextServer => "NEXT_SERVER",
            Input::NoServer => "NO_SERVER",
            Input::NextClient => "NEXT_CLIENT",
            Input::NoClient => "NO_CLIENT",
            Input::IoException => "IO_EXCEPTION",
            Input::OtherException => "OTHER_EXCEPTION",
            Input::Prack => "PRACK",
        }
    }
}

impl fmt::Display for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    To(TransactionState),
    Undefined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateTable {
    ClientInvite,
    ClientNonInvite,
    /// Client INVITE after a 2xx
    ClientInviteX,
    ServerInvite,
    ServerNonInvite,
    /// Server INVITE after a 2xx
    ServerInviteX,
}

impl StateTable {
    pub fn name(self) -> &'static str {
        match self {
            StateTable::ClientInvite => "CTI",
            StateTable::ClientNonInvite => "CT",
            StateTable::ClientInviteX => "CTIX",
            StateTable::ServerInvite => "STI",
            StateTable::ServerNonInvite => "ST",
            StateTable::ServerInviteX => "STIX",
        }
    }

    pub fn next(self, state: TransactionState, input: Input) -> Transition {
        let next = match self {
            StateTable::ClientInvite => client_invite(state, input),
            StateTable::ClientNonInvite => client_non_invite(state, input),
            StateTable::ClientInviteX => client_invite_x(state, input),
            StateTable::ServerInvite => server_invite(state, input),
            StateTable::ServerNonInvite => server_non_invite(state, input),
            StateTable::ServerInviteX => server_invite_x(state, input),
        };
        next.map_or(Transition::Undefined, Transition::To)
    }
}

impl fmt::Display for StateTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

use Input::*;
use TransactionState::*;

fn client_invite(state: TransactionState, input: Input) -> Option<TransactionState> {
    Some(match (state, input) {
        (Initial, Start) => Calling,
        (Initial, T1Expired | Tn) => Terminated,

        (Calling, T1 | Cancel | ServiceUnavailable | IoException) => Calling,
        (Calling, T1Expired | Tn | CancelTimer | Success | NoServer) => Terminated,
        (Calling, Provisional) => Proceeding,
        (Calling, Final) => Completed,
        (Calling, NextServer) => Initial,
        (Calling, RelProvisional) => RelProceeding,

        (Proceeding, T1 | Cancel | Provisional) => Proceeding,
        (Proceeding, T1Expired | Tp | Tn | CancelTimer | Success) => Terminated,
        (Proceeding, Final) => Completed,
        (Proceeding, ServiceUnavailable) => Calling,
        (Proceeding, RelProvisional) => RelProceeding,

        (RelProceeding, T1 | Cancel | RelProvisional | Prack) => RelProceeding,
        (RelProceeding, T1Expired | Tp | Tn | CancelTimer | Success) => Terminated,
        (RelProceeding, Final) => Completed,
        (RelProceeding, ServiceUnavailable) => Calling,

        (
            Completed,
            T1 | Cancel | CancelTimer | Ack | Provisional | Final | ServiceUnavailable,
        ) => Completed,
        (Completed, Timeout | Tn | Success | IoException) => Terminated,
        _ => return None,
    })
}

fn client_non_invite(state: TransactionState, input: Input) -> Option<TransactionState> {
    Some(match (state, input) {
        (Initial, Start) => Calling,
        (Initial, T1Expired | Tn) => Terminated,

        (Calling, T1 | Cancel | ServiceUnavailable | IoException) => Calling,
        (Calling, T1Expired | Tn | CancelTimer | NoServer) => Terminated,
        (Calling, Provisional) => Proceeding,
        (Calling, Success | Final) => Completed,
        (Calling, NextServer) => Initial,

        (Proceeding, T1 | Cancel | Provisional) => Proceeding,
        (Proceeding, T1Expired | Tn | CancelTimer) => Terminated,
        (Proceeding, Success | Final) => Completed,
        (Proceeding, ServiceUnavailable) => Calling,

        (
            Completed,
            T1 | CancelTimer | Provisional | Success | Final | ServiceUnavailable,
        ) => Completed,
        (Completed, Timeout | Tn) => Terminated,
        _ => return None,
    })
}

fn client_invite_x(state: TransactionState, input: Input) -> Option<TransactionState> {
    Some(match (state, input) {
        (XInitial, Start) => XCompleted,
        (XCompleted, T1 | Tp | Cancel | CancelTimer | Ack | Provisional | Success) => XCompleted,
        (XCompleted, Timeout | Tn | IoException) => XTerminated,
        _ => return None,
    })
}

fn server_invite(state: TransactionState, input: Input) -> Option<TransactionState> {
    Some(match (state, input) {
        (Initial, Start | Cancel) => Calling,
        (Initial, Provisional | TProvisional) => Proceeding,
        (Initial, Success | Tn) => Terminated,
        (Initial, Final) => Completed,
        (Initial, T1) => Initial,
        (Initial, RelProvisional) => WaitPrack,

        (Calling, Request | Cancel | T1) => Calling,
        (Calling, Provisional | TProvisional) => Proceeding,
        (Calling, Success | T1Expired | Tn) => Terminated,
        (Calling, Final) => Completed,
        (Calling, RelProvisional) => WaitPrack,

        (
            Proceeding,
            Request | Provisional | TProvisional | Cancel | T1 | IoException | NextClient,
        ) => Proceeding,
        (Proceeding, Success | T1Expired | Tn | NoClient) => Terminated,
        (Proceeding, Final) => Completed,
        (Proceeding, RelProvisional) => WaitPrack,

        (Completed, Request | Final | Cancel | T1 | IoException | NextClient) => Completed,
        (Completed, T1Expired | Tn | NoClient) => Terminated,
        (Completed, Ack) => Confirmed,

        (Confirmed, Request | Cancel | T1 | Ack | IoException) => Confirmed,
        (Confirmed, Timeout | Tn) => Terminated,

        (WaitPrack, Request | Cancel | T1 | IoException) => WaitPrack,
        (WaitPrack, Success | T1Expired | Tn) => Terminated,
        (WaitPrack, Final) => Completed,
        (WaitPrack, Prack) => RelProceeding,

        (RelProceeding, Request | Cancel | T1 | IoException | NextClient | Prack) => RelProceeding,
        (RelProceeding, Success | T1Expired | Tn | NoClient) => Terminated,
        (RelProceeding, Final) => Completed,
        (RelProceeding, RelProvisional) => WaitPrack,
        _ => return None,
    })
}

fn server_non_invite(state: TransactionState, input: Input) -> Option<TransactionState> {
    Some(match (state, input) {
        (Initial, Start | Cancel) => Calling,
        (Initial, Provisional | TProvisional) => Proceeding,
        (Initial, Success | Final) => Completed,
        (Initial, Tn) => Terminated,

        (Calling, Request | Cancel) => Calling,
        (Calling, Provisional | TProvisional) => Proceeding,
        (Calling, Success | Final) => Completed,
        (Calling, Tn) => Terminated,

        (
            Proceeding,
            Request | Provisional | TProvisional | Cancel | IoException | NextClient,
        ) => Proceeding,
        (Proceeding, Success | Final) => Completed,
        (Proceeding, Tn | NoClient) => Terminated,

        (Completed, Request | Success | Final | Cancel | IoException | NextClient) => Completed,
        (Completed, Timeout | Tn | NoClient) => Terminated,
        _ => return None,
    })
}

fn server_invite_x(state: TransactionState, input: Input) -> Option<TransactionState> {
    Some(match (state, input) {
        (XInitial, Start) => XCompleted,
        (XCompleted, Request | Cancel | T1 | NextClient | Prack) => XCompleted,
        (XCompleted, T1Expired | Tn | IoException | NoClient) => XTerminated,
        (XCompleted, Ack) => XConfirmed,
        (XConfirmed, Request | Cancel | T1 | Ack | IoException | Prack) => XConfirmed,
        (XConfirmed, Timeout | Tn) => XTerminated,
        _ => return None,
    })
}

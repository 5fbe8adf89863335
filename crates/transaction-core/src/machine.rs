//! Per-transaction state holder driving one [`StateTable`].

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::state::{Input, StateTable, TransactionState, Transition};

/// Log target of the transition trace
pub const STATECHANGE_TARGET: &str = "rvoip::statechange";

#[derive(Debug, Clone)]
pub struct StateMachine {
    table: StateTable,
    state: TransactionState,
}

/// A transition that took place
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Change {
    pub from: TransactionState,
    pub to: TransactionState,
}

fn initial_state(table: StateTable) -> TransactionState {
    match table {
        StateTable::ClientInviteX | StateTable::ServerInviteX => TransactionState::XInitial,
        _ => TransactionState::Initial,
    }
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

impl StateMachine {
    pub fn new(table: StateTable) -> Self {
        Self {
            table,
            state: initial_state(table),
        }
    }

    pub fn table(&self) -> StateTable {
        self.table
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Moves to `table` at its initial state
    pub fn switch_table(&mut self, table: StateTable) {
        self.table = table;
        self.state = initial_state(table);
    }

    /// Applies `input`; `None` when the table has no transition for it, in
    /// which case the state is left alone
    pub fn switch_state(&mut self, input: Input, id: &dyn fmt::Display) -> Option<Change> {
        match self.table.next(self.state, input) {
            Transition::To(next) => {
                let from = self.state;
                self.state = next;
                debug!(
                    target: STATECHANGE_TARGET,
                    id = %id,
                    "STATECHANGE {} {} {} {} {}",
                    unix_millis(),
                    self.table,
                    from,
                    input,
                    next
                );
                Some(Change { from, to: next })
            }
            Transition::Undefined => {
                warn!(
                    id = %id,
                    table = %self.table,
                    state = %self.state,
                    input = %input,
                    "Next State is undefined"
                );
                None
            }
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_input_keeps_state() {
        let mut machine = StateMachine::new(StateTable::ServerNonInvite);
        machine.switch_state(Input::Start, &"k").unwrap();
        assert_eq!(machine.state(), TransactionState::Calling);
        assert!(machine.switch_state(Input::Ack, &"k").is_none());
        assert_eq!(machine.state(), TransactionState::Calling);
    }

    #[test]
    fn switching_to_x_table_starts_at_x_initial() {
        let mut machine = StateMachine::new(StateTable::ServerInvite);
        machine.switch_state(Input::Start, &"k");
        let change = machine.switch_state(Input::Success, &"k").unwrap();
        assert_eq!(change.to, TransactionState::Terminated);
        assert!(machine.is_terminated());

        machine.switch_table(StateTable::ServerInviteX);
        assert_eq!(machine.state(), TransactionState::XInitial);
        assert_eq!(
            machine.switch_state(Input::Start, &"k"),
            Some(Change {
                from: TransactionState::XInitial,
                to: TransactionState::XCompleted
            })
        );
        assert!(!machine.is_terminated());
    }
}

use std::io;

use thiserror::Error;

use crate::key::TransactionKey;

/// A type alias for handling `Result`s with `Error` values
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the transaction layer
#[derive(Error, Debug)]
pub enum Error {
    /// Message could not be parsed
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// A header needed to build a transaction key is absent or malformed
    #[error("Missing or malformed header: {0}")]
    MissingHeader(&'static str),

    /// A client transaction with the same key is already in the table
    #[error("Transaction already in table: {0}")]
    DuplicateTransaction(TransactionKey),

    /// The transaction reached a terminal state
    #[error("Transaction terminated: {0}")]
    TransactionTerminated(TransactionKey),

    /// The operation is not valid for this kind of transaction
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Queue helper configuration is invalid
    #[error("Invalid queue configuration: {0}")]
    QueueConfig(String),

    /// Error from the transport layer
    #[error("Transport error: {0}")]
    Transport(#[from] rvoip_sip_transport::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

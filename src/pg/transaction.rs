//! Transaction and savepoint commands.
//!
//! The transport does not report transaction status back synchronously, so
//! the connection keeps its own in-transaction flag. It only flips after the
//! server acknowledged BEGIN, COMMIT or ROLLBACK.

use std::sync::atomic::Ordering;

use tracing::debug;

use super::connection::ConnectionInner;
use super::dialect::Dialect;
use super::transport::Reply;
use crate::error::DriverError;
use crate::executor::QueryResult;

pub const TRANSACTION_EXISTS: &str = "Transaction already exists";
pub const NO_TRANSACTION: &str = "No transaction exists";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionCommand {
    Begin,
    Commit,
    Rollback,
    CreateSavepoint(String),
    RollbackToSavepoint(String),
    ReleaseSavepoint(String),
}

impl TransactionCommand {
    pub fn sql(&self, dialect: &Dialect) -> String {
        match self {
            TransactionCommand::Begin => "BEGIN".to_string(),
            TransactionCommand::Commit => "COMMIT".to_string(),
            TransactionCommand::Rollback => "ROLLBACK".to_string(),
            TransactionCommand::CreateSavepoint(sp) => {
                format!("SAVEPOINT {}", dialect.quote_identifier(sp))
            }
            TransactionCommand::RollbackToSavepoint(sp) => {
                format!("ROLLBACK TO SAVEPOINT {}", dialect.quote_identifier(sp))
            }
            TransactionCommand::ReleaseSavepoint(sp) => {
                format!("RELEASE SAVEPOINT {}", dialect.quote_identifier(sp))
            }
        }
    }

    /// The value the in-transaction flag must have before the command runs.
    pub fn requires_transaction(&self) -> bool {
        !matches!(self, TransactionCommand::Begin)
    }

    /// Whether an acknowledged command flips the in-transaction flag.
    pub fn toggles_flag(&self) -> bool {
        matches!(
            self,
            TransactionCommand::Begin | TransactionCommand::Commit | TransactionCommand::Rollback
        )
    }

    fn failure_message(&self) -> String {
        match self {
            TransactionCommand::Begin => "Failed to start the transaction".to_string(),
            TransactionCommand::Commit => "Failed to commit the transaction".to_string(),
            TransactionCommand::Rollback => "Failed to rollback the transaction".to_string(),
            TransactionCommand::CreateSavepoint(sp) => {
                format!("Failed to create the savepoint {}", sp)
            }
            TransactionCommand::RollbackToSavepoint(sp) => {
                format!("Failed to rollback to the savepoint {}", sp)
            }
            TransactionCommand::ReleaseSavepoint(sp) => {
                format!("Failed to release the savepoint {}", sp)
            }
        }
    }
}

fn precondition_error(in_transaction: bool) -> DriverError {
    let message = if in_transaction {
        TRANSACTION_EXISTS
    } else {
        NO_TRANSACTION
    };
    DriverError::TransactionError(message.to_string())
}

impl ConnectionInner {
    /// Run one transaction command as a full connection operation.
    pub(crate) fn run_transaction(&self, command: &TransactionCommand) -> QueryResult {
        if !self.is_connected() {
            return QueryResult::Error(DriverError::disconnected());
        }

        let required = command.requires_transaction();
        // Checked before claiming the connection so a failed precondition
        // leaves the state untouched.
        let current = self.in_transaction.load(Ordering::Acquire);
        if current != required {
            return QueryResult::Error(precondition_error(current));
        }

        if let Err(e) = self.begin() {
            return QueryResult::Error(e);
        }

        // The flag may have moved while a drain was pending.
        let current = self.in_transaction.load(Ordering::Acquire);
        if current != required {
            self.state.set_idle();
            return QueryResult::Error(precondition_error(current));
        }

        let sql = command.sql(self.dialect);
        let outcome = {
            let mut guard = self.transport.lock();
            match guard.as_mut() {
                None => Err(String::new()),
                Some(transport) => {
                    let reply = match transport.send_command(&sql, &[]) {
                        Ok(()) => transport.next_result(),
                        Err(_) => None,
                    };
                    let outcome = match reply {
                        Some(Reply::CommandOk) => Ok(()),
                        Some(Reply::Error(text)) => Err(text),
                        _ => Err(transport.error_message()),
                    };
                    transport.cancel_or_drain();
                    outcome
                }
            }
        };

        match outcome {
            Ok(()) => {
                if command.toggles_flag() {
                    self.in_transaction.store(!required, Ordering::Release);
                    debug!(command = %sql, in_transaction = !required, "Transaction flag changed");
                }
                self.state.set_idle();
                QueryResult::NoData
            }
            Err(text) => {
                self.state.set_idle();
                debug!(command = %sql, error = %text, "Transaction command failed");
                let mut message = command.failure_message();
                if !text.is_empty() {
                    message.push_str(&format!(" Error: {}.", text));
                }
                QueryResult::Error(DriverError::DatabaseError(message))
            }
        }
    }
}

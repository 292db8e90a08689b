//! Explicit transaction scopes.
//!
//! Persistence units in this crate never rely on an ambient, implicitly
//! propagated transaction. A [`TxScope`] is opened at the entry point of a
//! unit of work and passed down the call chain as a plain parameter, so the
//! atomicity contract of chunk processing is visible at every call site.
//!
//! Completion follows a fixed protocol: commit on normal completion, roll
//! back on failure (unless the failure is explicitly marked as not worth a
//! rollback), and commit on cancellation. Cancelling a unit of work in this
//! system finalizes what was already done rather than discarding it; the
//! next scheduled run resumes from the checkpoint the cancelled run left
//! behind. A scope dropped without [`TxScope::complete`] rolls back.

use sqlx::{Sqlite, SqliteConnection, Transaction};
use thiserror::Error;

use crate::db::Database;

/// How a transactional entry point relates to an open transaction.
///
/// Evaluated once when a scope is entered or checked, never per statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// A transaction must already be open; refuse to proceed otherwise.
    Mandatory,
    /// Always open a fresh transaction.
    RequiresNew,
    /// Run without a transaction.
    NotSupported,
    /// A transaction must not be open; refuse to proceed otherwise.
    Never,
}

/// How a unit of work ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    /// Work finished normally; commit.
    Completed,
    /// Work failed; roll back unless the error was marked non-rollback-worthy.
    Failed { rollback: bool },
    /// Work was cancelled; commit what was done and let the next run resume.
    Cancelled,
}

/// Transaction scope errors.
#[derive(Error, Debug)]
pub enum TxError {
    /// A contract required an open transaction and none was present.
    #[error("operation requires an open transaction but the scope has none")]
    TransactionRequired,

    /// A contract required the absence of a transaction and one was open.
    #[error("operation must not run inside a transaction but the scope has one")]
    TransactionForbidden,

    /// Underlying database failure.
    #[error("transaction error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// A scoped, explicitly passed transaction handle.
///
/// Holds either an open SQLite transaction or nothing, depending on the
/// propagation mode it was entered with.
#[derive(Debug)]
pub struct TxScope {
    tx: Option<Transaction<'static, Sqlite>>,
}

impl TxScope {
    /// Enters a new scope against the database under the given mode.
    ///
    /// `RequiresNew` opens a transaction; `NotSupported` and `Never` produce
    /// a non-transactional scope. `Mandatory` cannot be satisfied here: there
    /// is no ambient transaction to inherit, so entering with `Mandatory` is
    /// itself a contract violation. Use [`TxScope::check`] to assert
    /// `Mandatory` against a scope received as a parameter.
    ///
    /// # Errors
    ///
    /// Returns `TxError::TransactionRequired` for `Mandatory`, or a wrapped
    /// sqlx error if beginning the transaction fails.
    pub async fn enter(db: &Database, mode: Propagation) -> Result<Self, TxError> {
        match mode {
            Propagation::RequiresNew => {
                let tx = db.pool().begin().await?;
                Ok(Self { tx: Some(tx) })
            }
            Propagation::NotSupported | Propagation::Never => Ok(Self { tx: None }),
            Propagation::Mandatory => Err(TxError::TransactionRequired),
        }
    }

    /// Re-evaluates a propagation mode against this scope.
    ///
    /// # Errors
    ///
    /// Returns `TxError::TransactionRequired` when `Mandatory` finds no open
    /// transaction, or `TxError::TransactionForbidden` when `Never` finds one.
    pub fn check(&self, mode: Propagation) -> Result<(), TxError> {
        match mode {
            Propagation::Mandatory if self.tx.is_none() => Err(TxError::TransactionRequired),
            Propagation::Never if self.tx.is_some() => Err(TxError::TransactionForbidden),
            _ => Ok(()),
        }
    }

    /// Whether this scope holds an open transaction.
    #[must_use]
    pub fn is_transactional(&self) -> bool {
        self.tx.is_some()
    }

    /// Borrows the open transaction's connection.
    ///
    /// This is the `Mandatory` assertion: callers whose side effects must be
    /// atomic with the rest of the unit of work obtain their executor here
    /// and nowhere else.
    ///
    /// # Errors
    ///
    /// Returns `TxError::TransactionRequired` if the scope is
    /// non-transactional.
    pub fn transaction(&mut self) -> Result<&mut SqliteConnection, TxError> {
        match self.tx.as_deref_mut() {
            Some(conn) => Ok(conn),
            None => Err(TxError::TransactionRequired),
        }
    }

    /// Finishes the scope according to the completion protocol.
    ///
    /// # Errors
    ///
    /// Returns a wrapped sqlx error if the commit or rollback fails.
    pub async fn complete(self, outcome: UnitOutcome) -> Result<(), TxError> {
        let Some(tx) = self.tx else {
            return Ok(());
        };

        match outcome {
            UnitOutcome::Completed | UnitOutcome::Cancelled => tx.commit().await?,
            UnitOutcome::Failed { rollback: true } => tx.rollback().await?,
            UnitOutcome::Failed { rollback: false } => tx.commit().await?,
        }

        Ok(())
    }
}

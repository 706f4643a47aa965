//! Transaction Executor
//!
//! Runs a caller-supplied unit of work inside one database transaction:
//!
//! ```text
//! begin ──▶ fn(&mut tx) ──Ok──▶ commit
//!                 │
//!                 └──Err──▶ rollback ──Ok──▶ original error
//!                                │
//!                                └──Err──▶ RollbackFailed { source, rollback }
//! ```
//!
//! The transaction owns its connection for the whole unit of work. There is
//! no nesting and no savepoints.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{error, warn};

use super::error::StoreError;
use super::repository::Repository;

/// Commit/rollback half of a transaction handle
#[async_trait]
pub trait TxHandle: Send + Sized {
    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

/// Something that can open ledger transactions
#[async_trait]
pub trait TxBackend: Send + Sync {
    type Tx: Repository + TxHandle + 'static;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    /// Open a transaction whose statements must give up after `deadline`.
    /// Backends that can enforce it server-side override this.
    async fn begin_with_deadline(
        &self,
        _deadline: Option<Duration>,
    ) -> Result<Self::Tx, StoreError> {
        self.begin().await
    }
}

/// Execute `f` atomically against `backend`.
///
/// With a `deadline`, the unit of work is abandoned once it expires: its
/// future is dropped, the transaction rolled back and
/// [`StoreError::Cancelled`] returned. The deadline also goes to
/// [`TxBackend::begin_with_deadline`], so a statement stuck on the server
/// (e.g. waiting for a row lock) is cancelled there too and cannot hold up
/// the rollback. Dropping the returned future early
/// also discards the transaction without committing.
pub async fn exec_tx<B, T, F>(
    backend: &B,
    deadline: Option<Duration>,
    f: F,
) -> Result<T, StoreError>
where
    B: TxBackend + ?Sized,
    T: Send,
    F: for<'c> FnOnce(&'c mut B::Tx) -> BoxFuture<'c, Result<T, StoreError>> + Send,
{
    let mut tx = backend.begin_with_deadline(deadline).await?;

    let outcome = {
        let work = f(&mut tx);
        match deadline {
            Some(limit) => tokio::time::timeout(limit, work)
                .await
                .unwrap_or_else(|_elapsed| {
                    warn!(deadline_ms = limit.as_millis() as u64, "Unit of work timed out");
                    Err(StoreError::Cancelled)
                }),
            None => work.await,
        }
    };

    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => match tx.rollback().await {
            Ok(()) => Err(err),
            Err(rb_err) => {
                error!(
                    error = %err,
                    rollback_error = %rb_err,
                    "Rollback failed - transaction outcome unknown"
                );
                Err(StoreError::RollbackFailed {
                    source: Box::new(err),
                    rollback: Box::new(rb_err),
                })
            }
        },
    }
}

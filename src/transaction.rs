//! Ambient transaction detection.
//!
//! A retrying executor must not re-run work that belongs to a caller-managed transaction:
//! replaying only the failed statement would commit a partial unit of work. Callers that open
//! transactions mark the current thread with [`TransactionScope::enter`]; the default probe
//! reads that mark.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static SCOPE_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Answers whether the calling context is inside a caller-managed transaction.
pub trait TransactionProbe: Send + Sync {
    fn in_transaction(&self) -> bool;
}

/// Probe backed by [`TransactionScope`] guards on the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScopedTransactions;

impl TransactionProbe for ScopedTransactions {
    fn in_transaction(&self) -> bool {
        SCOPE_DEPTH.with(|depth| depth.get() > 0)
    }
}

/// Probe for stores without ambient transactions.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTransactions;

impl TransactionProbe for NoTransactions {
    fn in_transaction(&self) -> bool {
        false
    }
}

/// RAII marker for an ambient transaction on the current thread. Scopes nest.
///
/// The guard is `!Send`: the mark belongs to the thread that entered it.
#[derive(Debug)]
pub struct TransactionScope {
    _not_send: PhantomData<*const ()>,
}

impl TransactionScope {
    pub fn enter() -> Self {
        SCOPE_DEPTH.with(|depth| depth.set(depth.get().saturating_add(1)));
        Self { _not_send: PhantomData }
    }

    /// Whether any scope is open on the current thread.
    pub fn is_active() -> bool {
        ScopedTransactions.in_transaction()
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        SCOPE_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_nest_and_unwind() {
        assert!(!TransactionScope::is_active());
        let outer = TransactionScope::enter();
        {
            let _inner = TransactionScope::enter();
            assert!(ScopedTransactions.in_transaction());
        }
        assert!(ScopedTransactions.in_transaction());
        drop(outer);
        assert!(!ScopedTransactions.in_transaction());
    }

    #[test]
    fn scope_is_thread_local() {
        let _scope = TransactionScope::enter();
        let seen = std::thread::spawn(|| ScopedTransactions.in_transaction()).join().unwrap();
        assert!(!seen);
    }

    #[test]
    fn no_transactions_ignores_scopes() {
        let _scope = TransactionScope::enter();
        assert!(!NoTransactions.in_transaction());
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag shared between a caller and a long-running
/// operation. Cloning yields a handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> CancellationToken {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

pub(crate) fn is_cancelled(token: Option<&CancellationToken>) -> bool {
    token.map_or(false, CancellationToken::is_cancelled)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion<T> {
    Complete(T),
    Cancelled(T),
}

impl<T> Completion<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Completion::Cancelled(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Completion::Complete(value) | Completion::Cancelled(value) => value,
        }
    }

    pub fn map<U, M: FnOnce(T) -> U>(self, mapper: M) -> Completion<U> {
        match self {
            Completion::Complete(value) => Completion::Complete(mapper(value)),
            Completion::Cancelled(value) => Completion::Cancelled(mapper(value)),
        }
    }
}

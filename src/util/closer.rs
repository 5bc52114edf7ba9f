use std::{
    ops::Deref,
    sync::{atomic, Arc},
};

use tokio::sync::Notify;

use super::MEM_ORDERING;

/// A cancellation signal. Clones share the same state, so one side can hand
/// a clone to an operation and raise the signal later.
#[derive(Debug, Clone, Default)]
pub struct Closer(Arc<CloserInner>);

#[derive(Debug, Default)]
pub struct CloserInner {
    signalled: atomic::AtomicBool,
    notify: Notify,
}

impl Deref for Closer {
    type Target = CloserInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Closer {
    pub fn new() -> Closer {
        Closer::default()
    }

    pub fn signal(&self) {
        self.signalled.store(true, MEM_ORDERING);
        self.notify.notify_waiters();
    }

    pub fn is_signalled(&self) -> bool {
        self.signalled.load(MEM_ORDERING)
    }

    /// Resolves once `signal` has been called.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_signalled() {
                return;
            }
            notified.await;
        }
    }
}

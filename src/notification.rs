//! One-shot completion signals used by the resource manager to tell a
//! control thread "your async load finished" (or failed), without the
//! control thread needing to poll.

use std::sync::{Condvar, Mutex};

/// Signal codes delivered to a notification callback.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NotificationCode {
    Complete,
    Failed,
}

/// Pluggable completion callback. Implementations must be cheap and
/// non-blocking (they may run on a resource manager worker thread).
pub trait AsyncNotification: Send + Sync {
    fn on_signal(&self, code: NotificationCode);
}

/// A blocking, condvar-backed one-shot event. The default `AsyncNotification`
/// used when a caller wants to wait synchronously (e.g. `WaitInit`).
pub struct NotificationEvent {
    state: Mutex<Option<NotificationCode>>,
    condvar: Condvar,
}

impl NotificationEvent {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
            condvar: Condvar::new(),
        }
    }

    /// Block until signaled, returning the code that was delivered.
    pub fn wait(&self) -> NotificationCode {
        let mut guard = self.state.lock().unwrap();
        while guard.is_none() {
            guard = self.condvar.wait(guard).unwrap();
        }
        guard.unwrap()
    }

    pub fn is_signaled(&self) -> bool {
        self.state.lock().unwrap().is_some()
    }
}

impl Default for NotificationEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncNotification for NotificationEvent {
    fn on_signal(&self, code: NotificationCode) {
        let mut guard = self.state.lock().unwrap();
        *guard = Some(code);
        self.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn waiter_unblocks_after_signal() {
        let event = Arc::new(NotificationEvent::new());
        let signaler = Arc::clone(&event);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            signaler.on_signal(NotificationCode::Complete);
        });
        assert_eq!(event.wait(), NotificationCode::Complete);
        handle.join().unwrap();
    }

    #[test]
    fn already_signaled_does_not_block() {
        let event = NotificationEvent::new();
        event.on_signal(NotificationCode::Failed);
        assert_eq!(event.wait(), NotificationCode::Failed);
    }
}

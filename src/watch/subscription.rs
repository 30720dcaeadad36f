//! Subscription Handle
//!
//! The caller's side of a watch: a future resolving to the first revision
//! after the caller's cursor that touches a matching path.

use std::future::Future;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{CacheError, Result};
use crate::watch::service::Shared;
use crate::watch::Revision;

#[derive(Debug)]
enum State {
    /// A matching change was already committed when subscribing.
    Ready(Revision),
    /// Registered; waiting for notify, timeout or cancel.
    Pending(oneshot::Receiver<Result<Revision>>),
    Done,
}

// == Subscription ==
/// Handle for one watch.
///
/// Awaiting it yields the changed revision, `WatchTimeout` when nothing
/// changed in time, or `WatchCancelled`. Dropping an unresolved subscription
/// removes it from the registry.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    pattern: String,
    state: State,
    service: Weak<Shared>,
}

impl Subscription {
    pub(crate) fn ready(pattern: &str, revision: Revision) -> Self {
        Self {
            id: 0,
            pattern: pattern.to_string(),
            state: State::Ready(revision),
            service: Weak::new(),
        }
    }

    pub(crate) fn pending(
        id: u64,
        pattern: &str,
        rx: oneshot::Receiver<Result<Revision>>,
        service: Weak<Shared>,
    ) -> Self {
        Self {
            id,
            pattern: pattern.to_string(),
            state: State::Pending(rx),
            service,
        }
    }

    /// Registry id, 0 for subscriptions that resolved immediately.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// True when the subscription resolved without registering.
    pub fn is_immediate(&self) -> bool {
        matches!(self.state, State::Ready(_))
    }

    // == Cancel ==
    /// Withdraws the watch.
    ///
    /// Returns true if it was still registered, false if it had already
    /// resolved.
    pub fn cancel(mut self) -> bool {
        self.deregister()
    }

    fn deregister(&mut self) -> bool {
        if !matches!(self.state, State::Pending(_)) {
            return false;
        }
        self.state = State::Done;
        match self.service.upgrade() {
            Some(service) => service.cancel(&self.pattern, self.id),
            None => false,
        }
    }
}

impl Future for Subscription {
    type Output = Result<Revision>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let outcome = match &mut this.state {
            State::Ready(revision) => Ok(*revision),
            State::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(received) => received.unwrap_or(Err(CacheError::WatchCancelled)),
                Poll::Pending => return Poll::Pending,
            },
            State::Done => Err(CacheError::WatchCancelled),
        };
        this.state = State::Done;
        Poll::Ready(outcome)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.deregister();
    }
}

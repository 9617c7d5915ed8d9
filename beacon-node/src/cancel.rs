//! Cooperative cancellation of session tasks.

use tokio::sync::watch;

/// The cancelling side. Dropping it cancels too.
#[derive(Debug)]
pub struct CancelSource {
    flag: watch::Sender<bool>,
}

/// The cancelled side, checked by a session at every suspension point.
#[derive(Clone, Debug)]
pub struct CancelToken {
    flag: watch::Receiver<bool>,
}

/// A connected source and token.
pub fn cancel_pair() -> (CancelSource, CancelToken) {
    let (flag, observed) = watch::channel(false);
    (CancelSource { flag }, CancelToken { flag: observed })
}

impl CancelSource {
    /// Cancel every token of this source.
    pub fn cancel(&self) {
        self.flag.send_replace(true);
    }

    /// Another token of this source.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            flag: self.flag.subscribe(),
        }
    }
}

impl CancelToken {
    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        *self.flag.borrow() || self.flag.has_changed().is_err()
    }

    /// Resolves once cancellation is requested or the source is gone.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.flag.borrow_and_update() {
                return;
            }
            if self.flag.changed().await.is_err() {
                return;
            }
        }
    }
}

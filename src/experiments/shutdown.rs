//! Operator stop signal.
//!
//! Once raised the signal stays raised, so listeners created afterwards
//! observe it too.

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct StopHandle {
    sender: watch::Sender<bool>,
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StopHandle {
    pub fn new() -> Self {
        Self {
            sender: watch::channel(false).0,
        }
    }

    pub fn stop(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn listener(&self) -> StopListener {
        StopListener {
            receiver: self.sender.subscribe(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StopListener {
    receiver: watch::Receiver<bool>,
}

impl StopListener {
    /// Point in time check.
    pub fn is_stopped(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once the stop signal is raised. Safe to race against other
    /// work; never resolves if every handle is dropped unstopped.
    pub async fn stopped(&mut self) {
        if self.receiver.wait_for(|stopped| *stopped).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Raise `handle` on Ctrl-C.
pub fn spawn_ctrl_c_listener(handle: StopHandle) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                log::warn!("received interrupt, finishing in-flight attempts");
                handle.stop();
            }
            Err(err) => log::error!("failed to listen for Ctrl-C: {err}"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn listeners_see_stop_raised_before_and_after_subscription() {
        let handle = StopHandle::new();
        let mut early = handle.listener();
        assert!(!early.is_stopped());

        let waiter = tokio::spawn(async move {
            early.stopped().await;
        });
        handle.stop();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();

        let mut late = handle.listener();
        assert!(late.is_stopped());
        late.stopped().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_handle_never_stops() {
        let mut listener = StopHandle::new().listener();
        let waited = tokio::time::timeout(Duration::from_secs(60), listener.stopped()).await;
        assert!(waited.is_err());
    }
}

use std::{sync::Arc, time::Duration};

use protocol::message::Message;
use tokio::{
    sync::{mpsc, oneshot, Notify},
    task::JoinHandle,
    time::sleep,
};
use tracing::trace;

/// Handle used by the writer task to push the keep-alive deadline back after a send.
#[derive(Debug, Clone, Default)]
pub struct KeepAliveTimer {
    reset: Arc<Notify>,
}

impl KeepAliveTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.reset.notify_one();
    }
}

/// Per-link background task that queues a KeepAlive after `interval` without outbound
/// traffic.
#[derive(Debug)]
pub struct KeepAliveScheduler {
    timer: KeepAliveTimer,
    stop_tx: Option<oneshot::Sender<()>>,
    _handle: JoinHandle<()>,
}

impl KeepAliveScheduler {
    pub fn start(
        interval: Duration,
        timer: KeepAliveTimer,
        out_tx: mpsc::UnboundedSender<Message>,
    ) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let reset = timer.reset.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = reset.notified() => continue,
                    _ = sleep(interval) => {
                        trace!("Connection idle, queueing keep-alive");
                        if out_tx.send(Message::KeepAlive).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            timer,
            stop_tx: Some(stop_tx),
            _handle: handle,
        }
    }

    pub fn reset(&self) {
        self.timer.reset();
    }

    /// Stops the task. Returns false if it was already stopped.
    pub fn stop(&mut self) -> bool {
        match self.stop_tx.take() {
            Some(stop_tx) => {
                let _ = stop_tx.send(());
                true
            }
            None => false,
        }
    }
}

impl Drop for KeepAliveScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

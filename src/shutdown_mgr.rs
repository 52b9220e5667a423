use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

/// Process-wide stop signal. Every clone observes a shutdown triggered through any other.
#[derive(Debug)]
pub struct ShutdownManager {
    triggered: Arc<AtomicBool>,
    receiver: broadcast::Receiver<()>,
    sender: broadcast::Sender<()>,
}

impl ShutdownManager {
    pub fn new() -> ShutdownManager {
        let (sender, receiver) = broadcast::channel(16);
        ShutdownManager {
            triggered: Arc::new(AtomicBool::new(false)),
            receiver,
            sender,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown has been triggered, immediately if it already was.
    pub async fn recv(&mut self) {
        if self.is_shutdown() {
            return;
        }
        // Lagged or closed both mean the signal went out.
        let _ = self.receiver.recv().await;
    }

    pub fn send(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        let _ = self.sender.send(());
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        ShutdownManager::new()
    }
}

impl Clone for ShutdownManager {
    fn clone(&self) -> ShutdownManager {
        ShutdownManager {
            triggered: self.triggered.clone(),
            receiver: self.sender.subscribe(),
            sender: self.sender.clone(),
        }
    }
}

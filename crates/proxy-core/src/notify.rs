use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A notable pool event worth surfacing to an operator (auto-pause, rotation,
/// credential deactivation). Delivery transport (webhook POST, dashboard push)
/// is an external collaborator; this crate only defines the event shape and
/// an in-process sink implementers can fan out from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub credential_id: String,
    pub kind: String,
    pub message: String,
    pub at: i64,
}

/// Sink for pool/account notifications. The real webhook delivery transport
/// lives outside this crate (out of scope per the proxy's purpose); anything
/// implementing this trait can be wired in as the sink, including one that
/// posts to a webhook URL.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Default sink used when no webhook is configured: keeps the last N
/// notifications in memory, mirroring the `webhook-history.json` cap of 100
/// entries without actually delivering anything.
pub struct InMemoryNotifier {
    history: Mutex<Vec<Notification>>,
    capacity: usize,
}

impl InMemoryNotifier {
    pub fn new(capacity: usize) -> Self {
        InMemoryNotifier {
            history: Mutex::new(Vec::new()),
            capacity,
        }
    }

    pub fn history(&self) -> Vec<Notification> {
        self.history.lock().unwrap().clone()
    }
}

impl Default for InMemoryNotifier {
    fn default() -> Self {
        Self::new(100)
    }
}

#[async_trait]
impl NotificationSink for InMemoryNotifier {
    async fn notify(&self, notification: Notification) {
        let mut history = self.history.lock().unwrap();
        history.push(notification);
        if history.len() > self.capacity {
            let overflow = history.len() - self.capacity;
            history.drain(0..overflow);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_notifier_caps_history() {
        let sink = InMemoryNotifier::new(2);
        for i in 0..5 {
            sink.notify(Notification {
                credential_id: format!("cred-{i}"),
                kind: "quota_pause".into(),
                message: "paused".into(),
                at: i,
            })
            .await;
        }
        let hist = sink.history();
        assert_eq!(hist.len(), 2);
        assert_eq!(hist[0].credential_id, "cred-3");
        assert_eq!(hist[1].credential_id, "cred-4");
    }
}

pub mod config;
pub mod credential;
pub mod error;
pub mod message;
pub mod notify;

pub use config::Config;
pub use credential::{CredentialRecord, ErrorKind, PauseReason, QuotaBucket, QuotaSnapshot};
pub use error::ProxyError;
pub use message::{Content, FunctionCall, ImageUrl, Message, Part, Role, ToolCall};
pub use notify::{InMemoryNotifier, Notification, NotificationSink};

/// Current unix timestamp in seconds. Centralized so every module gets its
/// notion of "now" from one place (easy to fake in tests that need it).
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

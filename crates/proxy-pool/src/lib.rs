pub mod pool;
pub mod quota;
pub mod store;
pub mod token;

pub use pool::AccountPool;
pub use quota::QuotaTracker;
pub use store::{ConfigMirror, CredentialStore, NullConfigMirror, PoolState, StoreError};
pub use token::{ensure_fresh_token, SESSION_TOKEN_SAFETY_MARGIN_SECS};

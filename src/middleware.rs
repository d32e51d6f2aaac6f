mod sign;
mod verify;

use std::sync::Arc;

use chrono::{DateTime, Utc};

pub use sign::Signer;
pub use verify::{REJECTION_BODY, Verifier};

/// Default cap on request bodies buffered for hashing.
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Source of the current time. Replaceable so tests can sign in the past.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

//! Credential rotation and quota limiting for the Geonames web services
//!
//! Geonames meters every account (username) separately: a free account gets
//! roughly 1000 credits per hour and 20000 per day. This crate spreads calls
//! across a pool of accounts, keeps each one under its ceilings, keeps the
//! pool as a whole under an aggregate ceiling, and takes accounts out of
//! rotation when the provider says they are rejected or out of credits.
//!
//! Credential lifecycle:
//! 1. Credential loaded from config or added via admin API → `Active`
//! 2. Pool selects credential round-robin → one unit reserved, lease returned
//! 3. Credential reaches a configured ceiling → `Exhausted` until the window resets
//! 4. Provider reports quota exhaustion (codes 18/19/20) → `Exhausted`
//! 5. Provider rejects the account repeatedly (code 10, 401/403) → `Suspended`
//! 6. Reset time passes → `Active` again on the next selection
//! 7. Admin reinstates a suspended credential → `Active`
//!
//! Usage is counted in fixed windows (second, minute, hour, day) aligned to
//! the Unix epoch, against an injectable `Clock`.

pub mod classify;
pub mod clock;
pub mod credential;
pub mod error;
pub mod lease;
pub mod limiter;
pub mod limits;
pub mod monitor;
pub mod pool;
pub mod window;

pub use classify::{Outcome, ProviderFailure, classify_body, classify_status};
pub use clock::{Clock, ManualClock, SystemClock};
pub use credential::{Credential, CredentialStatus};
pub use error::{Error, Result};
pub use lease::CredentialLease;
pub use limiter::RateLimiter;
pub use limits::Ceilings;
pub use monitor::{
    RateLimitDecision, Scope, ScopeSnapshot, UsageMonitor, UsageSnapshot, WindowSnapshot,
};
pub use pool::{CredentialSnapshot, Pool, PoolConfig, PoolHealth, PoolSnapshot};
pub use window::Window;

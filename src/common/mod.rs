//! Common utilities shared by the session components.
//!
//! Time, retry and teardown are abstracted here so every component can be
//! driven deterministically from tests.

pub mod clock;
pub mod retry;
pub mod shutdown;

pub use clock::{Clock, ManualClock, SystemClock};
pub use retry::{with_backoff, BackoffPolicy, BackoffStrategy};
pub use shutdown::{Shutdown, ShutdownSignal};

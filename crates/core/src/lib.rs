//! Shared primitives for the coordination core: hierarchical paths,
//! opaque session identifiers, the error taxonomy, an injectable clock,
//! cooperative cancellation, and tunable configuration.
//!
//! Everything above storage and coordination logic lives here so that
//! `ensemble-storage` and `ensemble-coordination` can both depend on one
//! small, dependency-light crate instead of each other.

pub mod cancellation;
pub mod clock;
pub mod config;
pub mod error;
pub mod path;
pub mod session_id;

pub use cancellation::CancellationToken;
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::CoordConfig;
pub use error::{CoordError, Result};
pub use path::{Path, Segment};
pub use session_id::{SessionId, SessionProvider};

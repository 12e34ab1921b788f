//! Session management, caching, lock-wait registries, cross-process lock
//! release broadcast, the wait manager, the lock manager, and the public
//! coordination facade.

pub mod cache;
pub mod exchange;
pub mod lock_manager;
pub mod manager;
pub mod session;
pub mod session_owner;
pub mod sweeper;
pub mod wait_directory;
pub mod wait_manager;

pub use cache::{Cache, CacheEntry, CacheSnapshot};
pub use exchange::{ExchangeManager, LocalTransport, NotificationTransport, ReleaseKind};
pub use lock_manager::LockManager;
pub use manager::CoordinationManager;
pub use session::SessionManager;
pub use session_owner::SessionOwner;
pub use sweeper::EphemeralSweeper;
pub use wait_directory::{LockKind, LockWaitDirectory};
pub use wait_manager::WaitManager;

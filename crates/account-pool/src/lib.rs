//! Account pool engine
//!
//! Maintains a bounded pool of externally-issued credentials: accounts are
//! registered through an identity workflow, leased out race-free, renewed
//! ahead of expiry under a per-account rate floor, and retired after
//! repeated failures. All state lives in a crash-consistent JSON store;
//! the [`pool::Pool`] coordinator owns every transition.

pub mod account;
pub mod error;
pub mod pool;
pub mod refresh;
pub mod refresher;
pub mod registrar;
pub mod replenish;
pub mod store;

#[cfg(test)]
mod testing;

pub use account::{Account, AccountStatus, LeasedCredential, PoolSnapshot};
pub use error::{Error, Result};
pub use pool::{AllocationPolicy, Pool, PoolConfig, RefreshJob};
pub use refresh::{run_refresh_cycle, spawn_refresh_task};
pub use refresher::{HttpRefresher, RefreshError, Refreshed, Refresher};
pub use registrar::{IdentitySource, Registered, Registrar, RegistrationError, WarpRegistrar};
pub use replenish::{ReplenishConfig, run_replenish_cycle, spawn_replenish_task};
pub use store::AccountStore;

//! ironcore-net allocators
//!
//! Strongly-serialized allocators whose state lives entirely in the
//! internal store:
//!
//! - [`VniAllocator`]: network identifiers backed by `NetworkID` leaves
//! - [`IPAddressAllocator`]: public-prefix addresses backed by `IPAddress`
//!   leaves
//! - [`IPAllocator`]: namespaced `IP` records, reserved or ephemeral
//! - [`Allocators`]: facade running the above as a two-phase transaction
//!   for objects requesting public IPs
//!
//! Collisions between concurrent allocators are resolved by the store:
//! whoever creates the leaf first wins, the loser moves on to the next
//! candidate.

pub mod allocators;
pub mod error;
pub mod ip;
pub mod ipaddress;
pub mod retry;
pub mod vni;

pub use allocators::{Allocators, IPRequester, Transaction};
pub use error::AllocationError;
pub use ip::{IPAllocator, IPClaimer};
pub use ipaddress::IPAddressAllocator;
pub use retry::{RetryConfig, retry_with_backoff};
pub use vni::VniAllocator;

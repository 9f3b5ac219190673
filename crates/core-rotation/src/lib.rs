//! IPv6 rotation engine.
//!
//! Every intercepted connection to the protected upstream host gets a fresh
//! source address drawn from a local [`Subnet`] and a destination drawn from a
//! hot-reloadable [`DestinationPool`]. Everything else is dialed untouched.
//!
//! # Architecture
//!
//! - [`RefreshScheduler`] periodically asks a [`ListSource`] (normally a
//!   [`ListFetcher`]) for a validated [`DestinationSet`] and swaps it into the pool.
//! - [`RotatingDialer`] is the [`DialHook`] handed to the forwarding layer. It reads
//!   the subnet and the pool on every dial and falls back to DNS over IPv6 while the
//!   pool is empty.
//!
//! The pool is the only shared mutable state; it is owned by the caller and shared
//! through an `Arc`.

pub mod detect;
pub mod dialer;
pub mod fetch;
pub mod pool;
pub mod refresh;
pub mod subnet;

pub use detect::detect_local_subnet;
pub use dialer::{
    ConnectionAttempt, Destination, DialError, DialHook, DialerConfig, RotatingDialer,
};
pub use fetch::{FetchError, ListFetcher, ListSource};
pub use pool::{DestinationPicker, DestinationPool, DestinationSet};
pub use refresh::RefreshScheduler;
pub use subnet::{generate_in, SourceAddressGenerator, Subnet, SubnetError};

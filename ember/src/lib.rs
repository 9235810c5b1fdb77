//! Ember kernel services.
//!
//! The two subsystems that do the heavy lifting live here: the network
//! interface's interrupt-driven receive path ([`net`]) and the program
//! image loader ([`loader`]). Both are written against narrow traits for
//! their collaborators (allocators, the page mapper, the filesystem, the
//! link layer) so the protocol logic runs unchanged against simulated
//! hardware.

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

extern crate alloc;

#[allow(unused_imports)]
#[macro_use]
extern crate cinder;

pub mod fs;
pub mod interrupt;
pub mod loader;
pub mod mm;
pub mod net;
mod panicking;

pub use uni_lock::{UniLock, UniLockGuard};

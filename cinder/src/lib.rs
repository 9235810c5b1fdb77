//! Hardware access for the Ember kernel.
//!
//! Register-level device communication: port-mapped io, PCI configuration
//! space, the serial console behind the kernel print macros, and the
//! privilege-switch primitives. Core kernel code talks to hardware only
//! through the traits defined here so it stays runnable without a device.

#![cfg_attr(not(test), no_std)]

#[macro_use]
pub mod kprint;
pub mod addressing;
pub mod dev;
pub mod x86_64;

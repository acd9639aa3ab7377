//! QMP (QEMU Machine Protocol) support.
//!
//! QMP is a newline-delimited JSON protocol served on the hypervisor's
//! control socket. The peer sends a one-shot greeting, accepts commands
//! only after `qmp_capabilities` negotiation, answers every command with
//! exactly one reply in submission order, and may interleave asynchronous
//! events at any point after the greeting.

mod client;
mod wire;

pub use client::QmpClient;
pub use wire::{QmpCommand, QmpError, QmpEvent, QmpGreeting, QmpResponse, QueryStatus};

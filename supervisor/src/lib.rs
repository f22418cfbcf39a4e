//! Host-side supervisor for transparent Tor routing.
//!
//! Brings up an isolated Tor VM, captures and diverts the host network
//! configuration through it, watches the VM over its management socket,
//! and restores the host on every exit path. A failsafe blocks unprotected
//! egress whenever the VM is not serving traffic.

pub mod config;
pub mod error;
pub mod failsafe;
pub mod hypervisor;
pub mod lifecycle;
pub mod netadapter;
pub mod qmp;
pub mod ringlog;
pub mod torrc;

pub use config::Config;
pub use error::SupervisorError;
pub use lifecycle::{LifecycleEngine, LifecycleState, Timings};

//! embervm - Firecracker microVMs from the command line.
//!
//! This library drives the lifecycle of small Linux guests: it assigns each
//! VM a network identity, provisions its disks and TAP device, supervises
//! the hypervisor process and reconciles recorded state with the host.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                  lifecycle::Controller           │
//! │  init ─ build ─ up/console ─ down ─ destroy      │
//! └──────┬──────────┬───────────┬───────────┬────────┘
//!        │          │           │           │
//!   state::      network::   process::   rootfs::
//!   StateStore   HostNetwork Supervisor  ImageBuilder
//!   (records,    (tap, rules,(launch,    (base image,
//!    locks)       audit)      ssh, stop)  volume)
//! ```
//!
//! Every host interaction sits behind a trait so the lifecycle can be
//! exercised without root, KVM or a guest image.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod hypervisor;
pub mod lifecycle;
pub mod network;
pub mod privilege;
pub mod process;
pub mod rootfs;
pub mod state;
pub mod storage;

pub use config::EmbervmConfig;
pub use error::{Error, Result};
pub use lifecycle::{Controller, DestroyOutcome, VmInfo, VmStatus};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

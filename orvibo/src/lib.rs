//! Session layer for Orvibo S20 smart plugs.
//!
//! This crate drives the wire protocol implemented in `orvibo-core`: it owns
//! the one UDP socket a session is allowed (the plug only replies to the fixed
//! protocol port), performs the subscribe handshake, and exposes power on/off
//! as synchronous operations that return a structured [SwitchReport].
//!
//! A session is single-threaded and fully synchronous.  Because the local
//! port is fixed, two concurrent sessions on one host will contend for the
//! bind; serializing sessions is the caller's responsibility.
//!
//! ```no_run
//! use orvibo::{ControllerConfig, DeviceController, NoopScheduler};
//! use std::net::SocketAddr;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut ctl = DeviceController::new(NoopScheduler, ControllerConfig::default())?;
//! let addr: SocketAddr = "192.168.1.40:10000".parse()?;
//! let report = ctl.power_on(addr, "ac:cf:23:00:11:22".parse()?, 30)?;
//! println!("acknowledged: {}", report.acknowledged);
//! # Ok(())
//! # }
//! ```

pub mod controller;
pub mod scheduler;
pub mod subscription;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use controller::{
    CancelHandle, ControllerConfig, DeviceController, DiscoveredPlug, PowerState, SwitchReport,
};
pub use orvibo_core::{MacAddress, SocCode, MAGIC, PORT};
pub use scheduler::{AutoOffScheduler, NoopScheduler, SchedulerError};
pub use subscription::{SubscribeError, Subscription, SubscriptionManager};
pub use transport::Transport;

use thiserror::Error;

/// Errors that abort a session operation outright.
///
/// Protocol-level trouble (timeouts, malformed frames, failed handshakes) is
/// soft and surfaces through [SwitchReport::warnings] instead; this type is
/// reserved for the socket itself going wrong.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] orvibo_core::Error),
}

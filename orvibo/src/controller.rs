//! Power operations against one plug.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use orvibo_core::{decode, Command, MacAddress, Message, SocCode};
use tracing::{debug, warn};

use crate::scheduler::AutoOffScheduler;
use crate::subscription::SubscriptionManager;
use crate::transport::Transport;
use crate::Error;

/// Default deadline for a power acknowledgment.
///
/// The plug answers in milliseconds when it answers at all, so this is
/// generous.  There is deliberately no "wait forever" mode for acks: a stuck
/// plug must not wedge the host.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Receive slice used while polling for cancellation during an ack wait.
const POLL_SLICE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Trigger-rule identifier the external scheduler is expected to confirm
    /// when arming the auto-off.  `None` skips the check.
    pub expected_rule: Option<String>,
    /// How long to wait for a power acknowledgment.
    pub ack_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> ControllerConfig {
        ControllerConfig {
            expected_rule: None,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }
}

/// Relay state as established by the last acknowledged command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
    /// No acknowledgment arrived, so the relay may or may not have switched.
    Unknown,
}

/// Outcome of a power operation.
///
/// Soft failures (handshake trouble, reserved-byte oddities, scheduler
/// mismatches) accumulate in `warnings`; none of them abort the operation.
#[derive(Debug)]
pub struct SwitchReport {
    pub acknowledged: bool,
    pub state: PowerState,
    /// Neighbor count the plug reported in its ack.  Best-effort diagnostic,
    /// not a verified part of the contract.
    pub peer_count: Option<u8>,
    pub warnings: Vec<String>,
}

/// A plug that answered a discovery broadcast.
#[derive(Debug, Clone)]
pub struct DiscoveredPlug {
    pub addr: SocketAddr,
    pub mac: MacAddress,
    pub soc: SocCode,
    pub timer_seconds: u32,
    /// 1 when the relay is on, 0 when off.
    pub state: u8,
}

/// Cooperative stop signal for an in-flight acknowledgment wait.
///
/// Cloneable and cheap; flip it from another thread to make the controller
/// give up on the current wait at the next poll slice.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Synchronous controller for one plug session.
///
/// Owns the session's transport and subscription for its whole lifetime; the
/// socket is released when the controller drops, on every exit path.
pub struct DeviceController<S> {
    transport: Transport,
    subscription: SubscriptionManager,
    scheduler: S,
    config: ControllerConfig,
    cancel: CancelHandle,
}

impl<S: AutoOffScheduler> DeviceController<S> {
    /// Binds the fixed protocol port and builds a controller around it.
    pub fn new(scheduler: S, config: ControllerConfig) -> Result<DeviceController<S>, Error> {
        Ok(DeviceController::with_transport(
            Transport::bind()?,
            scheduler,
            config,
        ))
    }

    /// Builds a controller around an existing transport.  Used by tests to
    /// run on an ephemeral port.
    pub fn with_transport(
        transport: Transport,
        scheduler: S,
        config: ControllerConfig,
    ) -> DeviceController<S> {
        DeviceController {
            transport,
            subscription: SubscriptionManager::new(),
            scheduler,
            config,
            cancel: CancelHandle::default(),
        }
    }

    /// A handle that can interrupt this controller's ack waits from another
    /// thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Switches the plug on.
    ///
    /// With `duration_minutes > 0` and an acknowledged switch, asks the
    /// scheduler to arm a delayed power-off.  A scheduler identifier that
    /// does not match the configured expectation degrades the report with a
    /// warning; the power change itself still counts as successful.
    pub fn power_on(
        &mut self,
        addr: SocketAddr,
        mac: MacAddress,
        duration_minutes: u32,
    ) -> Result<SwitchReport, Error> {
        let mut report = self.switch(addr, mac, true)?;
        if report.acknowledged && duration_minutes > 0 {
            match self.scheduler.arm(duration_minutes) {
                Ok(rule) => {
                    if let Some(expected) = &self.config.expected_rule {
                        if &rule != expected {
                            warn!(%rule, %expected, "auto-off trigger confirmation mismatch");
                            report.warnings.push(format!(
                                "auto-off trigger confirmation mismatch: got {rule:?}, expected {expected:?}"
                            ));
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to arm auto-off trigger");
                    report.warnings.push(format!("failed to arm auto-off trigger: {e}"));
                }
            }
        }
        Ok(report)
    }

    /// Switches the plug off and unconditionally disarms any pending
    /// auto-off trigger (disarming an idle scheduler is a no-op).
    pub fn power_off(&mut self, addr: SocketAddr, mac: MacAddress) -> Result<SwitchReport, Error> {
        let mut report = self.switch(addr, mac, false)?;
        if report.acknowledged {
            if let Err(e) = self.scheduler.disarm() {
                warn!(error = %e, "failed to disarm auto-off trigger");
                report.warnings.push(format!("failed to disarm auto-off trigger: {e}"));
            }
        }
        Ok(report)
    }

    /// Broadcasts a discovery probe and collects every plug that answers
    /// within `wait`.
    pub fn discover(&mut self, wait: Duration) -> Result<Vec<DiscoveredPlug>, Error> {
        let frame = Command::GlobalDiscovery.pack()?;
        self.transport.broadcast(&frame)?;

        let deadline = Instant::now() + wait;
        let mut found = Vec::new();
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let Some((raw, peer)) = self.transport.recv(Some(deadline - now))? else {
                break;
            };
            match decode(&raw) {
                Ok(Some(decoded)) => {
                    for w in &decoded.warnings {
                        warn!(%peer, "{w}");
                    }
                    if let Message::DiscoveryResponse {
                        dst_mac,
                        soc,
                        timer_seconds,
                        state,
                        ..
                    } = decoded.message
                    {
                        found.push(DiscoveredPlug {
                            addr: peer,
                            mac: dst_mac,
                            soc,
                            timer_seconds,
                            state,
                        });
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(%peer, "{e}"),
            }
        }
        Ok(found)
    }

    fn switch(
        &mut self,
        addr: SocketAddr,
        mac: MacAddress,
        on: bool,
    ) -> Result<SwitchReport, Error> {
        let mut warnings = Vec::new();

        if let Err(e) = self.subscription.ensure(&self.transport, addr, Some(mac)) {
            // Observed plug behavior: commands sometimes go through on a
            // stale or failed subscription, so keep going and let the ack
            // wait decide.
            warn!(%addr, %mac, error = %e, "subscribe failed, sending command anyway");
            warnings.push(format!("subscribe failed: {e}"));
        }

        let frame = Command::Switch { mac, on }.pack()?;
        self.transport.send(&frame, addr)?;

        match self.wait_for_ack(&mut warnings)? {
            Some(peer_count) => Ok(SwitchReport {
                acknowledged: true,
                state: if on { PowerState::On } else { PowerState::Off },
                peer_count: Some(peer_count),
                warnings,
            }),
            None => Ok(SwitchReport {
                acknowledged: false,
                state: PowerState::Unknown,
                peer_count: None,
                warnings,
            }),
        }
    }

    /// Waits for a power ack until the configured deadline, polling the
    /// cancel flag between receive slices.
    ///
    /// Returns the ack's peer count, or `None` (with a warning recorded) on
    /// timeout, cancellation, or a malformed frame.  Frames of other known
    /// shapes, such as late discovery responses on the shared port, are
    /// skipped.
    fn wait_for_ack(&self, warnings: &mut Vec<String>) -> Result<Option<u8>, Error> {
        let deadline = Instant::now() + self.config.ack_timeout;
        loop {
            if self.cancel.is_cancelled() {
                warnings.push("acknowledgment wait cancelled".to_owned());
                return Ok(None);
            }
            let now = Instant::now();
            if now >= deadline {
                warnings.push(format!(
                    "no acknowledgment within {:?}",
                    self.config.ack_timeout
                ));
                return Ok(None);
            }

            let slice = POLL_SLICE.min(deadline - now);
            let Some((raw, peer)) = self.transport.recv(Some(slice))? else {
                continue;
            };
            match decode(&raw) {
                Ok(Some(decoded)) => match decoded.message {
                    Message::PowerAck { peer_count, .. } => {
                        for w in &decoded.warnings {
                            warn!(%peer, "{w}");
                        }
                        warnings.extend(decoded.warnings);
                        return Ok(Some(peer_count));
                    }
                    other => {
                        debug!(%peer, ?other, "skipping frame while waiting for acknowledgment");
                    }
                },
                Ok(None) => debug!(%peer, "skipping non-protocol datagram"),
                Err(e) => {
                    // Malformed traffic fails this operation but leaves the
                    // session usable.
                    warn!(%peer, "{e}");
                    warnings.push(e.to_string());
                    return Ok(None);
                }
            }
        }
    }
}

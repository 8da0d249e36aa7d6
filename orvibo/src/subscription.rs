//! The subscribe handshake and the per-session subscription it produces.

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use orvibo_core::{decode, Command, MacAddress, Message};
use thiserror::Error;
use tracing::{debug, warn};

use crate::transport::Transport;

/// How long to wait for the plug to answer a subscribe request.  In practice
/// answers arrive well under a second.
pub const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(1);

/// The plug silently ignores commands sent within about 6ms of acknowledging
/// a subscribe.  10ms is reliable.
pub const SETTLE_DELAY: Duration = Duration::from_millis(10);

/// An established session with one plug.
///
/// Owned by the session that created it; never persisted, recreated on every
/// new session.  A command may only be sent while a subscription for the
/// target plug's MAC exists.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Where the subscribe response came from.
    pub peer: SocketAddr,
    /// The plug this subscription is for.
    pub mac: MacAddress,
    pub created_at: Instant,
}

/// Ways the subscribe handshake can fail.
///
/// These are soft failures: the controller logs them and, matching the plug's
/// observed behavior, still attempts the command afterwards.
#[derive(Error, Debug)]
pub enum SubscribeError {
    /// No response arrived within [SUBSCRIBE_TIMEOUT].
    #[error("no subscribe response from {0}")]
    NoResponse(SocketAddr),

    /// A response arrived but was not a subscribe acknowledgment for the
    /// requested MAC.
    #[error("subscribe response did not match mac {expected}")]
    Mismatch { expected: MacAddress },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] orvibo_core::Error),
}

/// Tracks the current subscription and drives the handshake.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    current: Option<Subscription>,
}

impl SubscriptionManager {
    pub fn new() -> SubscriptionManager {
        SubscriptionManager::default()
    }

    pub fn current(&self) -> Option<&Subscription> {
        self.current.as_ref()
    }

    /// Performs the subscribe handshake with the plug at `addr`.
    ///
    /// Sends the subscribe frame, waits up to [SUBSCRIBE_TIMEOUT] for a
    /// subscribe response whose destination MAC equals `mac`, and on success
    /// stores the subscription and sleeps [SETTLE_DELAY] before returning, so
    /// the caller can send a command immediately.
    pub fn subscribe(
        &mut self,
        transport: &Transport,
        addr: SocketAddr,
        mac: MacAddress,
    ) -> Result<Subscription, SubscribeError> {
        let frame = Command::Subscribe { mac }.pack()?;
        transport.send(&frame, addr)?;

        let Some((raw, peer)) = transport.recv(Some(SUBSCRIBE_TIMEOUT))? else {
            return Err(SubscribeError::NoResponse(addr));
        };
        let Some(decoded) = decode(&raw)? else {
            warn!(%peer, "non-protocol datagram while waiting for subscribe response");
            return Err(SubscribeError::Mismatch { expected: mac });
        };
        for w in &decoded.warnings {
            warn!(%peer, "{w}");
        }
        match decoded.message {
            Message::SubscribeResponse { dst_mac, state, .. } if dst_mac == mac => {
                debug!(%peer, %mac, state, "subscribed");
                let sub = Subscription {
                    peer,
                    mac,
                    created_at: Instant::now(),
                };
                self.current = Some(sub.clone());
                thread::sleep(SETTLE_DELAY);
                Ok(sub)
            }
            other => {
                warn!(%peer, ?other, "unexpected response to subscribe");
                Err(SubscribeError::Mismatch { expected: mac })
            }
        }
    }

    /// Subscribes only when needed.
    ///
    /// With no `mac`, the current subscription (whatever plug it is for) is
    /// reused as-is.  With a `mac`, a new handshake runs when there is no
    /// subscription yet or the current one is for a different plug,
    /// byte-for-byte.
    pub fn ensure(
        &mut self,
        transport: &Transport,
        addr: SocketAddr,
        mac: Option<MacAddress>,
    ) -> Result<(), SubscribeError> {
        let Some(mac) = mac else {
            return Ok(());
        };
        if self.current.as_ref().map(|s| s.mac) == Some(mac) {
            return Ok(());
        }
        self.subscribe(transport, addr, mac).map(|_| ())
    }
}

//! An in-process stand-in for an S20 plug, used by the session-layer tests.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use orvibo_core::MacAddress;

pub struct FakeDevice {
    pub addr: SocketAddr,
    /// Number of subscribe requests seen.
    pub subscribes: Arc<AtomicUsize>,
    /// Raw switch-command frames seen, in order.
    pub commands: Arc<Mutex<Vec<Vec<u8>>>>,
}

/// Spawns a fake plug on an ephemeral loopback port.
///
/// It answers subscribe requests (echoing the requested MAC, or always
/// `respond_mac` when given, which lets tests force a mismatch) and, when
/// `ack_power` is set, acknowledges switch commands with a peer count of 2.
/// The thread exits after one second of silence.
pub fn spawn_fake_device(respond_mac: Option<MacAddress>, ack_power: bool) -> FakeDevice {
    let sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    sock.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
    let addr = sock.local_addr().unwrap();

    let subscribes = Arc::new(AtomicUsize::new(0));
    let commands = Arc::new(Mutex::new(Vec::new()));
    let subs = subscribes.clone();
    let cmds = commands.clone();

    thread::spawn(move || {
        let mut buf = [0u8; 1024];
        while let Ok((n, src)) = sock.recv_from(&mut buf) {
            let raw = &buf[..n];
            if n < 6 || raw[0..2] != [0x68, 0x64] {
                continue;
            }
            match u16::from_be_bytes([raw[4], raw[5]]) {
                // subscribe
                0x636c => {
                    subs.fetch_add(1, Ordering::SeqCst);
                    let mac = respond_mac.unwrap_or_else(|| requested_mac(raw));
                    let mut payload = vec![0x63, 0x6c];
                    payload.extend_from_slice(mac.as_bytes());
                    payload.extend_from_slice(&[0x20; 6]);
                    payload.extend_from_slice(&[0, 0, 0, 0, 0]);
                    payload.push(0x01); // relay state
                    sock.send_to(&frame(&payload), src).unwrap();
                }
                // switch
                0x6463 => {
                    cmds.lock().unwrap().push(raw.to_vec());
                    if ack_power {
                        let mut payload = vec![0x64, 0x63];
                        payload.extend_from_slice(requested_mac(raw).as_bytes());
                        payload.extend_from_slice(&[0x20; 6]);
                        payload.push(0x02); // peer count
                        payload.extend_from_slice(&[0, 0, 0, 0]);
                        sock.send_to(&frame(&payload), src).unwrap();
                    }
                }
                _ => {}
            }
        }
    });

    FakeDevice {
        addr,
        subscribes,
        commands,
    }
}

fn requested_mac(raw: &[u8]) -> MacAddress {
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&raw[6..12]);
    MacAddress(mac)
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut v = vec![0x68, 0x64];
    v.extend_from_slice(&((payload.len() + 4) as u16).to_be_bytes());
    v.extend_from_slice(payload);
    v
}

//! This crate provides low-level message types and framing for the UDP protocol
//! spoken by Orvibo S20 ("WiWo") smart plugs.
//!
//! Every packet is a frame of the form `0x68 0x64` (the magic marker), a
//! big-endian 16-bit length equal to the payload length plus 4, and the payload
//! itself.  The two bytes following the length field are a big-endian command
//! id, and the pair `(length, command id)` uniquely identifies the shape of
//! each known packet.
//!
//! Since this is a low-level library, it does not deal with sockets, timeouts
//! or the subscribe handshake.  That is done by the higher-level `orvibo`
//! crate.
//!
//! # Reserved fields
//! Several response shapes contain bytes that are zero on every plug observed
//! so far.  When one of them is not zero, decoding still succeeds and a
//! warning is attached to the [Decoded] result.  Be conservative in what you
//! send, and liberal in what you accept.
//!
//! # Unknown packets
//! Datagrams that do not start with the magic marker are simply not part of
//! this protocol ([decode] returns `Ok(None)`).  Frames that carry the magic
//! marker but match no known `(length, command id)` pair produce
//! [Error::MalformedPacket], which keeps the raw bytes around for diagnostics.

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use std::str::FromStr;
use std::{fmt, io};
use thiserror::Error;

/// The fixed UDP port used by the protocol.
///
/// Plugs send replies to this port only, so a session socket must be bound to
/// it (see the `orvibo` crate).
pub const PORT: u16 = 10000;

/// The 2-byte marker that starts every protocol frame (`"hd"`).
pub const MAGIC: [u8; 2] = [0x68, 0x64];

/// Various encoding/decoding errors
#[derive(Error, Debug)]
pub enum Error {
    /// The bytes begin with the magic marker but match no known
    /// `(length, command id)` shape.
    ///
    /// The raw bytes are carried along so callers can log them.  Plugs are
    /// known to emit undocumented packets, so this does not necessarily
    /// represent a bug.
    #[error("malformed packet: [{}]", hex_dump(.bytes))]
    MalformedPacket { bytes: Vec<u8> },

    /// A textual MAC address was not 6 colon-separated hex octets.
    #[error("invalid MAC address: {0:?}")]
    InvalidMac(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A 6-byte device hardware address.
///
/// The textual form is 6 colon-separated lowercase hex octets, e.g.
/// `11:22:33:aa:bb:cc`.  No other length is valid anywhere in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// The same address with its bytes in reverse order, as echoed in the
    /// second half of a subscribe payload.
    pub fn reversed(&self) -> MacAddress {
        let mut rev = self.0;
        rev.reverse();
        MacAddress(rev)
    }
}

impl FromStr for MacAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<MacAddress, Error> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for slot in &mut bytes {
            let octet = parts.next().ok_or_else(|| Error::InvalidMac(s.to_owned()))?;
            if octet.len() != 2 {
                return Err(Error::InvalidMac(s.to_owned()));
            }
            *slot = u8::from_str_radix(octet, 16).map_err(|_| Error::InvalidMac(s.to_owned()))?;
        }
        if parts.next().is_some() {
            return Err(Error::InvalidMac(s.to_owned()));
        }
        Ok(MacAddress(bytes))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// The 6-byte ASCII device-type code found in discovery responses
/// (e.g. `SOC002`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocCode(pub [u8; 6]);

impl fmt::Display for SocCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, ".")?;
            }
        }
        Ok(())
    }
}

/// Requests a client can send to a plug.
///
/// Use [Command::pack] to produce the bytes to put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Broadcast probe that makes every plug on the subnet identify itself
    /// with a [Message::DiscoveryResponse].
    GlobalDiscovery,

    /// Probe a single plug, addressed by MAC.  Also answered with a
    /// [Message::DiscoveryResponse].
    Discover { mac: MacAddress },

    /// Start a session with a plug.  The payload carries the MAC twice, once
    /// forward and once reversed, each padded with 6 ASCII spaces.  Answered
    /// with a [Message::SubscribeResponse].
    Subscribe { mac: MacAddress },

    /// Switch the relay on or off.  Only valid after a subscribe.  Answered
    /// with a [Message::PowerAck].
    Switch { mac: MacAddress, on: bool },
}

impl Command {
    /// The frame payload, excluding the magic marker and length field.
    pub fn payload(&self) -> Vec<u8> {
        let mut v = Vec::new();
        match *self {
            Command::GlobalDiscovery => {
                v.extend_from_slice(&[0x71, 0x61]);
            }
            Command::Discover { mac } => {
                v.extend_from_slice(&[0x71, 0x67]);
                v.extend_from_slice(mac.as_bytes());
                v.extend_from_slice(&[0x20; 6]);
            }
            Command::Subscribe { mac } => {
                v.extend_from_slice(&[0x63, 0x6c]);
                v.extend_from_slice(mac.as_bytes());
                v.extend_from_slice(&[0x20; 6]);
                v.extend_from_slice(mac.reversed().as_bytes());
                v.extend_from_slice(&[0x20; 6]);
            }
            Command::Switch { mac, on } => {
                v.extend_from_slice(&[0x64, 0x63]);
                v.extend_from_slice(mac.as_bytes());
                v.extend_from_slice(&[0x20; 6]);
                v.extend_from_slice(&[0x00; 4]);
                v.push(if on { 0x01 } else { 0x00 });
            }
        }
        v
    }

    /// Packs this command into a complete frame suitable for sending.
    pub fn pack(&self) -> Result<Vec<u8>, Error> {
        pack_frame(&self.payload())
    }
}

/// Prepends the magic marker and length field to a payload.
///
/// The length field is the payload length plus 4.  No payload length ceiling
/// is enforced; protocol payloads are small and fixed-shape.
pub fn pack_frame(payload: &[u8]) -> Result<Vec<u8>, Error> {
    let mut v = Vec::with_capacity(payload.len() + 4);
    v.extend_from_slice(&MAGIC);
    v.write_u16::<BigEndian>((payload.len() + 4) as u16)?;
    v.extend_from_slice(payload);
    Ok(v)
}

/// Decoded response packets.
///
/// Each variant corresponds to exactly one `(length, command id)` pair.  The
/// length-6 and length-18 shapes are our own discovery probes looping back to
/// the shared protocol port; plugs answer both with the 42-byte response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Length 6, command `0x7161`.  A broadcast discovery probe.
    GlobalDiscovery,

    /// Length 18, command `0x7167`.  A directed discovery probe.
    Discovery {
        dst_mac: MacAddress,
        src_mac: MacAddress,
    },

    /// Length 42, command `0x7161` or `0x7167`.  A plug identifying itself.
    ///
    /// `dst_mac` is the plug's own hardware address.
    DiscoveryResponse {
        dst_mac: MacAddress,
        src_mac: MacAddress,
        dst_mac_echo: MacAddress,
        src_mac_echo: MacAddress,
        /// Device-type code, e.g. `SOC002`.
        soc: SocCode,
        /// Little-endian seconds counter reported by the plug.
        timer_seconds: u32,
        /// 1 when the relay is on, 0 when off.
        state: u8,
    },

    /// Length 24, command `0x636c`.  Acknowledges a [Command::Subscribe].
    SubscribeResponse {
        dst_mac: MacAddress,
        src_mac: MacAddress,
        /// 1 when the relay is on, 0 when off.
        state: u8,
    },

    /// Length 23, command `0x6463`.  Acknowledges a [Command::Switch].
    PowerAck {
        dst_mac: MacAddress,
        src_mac: MacAddress,
        /// Number of peers the plug sees on the local network.  Best-effort
        /// diagnostic only.
        peer_count: u8,
    },
}

/// A successfully decoded frame plus any non-fatal diagnostics.
///
/// `warnings` records reserved bytes that were expected to be zero but were
/// not.  They never abort decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub message: Message,
    pub warnings: Vec<String>,
}

impl Decoded {
    fn clean(message: Message) -> Decoded {
        Decoded {
            message,
            warnings: Vec::new(),
        }
    }
}

fn mac_at(raw: &[u8], offset: usize) -> MacAddress {
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&raw[offset..offset + 6]);
    MacAddress(mac)
}

fn check_zeros(raw: &[u8], start: usize, end: usize, warnings: &mut Vec<String>) {
    for (i, &b) in raw[start..end].iter().enumerate() {
        if b != 0 {
            warnings.push(format!(
                "reserved byte at offset {} is 0x{:02x}, expected zero",
                start + i,
                b
            ));
        }
    }
}

/// Given some bytes (generally read from a network socket), decode them into a
/// [Message].
///
/// Returns `Ok(None)` when the bytes do not start with the magic marker: the
/// datagram is simply not part of this protocol, which is distinct from being
/// malformed.  Returns [Error::MalformedPacket] when the magic marker is
/// present but the frame is truncated or its `(length, command id)` pair is
/// unknown.
pub fn decode(raw: &[u8]) -> Result<Option<Decoded>, Error> {
    if raw.len() < 2 || raw[0..2] != MAGIC {
        return Ok(None);
    }
    let malformed = || Error::MalformedPacket {
        bytes: raw.to_vec(),
    };
    if raw.len() < 6 {
        return Err(malformed());
    }

    let mut c = Cursor::new(raw);
    c.set_position(2);
    let length = c.read_u16::<BigEndian>()?;
    let command = c.read_u16::<BigEndian>()?;

    // Trailing bytes beyond the length field are ignored; a frame shorter
    // than its length field is malformed.
    if (raw.len() as u16) < length {
        return Err(malformed());
    }

    let mut warnings = Vec::new();
    let decoded = match (length, command) {
        (6, 0x7161) => Decoded::clean(Message::GlobalDiscovery),
        (18, 0x7167) => Decoded::clean(Message::Discovery {
            dst_mac: mac_at(raw, 6),
            src_mac: mac_at(raw, 12),
        }),
        (42, 0x7161) | (42, 0x7167) => {
            check_zeros(raw, 6, 7, &mut warnings);
            let mut soc = [0u8; 6];
            soc.copy_from_slice(&raw[31..37]);
            c.set_position(37);
            let timer_seconds = c.read_u32::<LittleEndian>()?;
            Decoded {
                message: Message::DiscoveryResponse {
                    dst_mac: mac_at(raw, 7),
                    src_mac: mac_at(raw, 13),
                    dst_mac_echo: mac_at(raw, 19),
                    src_mac_echo: mac_at(raw, 25),
                    soc: SocCode(soc),
                    timer_seconds,
                    state: raw[41],
                },
                warnings,
            }
        }
        (24, 0x636c) => {
            check_zeros(raw, 18, 23, &mut warnings);
            Decoded {
                message: Message::SubscribeResponse {
                    dst_mac: mac_at(raw, 6),
                    src_mac: mac_at(raw, 12),
                    state: raw[23],
                },
                warnings,
            }
        }
        (23, 0x6463) => {
            check_zeros(raw, 19, 23, &mut warnings);
            Decoded {
                message: Message::PowerAck {
                    dst_mac: mac_at(raw, 6),
                    src_mac: mac_at(raw, 12),
                    peer_count: raw[18],
                },
                warnings,
            }
        }
        (_, _) => return Err(malformed()),
    };

    Ok(Some(decoded))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac() -> MacAddress {
        "11:22:33:aa:bb:cc".parse().unwrap()
    }

    #[test]
    fn test_mac_parse_and_display() {
        let m = mac();
        assert_eq!(m.0, [0x11, 0x22, 0x33, 0xaa, 0xbb, 0xcc]);
        assert_eq!(m.to_string(), "11:22:33:aa:bb:cc");
        assert_eq!(m.reversed().0, [0xcc, 0xbb, 0xaa, 0x33, 0x22, 0x11]);

        // uppercase input normalizes to lowercase text
        let m2: MacAddress = "AC:CF:23:00:11:22".parse().unwrap();
        assert_eq!(m2.to_string(), "ac:cf:23:00:11:22");
    }

    #[test]
    fn test_mac_parse_rejects_bad_shapes() {
        for bad in ["", "11:22:33:aa:bb", "11:22:33:aa:bb:cc:dd", "11:22:33:aa:bb:zz", "1:2:3:4:5:6"] {
            assert!(matches!(
                bad.parse::<MacAddress>(),
                Err(Error::InvalidMac(_))
            ));
        }
    }

    #[test]
    fn test_pack_frame() {
        let frame = pack_frame(&[0x71, 0x61]).unwrap();
        //                      magic       len=6       payload
        assert_eq!(frame, vec![0x68, 0x64, 0x00, 0x06, 0x71, 0x61]);
    }

    #[test]
    fn test_switch_on_frame_bytes() {
        let frame = Command::Switch { mac: mac(), on: true }.pack().unwrap();
        assert_eq!(
            frame,
            vec![
                0x68, 0x64, 0x00, 0x15, // magic, length 21
                0x64, 0x63, // command id
                0x11, 0x22, 0x33, 0xaa, 0xbb, 0xcc, // mac
                0x20, 0x20, 0x20, 0x20, 0x20, 0x20, // padding
                0x00, 0x00, 0x00, 0x00, // reserved
                0x01, // on
            ]
        );

        let off = Command::Switch { mac: mac(), on: false }.pack().unwrap();
        assert_eq!(off[..20], frame[..20]);
        assert_eq!(*off.last().unwrap(), 0x00);
    }

    #[test]
    fn test_subscribe_payload_echoes_mac() {
        let payload = Command::Subscribe { mac: mac() }.payload();
        assert_eq!(payload.len(), 26);
        assert_eq!(&payload[0..2], &[0x63, 0x6c]);
        assert_eq!(&payload[2..8], mac().as_bytes());
        assert_eq!(&payload[8..14], &[0x20; 6]);
        assert_eq!(&payload[14..20], mac().reversed().as_bytes());
        assert_eq!(&payload[20..26], &[0x20; 6]);

        let frame = pack_frame(&payload).unwrap();
        assert_eq!(frame[2..4], [0x00, 30]);
    }

    #[test]
    fn test_discover_frame_matches_discovery_shape() {
        // a directed probe has the same (length, command) pair the decoder
        // recognizes as Discovery
        let frame = Command::Discover { mac: mac() }.pack().unwrap();
        assert_eq!(frame.len(), 18);
        let decoded = decode(&frame).unwrap().unwrap();
        match decoded.message {
            Message::Discovery { dst_mac, .. } => assert_eq!(dst_mac, mac()),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_decode_not_our_packet() {
        assert_eq!(decode(&[]).unwrap(), None);
        assert_eq!(decode(&[0x68]).unwrap(), None);
        assert_eq!(decode(b"SSDP discover").unwrap(), None);
        // right length, wrong magic
        assert_eq!(decode(&[0x64, 0x68, 0x00, 0x06, 0x71, 0x61]).unwrap(), None);
    }

    #[test]
    fn test_decode_unknown_shape_is_malformed() {
        // magic ok, but (7, 0x7161) is not a known pair
        let raw = vec![0x68, 0x64, 0x00, 0x07, 0x71, 0x61, 0x00];
        match decode(&raw) {
            Err(Error::MalformedPacket { bytes }) => assert_eq!(bytes, raw),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_decode_truncated_frame_is_malformed() {
        // claims length 42 but only 10 bytes follow
        let raw = vec![0x68, 0x64, 0x00, 0x2a, 0x71, 0x61, 0, 0, 0, 0];
        assert!(matches!(decode(&raw), Err(Error::MalformedPacket { .. })));

        // magic alone is also malformed once it matches
        assert!(matches!(
            decode(&[0x68, 0x64, 0x00]),
            Err(Error::MalformedPacket { .. })
        ));
    }

    #[test]
    fn test_decode_global_discovery() {
        let decoded = decode(&[0x68, 0x64, 0x00, 0x06, 0x71, 0x61]).unwrap().unwrap();
        assert_eq!(decoded.message, Message::GlobalDiscovery);
        assert!(decoded.warnings.is_empty());
    }

    #[test]
    fn test_decode_subscribe_response() {
        let mut raw = vec![0x68, 0x64, 0x00, 0x18, 0x63, 0x6c];
        raw.extend_from_slice(mac().as_bytes()); // 6..12 dst
        raw.extend_from_slice(&[0x20; 6]); // 12..18 src
        raw.extend_from_slice(&[0, 0, 0, 0, 0]); // 18..23 reserved
        raw.push(0x01); // 23 state
        assert_eq!(raw.len(), 24);

        let decoded = decode(&raw).unwrap().unwrap();
        assert!(decoded.warnings.is_empty());
        assert_eq!(
            decoded.message,
            Message::SubscribeResponse {
                dst_mac: mac(),
                src_mac: MacAddress([0x20; 6]),
                state: 1,
            }
        );
    }

    #[test]
    fn test_decode_subscribe_response_reserved_warning() {
        let mut raw = vec![0x68, 0x64, 0x00, 0x18, 0x63, 0x6c];
        raw.extend_from_slice(mac().as_bytes());
        raw.extend_from_slice(&[0x20; 6]);
        raw.extend_from_slice(&[0, 0xff, 0, 0, 0x07]);
        raw.push(0x00);

        let decoded = decode(&raw).unwrap().unwrap();
        assert_eq!(decoded.warnings.len(), 2);
        assert!(decoded.warnings[0].contains("offset 19"));
        assert!(decoded.warnings[0].contains("0xff"));
        assert!(matches!(decoded.message, Message::SubscribeResponse { state: 0, .. }));
    }

    #[test]
    fn test_decode_power_ack() {
        let mut raw = vec![0x68, 0x64, 0x00, 0x17, 0x64, 0x63];
        raw.extend_from_slice(mac().as_bytes());
        raw.extend_from_slice(&[0x20; 6]);
        raw.push(0x02); // peer count
        raw.extend_from_slice(&[0, 0, 0, 0]);
        assert_eq!(raw.len(), 23);

        let decoded = decode(&raw).unwrap().unwrap();
        assert!(decoded.warnings.is_empty());
        assert_eq!(
            decoded.message,
            Message::PowerAck {
                dst_mac: mac(),
                src_mac: MacAddress([0x20; 6]),
                peer_count: 2,
            }
        );
    }

    fn discovery_response(zero_byte: u8) -> Vec<u8> {
        let mut raw = vec![0x68, 0x64, 0x00, 0x2a, 0x71, 0x61];
        raw.push(zero_byte); // 6 reserved
        raw.extend_from_slice(mac().as_bytes()); // 7..13 dst
        raw.extend_from_slice(&[0x20; 6]); // 13..19 src
        raw.extend_from_slice(mac().reversed().as_bytes()); // 19..25 dst echo
        raw.extend_from_slice(&[0x20; 6]); // 25..31 src echo
        raw.extend_from_slice(b"SOC002"); // 31..37 soc
        raw.extend_from_slice(&0x0205_1900u32.to_le_bytes()); // 37..41 timer
        raw.push(0x01); // 41 state
        assert_eq!(raw.len(), 42);
        raw
    }

    #[test]
    fn test_decode_discovery_response() {
        let decoded = decode(&discovery_response(0)).unwrap().unwrap();
        assert!(decoded.warnings.is_empty());
        match decoded.message {
            Message::DiscoveryResponse {
                dst_mac,
                dst_mac_echo,
                soc,
                timer_seconds,
                state,
                ..
            } => {
                assert_eq!(dst_mac, mac());
                assert_eq!(dst_mac_echo, mac().reversed());
                assert_eq!(soc.to_string(), "SOC002");
                assert_eq!(timer_seconds, 0x0205_1900);
                assert_eq!(state, 1);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_decode_discovery_response_nonzero_reserved_still_decodes() {
        let decoded = decode(&discovery_response(0x5a)).unwrap().unwrap();
        assert_eq!(decoded.warnings.len(), 1);
        assert!(decoded.warnings[0].contains("offset 6"));
        assert!(matches!(decoded.message, Message::DiscoveryResponse { .. }));
    }

    #[test]
    fn test_decode_discovery_response_alternate_command_id() {
        let mut raw = discovery_response(0);
        raw[4] = 0x71;
        raw[5] = 0x67;
        assert!(matches!(
            decode(&raw).unwrap().unwrap().message,
            Message::DiscoveryResponse { .. }
        ));
    }

    #[test]
    fn test_malformed_display_includes_hex() {
        let err = Error::MalformedPacket {
            bytes: vec![0x68, 0x64, 0xff],
        };
        assert_eq!(err.to_string(), "malformed packet: [68 64 ff]");
    }

    #[test]
    fn test_soc_code_display_escapes_non_ascii() {
        assert_eq!(SocCode(*b"SOC002").to_string(), "SOC002");
        assert_eq!(SocCode([0x53, 0x00, 0xff, 0x43, 0x30, 0x32]).to_string(), "S..C02");
    }
}

// Cantrip
// Copyright (C) 2026  The Cantrip Authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! OSC messages, timetags, and datagram encoding.
//!
//! This module provides the value types that the rest of the crate composes
//! and ships over UDP:
//!
//! * [`Message`] - a single OSC message, built with a chaining interface and
//!   encoded in the OSC 1.0 binary format.
//! * [`TimeTag`] - the 64-bit NTP-format time attached to OSC bundles,
//!   including the reserved "immediately" sentinel.
//! * [`Packet`] - a decoded incoming datagram, either a message or a bundle
//!   of nested packets.
//!
//! Argument values are the standard OSC types from [`rosc`]: 32-bit
//! integers, 64-bit floats, strings, and blobs, plus timetags. Anything
//! implementing `Into<OscType>` can be passed to [`Message::arg`].

pub mod bundler;

pub use bundler::{BundleScope, Bundler};

use crate::error::{Error, Result};
use rosc::{decoder, encoder, OscMessage, OscPacket, OscTime, OscType};
use std::time::{Duration, SystemTime};

/// Timetag bases smaller than this are relative seconds, larger ones are
/// absolute Unix time.
pub const ABSOLUTE_TIME_THRESHOLD: f64 = 1e6;

// From RFC 5905: seconds between the NTP epoch (1900) and the Unix epoch.
const UNIX_OFFSET: u64 = 2_208_988_800;
const TWO_POW_32: f64 = 4_294_967_296.0;

/// The current wall-clock time in Unix seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("system clock before 1970")
        .as_secs_f64()
}

/// A single OSC message.
///
/// Messages are immutable once built. The constructor takes the address
/// pattern and arguments are appended with the chaining methods:
///
/// ```
/// use cantrip::osc::Message;
///
/// let message = Message::new("/s_new")
///     .arg("sine")
///     .arg(-1)
///     .arg(1)
///     .arg(0)
///     .arg("freq")
///     .arg(200);
/// assert_eq!(message.address(), "/s_new");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    addr: String,
    args: Vec<OscType>,
}

impl Message {
    /// Creates a new message with the given address pattern and no
    /// arguments. A missing leading `/` is supplied.
    pub fn new(addr: impl Into<String>) -> Message {
        let addr = addr.into();
        let addr = if addr.starts_with('/') {
            addr
        } else {
            format!("/{}", addr)
        };
        Message {
            addr,
            args: Vec::new(),
        }
    }

    /// Appends one argument.
    pub fn arg<T: Into<OscType>>(mut self, arg: T) -> Message {
        self.args.push(arg.into());
        self
    }

    /// Appends every argument from an iterator.
    pub fn args<I, T>(mut self, args: I) -> Message
    where
        I: IntoIterator<Item = T>,
        T: Into<OscType>,
    {
        self.args.extend(args.into_iter().map(T::into));
        self
    }

    /// Appends the argument if it is present.
    pub fn optional<T: Into<OscType>>(mut self, arg: Option<T>) -> Message {
        if let Some(arg) = arg {
            self.args.push(arg.into());
        }
        self
    }

    /// The address pattern of this message.
    pub fn address(&self) -> &str {
        &self.addr
    }

    /// The arguments of this message in order.
    pub fn arguments(&self) -> &[OscType] {
        &self.args
    }

    /// Encodes this message as a raw OSC datagram.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::ArgumentTooLarge`] if a string or blob argument
    /// cannot be length-prefixed in 32 bits, and with
    /// [`Error::MalformedPacket`] if the encoder rejects the message.
    pub fn to_raw_osc(&self) -> Result<Vec<u8>> {
        self.check_argument_sizes()?;
        encoder::encode(&OscPacket::Message(self.to_rosc())).map_err(Error::MalformedPacket)
    }

    pub(crate) fn check_argument_sizes(&self) -> Result<()> {
        for arg in &self.args {
            match arg {
                OscType::String(s) if s.len() > i32::MAX as usize => {
                    return Err(Error::ArgumentTooLarge {
                        kind: "string",
                        len: s.len(),
                    })
                }
                OscType::Blob(b) if b.len() > i32::MAX as usize => {
                    return Err(Error::ArgumentTooLarge {
                        kind: "blob",
                        len: b.len(),
                    })
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub(crate) fn to_rosc(&self) -> OscMessage {
        OscMessage {
            addr: self.addr.clone(),
            args: self.args.clone(),
        }
    }

    pub(crate) fn from_rosc(message: OscMessage) -> Message {
        Message {
            addr: message.addr,
            args: message.args,
        }
    }
}

impl From<&str> for Message {
    /// Converts a bare address into a message with no arguments.
    fn from(addr: &str) -> Message {
        Message::new(addr)
    }
}

impl From<String> for Message {
    fn from(addr: String) -> Message {
        Message::new(addr)
    }
}

/// A 64-bit NTP-format time value attached to OSC bundles.
///
/// The high 32 bits count whole seconds since 1900-01-01 UTC and the low 32
/// bits are fractional seconds. The reserved value `(0, 1)` means "execute
/// immediately" and is available as [`TimeTag::IMMEDIATE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeTag {
    seconds: u32,
    fractional: u32,
}

impl TimeTag {
    /// The sentinel timetag meaning "execute immediately".
    pub const IMMEDIATE: TimeTag = TimeTag {
        seconds: 0,
        fractional: 1,
    };

    /// Converts absolute Unix seconds into an NTP timetag.
    ///
    /// Times before the Unix epoch are clamped to it.
    pub fn from_unix_secs(secs: f64) -> TimeTag {
        if secs <= 0.0 {
            return TimeTag {
                seconds: UNIX_OFFSET as u32,
                fractional: 0,
            };
        }
        Self::from_unix_duration(Duration::from_secs_f64(secs))
    }

    /// Converts a [`SystemTime`] into an NTP timetag.
    pub fn from_system_time(time: SystemTime) -> TimeTag {
        let unix_time = time
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self::from_unix_duration(unix_time)
    }

    fn from_unix_duration(unix_time: Duration) -> TimeTag {
        let epoch_time = Duration::new(UNIX_OFFSET, 0) + unix_time;
        let ts_secs = epoch_time.as_secs() as u32;
        let ts_nanos = epoch_time.subsec_nanos() as f64;
        let ts_frac = ((ts_nanos * TWO_POW_32) / 1.0e9).round() as u32;
        TimeTag {
            seconds: ts_secs,
            fractional: ts_frac,
        }
    }

    /// The time of this tag in Unix seconds. Returns 0.0 for
    /// [`TimeTag::IMMEDIATE`].
    pub fn to_unix_secs(self) -> f64 {
        if self == TimeTag::IMMEDIATE {
            return 0.0;
        }
        let secs = self.seconds as f64 - UNIX_OFFSET as f64;
        secs + self.fractional as f64 / TWO_POW_32
    }

    pub(crate) fn to_rosc(self) -> OscTime {
        OscTime {
            seconds: self.seconds,
            fractional: self.fractional,
        }
    }

    pub(crate) fn from_rosc(time: OscTime) -> TimeTag {
        TimeTag {
            seconds: time.seconds,
            fractional: time.fractional,
        }
    }
}

/// A decoded incoming OSC datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Message(Message),
    Bundle(TimeTag, Vec<Packet>),
}

impl Packet {
    /// Returns every message in this packet in order, discarding bundle
    /// nesting and timetags.
    ///
    /// The receive path uses this because nested-bundle timetags from the
    /// server are informational only.
    pub fn flatten(self) -> Vec<Message> {
        let mut messages = Vec::new();
        self.flatten_into(&mut messages);
        messages
    }

    fn flatten_into(self, messages: &mut Vec<Message>) {
        match self {
            Packet::Message(message) => messages.push(message),
            Packet::Bundle(_, content) => {
                for packet in content {
                    packet.flatten_into(messages);
                }
            }
        }
    }
}

/// Decodes one raw datagram into a [`Packet`].
///
/// # Errors
///
/// Fails with [`Error::MalformedPacket`] on misaligned strings, truncated
/// elements, or unknown type tags.
pub fn decode_datagram(data: &[u8]) -> Result<Packet> {
    let (_, packet) = decoder::decode_udp(data).map_err(Error::MalformedPacket)?;
    Ok(convert_packet(packet))
}

fn convert_packet(packet: OscPacket) -> Packet {
    match packet {
        OscPacket::Message(message) => Packet::Message(Message::from_rosc(message)),
        OscPacket::Bundle(bundle) => Packet::Bundle(
            TimeTag::from_rosc(bundle.timetag),
            bundle.content.into_iter().map(convert_packet).collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_round_trip() {
        let message = Message::new("/s_new")
            .arg("sine")
            .arg(-1)
            .arg(1)
            .arg(0)
            .arg("freq")
            .arg(440.0)
            .arg(vec![1u8, 2, 3, 4]);

        let datagram = message.to_raw_osc().unwrap();
        let decoded = decode_datagram(&datagram).unwrap();

        assert_eq!(decoded, Packet::Message(message));
    }

    #[test]
    fn test_address_normalization() {
        assert_eq!(Message::new("status").address(), "/status");
        assert_eq!(Message::new("/status").address(), "/status");
    }

    #[test]
    fn test_type_inference() {
        let message = Message::new("/x").arg(1).arg(2.5).arg("s").arg(vec![0u8]);
        assert_eq!(
            message.arguments(),
            &[
                OscType::Int(1),
                OscType::Double(2.5),
                OscType::String("s".to_owned()),
                OscType::Blob(vec![0]),
            ]
        );
    }

    #[test]
    fn test_timetag_epoch() {
        let tag = TimeTag::from_unix_secs(0.0);
        assert_eq!(tag, TimeTag::from_unix_secs(-12.5));
        assert_eq!(tag.to_unix_secs(), 0.0);
    }

    #[test]
    fn test_timetag_fractional() {
        let tag = TimeTag::from_unix_secs(1.5);
        assert_eq!(tag.to_rosc().seconds, UNIX_OFFSET as u32 + 1);
        assert_eq!(tag.to_rosc().fractional, 1 << 31);
        assert!((tag.to_unix_secs() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_immediate_sentinel() {
        assert_eq!(TimeTag::IMMEDIATE.to_rosc().seconds, 0);
        assert_eq!(TimeTag::IMMEDIATE.to_rosc().fractional, 1);
    }

    #[test]
    fn test_bundle_flatten() {
        let inner = Packet::Bundle(
            TimeTag::from_unix_secs(2.0),
            vec![Packet::Message(Message::new("/b"))],
        );
        let bundle = Packet::Bundle(
            TimeTag::from_unix_secs(1.0),
            vec![Packet::Message(Message::new("/a")), inner],
        );
        let addresses: Vec<String> = bundle
            .flatten()
            .into_iter()
            .map(|m| m.address().to_owned())
            .collect();
        assert_eq!(addresses, vec!["/a", "/b"]);
    }
}

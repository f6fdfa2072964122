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

//! The error type shared by all modules in this crate.

use std::io;
use thiserror::Error;

/// A specialized [`Result`] type for cantrip operations.
///
/// Most of the functions and methods that can fail in this crate return this type.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type returned by operations in this crate.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An incoming datagram could not be decoded as OSC.
    #[error("malformed OSC packet: {0:?}")]
    MalformedPacket(rosc::OscError),

    /// An outgoing datagram exceeds the configured MTU and must be split by
    /// the caller.
    #[error("datagram of {size} bytes exceeds the {mtu} byte MTU")]
    PacketTooLarge { size: usize, mtu: usize },

    /// A string or blob argument is too large to be represented in the OSC
    /// binary format.
    #[error("{kind} of {len} bytes cannot be represented in OSC")]
    ArgumentTooLarge { kind: &'static str, len: usize },

    /// A blocking reply, sync, or wait exceeded its deadline.
    #[error("timed out waiting for a reply")]
    TimedOut,

    /// The transport or a queue is closing; all blocking calls fail with
    /// this once shutdown begins.
    #[error("shutting down")]
    Shutdown,

    /// An ID allocator cannot satisfy the request.
    #[error("cannot allocate {requested} ids in range [{low}, {high}]")]
    Exhausted {
        requested: usize,
        low: i32,
        high: i32,
    },

    /// A free targeted an ID that is not currently allocated.
    #[error("id {0} is not currently allocated")]
    InvalidId(i32),

    /// Mutation was attempted on a bundler past its flatten point.
    #[error("bundler has already been finalized")]
    Finalized,

    /// A handshake reply from the server did not parse as expected. Fatal
    /// during [`connect`](crate::server::Server::connect).
    #[error("server handshake failed: {0}")]
    ProtocolMismatch(String),

    /// The bundler is not attached to a server and cannot send itself.
    #[error("bundler is not attached to a server")]
    NoServer,

    /// No peer with the given name is registered with the transport.
    #[error("no peer named {0:?} is registered")]
    UnknownPeer(String),

    #[error("binding to UDP socket: {0}")]
    Bind(io::Error),

    #[error("sending datagram to server: {0}")]
    Send(io::Error),
}

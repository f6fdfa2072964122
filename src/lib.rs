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

//! Timed OSC control and scheduling for the
//! [SuperCollider](https://supercollider.github.io/) audio server.
//!
//! # Introduction
//!
//! SuperCollider's **scsynth** is a real-time audio synthesis engine driven
//! entirely by a command language over UDP, in the Open Sound Control (OSC)
//! binary format. Commands either take effect immediately or are scheduled
//! by the engine itself when they arrive wrapped in a bundle with an
//! absolute timetag. Cantrip is the host side of that conversation: a typed,
//! thread-safe client that takes care of the parts where getting the
//! details wrong produces silence, glitches, or another client's notes
//! cut short.
//!
//! The crate is built from four cooperating pieces:
//!
//! * [`transport`] - A bidirectional OSC/UDP endpoint. Outgoing messages
//!   and bundles go to named peers; incoming packets are decoded on a
//!   dedicated receive thread and routed into address-keyed
//!   [`ReplyQueue`](transport::ReplyQueue)s where any thread can wait for
//!   them with a timeout.
//!
//! * [`osc`] - Message construction and the [`Bundler`](osc::Bundler), a
//!   hierarchical builder that composes messages at relative offsets and
//!   flattens them into one nested bundle with absolute NTP timetags. A
//!   bundler can be entered as a *capture scope*: while active, sends on
//!   the [`Server`](server::Server) that allow bundling are redirected into
//!   it instead of hitting the network.
//!
//! * [`timed`] - A [`TimedQueue`](timed::TimedQueue) that executes actions
//!   at wall-clock deadlines from a background worker. The engine's OSC
//!   input buffer is small; streaming each bundle out shortly before its
//!   embedded timetag lets an application schedule far more events than the
//!   engine could accept at once.
//!
//! * [`server`] - The façade. [`Server::connect`](server::Server::connect)
//!   performs the `/notify` and `/status` handshake, derives this client's
//!   [ID allocator](alloc::IdAllocator) sub-ranges from the assigned client
//!   id, creates the default group, and exposes `msg`/`send`/`bundler`/
//!   `sync` with reply correlation.
//!
//! # Examples
//!
//! Play a short melody on a running engine, scheduled by the engine itself:
//!
//! ```no_run
//! # use anyhow::Result;
//! use cantrip::{
//!     osc::Message,
//!     server::{Config, SendOptions, Server},
//! };
//!
//! fn main() -> Result<()> {
//!     // An scsynth instance must already be listening on the configured
//!     // port; cantrip does not boot engine processes.
//!     let server = Server::connect(Config::default())?;
//!
//!     // Reserve a node id in this client's sub-range.
//!     let node_id = server.node_ids().allocate(1)?[0];
//!
//!     // Everything added inside the scope lands in one bundle. The engine
//!     // plays each message at the bundle time plus its offset, so timing
//!     // does not depend on how fast this loop runs.
//!     let mut bundle = server.bundler(0.2);
//!     bundle.scope(|scope| {
//!         scope.msg(
//!             Message::new("/s_new")
//!                 .arg("default")
//!                 .arg(node_id)
//!                 .arg(0)
//!                 .arg(server.default_group_id()),
//!         );
//!         for (step, freq) in [440.0, 494.0, 554.0, 587.0].iter().enumerate() {
//!             scope.wait(if step == 0 { 0.0 } else { 0.25 });
//!             server.send(
//!                 Message::new("/n_set").arg(node_id).arg("freq").arg(*freq),
//!                 SendOptions::bundled(),
//!             )?;
//!         }
//!         scope.wait(0.25);
//!         scope.msg(Message::new("/n_free").arg(node_id));
//!         Ok(())
//!     })?;
//!
//!     // Wait until the engine has processed everything, then release the id.
//!     server.sync()?;
//!     server.node_ids().free(&[node_id])?;
//!     Ok(())
//! }
//! ```
//!
//! # Learning SuperCollider
//!
//! The engine's command vocabulary is documented in the [Server Command
//! Reference]; cantrip treats it as opaque, so everything listed there can
//! be sent with [`Message::new`](osc::Message::new) and the address string.
//! The [Client vs Server] overview explains the split between the engine
//! process and clients like this crate.
//!
//! [Server Command Reference]: https://doc.sccode.org/Reference/Server-Command-Reference.html
//! [Client vs Server]: https://doc.sccode.org/Guides/ClientVsServer.html

pub mod alloc;
pub mod osc;
pub mod server;
pub mod timed;
pub mod transport;

mod error;

pub use error::{Error, Result};

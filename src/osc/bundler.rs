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

//! Hierarchical, time-shifted composition of OSC bundles.
//!
//! A [`Bundler`] assembles a set of messages with relative timestamps and
//! flattens them into a single nested OSC bundle with absolute NTP timetags.
//! The relative timing is resolved exactly once, at flatten time, from one
//! reference clock, so the same bundler always produces the same datagram
//! for the same anchor time.
//!
//! There are three equivalent ways to build the same schedule:
//!
//! ```
//! use cantrip::osc::{Bundler, Message};
//!
//! let note = Message::new("/s_new").arg("s1").arg(-1).arg(1).arg(0);
//!
//! // Explicit offsets.
//! let mut a = Bundler::new(0.0);
//! a.add(0.5, note.clone())?;
//!
//! // Nested bundlers.
//! let mut b = Bundler::new(0.0);
//! b.add(0.0, Bundler::new(0.5).msg(note.clone()))?;
//!
//! // A capture scope with a moving time cursor.
//! let mut c = Bundler::new(0.0).send_on_exit(false);
//! c.scope(|scope| {
//!     scope.wait(0.5);
//!     scope.msg(note.clone());
//!     Ok(())
//! })?;
//!
//! assert_eq!(a.to_raw_osc(0.0)?, b.to_raw_osc(0.0)?);
//! assert_eq!(a.to_raw_osc(0.0)?, c.to_raw_osc(0.0)?);
//! # cantrip::Result::Ok(())
//! ```
//!
//! While a capture scope is active, sends on the server that allow bundling
//! are redirected into the innermost bundler on the current thread instead
//! of being dispatched immediately. Scopes nest; exiting an inner scope
//! appends its bundler to the enclosing one, and exiting the outermost scope
//! flattens and sends the bundle unless
//! [`send_on_exit(false)`](Bundler::send_on_exit) was set.

use crate::error::{Error, Result};
use crate::osc::{unix_now, Message, TimeTag, ABSOLUTE_TIME_THRESHOLD};
use crate::server::Server;
use rosc::{encoder, OscBundle, OscPacket};
use std::cell::RefCell;
use std::rc::Rc;

thread_local! {
    static CAPTURE_STACK: RefCell<Vec<Rc<RefCell<Bundler>>>> = RefCell::new(Vec::new());
}

/// Redirects a message into the innermost capture scope on this thread, if
/// one is active. Returns false if there is no active scope.
pub(crate) fn capture_message(message: &Message) -> bool {
    CAPTURE_STACK.with(|stack| match stack.borrow().last() {
        Some(top) => {
            top.borrow_mut().add_captured_message(message.clone());
            true
        }
        None => false,
    })
}

/// Redirects a bundler into the innermost capture scope on this thread, if
/// one is active.
fn capture_bundler(bundler: &Bundler) -> bool {
    CAPTURE_STACK.with(|stack| match stack.borrow().last() {
        Some(top) => {
            top.borrow_mut().add_captured_bundler(bundler);
            true
        }
        None => false,
    })
}

/// Pops the capture stack when dropped, so a scope is unwound even when the
/// closure inside it fails.
struct StackGuard;

impl StackGuard {
    fn push(bundler: Rc<RefCell<Bundler>>) -> StackGuard {
        CAPTURE_STACK.with(|stack| stack.borrow_mut().push(bundler));
        StackGuard
    }
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        CAPTURE_STACK.with(|stack| stack.borrow_mut().pop());
    }
}

#[derive(Debug, Clone)]
enum Content {
    Message(Message),
    Bundler(Bundler),
}

/// A builder for nested, timed OSC bundles.
///
/// See [the module level documentation](self) for more.
///
/// The base timetag given to [`Bundler::new`] follows the convention used
/// throughout this crate: values below 1e6 are seconds relative to the
/// wall-clock at flatten time, larger values are absolute Unix seconds.
#[derive(Debug, Clone, Default)]
pub struct Bundler {
    timetag: f64,
    latency: f64,
    passed_time: f64,
    contents: Vec<Content>,
    send_on_exit: bool,
    finalized: bool,
    server: Option<Server>,
    receiver: Option<String>,
}

impl Bundler {
    /// Creates a bundler with the given base timetag and no contents.
    pub fn new(timetag: f64) -> Bundler {
        Bundler {
            timetag,
            send_on_exit: true,
            ..Bundler::default()
        }
    }

    /// Appends a message at this bundler's own base time. Useful when
    /// composing nested bundlers.
    pub fn msg(mut self, message: impl Into<Message>) -> Bundler {
        self.contents.push(Content::Message(message.into()));
        self
    }

    /// Sets whether the bundle is flattened and sent when the outermost
    /// capture scope exits. Defaults to true.
    pub fn send_on_exit(mut self, send_on_exit: bool) -> Bundler {
        self.send_on_exit = send_on_exit;
        self
    }

    pub(crate) fn attach(
        mut self,
        server: Server,
        latency: f64,
        receiver: Option<&str>,
    ) -> Bundler {
        self.server = Some(server);
        self.latency = latency;
        self.receiver = receiver.map(str::to_owned);
        self
    }

    pub(crate) fn receiver_name(&self) -> Option<&str> {
        self.receiver.as_deref()
    }

    /// The current write cursor in seconds, advanced by [`wait`](Bundler::wait).
    pub fn passed_time(&self) -> f64 {
        self.passed_time
    }

    /// True once a capture scope on this bundler has exited.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Advances the write cursor. Negative deltas are ignored; the cursor
    /// never moves backwards.
    pub fn wait(&mut self, delta: f64) {
        self.passed_time += delta.max(0.0);
    }

    /// Appends content at `offset` seconds relative to this bundler's base,
    /// clamped to zero. Accepts a [`Message`] or another `Bundler`.
    ///
    /// A nested bundler is copied on add; mutating the original afterwards
    /// has no effect on this bundler. A nested bundler with an absolute base
    /// keeps it and the offset is ignored.
    ///
    /// Returns `self` to permit chaining.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Finalized`] once a capture scope on this bundler
    /// has exited.
    pub fn add(&mut self, offset: f64, content: impl Into<Bundler>) -> Result<&mut Bundler> {
        if self.finalized {
            return Err(Error::Finalized);
        }
        let offset = offset.max(0.0);
        let mut child = content.into();
        child.server = None;
        if child.timetag > ABSOLUTE_TIME_THRESHOLD {
            if offset > 0.0 {
                log::warn!(
                    "absolute timetag {} overrides add offset {}",
                    child.timetag,
                    offset
                );
            }
        } else {
            child.timetag += offset;
        }
        self.contents.push(Content::Bundler(child));
        Ok(self)
    }

    fn add_captured_message(&mut self, message: Message) {
        let child = Bundler {
            timetag: self.passed_time,
            contents: vec![Content::Message(message)],
            ..Bundler::default()
        };
        self.contents.push(Content::Bundler(child));
    }

    fn add_captured_bundler(&mut self, bundler: &Bundler) {
        let mut child = bundler.clone();
        child.server = None;
        if child.timetag <= ABSOLUTE_TIME_THRESHOLD {
            child.timetag += self.passed_time;
        }
        self.contents.push(Content::Bundler(child));
    }

    /// The ordered flat list of `(absolute offset, message)` pairs in this
    /// bundler, anchored at zero. Primarily for inspection and testing.
    pub fn messages(&self) -> Vec<(f64, Message)> {
        let mut out = Vec::new();
        self.collect_messages(0.0, &mut out);
        out
    }

    fn collect_messages(&self, start_time: f64, out: &mut Vec<(f64, Message)>) {
        let base = self.resolved_base(start_time);
        for content in &self.contents {
            match content {
                Content::Message(message) => out.push((base, message.clone())),
                Content::Bundler(child) => child.collect_messages(base, out),
            }
        }
    }

    fn resolved_base(&self, start_time: f64) -> f64 {
        let base = if self.timetag > ABSOLUTE_TIME_THRESHOLD {
            self.timetag
        } else {
            start_time + self.timetag
        };
        base + self.latency
    }

    /// Renders the complete nested OSC datagram anchored at `start_time`
    /// (Unix seconds) plus the construction-time latency.
    ///
    /// Flattening is pure: the same bundler and the same `start_time`
    /// produce the same bytes.
    pub fn to_raw_osc(&self, start_time: f64) -> Result<Vec<u8>> {
        self.check_sizes()?;
        let bundle = self.build(start_time);
        encoder::encode(&OscPacket::Bundle(bundle)).map_err(Error::MalformedPacket)
    }

    fn check_sizes(&self) -> Result<()> {
        for content in &self.contents {
            match content {
                Content::Message(message) => message.check_argument_sizes()?,
                Content::Bundler(child) => child.check_sizes()?,
            }
        }
        Ok(())
    }

    fn build(&self, start_time: f64) -> OscBundle {
        let base = self.resolved_base(start_time);
        OscBundle {
            timetag: TimeTag::from_unix_secs(base).to_rosc(),
            content: self
                .contents
                .iter()
                .map(|content| match content {
                    Content::Message(message) => OscPacket::Message(message.to_rosc()),
                    Content::Bundler(child) => OscPacket::Bundle(child.build(base)),
                })
                .collect(),
        }
    }

    /// Flattens this bundler anchored at the current wall-clock and sends it
    /// once.
    ///
    /// If a capture scope is active on this thread the bundler is appended
    /// to it instead. Repeated sends are allowed and produce identical
    /// datagrams up to wall-clock resolution.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NoServer`] if this bundler was not created
    /// through [`Server::bundler`](crate::server::Server::bundler) and no
    /// capture scope is active.
    pub fn send(&self) -> Result<()> {
        self.send_inner(self.receiver.as_deref())
    }

    /// Like [`send`](Bundler::send), but to an explicitly named peer.
    pub fn send_to(&self, peer: &str) -> Result<()> {
        self.send_inner(Some(peer))
    }

    fn send_inner(&self, peer: Option<&str>) -> Result<()> {
        if capture_bundler(self) {
            return Ok(());
        }
        let server = self.server.as_ref().ok_or(Error::NoServer)?;
        let datagram = self.to_raw_osc(unix_now())?;
        server.transport().send_raw(&datagram, peer)
    }

    /// Runs `f` with this bundler installed as the innermost capture scope
    /// on the current thread.
    ///
    /// While the scope is active, bundle-allowed sends on the server are
    /// redirected into this bundler at its current cursor. The scope is
    /// always unwound, even when `f` fails. On success the bundler is
    /// finalized and, if [`send_on_exit`](Bundler::send_on_exit) is set,
    /// sent - to the transport when this is the outermost scope, or into the
    /// enclosing scope otherwise.
    pub fn scope<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&BundleScope) -> Result<T>,
    {
        if self.finalized {
            return Err(Error::Finalized);
        }
        let cell = Rc::new(RefCell::new(std::mem::take(self)));
        let result = {
            let _guard = StackGuard::push(Rc::clone(&cell));
            let scope = BundleScope {
                cell: Rc::clone(&cell),
            };
            f(&scope)
        };
        *self = Rc::try_unwrap(cell)
            .expect("bundle scope outlived its bundler")
            .into_inner();
        self.finalized = true;
        match result {
            Ok(value) => {
                if self.send_on_exit {
                    self.send()?;
                }
                Ok(value)
            }
            Err(err) => Err(err),
        }
    }
}

impl From<Message> for Bundler {
    /// Wraps a single message in a bundler at offset zero.
    fn from(message: Message) -> Bundler {
        Bundler {
            contents: vec![Content::Message(message)],
            send_on_exit: true,
            ..Bundler::default()
        }
    }
}

/// A handle on the bundler owning the active capture scope.
///
/// Created by [`Bundler::scope`]. All methods proxy to the captured bundler.
pub struct BundleScope {
    cell: Rc<RefCell<Bundler>>,
}

impl BundleScope {
    /// Advances the captured bundler's write cursor.
    pub fn wait(&self, delta: f64) {
        self.cell.borrow_mut().wait(delta);
    }

    /// The captured bundler's current write cursor.
    pub fn passed_time(&self) -> f64 {
        self.cell.borrow().passed_time()
    }

    /// Appends a message at the current write cursor.
    pub fn msg(&self, message: impl Into<Message>) {
        self.cell.borrow_mut().add_captured_message(message.into());
    }

    /// Appends content at an explicit offset, like [`Bundler::add`].
    pub fn add(&self, offset: f64, content: impl Into<Bundler>) -> Result<()> {
        self.cell.borrow_mut().add(offset, content).map(|_| ())
    }
}

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

//! Bidirectional OSC transport over UDP.
//!
//! An [`OscTransport`] owns a bound UDP socket and a receive worker running
//! on a dedicated thread. Outgoing packets are dispatched to named peers
//! from any thread; incoming datagrams are decoded and routed by exact
//! address match into [`ReplyQueue`]s where waiters retrieve them
//! synchronously with a timeout. Messages for addresses without a queue go
//! to the catch-all handler if one is registered, and are otherwise logged
//! and discarded.
//!
//! The transport enforces a configurable MTU on outgoing datagrams because
//! the audio engine's OSC input buffer rejects oversized packets; callers
//! are expected to split their schedule across multiple bundles, typically
//! via the [timed queue](crate::timed).

pub mod reply;

pub use reply::ReplyQueue;

use crate::error::{Error, Result};
use crate::osc::{decode_datagram, Message};
use rosc::OscType;
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Capacity of each reply queue before the oldest item is evicted.
const REPLY_QUEUE_CAPACITY: usize = 64;

/// How long the receive worker blocks on the socket before rechecking for
/// shutdown.
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(250);

const RECV_BUFFER_SIZE: usize = 65536;

/// How many successive ports to probe when the requested one is taken.
const BIND_ATTEMPTS: u16 = 32;

type CatchAll = Box<dyn Fn(&str, &[OscType]) + Send + Sync>;

/// A bidirectional OSC/UDP endpoint.
///
/// `OscTransport` is cheap to clone and safe to use concurrently from
/// multiple threads. Cloning yields another handle on the same socket and
/// worker.
#[derive(Clone)]
pub struct OscTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    socket: UdpSocket,
    local_addr: SocketAddr,
    peers: Mutex<HashMap<String, SocketAddr>>,
    default_peer: Mutex<String>,
    queues: Mutex<HashMap<String, Arc<ReplyQueue>>>,
    reply_addresses: Mutex<HashMap<String, String>>,
    catch_all: Mutex<Option<CatchAll>>,
    send_lock: Mutex<()>,
    mtu: usize,
    default_timeout: Duration,
    shutdown: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for OscTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OscTransport")
            .field("local_addr", &self.inner.local_addr)
            .field("peers", &self.inner.peers.lock().unwrap())
            .finish()
    }
}

impl OscTransport {
    /// Binds a UDP socket and starts the receive worker.
    ///
    /// A `port` of 0 picks an ephemeral port. A fixed port that is already
    /// in use is probed upwards a few times before giving up, so several
    /// clients can share a configured base port.
    pub fn bind(port: u16, mtu: usize, default_timeout: Duration) -> Result<OscTransport> {
        let socket = Self::bind_socket(port)?;
        socket
            .set_read_timeout(Some(RECV_POLL_INTERVAL))
            .map_err(Error::Bind)?;
        let local_addr = socket.local_addr().map_err(Error::Bind)?;
        log::debug!("transport listening on {}", local_addr);
        let inner = Arc::new(TransportInner {
            socket,
            local_addr,
            peers: Mutex::new(HashMap::new()),
            default_peer: Mutex::new(String::new()),
            queues: Mutex::new(HashMap::new()),
            reply_addresses: Mutex::new(HashMap::new()),
            catch_all: Mutex::new(None),
            send_lock: Mutex::new(()),
            mtu,
            default_timeout,
            shutdown: AtomicBool::new(false),
            worker: Mutex::new(None),
        });
        let handle = thread::spawn({
            let weak = Arc::downgrade(&inner);
            move || recv_loop(weak)
        });
        *inner.worker.lock().unwrap() = Some(handle);
        Ok(OscTransport { inner })
    }

    fn bind_socket(port: u16) -> Result<UdpSocket> {
        if port == 0 {
            return UdpSocket::bind(("0.0.0.0", 0)).map_err(Error::Bind);
        }
        let mut candidate = port;
        loop {
            match UdpSocket::bind(("0.0.0.0", candidate)) {
                Ok(socket) => return Ok(socket),
                Err(err)
                    if err.kind() == io::ErrorKind::AddrInUse
                        && candidate < port.saturating_add(BIND_ATTEMPTS) =>
                {
                    candidate += 1;
                }
                Err(err) => return Err(Error::Bind(err)),
            }
        }
    }

    /// The local address of the bound socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// The timeout used by blocking reply retrievals when the caller does
    /// not pass one explicitly.
    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    /// Registers a named peer. Names are unique; re-registering a name
    /// replaces its address.
    pub fn add_peer(&self, name: impl Into<String>, addr: SocketAddr) {
        self.inner.peers.lock().unwrap().insert(name.into(), addr);
    }

    /// Looks up a peer's address by name.
    pub fn peer(&self, name: &str) -> Option<SocketAddr> {
        self.inner.peers.lock().unwrap().get(name).copied()
    }

    /// Sets the peer used when a send does not name one.
    pub fn set_default_peer(&self, name: impl Into<String>) {
        *self.inner.default_peer.lock().unwrap() = name.into();
    }

    /// Registers a reply pair: messages sent to `out_addr` expect a reply at
    /// `reply_addr`. A queue for `reply_addr` is created if one does not
    /// exist yet, and is returned either way.
    pub fn add_reply_pair(
        &self,
        out_addr: impl Into<String>,
        reply_addr: impl Into<String>,
    ) -> Arc<ReplyQueue> {
        let reply_addr = reply_addr.into();
        let queue = self.register_queue(&reply_addr);
        self.inner
            .reply_addresses
            .lock()
            .unwrap()
            .insert(out_addr.into(), reply_addr);
        queue
    }

    fn register_queue(&self, reply_addr: &str) -> Arc<ReplyQueue> {
        let mut queues = self.inner.queues.lock().unwrap();
        Arc::clone(queues.entry(reply_addr.to_owned()).or_insert_with(|| {
            Arc::new(ReplyQueue::new(reply_addr, REPLY_QUEUE_CAPACITY))
        }))
    }

    /// The reply address registered for an outgoing command address.
    pub fn reply_address(&self, out_addr: &str) -> Option<String> {
        self.inner
            .reply_addresses
            .lock()
            .unwrap()
            .get(out_addr)
            .cloned()
    }

    /// The reply queue registered for an incoming address.
    pub fn reply_queue(&self, reply_addr: &str) -> Option<Arc<ReplyQueue>> {
        self.inner.queues.lock().unwrap().get(reply_addr).cloned()
    }

    /// Installs a handler for incoming messages that match no reply queue.
    pub fn set_catch_all<F>(&self, handler: F)
    where
        F: Fn(&str, &[OscType]) + Send + Sync + 'static,
    {
        *self.inner.catch_all.lock().unwrap() = Some(Box::new(handler));
    }

    /// Encodes and sends one message to the named peer, or to the default
    /// peer when `peer` is `None`.
    pub fn send_message(&self, message: &Message, peer: Option<&str>) -> Result<()> {
        log::debug!("send: {} {:?}", message.address(), message.arguments());
        let datagram = message.to_raw_osc()?;
        self.send_raw(&datagram, peer)
    }

    /// Sends one pre-encoded datagram.
    ///
    /// Datagram submission order matches call order for sends from a single
    /// thread; a short internal mutex serializes the socket writes.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::PacketTooLarge`] when the datagram exceeds the
    /// configured MTU; the caller must split its schedule across multiple
    /// bundles.
    pub fn send_raw(&self, datagram: &[u8], peer: Option<&str>) -> Result<()> {
        if datagram.len() > self.inner.mtu {
            return Err(Error::PacketTooLarge {
                size: datagram.len(),
                mtu: self.inner.mtu,
            });
        }
        let addr = self.resolve_peer(peer)?;
        let _guard = self.inner.send_lock.lock().unwrap();
        self.inner
            .socket
            .send_to(datagram, addr)
            .map_err(Error::Send)?;
        Ok(())
    }

    fn resolve_peer(&self, peer: Option<&str>) -> Result<SocketAddr> {
        let name = match peer {
            Some(name) => name.to_owned(),
            None => self.inner.default_peer.lock().unwrap().clone(),
        };
        self.inner
            .peers
            .lock()
            .unwrap()
            .get(&name)
            .copied()
            .ok_or(Error::UnknownPeer(name))
    }

    /// Sends one message and, when `await_reply` is set and the message's
    /// address has a registered reply address, blocks on the corresponding
    /// reply queue and returns its payload.
    ///
    /// Returns `Ok(None)` when no reply was awaited. `timeout` defaults to
    /// the transport's configured timeout.
    pub fn msg(
        &self,
        message: Message,
        peer: Option<&str>,
        await_reply: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<OscType>>> {
        self.send_message(&message, peer)?;
        if !await_reply {
            return Ok(None);
        }
        let reply_addr = match self.reply_address(message.address()) {
            Some(addr) => addr,
            None => return Ok(None),
        };
        let queue = match self.reply_queue(&reply_addr) {
            Some(queue) => queue,
            None => return Ok(None),
        };
        let timeout = timeout.unwrap_or(self.inner.default_timeout);
        queue.get(timeout, true).map(Some)
    }

    /// Stops the receive worker and wakes every blocked reply waiter with
    /// [`Error::Shutdown`].
    pub fn close(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        for queue in self.inner.queues.lock().unwrap().values() {
            queue.close();
        }
        let handle = self.inner.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for TransportInner {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

fn recv_loop(weak: Weak<TransportInner>) {
    let mut buffer = [0_u8; RECV_BUFFER_SIZE];
    loop {
        let inner = match weak.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        if inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        match inner.socket.recv_from(&mut buffer) {
            Ok((len, _source)) => match decode_datagram(&buffer[..len]) {
                Ok(packet) => {
                    for message in packet.flatten() {
                        dispatch_message(&inner, message);
                    }
                }
                Err(err) => log::error!("error decoding incoming packet: {}", err),
            },
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut => {}
            Err(err) => {
                if inner.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                log::error!("error receiving next packet from server: {}", err);
            }
        }
    }
}

fn dispatch_message(inner: &TransportInner, message: Message) {
    log::debug!("recv: {} {:?}", message.address(), message.arguments());
    let queue = inner
        .queues
        .lock()
        .unwrap()
        .get(message.address())
        .cloned();
    match queue {
        Some(queue) => queue.put(message.arguments().to_vec()),
        None => {
            let catch_all = inner.catch_all.lock().unwrap();
            match catch_all.as_ref() {
                Some(handler) => handler(message.address(), message.arguments()),
                None => log::debug!("discarding message to unhandled address {}", message.address()),
            }
        }
    }
}

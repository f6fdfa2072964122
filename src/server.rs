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

//! The client façade over a running audio engine.
//!
//! [`Server`] aggregates the pieces provided by the other modules - the
//! [transport](crate::transport), the [ID allocators](crate::alloc), the
//! [bundler](crate::osc::Bundler), and a [timed queue](crate::timed) - and
//! performs the engine handshake on [`connect`](Server::connect):
//!
//! 1. `/notify 1` is sent and the `/done "/notify"` acknowledgment yields
//!    the client id assigned by the engine and the engine's `maxLogins`.
//! 2. `/status` is sent and the `/status.reply` payload is recorded.
//! 3. The per-client default group is created (`/g_new`) by the built-in
//!    init hook, and the façade syncs.
//!
//! The engine's command vocabulary is treated as opaque: callers construct
//! [`Message`]s by address string and argument list. The façade adds the
//! pieces that need shared state - reply correlation, ID management,
//! capture-aware bundling, and the latency offset applied to every bundler.
//!
//! `Server` is cheap to clone and safe to use concurrently by multiple
//! threads.

mod osc_router;

use crate::alloc::IdAllocator;
use crate::error::{Error, Result};
use crate::osc::{bundler, Bundler, Message};
use crate::timed::TimedQueue;
use crate::transport::{OscTransport, ReplyQueue};
use rosc::OscType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// The peer name registered for the engine's control port.
pub const ENGINE_PEER: &str = "engine";

/// The peer name registered for the language interpreter, when configured.
pub const INTERPRETER_PEER: &str = "interpreter";

/// Node IDs start above this floor so small IDs stay free for groups.
const NODE_ID_FLOOR: i32 = 1 << 16;

/// The standard command/reply address pairs of the engine. Messages sent to
/// the left address may await a payload on the right one.
const STANDARD_REPLY_PAIRS: &[(&str, &str)] = &[
    ("/sync", "/synced"),
    ("/status", "/status.reply"),
    ("/version", "/version.reply"),
    ("/quit", "/done"),
    ("/notify", "/done"),
    ("/d_recv", "/done"),
    ("/d_load", "/done"),
    ("/d_loadDir", "/done"),
    ("/b_alloc", "/done"),
    ("/b_allocRead", "/done"),
    ("/b_read", "/done"),
    ("/b_write", "/done"),
    ("/b_free", "/done"),
    ("/b_zero", "/done"),
    ("/b_close", "/done"),
    ("/b_query", "/b_info"),
    ("/n_query", "/n_info"),
    ("/g_queryTree", "/g_queryTree.reply"),
];

/// Configuration for [`Server::connect`].
///
/// All fields have working defaults for a single local engine on the
/// standard control port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host of the default peer [`ENGINE_PEER`].
    pub engine_host: String,
    /// Port of the default peer [`ENGINE_PEER`]. 57110 by convention.
    pub engine_port: u16,
    /// Host of the optional peer [`INTERPRETER_PEER`].
    pub interpreter_host: String,
    /// Port of the optional peer [`INTERPRETER_PEER`]; 57120 by convention.
    /// No interpreter peer is registered when absent.
    pub interpreter_port: Option<u16>,
    /// Bind port for the transport's UDP socket; 0 picks an ephemeral port.
    pub receive_port: u16,
    /// Seconds added to every bundler's base timetag at flatten, so bundles
    /// reach the engine ahead of their scheduled play time.
    pub latency_seconds: f64,
    /// Outgoing datagram size ceiling.
    pub mtu_bytes: usize,
    /// Timeout used by blocking reply retrievals absent an explicit one.
    pub default_timeout_seconds: f64,
    /// Overrides the handshake-assigned client id. Test use.
    pub client_id: Option<i32>,
    /// Overrides the handshake-returned maxLogins. Test use.
    pub max_logins: Option<i32>,
    /// Engine buffer count, split evenly between clients.
    pub num_buffers: i32,
    /// Engine audio bus count, including the hardware buses.
    pub num_audio_buses: i32,
    /// Engine control bus count, split evenly between clients.
    pub num_control_buses: i32,
    /// Hardware input bus channels, reserved below the private audio buses.
    pub num_input_buses: i32,
    /// Hardware output bus channels, reserved below the private audio buses.
    pub num_output_buses: i32,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            engine_host: "127.0.0.1".to_owned(),
            engine_port: 57110,
            interpreter_host: "127.0.0.1".to_owned(),
            interpreter_port: None,
            receive_port: 0,
            latency_seconds: 0.0,
            mtu_bytes: 8192,
            default_timeout_seconds: 5.0,
            client_id: None,
            max_logins: None,
            num_buffers: 1024,
            num_audio_buses: 1024,
            num_control_buses: 16384,
            num_input_buses: 8,
            num_output_buses: 8,
        }
    }
}

/// Options for [`Server::send`].
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Peer name to send to; the engine when absent.
    pub receiver: Option<String>,
    /// Allow redirection into an active capture scope.
    pub bundle: bool,
    /// Block for the reply when the address has a registered reply address.
    pub await_reply: bool,
    /// Reply timeout; the configured default when absent.
    pub timeout: Option<Duration>,
}

impl Default for SendOptions {
    fn default() -> SendOptions {
        SendOptions {
            receiver: None,
            bundle: false,
            await_reply: true,
            timeout: None,
        }
    }
}

impl SendOptions {
    /// Options for a send that may be captured by an active bundler scope.
    pub fn bundled() -> SendOptions {
        SendOptions {
            bundle: true,
            await_reply: false,
            ..SendOptions::default()
        }
    }

    /// Options for a fire-and-forget send.
    pub fn no_reply() -> SendOptions {
        SendOptions {
            await_reply: false,
            ..SendOptions::default()
        }
    }

    /// Sets the peer to send to.
    pub fn receiver(mut self, name: impl Into<String>) -> SendOptions {
        self.receiver = Some(name.into());
        self
    }

    /// Sets the reply timeout.
    pub fn timeout(mut self, timeout: Duration) -> SendOptions {
        self.timeout = Some(timeout);
        self
    }
}

/// The engine state tuple returned by `/status`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServerStatus {
    pub num_ugens: i32,
    pub num_synths: i32,
    pub num_groups: i32,
    pub num_synthdefs: i32,
    pub avg_cpu: f32,
    pub peak_cpu: f32,
    pub nominal_sample_rate: f64,
    pub actual_sample_rate: f64,
}

/// The engine version tuple returned by `/version`.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerVersion {
    pub name: String,
    pub major: i32,
    pub minor: i32,
    pub patch: String,
    pub git_branch: String,
    pub commit: String,
}

/// A parsed engine reply payload.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Reply {
    /// A `/done` acknowledgment, tagged with the command it completes when
    /// the engine includes one.
    Done { command: String },

    /// The `/done "/notify"` acknowledgment carrying the assigned client id
    /// and, when the engine supports it, `maxLogins`.
    NotifyDone {
        client_id: i32,
        max_logins: Option<i32>,
    },

    /// A `/synced` reply carrying the id of the completed `/sync`.
    Synced { id: i32 },

    /// A `/status.reply` payload.
    Status(ServerStatus),

    /// A `/version.reply` payload.
    Version(ServerVersion),

    /// A `/fail` reply naming the failed command.
    Fail { command: String, error: String },
}

impl Reply {
    /// Parses an incoming payload by address. Returns `None` when the
    /// payload matches no known reply shape.
    pub fn parse(addr: &str, args: &[OscType]) -> Option<Reply> {
        let mut router = osc_router::Router::default();
        router
            .addr("/done")
            .expect_str("/notify")
            .capture("client_id")
            .capture_optional("max_logins")
            .handle(|args| {
                Some(Reply::NotifyDone {
                    client_id: args.int("client_id")?,
                    max_logins: args.int("max_logins"),
                })
            });
        router
            .addr("/done")
            .capture_optional("command")
            .capture_rest()
            .handle(|args| {
                Some(Reply::Done {
                    command: args.string("command").unwrap_or_default(),
                })
            });
        router.addr("/synced").capture("id").handle(|args| {
            Some(Reply::Synced {
                id: args.int("id")?,
            })
        });
        router
            .addr("/status.reply")
            .capture("unused")
            .capture("num_ugens")
            .capture("num_synths")
            .capture("num_groups")
            .capture("num_synthdefs")
            .capture("avg_cpu")
            .capture("peak_cpu")
            .capture("nominal_sr")
            .capture("actual_sr")
            .capture_rest()
            .handle(|args| {
                Some(Reply::Status(ServerStatus {
                    num_ugens: args.int("num_ugens")?,
                    num_synths: args.int("num_synths")?,
                    num_groups: args.int("num_groups")?,
                    num_synthdefs: args.int("num_synthdefs")?,
                    avg_cpu: args.float("avg_cpu")?,
                    peak_cpu: args.float("peak_cpu")?,
                    nominal_sample_rate: args.double("nominal_sr")?,
                    actual_sample_rate: args.double("actual_sr")?,
                }))
            });
        router
            .addr("/version.reply")
            .capture("name")
            .capture("major")
            .capture("minor")
            .capture("patch")
            .capture("git_branch")
            .capture("commit")
            .handle(|args| {
                Some(Reply::Version(ServerVersion {
                    name: args.string("name")?,
                    major: args.int("major")?,
                    minor: args.int("minor")?,
                    patch: args.string("patch")?,
                    git_branch: args.string("git_branch")?,
                    commit: args.string("commit")?,
                }))
            });
        router
            .addr("/fail")
            .capture("command")
            .capture("error")
            .capture_rest()
            .handle(|args| {
                Some(Reply::Fail {
                    command: args.string("command")?,
                    error: args.string("error")?,
                })
            });

        router.route(addr, args)
    }
}

type InitHook = Box<dyn Fn(&Server) -> Result<()> + Send>;

/// A connected audio engine client.
///
/// See [the module level documentation](self) for more.
#[derive(Clone)]
pub struct Server(Arc<ServerInner>);

struct ServerInner {
    config: Config,
    transport: OscTransport,
    timed_queue: TimedQueue,
    latency: Mutex<f64>,
    client_id: i32,
    max_logins: i32,
    boot_status: ServerStatus,
    sync_id_counter: AtomicI32,
    node_ids: IdAllocator,
    buffer_ids: IdAllocator,
    audio_bus_ids: IdAllocator,
    control_bus_ids: IdAllocator,
    init_hooks: Mutex<Vec<InitHook>>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("client_id", &self.0.client_id)
            .field("max_logins", &self.0.max_logins)
            .field("transport", &self.0.transport)
            .finish()
    }
}

impl Server {
    /// Connects to a running engine and performs the handshake.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::ProtocolMismatch`] when a handshake reply does
    /// not parse, with [`Error::TimedOut`] when the engine does not answer,
    /// and with [`Error::Bind`] when the local socket cannot be created. A
    /// failed handshake is fatal; no `Server` is returned.
    pub fn connect(config: Config) -> Result<Server> {
        let transport = OscTransport::bind(
            config.receive_port,
            config.mtu_bytes,
            Duration::from_secs_f64(config.default_timeout_seconds),
        )?;
        let engine_addr = resolve_peer_addr(&config.engine_host, config.engine_port)?;
        transport.add_peer(ENGINE_PEER, engine_addr);
        transport.set_default_peer(ENGINE_PEER);
        if let Some(port) = config.interpreter_port {
            let interpreter_addr = resolve_peer_addr(&config.interpreter_host, port)?;
            transport.add_peer(INTERPRETER_PEER, interpreter_addr);
        }
        for (out_addr, reply_addr) in STANDARD_REPLY_PAIRS {
            transport.add_reply_pair(*out_addr, *reply_addr);
        }
        transport.set_catch_all(|addr, args| {
            if addr == "/fail" {
                log::warn!("engine failure reply: {:?}", args);
            } else {
                log::debug!("unhandled message at {}: {:?}", addr, args);
            }
        });

        let (client_id, max_logins) = Self::notify_handshake(&transport, &config)?;
        let boot_status = Self::status_handshake(&transport)?;

        let first_private_bus = config.num_input_buses + config.num_output_buses;
        let (node_low, node_high) = node_range(client_id, max_logins);
        let (buffer_low, buffer_high) = block_range(config.num_buffers, 0, client_id, max_logins);
        let (audio_low, audio_high) = block_range(
            config.num_audio_buses - first_private_bus,
            first_private_bus,
            client_id,
            max_logins,
        );
        let (control_low, control_high) =
            block_range(config.num_control_buses, 0, client_id, max_logins);

        let timed_queue = TimedQueue::new(transport.clone());
        let server = Server(Arc::new(ServerInner {
            latency: Mutex::new(config.latency_seconds),
            client_id,
            max_logins,
            boot_status,
            sync_id_counter: AtomicI32::new(1),
            node_ids: IdAllocator::new(node_low, node_high),
            buffer_ids: IdAllocator::new(buffer_low, buffer_high),
            audio_bus_ids: IdAllocator::new(audio_low, audio_high),
            control_bus_ids: IdAllocator::new(control_low, control_high),
            init_hooks: Mutex::new(Vec::new()),
            transport,
            timed_queue,
            config,
        }));

        server.add_init_hook(|server| {
            server
                .send(
                    Message::new("/g_new")
                        .arg(server.default_group_id())
                        .arg(0)
                        .arg(0),
                    SendOptions::no_reply(),
                )
                .map(|_| ())
        });
        server.run_init_hooks()?;
        server.sync()?;
        Ok(server)
    }

    fn notify_handshake(transport: &OscTransport, config: &Config) -> Result<(i32, i32)> {
        let done_queue = transport
            .reply_queue("/done")
            .expect("standard reply pairs always register /done");
        transport.send_message(
            &Message::new("/notify").arg(1).optional(config.client_id),
            Some(ENGINE_PEER),
        )?;
        let payload = done_queue.get_where(transport.default_timeout(), |args| {
            matches!(args.first(), Some(OscType::String(command)) if command == "/notify")
        })?;
        let (client_id, max_logins) = match Reply::parse("/done", &payload) {
            Some(Reply::NotifyDone {
                client_id,
                max_logins,
            }) => (client_id, max_logins),
            _ => {
                return Err(Error::ProtocolMismatch(format!(
                    "unexpected /notify acknowledgment: {:?}",
                    payload
                )))
            }
        };
        let client_id = config.client_id.unwrap_or(client_id);
        let max_logins = config.max_logins.or(max_logins).unwrap_or(1).max(1);
        Ok((client_id, max_logins))
    }

    fn status_handshake(transport: &OscTransport) -> Result<ServerStatus> {
        let payload = transport
            .msg(Message::new("/status"), Some(ENGINE_PEER), true, None)?
            .ok_or_else(|| {
                Error::ProtocolMismatch("no reply address registered for /status".to_owned())
            })?;
        match Reply::parse("/status.reply", &payload) {
            Some(Reply::Status(status)) => Ok(status),
            _ => Err(Error::ProtocolMismatch(format!(
                "unexpected /status reply: {:?}",
                payload
            ))),
        }
    }

    /// The client id assigned by the engine (or overridden by the config).
    pub fn client_id(&self) -> i32 {
        self.0.client_id
    }

    /// The engine's maximum number of clients.
    pub fn max_logins(&self) -> i32 {
        self.0.max_logins
    }

    /// The id of this client's default group, `client_id + 1` by
    /// convention.
    pub fn default_group_id(&self) -> i32 {
        self.0.client_id + 1
    }

    /// The engine status recorded during the handshake.
    pub fn boot_status(&self) -> ServerStatus {
        self.0.boot_status
    }

    /// The configuration this server was connected with.
    pub fn config(&self) -> &Config {
        &self.0.config
    }

    /// The underlying transport. All outgoing traffic, including traffic
    /// from other threads, goes through this shared instance.
    pub fn transport(&self) -> &OscTransport {
        &self.0.transport
    }

    /// The timed dispatch queue owned by this server.
    pub fn timed_queue(&self) -> &TimedQueue {
        &self.0.timed_queue
    }

    /// The node id allocator for this client's sub-range.
    pub fn node_ids(&self) -> &IdAllocator {
        &self.0.node_ids
    }

    /// The buffer id allocator for this client's sub-range.
    pub fn buffer_ids(&self) -> &IdAllocator {
        &self.0.buffer_ids
    }

    /// The audio bus allocator, starting above the hardware buses.
    pub fn audio_bus_ids(&self) -> &IdAllocator {
        &self.0.audio_bus_ids
    }

    /// The control bus allocator for this client's sub-range.
    pub fn control_bus_ids(&self) -> &IdAllocator {
        &self.0.control_bus_ids
    }

    /// The latency in seconds added to every bundler's base timetag.
    pub fn latency(&self) -> f64 {
        *self.0.latency.lock().unwrap()
    }

    /// Changes the latency applied to bundlers created from now on.
    pub fn set_latency(&self, seconds: f64) {
        *self.0.latency.lock().unwrap() = seconds;
    }

    /// Sends one message with default options: to the engine, not captured
    /// by bundler scopes, awaiting the reply when the address has one
    /// registered.
    pub fn msg(&self, message: impl Into<Message>) -> Result<Option<Vec<OscType>>> {
        self.send(message, SendOptions::default())
    }

    /// Sends one message.
    ///
    /// When `options.bundle` is set and a capture scope is active on this
    /// thread, the message is appended to the innermost bundler at its
    /// current cursor instead of being dispatched, and `Ok(None)` is
    /// returned. Otherwise the message goes out immediately and, with
    /// `options.await_reply` set and a reply address registered for the
    /// message's address, the call blocks for the reply payload.
    pub fn send(
        &self,
        message: impl Into<Message>,
        options: SendOptions,
    ) -> Result<Option<Vec<OscType>>> {
        let message = message.into();
        if options.bundle && bundler::capture_message(&message) {
            return Ok(None);
        }
        self.0.transport.msg(
            message,
            options.receiver.as_deref(),
            options.await_reply,
            options.timeout,
        )
    }

    /// Creates a bundler whose base is `timetag` and whose flatten adds
    /// this server's latency. The bundle is addressed to the engine.
    ///
    /// Use [`Bundler::scope`] to capture façade sends into it.
    pub fn bundler(&self, timetag: f64) -> Bundler {
        Bundler::new(timetag).attach(self.clone(), self.latency(), Some(ENGINE_PEER))
    }

    /// Blocks until the engine has completed every asynchronous command
    /// received before this call.
    ///
    /// Each sync carries a fresh positive id and completes only on the
    /// `/synced` reply carrying that id, so interleaved syncs from several
    /// threads never cross-complete.
    pub fn sync(&self) -> Result<()> {
        self.sync_timeout(self.0.transport.default_timeout())
    }

    /// [`sync`](Server::sync) with an explicit timeout.
    pub fn sync_timeout(&self, timeout: Duration) -> Result<()> {
        let id = self.next_sync_id();
        let queue = self.synced_queue()?;
        self.send(Message::new("/sync").arg(id), SendOptions::no_reply())?;
        queue.get_where(timeout, move |args| {
            matches!(args.first(), Some(OscType::Int(reply_id)) if *reply_id == id)
        })?;
        Ok(())
    }

    fn synced_queue(&self) -> Result<Arc<ReplyQueue>> {
        self.0
            .transport
            .reply_queue("/synced")
            .ok_or_else(|| Error::ProtocolMismatch("/synced queue not registered".to_owned()))
    }

    fn next_sync_id(&self) -> i32 {
        self.0.sync_id_counter.fetch_add(1, Ordering::Relaxed) & i32::MAX
    }

    /// Queries the engine's status.
    pub fn status(&self) -> Result<ServerStatus> {
        Self::status_handshake(&self.0.transport)
    }

    /// Queries the engine's version.
    pub fn version(&self) -> Result<ServerVersion> {
        let payload = self
            .send(Message::new("/version"), SendOptions::default())?
            .ok_or_else(|| {
                Error::ProtocolMismatch("no reply address registered for /version".to_owned())
            })?;
        match Reply::parse("/version.reply", &payload) {
            Some(Reply::Version(version)) => Ok(version),
            _ => Err(Error::ProtocolMismatch(format!(
                "unexpected /version reply: {:?}",
                payload
            ))),
        }
    }

    /// Stops the engine's notifications for this client.
    pub fn notify_off(&self) -> Result<()> {
        let done_queue = self
            .0
            .transport
            .reply_queue("/done")
            .ok_or_else(|| Error::ProtocolMismatch("/done queue not registered".to_owned()))?;
        self.send(Message::new("/notify").arg(0), SendOptions::no_reply())?;
        done_queue.get_where(self.0.transport.default_timeout(), |args| {
            matches!(args.first(), Some(OscType::String(command)) if command == "/notify")
        })?;
        Ok(())
    }

    /// Frees all nodes, clears the engine's schedule, re-creates the
    /// default group via the init hooks, and syncs.
    ///
    /// With `root` set, the whole node tree is freed; otherwise only this
    /// client's default group is emptied.
    pub fn free_all(&self, root: bool) -> Result<()> {
        let group = if root { 0 } else { self.default_group_id() };
        self.send(Message::new("/g_freeAll").arg(group), SendOptions::no_reply())?;
        self.clear_schedule()?;
        self.run_init_hooks()?;
        self.sync()
    }

    /// Removes all bundles from the engine's scheduling queue.
    pub fn clear_schedule(&self) -> Result<()> {
        self.send(Message::new("/clearSched"), SendOptions::no_reply())?;
        Ok(())
    }

    /// Registers a command/reply address pair beyond the standard set.
    pub fn add_reply_pair(
        &self,
        out_addr: impl Into<String>,
        reply_addr: impl Into<String>,
    ) -> Arc<ReplyQueue> {
        self.0.transport.add_reply_pair(out_addr, reply_addr)
    }

    /// Registers a hook invoked after `connect` and after
    /// [`free_all`](Server::free_all), for re-establishing per-session
    /// state such as the default group.
    pub fn add_init_hook<F>(&self, hook: F)
    where
        F: Fn(&Server) -> Result<()> + Send + 'static,
    {
        self.0.init_hooks.lock().unwrap().push(Box::new(hook));
    }

    fn run_init_hooks(&self) -> Result<()> {
        let hooks = std::mem::take(&mut *self.0.init_hooks.lock().unwrap());
        let mut result = Ok(());
        for hook in &hooks {
            result = hook(self);
            if result.is_err() {
                break;
            }
        }
        let mut guard = self.0.init_hooks.lock().unwrap();
        let added_during_run = std::mem::take(&mut *guard);
        *guard = hooks;
        guard.extend(added_during_run);
        result
    }

    /// Asks the engine process to exit and shuts down the local transport
    /// and timed queue. Blocked waiters fail with [`Error::Shutdown`].
    pub fn quit(&self) -> Result<()> {
        let result = self.send(Message::new("/quit"), SendOptions::no_reply());
        self.0.timed_queue.close();
        self.0.transport.close();
        result.map(|_| ())
    }
}

fn resolve_peer_addr(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(Error::Bind)?
        .next()
        .ok_or_else(|| Error::UnknownPeer(format!("{}:{}", host, port)))
}

// The engine guarantees client_id < maxLogins, but a config override may
// not; out-of-range ids are clamped into the last block.
fn node_range(client_id: i32, max_logins: i32) -> (i32, i32) {
    let span = (i32::MAX - NODE_ID_FLOOR) / max_logins;
    let low = NODE_ID_FLOOR + client_id.clamp(0, max_logins - 1) * span;
    (low, low + span - 1)
}

fn block_range(total: i32, offset: i32, client_id: i32, max_logins: i32) -> (i32, i32) {
    let per_client = (total / max_logins).max(1);
    let low = offset + client_id.clamp(0, max_logins - 1) * per_client;
    (low, low + per_client - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_replies() {
        assert_eq!(
            reply("/done", vec![arg("/quit")]),
            Some(Reply::Done {
                command: "/quit".to_owned()
            })
        );
        assert_eq!(
            reply("/done", vec![arg("/notify"), arg(1)]),
            Some(Reply::NotifyDone {
                client_id: 1,
                max_logins: None,
            })
        );
        assert_eq!(
            reply("/done", vec![arg("/notify"), arg(2), arg(4)]),
            Some(Reply::NotifyDone {
                client_id: 2,
                max_logins: Some(4),
            })
        );
        assert_eq!(reply("/synced", vec![1]), Some(Reply::Synced { id: 1 }));
        assert_eq!(
            reply(
                "/status.reply",
                vec![
                    arg(1),
                    arg(8),
                    arg(2),
                    arg(3),
                    arg(4),
                    arg(0.12_f32),
                    arg(0.34_f32),
                    arg(44100.0_f64),
                    arg(44099.9_f64),
                ],
            ),
            Some(Reply::Status(ServerStatus {
                num_ugens: 8,
                num_synths: 2,
                num_groups: 3,
                num_synthdefs: 4,
                avg_cpu: 0.12,
                peak_cpu: 0.34,
                nominal_sample_rate: 44100.0,
                actual_sample_rate: 44099.9,
            }))
        );
        assert_eq!(
            reply(
                "/version.reply",
                vec![
                    arg("scsynth"),
                    arg(3),
                    arg(13),
                    arg(".0"),
                    arg("HEAD"),
                    arg("0badc0de"),
                ],
            ),
            Some(Reply::Version(ServerVersion {
                name: "scsynth".to_owned(),
                major: 3,
                minor: 13,
                patch: ".0".to_owned(),
                git_branch: "HEAD".to_owned(),
                commit: "0badc0de".to_owned(),
            }))
        );
        assert_eq!(
            reply("/fail", vec![arg("/b_alloc"), arg("out of memory")]),
            Some(Reply::Fail {
                command: "/b_alloc".to_owned(),
                error: "out of memory".to_owned(),
            })
        );
        assert_eq!(reply("/nope", Vec::<OscType>::new()), None);
    }

    #[test]
    fn test_status_parse_tolerates_zeroed_integer_fields() {
        let args: Vec<OscType> = (0..10).map(|_| OscType::Int(0)).collect();
        assert_eq!(
            Reply::parse("/status.reply", &args),
            Some(Reply::Status(ServerStatus {
                num_ugens: 0,
                num_synths: 0,
                num_groups: 0,
                num_synthdefs: 0,
                avg_cpu: 0.0,
                peak_cpu: 0.0,
                nominal_sample_rate: 0.0,
                actual_sample_rate: 0.0,
            }))
        );
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.engine_port, 57110);
        assert_eq!(config.mtu_bytes, 8192);
        assert_eq!(config.default_timeout_seconds, 5.0);
        assert_eq!(config.interpreter_port, None);
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = Config {
            engine_port: 57117,
            latency_seconds: 0.2,
            client_id: Some(3),
            ..Config::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_config_partial_json_uses_defaults() {
        let parsed: Config = serde_json::from_str(r#"{"engine_port": 57200}"#).unwrap();
        assert_eq!(parsed.engine_port, 57200);
        assert_eq!(parsed.mtu_bytes, 8192);
    }

    #[test]
    fn test_allocator_ranges_are_disjoint_between_clients() {
        let (low_a, high_a) = block_range(1024, 0, 0, 4);
        let (low_b, high_b) = block_range(1024, 0, 1, 4);
        assert_eq!((low_a, high_a), (0, 255));
        assert_eq!((low_b, high_b), (256, 511));

        let (node_low_a, node_high_a) = node_range(0, 4);
        let (node_low_b, _) = node_range(1, 4);
        assert!(node_low_a > 0);
        assert_eq!(node_high_a + 1, node_low_b);
    }

    fn reply<I, T>(addr: &'static str, args: I) -> Option<Reply>
    where
        I: IntoIterator<Item = T>,
        T: Into<OscType>,
    {
        let args: Vec<OscType> = args.into_iter().map(T::into).collect();
        Reply::parse(addr, &args)
    }

    fn arg(x: impl Into<OscType>) -> OscType {
        x.into()
    }
}

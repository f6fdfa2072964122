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

//! Integration tests against a mock engine.
//!
//! The mock speaks just enough of the engine's reply vocabulary for the
//! handshake and sync machinery: `/notify` is acknowledged with client id 2
//! and maxLogins 4, `/status` with a zeroed status tuple, and `/sync` is
//! echoed as `/synced`. A configurable hold-back lets tests deliver sync
//! replies out of order.

use cantrip::osc::Message;
use cantrip::server::{Config, SendOptions, Server};
use pretty_assertions::assert_eq;
use rosc::{decoder, encoder, OscMessage, OscPacket, OscType};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How the mock answers `/sync`.
#[derive(Clone, Copy, PartialEq)]
enum SyncMode {
    /// Echo every `/sync id` as `/synced id` immediately.
    Echo,
    /// Echo the first sync (the one issued by `connect`), then hold the
    /// next two and deliver their replies in reverse order.
    ReverseLaterPair,
}

struct MockEngine {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MockEngine {
    fn start(sync_mode: SyncMode) -> MockEngine {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let addr = socket.local_addr().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || run_mock(socket, stop, sync_mode))
        };
        MockEngine {
            addr,
            stop,
            handle: Some(handle),
        }
    }

    fn config(&self) -> Config {
        Config {
            engine_host: self.addr.ip().to_string(),
            engine_port: self.addr.port(),
            default_timeout_seconds: 2.0,
            ..Config::default()
        }
    }
}

impl Drop for MockEngine {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_mock(socket: UdpSocket, stop: Arc<AtomicBool>, sync_mode: SyncMode) {
    let mut buffer = [0_u8; 8192];
    let mut answered_first_sync = false;
    let mut held: Vec<(SocketAddr, i32)> = Vec::new();
    while !stop.load(Ordering::SeqCst) {
        let (len, source) = match socket.recv_from(&mut buffer) {
            Ok(received) => received,
            Err(_) => continue,
        };
        let packet = match decoder::decode_udp(&buffer[..len]) {
            Ok((_, packet)) => packet,
            Err(_) => continue,
        };
        for message in flatten(packet) {
            match message.addr.as_str() {
                "/notify" => reply(
                    &socket,
                    source,
                    "/done",
                    vec![
                        OscType::String("/notify".to_owned()),
                        OscType::Int(2),
                        OscType::Int(4),
                    ],
                ),
                "/status" => {
                    reply(
                        &socket,
                        source,
                        "/status.reply",
                        (0..10).map(|_| OscType::Int(0)).collect(),
                    );
                }
                "/sync" => {
                    let id = match message.args.first() {
                        Some(OscType::Int(id)) => *id,
                        _ => continue,
                    };
                    if sync_mode == SyncMode::ReverseLaterPair && answered_first_sync {
                        held.push((source, id));
                        if held.len() == 2 {
                            for (peer, held_id) in held.drain(..).rev() {
                                reply(&socket, peer, "/synced", vec![OscType::Int(held_id)]);
                            }
                        }
                    } else {
                        answered_first_sync = true;
                        reply(&socket, source, "/synced", vec![OscType::Int(id)]);
                    }
                }
                "/version" => reply(
                    &socket,
                    source,
                    "/version.reply",
                    vec![
                        OscType::String("scsynth".to_owned()),
                        OscType::Int(3),
                        OscType::Int(13),
                        OscType::String(".0".to_owned()),
                        OscType::String("HEAD".to_owned()),
                        OscType::String("0badc0de".to_owned()),
                    ],
                ),
                _ => {}
            }
        }
    }
}

fn flatten(packet: OscPacket) -> Vec<OscMessage> {
    match packet {
        OscPacket::Message(message) => vec![message],
        OscPacket::Bundle(bundle) => bundle.content.into_iter().flat_map(flatten).collect(),
    }
}

fn reply(socket: &UdpSocket, target: SocketAddr, addr: &str, args: Vec<OscType>) {
    let datagram = encoder::encode(&OscPacket::Message(OscMessage {
        addr: addr.to_owned(),
        args,
    }))
    .unwrap();
    socket.send_to(&datagram, target).unwrap();
}

#[test]
fn test_handshake() {
    let engine = MockEngine::start(SyncMode::Echo);
    let server = Server::connect(engine.config()).unwrap();

    assert_eq!(server.client_id(), 2);
    assert_eq!(server.max_logins(), 4);
    assert_eq!(server.default_group_id(), 3);
    assert_eq!(server.boot_status().num_synths, 0);
}

#[test]
fn test_handshake_client_id_override() {
    let engine = MockEngine::start(SyncMode::Echo);
    let config = Config {
        client_id: Some(7),
        ..engine.config()
    };
    let server = Server::connect(config).unwrap();
    assert_eq!(server.client_id(), 7);
    assert_eq!(server.default_group_id(), 8);
}

#[test]
fn test_sync_round_trip() {
    let engine = MockEngine::start(SyncMode::Echo);
    let server = Server::connect(engine.config()).unwrap();
    server.sync().unwrap();
    server.sync().unwrap();
}

#[test]
fn test_concurrent_syncs_with_reversed_replies() {
    let engine = MockEngine::start(SyncMode::ReverseLaterPair);
    let server = Server::connect(engine.config()).unwrap();

    // Each caller must receive its own id even though the replies arrive in
    // reverse order.
    let workers: Vec<_> = (0..2)
        .map(|_| {
            let server = server.clone();
            thread::spawn(move || server.sync())
        })
        .collect();
    for worker in workers {
        worker.join().unwrap().unwrap();
    }
}

#[test]
fn test_version_query() {
    let engine = MockEngine::start(SyncMode::Echo);
    let server = Server::connect(engine.config()).unwrap();
    let version = server.version().unwrap();
    assert_eq!(version.name, "scsynth");
    assert_eq!(version.major, 3);
}

#[test]
fn test_capture_scope_redirects_facade_sends() {
    let engine = MockEngine::start(SyncMode::Echo);
    let server = Server::connect(engine.config()).unwrap();

    let mut bundle = server.bundler(0.0).send_on_exit(false);
    bundle
        .scope(|scope| {
            scope.wait(0.5);
            server.send(
                Message::new("/s_new").arg("s1").arg(-1).arg(1).arg(0),
                SendOptions::bundled(),
            )?;
            Ok(())
        })
        .unwrap();

    let messages = bundle.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].0, 0.5);
    assert_eq!(messages[0].1.address(), "/s_new");
}

#[test]
fn test_handshake_protocol_mismatch() {
    // A "mock" that answers /notify with a malformed acknowledgment.
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_millis(50)))
        .unwrap();
    let addr = socket.local_addr().unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let worker = {
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut buffer = [0_u8; 8192];
            while !stop.load(Ordering::SeqCst) {
                if let Ok((_, source)) = socket.recv_from(&mut buffer) {
                    reply(
                        &socket,
                        source,
                        "/done",
                        vec![
                            OscType::String("/notify".to_owned()),
                            OscType::String("bogus".to_owned()),
                        ],
                    );
                }
            }
        })
    };

    let config = Config {
        engine_host: addr.ip().to_string(),
        engine_port: addr.port(),
        default_timeout_seconds: 1.0,
        ..Config::default()
    };
    let result = Server::connect(config);
    assert!(matches!(result, Err(cantrip::Error::ProtocolMismatch(_))));

    stop.store(true, Ordering::SeqCst);
    worker.join().unwrap();
}

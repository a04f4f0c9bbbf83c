use anyhow::{Context, Result};
use crossbeam::channel::{Receiver, TryRecvError};
use log::{debug, info, warn};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::Config;
use crate::protocol::{self, PeerAddr, Reply, Request};
use crate::tracker::journal::Journal;
use crate::tracker::registry::{Registry, Selection};

/// how long one poll waits before the loop re-checks its stop channel
const POLL_TICK: Duration = Duration::from_millis(250);

/// The rendezvous coordinator. Owns the liveness registry, the file
/// directory and the activity journal for the whole process; every handler
/// goes through [`Tracker::handle`], which serializes registry access.
pub struct Tracker {
    registry: Registry,
    journal: Journal,
}

impl Tracker {
    pub fn new(config: &Config) -> Tracker {
        Tracker {
            registry: Registry::new(config.seeder_timeout()),
            journal: Journal::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Handles one datagram and returns the reply to send back, if any.
    /// Malformed input degrades to `bad request`; nothing here can fail.
    pub fn handle(&self, raw: &str, from: SocketAddr) -> Option<String> {
        let request = match Request::parse(raw) {
            Ok(request) => request,
            Err(err) => {
                debug!("bad request from {}: {:?} ({})", from, raw, err);
                return Some(protocol::BAD_REQUEST.to_string());
            }
        };

        match request {
            Request::Active(addr) => {
                if self.registry.heartbeat(&addr) {
                    self.journal.record(format!("{} connected", addr));
                    info!("{} connected", addr);
                }
                None
            }
            Request::Seed { file, addr } => {
                if self.registry.announce(&file, &addr) {
                    self.journal
                        .record_file(&file, format!("{} started seeding", addr));
                    info!("{} started seeding {}", addr, file);
                }
                None
            }
            Request::Get(file) => {
                self.journal.record(format!("{} requested {}", from, file));
                let reply = match self.registry.select(&file) {
                    Selection::UnknownFile => Reply::FileNotFound,
                    Selection::NoSeeder { evicted } => {
                        self.note_evicted(&file, &evicted);
                        Reply::FileNotFound
                    }
                    Selection::Seeder { addr, evicted } => {
                        self.note_evicted(&file, &evicted);
                        self.journal
                            .record(format!("{} receives {} from {}", from, file, addr));
                        Reply::ReceiveFrom(addr)
                    }
                };
                Some(reply.encode())
            }
            Request::Log(line) => {
                self.journal.record(line);
                None
            }
        }
    }

    fn note_evicted(&self, file: &str, evicted: &[PeerAddr]) {
        for addr in evicted {
            self.journal.record_file(file, format!("{} disconnected", addr));
            info!("{} disconnected, dropped from {}", addr, file);
        }
    }

    /// Binds the tracker socket and serves datagrams until `stop` fires or
    /// its sender goes away.
    pub fn run(&self, addr: SocketAddr, stop: Receiver<()>) -> Result<()> {
        let mut socket = UdpSocket::bind(addr)
            .with_context(|| format!("failed to bind tracker socket on {}", addr))?;
        let mut poll = Poll::new()?;
        let token = Token(0);
        poll.registry()
            .register(&mut socket, token, Interest::READABLE)?;
        let mut events = Events::with_capacity(1024);
        let mut buf = [0u8; 2048];

        info!("tracker listening on {}", addr);

        loop {
            match stop.try_recv() {
                Err(TryRecvError::Empty) => {}
                _ => return Ok(()),
            }
            poll.poll(&mut events, Some(POLL_TICK))?;

            // drain everything that is ready before polling again
            loop {
                match socket.recv_from(&mut buf) {
                    Ok((len, from)) => {
                        let reply = match std::str::from_utf8(&buf[..len]) {
                            Ok(raw) => self.handle(raw, from),
                            Err(_) => Some(protocol::BAD_REQUEST.to_string()),
                        };
                        if let Some(reply) = reply {
                            if let Err(err) = socket.send_to(reply.as_bytes(), from) {
                                warn!("failed to reply to {}: {}", from, err);
                            }
                        }
                    }
                    Err(ref err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) => {
                        warn!("tracker socket error: {}", err);
                        break;
                    }
                }
            }
        }
    }

    /// Operator console on stdin: `request logs`, `file logs all`,
    /// `file logs <file>`. Runs until stdin closes.
    pub fn spawn_console(self: &Arc<Self>) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        thread::spawn(move || {
            let stdin = std::io::stdin();
            let mut line = String::new();
            loop {
                line.clear();
                match stdin.read_line(&mut line) {
                    Ok(0) | Err(_) => return,
                    Ok(_) => tracker.console_command(line.trim()),
                }
            }
        })
    }

    fn console_command(&self, command: &str) {
        if command == "request logs" {
            for line in self.journal.requests() {
                println!("{}", line);
            }
        } else if command == "file logs all" {
            for line in self.journal.file_events() {
                println!("{}", line);
            }
        } else if let Some(file) = command.strip_prefix("file logs ") {
            match self.journal.file_events_for(file.trim()) {
                Some(lines) => {
                    for line in lines {
                        println!("{}", line);
                    }
                }
                None => println!("unknown file {}", file.trim()),
            }
        } else if !command.is_empty() {
            println!("invalid command");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tracker_with_timeout(ms: u64) -> Tracker {
        let config = Config {
            seeder_timeout_ms: ms,
            ..Config::default()
        };
        Tracker::new(&config)
    }

    fn requester() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[test]
    fn test_seed_then_get_resolves() {
        let tracker = tracker_with_timeout(2_000);
        assert_eq!(
            tracker.handle("seed movie.mp4 127.0.0.1:9001", requester()),
            None
        );
        assert_eq!(
            tracker.handle("get movie.mp4", requester()),
            Some("receive_from 127.0.0.1:9001".to_string())
        );
    }

    #[test]
    fn test_get_unknown_file_leaves_registry_alone() {
        let tracker = tracker_with_timeout(2_000);
        assert_eq!(
            tracker.handle("get unknown.txt", requester()),
            Some("file not found".to_string())
        );
        assert!(tracker.registry().seeders("unknown.txt").is_none());
    }

    #[test]
    fn test_garbage_gets_bad_request() {
        let tracker = tracker_with_timeout(2_000);
        assert_eq!(
            tracker.handle("gimme movie.mp4", requester()),
            Some("bad request".to_string())
        );
        assert_eq!(
            tracker.handle("", requester()),
            Some("bad request".to_string())
        );
    }

    #[test]
    fn test_active_journals_connection_once() {
        let tracker = tracker_with_timeout(2_000);
        tracker.handle("active 127.0.0.1:9001", requester());
        tracker.handle("active 127.0.0.1:9001", requester());

        let connected: Vec<String> = tracker
            .journal()
            .requests()
            .into_iter()
            .filter(|line| line.ends_with("127.0.0.1:9001 connected"))
            .collect();
        assert_eq!(connected.len(), 1);
        assert!(tracker
            .registry()
            .is_active(&PeerAddr::new("127.0.0.1", 9001)));
    }

    #[test]
    fn test_log_line_is_kept_verbatim() {
        let tracker = tracker_with_timeout(2_000);
        tracker.handle("log result 127.0.0.1:9002 received movie.mp4", requester());
        let lines = tracker.journal().requests();
        assert!(lines
            .last()
            .unwrap()
            .ends_with("result 127.0.0.1:9002 received movie.mp4"));
    }

    #[test]
    fn test_silent_seeder_expires_and_is_evicted() {
        let tracker = tracker_with_timeout(50);
        tracker.handle("seed movie.mp4 127.0.0.1:9001", requester());
        std::thread::sleep(Duration::from_millis(80));

        assert_eq!(
            tracker.handle("get movie.mp4", requester()),
            Some("file not found".to_string())
        );
        assert!(tracker.registry().seeders("movie.mp4").unwrap().is_empty());
        let events = tracker.journal().file_events_for("movie.mp4").unwrap();
        assert!(events.iter().any(|line| line.contains("disconnected")));
    }

    #[test]
    fn test_heartbeat_keeps_seeder_selectable() {
        let tracker = tracker_with_timeout(100);
        tracker.handle("seed movie.mp4 127.0.0.1:9001", requester());
        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(40));
            tracker.handle("active 127.0.0.1:9001", requester());
        }
        assert_eq!(
            tracker.handle("get movie.mp4", requester()),
            Some("receive_from 127.0.0.1:9001".to_string())
        );
    }
}

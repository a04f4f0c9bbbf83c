use anyhow::{bail, Context, Result};
use bytes::Bytes;
use crossbeam::channel::{bounded, select, tick, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::Config;
use crate::peer::discovery::{DiscoveryClient, RetryPolicy, TrackerClient};
use crate::peer::transfer::{self, FetchOutcome};
use crate::protocol::{PeerAddr, Request};
use crate::storage::FileStore;

/// how long the accept loop parks on the stop channel between drains
const ACCEPT_TICK: Duration = Duration::from_millis(50);

/// Local, append-only log of what this peer saw; printed by the console on
/// `request logs`, independent of what gets reported to the tracker.
#[derive(Debug, Default)]
pub struct EventLog {
    lines: Mutex<Vec<String>>,
}

impl EventLog {
    pub fn new() -> EventLog {
        EventLog::default()
    }

    pub fn push(&self, line: impl Into<String>) {
        self.lines.lock().unwrap().push(line.into());
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

/// A heartbeat loop that owns its thread. Stopping (or dropping) it joins
/// the thread; nothing here outlives the node that started it.
pub struct Heartbeat {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    /// Announces `active <addr>` to the tracker on a fixed cadence until
    /// stopped.
    pub fn start(client: TrackerClient, addr: PeerAddr, interval: Duration) -> Heartbeat {
        let (stop_tx, stop_rx) = bounded(1);
        let handle = thread::spawn(move || {
            let beat = tick(interval);
            let request = Request::Active(addr);
            loop {
                select! {
                    recv(beat) -> _ => {
                        if let Err(err) = client.notify(&request) {
                            warn!("heartbeat failed: {}", err);
                        }
                    }
                    recv(stop_rx) -> _ => return,
                }
            }
        });
        Heartbeat {
            stop: stop_tx,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One process participating in the swarm. The role lives in `content`: a
/// node without bytes is a downloader, a node with bytes seeds. The
/// transition happens at most once, after a successful fetch.
pub struct PeerNode {
    addr: PeerAddr,
    file: String,
    content: Option<Bytes>,
    config: Config,
    store: FileStore,
    tracker: TrackerClient,
    log: Arc<EventLog>,
}

impl PeerNode {
    /// Starts in the seeder state with the file's bytes already in hand.
    pub fn seeder(
        addr: PeerAddr,
        tracker: SocketAddr,
        file: String,
        content: Bytes,
        config: Config,
    ) -> PeerNode {
        PeerNode::build(addr, tracker, file, Some(content), config)
    }

    /// Starts in the downloader state; the content has to be discovered and
    /// fetched first.
    pub fn downloader(
        addr: PeerAddr,
        tracker: SocketAddr,
        file: String,
        config: Config,
    ) -> PeerNode {
        PeerNode::build(addr, tracker, file, None, config)
    }

    fn build(
        addr: PeerAddr,
        tracker: SocketAddr,
        file: String,
        content: Option<Bytes>,
        config: Config,
    ) -> PeerNode {
        let store = FileStore::new(&config.db_dir);
        let tracker = TrackerClient::new(tracker, config.reply_wait());
        PeerNode {
            addr,
            file,
            content,
            config,
            store,
            tracker,
            log: Arc::new(EventLog::new()),
        }
    }

    pub fn is_seeder(&self) -> bool {
        self.content.is_some()
    }

    pub fn event_log(&self) -> Arc<EventLog> {
        Arc::clone(&self.log)
    }

    /// Runs the node until `stop` fires: fetch first if the content is
    /// missing, then seed. Discovery exhaustion is the one fatal outcome.
    pub fn run(mut self, stop: Receiver<()>) -> Result<()> {
        if self.content.is_none() {
            self.download()?;
        }
        self.seed(stop)
    }

    /// Discovery, then a direct fetch. A failed fetch is reported to the
    /// tracker and the node carries on empty-handed; only a spent discovery
    /// budget aborts the flow.
    fn download(&mut self) -> Result<()> {
        let policy = RetryPolicy {
            attempts: self.config.discovery_attempts,
            backoff: self.config.discovery_backoff(),
        };
        let discovery =
            DiscoveryClient::new(self.tracker.clone(), policy, Arc::clone(&self.log));

        let seeder = match discovery.discover(&self.file) {
            Some(seeder) => seeder,
            None => {
                self.report("failed to get seeder address");
                bail!("no seeder found for {}", self.file);
            }
        };

        match transfer::fetch(&seeder, &self.file, self.config.transfer_timeout()) {
            FetchOutcome::Received(content) => {
                let path = self.store.save_download(&self.addr, &self.file, &content)?;
                info!("saved {} to {}", self.file, path.display());
                let line = format!("received {} from {}", self.file, seeder);
                self.log.push(line.clone());
                self.report(&line);
                self.content = Some(content);
            }
            FetchOutcome::NotFound => {
                self.report(&format!("{} not found on seeder {}", self.file, seeder));
            }
            FetchOutcome::Refused => {
                self.report(&format!("failed to connect to seeder {}", seeder));
            }
            FetchOutcome::TimedOut => {
                self.report(&format!("timeout to receive {} from {}", self.file, seeder));
            }
            FetchOutcome::Failed(cause) => {
                self.report(&format!("exception {}", cause));
            }
        }
        Ok(())
    }

    /// Announces the seed, keeps the heartbeat running and serves transfer
    /// connections until `stop` fires.
    fn seed(&self, stop: Receiver<()>) -> Result<()> {
        self.tracker
            .notify(&Request::Seed {
                file: self.file.clone(),
                addr: self.addr.clone(),
            })
            .context("failed to announce to tracker")?;
        info!("{} seeding {}", self.addr, self.file);

        let heartbeat = Heartbeat::start(
            self.tracker.clone(),
            self.addr.clone(),
            self.config.heartbeat_interval(),
        );
        let result = self.accept_loop(&stop);
        heartbeat.stop();
        result
    }

    /// Serves inbound transfer connections, each on its own thread, so one
    /// stalled peer never holds up the rest. Parks on the stop channel
    /// between drains instead of blocking in accept.
    fn accept_loop(&self, stop: &Receiver<()>) -> Result<()> {
        let bind_addr = self
            .addr
            .socket_addr()
            .with_context(|| format!("cannot resolve own address {}", self.addr))?;
        let listener = TcpListener::bind(bind_addr)
            .with_context(|| format!("failed to listen on {}", self.addr))?;
        listener.set_nonblocking(true)?;

        loop {
            loop {
                match listener.accept() {
                    Ok((stream, from)) => {
                        debug!("transfer connection from {}", from);
                        let file = self.file.clone();
                        let content = self.content.clone();
                        let timeout = self.config.transfer_timeout();
                        thread::spawn(move || {
                            if let Err(err) =
                                transfer::serve(stream, &file, content.as_ref(), timeout)
                            {
                                warn!("transfer to {} failed: {}", from, err);
                            }
                        });
                    }
                    Err(ref err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) => {
                        warn!("accept failed: {}", err);
                        break;
                    }
                }
            }
            match stop.recv_timeout(ACCEPT_TICK) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => return Ok(()),
            }
        }
    }

    /// Best-effort download-outcome report to the tracker's log channel.
    fn report(&self, message: &str) {
        let line = format!("result {} {}", self.addr, message);
        if let Err(err) = self.tracker.notify(&Request::Log(line)) {
            warn!("failed to report to tracker: {}", err);
        }
    }

    /// Peer console on stdin: `request logs` prints the local event log.
    pub fn spawn_console(log: Arc<EventLog>) -> JoinHandle<()> {
        thread::spawn(move || {
            let stdin = std::io::stdin();
            let mut line = String::new();
            loop {
                line.clear();
                match stdin.read_line(&mut line) {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {
                        let command = line.trim();
                        if command == "request logs" {
                            for entry in log.lines() {
                                println!("{}", entry);
                            }
                        } else if !command.is_empty() {
                            println!("invalid command");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::server::Tracker;
    use std::net::UdpSocket;

    /// Binds to an ephemeral port and frees it again. Racy in principle,
    /// fine for loopback tests.
    fn free_udp_addr() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap()
    }

    fn free_tcp_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn test_config(db_dir: &std::path::Path) -> Config {
        Config {
            seeder_timeout_ms: 2_000,
            heartbeat_interval_ms: 100,
            discovery_attempts: 10,
            discovery_backoff_ms: 100,
            reply_wait_ms: 300,
            transfer_timeout_ms: 2_000,
            db_dir: db_dir.to_string_lossy().into_owned(),
            ..Config::default()
        }
    }

    /// The whole swarm on loopback: tracker up, one node seeding, one node
    /// downloading; the downloader ends up seeding the same bytes.
    #[test]
    fn test_downloader_becomes_seeder() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let content = Bytes::from_static(b"exactly these bytes");

        let tracker_addr = free_udp_addr();
        let tracker = Arc::new(Tracker::new(&config));
        let (tracker_stop, tracker_stop_rx) = bounded(1);
        let tracker_handle = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || tracker.run(tracker_addr, tracker_stop_rx))
        };
        // the seed announcement is a datagram; make sure the tracker is
        // already bound when it goes out
        thread::sleep(Duration::from_millis(100));

        let seeder_addr = PeerAddr::new("127.0.0.1", free_tcp_port());
        let seeder = PeerNode::seeder(
            seeder_addr.clone(),
            tracker_addr,
            "movie.mp4".to_string(),
            content.clone(),
            config.clone(),
        );
        let (seeder_stop, seeder_stop_rx) = bounded(1);
        let seeder_handle = thread::spawn(move || seeder.run(seeder_stop_rx));

        // give the seed announcement and a heartbeat time to land
        thread::sleep(Duration::from_millis(300));

        let downloader_addr = PeerAddr::new("127.0.0.1", free_tcp_port());
        let downloader = PeerNode::downloader(
            downloader_addr.clone(),
            tracker_addr,
            "movie.mp4".to_string(),
            config.clone(),
        );
        let log = downloader.event_log();
        let (down_stop, down_stop_rx) = bounded(1);
        let down_handle = thread::spawn(move || downloader.run(down_stop_rx));

        // the download should land on disk under the owner-qualified name
        let expected = dir.path().join(format!(
            "{}_{}_movie.mp4",
            downloader_addr.host, downloader_addr.port
        ));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !expected.exists() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(std::fs::read(&expected).unwrap(), content.as_ref());
        assert!(log
            .lines()
            .iter()
            .any(|line| line.contains("receive_from")));

        // the ex-downloader now serves the file itself
        thread::sleep(Duration::from_millis(200));
        assert_eq!(
            transfer::fetch(&downloader_addr, "movie.mp4", Duration::from_secs(2)),
            FetchOutcome::Received(content.clone())
        );

        seeder_stop.send(()).unwrap();
        down_stop.send(()).unwrap();
        tracker_stop.send(()).unwrap();
        seeder_handle.join().unwrap().unwrap();
        down_handle.join().unwrap().unwrap();
        tracker_handle.join().unwrap().unwrap();
    }

    /// A downloader with no seeders anywhere exhausts its budget and fails.
    #[test]
    fn test_discovery_exhaustion_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            discovery_attempts: 2,
            discovery_backoff_ms: 50,
            reply_wait_ms: 200,
            db_dir: dir.path().to_string_lossy().into_owned(),
            ..Config::default()
        };

        let tracker_addr = free_udp_addr();
        let tracker = Arc::new(Tracker::new(&config));
        let (tracker_stop, tracker_stop_rx) = bounded(1);
        let tracker_handle = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || tracker.run(tracker_addr, tracker_stop_rx))
        };

        let node = PeerNode::downloader(
            PeerAddr::new("127.0.0.1", free_tcp_port()),
            tracker_addr,
            "ghost.bin".to_string(),
            config,
        );
        let (_stop, stop_rx) = bounded::<()>(1);
        assert!(node.run(stop_rx).is_err());

        // the failure got reported on the tracker's log channel
        thread::sleep(Duration::from_millis(200));
        assert!(tracker
            .journal()
            .requests()
            .iter()
            .any(|line| line.contains("failed to get seeder address")));

        tracker_stop.send(()).unwrap();
        tracker_handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_heartbeat_stops_cleanly() {
        let tracker_addr = free_udp_addr();
        let client = TrackerClient::new(tracker_addr, Duration::from_millis(100));
        let heartbeat = Heartbeat::start(
            client,
            PeerAddr::new("127.0.0.1", 9001),
            Duration::from_millis(20),
        );
        thread::sleep(Duration::from_millis(60));
        // stop() joins; returning at all proves the thread exited
        heartbeat.stop();
    }
}

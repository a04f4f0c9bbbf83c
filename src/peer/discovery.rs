use anyhow::{Context, Result};
use log::{debug, warn};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::peer::node::EventLog;
use crate::protocol::{PeerAddr, Reply, Request};

/// Knobs for the discovery loop. Configuration, not protocol: the wire
/// format is the same no matter how patient a peer is.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

/// One peer's handle on the tracker. Datagrams may vanish in transit; the
/// caller decides whether that matters.
#[derive(Debug, Clone)]
pub struct TrackerClient {
    tracker: SocketAddr,
    reply_wait: Duration,
}

impl TrackerClient {
    pub fn new(tracker: SocketAddr, reply_wait: Duration) -> TrackerClient {
        TrackerClient {
            tracker,
            reply_wait,
        }
    }

    /// Fire-and-forget datagram, for the message kinds the tracker never
    /// answers (`active`, `seed`, `log`).
    pub fn notify(&self, request: &Request) -> Result<()> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").context("failed to bind udp socket")?;
        socket.send_to(request.encode().as_bytes(), self.tracker)?;
        Ok(())
    }

    /// Sends one request and waits up to the configured bound for a reply.
    /// `None` means no reply arrived in time, which on a datagram channel is
    /// an outcome, not an error.
    pub fn query(&self, request: &Request) -> Result<Option<String>> {
        let mut socket = UdpSocket::bind("0.0.0.0:0".parse()?)?;
        let mut poll = Poll::new()?;
        let token = Token(0);
        poll.registry()
            .register(&mut socket, token, Interest::READABLE)?;
        let mut events = Events::with_capacity(8);

        socket.send_to(request.encode().as_bytes(), self.tracker)?;
        poll.poll(&mut events, Some(self.reply_wait))?;

        let mut buf = [0u8; 2048];
        match socket.recv_from(&mut buf) {
            Ok((len, _)) => Ok(Some(String::from_utf8_lossy(&buf[..len]).into_owned())),
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// Turns "I want file F" into a live seeder address, tolerating dropped
/// datagrams and a tracker that has nobody to offer yet.
pub struct DiscoveryClient {
    client: TrackerClient,
    policy: RetryPolicy,
    log: Arc<EventLog>,
}

impl DiscoveryClient {
    pub fn new(client: TrackerClient, policy: RetryPolicy, log: Arc<EventLog>) -> DiscoveryClient {
        DiscoveryClient {
            client,
            policy,
            log,
        }
    }

    /// Queries the tracker up to the configured attempt cap, sleeping the
    /// backoff between attempts. Every attempt's raw outcome lands in the
    /// local event log. `None` is definitive: the budget is spent.
    pub fn discover(&self, file: &str) -> Option<PeerAddr> {
        let request = Request::Get(file.to_string());
        for attempt in 1..=self.policy.attempts {
            let raw = match self.client.query(&request) {
                Ok(Some(reply)) => reply,
                Ok(None) => "no reply".to_string(),
                Err(err) => format!("error: {}", err),
            };
            self.log.push(format!("{} {}", file, raw));
            debug!(
                "discovery attempt {}/{} for {}: {}",
                attempt, self.policy.attempts, file, raw
            );

            if let Ok(Reply::ReceiveFrom(addr)) = Reply::parse(&raw) {
                return Some(addr);
            }
            if attempt < self.policy.attempts {
                thread::sleep(self.policy.backoff);
            }
        }
        warn!(
            "no seeder found for {} after {} attempts",
            file, self.policy.attempts
        );
        None
    }
}

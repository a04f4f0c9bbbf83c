use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::protocol::PeerAddr;

/// Outcome of one selection pass over a file's seeder sequence. Evicted
/// addresses are reported so the caller can journal the disconnections.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    UnknownFile,
    /// every remaining entry was stale and has been evicted
    NoSeeder { evicted: Vec<PeerAddr> },
    Seeder {
        addr: PeerAddr,
        evicted: Vec<PeerAddr>,
    },
}

#[derive(Debug, Default)]
struct State {
    /// last heartbeat per peer
    alive: HashMap<PeerAddr, Instant>,
    /// announced seeders per file, in announcement order, no duplicates
    files: HashMap<String, Vec<PeerAddr>>,
}

/// Liveness registry and file directory. Both maps live behind one lock so
/// that the draw-check-evict loop in [`Registry::select`] is a single
/// critical section; no caller ever sees one map updated without the other.
#[derive(Debug)]
pub struct Registry {
    timeout: Duration,
    state: Mutex<State>,
}

impl Registry {
    pub fn new(timeout: Duration) -> Registry {
        Registry {
            timeout,
            state: Mutex::new(State::default()),
        }
    }

    /// Refreshes the peer's heartbeat. Returns true when the peer was not
    /// known before.
    pub fn heartbeat(&self, addr: &PeerAddr) -> bool {
        let mut state = self.state.lock().unwrap();
        state.alive.insert(addr.clone(), Instant::now()).is_none()
    }

    /// Registers a seeder for a file and refreshes its heartbeat. Returns
    /// true when the address was actually appended; announcing twice is a
    /// no-op for the directory.
    pub fn announce(&self, file: &str, addr: &PeerAddr) -> bool {
        let mut state = self.state.lock().unwrap();
        state.alive.insert(addr.clone(), Instant::now());
        let seeders = state.files.entry(file.to_string()).or_default();
        if seeders.contains(addr) {
            false
        } else {
            seeders.push(addr.clone());
            true
        }
    }

    /// True while the peer has heartbeated within the timeout threshold.
    pub fn is_active(&self, addr: &PeerAddr) -> bool {
        let state = self.state.lock().unwrap();
        state
            .alive
            .get(addr)
            .map_or(false, |last| last.elapsed() <= self.timeout)
    }

    /// Draws uniformly at random from the file's remaining seeders until a
    /// live one turns up. A stale draw is evicted from both maps on the spot
    /// (lazy eviction: dead entries survive until a query happens to draw
    /// them) and the draw repeats over what is left. Terminates with a live
    /// seeder or an empty sequence.
    pub fn select(&self, file: &str) -> Selection {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let seeders = match state.files.get_mut(file) {
            Some(seeders) => seeders,
            None => return Selection::UnknownFile,
        };

        let mut evicted = Vec::new();
        let mut rng = rand::thread_rng();
        while !seeders.is_empty() {
            let pick = rng.gen_range(0..seeders.len());
            let last = state.alive.get(&seeders[pick]).copied();
            if last.map_or(false, |at| at.elapsed() <= self.timeout) {
                return Selection::Seeder {
                    addr: seeders[pick].clone(),
                    evicted,
                };
            }
            let dead = seeders.remove(pick);
            state.alive.remove(&dead);
            evicted.push(dead);
        }
        Selection::NoSeeder { evicted }
    }

    /// Snapshot of a file's seeder sequence, if the file is known.
    pub fn seeders(&self, file: &str) -> Option<Vec<PeerAddr>> {
        let state = self.state.lock().unwrap();
        state.files.get(file).cloned()
    }
}

use bytes::Bytes;
use log::debug;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use crate::protocol::{self, PeerAddr, Request};

/// Result of one direct fetch from a seeder. Every failure keeps a
/// human-readable cause so the peer can report it to the tracker.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Received(Bytes),
    /// the seeder answered with the not-found sentinel
    NotFound,
    Refused,
    TimedOut,
    Failed(String),
}

/// Fetches `file` from a seeder. The payload carries no length framing; the
/// seeder signals completion by closing its end, so this reads to EOF. Both
/// the connect and the read are bounded by `timeout`.
pub fn fetch(seeder: &PeerAddr, file: &str, timeout: Duration) -> FetchOutcome {
    let addr = match seeder.socket_addr() {
        Ok(addr) => addr,
        Err(err) => return FetchOutcome::Failed(err.to_string()),
    };
    match try_fetch(addr, file, timeout) {
        Ok(content) => {
            if content.as_ref() == protocol::FILE_NOT_FOUND.as_bytes() {
                FetchOutcome::NotFound
            } else {
                FetchOutcome::Received(content)
            }
        }
        Err(err) => match err.kind() {
            ErrorKind::ConnectionRefused => FetchOutcome::Refused,
            ErrorKind::TimedOut | ErrorKind::WouldBlock => FetchOutcome::TimedOut,
            _ => FetchOutcome::Failed(err.to_string()),
        },
    }
}

fn try_fetch(addr: SocketAddr, file: &str, timeout: Duration) -> io::Result<Bytes> {
    let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let request = Request::Get(file.to_string());
    stream.write_all(request.encode().as_bytes())?;
    debug!("sent {:?} to {}", request.encode(), addr);

    let mut content = Vec::new();
    stream.read_to_end(&mut content)?;
    Ok(Bytes::from(content))
}

/// Answers one inbound transfer connection: a single `get <file>` request,
/// then the payload (or the not-found sentinel) and an end-of-stream close.
/// A node holding no content serves only the sentinel.
pub fn serve(
    mut stream: TcpStream,
    file: &str,
    content: Option<&Bytes>,
    timeout: Duration,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let mut buf = [0u8; 1024];
    let len = stream.read(&mut buf)?;
    let raw = String::from_utf8_lossy(&buf[..len]);

    let response = match Request::parse(&raw) {
        Ok(Request::Get(requested)) => match content {
            Some(content) if requested == file => content.clone(),
            _ => Bytes::from_static(protocol::FILE_NOT_FOUND.as_bytes()),
        },
        _ => Bytes::from_static(protocol::BAD_REQUEST.as_bytes()),
    };
    stream.write_all(&response)?;
    // close our end so the receiver's read-to-EOF terminates
    stream.shutdown(Shutdown::Write)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    const TIMEOUT: Duration = Duration::from_secs(2);

    /// One-shot seeder on an ephemeral port.
    fn fake_seeder(file: &'static str, content: &'static [u8]) -> PeerAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            serve(stream, file, Some(&Bytes::from_static(content)), TIMEOUT).unwrap();
        });
        PeerAddr::new("127.0.0.1", port)
    }

    #[test]
    fn test_fetch_round_trip() {
        let seeder = fake_seeder("movie.mp4", b"the whole movie");
        assert_eq!(
            fetch(&seeder, "movie.mp4", TIMEOUT),
            FetchOutcome::Received(Bytes::from_static(b"the whole movie"))
        );
    }

    #[test]
    fn test_wrong_file_yields_not_found() {
        let seeder = fake_seeder("movie.mp4", b"the whole movie");
        assert_eq!(
            fetch(&seeder, "other.mp4", TIMEOUT),
            FetchOutcome::NotFound
        );
    }

    #[test]
    fn test_empty_handed_seeder_serves_sentinel() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            serve(stream, "movie.mp4", None, TIMEOUT).unwrap();
        });
        let seeder = PeerAddr::new("127.0.0.1", port);
        assert_eq!(
            fetch(&seeder, "movie.mp4", TIMEOUT),
            FetchOutcome::NotFound
        );
    }

    #[test]
    fn test_nobody_listening_is_refused() {
        // bind to learn a free port, then close it again
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let seeder = PeerAddr::new("127.0.0.1", port);
        assert_eq!(
            fetch(&seeder, "movie.mp4", Duration::from_millis(500)),
            FetchOutcome::Refused
        );
    }
}

//! Connection state machine and socket I/O.
//!
//! A [`Connection`] owns the sockets of one logical protocol peer and
//! enforces the legal state transitions:
//!
//! ```text
//! Down      -> Listened    bind + listen (SO_REUSEADDR, max backlog)
//! Listened  -> Accepted    accept one pending connection
//! Accepted  -> Listened    close the peer, keep listening
//! Accepted  -> Down        close peer and listening socket
//! Listened  -> Down        close the listening socket
//! Down      -> Connected   outbound TCP connect
//! Connected -> Down        close the outbound socket
//! ```
//!
//! Every other pair fails with an unsupported-transition error and
//! leaves the state unchanged. I/O goes through the single active
//! socket: the outbound one when `Connected`, the accepted peer when
//! `Accepted`, none otherwise.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info};

use crate::codec;
use crate::error::{ConnectionError, IoError, StageError};
use crate::msg::{Message, PROTO_POS, PROTO_VMC};
use crate::stream::ByteStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetState {
    Down,
    Connected,
    Listened,
    Accepted,
}

impl NetState {
    /// A connection is established when a peer socket exists.
    pub fn is_established(self) -> bool {
        matches!(self, NetState::Connected | NetState::Accepted)
    }
}

impl fmt::Display for NetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetState::Down => "DOWN",
            NetState::Connected => "CONNECTED",
            NetState::Listened => "LISTENED",
            NetState::Accepted => "ACCEPTED",
        };
        f.write_str(name)
    }
}

/// The sockets backing each state.
enum Link {
    Down,
    Connected(TcpStream),
    Listened(TcpListener),
    Accepted {
        listener: TcpListener,
        peer: TcpStream,
    },
}

impl Link {
    fn state(&self) -> NetState {
        match self {
            Link::Down => NetState::Down,
            Link::Connected(_) => NetState::Connected,
            Link::Listened(_) => NetState::Listened,
            Link::Accepted { .. } => NetState::Accepted,
        }
    }
}

pub struct Connection {
    link: Link,
    tx: ByteStream,
    rx: ByteStream,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    pub fn new() -> Self {
        Self {
            link: Link::Down,
            tx: ByteStream::new(),
            rx: ByteStream::new(),
        }
    }

    pub fn state(&self) -> NetState {
        self.link.state()
    }

    /// The socket frames are sent on and received from, if established.
    pub fn active_socket(&self) -> Option<&TcpStream> {
        match &self.link {
            Link::Connected(s) => Some(s),
            Link::Accepted { peer, .. } => Some(peer),
            _ => None,
        }
    }

    /// Local address of the socket owned by the current state.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.link {
            Link::Down => None,
            Link::Connected(s) => s.local_addr().ok(),
            Link::Listened(l) | Link::Accepted { listener: l, .. } => l.local_addr().ok(),
        }
    }

    /// The protocol id this side would stamp on a fresh message:
    /// the POS constant when playing the passive role, VMC otherwise.
    pub fn base_proto(&self) -> u16 {
        match self.state() {
            NetState::Listened | NetState::Accepted => PROTO_POS,
            _ => PROTO_VMC,
        }
    }

    /// `Down -> Connected`: outbound TCP connect to `addr:port` (IPv4).
    pub fn connect(&mut self, addr: &str, port: &str) -> Result<(), ConnectionError> {
        if self.state() != NetState::Down {
            return Err(ConnectionError::UnsupportedTransition {
                from: self.state(),
                to: NetState::Connected,
            });
        }
        let target = resolve_ipv4(addr, port)?;
        let socket = new_tcp_socket("can't create connect socket")?;
        socket
            .connect(&target.into())
            .map_err(|e| ConnectionError::Socket {
                context: "can't connect",
                source: e,
            })?;

        info!("connected to {target}");
        self.link = Link::Connected(socket.into());
        Ok(())
    }

    /// `Down -> Listened`: bind and listen on `addr:port` (IPv4).
    pub fn listen(&mut self, addr: &str, port: &str) -> Result<(), ConnectionError> {
        if self.state() != NetState::Down {
            return Err(ConnectionError::UnsupportedTransition {
                from: self.state(),
                to: NetState::Listened,
            });
        }
        let local = resolve_ipv4(addr, port)?;
        let socket = new_tcp_socket("can't create listen socket")?;
        socket
            .bind(&local.into())
            .map_err(|e| ConnectionError::Socket {
                context: "listen socket binding error",
                source: e,
            })?;
        socket
            .listen(i32::MAX)
            .map_err(|e| ConnectionError::Socket {
                context: "listen socket error",
                source: e,
            })?;

        info!("start to listen on {addr}:{port}");
        self.link = Link::Listened(socket.into());
        Ok(())
    }

    /// `Listened -> Accepted`: take one pending connection.
    pub fn accept(&mut self) -> Result<(), ConnectionError> {
        let link = std::mem::replace(&mut self.link, Link::Down);
        match link {
            Link::Listened(listener) => match listener.accept() {
                Ok((peer, peer_addr)) => {
                    info!("client connected from {peer_addr}");
                    self.link = Link::Accepted { listener, peer };
                    Ok(())
                }
                Err(e) => {
                    self.link = Link::Listened(listener);
                    Err(ConnectionError::Socket {
                        context: "can't accept incoming connection",
                        source: e,
                    })
                }
            },
            other => {
                let from = other.state();
                self.link = other;
                Err(ConnectionError::UnsupportedTransition {
                    from,
                    to: NetState::Accepted,
                })
            }
        }
    }

    /// `Accepted -> Listened`: close the peer, keep accepting new ones.
    pub fn drop_peer(&mut self) -> Result<(), ConnectionError> {
        let link = std::mem::replace(&mut self.link, Link::Down);
        match link {
            Link::Accepted { listener, peer } => {
                drop(peer);
                info!(
                    "client connection was closed, continue to listen on {:?}",
                    listener.local_addr().ok()
                );
                self.link = Link::Listened(listener);
                Ok(())
            }
            other => {
                let from = other.state();
                self.link = other;
                Err(ConnectionError::UnsupportedTransition {
                    from,
                    to: NetState::Listened,
                })
            }
        }
    }

    /// `{Connected, Listened, Accepted} -> Down`: close every socket.
    pub fn shutdown(&mut self) -> Result<(), ConnectionError> {
        if self.state() == NetState::Down {
            return Err(ConnectionError::UnsupportedTransition {
                from: NetState::Down,
                to: NetState::Down,
            });
        }
        self.link = Link::Down;
        info!("network state is DOWN");
        Ok(())
    }

    /// Serializes `msg` and sends it as one blocking write.
    ///
    /// There is no partial-write retry: a short write is reported as an
    /// error, not resumed. Returns the number of bytes written.
    pub fn send(&mut self, msg: &Message) -> Result<usize, StageError> {
        codec::serialize(msg, &mut self.tx);
        let frame_len = self.tx.len();

        let sock = match &mut self.link {
            Link::Connected(s) => s,
            Link::Accepted { peer, .. } => peer,
            _ => return Err(ConnectionError::NotEstablished.into()),
        };
        let written = sock.write(self.tx.as_bytes()).map_err(IoError::Write)?;
        if written != frame_len {
            return Err(IoError::ShortWrite {
                written,
                expected: frame_len,
            }
            .into());
        }
        debug!("-> {}", hex::encode(self.tx.as_bytes()));
        Ok(written)
    }

    /// Waits up to `timeout` for data, drains everything currently
    /// pending, and deserializes the burst into `msg`.
    ///
    /// One message per burst: if a peer ever coalesces two frames into
    /// one read, the trailing bytes are treated as arguments of the
    /// first and will normally fail decoding. Returns `true` when EOF
    /// was observed; `msg` is left untouched when EOF arrives with no
    /// data at all.
    pub fn recv(&mut self, msg: &mut Message, timeout: Duration) -> Result<bool, StageError> {
        self.rx.clear();

        let sock = match &mut self.link {
            Link::Connected(s) => s,
            Link::Accepted { peer, .. } => peer,
            _ => return Err(ConnectionError::NotEstablished.into()),
        };
        sock.set_read_timeout(Some(timeout)).map_err(IoError::Read)?;

        let mut buf = [0u8; 0xFF];
        let mut eof = false;

        // bounded wait for the first chunk
        match sock.read(&mut buf) {
            Ok(0) => eof = true,
            Ok(n) => self.rx.write(&buf[..n]),
            Err(e) if wait_expired(&e) => return Err(IoError::Timeout.into()),
            Err(e) => return Err(IoError::Read(e).into()),
        }

        // drain whatever else is already pending
        if !eof {
            sock.set_nonblocking(true).map_err(IoError::Read)?;
            loop {
                match sock.read(&mut buf) {
                    Ok(0) => {
                        eof = true;
                        break;
                    }
                    Ok(n) => self.rx.write(&buf[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        let _ = sock.set_nonblocking(false);
                        return Err(IoError::Read(e).into());
                    }
                }
            }
            sock.set_nonblocking(false).map_err(IoError::Read)?;
        }

        if !self.rx.is_empty() {
            debug!("<- {}", hex::encode(self.rx.as_bytes()));
            codec::deserialize(msg, &mut self.rx)?;
        }
        Ok(eof)
    }
}

fn wait_expired(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn resolve_ipv4(addr: &str, port: &str) -> Result<SocketAddrV4, ConnectionError> {
    let ip: Ipv4Addr = addr
        .parse()
        .map_err(|_| ConnectionError::BadAddress(format!("{addr}:{port}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| ConnectionError::BadAddress(format!("{addr}:{port}")))?;
    Ok(SocketAddrV4::new(ip, port))
}

fn new_tcp_socket(context: &'static str) -> Result<Socket, ConnectionError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| ConnectionError::Socket { context, source: e })?;
    socket
        .set_reuse_address(true)
        .map_err(|e| ConnectionError::Socket { context, source: e })?;
    Ok(socket)
}

// --- tests ------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{ARG_MESSAGE_NAME, PROTO_VMC};
    use std::net::Shutdown;
    use std::thread;

    fn listening_pair() -> (Connection, SocketAddr) {
        let mut conn = Connection::new();
        conn.listen("127.0.0.1", "0").unwrap();
        let addr = conn.local_addr().unwrap();
        (conn, addr)
    }

    #[test]
    fn listen_accept_drop_and_shutdown_walk_the_table() {
        let (mut conn, addr) = listening_pair();
        assert_eq!(conn.state(), NetState::Listened);
        assert!(conn.active_socket().is_none());

        let client = TcpStream::connect(addr).unwrap();
        conn.accept().unwrap();
        assert_eq!(conn.state(), NetState::Accepted);
        assert!(conn.active_socket().is_some());
        assert_eq!(conn.base_proto(), crate::msg::PROTO_POS);

        // peer is closed, listening socket keeps accepting
        conn.drop_peer().unwrap();
        assert_eq!(conn.state(), NetState::Listened);
        drop(client);

        let _client2 = TcpStream::connect(addr).unwrap();
        conn.accept().unwrap();
        assert_eq!(conn.state(), NetState::Accepted);

        conn.shutdown().unwrap();
        assert_eq!(conn.state(), NetState::Down);
        assert!(conn.local_addr().is_none());
    }

    #[test]
    fn connect_then_shutdown() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();

        let mut conn = Connection::new();
        conn.connect("127.0.0.1", &addr.port().to_string()).unwrap();
        assert_eq!(conn.state(), NetState::Connected);
        assert_eq!(conn.base_proto(), PROTO_VMC);

        conn.shutdown().unwrap();
        assert_eq!(conn.state(), NetState::Down);
    }

    #[test]
    fn transitions_outside_the_table_fail_and_keep_state() {
        let (mut conn, _addr) = listening_pair();

        // Listened -> Connected is not allowed
        let err = conn.connect("127.0.0.1", "1").unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::UnsupportedTransition {
                from: NetState::Listened,
                to: NetState::Connected,
            }
        ));
        assert_eq!(conn.state(), NetState::Listened);

        // Listened -> Listened is not allowed either
        assert!(conn.listen("127.0.0.1", "0").is_err());
        assert_eq!(conn.state(), NetState::Listened);

        conn.shutdown().unwrap();

        // nothing to accept or drop when Down
        assert!(conn.accept().is_err());
        assert!(conn.drop_peer().is_err());
        assert!(conn.shutdown().is_err());
        assert_eq!(conn.state(), NetState::Down);
    }

    #[test]
    fn connect_failure_leaves_state_down() {
        let mut conn = Connection::new();
        assert!(conn.connect("not-an-ip", "80").is_err());
        assert_eq!(conn.state(), NetState::Down);

        // a port nothing listens on
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        let dead = probe.local_addr().unwrap().port();
        drop(probe);
        assert!(conn.connect("127.0.0.1", &dead.to_string()).is_err());
        assert_eq!(conn.state(), NetState::Down);
    }

    #[test]
    fn send_writes_one_serialized_frame() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let reader = thread::spawn(move || {
            let (mut peer, _) = server.accept().unwrap();
            let mut buf = Vec::new();
            peer.read_to_end(&mut buf).unwrap();
            buf
        });

        let mut conn = Connection::new();
        conn.connect("127.0.0.1", &addr.port().to_string()).unwrap();

        let mut msg = Message::new(PROTO_VMC);
        msg.append_str(ARG_MESSAGE_NAME, "IDL").unwrap();
        let written = conn.send(&msg).unwrap();
        assert_eq!(written, 9);
        conn.shutdown().unwrap();

        assert_eq!(
            reader.join().unwrap(),
            vec![0x00, 0x07, 0x96, 0xFB, 0x01, 0x03, b'I', b'D', b'L']
        );
    }

    #[test]
    fn send_requires_an_established_connection() {
        let mut conn = Connection::new();
        let msg = Message::new(PROTO_VMC);
        assert!(matches!(
            conn.send(&msg),
            Err(StageError::Connection(ConnectionError::NotEstablished))
        ));

        let (mut listening, _) = listening_pair();
        let mut probe = Message::new(PROTO_VMC);
        assert!(listening.recv(&mut probe, Duration::from_millis(10)).is_err());
    }

    #[test]
    fn recv_decodes_a_burst_and_reports_no_eof() {
        let (mut conn, addr) = listening_pair();
        let mut client = TcpStream::connect(addr).unwrap();
        conn.accept().unwrap();

        let mut wire = Message::new(PROTO_VMC);
        wire.append_str(ARG_MESSAGE_NAME, "IDL").unwrap();
        let mut frame = ByteStream::new();
        codec::serialize(&wire, &mut frame);
        client.write_all(frame.as_bytes()).unwrap();

        let mut msg = Message::new(0);
        let eof = conn.recv(&mut msg, Duration::from_secs(2)).unwrap();
        assert!(!eof);
        assert_eq!(msg.proto(), PROTO_VMC);
        assert_eq!(msg.find(ARG_MESSAGE_NAME).unwrap().text(), Some("IDL"));
    }

    #[test]
    fn recv_reports_eof_when_peer_closes_silently() {
        let (mut conn, addr) = listening_pair();
        let client = TcpStream::connect(addr).unwrap();
        conn.accept().unwrap();
        client.shutdown(Shutdown::Both).unwrap();

        let mut msg = Message::new(0);
        let eof = conn.recv(&mut msg, Duration::from_secs(2)).unwrap();
        assert!(eof);
        // no data arrived, so the message was not touched
        assert_eq!(msg.proto(), 0);
    }

    #[test]
    fn recv_times_out_on_a_silent_peer() {
        let (mut conn, addr) = listening_pair();
        let _client = TcpStream::connect(addr).unwrap();
        conn.accept().unwrap();

        let mut msg = Message::new(0);
        let err = conn.recv(&mut msg, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, StageError::Io(IoError::Timeout)));
    }
}

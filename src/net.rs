//! Socket event loop.
//!
//! A slab of socket records indexed by `mio` token: the UDP receive socket,
//! the UDP send/broadcast socket, the TCP listener, connecting TCP sockets,
//! and accepted or connected TCP streams. Each poll cycle frees sockets
//! marked for deletion (repeating while closes cascade), queries readiness
//! with a zero timeout, promotes finished connects, pumps pending outgoing
//! frames, and reads complete length-prefixed frames.
//!
//! The loop does not call upward; it appends [`NetEvent`]s that the
//! dispatcher layer drains after the cycle.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::MAX_MSG_SIZE;

pub(crate) enum SockKind {
    UdpRecv(UdpSocket),
    UdpSend(UdpSocket),
    TcpListen(TcpListener),
    TcpConnecting(TcpStream),
    TcpStream(TcpStream),
}

pub(crate) struct OutFrame {
    buf: Vec<u8>,
    sent: usize,
}

pub(crate) struct SockInfo {
    pub kind: SockKind,
    accepted_from: Option<Token>,
    /// Bytes of the frame being assembled, length prefix included.
    recv_buf: Vec<u8>,
    /// Total frame size once the length prefix is in; 0 while reading it.
    recv_need: usize,
    queue: VecDeque<OutFrame>,
    want_write: bool,
    closing: bool,
}

/// Readiness callouts, drained by the layer above after each cycle.
#[derive(Debug)]
pub(crate) enum NetEvent {
    /// A complete frame (length word included) arrived on this socket.
    Received { token: Token, frame: Vec<u8> },
    Accepted { listener: Token, conn: Token, addr: SocketAddr },
    Connected { token: Token },
    Closed { token: Token },
}

pub(crate) struct NetPoller {
    poll: Poll,
    events: Events,
    socks: Vec<Option<SockInfo>>,
    free: Vec<usize>,
    out: VecDeque<NetEvent>,
}

impl NetPoller {
    pub fn new() -> Result<NetPoller> {
        Ok(NetPoller {
            poll: Poll::new()?,
            events: Events::with_capacity(128),
            socks: Vec::new(),
            free: Vec::new(),
            out: VecDeque::new(),
        })
    }

    fn add(&mut self, info: SockInfo) -> Token {
        let idx = match self.free.pop() {
            Some(i) => {
                self.socks[i] = Some(info);
                i
            }
            None => {
                self.socks.push(Some(info));
                self.socks.len() - 1
            }
        };
        Token(idx)
    }

    fn info(&self, token: Token) -> Option<&SockInfo> {
        self.socks.get(token.0).and_then(|s| s.as_ref())
    }

    fn info_mut(&mut self, token: Token) -> Option<&mut SockInfo> {
        self.socks.get_mut(token.0).and_then(|s| s.as_mut())
    }

    /// Bind the UDP receive socket to a specific port (the discovery port).
    pub fn udp_recv_new(&mut self, port: u16) -> Result<Token> {
        let std_sock = std::net::UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))?;
        std_sock.set_nonblocking(true)?;
        let mut sock = UdpSocket::from_std(std_sock);
        let token = Token(self.next_index());
        self.poll
            .registry()
            .register(&mut sock, token, Interest::READABLE)?;
        let t = self.add(SockInfo::new(SockKind::UdpRecv(sock)));
        debug_assert_eq!(t, token);
        Ok(token)
    }

    /// The shared UDP send socket; broadcast-enabled, never registered.
    pub fn udp_send_new(&mut self) -> Result<Token> {
        let std_sock = std::net::UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
        std_sock.set_nonblocking(true)?;
        std_sock.set_broadcast(true)?;
        let sock = UdpSocket::from_std(std_sock);
        Ok(self.add(SockInfo::new(SockKind::UdpSend(sock))))
    }

    pub fn tcp_listen_new(&mut self) -> Result<(Token, u16)> {
        let mut listener =
            TcpListener::bind(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))?;
        let port = listener.local_addr()?.port();
        let token = Token(self.next_index());
        self.poll
            .registry()
            .register(&mut listener, token, Interest::READABLE)?;
        let t = self.add(SockInfo::new(SockKind::TcpListen(listener)));
        debug_assert_eq!(t, token);
        Ok((token, port))
    }

    pub fn tcp_connect(&mut self, addr: SocketAddr) -> Result<Token> {
        let mut stream = TcpStream::connect(addr).map_err(|_| Error::TcpConnectFail)?;
        let _ = stream.set_nodelay(true);
        let token = Token(self.next_index());
        self.poll
            .registry()
            .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)?;
        let t = self.add(SockInfo::new(SockKind::TcpConnecting(stream)));
        debug_assert_eq!(t, token);
        Ok(token)
    }

    fn next_index(&self) -> usize {
        match self.free.last() {
            Some(&i) => i,
            None => self.socks.len(),
        }
    }

    /// Queue a frame on a TCP socket and take an immediate non-blocking
    /// send step.
    pub fn enqueue(&mut self, token: Token, frame: Vec<u8>) -> Result<()> {
        let info = self.info_mut(token).ok_or(Error::ProcessGone)?;
        if info.closing {
            return Err(Error::TcpHup);
        }
        info.queue.push_back(OutFrame { buf: frame, sent: 0 });
        self.pump(token);
        Ok(())
    }

    pub fn queue_is_empty(&self, token: Token) -> Option<bool> {
        self.info(token).map(|i| i.queue.is_empty())
    }

    pub fn is_open(&self, token: Token) -> bool {
        self.info(token).is_some_and(|i| !i.closing)
    }

    /// Best-effort UDP send through the shared send socket.
    pub fn send_udp(&mut self, send_token: Token, addr: SocketAddr, frame: &[u8]) {
        if let Some(SockInfo {
            kind: SockKind::UdpSend(sock),
            ..
        }) = self.info(send_token)
        {
            if let Err(e) = sock.send_to(frame, addr) {
                warn!(%addr, error = %e, "udp send failed, dropping");
            }
        }
    }

    /// Mark a socket for deletion; it is freed between poll steps. Closing
    /// a listener cascades to its accepted connections.
    pub fn mark_close(&mut self, token: Token) {
        if let Some(info) = self.info_mut(token) {
            info.closing = true;
        }
    }

    fn free_closed(&mut self) {
        // a close may cascade (listener -> accepted conns), so repeat
        loop {
            let mut cascaded = false;
            let listeners: Vec<Token> = self
                .socks
                .iter()
                .enumerate()
                .filter_map(|(i, s)| match s {
                    Some(info) if info.closing && matches!(info.kind, SockKind::TcpListen(_)) => {
                        Some(Token(i))
                    }
                    _ => None,
                })
                .collect();
            for listener in listeners {
                for s in self.socks.iter_mut().flatten() {
                    if s.accepted_from == Some(listener) && !s.closing {
                        s.closing = true;
                        cascaded = true;
                    }
                }
            }
            if !cascaded {
                break;
            }
        }
        for i in 0..self.socks.len() {
            let closing = matches!(&self.socks[i], Some(info) if info.closing);
            if closing {
                let mut info = self.socks[i].take().unwrap();
                match &mut info.kind {
                    SockKind::UdpRecv(s) => {
                        let _ = self.poll.registry().deregister(s);
                    }
                    SockKind::TcpListen(s) => {
                        let _ = self.poll.registry().deregister(s);
                    }
                    SockKind::TcpConnecting(s) | SockKind::TcpStream(s) => {
                        let _ = self.poll.registry().deregister(s);
                    }
                    SockKind::UdpSend(_) => {}
                }
                self.free.push(i);
                trace!(token = i, "socket freed");
                self.out.push_back(NetEvent::Closed { token: Token(i) });
            }
        }
    }

    pub fn next_event(&mut self) -> Option<NetEvent> {
        self.out.pop_front()
    }

    /// One readiness cycle with the given timeout (zero inside `poll()`).
    pub fn poll_io(&mut self, timeout: Duration) -> Result<()> {
        self.free_closed();
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let ready: Vec<(Token, bool, bool, bool)> = self
            .events
            .iter()
            .map(|e| {
                (
                    e.token(),
                    e.is_readable(),
                    e.is_writable(),
                    e.is_error() || e.is_read_closed(),
                )
            })
            .collect();
        for (token, readable, writable, broken) in ready {
            let kind = match self.info(token) {
                Some(info) => match &info.kind {
                    SockKind::TcpListen(_) => 'l',
                    SockKind::TcpConnecting(_) => 'c',
                    SockKind::TcpStream(_) => 't',
                    SockKind::UdpRecv(_) => 'u',
                    SockKind::UdpSend(_) => 's',
                },
                None => continue, // freed earlier in this cycle
            };
            match kind {
                'l' => {
                    if readable {
                        self.accept_ready(token);
                    }
                }
                'c' => {
                    if broken {
                        self.mark_close(token);
                    } else if writable {
                        self.finish_connect(token);
                    }
                }
                't' => {
                    if broken {
                        debug!(token = token.0, "tcp peer hung up");
                        self.mark_close(token);
                        continue;
                    }
                    if writable {
                        self.pump(token);
                    }
                    if readable {
                        self.read_stream(token);
                    }
                }
                'u' => {
                    if readable {
                        self.read_datagrams(token);
                    }
                }
                _ => {}
            }
        }
        self.free_closed();
        Ok(())
    }

    fn accept_ready(&mut self, listener: Token) {
        loop {
            let accepted = match &mut self.socks[listener.0] {
                Some(SockInfo {
                    kind: SockKind::TcpListen(l),
                    ..
                }) => l.accept(),
                _ => return,
            };
            match accepted {
                Ok((mut stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    let token = Token(self.next_index());
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        warn!(error = %e, "failed to register accepted stream");
                        continue;
                    }
                    let mut info = SockInfo::new(SockKind::TcpStream(stream));
                    info.accepted_from = Some(listener);
                    let t = self.add(info);
                    debug_assert_eq!(t, token);
                    debug!(conn = token.0, %addr, "accepted tcp connection");
                    self.out.push_back(NetEvent::Accepted {
                        listener,
                        conn: token,
                        addr,
                    });
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn finish_connect(&mut self, token: Token) {
        let Some(mut info) = self.socks.get_mut(token.0).and_then(Option::take) else {
            return;
        };
        if !matches!(info.kind, SockKind::TcpConnecting(_)) {
            self.socks[token.0] = Some(info);
            return;
        }
        let ok = match &info.kind {
            SockKind::TcpConnecting(s) => match s.take_error() {
                Ok(None) => s.peer_addr().is_ok(),
                _ => false,
            },
            _ => unreachable!(),
        };
        if !ok {
            debug!(token = token.0, "tcp connect failed");
            info.closing = true;
            self.socks[token.0] = Some(info);
            return;
        }
        info.kind = match info.kind {
            SockKind::TcpConnecting(mut s) => {
                let interests = if info.queue.is_empty() {
                    Interest::READABLE
                } else {
                    Interest::READABLE | Interest::WRITABLE
                };
                info.want_write = !info.queue.is_empty();
                let _ = self.poll.registry().reregister(&mut s, token, interests);
                SockKind::TcpStream(s)
            }
            other => other,
        };
        self.socks[token.0] = Some(info);
        debug!(token = token.0, "tcp connected");
        self.out.push_back(NetEvent::Connected { token });
    }

    /// One non-blocking send step over the head of the queue. Each frame is
    /// a single buffer (length prefix and payload together) so small
    /// messages leave in one segment under NODELAY.
    fn pump(&mut self, token: Token) {
        let mut close = false;
        let mut set_write: Option<bool> = None;
        if let Some(info) = self.info_mut(token) {
            if matches!(info.kind, SockKind::TcpConnecting(_)) {
                return; // queue drains once the connect completes
            }
            let stream = match &mut info.kind {
                SockKind::TcpStream(s) => s,
                _ => return,
            };
            loop {
                let Some(front) = info.queue.front_mut() else {
                    if info.want_write {
                        set_write = Some(false);
                    }
                    break;
                };
                match stream.write(&front.buf[front.sent..]) {
                    Ok(n) => {
                        front.sent += n;
                        if front.sent >= front.buf.len() {
                            info.queue.pop_front();
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        if !info.want_write {
                            set_write = Some(true);
                        }
                        break;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        debug!(token = token.0, error = %e, "tcp send error");
                        close = true;
                        break;
                    }
                }
            }
        }
        if close {
            self.mark_close(token);
            return;
        }
        if let Some(want) = set_write {
            self.set_write_interest(token, want);
        }
    }

    fn set_write_interest(&mut self, token: Token, want: bool) {
        let interests = if want {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let registry = self.poll.registry();
        if let Some(info) = self.socks.get_mut(token.0).and_then(|s| s.as_mut()) {
            info.want_write = want;
            if let SockKind::TcpStream(s) = &mut info.kind {
                let _ = registry.reregister(s, token, interests);
            }
        }
    }

    fn read_stream(&mut self, token: Token) {
        let mut scratch = [0u8; 4096];
        loop {
            let Some(info) = self.info_mut(token) else {
                return;
            };
            let stream = match &mut info.kind {
                SockKind::TcpStream(s) => s,
                _ => return,
            };
            match stream.read(&mut scratch) {
                Ok(0) => {
                    debug!(token = token.0, "tcp stream closed by peer");
                    self.mark_close(token);
                    return;
                }
                Ok(n) => {
                    let mut off = 0;
                    while off < n {
                        let info = self.info_mut(token).unwrap();
                        if info.recv_need == 0 {
                            let take = (4 - info.recv_buf.len()).min(n - off);
                            info.recv_buf.extend_from_slice(&scratch[off..off + take]);
                            off += take;
                            if info.recv_buf.len() == 4 {
                                let len = BigEndian::read_u32(&info.recv_buf) as usize;
                                if len < 12 || len + 4 > MAX_MSG_SIZE {
                                    warn!(token = token.0, len, "bad frame length, closing");
                                    self.mark_close(token);
                                    return;
                                }
                                info.recv_need = len + 4;
                            }
                            continue;
                        }
                        let want = info.recv_need - info.recv_buf.len();
                        let take = want.min(n - off);
                        info.recv_buf.extend_from_slice(&scratch[off..off + take]);
                        off += take;
                        if info.recv_buf.len() == info.recv_need {
                            let frame = std::mem::take(&mut info.recv_buf);
                            info.recv_need = 0;
                            self.out.push_back(NetEvent::Received { token, frame });
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(token = token.0, error = %e, "tcp read error");
                    self.mark_close(token);
                    return;
                }
            }
        }
    }

    fn read_datagrams(&mut self, token: Token) {
        let mut buf = [0u8; MAX_MSG_SIZE];
        loop {
            let Some(info) = self.info_mut(token) else {
                return;
            };
            let sock = match &info.kind {
                SockKind::UdpRecv(s) => s,
                _ => return,
            };
            match sock.recv_from(&mut buf) {
                Ok((n, _from)) => {
                    if n >= 8 {
                        self.out.push_back(NetEvent::Received {
                            token,
                            frame: buf[..n].to_vec(),
                        });
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // UDP is best-effort; log and keep the socket
                    trace!(error = %e, "udp recv error ignored");
                    return;
                }
            }
        }
    }

    /// Drain a socket's queue synchronously, polling readiness so an
    /// in-progress connect can complete. Readiness events for other sockets
    /// accumulate and are handled by the caller's normal drain.
    pub fn flush_blocking(&mut self, token: Token) -> Result<()> {
        loop {
            match self.queue_is_empty(token) {
                None => return Err(Error::TcpHup),
                Some(true) => return Ok(()),
                Some(false) => {}
            }
            if !self.is_open(token) {
                return Err(Error::TcpHup);
            }
            self.poll_io(Duration::from_millis(1))?;
            self.pump(token);
        }
    }

    /// Close every socket; used at shutdown.
    pub fn close_all(&mut self) {
        for i in 0..self.socks.len() {
            if self.socks[i].is_some() {
                self.mark_close(Token(i));
            }
        }
        self.free_closed();
        self.out.clear();
    }
}

impl SockInfo {
    fn new(kind: SockKind) -> SockInfo {
        SockInfo {
            kind,
            accepted_from: None,
            recv_buf: Vec::new(),
            recv_need: 0,
            queue: VecDeque::new(),
            want_write: false,
            closing: false,
        }
    }
}


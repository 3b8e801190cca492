// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Peer sockets. Everything here is non-blocking; the event loop decides
//! when to read and write.

use crate::log::connection_log_lite;
use crate::messages::{Header, HeaderError, MAX_EXT_MESSAGE_SIZE};
#[cfg(target_os = "linux")]
use libc::{c_void, IPPROTO_IP, IP_MINTTL};
use slog::Logger;
use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};
use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
#[cfg(target_os = "linux")]
use std::os::fd::AsRawFd;

const UNIT_CONNECTION: &str = "connection";

/// Size of socket buffers and the upper bound of buffered inbound bytes.
pub const SOCKET_BUFFER_SIZE: usize = 65535;

/// Read buffer capacity: always enough for one maximum sized message.
const READ_BUFFER_SIZE: usize = 2 * MAX_EXT_MESSAGE_SIZE;

/// IPTOS_PREC_INTERNETCONTROL
const TOS_INTERNETCONTROL: u32 = 0xc0;

const LISTEN_BACKLOG: i32 = 128;

/// Socket options applied once a session's connection is up.
#[derive(Debug, Clone, Copy)]
pub struct SocketOptions {
    pub ebgp: bool,
    pub distance: u8,
    pub ttlsec: bool,
}

/// Inbound byte stream to message framing. Bytes are buffered until a whole
/// message is present; a partial message is never handed out.
#[derive(Debug, Default)]
pub struct MsgReader {
    buf: Vec<u8>,
}

impl MsgReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while there is room for more input.
    pub fn wants_read(&self) -> bool {
        self.buf.len() < READ_BUFFER_SIZE
    }

    /// Read once from `r`. Returns the number of bytes read, zero meaning the
    /// peer closed the connection.
    pub fn fill<R: Read>(&mut self, r: &mut R) -> io::Result<usize> {
        let start = self.buf.len();
        let room = READ_BUFFER_SIZE.saturating_sub(start);
        if room == 0 {
            return Err(io::Error::from(ErrorKind::WouldBlock));
        }
        self.buf.resize(start + room, 0);
        let result = r.read(&mut self.buf[start..]);
        let n = *result.as_ref().unwrap_or(&0);
        self.buf.truncate(start + n);
        result
    }

    /// Take the next complete message from the buffer. `max_len` is the
    /// largest length allowed by the current session.
    pub fn next_message(
        &mut self,
        max_len: usize,
    ) -> Option<Result<(Header, Vec<u8>), HeaderError>> {
        if self.buf.len() < Header::WIRE_SIZE {
            return None;
        }
        let mut raw = [0u8; Header::WIRE_SIZE];
        raw.copy_from_slice(&self.buf[..Header::WIRE_SIZE]);
        let header = match Header::validate(&raw, max_len) {
            Ok(h) => h,
            Err(e) => return Some(Err(e)),
        };
        let len = usize::from(header.length);
        if self.buf.len() < len {
            return None;
        }
        let body = self.buf[Header::WIRE_SIZE..len].to_vec();
        self.buf.drain(..len);
        Some(Ok((header, body)))
    }

    /// True if the next call to [`MsgReader::next_message`] yields a message
    /// or a header error.
    pub fn has_pending(&self, max_len: usize) -> bool {
        if self.buf.len() < Header::WIRE_SIZE {
            return false;
        }
        let mut raw = [0u8; Header::WIRE_SIZE];
        raw.copy_from_slice(&self.buf[..Header::WIRE_SIZE]);
        match Header::validate(&raw, max_len) {
            Ok(h) => self.buf.len() >= usize::from(h.length),
            Err(_) => true,
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Framed outbound messages waiting to be written.
#[derive(Debug, Default)]
pub struct MsgQueue {
    queue: VecDeque<Vec<u8>>,

    /// Bytes of the front message already written.
    offset: usize,
}

impl MsgQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, buf: Vec<u8>) {
        self.queue.push_back(buf);
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.offset = 0;
    }

    /// Write as much as `w` takes without blocking. Returns the number of
    /// bytes written.
    pub fn write<W: Write>(&mut self, w: &mut W) -> io::Result<usize> {
        let mut total = 0;
        while let Some(front) = self.queue.front() {
            match w.write(&front[self.offset..]) {
                Ok(0) => {
                    return Err(io::Error::from(ErrorKind::WriteZero));
                }
                Ok(n) => {
                    total += n;
                    self.offset += n;
                    if self.offset == front.len() {
                        self.queue.pop_front();
                        self.offset = 0;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }
}

/// A peer's TCP connection with its buffers.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub reader: MsgReader,
    pub queue: MsgQueue,

    /// The outbound connect has not completed yet.
    pub connecting: bool,
}

impl Connection {
    pub fn accepted(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            reader: MsgReader::new(),
            queue: MsgQueue::new(),
            connecting: false,
        })
    }

    /// Start a non-blocking connect to `remote`, optionally bound to `local`.
    pub fn connect(
        remote: SocketAddr,
        local: Option<IpAddr>,
        opts: &SocketOptions,
        log: &Logger,
    ) -> io::Result<Self> {
        let socket = Socket::new(
            Domain::for_address(remote),
            Type::STREAM,
            Some(Protocol::TCP),
        )?;
        socket.set_nonblocking(true)?;
        apply_options(&SockRef::from(&socket), remote, opts, log)?;
        if let Some(local) = local {
            socket.bind(&SockAddr::from(SocketAddr::new(local, 0)))?;
        }

        let connecting = match socket.connect(&SockAddr::from(remote)) {
            Ok(()) => false,
            Err(e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == ErrorKind::WouldBlock =>
            {
                true
            }
            Err(e) => return Err(e),
        };

        Ok(Self {
            stream: socket.into(),
            reader: MsgReader::new(),
            queue: MsgQueue::new(),
            connecting,
        })
    }

    /// Resolve an in-flight connect once the socket reports writable.
    pub fn finish_connect(&mut self) -> io::Result<()> {
        if let Some(e) = self.stream.take_error()? {
            return Err(e);
        }
        self.stream.peer_addr()?;
        self.connecting = false;
        Ok(())
    }

    /// Apply the session socket options to an established connection.
    pub fn setup(&self, opts: &SocketOptions, log: &Logger) -> io::Result<()> {
        let remote = self.stream.peer_addr()?;
        apply_options(&SockRef::from(&self.stream), remote, opts, log)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.local_addr().ok()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    /// Read once into the message reader.
    pub fn read(&mut self) -> io::Result<usize> {
        self.reader.fill(&mut self.stream)
    }

    /// Write queued messages.
    pub fn flush(&mut self) -> io::Result<usize> {
        self.queue.write(&mut self.stream)
    }
}

fn apply_options(
    sock: &SockRef<'_>,
    remote: SocketAddr,
    opts: &SocketOptions,
    log: &Logger,
) -> io::Result<()> {
    match remote {
        SocketAddr::V4(_) => {
            if opts.ebgp {
                let ttl = if opts.ttlsec {
                    set_min_ttl(sock, 256 - u32::from(opts.distance), log)?;
                    255
                } else {
                    u32::from(opts.distance)
                };
                sock.set_ttl(ttl)?;
            }
            sock.set_tos(TOS_INTERNETCONTROL)?;
        }
        SocketAddr::V6(_) => {
            if opts.ebgp {
                sock.set_unicast_hops_v6(u32::from(opts.distance))?;
            }
            sock.set_tclass_v6(TOS_INTERNETCONTROL)?;
        }
    }
    sock.set_nodelay(true)?;
    sock.set_send_buffer_size(SOCKET_BUFFER_SIZE)?;
    sock.set_recv_buffer_size(SOCKET_BUFFER_SIZE)?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_min_ttl(sock: &SockRef<'_>, min_ttl: u32, _log: &Logger) -> io::Result<()> {
    let fd = sock.as_raw_fd();
    let ret = unsafe {
        libc::setsockopt(
            fd,
            IPPROTO_IP,
            IP_MINTTL,
            &min_ttl as *const u32 as *const c_void,
            std::mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_min_ttl(_sock: &SockRef<'_>, min_ttl: u32, log: &Logger) -> io::Result<()> {
    connection_log_lite!(log, warn,
        "minimum ttl {} not supported on this platform", min_ttl);
    Ok(())
}

/// Bind a non-blocking listening socket.
pub fn listen(addr: SocketAddr, log: &Logger) -> io::Result<TcpListener> {
    let socket = Socket::new(
        Domain::for_address(addr),
        Type::STREAM,
        Some(Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(LISTEN_BACKLOG)?;
    connection_log_lite!(log, info, "listening on {}", addr);
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{frame, MessageType, MAX_MESSAGE_SIZE};
    use pretty_assertions::assert_eq;
    use pretty_hex::*;

    /// Hands out its contents a few bytes at a time.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos == self.data.len() {
                return Err(io::Error::from(ErrorKind::WouldBlock));
            }
            let n = self.step.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    /// Accepts at most `budget` bytes, then blocks.
    struct Choke {
        out: Vec<u8>,
        budget: usize,
    }

    impl Write for Choke {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::from(ErrorKind::WouldBlock));
            }
            let n = buf.len().min(self.budget);
            self.out.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn partial_messages_are_held_back() {
        let keepalive = frame(MessageType::KeepAlive, &[], MAX_MESSAGE_SIZE)
            .expect("frame keepalive");
        let update = frame(MessageType::Update, &[0, 0, 0, 0], MAX_MESSAGE_SIZE)
            .expect("frame update");
        let mut data = keepalive.clone();
        data.extend_from_slice(&update);
        println!("stream: {}", data.hex_dump());

        let mut src = Trickle {
            data,
            pos: 0,
            step: 7,
        };
        let mut reader = MsgReader::new();
        let mut got = Vec::new();
        while reader.fill(&mut src).is_ok() {
            while let Some(m) = reader.next_message(MAX_MESSAGE_SIZE) {
                got.push(m.expect("valid header"));
            }
        }

        assert_eq!(got.len(), 2);
        assert_eq!(got[0].0.typ, MessageType::KeepAlive);
        assert_eq!(got[0].1, Vec::<u8>::new());
        assert_eq!(got[1].0.typ, MessageType::Update);
        assert_eq!(got[1].1, vec![0, 0, 0, 0]);
        assert!(!reader.has_pending(MAX_MESSAGE_SIZE));
    }

    #[test]
    fn oversized_message_rejected() {
        let mut buf = vec![0xff; 16];
        buf.extend_from_slice(&5000u16.to_be_bytes());
        buf.push(MessageType::Update as u8);
        let mut reader = MsgReader::new();
        reader.fill(&mut buf.as_slice()).expect("fill");
        assert_eq!(
            reader.next_message(MAX_MESSAGE_SIZE),
            Some(Err(HeaderError::BadLength(5000)))
        );
        // with extended messages the header is fine, body still missing
        assert_eq!(reader.next_message(MAX_EXT_MESSAGE_SIZE), None);
    }

    #[test]
    fn queue_resumes_partial_writes() {
        let mut q = MsgQueue::new();
        q.push(vec![1; 10]);
        q.push(vec![2; 10]);

        let mut w = Choke {
            out: Vec::new(),
            budget: 15,
        };
        assert_eq!(q.write(&mut w).expect("write"), 15);
        assert_eq!(q.len(), 1);

        w.budget = 100;
        assert_eq!(q.write(&mut w).expect("write"), 5);
        assert!(q.is_empty());

        let mut expected = vec![1; 10];
        expected.extend_from_slice(&[2; 10]);
        assert_eq!(w.out, expected);
    }
}

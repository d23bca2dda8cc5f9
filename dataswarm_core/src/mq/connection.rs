use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Instant;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::socket::{self, sockopt};

use super::message::{io_errno, is_transient, InMessage, Message, OutMessage};
use crate::errors::{ErrorKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Listening socket; produces connections through `accept`.
    Server,
    /// Non-blocking connect issued, completion not yet observed.
    InProgress,
    Connected,
    /// Failed permanently; the errno is kept in `Connection::error`.
    Error,
}

enum Socket {
    Listener(TcpListener),
    Stream(TcpStream),
}

impl Socket {
    fn raw_fd(&self) -> RawFd {
        match *self {
            Socket::Listener(ref l) => l.as_raw_fd(),
            Socket::Stream(ref s) => s.as_raw_fd(),
        }
    }
}

/// One framed, non-blocking connection.
///
/// Sending only enqueues; all I/O happens while the owner drives `wait` or a `PollGroup`.
/// `T` is an application tag attached to the connection (see `set_tag`).
pub struct Connection<T> {
    socket: Socket,
    state: ConnState,
    error: Option<Errno>,
    send_queue: VecDeque<OutMessage>,
    sending: Option<OutMessage>,
    recving: Option<InMessage>,
    recv: Option<Message>,
    backlog: Option<TcpStream>,
    tag: Option<T>,
}

pub(crate) fn ms_until(stoptime: Instant) -> i32 {
    let now = Instant::now();
    if stoptime <= now {
        return 0;
    }
    let ms = (stoptime - now).as_millis();
    // round up so a short remaining interval still blocks
    (ms + 1).min(i32::max_value() as u128) as i32
}

fn resolve(addr: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    match (addr, port).to_socket_addrs()?.next() {
        Some(resolved) => Ok(resolved),
        None => bail!("could not resolve address {}", addr),
    }
}

impl<T> Connection<T> {
    fn from_socket(socket: Socket, state: ConnState) -> Self {
        Connection {
            socket,
            state,
            error: None,
            send_queue: VecDeque::new(),
            sending: None,
            recving: None,
            recv: None,
            backlog: None,
            tag: None,
        }
    }

    /// Start a non-blocking connect. Completion (or failure) is observed while polling.
    pub fn connect(addr: &str, port: u16) -> Result<Self> {
        let target = resolve(addr, port)?;
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(target),
            socket2::Type::STREAM,
            None,
        )?;
        socket.set_nonblocking(true)?;
        let state = match socket.connect(&target.into()) {
            Ok(()) => ConnState::Connected,
            Err(ref e) => match io_errno(e) {
                Errno::EINPROGRESS | Errno::EALREADY | Errno::EINTR => ConnState::InProgress,
                errno => return Err(ErrorKind::Transport(errno).into()),
            },
        };
        let stream = TcpStream::from(socket);
        debug!("Connecting to {} ({:?})", target, state);
        Ok(Self::from_socket(Socket::Stream(stream), state))
    }

    /// Listen on `addr` (all interfaces if `None`) and `port`; port 0 picks any free port.
    pub fn serve(addr: Option<&str>, port: u16) -> Result<Self> {
        Self::serve_range(addr, port, port)
    }

    /// Listen on the first free port in `low..=high`.
    pub fn serve_range(addr: Option<&str>, low: u16, high: u16) -> Result<Self> {
        let host = addr.unwrap_or("0.0.0.0");
        let mut last_error = None;
        for port in low..=high {
            let target = resolve(host, port)?;
            match TcpListener::bind(target) {
                Ok(listener) => {
                    listener.set_nonblocking(true)?;
                    debug!("Listening on {}", listener.local_addr()?);
                    return Ok(Self::from_socket(
                        Socket::Listener(listener),
                        ConnState::Server,
                    ));
                }
                Err(e) => last_error = Some(e),
            }
        }
        match last_error {
            Some(e) => Err(e.into()),
            None => bail!("empty port range {}-{}", low, high),
        }
    }

    fn from_accepted(stream: TcpStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self::from_socket(Socket::Stream(stream), ConnState::Connected))
    }

    /// Take a pending inbound connection from a server connection.
    pub fn accept(&mut self) -> Option<Connection<T>> {
        if self.state != ConnState::Server {
            return None;
        }
        if self.backlog.is_none() {
            self.flush();
        }
        let stream = self.backlog.take()?;
        match Self::from_accepted(stream) {
            Ok(conn) => Some(conn),
            Err(e) => {
                warn!("Dropping accepted connection: {}", e);
                None
            }
        }
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Errno that put this connection into the `Error` state.
    #[inline]
    pub fn error(&self) -> Option<Errno> {
        self.error
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(match self.socket {
            Socket::Listener(ref l) => l.local_addr()?,
            Socket::Stream(ref s) => s.local_addr()?,
        })
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        match self.socket {
            Socket::Listener(_) => bail!("listening connection has no peer"),
            Socket::Stream(ref s) => Ok(s.peer_addr()?),
        }
    }

    pub fn set_tag(&mut self, tag: T) {
        self.tag = Some(tag);
    }

    pub fn tag(&self) -> Option<&T> {
        self.tag.as_ref()
    }

    pub fn tag_mut(&mut self) -> Option<&mut T> {
        self.tag.as_mut()
    }

    pub fn take_tag(&mut self) -> Option<T> {
        self.tag.take()
    }

    fn check_usable(&self) -> Result<()> {
        if let Some(e) = self.error {
            return Err(ErrorKind::Transport(e).into());
        }
        if self.state == ConnState::Server {
            bail!("operation not valid on a listening connection");
        }
        Ok(())
    }

    /// Queue a buffer for sending, truncated to `maxlen` bytes unless `maxlen` is 0.
    pub fn send_buffer(&mut self, buf: Vec<u8>, maxlen: usize) -> Result<()> {
        self.check_usable()?;
        self.send_queue.push_back(OutMessage::buffer(buf, maxlen));
        Ok(())
    }

    /// Queue the remaining contents of `file` for sending, at most `maxlen` bytes unless 0.
    pub fn send_fd(&mut self, file: File, maxlen: usize) -> Result<()> {
        self.check_usable()?;
        set_nonblocking(file.as_raw_fd())?;
        self.send_queue.push_back(OutMessage::file(file, maxlen));
        Ok(())
    }

    fn check_storage(&self) -> Result<()> {
        self.check_usable()?;
        if self.recving.is_some() {
            bail!("receive storage already declared");
        }
        Ok(())
    }

    /// Receive the next message into `buf`. `maxlen` of 0 means no limit.
    pub fn store_buffer(&mut self, buf: Vec<u8>, maxlen: usize) -> Result<()> {
        self.check_storage()?;
        self.recving = Some(InMessage::buffer(buf, maxlen));
        Ok(())
    }

    /// Receive the next message by writing its payload to `file`.
    pub fn store_fd(&mut self, file: File, maxlen: usize) -> Result<()> {
        self.check_storage()?;
        set_nonblocking(file.as_raw_fd())?;
        self.recving = Some(InMessage::file(file, maxlen));
        Ok(())
    }

    /// True if storage for the next inbound message has been declared.
    pub fn has_storage(&self) -> bool {
        self.recving.is_some()
    }

    /// Pop a completely received message. Never blocks.
    pub fn recv(&mut self) -> Option<Message> {
        self.recv.take()
    }

    pub fn is_readable(&self) -> bool {
        self.recv.is_some()
    }

    pub fn is_acceptable(&self) -> bool {
        self.backlog.is_some()
    }

    pub fn is_error(&self) -> bool {
        self.state == ConnState::Error
    }

    /// True while outbound messages are queued or partially sent.
    pub fn is_sending(&self) -> bool {
        self.sending.is_some() || !self.send_queue.is_empty()
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.socket.raw_fd()
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.is_readable() || self.is_acceptable() || self.is_error()
    }

    fn fail(&mut self, errno: Errno) {
        if self.state != ConnState::Error {
            debug!("Connection failed: {}", errno.desc());
            self.state = ConnState::Error;
            self.error = Some(errno);
            self.sending = None;
            self.send_queue.clear();
            // a completely received message is still handed out
            self.recving = None;
        }
    }

    /// Events this connection is interested in for the next poll.
    pub(crate) fn poll_events(&self) -> PollFlags {
        match self.state {
            ConnState::Server => {
                if self.backlog.is_none() {
                    PollFlags::POLLIN
                } else {
                    PollFlags::empty()
                }
            }
            ConnState::InProgress => PollFlags::POLLOUT,
            ConnState::Connected => {
                let mut events = PollFlags::empty();
                if self.recving.is_some() && self.recv.is_none() {
                    events |= PollFlags::POLLIN;
                }
                if self.is_sending() {
                    events |= PollFlags::POLLOUT;
                }
                events
            }
            ConnState::Error => PollFlags::empty(),
        }
    }

    /// Apply the outcome of a poll on this connection, then make progress.
    pub(crate) fn handle_revents(&mut self, revents: PollFlags) {
        let hangup = PollFlags::POLLHUP | PollFlags::POLLERR;
        if revents.intersects(hangup) && self.state == ConnState::Connected && self.recving.is_none()
        {
            let errno = match socket::getsockopt(self.raw_fd(), sockopt::SocketError) {
                Ok(0) | Err(_) => Errno::ECONNRESET,
                Ok(code) => Errno::from_i32(code),
            };
            self.fail(errno);
            return;
        }
        self.flush();
    }

    /// Make as much progress as possible without blocking.
    pub(crate) fn flush(&mut self) {
        match self.state {
            ConnState::Server => self.flush_accept(),
            ConnState::InProgress => {
                self.flush_connect();
                if self.state == ConnState::Connected {
                    self.flush_stream();
                }
            }
            ConnState::Connected => self.flush_stream(),
            ConnState::Error => {}
        }
    }

    fn flush_accept(&mut self) {
        if self.backlog.is_some() {
            return;
        }
        if let Socket::Listener(ref listener) = self.socket {
            loop {
                match listener.accept() {
                    Ok((stream, addr)) => {
                        debug!("Accepted connection from {}", addr);
                        self.backlog = Some(stream);
                        return;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(ref e) if is_transient(e) => return,
                    Err(e) => {
                        // a failed accept does not invalidate the listener
                        warn!("accept failed: {}", e);
                        return;
                    }
                }
            }
        }
    }

    fn flush_connect(&mut self) {
        match socket::getsockopt(self.raw_fd(), sockopt::SocketError) {
            Ok(0) => {
                // SO_ERROR is clear before the handshake finishes too; a peer address means connected
                if let Socket::Stream(ref s) = self.socket {
                    match s.peer_addr() {
                        Ok(_) => self.state = ConnState::Connected,
                        Err(ref e) if e.raw_os_error() == Some(Errno::ENOTCONN as i32) => {}
                        Err(ref e) => {
                            let errno = io_errno(e);
                            self.fail(errno)
                        }
                    }
                }
                if self.state == ConnState::Connected {
                    if let Socket::Stream(ref s) = self.socket {
                        let _ = s.set_nodelay(true);
                    }
                }
            }
            Ok(code) => match Errno::from_i32(code) {
                Errno::EINPROGRESS | Errno::EALREADY | Errno::EINTR => {}
                errno => self.fail(errno),
            },
            Err(errno) => self.fail(errno),
        }
    }

    fn flush_stream(&mut self) {
        if let Err(errno) = self.flush_send() {
            self.fail(errno);
            return;
        }
        if let Err(errno) = self.flush_recv() {
            self.fail(errno);
        }
    }

    fn flush_send(&mut self) -> ::std::result::Result<(), Errno> {
        let stream = match self.socket {
            Socket::Stream(ref mut s) => s,
            Socket::Listener(_) => return Ok(()),
        };
        loop {
            if self.sending.is_none() {
                self.sending = self.send_queue.pop_front();
            }
            let done = match self.sending {
                Some(ref mut msg) => msg.flush(stream)?,
                None => return Ok(()),
            };
            if !done {
                return Ok(());
            }
            self.sending = None;
        }
    }

    fn flush_recv(&mut self) -> ::std::result::Result<(), Errno> {
        if self.recv.is_some() {
            return Ok(());
        }
        let stream = match self.socket {
            Socket::Stream(ref mut s) => s,
            Socket::Listener(_) => return Ok(()),
        };
        let done = match self.recving {
            Some(ref mut msg) => msg.fill(stream)?,
            None => return Ok(()),
        };
        if done {
            self.recv = self.recving.take().map(InMessage::into_message);
        }
        Ok(())
    }

    /// Drive this connection until a message or connection is ready, or `stoptime` passes.
    ///
    /// Returns `Ok(true)` when something is ready, `Ok(false)` on timeout or signal, and an
    /// error once the connection has failed. A received message is reported before the failure.
    pub fn wait(&mut self, stoptime: Instant) -> Result<bool> {
        loop {
            self.flush();
            if self.is_readable() || self.is_acceptable() {
                return Ok(true);
            }
            if let Some(errno) = self.error {
                return Err(ErrorKind::Transport(errno).into());
            }
            let timeout = ms_until(stoptime);
            if timeout == 0 {
                return Ok(false);
            }
            let mut fds = [PollFd::new(self.raw_fd(), self.poll_events())];
            match poll(&mut fds, timeout) {
                Ok(0) => return Ok(false),
                Ok(_) => {
                    let revents = fds[0].revents().unwrap_or_else(PollFlags::empty);
                    self.handle_revents(revents);
                }
                Err(Errno::EINTR) => return Ok(false),
                Err(e) => return Err(ErrorKind::Transport(e).into()),
            }
        }
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use nix::fcntl::FdFlag;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::time::Duration;

    pub fn deadline(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    /// A connected (client, server-side) pair over loopback.
    pub fn pair() -> (Connection<()>, Connection<()>) {
        let mut server = Connection::<()>::serve(Some("127.0.0.1"), 0).unwrap();
        let port = server.local_addr().unwrap().port();
        let client = Connection::<()>::connect("127.0.0.1", port).unwrap();
        assert!(server.wait(deadline(5)).unwrap());
        let accepted = server.accept().unwrap();
        (client, accepted)
    }

    fn expect_buffer(conn: &mut Connection<()>, peer: &mut Connection<()>) -> Vec<u8> {
        let stop = deadline(10);
        loop {
            peer.flush();
            if conn.wait(Instant::now() + Duration::from_millis(10)).unwrap() {
                break;
            }
            assert!(Instant::now() < stop, "timed out waiting for message");
        }
        match conn.recv().unwrap() {
            Message::Buffer(buf) => buf,
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn buffers_round_trip() {
        let (mut client, mut server) = pair();
        for &len in &[0usize, 1, 1000, 65536, 150_000] {
            let data: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
            client.send_buffer(data.clone(), 0).unwrap();
            server.store_buffer(Vec::new(), 0).unwrap();
            assert_eq!(expect_buffer(&mut server, &mut client), data);
        }
    }

    #[test]
    fn fifo_order() {
        let (mut client, mut server) = pair();
        for i in 0..3u8 {
            client.send_buffer(vec![i; 10 + i as usize], 0).unwrap();
        }
        for i in 0..3u8 {
            server.store_buffer(Vec::new(), 0).unwrap();
            assert_eq!(expect_buffer(&mut server, &mut client), vec![i; 10 + i as usize]);
        }
    }

    #[test]
    fn no_storage_no_delivery() {
        let (mut client, mut server) = pair();
        client.send_buffer(b"hello".to_vec(), 0).unwrap();
        client.wait(Instant::now() + Duration::from_millis(50)).unwrap();
        assert!(!server.wait(Instant::now() + Duration::from_millis(50)).unwrap());
        assert!(server.recv().is_none());
        server.store_buffer(Vec::new(), 0).unwrap();
        assert_eq!(expect_buffer(&mut server, &mut client), b"hello".to_vec());
    }

    fn transfer_file(len: usize, cap: usize) -> (Vec<u8>, Vec<u8>, u64) {
        let dir = ::tempdir::TempDir::new("mq-fd").unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i * 13 % 256) as u8).collect();
        let src_path = dir.path().join("src");
        File::create(&src_path).unwrap().write_all(&data).unwrap();
        let dst_path = dir.path().join("dst");
        let dst = File::create(&dst_path).unwrap();

        let (mut client, mut server) = pair();
        client.send_fd(File::open(&src_path).unwrap(), cap).unwrap();
        server.store_fd(dst, 0).unwrap();

        let stop = deadline(10);
        while !server.wait(Instant::now() + Duration::from_millis(10)).unwrap() {
            client.flush();
            assert!(Instant::now() < stop);
        }
        let length = match server.recv().unwrap() {
            Message::File { mut file, length } => {
                file.flush().unwrap();
                length
            }
            other => panic!("unexpected message {:?}", other),
        };
        let mut back = Vec::new();
        let mut f = File::open(&dst_path).unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        f.read_to_end(&mut back).unwrap();
        (data, back, length)
    }

    #[test]
    fn file_transfer_integrity() {
        for &len in &[0usize, 100, 65536 * 2, 200_001] {
            let (data, back, length) = transfer_file(len, 0);
            assert_eq!(length, len as u64);
            assert_eq!(back, data);
        }
    }

    #[test]
    fn file_transfer_cap() {
        let (data, back, length) = transfer_file(100_000, 70_000);
        assert_eq!(length, 70_000);
        assert_eq!(&back[..], &data[..70_000]);
    }

    #[test]
    fn quota_fails_connection() {
        let (mut client, mut server) = pair();
        client.send_buffer(vec![0u8; 1000], 0).unwrap();
        server.store_buffer(Vec::new(), 10).unwrap();
        let stop = deadline(10);
        let err = loop {
            client.flush();
            match server.wait(Instant::now() + Duration::from_millis(10)) {
                Ok(true) => panic!("oversized message delivered"),
                Ok(false) => assert!(Instant::now() < stop),
                Err(e) => break e,
            }
        };
        assert_eq!(err.errno(), Some(Errno::EMSGSIZE));
        assert_eq!(server.state(), ConnState::Error);
        assert!(server.recv().is_none());
        // fails fast afterwards
        assert!(server.send_buffer(vec![1], 0).is_err());
    }

    #[test]
    fn peer_close_is_error() {
        let (client, mut server) = pair();
        drop(client);
        server.store_buffer(Vec::new(), 0).unwrap();
        let err = server.wait(deadline(5)).unwrap_err();
        assert_eq!(err.errno(), Some(Errno::ECONNRESET));
    }

    #[test]
    fn connect_refused() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        // loopback may refuse at once or only once the connect is polled
        match Connection::<()>::connect("127.0.0.1", port) {
            Err(e) => assert_eq!(e.errno(), Some(Errno::ECONNREFUSED)),
            Ok(mut conn) => {
                conn.send_buffer(b"x".to_vec(), 0).unwrap();
                assert!(conn.wait(deadline(5)).is_err());
                assert!(conn.error().is_some());
            }
        }
    }

    #[test]
    fn connecting_socket_flags() {
        let (client, _server) = pair();
        let fd = client.raw_fd();
        let status = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL).unwrap());
        assert!(status.contains(OFlag::O_NONBLOCK));
        let descriptor = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD).unwrap());
        assert!(descriptor.contains(FdFlag::FD_CLOEXEC));
    }

    #[test]
    fn tags() {
        let mut server = Connection::<&'static str>::serve(Some("127.0.0.1"), 0).unwrap();
        server.set_tag("listener");
        assert_eq!(server.tag(), Some(&"listener"));
        assert_eq!(server.take_tag(), Some("listener"));
        assert!(server.tag().is_none());
        assert!(server.peer_addr().is_err());
    }
}

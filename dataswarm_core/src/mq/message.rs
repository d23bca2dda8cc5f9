//! Per-direction message state. Each message tracks its own framing cursor so that
//! a flush can stop at any byte boundary (header, payload, frame edge) and resume later.

use std::fs::File;
use std::io::{self, Read, Write};

use nix::errno::Errno;

use super::frame::{FrameHeader, HEADER_SIZE, MAX_FRAME};

/// A fully received message handed back to the application.
#[derive(Debug)]
pub enum Message {
    /// Payload landed in the buffer given to `store_buffer`.
    Buffer(Vec<u8>),
    /// Payload was streamed into the file given to `store_fd`.
    File { file: File, length: u64 },
}

impl Message {
    pub fn len(&self) -> u64 {
        match *self {
            Message::Buffer(ref buf) => buf.len() as u64,
            Message::File { length, .. } => length,
        }
    }
}

/// Map an I/O error to the errno stored on a failed connection.
pub(crate) fn io_errno(e: &io::Error) -> Errno {
    match e.raw_os_error() {
        Some(code) => Errno::from_i32(code),
        None => match e.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::WriteZero => Errno::ECONNRESET,
            _ => Errno::EIO,
        },
    }
}

/// Errors worth retrying later instead of failing the connection.
pub(crate) fn is_transient(e: &io::Error) -> bool {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => true,
        _ => match e.raw_os_error().map(Errno::from_i32) {
            Some(Errno::EAGAIN) | Some(Errno::EINTR) | Some(Errno::EINPROGRESS)
            | Some(Errno::EALREADY) => true,
            _ => false,
        },
    }
}

enum Source {
    Buffer(Vec<u8>),
    File(File),
}

/// A message waiting in (or at the head of) the send queue.
pub(crate) struct OutMessage {
    source: Source,
    /// Upper bound on payload bytes for file sources, 0 for no limit.
    maxlen: u64,
    /// Payload bytes already packed into frames.
    offset: u64,
    header: [u8; HEADER_SIZE],
    header_pos: usize,
    frame_len: usize,
    frame_pos: usize,
    frame_end: bool,
    /// Relay for file sources; `relay_len` bytes of it are valid.
    relay: Vec<u8>,
    relay_len: usize,
    eof: bool,
}

impl OutMessage {
    pub fn buffer(mut buf: Vec<u8>, maxlen: usize) -> Self {
        if maxlen > 0 && buf.len() > maxlen {
            buf.truncate(maxlen);
        }
        Self::with_source(Source::Buffer(buf), 0)
    }

    pub fn file(file: File, maxlen: usize) -> Self {
        Self::with_source(Source::File(file), maxlen as u64)
    }

    fn with_source(source: Source, maxlen: u64) -> Self {
        OutMessage {
            source,
            maxlen,
            offset: 0,
            header: [0; HEADER_SIZE],
            // nothing staged yet, the first flush prepares frame zero
            header_pos: HEADER_SIZE,
            frame_len: 0,
            frame_pos: 0,
            frame_end: false,
            relay: Vec::new(),
            relay_len: 0,
            eof: false,
        }
    }

    fn started(&self) -> bool {
        self.offset > 0 || self.frame_len > 0 || self.frame_end
    }

    /// Stage the next frame. Returns false if a file source has no data ready yet.
    fn prepare_frame(&mut self) -> Result<bool, Errno> {
        let start = !self.started();
        let (chunk, end) = match self.source {
            Source::Buffer(ref buf) => {
                let remaining = buf.len() - self.offset as usize;
                let chunk = remaining.min(MAX_FRAME);
                (chunk, self.offset as usize + chunk == buf.len())
            }
            Source::File(ref mut file) => {
                let limit = if self.maxlen > 0 {
                    ((self.maxlen - self.offset) as usize).min(MAX_FRAME)
                } else {
                    MAX_FRAME
                };
                if self.relay.len() < MAX_FRAME {
                    self.relay.resize(MAX_FRAME, 0);
                }
                while self.relay_len < limit && !self.eof {
                    match file.read(&mut self.relay[self.relay_len..limit]) {
                        Ok(0) => self.eof = true,
                        Ok(n) => self.relay_len += n,
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(ref e) if is_transient(e) => return Ok(false),
                        Err(ref e) => return Err(io_errno(e)),
                    }
                }
                let capped = self.maxlen > 0 && self.offset + self.relay_len as u64 == self.maxlen;
                (self.relay_len, self.eof || capped)
            }
        };
        self.header = FrameHeader::new(start, end, chunk).encode();
        self.header_pos = 0;
        self.frame_len = chunk;
        self.frame_pos = 0;
        self.frame_end = end;
        Ok(true)
    }

    /// Push as much of this message into `w` as it accepts.
    /// Returns true once the final frame is completely written.
    pub fn flush<W: Write>(&mut self, w: &mut W) -> Result<bool, Errno> {
        loop {
            if self.header_pos < HEADER_SIZE {
                match w.write(&self.header[self.header_pos..]) {
                    Ok(0) => return Err(Errno::ECONNRESET),
                    Ok(n) => self.header_pos += n,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(ref e) if is_transient(e) => return Ok(false),
                    Err(ref e) => return Err(io_errno(e)),
                }
                continue;
            }

            if self.frame_pos < self.frame_len {
                let written = {
                    let payload = match self.source {
                        Source::Buffer(ref buf) => {
                            let base = self.offset as usize;
                            &buf[base + self.frame_pos..base + self.frame_len]
                        }
                        Source::File(_) => &self.relay[self.frame_pos..self.frame_len],
                    };
                    w.write(payload)
                };
                match written {
                    Ok(0) => return Err(Errno::ECONNRESET),
                    Ok(n) => self.frame_pos += n,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(ref e) if is_transient(e) => return Ok(false),
                    Err(ref e) => return Err(io_errno(e)),
                }
                continue;
            }

            // current frame (if any) is on the wire
            if self.frame_len > 0 || self.frame_end {
                self.offset += self.frame_len as u64;
                self.relay_len = 0;
                if self.frame_end {
                    return Ok(true);
                }
                self.frame_len = 0;
            }

            if !self.prepare_frame()? {
                return Ok(false);
            }
        }
    }
}

enum Sink {
    Buffer(Vec<u8>),
    File(File),
}

/// Storage declared for the next inbound message, plus its receive cursor.
pub(crate) struct InMessage {
    sink: Sink,
    maxlen: u64,
    total: u64,
    header: [u8; HEADER_SIZE],
    header_pos: usize,
    frame_len: usize,
    frame_pos: usize,
    frame_end: bool,
    seen_initial: bool,
    relay: Vec<u8>,
    relay_start: usize,
    relay_end: usize,
}

impl InMessage {
    pub fn buffer(mut buf: Vec<u8>, maxlen: usize) -> Self {
        buf.clear();
        Self::with_sink(Sink::Buffer(buf), maxlen)
    }

    pub fn file(file: File, maxlen: usize) -> Self {
        Self::with_sink(Sink::File(file), maxlen)
    }

    fn with_sink(sink: Sink, maxlen: usize) -> Self {
        InMessage {
            sink,
            maxlen: maxlen as u64,
            total: 0,
            header: [0; HEADER_SIZE],
            header_pos: 0,
            frame_len: 0,
            frame_pos: 0,
            frame_end: false,
            seen_initial: false,
            relay: Vec::new(),
            relay_start: 0,
            relay_end: 0,
        }
    }

    /// True once any byte of a message has been consumed into this storage.
    pub fn in_progress(&self) -> bool {
        self.header_pos > 0 || self.seen_initial
    }

    fn accept_header(&mut self) -> Result<(), Errno> {
        let header = FrameHeader::decode(&self.header)?;
        if header.is_start() == self.seen_initial {
            // START must appear exactly once, on the first frame
            return Err(Errno::EBADMSG);
        }
        let total = self.total + header.length as u64;
        if self.maxlen > 0 && total > self.maxlen {
            return Err(Errno::EMSGSIZE);
        }
        self.seen_initial = true;
        self.frame_len = header.length as usize;
        self.frame_pos = 0;
        self.frame_end = header.is_end();
        Ok(())
    }

    /// Write out relayed bytes to a file sink. Returns false if the file would block.
    fn drain_relay(&mut self) -> Result<bool, Errno> {
        if let Sink::File(ref mut file) = self.sink {
            while self.relay_start < self.relay_end {
                match file.write(&self.relay[self.relay_start..self.relay_end]) {
                    Ok(0) => return Err(Errno::EIO),
                    Ok(n) => self.relay_start += n,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(ref e) if is_transient(e) => return Ok(false),
                    Err(ref e) => return Err(io_errno(e)),
                }
            }
        }
        self.relay_start = 0;
        self.relay_end = 0;
        Ok(true)
    }

    fn read_payload<R: Read>(&mut self, r: &mut R) -> io::Result<usize> {
        let want = self.frame_len - self.frame_pos;
        match self.sink {
            Sink::Buffer(ref mut buf) => {
                let old = buf.len();
                buf.resize(old + want, 0);
                let result = r.read(&mut buf[old..]);
                let got = *result.as_ref().unwrap_or(&0);
                buf.truncate(old + got);
                result
            }
            Sink::File(_) => {
                if self.relay.len() < MAX_FRAME {
                    self.relay.resize(MAX_FRAME, 0);
                }
                let n = r.read(&mut self.relay[..want])?;
                self.relay_start = 0;
                self.relay_end = n;
                Ok(n)
            }
        }
    }

    /// Pull bytes from `r` into the declared storage.
    /// Returns true once the last frame of the message has been fully received.
    pub fn fill<R: Read>(&mut self, r: &mut R) -> Result<bool, Errno> {
        loop {
            if !self.drain_relay()? {
                return Ok(false);
            }

            if self.header_pos < HEADER_SIZE {
                match r.read(&mut self.header[self.header_pos..]) {
                    Ok(0) => return Err(Errno::ECONNRESET),
                    Ok(n) => self.header_pos += n,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(ref e) if is_transient(e) => return Ok(false),
                    Err(ref e) => return Err(io_errno(e)),
                }
                if self.header_pos == HEADER_SIZE {
                    self.accept_header()?;
                }
                continue;
            }

            if self.frame_pos < self.frame_len {
                match self.read_payload(r) {
                    Ok(0) => return Err(Errno::ECONNRESET),
                    Ok(n) => {
                        self.frame_pos += n;
                        self.total += n as u64;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(ref e) if is_transient(e) => return Ok(false),
                    Err(ref e) => return Err(io_errno(e)),
                }
                continue;
            }

            if self.frame_end {
                return Ok(true);
            }
            // next frame header
            self.header_pos = 0;
            self.frame_len = 0;
            self.frame_pos = 0;
        }
    }

    pub fn into_message(self) -> Message {
        match self.sink {
            Sink::Buffer(buf) => Message::Buffer(buf),
            Sink::File(file) => Message::File {
                file,
                length: self.total,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};

    /// Accepts or yields at most `step` bytes per call, then reports WouldBlock once,
    /// so every flush/fill is interrupted at arbitrary byte boundaries.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
        blocked: bool,
    }

    impl Trickle {
        fn new(step: usize) -> Self {
            Trickle {
                data: Vec::new(),
                pos: 0,
                step,
                blocked: false,
            }
        }

        fn toggle(&mut self) -> bool {
            self.blocked = !self.blocked;
            self.blocked
        }
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.toggle() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.step);
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos == self.data.len() || self.toggle() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.step).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn pump_out(msg: &mut OutMessage, wire: &mut Trickle) {
        let mut rounds = 0;
        while !msg.flush(wire).unwrap() {
            rounds += 1;
            assert!(rounds < 10_000_000);
        }
    }

    fn pump_in(msg: &mut InMessage, wire: &mut Trickle) -> Result<(), Errno> {
        loop {
            if msg.fill(wire)? {
                return Ok(());
            }
            if wire.pos == wire.data.len() {
                panic!("message incomplete after consuming the whole wire");
            }
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test]
    fn buffer_survives_byte_boundaries() {
        for &len in &[0usize, 1, 5, MAX_FRAME, MAX_FRAME + 1, 150_000] {
            let data = payload(len);
            let mut wire = Trickle::new(3333);
            pump_out(&mut OutMessage::buffer(data.clone(), 0), &mut wire);

            let frames = if len == 0 { 1 } else { (len + MAX_FRAME - 1) / MAX_FRAME };
            assert_eq!(wire.data.len(), len + frames * HEADER_SIZE);

            let mut incoming = InMessage::buffer(Vec::new(), 0);
            pump_in(&mut incoming, &mut wire).unwrap();
            match incoming.into_message() {
                Message::Buffer(buf) => assert_eq!(buf, data),
                _ => panic!("expected a buffer"),
            }
        }
    }

    #[test]
    fn single_byte_steps() {
        let data = payload(40);
        let mut wire = Trickle::new(1);
        pump_out(&mut OutMessage::buffer(data.clone(), 0), &mut wire);
        let mut incoming = InMessage::buffer(vec![1, 2, 3], 0);
        pump_in(&mut incoming, &mut wire).unwrap();
        assert_eq!(incoming.into_message().len(), 40);
    }

    #[test]
    fn buffer_maxlen_truncates() {
        let mut wire = Trickle::new(100);
        pump_out(&mut OutMessage::buffer(payload(500), 10), &mut wire);
        let mut incoming = InMessage::buffer(Vec::new(), 0);
        pump_in(&mut incoming, &mut wire).unwrap();
        assert_eq!(incoming.into_message().len(), 10);
    }

    #[test]
    fn file_streams_with_trailing_short_frame() {
        let dir = ::tempdir::TempDir::new("mq-msg").unwrap();
        let src_path = dir.path().join("src");
        let data = payload(2 * MAX_FRAME);
        ::std::fs::write(&src_path, &data).unwrap();

        let mut wire = Trickle::new(10_000);
        let src = File::open(&src_path).unwrap();
        pump_out(&mut OutMessage::file(src, 0), &mut wire);
        // two full frames and an empty END frame
        assert_eq!(wire.data.len(), data.len() + 3 * HEADER_SIZE);

        let mut dst = ::std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.path().join("dst"))
            .unwrap();
        let mut incoming = InMessage::file(dst.try_clone().unwrap(), 0);
        pump_in(&mut incoming, &mut wire).unwrap();
        assert_eq!(incoming.into_message().len(), data.len() as u64);

        let mut back = Vec::new();
        dst.seek(SeekFrom::Start(0)).unwrap();
        dst.read_to_end(&mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn file_maxlen_caps_sender() {
        let dir = ::tempdir::TempDir::new("mq-msg").unwrap();
        let src_path = dir.path().join("src");
        ::std::fs::write(&src_path, payload(100_000)).unwrap();

        let mut wire = Trickle::new(4096);
        pump_out(&mut OutMessage::file(File::open(&src_path).unwrap(), 70_000), &mut wire);
        let mut incoming = InMessage::buffer(Vec::new(), 0);
        pump_in(&mut incoming, &mut wire).unwrap();
        assert_eq!(incoming.into_message().len(), 70_000);
    }

    #[test]
    fn quota_exceeded() {
        let mut wire = Trickle::new(1000);
        pump_out(&mut OutMessage::buffer(payload(100), 0), &mut wire);
        let mut incoming = InMessage::buffer(Vec::new(), 99);
        assert_eq!(pump_in(&mut incoming, &mut wire), Err(Errno::EMSGSIZE));
    }

    #[test]
    fn start_bit_must_alternate() {
        let mut wire = Trickle::new(64);
        wire.data.extend_from_slice(&FrameHeader::new(false, true, 0).encode());
        let mut incoming = InMessage::buffer(Vec::new(), 0);
        assert_eq!(pump_in(&mut incoming, &mut wire), Err(Errno::EBADMSG));

        let mut wire = Trickle::new(64);
        wire.data.extend_from_slice(&FrameHeader::new(true, false, 1).encode());
        wire.data.push(7);
        wire.data.extend_from_slice(&FrameHeader::new(true, true, 0).encode());
        let mut incoming = InMessage::buffer(Vec::new(), 0);
        assert_eq!(pump_in(&mut incoming, &mut wire), Err(Errno::EBADMSG));
    }

    #[test]
    fn eof_mid_frame_is_reset() {
        struct Closed;
        impl Read for Closed {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Ok(0)
            }
        }
        let mut incoming = InMessage::buffer(Vec::new(), 0);
        assert_eq!(incoming.fill(&mut Closed), Err(Errno::ECONNRESET));
    }
}

//! Length-prefixed frames and descriptor passing over a Unix stream socket.
//!
//! A frame is a [`length_codec`](crate::length_codec) prefix followed by that
//! many payload bytes. A prefix of zero is a heartbeat and carries nothing.
//! Descriptors travel as `SCM_RIGHTS` ancillary data attached to a single
//! marker byte, sent before or after a frame as the protocol on top dictates.

use std::{
    io::{self, IoSlice, Read, Write},
    mem,
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
        unix::net::UnixStream,
    },
    ptr,
    time::{Duration, Instant},
};

use crate::{
    config::DEFAULT_READ_TIMEOUT,
    error::{IpcError, Result},
    length_codec::{self, Decoded, DEFAULT_MAX_LENGTH},
    notify_pipe::wait_readable,
    platform_socket::{self, ClientCredentials},
};

/// The byte that carries descriptor ancillary data.
pub const DESCRIPTOR_MARKER: u8 = 0;

/// Upper bound for [`FramedStream::send_descriptors`].
pub const MAX_DESCRIPTORS: usize = 8;

// 256 bytes, u64-aligned: room for the cmsghdr plus several dozen descriptors,
// so an over-sized batch is seen and rejected rather than silently truncated.
const CONTROL_WORDS: usize = 32;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: libc::c_int = 0;

/// Result of reading a length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLength {
    /// The peer closed the connection between frames.
    Eof,
    /// A zero-length keep-alive frame.
    Heartbeat,
    Bytes(usize),
}

/// A connected Unix stream that speaks the framing protocol.
#[derive(Debug)]
pub struct FramedStream {
    stream:       UnixStream,
    max_length:   usize,
    read_timeout: Duration,
}

impl FramedStream {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            max_length: DEFAULT_MAX_LENGTH,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    /// Bound on the gap between bytes once a prefix or descriptor is expected.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn get_ref(&self) -> &UnixStream {
        &self.stream
    }

    pub fn into_inner(self) -> UnixStream {
        self.stream
    }

    /// Wait up to `timeout` for the socket to have something to read.
    pub fn poll_readable(&self, timeout: Duration) -> Result<bool> {
        Ok(wait_readable(self.stream.as_fd(), Instant::now() + timeout)?)
    }

    /// Write `payload` as one frame with a single vectored write.
    pub fn write_frame(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_length {
            return Err(IpcError::LengthTooLarge {
                limit: self.max_length,
            });
        }
        let prefix = length_codec::encode_length(payload.len())?;
        let expected = prefix.len() + payload.len();
        let bufs = [IoSlice::new(&prefix), IoSlice::new(payload)];

        let written = loop {
            match (&self.stream).write_vectored(&bufs) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };

        if written != expected {
            return Err(IpcError::TransportInterrupted { written, expected });
        }
        tracing::trace!(bytes = payload.len(), "Frame written");
        Ok(())
    }

    /// Write a zero-length frame.
    pub fn send_heartbeat(&self) -> Result<()> {
        (&self.stream).write_all(&[0])?;
        Ok(())
    }

    /// Read the next length prefix.
    ///
    /// The first byte is awaited without a bound; callers normally poll before
    /// calling. Once a prefix has started, each further byte must arrive within
    /// the read timeout.
    pub fn read_length(&self) -> Result<FrameLength> {
        let mut deadline: Option<Instant> = None;
        let decoded = length_codec::decode_length(
            || {
                if let Some(deadline) = deadline {
                    if !wait_readable(self.stream.as_fd(), deadline)? {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "length prefix stalled",
                        ));
                    }
                } else {
                    deadline = Some(Instant::now() + self.read_timeout);
                }
                read_byte(&self.stream)
            },
            self.max_length,
        )?;

        Ok(match decoded {
            Decoded::Eof => FrameLength::Eof,
            Decoded::Value(0) => FrameLength::Heartbeat,
            Decoded::Value(n) => FrameLength::Bytes(n),
        })
    }

    /// Fill `buf` from the socket, giving up once `timeout` has passed or the
    /// peer closes. Returns how many bytes were read; a short count is left for
    /// the caller to judge.
    pub fn read_exact_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut filled = 0;

        while filled < buf.len() {
            if !wait_readable(self.stream.as_fd(), deadline)? {
                break;
            }
            match (&self.stream).read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    /// Read a payload of `length` bytes announced by [`read_length`](Self::read_length).
    pub fn read_payload(&self, length: usize, timeout: Duration) -> Result<Vec<u8>> {
        let mut payload = vec![0u8; length];
        let received = self.read_exact_timeout(&mut payload, timeout)?;
        if received < length {
            return Err(IpcError::ShortRead {
                received,
                expected: length,
            });
        }
        Ok(payload)
    }

    /// Pass one open descriptor to the peer.
    pub fn send_descriptor(&self, fd: BorrowedFd<'_>) -> Result<()> {
        self.send_descriptors(&[fd])
    }

    /// Pass any number of descriptors (up to [`MAX_DESCRIPTORS`]) in a single
    /// control message. Receivers of this protocol accept exactly one; the
    /// other counts exist to exercise their rejection path.
    pub fn send_descriptors(&self, fds: &[BorrowedFd<'_>]) -> Result<()> {
        if fds.len() > MAX_DESCRIPTORS {
            return Err(IpcError::DescriptorCount(fds.len()));
        }

        let marker = [DESCRIPTOR_MARKER];
        let mut iov = libc::iovec {
            iov_base: marker.as_ptr() as *mut libc::c_void,
            iov_len:  marker.len(),
        };
        let mut control = [0u64; CONTROL_WORDS];

        // SAFETY: an all-zero msghdr is a valid empty message on every platform.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;

        if !fds.is_empty() {
            let data_len = (mem::size_of::<libc::c_int>() * fds.len()) as libc::c_uint;
            // SAFETY: CMSG_SPACE is pure arithmetic.
            let space = unsafe { libc::CMSG_SPACE(data_len) } as usize;
            msg.msg_control = control.as_mut_ptr().cast();
            msg.msg_controllen = space as _;

            // SAFETY: the control buffer is aligned for cmsghdr and at least
            // `space` bytes long, so the first header and its data fit.
            unsafe {
                let cmsg = libc::CMSG_FIRSTHDR(&msg);
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                (*cmsg).cmsg_len = libc::CMSG_LEN(data_len) as _;
                let data = libc::CMSG_DATA(cmsg) as *mut libc::c_int;
                for (i, fd) in fds.iter().enumerate() {
                    ptr::write_unaligned(data.add(i), fd.as_raw_fd());
                }
            }
        }

        let sent = loop {
            // SAFETY: `msg` points at `iov`, `marker` and `control`, all of
            // which outlive the call.
            let n = unsafe { libc::sendmsg(self.stream.as_raw_fd(), &msg, SEND_FLAGS) };
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err.into());
            }
        };

        if sent != marker.len() {
            return Err(IpcError::TransportInterrupted {
                written:  sent,
                expected: marker.len(),
            });
        }
        tracing::trace!(count = fds.len(), "Descriptors sent");
        Ok(())
    }

    /// Receive exactly one descriptor.
    ///
    /// Any other count, truncated ancillary data or a foreign control message
    /// is rejected, and every descriptor that did arrive is closed.
    pub fn receive_descriptor(&self) -> Result<OwnedFd> {
        if !self.poll_readable(self.read_timeout)? {
            return Err(IpcError::Timeout(self.read_timeout));
        }

        let (_, mut fds) = self.receive_descriptors()?;
        if fds.len() != 1 {
            tracing::warn!(count = fds.len(), "Rejecting descriptor message");
            return Err(IpcError::DescriptorCount(fds.len()));
        }
        fds.pop().ok_or(IpcError::DescriptorCount(0))
    }

    /// Receive the descriptor that precedes a frame, or a heartbeat.
    ///
    /// A heartbeat and a descriptor marker are the same zero byte on the wire;
    /// only the ancillary data tells them apart. `Ok(None)` is a heartbeat.
    /// Any other byte means the peer started a frame without its descriptor.
    pub fn receive_leading_descriptor(&self) -> Result<Option<OwnedFd>> {
        if !self.poll_readable(self.read_timeout)? {
            return Err(IpcError::Timeout(self.read_timeout));
        }

        let (marker, mut fds) = self.receive_descriptors()?;
        match fds.len() {
            0 if marker == DESCRIPTOR_MARKER => Ok(None),
            1 => Ok(fds.pop()),
            n => {
                tracing::warn!(count = n, marker, "Rejecting leading descriptor message");
                Err(IpcError::DescriptorCount(n))
            }
        }
    }

    /// One `recvmsg` of a single byte. Returns the byte and every descriptor
    /// that rode on it.
    fn receive_descriptors(&self) -> Result<(u8, Vec<OwnedFd>)> {
        let mut marker = [0u8; 1];
        let mut iov = libc::iovec {
            iov_base: marker.as_mut_ptr().cast(),
            iov_len:  marker.len(),
        };
        let mut control = [0u64; CONTROL_WORDS];

        // SAFETY: an all-zero msghdr is a valid empty message on every platform.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = mem::size_of_val(&control) as _;

        let received = loop {
            // SAFETY: `msg` describes live, writable buffers of the sizes given.
            let n = unsafe { libc::recvmsg(self.stream.as_raw_fd(), &mut msg, RECV_FLAGS) };
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err.into());
            }
        };

        // Take ownership of every descriptor before judging the message, so
        // each early return below closes them.
        let mut fds = Vec::new();
        let mut foreign = None;
        // SAFETY: the kernel filled `control` with well-formed headers up to
        // `msg_controllen`; the CMSG_* macros never step past it. Descriptors
        // in an SCM_RIGHTS payload are freshly installed and owned by nobody.
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                let level = (*cmsg).cmsg_level;
                let kind = (*cmsg).cmsg_type;
                if level == libc::SOL_SOCKET && kind == libc::SCM_RIGHTS {
                    let header = libc::CMSG_LEN(0) as usize;
                    let data_len = ((*cmsg).cmsg_len as usize).saturating_sub(header);
                    let data = libc::CMSG_DATA(cmsg) as *const libc::c_int;
                    for i in 0..data_len / mem::size_of::<libc::c_int>() {
                        fds.push(OwnedFd::from_raw_fd(ptr::read_unaligned(data.add(i))));
                    }
                } else if foreign.is_none() {
                    foreign = Some((level, kind));
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        if msg.msg_flags & libc::MSG_CTRUNC != 0 {
            return Err(IpcError::DescriptorTruncated);
        }
        if let Some((level, kind)) = foreign {
            return Err(IpcError::UnexpectedControlMessage { level, kind });
        }
        if received == 0 && fds.is_empty() {
            return Err(IpcError::PeerClosed);
        }

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        for fd in &fds {
            set_cloexec(fd)?;
        }

        Ok((marker[0], fds))
    }

    /// Credentials of the process on the other end.
    pub fn peer_credentials(&self) -> Result<ClientCredentials> {
        platform_socket::peer_credentials(&self.stream)
    }
}

impl AsFd for FramedStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

fn read_byte(stream: &UnixStream) -> io::Result<Option<u8>> {
    let mut byte = [0u8; 1];
    loop {
        match (&*stream).read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
    // SAFETY: F_SETFD on a descriptor we own.
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

//! The fuse device channel.
//!
//! Thin wrapper over the device fd: workers block in `receive` for one
//! request at a time; cloneable senders write replies and notifications with
//! a single writev so a reply is never interleaved. Any bidirectional fd
//! speaking the wire format works, which is what the protocol tests use.

use std::io;
use std::io::IoSlice;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

/// Read side of the device.
#[derive(Clone, Debug)]
pub struct Channel {
    fd: Arc<OwnedFd>,
}

impl Channel {
    pub fn new(fd: OwnedFd) -> Channel {
        Channel { fd: Arc::new(fd) }
    }

    /// Block for the next request; returns the number of bytes read.
    pub fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
        };
        if n < 0 { Err(io::Error::last_os_error()) } else { Ok(n as usize) }
    }

    pub fn sender(&self) -> ChannelSender {
        ChannelSender { fd: self.fd.clone() }
    }
}

/// Write side of the device, cheap to clone into reply paths.
#[derive(Clone, Debug)]
pub struct ChannelSender {
    fd: Arc<OwnedFd>,
}

impl ChannelSender {
    /// Write one complete message (header + body pieces) atomically.
    pub fn send(&self, bufs: &[IoSlice<'_>]) -> io::Result<()> {
        let rc = unsafe {
            libc::writev(self.fd.as_raw_fd(), bufs.as_ptr().cast(), bufs.len() as libc::c_int)
        };
        if rc < 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::IntoRawFd;
    use std::os::fd::FromRawFd;

    fn dgram_pair() -> (OwnedFd, OwnedFd) {
        let (a, b) = std::os::unix::net::UnixDatagram::pair().unwrap();
        unsafe {
            (
                OwnedFd::from_raw_fd(a.into_raw_fd()),
                OwnedFd::from_raw_fd(b.into_raw_fd()),
            )
        }
    }

    #[test]
    fn send_and_receive_preserve_message_boundaries() {
        let (ours, theirs) = dgram_pair();
        let channel = Channel::new(ours);
        let sender = channel.sender();
        sender
            .send(&[IoSlice::new(b"head"), IoSlice::new(b"-body")])
            .unwrap();

        let peer = Channel::new(theirs);
        let mut buf = [0u8; 64];
        let n = peer.receive(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"head-body");
    }
}

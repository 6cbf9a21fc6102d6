//! fusermount-based mounting.
//!
//! The only privileged step of bringing a filesystem up is delegated to the
//! setuid `fusermount3` helper: it mounts the kernel filesystem and hands
//! the opened `/dev/fuse` fd back over a unix socket. Dropping the returned
//! guard lazily unmounts.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::{error, info, warn};
use nix::sys::socket::{
    AddressFamily, ControlMessageOwned, MsgFlags, RecvMsg, SockFlag, SockType, socketpair,
};

const FUSERMOUNT: &str = "fusermount3";
const COMM_FD_ENV: &str = "_FUSE_COMMFD";

/// Keeps the mount alive; unmounts on drop.
#[derive(Debug)]
pub struct Mount {
    mountpoint: PathBuf,
    /// Held open so the kernel keeps the mount associated with us.
    _comm: OwnedFd,
}

/// Mount `mountpoint` and return the device fd plus the unmount guard.
pub fn mount(mountpoint: &Path, options: &[String]) -> io::Result<(OwnedFd, Mount)> {
    let (ours, theirs) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )
    .map_err(io::Error::from)?;

    let mut command = Command::new(FUSERMOUNT);
    if !options.is_empty() {
        command.arg("-o").arg(options.join(","));
    }
    command
        .arg("--")
        .arg(mountpoint)
        .env(COMM_FD_ENV, theirs.as_raw_fd().to_string())
        .stdin(Stdio::null());
    // The helper inherits the socket end it will pass the device fd over.
    unsafe {
        let comm_fd = theirs.as_raw_fd();
        use std::os::unix::process::CommandExt;
        command.pre_exec(move || {
            let flags = libc::fcntl(comm_fd, libc::F_GETFD);
            if flags >= 0 {
                libc::fcntl(comm_fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
            }
            Ok(())
        });
    }

    let output = command.spawn()?.wait_with_output()?;
    drop(theirs);
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "{FUSERMOUNT} failed with {}",
            output.status
        )));
    }

    let device = receive_fd(ours.as_raw_fd())?;
    info!("mounted {}", mountpoint.display());
    Ok((device, Mount { mountpoint: mountpoint.to_path_buf(), _comm: ours }))
}

/// Receive one fd over the unix socket via SCM_RIGHTS.
fn receive_fd(socket: RawFd) -> io::Result<OwnedFd> {
    let mut data = [0u8; 1];
    let mut iov = [std::io::IoSliceMut::new(&mut data)];
    let mut cmsg = nix::cmsg_space!([RawFd; 1]);
    let msg: RecvMsg<'_, '_, ()> = nix::sys::socket::recvmsg(
        socket,
        &mut iov,
        Some(&mut cmsg),
        MsgFlags::empty(),
    )
    .map_err(io::Error::from)?;
    for message in msg.cmsgs().map_err(io::Error::from)? {
        if let ControlMessageOwned::ScmRights(fds) = message {
            if let Some(&fd) = fds.first() {
                return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }
    Err(io::Error::other("fusermount did not pass a device fd"))
}

impl Drop for Mount {
    fn drop(&mut self) {
        let status = Command::new(FUSERMOUNT)
            .arg("-u")
            .arg("-q")
            .arg("-z")
            .arg("--")
            .arg(&self.mountpoint)
            .status();
        match status {
            Ok(status) if status.success() => info!("unmounted {}", self.mountpoint.display()),
            Ok(status) => warn!("unmount of {} exited {status}", self.mountpoint.display()),
            Err(err) => error!("failed to run {FUSERMOUNT} -u: {err}"),
        }
    }
}

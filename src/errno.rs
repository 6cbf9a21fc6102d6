//! Errno newtype shared across the translator boundary.
//!
//! Every fop reply crosses translators as `Result<Reply, Errno>`; the errno is
//! always positive here and is negated exactly once, by the FUSE bridge, when
//! it leaves for the kernel.

use std::fmt;
use std::io;

/// A positive OS error number.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub i32);

macro_rules! errno_consts {
    ($($name:ident),* $(,)?) => {
        impl Errno {
            $(pub const $name: Errno = Errno(libc::$name);)*
        }

        impl Errno {
            fn symbol(self) -> Option<&'static str> {
                match self.0 {
                    $(x if x == libc::$name => Some(stringify!($name)),)*
                    _ => None,
                }
            }
        }
    };
}

// EWOULDBLOCK, EDEADLOCK and ENOTSUP alias other values on Linux and would
// produce unreachable match arms; they resolve through their aliases.
errno_consts!(
    EPERM, ENOENT, ESRCH, EINTR, EIO, ENXIO, E2BIG, EBADF, EAGAIN, ENOMEM,
    EACCES, EFAULT, EBUSY, EEXIST, EXDEV, ENODEV, ENOTDIR, EISDIR, EINVAL,
    EMFILE, EFBIG, ENOSPC, ESPIPE, EROFS, EMLINK, EPIPE, ERANGE, EDEADLK,
    ENAMETOOLONG, ENOLCK, ENOSYS, ENOTEMPTY, ELOOP, ENOMSG, ENODATA, EPROTO,
    EBADMSG, EOVERFLOW, ENOTCONN, ESHUTDOWN, ETIMEDOUT, ECONNREFUSED,
    ECONNRESET, EHOSTUNREACH, EALREADY, EINPROGRESS, ESTALE, EDQUOT,
    ECANCELED, EKEYEXPIRED, EREMOTE, ENOTSOCK, EMSGSIZE, EOPNOTSUPP,
);

impl Errno {
    /// The raw positive error code.
    pub fn code(self) -> i32 {
        self.0
    }

    /// Clamp an arbitrary value into a valid positive errno, falling back to
    /// EIO for zero or negative input.
    pub fn from_raw(raw: i32) -> Errno {
        if raw > 0 { Errno(raw) } else { Errno::EIO }
    }

    /// Errno of the most recent libc call on this thread.
    pub fn last_os_error() -> Errno {
        Errno::from_raw(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.symbol() {
            Some(name) => f.write_str(name),
            None => write!(f, "Errno({})", self.0),
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for Errno {}

impl From<io::Error> for Errno {
    fn from(err: io::Error) -> Errno {
        match err.raw_os_error() {
            Some(code) => Errno::from_raw(code),
            None => match err.kind() {
                io::ErrorKind::NotFound => Errno::ENOENT,
                io::ErrorKind::PermissionDenied => Errno::EACCES,
                io::ErrorKind::AlreadyExists => Errno::EEXIST,
                io::ErrorKind::InvalidInput => Errno::EINVAL,
                io::ErrorKind::TimedOut => Errno::ETIMEDOUT,
                io::ErrorKind::UnexpectedEof => Errno::EIO,
                _ => Errno::EIO,
            },
        }
    }
}

impl From<nix::errno::Errno> for Errno {
    fn from(err: nix::errno::Errno) -> Errno {
        Errno::from_raw(err as i32)
    }
}

impl From<Errno> for io::Error {
    fn from(err: Errno) -> io::Error {
        io::Error::from_raw_os_error(err.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbols_round_trip() {
        assert_eq!(format!("{}", Errno::ENOENT), "ENOENT");
        assert_eq!(format!("{}", Errno(4095)), "Errno(4095)");
    }

    #[test]
    fn from_raw_never_zero() {
        assert_eq!(Errno::from_raw(0), Errno::EIO);
        assert_eq!(Errno::from_raw(-5), Errno::EIO);
        assert_eq!(Errno::from_raw(libc::ENOENT), Errno::ENOENT);
    }

    #[test]
    fn io_error_without_os_code() {
        let err = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(Errno::from(err), Errno::ENOENT);
    }
}

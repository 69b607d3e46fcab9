use libc::{fcntl, off_t, EACCES, EAGAIN, F_SETLK, F_SETLKW, F_UNLCK, F_WRLCK, SEEK_SET};

use std::fs::File;
use std::io::{self, Error, ErrorKind};
use std::mem;
use std::os::raw::{c_int, c_short};
use std::os::unix::io::{AsRawFd, RawFd};

use super::Span;

fn bounds(span: Span) -> io::Result<(off_t, off_t)> {
    match span {
        // A zero length extends the lock to the end of the file, however large it grows.
        Span::Whole => Ok((0, 0)),
        Span::Byte(off) => off_t::try_from(off)
            .map(|start| (start, 1))
            .map_err(|_| ErrorKind::InvalidInput.into()),
    }
}

fn flck(fd: RawFd, op: c_int, typ: c_short, span: Span) -> io::Result<()> {
    let (start, len) = bounds(span)?;
    // Some platforms carry extra private fields in `struct flock`.
    let mut lock: libc::flock = unsafe { mem::zeroed() };
    lock.l_start = start;
    lock.l_len = len;
    lock.l_pid = 0;
    lock.l_type = typ;
    lock.l_whence = SEEK_SET as c_short;
    loop {
        let rc = unsafe { fcntl(fd, op, &lock) };
        if rc == -1 {
            let err = Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                break Err(err);
            }
        } else {
            break Ok(());
        }
    }
}

/// Places an exclusive advisory record lock over `span`.
///
/// When `wait` is false and another process holds a conflicting lock, the
/// error kind is always [`ErrorKind::WouldBlock`], whichever of `EAGAIN` or
/// `EACCES` the platform reported.
pub fn raw_file_lock(f: &File, span: Span, wait: bool) -> io::Result<()> {
    let op = match wait {
        true => F_SETLKW,
        false => F_SETLK,
    };
    flck(f.as_raw_fd(), op, F_WRLCK as c_short, span).map_err(|e| {
        match (wait, e.raw_os_error()) {
            (false, Some(EAGAIN)) | (false, Some(EACCES)) => ErrorKind::WouldBlock.into(),
            _ => e,
        }
    })
}

pub fn raw_file_unlock(f: &File, span: Span) -> io::Result<()> {
    flck(f.as_raw_fd(), F_SETLK, F_UNLCK as c_short, span)
}

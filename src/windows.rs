use std::fs::File;
use std::io::{self, Error, ErrorKind};
use std::mem::MaybeUninit;
use std::os::windows::io::AsRawHandle;

use winapi::shared::minwindef::DWORD;
use winapi::shared::winerror::ERROR_LOCK_VIOLATION;
use winapi::um::fileapi::{LockFileEx, UnlockFileEx};
use winapi::um::minwinbase::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, OVERLAPPED};
use winapi::um::winnt::HANDLE;

use super::Span;

fn bounds(span: Span) -> (u64, u64) {
    match span {
        Span::Whole => (0, u64::MAX),
        Span::Byte(off) => (off, 1),
    }
}

fn overlapped(off: u64) -> OVERLAPPED {
    let mut ov: OVERLAPPED = unsafe { MaybeUninit::zeroed().assume_init() };
    let s = unsafe { ov.u.s_mut() };
    s.Offset = (off & 0xffffffff) as DWORD;
    s.OffsetHigh = (off >> 32) as DWORD;
    ov
}

fn flock(file: HANDLE, flags: DWORD, span: Span) -> io::Result<()> {
    let (off, len) = bounds(span);
    let mut ov = overlapped(off);

    let rc = unsafe {
        LockFileEx(
            file,
            flags,
            0,
            (len & 0xffffffff) as DWORD,
            (len >> 32) as DWORD,
            &mut ov,
        )
    };

    if rc == 0 {
        let e = Error::last_os_error();
        if e.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
            Err(ErrorKind::WouldBlock.into())
        } else {
            Err(e)
        }
    } else {
        Ok(())
    }
}

/// Places an exclusive lock over `span`.
///
/// When `wait` is false and the range is held elsewhere, the error kind is
/// [`ErrorKind::WouldBlock`].
pub fn raw_file_lock(f: &File, span: Span, wait: bool) -> io::Result<()> {
    let mut flags = LOCKFILE_EXCLUSIVE_LOCK;
    if !wait {
        flags |= LOCKFILE_FAIL_IMMEDIATELY;
    }
    flock(f.as_raw_handle() as HANDLE, flags, span)
}

pub fn raw_file_unlock(f: &File, span: Span) -> io::Result<()> {
    let (off, len) = bounds(span);
    let mut ov = overlapped(off);

    let rc = unsafe {
        UnlockFileEx(
            f.as_raw_handle() as HANDLE,
            0,
            (len & 0xffffffff) as DWORD,
            (len >> 32) as DWORD,
            &mut ov,
        )
    };

    if rc == 0 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

//! Contention between processes, observed from a forked child.
#![cfg(unix)]

use ranged_lock::{raw_file_lock, RangedLock, Span};
use std::fs::File;
use std::sync::Arc;
use std::thread;

/// Returns true if another process can lock `span` of `file` right now.
fn free_in_child(file: &File, span: Span) -> bool {
    match unsafe { libc::fork() } {
        -1 => panic!("fork: {}", std::io::Error::last_os_error()),
        0 => {
            // Record locks belong to the process, so the child sees the parent's.
            let code = match raw_file_lock(file, span, false) {
                Ok(()) => 0,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => 1,
                Err(_) => 2,
            };
            unsafe { libc::_exit(code) }
        }
        pid => {
            let mut status = 0;
            let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
            assert_eq!(rc, pid);
            assert!(libc::WIFEXITED(status));
            match libc::WEXITSTATUS(status) {
                0 => true,
                1 => false,
                code => panic!("child failed to probe {:?} (exit {})", span, code),
            }
        }
    }
}

#[test]
fn reentrant_holder_keeps_other_process_out() {
    let file = Arc::new(tempfile::tempfile().unwrap());
    let lock = Arc::new(RangedLock::at(Arc::clone(&file), 5).unwrap());
    let span = Span::Byte(5);

    assert!(lock.acquire(true).unwrap());
    assert_eq!(lock.depth(), 1);
    assert!(!free_in_child(&file, span));

    assert!(lock.acquire(true).unwrap());
    assert_eq!(lock.depth(), 2);
    lock.release().unwrap();
    assert_eq!(lock.depth(), 1);
    assert!(!free_in_child(&file, span));

    let other = Arc::clone(&lock);
    let acquired = thread::spawn(move || other.acquire(false).unwrap())
        .join()
        .unwrap();
    assert!(!acquired);
    assert_eq!(lock.depth(), 1);

    lock.release().unwrap();
    assert!(!lock.is_locked());
    assert!(free_in_child(&file, span));

    let other = Arc::clone(&lock);
    let acquired = thread::spawn(move || {
        let acquired = other.acquire(false).unwrap();
        if acquired {
            other.release().unwrap();
        }
        acquired
    })
    .join()
    .unwrap();
    assert!(acquired);
}

#[test]
fn byte_spans_are_independent() {
    let file = tempfile::tempfile().unwrap();
    let lock = RangedLock::at(&file, 5).unwrap();

    let _guard = lock.lock().unwrap();
    assert!(!free_in_child(&file, Span::Byte(5)));
    assert!(free_in_child(&file, Span::Byte(4)));
    assert!(free_in_child(&file, Span::Byte(6)));
    assert!(!free_in_child(&file, Span::Whole));
}

#[test]
fn whole_file_covers_every_byte() {
    let file = tempfile::tempfile().unwrap();
    let lock = RangedLock::whole(&file);

    {
        let _guard = lock.lock().unwrap();
        assert!(!free_in_child(&file, Span::Byte(0)));
        assert!(!free_in_child(&file, Span::Byte(1 << 40)));
    }
    assert!(free_in_child(&file, Span::Whole));
}

#[test]
fn held_elsewhere_is_busy_without_blocking() {
    let file = tempfile::tempfile().unwrap();
    let lock = RangedLock::at(&file, 2).unwrap();

    // A child holds the byte while the parent probes it.
    let mut ready = [0; 2];
    let mut done = [0; 2];
    assert_eq!(unsafe { libc::pipe(ready.as_mut_ptr()) }, 0);
    assert_eq!(unsafe { libc::pipe(done.as_mut_ptr()) }, 0);

    match unsafe { libc::fork() } {
        -1 => panic!("fork: {}", std::io::Error::last_os_error()),
        0 => {
            let code = match raw_file_lock(&file, Span::Byte(2), true) {
                Ok(()) => 0,
                Err(_) => 2,
            };
            let byte = [code as u8];
            let mut buf = [0u8; 1];
            unsafe {
                libc::write(ready[1], byte.as_ptr().cast(), 1);
                libc::read(done[0], buf.as_mut_ptr().cast(), 1);
                libc::_exit(code)
            }
        }
        pid => {
            let mut buf = [9u8; 1];
            assert_eq!(unsafe { libc::read(ready[0], buf.as_mut_ptr().cast(), 1) }, 1);
            assert_eq!(buf[0], 0);

            assert!(!lock.acquire(false).unwrap());
            assert!(!lock.is_locked());
            assert!(!lock.is_owned_by_current_thread());
            assert!(lock.try_lock().unwrap().is_none());

            let go = [1u8];
            unsafe { libc::write(done[1], go.as_ptr().cast(), 1) };
            let mut status = 0;
            assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);

            // The child's exit dropped its lock, and a waiting acquire now succeeds.
            let guard = lock.lock().unwrap();
            assert_eq!(guard.ranged_lock().depth(), 1);
        }
    }

    for fd in ready.iter().chain(done.iter()) {
        unsafe { libc::close(*fd) };
    }
}

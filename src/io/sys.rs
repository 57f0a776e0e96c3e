//! Thin libc wrappers returning `io::Result`, plus the process-level calls a
//! freshly forked child needs. Socket options and addresses go through
//! `socket2` instead.

use std::io;
use std::io::IoSlice;
use std::os::fd::RawFd;

fn cvt_size(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// Errors after which the same operation should simply be retried.
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    cvt_size(unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) })
}

pub(crate) fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    cvt_size(unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) })
}

pub(crate) fn writev(fd: RawFd, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
    // IoSlice is ABI compatible with iovec on unix.
    cvt_size(unsafe {
        libc::writev(
            fd,
            bufs.as_ptr() as *const libc::iovec,
            bufs.len() as libc::c_int,
        )
    })
}

/// Non-blocking `waitpid`. Exit codes are reported as-is, deaths by signal
/// as `128 + signal`.
pub(crate) fn try_wait(pid: libc::pid_t) -> io::Result<Option<i32>> {
    let mut status: libc::c_int = 0;
    let ret = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };

    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(None);
        }
        return Err(err);
    }
    if ret == 0 {
        return Ok(None);
    }

    if libc::WIFEXITED(status) {
        Ok(Some(libc::WEXITSTATUS(status)))
    } else if libc::WIFSIGNALED(status) {
        Ok(Some(128 + libc::WTERMSIG(status)))
    } else {
        Ok(None)
    }
}

/// Closes every descriptor of the process except those in `keep`.
///
/// Safe to call between `fork` and `exec`: nothing here allocates.
pub(crate) fn close_all_except(keep: &[RawFd]) {
    let mut low: RawFd = 0;
    loop {
        let next = keep.iter().copied().filter(|fd| *fd >= low).min();
        match next {
            Some(fd) => {
                if fd > low {
                    close_range(low, fd - 1);
                }
                low = fd + 1;
            }
            None => {
                close_range(low, RawFd::MAX);
                return;
            }
        }
    }
}

fn close_range(first: RawFd, last: RawFd) {
    if try_close_range(first, last) {
        return;
    }
    let limit = open_max();
    for fd in first..=last.min(limit - 1) {
        unsafe { libc::close(fd) };
    }
}

#[cfg(target_os = "linux")]
fn try_close_range(first: RawFd, last: RawFd) -> bool {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_close_range,
            first as libc::c_uint,
            last as libc::c_uint,
            0 as libc::c_uint,
        )
    };
    ret == 0
}

#[cfg(not(target_os = "linux"))]
fn try_close_range(_first: RawFd, _last: RawFd) -> bool {
    false
}

fn open_max() -> RawFd {
    let limit = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    if limit <= 0 { 1024 } else { limit.min(65536) as RawFd }
}

/// Sets the name shown by `ps` for the calling process. Titles longer than
/// 15 bytes are cut.
#[cfg(target_os = "linux")]
pub(crate) fn set_proc_title(title: &str) {
    let mut name = [0u8; 16];
    let len = title.len().min(name.len() - 1);
    name[..len].copy_from_slice(&title.as_bytes()[..len]);
    unsafe {
        libc::prctl(libc::PR_SET_NAME, name.as_ptr() as libc::c_ulong, 0, 0, 0);
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_proc_title(_title: &str) {}

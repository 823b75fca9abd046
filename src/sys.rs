//! Thin `io::Result` wrappers over the raw OS surface this crate relies on:
//! epoll, the self-pipe, and thread ids.

use std::io;
use std::sync::OnceLock;

use libc::c_int;

fn cvt(ret: c_int) -> io::Result<c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

pub fn epoll_create() -> io::Result<c_int> {
    cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })
}

pub fn epoll_ctl(epfd: c_int, op: c_int, fd: c_int, events: u32, data: u64) -> io::Result<()> {
    let mut ev = libc::epoll_event { events, u64: data };
    cvt(unsafe { libc::epoll_ctl(epfd, op, fd, &mut ev) }).map(|_| ())
}

pub fn epoll_wait(
    epfd: c_int,
    events: &mut [libc::epoll_event],
    timeout_ms: c_int,
) -> io::Result<usize> {
    let n = cvt(unsafe {
        libc::epoll_wait(epfd, events.as_mut_ptr(), events.len() as c_int, timeout_ms)
    })?;
    Ok(n as usize)
}

pub fn pipe() -> io::Result<[c_int; 2]> {
    let mut fds = [0 as c_int; 2];
    cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    Ok(fds)
}

pub fn set_nonblocking(fd: c_int) -> io::Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) }).map(|_| ())
}

pub fn write_byte(fd: c_int, byte: u8) -> io::Result<()> {
    let n = unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) };
    if n == 1 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Reads and discards everything currently buffered on a non-blocking fd.
pub fn drain(fd: c_int) {
    let mut buf = [0u8; 256];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
    }
}

pub fn close(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

pub fn gettid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

//! A non-blocking stream wrapper whose `read`/`write` suspend the current
//! fiber instead of blocking the OS thread.
//!
//! Follows `coio::CoIOStream`: set `O_NONBLOCK` once at construction,
//! attempt the syscall, and on `WouldBlock` wait for readiness before
//! retrying. `coio_wait`'s "yield the fiber" becomes an ordinary
//! suspension point here, registered against [`super::Poller`].

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};

use crate::error::Result;

/// A socket (or any `IntoRawFd` handle) placed in non-blocking mode and
/// driven through the scheduler's poller instead of blocking the thread.
pub struct AsyncStream {
    fd: RawFd,
}

impl AsyncStream {
    pub fn new<T: IntoRawFd>(inner: T) -> io::Result<Self> {
        let fd = inner.into_raw_fd();
        set_nonblocking(fd)?;
        Ok(Self { fd })
    }

    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Self::new(stream)
    }

    /// Reads into `buf`, suspending the fiber while the handle is not
    /// readable. Returns `Ok(0)` at EOF, same as `std::io::Read`.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match unsafe_read(self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    super::wait_readable(self.fd, None).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Writes `buf`, suspending the fiber while the handle is not
    /// writable.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        loop {
            match unsafe_write(self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    super::wait_writable(self.fd, None).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl AsRawFd for AsyncStream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for AsyncStream {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn unsafe_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n >= 0 {
        Ok(n as usize)
    } else {
        Err(io::Error::last_os_error())
    }
}

fn unsafe_write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n >= 0 {
        Ok(n as usize)
    } else {
        Err(io::Error::last_os_error())
    }
}

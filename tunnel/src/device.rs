//! Tunnel device transport.
//!
//! One whole IP packet per `recv`/`send`. Writes are serialized by an
//! internal mutex so concurrent tasks never interleave partial packets on
//! the device.

use async_trait::async_trait;
use std::io;

#[async_trait]
pub trait TunTransport: Send + Sync {
    /// Read one packet. A return of 0 means the device is gone.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one packet atomically.
    async fn send(&self, packet: &[u8]) -> io::Result<()>;
}

#[cfg(unix)]
pub use fd::FdTun;

#[cfg(unix)]
mod fd {
    use super::TunTransport;
    use async_trait::async_trait;
    use std::io;
    use std::os::fd::{AsRawFd, OwnedFd};
    use tokio::io::Interest;
    use tokio::io::unix::AsyncFd;
    use tokio::sync::Mutex;

    /// Point-to-point tunnel over a raw file descriptor handed to us by
    /// the platform (a tun device or a VpnService-style socket).
    pub struct FdTun {
        fd: AsyncFd<OwnedFd>,
        write_lock: Mutex<()>,
    }

    impl FdTun {
        pub fn new(fd: OwnedFd) -> io::Result<Self> {
            set_nonblocking(&fd)?;
            Ok(Self {
                fd: AsyncFd::with_interest(fd, Interest::READABLE | Interest::WRITABLE)?,
                write_lock: Mutex::new(()),
            })
        }
    }

    fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
        let raw = fd.as_raw_fd();
        let fl = unsafe { libc::fcntl(raw, libc::F_GETFL) };
        if fl < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(raw, libc::F_SETFL, fl | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[async_trait]
    impl TunTransport for FdTun {
        async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            loop {
                let mut guard = self.fd.readable().await?;
                let result = guard.try_io(|fd| {
                    let raw = fd.get_ref().as_raw_fd();
                    let n = unsafe { libc::read(raw, buf.as_mut_ptr() as *mut _, buf.len()) };
                    if n < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                });
                match result {
                    Ok(read) => return read,
                    Err(_would_block) => continue,
                }
            }
        }

        async fn send(&self, packet: &[u8]) -> io::Result<()> {
            let _serialized = self.write_lock.lock().await;
            loop {
                let mut guard = self.fd.writable().await?;
                let result = guard.try_io(|fd| {
                    let raw = fd.get_ref().as_raw_fd();
                    // Tunnel devices take or reject whole packets; no
                    // partial-write handling is needed at this layer.
                    let n = unsafe { libc::write(raw, packet.as_ptr() as *const _, packet.len()) };
                    if n < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(())
                    }
                });
                match result {
                    Ok(written) => return written,
                    Err(_would_block) => continue,
                }
            }
        }
    }
}

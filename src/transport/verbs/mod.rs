//! Hardware fabric over librdmacm and libibverbs (`rdma-sys`).
//!
//! Every FFI handle is owned by one Rust value and released in `Drop`. Owners
//! hold `Arc`s to what they were created from, so a queue pair never outlives
//! its identifier and a registration never outlives its protection domain.

mod cm;
mod device;

pub use cm::{VerbsChannel, VerbsId};
pub use device::{VerbsDevice, VerbsMr, VerbsQp};

use crate::error::{RdsmError, Result};
use crate::transport::fabric::{Access, Fabric, QpCaps};
use std::net::SocketAddr;
use std::time::Duration;

/// RDMA connection manager plus verbs on the host's adapters.
#[derive(Debug, Clone, Copy, Default)]
pub struct VerbsFabric;

impl VerbsFabric {
    pub fn new() -> Self {
        Self
    }
}

impl Fabric for VerbsFabric {
    type Id = VerbsId;
    type Channel = VerbsChannel;
    type Device = VerbsDevice;
    type Qp = VerbsQp;
    type Mr = VerbsMr;

    fn listen(&self, addr: SocketAddr) -> Result<VerbsChannel> {
        VerbsChannel::listener(addr)
    }

    fn dial(&self, addr: SocketAddr, timeout: Duration) -> Result<VerbsChannel> {
        VerbsChannel::dialer(addr, timeout)
    }

    fn open_device(&self, id: &VerbsId, cq_depth: u32) -> Result<VerbsDevice> {
        VerbsDevice::open(id, cq_depth)
    }

    fn create_qp(&self, id: &VerbsId, device: &VerbsDevice, caps: QpCaps) -> Result<VerbsQp> {
        VerbsQp::create(id, device, caps)
    }

    fn register(
        &self,
        device: &VerbsDevice,
        addr: *mut u8,
        len: usize,
        access: Access,
    ) -> Result<VerbsMr> {
        VerbsMr::register(device, addr, len, access)
    }
}

/// `ms` clamped into the `c_int` millisecond timeouts librdmacm takes.
fn timeout_ms(timeout: Duration) -> libc::c_int {
    timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int
}

/// Put `fd` into non-blocking mode so it can be waited on with `poll`.
fn set_nonblocking(fd: libc::c_int, what: &str) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(RdsmError::last_os_device(&format!("fcntl({what})")));
    }
    Ok(())
}

/// Wait up to `timeout` for `fd` to become readable.
fn wait_readable(fd: libc::c_int, timeout: Duration) -> Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms(timeout)) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(RdsmError::device_with_source("poll failed", err));
    }
    Ok(rc > 0 && pfd.revents & libc::POLLIN != 0)
}

// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Connected socket pairs used to talk to a mount helper process

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};

use crate::{Error, Result};

#[cfg(test)]
#[path = "./endpoint_test.rs"]
mod endpoint_test;

/// One end of a connected local socket.
///
/// Bytes and file descriptors can both be passed over an endpoint.
/// The tag is only used to make logs and debug output readable.
#[derive(Debug)]
pub struct Endpoint {
    stream: UnixStream,
    tag: &'static str,
}

impl Endpoint {
    pub fn tag(&self) -> &'static str {
        self.tag
    }

    /// Give up the endpoint, returning the underlying descriptor.
    pub fn into_owned_fd(self) -> OwnedFd {
        self.stream.into()
    }
}

impl AsFd for Endpoint {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

impl AsRawFd for Endpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl Read for &Endpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }
}

impl Write for &Endpoint {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.stream).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&self.stream).flush()
    }
}

/// Two mutually connected endpoints.
///
/// The `remote` end is meant to be handed to a child process,
/// the `local` end stays with the current process.
#[derive(Debug)]
pub struct EndpointPair {
    pub local: Endpoint,
    pub remote: Endpoint,
}

impl EndpointPair {
    /// Create a new stream socket pair, both ends marked close-on-exec.
    ///
    /// Descriptors that should survive into a child are placed there
    /// explicitly by the launcher, so nothing here leaks into unrelated
    /// processes spawned by the caller.
    pub fn new(tag: &'static str) -> Result<Self> {
        let (local, remote) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .map_err(|errno| Error::from_alloc("creating a socket pair", io::Error::from(errno)))?;
        set_cloexec(local.as_raw_fd())?;
        set_cloexec(remote.as_raw_fd())?;
        tracing::trace!(
            tag,
            local = local.as_raw_fd(),
            remote = remote.as_raw_fd(),
            "created endpoint pair"
        );
        Ok(Self {
            local: Endpoint {
                stream: UnixStream::from(local),
                tag,
            },
            remote: Endpoint {
                stream: UnixStream::from(remote),
                tag,
            },
        })
    }
}

/// Mark a descriptor as not inherited by future child processes.
pub(crate) fn set_cloexec(fd: RawFd) -> Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}

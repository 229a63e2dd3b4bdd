// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Receiving file descriptors as socket ancillary data
//!
//! This is the only place that knows the byte layout of a control
//! message header. Everything outside of this module only deals in
//! owned descriptors.

use std::io;
use std::mem::{offset_of, size_of};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::endpoint::Endpoint;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./ancillary_test.rs"]
mod ancillary_test;

/// Room for far more control data than a single descriptor needs, so
/// that an unexpected message is reported rather than truncated.
const CONTROL_CAPACITY: usize = 1024;

const LEN_OFFSET: usize = offset_of!(libc::cmsghdr, cmsg_len);
const TYPE_OFFSET: usize = offset_of!(libc::cmsghdr, cmsg_type);
const TYPE_WIDTH: usize = size_of::<libc::c_int>();
const DESCRIPTOR_WIDTH: usize = size_of::<RawFd>();

#[repr(C, align(8))]
struct ControlBuffer([u8; CONTROL_CAPACITY]);

/// Offset of the first payload byte after the (padded) header.
fn data_offset() -> usize {
    // SAFETY: CMSG_LEN only does arithmetic on its argument
    unsafe { libc::CMSG_LEN(0) as usize }
}

/// The smallest control message that can carry one descriptor.
fn minimum_len() -> usize {
    data_offset() + DESCRIPTOR_WIDTH
}

fn read_int(buf: &[u8], offset: usize) -> Option<libc::c_int> {
    let bytes = buf.get(offset..offset + TYPE_WIDTH)?;
    Some(libc::c_int::from_ne_bytes(bytes.try_into().ok()?))
}

/// Extract the single descriptor carried by a rights control message.
///
/// Only the message type and the first descriptor are interpreted,
/// every read is bounds checked against the provided buffer.
pub fn decode_rights(control: &[u8]) -> Result<RawFd> {
    if control.len() < minimum_len() {
        return Err(Error::protocol(format!(
            "control message too short: {} bytes",
            control.len()
        )));
    }
    let kind = read_int(control, TYPE_OFFSET)
        .ok_or_else(|| Error::protocol("control message too short"))?;
    if kind != libc::SCM_RIGHTS {
        return Err(Error::protocol(format!(
            "wrong control message type: {kind}"
        )));
    }
    let fd = read_int(control, data_offset())
        .ok_or_else(|| Error::protocol("control message too short"))?;
    if fd < 0 {
        return Err(Error::protocol(format!("invalid descriptor: {fd}")));
    }
    Ok(fd)
}

/// Block until the peer sends one message carrying a descriptor.
///
/// The peer closing its end before anything arrives is a protocol
/// violation, since the helper is expected to always hand over
/// the channel before exiting.
pub fn receive_descriptor(endpoint: &Endpoint) -> Result<OwnedFd> {
    let mut data = [0u8; 4];
    let mut control = ControlBuffer([0u8; CONTROL_CAPACITY]);
    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr().cast(),
        iov_len: data.len(),
    };
    // SAFETY: msghdr is plain old data, all zeroes is a valid value
    let mut header: libc::msghdr = unsafe { std::mem::zeroed() };
    header.msg_iov = &mut iov;
    header.msg_iovlen = 1;
    header.msg_control = control.0.as_mut_ptr().cast();
    header.msg_controllen = CONTROL_CAPACITY as _;

    let received = loop {
        // SAFETY: the header points at buffers that outlive the call
        // and their lengths are set accordingly
        let n = unsafe { libc::recvmsg(endpoint.as_raw_fd(), &mut header, 0) };
        if n >= 0 {
            break n;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err.into());
        }
    };

    let control_len = header.msg_controllen as usize;
    tracing::trace!(
        tag = endpoint.tag(),
        received,
        control_len,
        "received message from helper"
    );
    if received == 0 && control_len == 0 {
        return Err(Error::protocol(
            "helper closed the connection without sending a descriptor",
        ));
    }
    let control = control.0.get(..control_len).unwrap_or(&control.0[..]);
    let truncated = header.msg_flags & libc::MSG_CTRUNC != 0;
    // SAFETY: every descriptor in a rights message was installed into
    // our table by this receive, and nothing else refers to them yet
    unsafe { adopt_rights(control, truncated) }
}

/// Take ownership of every descriptor carried in `control`, keeping
/// only the channel and closing all the others.
///
/// When the message is rejected, all of them are closed.
///
/// # Safety
///
/// The descriptors in every rights message of `control` must be owned
/// by the caller and not be in use anywhere else.
unsafe fn adopt_rights(control: &[u8], truncated: bool) -> Result<OwnedFd> {
    let mut adopted: Vec<OwnedFd> = rights_descriptors(control)
        .into_iter()
        // SAFETY: ownership is guaranteed by the caller
        .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
        .collect();
    if truncated {
        return Err(Error::protocol("control message was truncated"));
    }
    let fd = decode_rights(control)?;
    let position = adopted
        .iter()
        .position(|owned| owned.as_raw_fd() == fd)
        .ok_or_else(|| Error::protocol(format!("invalid descriptor: {fd}")))?;
    let channel = adopted.swap_remove(position);
    if !adopted.is_empty() {
        tracing::warn!(
            extra = adopted.len(),
            "closing unexpected descriptors sent by the helper"
        );
    }
    Ok(channel)
}

/// The width of the length field of a control message header, which
/// differs between platforms.
fn len_width() -> usize {
    // SAFETY: cmsghdr is plain old data, all zeroes is a valid value
    let header: libc::cmsghdr = unsafe { std::mem::zeroed() };
    std::mem::size_of_val(&header.cmsg_len)
}

fn read_len(buf: &[u8]) -> Option<usize> {
    let bytes = buf.get(LEN_OFFSET..LEN_OFFSET + len_width())?;
    match bytes.len() {
        4 => usize::try_from(u32::from_ne_bytes(bytes.try_into().ok()?)).ok(),
        8 => usize::try_from(u64::from_ne_bytes(bytes.try_into().ok()?)).ok(),
        _ => None,
    }
}

/// Every non-negative descriptor found in the rights messages of a
/// control buffer, in the order that they appear.
///
/// A message that claims to extend past the end of the buffer only
/// contributes the descriptors that fit.
fn rights_descriptors(control: &[u8]) -> Vec<RawFd> {
    let mut fds = Vec::new();
    let mut offset = 0;
    while let Some(message) = control.get(offset..) {
        let Some(len) = read_len(message) else {
            break;
        };
        if len < data_offset() {
            break;
        }
        if read_int(message, TYPE_OFFSET) == Some(libc::SCM_RIGHTS) {
            let end = len.min(message.len());
            let mut at = data_offset();
            while at + DESCRIPTOR_WIDTH <= end {
                match read_int(message, at) {
                    Some(fd) if fd >= 0 => fds.push(fd),
                    _ => {}
                }
                at += DESCRIPTOR_WIDTH;
            }
        }
        let Ok(payload) = libc::c_uint::try_from(len - data_offset()) else {
            break;
        };
        // SAFETY: CMSG_SPACE only does arithmetic on its argument
        offset += unsafe { libc::CMSG_SPACE(payload) } as usize;
    }
    fds
}

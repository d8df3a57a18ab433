// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DSCP/TOS marking for PD sockets.
//!
//! The per-publication QoS value is a DSCP code point (0-63) written into
//! the IP TOS field so switches can prioritise cyclic traffic. Typical
//! assignments on a train backbone:
//!
//! | DSCP | use |
//! |------|-----|
//! | 46 (EF) | safety-critical control loops |
//! | 34 (AF41) | operational telemetry |
//! | 5 | TRDP default PD priority |
//! | 0 | best effort |

use std::io;
use std::net::UdpSocket;

/// TOS byte for a DSCP code point (DSCP occupies the upper 6 bits).
#[inline]
pub const fn dscp_to_tos(dscp: u8) -> u8 {
    (dscp & 0x3F) << 2
}

/// Apply a DSCP code point to outgoing packets on `socket`.
#[cfg(unix)]
pub fn set_socket_qos(socket: &UdpSocket, dscp: u8) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let fd = socket.as_raw_fd();
    let tos_val = i32::from(dscp_to_tos(dscp));
    // SAFETY: setsockopt FFI with a valid fd, standard option constants,
    // and a correctly sized, stack-allocated option value.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IP,
            libc::IP_TOS,
            std::ptr::addr_of!(tos_val).cast(),
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        let err = io::Error::last_os_error();
        log::warn!("[DSCP] failed to set TOS={} on fd={}: {}", tos_val, fd, err);
        return Err(err);
    }
    log::debug!("[DSCP] set TOS={} (DSCP={}) on fd={}", tos_val, dscp, fd);
    Ok(())
}

/// Apply a DSCP code point to outgoing packets on `socket` (portable path).
#[cfg(not(unix))]
pub fn set_socket_qos(socket: &UdpSocket, dscp: u8) -> io::Result<()> {
    let sock_ref = socket2::SockRef::from(socket);
    sock_ref.set_tos(u32::from(dscp_to_tos(dscp)))
}

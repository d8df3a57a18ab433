// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Datagram reception with destination-address recovery.
//!
//! The receive pipeline must know whether a frame arrived on the session's
//! unicast address or on a multicast group, because subscriptions filter on
//! the real destination; it also discards frames that arrived through a
//! foreign interface. On Linux both come from `IP_PKTINFO`; elsewhere they
//! are reported as unspecified and the pipeline falls back to its bound
//! address.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

/// Metadata of one received datagram.
#[derive(Debug, Clone, Copy)]
pub struct RecvMeta {
    pub len: usize,
    pub src: SocketAddrV4,
    /// Destination address of the IP header (unicast or multicast group).
    pub dst: Ipv4Addr,
    /// Local address of the interface the packet arrived on.
    pub if_addr: Ipv4Addr,
}

/// Ask the kernel to attach packet-info control messages to this socket.
#[cfg(target_os = "linux")]
pub fn enable_pktinfo(socket: &UdpSocket) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let fd = socket.as_raw_fd();
    let on: libc::c_int = 1;
    // SAFETY: setsockopt FFI with a valid fd and a correctly sized optval.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IP,
            libc::IP_PKTINFO,
            std::ptr::addr_of!(on).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn enable_pktinfo(_socket: &UdpSocket) -> io::Result<()> {
    Ok(())
}

/// Receive one datagram together with its addressing metadata.
#[cfg(target_os = "linux")]
pub fn recv_with_dst(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<RecvMeta> {
    use std::os::unix::io::AsRawFd;

    let fd = socket.as_raw_fd();
    // SAFETY: all pointers handed to recvmsg reference live stack storage;
    // msghdr/iovec are zero-initialised and filled field by field; the
    // control buffer is large enough for one in_pktinfo control message.
    unsafe {
        let mut src: libc::sockaddr_in = std::mem::zeroed();
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        let mut cmsg_space = [0u8; 64];
        let mut msg: libc::msghdr = std::mem::zeroed();
        msg.msg_name = std::ptr::addr_of_mut!(src).cast();
        msg.msg_namelen = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_space.as_mut_ptr().cast();
        msg.msg_controllen = cmsg_space.len() as _;

        let n = libc::recvmsg(fd, &mut msg, 0);
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut dst = Ipv4Addr::UNSPECIFIED;
        let mut if_addr = Ipv4Addr::UNSPECIFIED;
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::IPPROTO_IP && (*cmsg).cmsg_type == libc::IP_PKTINFO {
                let info = libc::CMSG_DATA(cmsg)
                    .cast::<libc::in_pktinfo>()
                    .read_unaligned();
                dst = Ipv4Addr::from(u32::from_be(info.ipi_addr.s_addr));
                if_addr = Ipv4Addr::from(u32::from_be(info.ipi_spec_dst.s_addr));
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }

        Ok(RecvMeta {
            len: n as usize,
            src: SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(src.sin_addr.s_addr)),
                u16::from_be(src.sin_port),
            ),
            dst,
            if_addr,
        })
    }
}

#[cfg(not(target_os = "linux"))]
pub fn recv_with_dst(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<RecvMeta> {
    let (len, src) = socket.recv_from(buf)?;
    let src = match src {
        std::net::SocketAddr::V4(v4) => v4,
        std::net::SocketAddr::V6(_) => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
    };
    Ok(RecvMeta {
        len,
        src,
        dst: Ipv4Addr::UNSPECIFIED,
        if_addr: Ipv4Addr::UNSPECIFIED,
    })
}

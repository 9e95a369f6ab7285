// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! UDP socket plumbing. One listening socket is shared by all sessions and
//! carries the TTL of every datagram as ancillary data so the GTSM check can
//! run; each session has its own output socket with the TTL pinned to 255.

use crate::error::Error;
use crate::BFD_CONTROL_TTL;
use slog::{debug, warn, Logger};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::mem;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::os::fd::AsRawFd;

/// One received datagram with its metadata. `ttl` is `None` when the kernel
/// did not report one.
#[derive(Debug)]
pub struct Datagram {
    pub len: usize,
    pub src: SocketAddr,
    pub ttl: Option<u8>,
}

/// Open the shared listening socket, dual-stack on `[::]:port`, with TTL
/// reporting enabled for both address families.
pub fn open_listener(port: u16) -> Result<Socket, Error> {
    let sk = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    sk.set_only_v6(false)?;
    set_recv_ttl(&sk)?;
    let sa: SockAddr =
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port).into();
    sk.bind(&sa)?;
    Ok(sk)
}

/// Open a per-session output socket, bound to `source` when one is
/// configured, with the transmit TTL pinned per RFC 5881.
pub fn open_transmit(
    neighbor: IpAddr,
    source: Option<IpAddr>,
) -> Result<Socket, Error> {
    let domain = if neighbor.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let sk = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if let Some(src) = source {
        let sa: SockAddr = SocketAddr::new(src, 0).into();
        sk.bind(&sa)?;
    }
    if neighbor.is_ipv4() {
        sk.set_ttl(BFD_CONTROL_TTL as u32)?;
    } else {
        sk.set_unicast_hops_v6(BFD_CONTROL_TTL as u32)?;
    }
    Ok(sk)
}

/// Request the TTL / hop limit of received datagrams as a control message.
/// socket2 has no wrapper for these options, so this goes through libc.
fn set_recv_ttl(sk: &Socket) -> Result<(), Error> {
    let yes: libc::c_int = 1;
    for (level, opt) in [
        (libc::IPPROTO_IP, libc::IP_RECVTTL),
        (libc::IPPROTO_IPV6, libc::IPV6_RECVHOPLIMIT),
    ] {
        let r = unsafe {
            libc::setsockopt(
                sk.as_raw_fd(),
                level,
                opt,
                (&yes as *const libc::c_int).cast(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if r == -1 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Read one datagram along with its source address and TTL. A TTL of zero is
/// reported as unobservable, matching the semantics the GTSM check expects.
pub fn recv_with_ttl(
    sk: &Socket,
    buf: &mut [u8],
    log: &Logger,
) -> Result<Datagram, Error> {
    let mut src_storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    // room for one int-sized control message per family
    let mut cbuf = [0u8; 64];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = (&mut src_storage as *mut libc::sockaddr_storage).cast();
    msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as _;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cbuf.as_mut_ptr().cast();
    msg.msg_controllen = cbuf.len() as _;

    let n = unsafe { libc::recvmsg(sk.as_raw_fd(), &mut msg, 0) };
    if n < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    if msg.msg_flags & libc::MSG_TRUNC != 0 {
        return Err(Error::Truncated);
    }
    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        warn!(log, "control message truncated");
    }

    let mut ttl = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            let level = (*cmsg).cmsg_level;
            let ty = (*cmsg).cmsg_type;
            if (level == libc::IPPROTO_IP && ty == libc::IP_TTL)
                || (level == libc::IPPROTO_IPV6 && ty == libc::IPV6_HOPLIMIT)
            {
                let v: libc::c_int =
                    std::ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast());
                if v > 0 {
                    ttl = Some(v as u8);
                }
            } else {
                warn!(log, "unexpected control message";
                    "level" => level, "type" => ty);
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }
    if ttl.is_none() {
        debug!(log, "datagram carried no ttl ancillary data");
    }

    let src = sockaddr_to_std(&src_storage).ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "non-ip source address",
        ))
    })?;

    Ok(Datagram {
        len: n as usize,
        src,
        ttl,
    })
}

/// Convert a kernel-filled sockaddr_storage into a std SocketAddr.
fn sockaddr_to_std(ss: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match ss.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe {
                &*(ss as *const libc::sockaddr_storage)
                    .cast::<libc::sockaddr_in>()
            };
            let ip = std::net::Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sa.sin_port)))
        }
        libc::AF_INET6 => {
            let sa = unsafe {
                &*(ss as *const libc::sockaddr_storage)
                    .cast::<libc::sockaddr_in6>()
            };
            let ip = Ipv6Addr::from(sa.sin6_addr.s6_addr);
            Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sa.sin6_port)))
        }
        _ => None,
    }
}

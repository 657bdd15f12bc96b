//! Network plumbing: the listener socket, peer identity, per-IP admission
//! control, and the optional MACVLAN peer handed to the child's netns.
//!
//! The listener is a dual-stack AF_INET6 TCP socket, so IPv4 peers show up
//! as v4-mapped addresses. Peer identity is rendered once per child as
//! `[ip]:port` and kept in the pid registry for admission control and the
//! process listing.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::process::Command;

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::registry::PidRegistry;

/// Peer identity string used for children without a TCP peer.
pub const STANDALONE_PEER: &str = "[STANDALONE]";

/// Bind a dual-stack TCP listener on `host:port`.
pub fn bind_listen(host: &str, port: u16) -> Result<OwnedFd> {
    // SAFETY: socket() with constant arguments.
    let fd = unsafe {
        libc::socket(
            libc::AF_INET6,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd == -1 {
        return Err(Error::sys("socket(AF_INET6)"));
    }
    // SAFETY: fd was just returned by socket().
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    setsockopt_int(&fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1, "SO_REUSEADDR")?;
    setsockopt_int(&fd, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, 0, "IPV6_V6ONLY")?;

    let addr = parse_bindhost(host)
        .ok_or_else(|| Error::Config(format!("cannot parse bind address: {host}")))?;
    let sa = libc::sockaddr_in6 {
        sin6_family: libc::AF_INET6 as libc::sa_family_t,
        sin6_port: port.to_be(),
        sin6_flowinfo: 0,
        sin6_addr: libc::in6_addr {
            s6_addr: addr.octets(),
        },
        sin6_scope_id: 0,
    };
    // SAFETY: sa is a fully initialized sockaddr_in6.
    let ret = unsafe {
        libc::bind(
            raw(&fd),
            (&sa as *const libc::sockaddr_in6).cast(),
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
        )
    };
    if ret == -1 {
        return Err(Error::sys("bind"));
    }
    // SAFETY: listen on our own bound socket.
    if unsafe { libc::listen(raw(&fd), 32) } == -1 {
        return Err(Error::sys("listen"));
    }
    Ok(fd)
}

/// Accept one connection. EINTR (the 1 Hz timer) is expected and yields
/// `None`; real errors are logged and also yield `None` so the accept loop
/// keeps running.
pub fn accept(listen: &OwnedFd) -> Option<OwnedFd> {
    // SAFETY: accept4 on our own listening socket, no addr out-params.
    let conn = unsafe {
        libc::accept4(
            raw(listen),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            libc::SOCK_CLOEXEC,
        )
    };
    if conn == -1 {
        let errno = oubliette_sys::last_errno();
        if errno != rustix::io::Errno::INTR {
            warn!(%errno, "accept4 failed");
        }
        return None;
    }
    // SAFETY: conn was just returned by accept4.
    Some(unsafe { OwnedFd::from_raw_fd(conn) })
}

/// Render the peer of `sock` as `[ip]:port`, with the binary address
/// alongside. Sockets without an inet peer (standalone stdio) get the
/// [`STANDALONE_PEER`] marker.
pub fn peer_text(sock: RawFd) -> (String, Option<IpAddr>) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // SAFETY: storage/len form a valid out-buffer for getpeername.
    let ret = unsafe {
        libc::getpeername(
            sock,
            (&mut storage as *mut libc::sockaddr_storage).cast(),
            &mut len,
        )
    };
    if ret == -1 {
        return (STANDALONE_PEER.into(), None);
    }

    match storage.ss_family as libc::c_int {
        libc::AF_INET6 => {
            // SAFETY: the kernel filled a sockaddr_in6 for an AF_INET6 peer.
            let sa = unsafe { &*(&storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in6>() };
            let ip = Ipv6Addr::from(sa.sin6_addr.s6_addr);
            let port = u16::from_be(sa.sin6_port);
            // Render v4-mapped peers as plain IPv4.
            match ip.to_ipv4_mapped() {
                Some(v4) => (format!("[{v4}]:{port}"), Some(IpAddr::V4(v4))),
                None => (format!("[{ip}]:{port}"), Some(IpAddr::V6(ip))),
            }
        }
        libc::AF_INET => {
            // SAFETY: the kernel filled a sockaddr_in for an AF_INET peer.
            let sa = unsafe { &*(&storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>() };
            let ip = Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            let port = u16::from_be(sa.sin_port);
            (format!("[{ip}]:{port}"), Some(IpAddr::V4(ip)))
        }
        _ => (STANDALONE_PEER.into(), None),
    }
}

/// Admission control: reject the connection when its peer IP already has
/// `max_conns_per_ip` live children. 0 disables the cap.
pub fn limit_conns(cfg: &Config, registry: &PidRegistry, conn: RawFd) -> bool {
    if cfg.max_conns_per_ip == 0 {
        return true;
    }
    let (text, Some(ip)) = peer_text(conn) else {
        return true;
    };
    let live = registry
        .iter()
        .filter(|rec| rec.peer_addr == Some(ip))
        .count();
    if live >= cfg.max_conns_per_ip as usize {
        warn!(
            peer = %text,
            live,
            cap = cfg.max_conns_per_ip,
            "too many connections from this address, rejecting"
        );
        return false;
    }
    true
}

/// Parent side: create the MACVLAN peer off the configured master and move
/// it into the child's netns. Delegated to ip(8), the same external-helper
/// pattern as newuidmap. No master configured means nothing to do.
pub fn init_parent(cfg: &Config, pid: libc::pid_t) -> Result<()> {
    let Some(master) = &cfg.iface.macvlan_master else {
        return Ok(());
    };
    debug!(master = %master, peer = %cfg.iface.vs_name, pid, "attaching macvlan peer");
    let pid_arg = pid.to_string();
    let status = Command::new("ip")
        .args([
            "link", "add", "link", master.as_str(),
            "name", cfg.iface.vs_name.as_str(),
            "netns", pid_arg.as_str(),
            "type", "macvlan", "mode", "bridge",
        ])
        .status()?;
    if !status.success() {
        return Err(Error::ExternalTool {
            tool: "ip link add",
            status: status.code().unwrap_or(-1),
        });
    }
    Ok(())
}

/// Child side: bring up `lo`, then configure and raise the MACVLAN peer.
pub fn init_child(cfg: &Config) -> Result<()> {
    if !cfg.namespaces.net {
        return Ok(());
    }
    if !cfg.iface.no_lo {
        iface_up("lo")?;
    }
    if let Some(ip) = cfg.iface.vs_ip {
        let netmask = cfg.iface.vs_netmask.unwrap_or(Ipv4Addr::new(255, 255, 255, 0));
        iface_addr(&cfg.iface.vs_name, ip, netmask)?;
        iface_up(&cfg.iface.vs_name)?;
        if let Some(gw) = cfg.iface.vs_gateway {
            route_default(gw)?;
        }
    }
    Ok(())
}

fn parse_bindhost(host: &str) -> Option<Ipv6Addr> {
    if host.is_empty() {
        return Some(Ipv6Addr::UNSPECIFIED);
    }
    if let Ok(v6) = host.parse::<Ipv6Addr>() {
        return Some(v6);
    }
    host.parse::<Ipv4Addr>().ok().map(|v4| v4.to_ipv6_mapped())
}

fn setsockopt_int(
    fd: &OwnedFd,
    level: libc::c_int,
    opt: libc::c_int,
    value: libc::c_int,
    call: &'static str,
) -> Result<()> {
    // SAFETY: value outlives the call; size matches.
    let ret = unsafe {
        libc::setsockopt(
            raw(fd),
            level,
            opt,
            (&value as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret == -1 {
        Err(Error::Sys {
            call,
            errno: oubliette_sys::last_errno(),
        })
    } else {
        Ok(())
    }
}

fn raw(fd: &OwnedFd) -> RawFd {
    use std::os::fd::AsRawFd;
    fd.as_raw_fd()
}

fn ctl_socket() -> Result<OwnedFd> {
    // SAFETY: socket() with constant arguments.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if fd == -1 {
        return Err(Error::sys("socket(AF_INET, SOCK_DGRAM)"));
    }
    // SAFETY: fd was just returned by socket().
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn ifreq_for(name: &str) -> Result<libc::ifreq> {
    // SAFETY: ifreq is plain old data.
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    let bytes = name.as_bytes();
    if bytes.len() >= ifr.ifr_name.len() {
        return Err(Error::Config(format!("interface name too long: {name}")));
    }
    for (dst, src) in ifr.ifr_name.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    Ok(ifr)
}

fn iface_up(name: &str) -> Result<()> {
    let sock = ctl_socket()?;
    let mut ifr = ifreq_for(name)?;
    // SAFETY: ifr is a valid ifreq; SIOCGIFFLAGS fills the flags union arm.
    if unsafe { libc::ioctl(raw(&sock), libc::SIOCGIFFLAGS, &mut ifr) } == -1 {
        return Err(Error::sys("ioctl(SIOCGIFFLAGS)"));
    }
    // SAFETY: the flags arm was just written by the kernel.
    unsafe {
        ifr.ifr_ifru.ifru_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
    }
    // SAFETY: as above.
    if unsafe { libc::ioctl(raw(&sock), libc::SIOCSIFFLAGS, &ifr) } == -1 {
        return Err(Error::sys("ioctl(SIOCSIFFLAGS)"));
    }
    debug!(iface = name, "interface up");
    Ok(())
}

fn inet_sockaddr(ip: Ipv4Addr) -> libc::sockaddr {
    let sin = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr {
            s_addr: u32::from(ip).to_be(),
        },
        sin_zero: [0; 8],
    };
    // SAFETY: sockaddr_in fits inside sockaddr; both are plain old data.
    unsafe { std::mem::transmute::<libc::sockaddr_in, libc::sockaddr>(sin) }
}

fn iface_addr(name: &str, ip: Ipv4Addr, netmask: Ipv4Addr) -> Result<()> {
    let sock = ctl_socket()?;

    let mut ifr = ifreq_for(name)?;
    ifr.ifr_ifru.ifru_addr = inet_sockaddr(ip);
    // SAFETY: ifr carries a valid address arm.
    if unsafe { libc::ioctl(raw(&sock), libc::SIOCSIFADDR, &ifr) } == -1 {
        return Err(Error::sys("ioctl(SIOCSIFADDR)"));
    }

    let mut ifr = ifreq_for(name)?;
    ifr.ifr_ifru.ifru_netmask = inet_sockaddr(netmask);
    // SAFETY: as above.
    if unsafe { libc::ioctl(raw(&sock), libc::SIOCSIFNETMASK, &ifr) } == -1 {
        return Err(Error::sys("ioctl(SIOCSIFNETMASK)"));
    }
    debug!(iface = name, %ip, %netmask, "interface address set");
    Ok(())
}

fn route_default(gateway: Ipv4Addr) -> Result<()> {
    let sock = ctl_socket()?;
    // SAFETY: rtentry is plain old data.
    let mut route: libc::rtentry = unsafe { std::mem::zeroed() };
    route.rt_dst = inet_sockaddr(Ipv4Addr::UNSPECIFIED);
    route.rt_genmask = inet_sockaddr(Ipv4Addr::UNSPECIFIED);
    route.rt_gateway = inet_sockaddr(gateway);
    route.rt_flags = (libc::RTF_UP | libc::RTF_GATEWAY) as libc::c_ushort;
    // SAFETY: route is a fully initialized rtentry.
    if unsafe { libc::ioctl(raw(&sock), libc::SIOCADDRT, &route) } == -1 {
        return Err(Error::sys("ioctl(SIOCADDRT)"));
    }
    debug!(%gateway, "default route set");
    Ok(())
}

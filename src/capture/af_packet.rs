//! AF_PACKET socket implementation

use super::{Capture, RxInfo};
use crate::protocol::MacAddr;
use crate::{Error, Result};
use std::ffi::CString;
use std::os::unix::io::{AsRawFd, RawFd};
use tokio::io::unix::AsyncFd;

/// Raw socket bound to one device, in promiscuous mode
pub struct AfPacketSocket {
    async_fd: AsyncFd<RawFd>,
    ifindex: i32,
    mac: MacAddr,
}

impl AfPacketSocket {
    /// Create a new AF_PACKET socket bound to the specified interface
    pub fn bind(ifname: &str) -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                (libc::ETH_P_ALL as u16).to_be() as i32,
            )
        };

        if fd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        let (ifindex, mac) = match Self::device_info(fd, ifname) {
            Ok(info) => info,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };

        let sockaddr = libc::sockaddr_ll {
            sll_family: libc::AF_PACKET as u16,
            sll_protocol: (libc::ETH_P_ALL as u16).to_be(),
            sll_ifindex: ifindex,
            sll_hatype: 0,
            sll_pkttype: 0,
            sll_halen: 0,
            sll_addr: [0; 8],
        };

        let ret = unsafe {
            libc::bind(
                fd,
                &sockaddr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as u32,
            )
        };

        if ret < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::Io(err));
        }

        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };

        // the node decides what is addressed to it, so take every frame
        if let Err(e) = Self::set_promisc(fd, ifindex, true) {
            unsafe { libc::close(fd) };
            return Err(e);
        }

        let async_fd = AsyncFd::new(fd).map_err(Error::Io)?;

        Ok(Self {
            async_fd,
            ifindex,
            mac,
        })
    }

    fn ifreq(ifname: &str) -> Result<libc::ifreq> {
        let ifname_c = CString::new(ifname).map_err(|_| Error::InterfaceNotFound {
            name: ifname.to_string(),
        })?;
        let name_bytes = ifname_c.as_bytes_with_nul();

        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        if name_bytes.len() > ifr.ifr_name.len() {
            return Err(Error::InterfaceNotFound {
                name: ifname.to_string(),
            });
        }
        for (dst, src) in ifr.ifr_name.iter_mut().zip(name_bytes) {
            *dst = *src as libc::c_char;
        }
        Ok(ifr)
    }

    /// Index and hardware address of `ifname`
    fn device_info(fd: RawFd, ifname: &str) -> Result<(i32, MacAddr)> {
        let mut ifr = Self::ifreq(ifname)?;
        let ret = unsafe { libc::ioctl(fd, libc::SIOCGIFINDEX, &mut ifr) };
        if ret < 0 {
            return Err(Error::InterfaceNotFound {
                name: ifname.to_string(),
            });
        }
        let ifindex = unsafe { ifr.ifr_ifru.ifru_ifindex };

        let mut ifr = Self::ifreq(ifname)?;
        let ret = unsafe { libc::ioctl(fd, libc::SIOCGIFHWADDR, &mut ifr) };
        if ret < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        let data = unsafe { ifr.ifr_ifru.ifru_hwaddr.sa_data };
        let mut mac = [0u8; 6];
        for (dst, src) in mac.iter_mut().zip(data.iter()) {
            *dst = *src as u8;
        }

        Ok((ifindex, MacAddr(mac)))
    }

    fn set_promisc(fd: RawFd, ifindex: i32, enable: bool) -> Result<()> {
        let mreq = libc::packet_mreq {
            mr_ifindex: ifindex,
            mr_type: libc::PACKET_MR_PROMISC as u16,
            mr_alen: 0,
            mr_address: [0; 8],
        };

        let optname = if enable {
            libc::PACKET_ADD_MEMBERSHIP
        } else {
            libc::PACKET_DROP_MEMBERSHIP
        };

        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_PACKET,
                optname,
                &mreq as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::packet_mreq>() as u32,
            )
        };

        if ret < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        Ok(())
    }

    pub async fn recv(&self, buf: &mut [u8]) -> Result<RxInfo> {
        loop {
            let mut guard = self.async_fd.readable().await.map_err(Error::Io)?;

            match guard.try_io(|inner| {
                let fd = *inner.get_ref();
                let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut _, buf.len(), 0) };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(len)) => return Ok(RxInfo { len, vlan_id: None }),
                Ok(Err(e)) => return Err(Error::Io(e)),
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn send(&self, buf: &[u8]) -> Result<usize> {
        loop {
            let mut guard = self.async_fd.writable().await.map_err(Error::Io)?;

            match guard.try_io(|inner| {
                let fd = *inner.get_ref();
                let n = unsafe { libc::send(fd, buf.as_ptr() as *const _, buf.len(), 0) };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(len)) => return Ok(len),
                Ok(Err(e)) => return Err(Error::Io(e)),
                Err(_would_block) => continue,
            }
        }
    }

    pub fn ifindex(&self) -> i32 {
        self.ifindex
    }

    /// Hardware address of the bound device
    pub fn mac(&self) -> MacAddr {
        self.mac
    }
}

impl AsRawFd for AfPacketSocket {
    fn as_raw_fd(&self) -> RawFd {
        *self.async_fd.get_ref()
    }
}

impl Drop for AfPacketSocket {
    fn drop(&mut self) {
        let _ = Self::set_promisc(*self.async_fd.get_ref(), self.ifindex, false);
        unsafe { libc::close(*self.async_fd.get_ref()) };
    }
}

impl Capture for AfPacketSocket {
    async fn recv(&self, buf: &mut [u8]) -> Result<RxInfo> {
        AfPacketSocket::recv(self, buf).await
    }

    async fn send(&self, buf: &[u8]) -> Result<usize> {
        AfPacketSocket::send(self, buf).await
    }
}

//! TUN/TAP devices through `/dev/net/tun`.
//!
//! The kernel has no RTNL support for creating these, so link requests of
//! kind `tuntap` are served here: the device is created with `TUNSETIFF`
//! and made persistent, after which it behaves like any other link.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::netlink::codec::{AttrValue, Body};
use crate::netlink::{Error, Result};

pub const TUN_DEVICE_PATH: &str = "/dev/net/tun";

const TUNSETIFF: libc::c_ulong = 0x400454ca;
const TUNSETPERSIST: libc::c_ulong = 0x400454cb;
const TUNSETOWNER: libc::c_ulong = 0x400454cc;
const TUNSETGROUP: libc::c_ulong = 0x400454ce;

pub const IFF_TUN: u32 = 0x0001;
pub const IFF_TAP: u32 = 0x0002;
pub const IFF_MULTI_QUEUE: u32 = 0x0100;
pub const IFF_NO_PI: u32 = 0x1000;
pub const IFF_ONE_QUEUE: u32 = 0x2000;
pub const IFF_VNET_HDR: u32 = 0x4000;

/// Layer of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Tun,
    Tap,
}

impl Mode {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "tun" => Ok(Mode::Tun),
            "tap" => Ok(Mode::Tap),
            other => Err(Error::InvalidAttribute(format!("tuntap mode {other}"))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Mode::Tun => "tun",
            Mode::Tap => "tap",
        }
    }

    fn flag(self) -> u32 {
        match self {
            Mode::Tun => IFF_TUN,
            Mode::Tap => IFF_TAP,
        }
    }

    /// Mode from the `tun_flags` sysfs value.
    pub fn from_flags(flags: u32) -> Self {
        if flags & IFF_TAP != 0 {
            Mode::Tap
        } else {
            Mode::Tun
        }
    }
}

/// Parameters of a persistent TUN/TAP device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunTap {
    pub name: String,
    pub mode: Mode,
    pub owner: Option<u32>,
    pub group: Option<u32>,
    pub no_pi: bool,
    pub one_queue: bool,
    pub vnet_hdr: bool,
    pub multi_queue: bool,
}

impl TunTap {
    pub fn new(name: impl Into<String>, mode: Mode) -> Self {
        Self {
            name: name.into(),
            mode,
            ..Default::default()
        }
    }

    /// Read the device parameters from an RTM_NEWLINK body of kind `tuntap`.
    pub fn from_link(body: &Body) -> Result<Self> {
        let name = body
            .attr_str("IFLA_IFNAME")
            .ok_or_else(|| Error::InvalidMessage("tuntap link without a name".into()))?;
        let mut dev = Self::new(name, Mode::Tun);
        let data = body
            .get_nested(&["IFLA_LINKINFO", "IFLA_INFO_DATA"])
            .and_then(AttrValue::as_nested)
            .unwrap_or(&[]);
        for a in data {
            let on = a.value.as_u64().is_some_and(|v| v != 0);
            match a.name {
                "IFLA_TUN_MODE" => dev.mode = Mode::parse(a.value.as_str().unwrap_or("tun"))?,
                "IFLA_TUN_OWNER" => dev.owner = a.value.as_u64().map(|v| v as u32),
                "IFLA_TUN_GROUP" => dev.group = a.value.as_u64().map(|v| v as u32),
                "IFLA_TUN_NO_PI" => dev.no_pi = on,
                "IFLA_TUN_ONE_QUEUE" => dev.one_queue = on,
                "IFLA_TUN_VNET_HDR" => dev.vnet_hdr = on,
                "IFLA_TUN_MULTI_QUEUE" => dev.multi_queue = on,
                _ => {}
            }
        }
        Ok(dev)
    }

    /// `ifr_flags` for `TUNSETIFF`.
    pub fn flags(&self) -> u32 {
        let mut flags = self.mode.flag();
        for (on, flag) in [
            (self.no_pi, IFF_NO_PI),
            (self.one_queue, IFF_ONE_QUEUE),
            (self.vnet_hdr, IFF_VNET_HDR),
            (self.multi_queue, IFF_MULTI_QUEUE),
        ] {
            if on {
                flags |= flag;
            }
        }
        flags
    }

    fn attach(&self) -> Result<File> {
        if self.name.len() >= libc::IFNAMSIZ {
            return Err(Error::InvalidAttribute(format!(
                "interface name too long: {}",
                self.name
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(TUN_DEVICE_PATH)?;

        // SAFETY: ifreq is plain old data; zeroed is a valid value.
        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        for (dst, src) in ifr.ifr_name.iter_mut().zip(self.name.as_bytes()) {
            *dst = *src as libc::c_char;
        }
        ifr.ifr_ifru.ifru_flags = self.flags() as libc::c_short;
        // SAFETY: TUNSETIFF reads an ifreq.
        if unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &ifr) } < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(file)
    }

    /// Create the device and make it persistent.
    pub fn create(&self) -> Result<()> {
        let file = self.attach()?;
        let fd = file.as_raw_fd();
        let ioctl = |request: libc::c_ulong, arg: libc::c_ulong| -> Result<()> {
            // SAFETY: the TUNSET* requests used here take an integer argument.
            if unsafe { libc::ioctl(fd, request, arg) } < 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            Ok(())
        };
        if let Some(uid) = self.owner {
            ioctl(TUNSETOWNER, uid as libc::c_ulong)?;
        }
        if let Some(gid) = self.group {
            ioctl(TUNSETGROUP, gid as libc::c_ulong)?;
        }
        ioctl(TUNSETPERSIST, 1)?;
        tracing::debug!(name = %self.name, mode = self.mode.name(), "created tuntap device");
        Ok(())
    }

    /// Drop persistence; the device disappears once the fd closes.
    pub fn delete(&self) -> Result<()> {
        let file = self.attach()?;
        // SAFETY: TUNSETPERSIST takes an integer argument.
        if unsafe { libc::ioctl(file.as_raw_fd(), TUNSETPERSIST, 0 as libc::c_ulong) } < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        tracing::debug!(name = %self.name, "deleted tuntap device");
        Ok(())
    }
}

/// `tun_flags` of an existing device, if it is a TUN/TAP one.
pub fn sysfs_flags(sysfs: &Path, name: &str) -> Option<u32> {
    let raw = std::fs::read_to_string(sysfs.join(name).join("tun_flags")).ok()?;
    let raw = raw.trim();
    u32::from_str_radix(raw.strip_prefix("0x").unwrap_or(raw), 16).ok()
}

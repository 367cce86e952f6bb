//! Link kinds the kernel cannot create over RTNL.
//!
//! [`Proxy::rtnl`] installs send handlers that serve RTM_NEWLINK,
//! RTM_DELLINK and RTM_SETLINK for these kinds with ioctls, sysfs writes or
//! helper programs, and a recv handler that labels such links with their
//! kind when the kernel reports none.
//!
//! | kind | create | delete |
//! |---|---|---|
//! | `tuntap` | `TUNSETIFF` + `TUNSETPERSIST` | `TUNSETPERSIST 0` |
//! | `openvswitch` | `ovs-vsctl add-br` | `ovs-vsctl del-br` |
//! | `team` | `teamd -d -n -t` | `teamd -k -t` |
//! | `bond` (ancient) | `+name` to `bonding_masters` | `-name` |
//! | `bridge` (ancient) | `SIOCBRADDBR` | `SIOCBRDELBR` |
//!
//! Ports are added to an openvswitch bridge with `ovs-vsctl add-port` when
//! a SETLINK points `IFLA_MASTER` at it.

use std::collections::HashMap;
use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::config::Config;
use crate::netlink::codec::{AttrValue, Attribute, Message};
use crate::netlink::message::{NLM_F_CREATE, NlMsgType};
use crate::netlink::proxy::{Proxy, Verdict};
use crate::netlink::{Error, Result};

use super::link::{LINKINFO_ATTRS, LinkExt, TUNTAP_DATA};
use super::tuntap::{self, TunTap};

/// Where interfaces show up in sysfs.
pub const SYSFS_NET: &str = "/sys/class/net";

const SIOCBRADDBR: libc::c_ulong = 0x89a0;
const SIOCBRDELBR: libc::c_ulong = 0x89a1;

/// Runs helper programs.
pub trait Runner: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> Result<()>;
}

/// Spawns the program and waits for it.
///
/// A program that cannot be spawned fails with its OS error, one that
/// exits unsuccessfully with `EINVAL`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl Runner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<()> {
        let status = Command::new(program).args(args).status()?;
        if !status.success() {
            return Err(Error::from_errno_with_context(
                libc::EINVAL,
                format!("{program} {}: {status}", args.join(" ")),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Helper {
    Tuntap(tuntap::Mode),
    Openvswitch,
    Team,
    Bond,
    Bridge,
}

impl Helper {
    fn kind(self) -> &'static str {
        match self {
            Helper::Tuntap(_) => "tuntap",
            Helper::Openvswitch => "openvswitch",
            Helper::Team => "team",
            Helper::Bond => "bond",
            Helper::Bridge => "bridge",
        }
    }
}

#[derive(Debug, Default)]
struct State {
    /// Links created here, by name.
    created: HashMap<String, Helper>,
    /// openvswitch port name to bridge name.
    ports: HashMap<String, String>,
}

struct Handlers {
    runner: Arc<dyn Runner>,
    sysfs: PathBuf,
    ancient: bool,
    state: Mutex<State>,
}

fn errno_of(e: &Error) -> i32 {
    match e {
        Error::Io(io) => io.raw_os_error().unwrap_or(libc::EIO),
        other => other.errno().unwrap_or(libc::EINVAL),
    }
}

fn ack(msg: &Message) -> Verdict {
    Verdict::Return(vec![Message::error(0, msg)])
}

impl Handlers {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Name of the interface with `index`, from sysfs.
    fn name_of(&self, index: u32) -> Option<String> {
        std::fs::read_dir(&self.sysfs)
            .ok()?
            .flatten()
            .find(|entry| {
                std::fs::read_to_string(entry.path().join("ifindex"))
                    .ok()
                    .and_then(|s| s.trim().parse::<u32>().ok())
                    == Some(index)
            })
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
    }

    fn bonding_masters(&self, command: &str) -> Result<()> {
        std::fs::write(self.sysfs.join("bonding_masters"), command)?;
        Ok(())
    }

    fn new_link(&self, msg: &mut Message) -> Result<Verdict> {
        if msg.header.nlmsg_flags & NLM_F_CREATE == 0 {
            return Ok(Verdict::Forward);
        }
        let (Some(kind), Some(name)) = (msg.link_kind(), msg.ifname()) else {
            return Ok(Verdict::Forward);
        };
        let name = name.to_string();
        let created = match kind {
            "tuntap" => {
                let dev = TunTap::from_link(msg)?;
                dev.create().map(|()| Helper::Tuntap(dev.mode))
            }
            "openvswitch" => self
                .runner
                .run("ovs-vsctl", &["add-br", &name])
                .map(|()| Helper::Openvswitch),
            "team" => self
                .runner
                .run("teamd", &["-d", "-n", "-t", &name])
                .map(|()| Helper::Team),
            "bond" if self.ancient => self.bonding_masters(&format!("+{name}")).map(|()| Helper::Bond),
            "bridge" if self.ancient => bridge_ioctl(SIOCBRADDBR, &name).map(|()| Helper::Bridge),
            _ => return Ok(Verdict::Forward),
        };
        match created {
            Ok(helper) => {
                debug!(%name, kind = helper.kind(), "created link outside rtnetlink");
                self.state().created.insert(name, helper);
                Ok(ack(msg))
            }
            Err(e) => {
                warn!(%name, kind, error = %e, "link creation failed");
                Ok(Verdict::Error(errno_of(&e)))
            }
        }
    }

    fn del_link(&self, msg: &mut Message) -> Result<Verdict> {
        let name = match msg.ifname() {
            Some(name) => name.to_string(),
            None => match self.name_of(msg.ifindex()) {
                Some(name) => name,
                None => return Ok(Verdict::Forward),
            },
        };
        let Some(helper) = self.state().created.get(&name).copied() else {
            return Ok(Verdict::Forward);
        };
        let deleted = match helper {
            Helper::Tuntap(mode) => TunTap::new(name.clone(), mode).delete(),
            Helper::Openvswitch => self.runner.run("ovs-vsctl", &["del-br", &name]),
            Helper::Team => self.runner.run("teamd", &["-k", "-t", &name]),
            Helper::Bond => self.bonding_masters(&format!("-{name}")),
            Helper::Bridge => bridge_ioctl(SIOCBRDELBR, &name),
        };
        match deleted {
            Ok(()) => {
                debug!(%name, kind = helper.kind(), "deleted link outside rtnetlink");
                let mut state = self.state();
                state.created.remove(&name);
                state.ports.retain(|_, bridge| *bridge != name);
                Ok(ack(msg))
            }
            Err(e) => {
                warn!(%name, error = %e, "link deletion failed");
                Ok(Verdict::Error(errno_of(&e)))
            }
        }
    }

    fn set_link(&self, msg: &mut Message) -> Result<Verdict> {
        let Some(master) = msg.attr_u32("IFLA_MASTER") else {
            return Ok(Verdict::Forward);
        };
        let Some(port) = msg
            .ifname()
            .map(str::to_string)
            .or_else(|| self.name_of(msg.ifindex()))
        else {
            return Ok(Verdict::Forward);
        };

        let result = if master == 0 {
            let Some(bridge) = self.state().ports.get(&port).cloned() else {
                return Ok(Verdict::Forward);
            };
            self.runner
                .run("ovs-vsctl", &["del-port", &bridge, &port])
                .map(|()| {
                    self.state().ports.remove(&port);
                })
        } else {
            let Some(bridge) = self.name_of(master).filter(|name| {
                self.state().created.get(name) == Some(&Helper::Openvswitch)
            }) else {
                return Ok(Verdict::Forward);
            };
            self.runner
                .run("ovs-vsctl", &["add-port", &bridge, &port])
                .map(|()| {
                    self.state().ports.insert(port.clone(), bridge);
                })
        };
        match result {
            Ok(()) => {
                // The rest of the request still goes to the kernel.
                msg.remove_attr("IFLA_MASTER");
                Ok(Verdict::Forward)
            }
            Err(e) => {
                warn!(%port, error = %e, "openvswitch port change failed");
                Ok(Verdict::Error(errno_of(&e)))
            }
        }
    }

    /// Label links the kernel reports without a usable kind.
    fn enrich(&self, msg: &mut Message) {
        let Some(name) = msg.ifname().map(str::to_string) else {
            return;
        };
        let kind = match msg.link_kind() {
            Some("tun") => None,
            Some(_) => return,
            None => self.state().created.get(&name).copied(),
        };
        let helper = match kind {
            Some(helper) => helper,
            None => match tuntap::sysfs_flags(&self.sysfs, &name) {
                Some(flags) => Helper::Tuntap(tuntap::Mode::from_flags(flags)),
                None => return,
            },
        };
        if let Err(e) = set_kind(msg, helper) {
            warn!(%name, error = %e, "could not label link kind");
        }
    }
}

fn set_kind(msg: &mut Message, helper: Helper) -> Result<()> {
    let mut info = vec![Attribute::named(
        &LINKINFO_ATTRS,
        "IFLA_INFO_KIND",
        AttrValue::Str(helper.kind().to_string()),
    )?];
    if let Helper::Tuntap(mode) = helper {
        let data = vec![Attribute::named(
            &TUNTAP_DATA,
            "IFLA_TUN_MODE",
            AttrValue::Str(mode.name().to_string()),
        )?];
        info.push(Attribute::named(
            &LINKINFO_ATTRS,
            "IFLA_INFO_DATA",
            AttrValue::Nested(data),
        )?);
    }
    msg.set_attr("IFLA_LINKINFO", AttrValue::Nested(info))
}

fn bridge_ioctl(request: libc::c_ulong, name: &str) -> Result<()> {
    let name = CString::new(name)
        .map_err(|_| Error::InvalidAttribute(format!("interface name {name:?}")))?;
    // SAFETY: plain socket(2) call; the fd is owned right away.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: fd is a fresh descriptor nobody else owns.
    let sock = unsafe { OwnedFd::from_raw_fd(fd) };
    // SAFETY: SIOCBRADDBR/SIOCBRDELBR read a NUL-terminated name.
    if unsafe { libc::ioctl(sock.as_raw_fd(), request, name.as_ptr()) } < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

impl Proxy {
    /// Proxy with the link handlers, using [`SystemRunner`] and `/sys/class/net`.
    pub fn rtnl(config: &Config) -> Self {
        Self::rtnl_with(config, Arc::new(SystemRunner), SYSFS_NET)
    }

    /// Proxy with the link handlers, running helpers through `runner` and
    /// reading interfaces from `sysfs`.
    pub fn rtnl_with(config: &Config, runner: Arc<dyn Runner>, sysfs: impl AsRef<Path>) -> Self {
        let handlers = Arc::new(Handlers {
            runner,
            sysfs: sysfs.as_ref().to_path_buf(),
            ancient: config.ancient,
            state: Mutex::new(State::default()),
        });
        let mut proxy = Proxy::new().with_debug(config.proxy_debug);

        let h = Arc::clone(&handlers);
        proxy.on_send(NlMsgType::RTM_NEWLINK, move |msg| h.new_link(msg));
        let h = Arc::clone(&handlers);
        proxy.on_send(NlMsgType::RTM_DELLINK, move |msg| h.del_link(msg));
        let h = Arc::clone(&handlers);
        proxy.on_send(NlMsgType::RTM_SETLINK, move |msg| h.set_link(msg));
        let h = handlers;
        proxy.on_recv(NlMsgType::RTM_NEWLINK, move |msg| h.enrich(msg));
        proxy
    }
}

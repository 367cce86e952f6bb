//! Named network namespaces and the namespace worker.
//!
//! Named namespaces are files under [`NETNS_RUN_DIR`] onto which a
//! namespace inode is bind-mounted, the same layout `ip netns` uses.
//!
//! [`NetNs`] runs an rtnetlink socket inside such a namespace. Linux
//! `setns` only switches the calling thread, so the worker is a dedicated
//! OS thread with its own single-threaded runtime: it joins the namespace,
//! opens the socket and then serves two channels:
//!
//! * a command channel (`Send`, `Bind`) answered through oneshot replies;
//! * an event channel that forwards every datagram read from the socket.
//!
//! Sending `None` on the command channel closes the socket and ends the
//! thread. Once that happened every operation returns [`Error::Cancelled`].

use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread::JoinHandle;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::error::{Error, Result};
use super::message::NlMsgHdr;
use super::socket::{NetlinkSocket, Protocol};

/// The runtime directory where named network namespaces are stored.
pub const NETNS_RUN_DIR: &str = "/var/run/netns";

/// Path of a named namespace.
pub fn path(name: &str) -> PathBuf {
    PathBuf::from(NETNS_RUN_DIR).join(name)
}

/// Check whether a named namespace exists.
pub fn exists(name: &str) -> bool {
    path(name).exists()
}

/// List named namespaces.
pub fn list() -> Result<Vec<String>> {
    let dir = match fs::read_dir(NETNS_RUN_DIR) {
        Ok(dir) => dir,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    for entry in dir {
        if let Some(name) = entry?.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Open a named namespace file, e.g. to pass its fd as `IFLA_NET_NS_FD`.
pub fn open(name: &str) -> Result<File> {
    File::open(path(name)).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            Error::NamespaceNotFound {
                name: name.to_string(),
            }
        } else {
            Error::Io(e)
        }
    })
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(Error::InvalidMessage(format!(
            "invalid namespace name: {name:?}"
        )));
    }
    Ok(())
}

/// Create a named namespace.
///
/// A forked child unshares its network namespace and bind-mounts it onto
/// an empty file under [`NETNS_RUN_DIR`].
pub fn create(name: &str) -> Result<()> {
    validate_name(name)?;
    fs::create_dir_all(NETNS_RUN_DIR)?;

    let netns_path = path(name);
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(&netns_path)
        .map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                Error::from_errno(-libc::EEXIST).with_context(format!("creating namespace {name}"))
            } else {
                Error::Io(e)
            }
        })?;

    // Everything the child touches is prepared before fork.
    let source = CString::new("/proc/self/ns/net")
        .map_err(|e| Error::InvalidMessage(e.to_string()))?;
    let target = CString::new(netns_path.as_os_str().as_encoded_bytes())
        .map_err(|e| Error::InvalidMessage(e.to_string()))?;

    // SAFETY: the child only issues raw syscalls and `_exit`s.
    let status = unsafe {
        let pid = libc::fork();
        if pid < 0 {
            let err = io::Error::last_os_error();
            let _ = fs::remove_file(&netns_path);
            return Err(Error::Io(err));
        }
        if pid == 0 {
            if libc::unshare(libc::CLONE_NEWNET) < 0 {
                libc::_exit(1);
            }
            if libc::mount(
                source.as_ptr(),
                target.as_ptr(),
                std::ptr::null(),
                libc::MS_BIND,
                std::ptr::null(),
            ) < 0
            {
                libc::_exit(2);
            }
            libc::_exit(0);
        }

        let mut status: libc::c_int = 0;
        libc::waitpid(pid, &mut status, 0);
        if libc::WIFEXITED(status) {
            libc::WEXITSTATUS(status)
        } else {
            -1
        }
    };

    if status != 0 {
        let _ = fs::remove_file(&netns_path);
        return Err(Error::InvalidMessage(format!(
            "failed to create network namespace {name} (exit code {status})"
        )));
    }

    info!(namespace = name, "created network namespace");
    Ok(())
}

/// Remove a named namespace: detach the bind mount and unlink the file.
pub fn remove(name: &str) -> Result<()> {
    validate_name(name)?;
    let netns_path = path(name);
    if !netns_path.exists() {
        return Err(Error::NamespaceNotFound {
            name: name.to_string(),
        });
    }

    let target = CString::new(netns_path.as_os_str().as_encoded_bytes())
        .map_err(|e| Error::InvalidMessage(e.to_string()))?;
    // SAFETY: target is a valid NUL-terminated path.
    unsafe {
        libc::umount2(target.as_ptr(), libc::MNT_DETACH);
    }
    fs::remove_file(&netns_path)?;

    info!(namespace = name, "removed network namespace");
    Ok(())
}

/// How [`NetNs::open`] treats the namespace file.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetNsFlags {
    /// Create the namespace when it does not exist.
    pub create: bool,
    /// With `create`, fail if the namespace already exists.
    pub exclusive: bool,
}

impl NetNsFlags {
    pub fn create() -> Self {
        Self {
            create: true,
            exclusive: false,
        }
    }
}

enum Command {
    Send(Vec<u8>, oneshot::Sender<Result<()>>),
    Bind(u64, oneshot::Sender<Result<()>>),
}

/// Handle to a namespace worker.
pub struct NetNs {
    name: String,
    pid: u32,
    commands: Mutex<Option<mpsc::UnboundedSender<Option<Command>>>>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for NetNs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetNs")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .finish()
    }
}

impl NetNs {
    /// Start a worker inside the named namespace.
    pub async fn open(name: &str, flags: NetNsFlags) -> Result<Self> {
        validate_name(name)?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let worker_name = name.to_string();
        let thread = std::thread::Builder::new()
            .name(format!("netns-{name}"))
            .spawn(move || worker_main(worker_name, flags, cmd_rx, ev_tx, ready_tx))?;

        let pid = match ready_rx.await {
            Ok(Ok(pid)) => pid,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => return Err(Error::Cancelled),
        };

        debug!(namespace = name, pid, "namespace worker ready");
        Ok(Self {
            name: name.to_string(),
            pid,
            commands: Mutex::new(Some(cmd_tx)),
            events: tokio::sync::Mutex::new(ev_rx),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Namespace name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Port id of the socket inside the namespace.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    async fn command(&self, make: impl FnOnce(oneshot::Sender<Result<()>>) -> Command) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        {
            let commands = self.commands.lock().unwrap_or_else(|e| e.into_inner());
            let sender = commands.as_ref().ok_or(Error::Cancelled)?;
            sender
                .send(Some(make(tx)))
                .map_err(|_| Error::Cancelled)?;
        }
        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Send a raw message through the worker socket.
    pub async fn send(&self, data: Vec<u8>) -> Result<()> {
        self.command(|tx| Command::Send(data, tx)).await
    }

    /// Subscribe the worker socket to multicast groups.
    pub async fn bind(&self, groups: u64) -> Result<()> {
        self.command(|tx| Command::Bind(groups, tx)).await
    }

    /// Next datagram forwarded by the worker.
    pub async fn recv(&self) -> Result<Vec<u8>> {
        self.events.lock().await.recv().await.ok_or(Error::Cancelled)
    }

    /// Ask the worker to close its socket and exit.
    pub fn close(&self) {
        let sender = self
            .commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(None);
        }
    }

    /// Whether the worker thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_none_or(|t| t.is_finished())
    }
}

impl Drop for NetNs {
    fn drop(&mut self) {
        self.close();
        let thread = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(thread) = thread else { return };
        let name = std::mem::take(&mut self.name);
        let join = move || {
            if thread.join().is_err() {
                warn!(namespace = %name, "namespace worker panicked");
            }
        };
        // The worker may still be closing its socket; keep async workers free.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(join);
            }
            Err(_) => join(),
        }
    }
}

fn enter(name: &str, flags: NetNsFlags) -> Result<()> {
    if flags.create {
        match create(name) {
            Ok(()) => {}
            Err(e) if e.is_already_exists() && !flags.exclusive => {}
            Err(e) => return Err(e),
        }
    }
    let file = open(name)?;
    // SAFETY: setns on a namespace fd only affects the calling thread.
    let ret = unsafe { libc::setns(file.as_raw_fd(), libc::CLONE_NEWNET) };
    if ret < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(())
}

fn worker_main(
    name: String,
    flags: NetNsFlags,
    mut commands: mpsc::UnboundedReceiver<Option<Command>>,
    events: mpsc::UnboundedSender<Vec<u8>>,
    ready: oneshot::Sender<Result<u32>>,
) {
    let runtime = enter(&name, flags).and_then(|()| {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::from)
    });
    let runtime = match runtime {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    runtime.block_on(async move {
        let socket = match NetlinkSocket::new(Protocol::Route) {
            Ok(socket) => socket,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        let pid = socket.pid();
        if ready.send(Ok(pid)).is_err() {
            return;
        }

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Some(Command::Send(mut data, reply))) => {
                        stamp_pid(&mut data, pid);
                        let _ = reply.send(socket.send(&data).await);
                    }
                    Some(Some(Command::Bind(groups, reply))) => {
                        let _ = reply.send(socket.add_groups(groups));
                    }
                    Some(None) | None => break,
                },
                data = socket.recv_msg() => match data {
                    Ok(data) => {
                        if events.send(data).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(namespace = %name, error = %e, "namespace worker read failed"),
                },
            }
        }
        debug!(namespace = %name, "namespace worker exiting");
    });
}

fn stamp_pid(data: &mut [u8], pid: u32) {
    if data.len() >= std::mem::size_of::<NlMsgHdr>() {
        data[12..16].copy_from_slice(&pid.to_ne_bytes());
    }
}

/// Check whether a path names an existing namespace file.
pub fn is_namespace_file(p: &Path) -> bool {
    p.starts_with(NETNS_RUN_DIR) && p.is_file()
}

//! PTY allocation, shell spawning, and terminal resize.
//!
//! Uses the `nix` crate for `openpty`. The slave is handed to the child and
//! must be dropped by the caller once the child is running, or reads on the
//! master never see EOF. The master is switched to non-blocking mode and
//! driven through the runtime's reactor ([`PtyMaster`]), so a pending read
//! can be abandoned and the fd closed while other processes still hold the
//! slave.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::{openpty, OpenptyResult, Winsize};
use tokio::io::unix::AsyncFd;
use tokio::process::{Child, Command};

/// Shells tried in order when no override is configured.
const SHELLS: [&str; 3] = ["/bin/zsh", "/bin/bash", "/bin/sh"];

pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

fn winsize(rows: u16, cols: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

pub fn allocate_pty(rows: u16, cols: u16) -> Result<PtyPair, nix::Error> {
    let OpenptyResult { master, slave } = openpty(&winsize(rows, cols), None)?;
    Ok(PtyPair { master, slave })
}

/// First of zsh, bash, sh present on this host, else a bare `sh` for `PATH`
/// lookup.
pub fn preferred_shell() -> String {
    SHELLS
        .iter()
        .find(|candidate| {
            !matches!(
                std::fs::metadata(candidate),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound
            )
        })
        .map_or_else(|| "sh".to_string(), |s| (*s).to_string())
}

/// Spawn `shell` as a session leader whose controlling terminal is the PTY
/// slave.
pub fn spawn_on_pty(pty: &PtyPair, shell: &str) -> std::io::Result<Child> {
    let slave_fd = pty.slave.as_raw_fd();
    let mut cmd = Command::new(shell);
    cmd.env("TERM", "xterm-256color").kill_on_drop(true);
    // stdio is wired to the slave in pre_exec.
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // SAFETY: only async-signal-safe calls between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            libc::dup2(slave_fd, 0);
            libc::dup2(slave_fd, 1);
            libc::dup2(slave_fd, 2);
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            Ok(())
        });
    }

    cmd.spawn()
}

/// Non-blocking PTY master registered with the reactor. Shared between the
/// output pump, the input writer and resize; the fd closes with the last
/// reference.
pub struct PtyMaster {
    fd: AsyncFd<File>,
}

impl PtyMaster {
    pub fn new(master: OwnedFd) -> io::Result<Self> {
        let raw = master.as_raw_fd();
        let flags = fcntl(raw, FcntlArg::F_GETFL)?;
        let mut oflags = OFlag::from_bits_truncate(flags);
        oflags.insert(OFlag::O_NONBLOCK);
        fcntl(raw, FcntlArg::F_SETFL(oflags))?;
        Ok(Self {
            fd: AsyncFd::new(File::from(master))?,
        })
    }

    /// Read available output. Fails with EIO once every slave fd is closed.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.read(buf)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.write(data)
            }) {
                Ok(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(Ok(n)) => data = &data[n..],
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), nix::Error> {
        resize_pty(self.fd.get_ref(), rows, cols)
    }
}

pub fn resize_pty(master: &impl AsRawFd, rows: u16, cols: u16) -> Result<(), nix::Error> {
    let size = winsize(rows, cols);
    // SAFETY: TIOCSWINSZ reads a Winsize struct that outlives the call.
    let ret = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ, std::ptr::addr_of!(size)) };
    if ret == -1 {
        Err(nix::Error::last())
    } else {
        Ok(())
    }
}

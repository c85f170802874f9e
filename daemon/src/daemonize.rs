//! Background daemonization: double fork, detach from the controlling
//! terminal, redirect the standard file descriptors to `/dev/null`.
//!
//! Must run after logging is initialized (so the log file descriptor
//! stays open across the fork) and before the event loop starts any
//! watcher or signal threads (fork does not carry threads over).

use std::fs::OpenOptions;
use std::os::unix::io::IntoRawFd;

use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd::{self, ForkResult};

pub fn daemonize() -> anyhow::Result<()> {
    fork_and_exit_parent()?;
    unistd::setsid()?;

    unsafe {
        signal::signal(Signal::SIGHUP, SigHandler::SigIgn)?;
        signal::signal(Signal::SIGCHLD, SigHandler::SigIgn)?;
    }

    fork_and_exit_parent()?;
    unistd::umask(nix::sys::stat::Mode::empty());

    redirect_standard_fds()?;
    Ok(())
}

fn fork_and_exit_parent() -> anyhow::Result<()> {
    match unsafe { unistd::fork()? } {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => Ok(()),
    }
}

fn redirect_standard_fds() -> anyhow::Result<()> {
    let devnull = OpenOptions::new().read(true).write(true).open("/dev/null")?;
    let fd = devnull.into_raw_fd();

    unistd::dup2(fd, 0)?;
    unistd::dup2(fd, 1)?;
    unistd::dup2(fd, 2)?;

    if fd > 2 {
        let _ = unistd::close(fd);
    }

    Ok(())
}

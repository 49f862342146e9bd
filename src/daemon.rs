//! Process lifecycle: pid file, daemonization, and privilege drop.
//!
//! `daemonize`, `user`, and `pid_file` are external-collaborator concerns
//! the core doesn't own, but a runnable binary still needs real behavior
//! behind those flags. Ground truth is `original_source/src/main.cpp`'s
//! overall startup shape (parse args,
//! apply process-level setup, then enter the main loop) generalized with
//! the fork/detach/privilege-drop steps a production daemon actually takes.
//!
//! `daemonize()` must run before the Tokio runtime is built — forking a
//! process that already has a multi-threaded Tokio runtime running is
//! unsound, since only the forking thread survives into the child. This is
//! why `bin/yardmaster.rs` uses a plain `fn main()` instead of
//! `#[tokio::main]`.

use nix::unistd::{self, ForkResult};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// Fork, detach from the controlling terminal, and chdir to `/` — the
/// classic double-step every Unix daemon takes. The parent process exits
/// immediately; only the child returns from this function.
pub fn daemonize() -> std::io::Result<()> {
    match unsafe { unistd::fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => return Err(std::io::Error::from_raw_os_error(e as i32)),
    }

    unistd::setsid().map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    unistd::chdir("/").map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;

    redirect_stdio_to_null()?;
    Ok(())
}

fn redirect_stdio_to_null() -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let devnull = OpenOptions::new().read(true).write(true).open("/dev/null")?;
    let fd = devnull.as_raw_fd();
    for target in [0, 1, 2] {
        unistd::dup2(fd, target).map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    }
    Ok(())
}

/// Write the current process id to `path`, truncating any existing file.
pub fn write_pid_file(path: &Path) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(path)?;
    writeln!(file, "{}", std::process::id())
}

/// Drop privileges to `username`'s uid/gid. Requires the process to
/// currently be running as root. `getpwnam_r` has no safe wrapper in the
/// dependency stack (nix's `User::from_name` does wrap it, so this uses
/// that instead of raw `libc` — kept here rather than duplicating nix's own
/// FFI call).
pub fn drop_privileges(username: &str) -> std::io::Result<()> {
    let user = nix::unistd::User::from_name(username)
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, format!("no such user: {username}")))?;

    unistd::setgid(user.gid).map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    unistd::setuid(user.uid).map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    Ok(())
}

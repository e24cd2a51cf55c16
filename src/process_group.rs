//! Kill-on-parent-exit binding for backend processes
//!
//! A backend must never outlive the multiplexer that started it, including
//! when the multiplexer is killed without warning. Each platform provides one
//! [`ProcessGroup`] implementation, chosen at build time as [`PlatformGroup`]:
//!
//! - Unix: every backend leads its own process group, so descendants are
//!   killed together. A guardian forked into that group holds the read end of
//!   a pipe whose only writer is this process; when we die, by any means, the
//!   pipe reports EOF and the guardian kills the whole group. On Linux the
//!   direct child additionally gets `PR_SET_PDEATHSIG(SIGKILL)`.
//! - Windows: a job object with `JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE`; the OS
//!   closes the job handle when this process dies and kills every member.

use tokio::process::{Child, Command};

/// Platform capability binding a child's lifetime to this process
pub trait ProcessGroup: Send {
    /// Configure `command` before it is spawned
    fn prepare(&mut self, command: &mut Command);

    /// Bind a freshly spawned child
    fn adopt(&mut self, child: &Child) -> std::io::Result<()>;

    /// Pass a user interrupt on to a child that the terminal does not reach
    fn interrupt(&self);

    /// Record that the child itself was reaped
    fn child_exited(&mut self);

    /// Force-kill the child and its group
    fn terminate(&mut self);
}

/// Group for a child that owns the terminal (interactive) or runs unattended.
///
/// An interactive child started from the terminal's foreground becomes the
/// foreground group itself, so it reads the terminal and receives Ctrl+C
/// directly. The terminal comes back to us once the child exits.
pub fn kill_on_exit_group(interactive: bool) -> PlatformGroup {
    PlatformGroup::new(interactive)
}

/// Configure `command` to run detached from this process and its terminal.
///
/// A detached child is not bound to any group: it is meant to outlive us.
pub fn detach(command: &mut Command) {
    platform_detach(command);
}

#[cfg(unix)]
pub use self::posix::PosixGroup as PlatformGroup;
#[cfg(unix)]
use self::posix::detach as platform_detach;

#[cfg(windows)]
pub use self::job_object::JobGroup as PlatformGroup;
#[cfg(windows)]
use self::job_object::detach as platform_detach;

#[cfg(unix)]
mod posix {
    use super::ProcessGroup;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use tokio::process::{Child, Command};
    use tracing::{debug, warn};

    /// Bounds for the descriptor range the guardian closes before it waits
    const GUARDIAN_FD_FLOOR: libc::c_int = 1024;
    const GUARDIAN_FD_CEILING: libc::c_int = 65536;

    pub fn detach(command: &mut Command) {
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    /// Close-on-exec pipe as `(read, write)`
    #[cfg(target_os = "linux")]
    fn lifeline() -> std::io::Result<(OwnedFd, OwnedFd)> {
        let mut fds = [0 as libc::c_int; 2];
        unsafe {
            if libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])))
        }
    }

    /// Close-on-exec pipe as `(read, write)`
    #[cfg(not(target_os = "linux"))]
    fn lifeline() -> std::io::Result<(OwnedFd, OwnedFd)> {
        let mut fds = [0 as libc::c_int; 2];
        unsafe {
            if libc::pipe(fds.as_mut_ptr()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            let ends = (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]));
            for fd in fds {
                if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(ends)
        }
    }

    /// Whether this process is the foreground group of the terminal on stdin
    fn owns_terminal() -> bool {
        unsafe {
            libc::isatty(libc::STDIN_FILENO) == 1
                && libc::tcgetpgrp(libc::STDIN_FILENO) == libc::getpgrp()
        }
    }

    /// Descriptors below this are closed in the guardian
    fn guardian_fd_limit() -> libc::c_int {
        let open_max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
        libc::c_int::try_from(open_max)
            .unwrap_or(GUARDIAN_FD_CEILING)
            .clamp(GUARDIAN_FD_FLOOR, GUARDIAN_FD_CEILING)
    }

    /// Make `pgid` the terminal's foreground group, even from the background
    unsafe fn set_foreground(pgid: libc::pid_t) {
        let previous = libc::signal(libc::SIGTTOU, libc::SIG_IGN);
        libc::tcsetpgrp(libc::STDIN_FILENO, pgid);
        libc::signal(libc::SIGTTOU, previous);
    }

    /// Guardian body, run in a fork inside the backend's group.
    ///
    /// Blocks until the last write end of the lifeline closes, then kills the
    /// group, itself included. Every other descriptor is closed first, since
    /// holding the spawn's exec-status pipe would stall the parent. Only
    /// async-signal-safe calls are allowed here.
    unsafe fn guard_group(group: libc::pid_t, read_fd: libc::c_int, fd_limit: libc::c_int) -> ! {
        for fd in 0..fd_limit {
            if fd != read_fd {
                libc::close(fd);
            }
        }
        libc::signal(libc::SIGINT, libc::SIG_IGN);
        libc::signal(libc::SIGQUIT, libc::SIG_IGN);

        let mut byte = 0u8;
        loop {
            let read = libc::read(read_fd, &mut byte as *mut u8 as *mut libc::c_void, 1);
            if read < 0 && std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            break;
        }

        libc::killpg(group, libc::SIGKILL);
        libc::_exit(0)
    }

    pub struct PosixGroup {
        interactive: bool,
        pgid: Option<libc::pid_t>,
        /// The backend group is the terminal's foreground group
        holds_terminal: bool,
        /// Write end; closing it (or dying) releases the guardian
        lifeline: Option<OwnedFd>,
        /// Read end, only needed until the child has forked its guardian
        guardian_end: Option<OwnedFd>,
    }

    impl PosixGroup {
        pub fn new(interactive: bool) -> Self {
            Self {
                interactive,
                pgid: None,
                holds_terminal: false,
                lifeline: None,
                guardian_end: None,
            }
        }

        fn reclaim_terminal(&mut self) {
            if std::mem::take(&mut self.holds_terminal) {
                unsafe { set_foreground(libc::getpgrp()) };
                debug!("Terminal returned from backend");
            }
        }

        #[cfg(test)]
        fn abandon(&mut self) {
            self.pgid = None;
            self.lifeline = None;
        }
    }

    impl ProcessGroup for PosixGroup {
        fn prepare(&mut self, command: &mut Command) {
            self.holds_terminal = self.interactive && owns_terminal();
            let take_terminal = self.holds_terminal;

            let guardian_fd = match lifeline() {
                Ok((read, write)) => {
                    let fd = read.as_raw_fd();
                    self.guardian_end = Some(read);
                    self.lifeline = Some(write);
                    Some(fd)
                }
                Err(e) => {
                    warn!(error = %e, "Could not create the backend guardian pipe");
                    None
                }
            };

            let fd_limit = guardian_fd_limit();
            #[cfg(target_os = "linux")]
            let parent = std::process::id() as libc::pid_t;

            // Runs in the forked child before exec: only async-signal-safe calls
            unsafe {
                command.pre_exec(move || {
                    if libc::setpgid(0, 0) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    let group = libc::getpgrp();

                    if let Some(read_fd) = guardian_fd {
                        match libc::fork() {
                            -1 => return Err(std::io::Error::last_os_error()),
                            0 => guard_group(group, read_fd, fd_limit),
                            _ => {}
                        }
                    }

                    if take_terminal {
                        set_foreground(group);
                    }

                    #[cfg(target_os = "linux")]
                    {
                        if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                            return Err(std::io::Error::last_os_error());
                        }
                        // The parent may have died before prctl took effect
                        if libc::getppid() != parent {
                            libc::_exit(1);
                        }
                    }
                    Ok(())
                });
            }
        }

        fn adopt(&mut self, child: &Child) -> std::io::Result<()> {
            self.pgid = child.id().map(|id| id as libc::pid_t);
            self.guardian_end = None;
            debug!(
                pgid = ?self.pgid,
                guarded = self.lifeline.is_some(),
                terminal = self.holds_terminal,
                "Backend bound to process group"
            );
            Ok(())
        }

        fn interrupt(&self) {
            // The foreground group already got the terminal's SIGINT
            if self.holds_terminal {
                return;
            }
            if let Some(pgid) = self.pgid {
                unsafe {
                    libc::killpg(pgid, libc::SIGINT);
                }
            }
        }

        fn child_exited(&mut self) {
            // The group lives on while descendants or the guardian remain
            self.reclaim_terminal();
        }

        fn terminate(&mut self) {
            if let Some(pgid) = self.pgid.take() {
                if unsafe { libc::killpg(pgid, libc::SIGKILL) } == 0 {
                    debug!(pgid, "Backend process group killed");
                }
            }
            self.reclaim_terminal();
            self.lifeline = None;
            self.guardian_end = None;
        }
    }

    impl Drop for PosixGroup {
        fn drop(&mut self) {
            self.terminate();
        }
    }

}

#[cfg(windows)]
mod job_object {
    use super::ProcessGroup;
    use std::ffi::c_void;
    use tokio::process::{Child, Command};
    use tracing::{debug, warn};
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{CloseHandle, HANDLE};
    use windows::Win32::System::JobObjects::{
        AssignProcessToJobObject, CreateJobObjectW, JobObjectExtendedLimitInformation,
        SetInformationJobObject, TerminateJobObject, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
        JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
    };

    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

    pub fn detach(command: &mut Command) {
        command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
    }

    pub struct JobGroup {
        job: Option<HANDLE>,
    }

    // The job handle is only touched through &mut self
    unsafe impl Send for JobGroup {}

    impl JobGroup {
        pub fn new(_interactive: bool) -> Self {
            Self { job: None }
        }

        fn create_job() -> std::io::Result<HANDLE> {
            unsafe {
                let job = CreateJobObjectW(None, PCWSTR::null()).map_err(std::io::Error::from)?;

                let mut info = JOBOBJECT_EXTENDED_LIMIT_INFORMATION::default();
                info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;

                if let Err(e) = SetInformationJobObject(
                    job,
                    JobObjectExtendedLimitInformation,
                    &info as *const _ as *const c_void,
                    std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
                ) {
                    let _ = CloseHandle(job);
                    return Err(std::io::Error::from(e));
                }

                Ok(job)
            }
        }
    }

    impl ProcessGroup for JobGroup {
        fn prepare(&mut self, _command: &mut Command) {}

        // Console children receive Ctrl+C alongside us
        fn interrupt(&self) {}

        // Closing the job still reaches any descendants
        fn child_exited(&mut self) {}

        fn adopt(&mut self, child: &Child) -> std::io::Result<()> {
            let raw = child.raw_handle().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Other, "child has already exited")
            })?;

            let job = Self::create_job()?;
            unsafe {
                if let Err(e) = AssignProcessToJobObject(job, HANDLE(raw as *mut c_void)) {
                    let _ = CloseHandle(job);
                    return Err(std::io::Error::from(e));
                }
            }

            debug!(pid = ?child.id(), "Backend assigned to kill-on-close job object");
            self.job = Some(job);
            Ok(())
        }

        fn terminate(&mut self) {
            if let Some(job) = self.job.take() {
                unsafe {
                    if let Err(e) = TerminateJobObject(job, 1) {
                        warn!(error = %e, "Failed to terminate job object");
                    }
                    let _ = CloseHandle(job);
                }
            }
        }
    }

    impl Drop for JobGroup {
        fn drop(&mut self) {
            self.terminate();
        }
    }
}

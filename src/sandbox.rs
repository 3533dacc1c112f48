//! Core sandbox execution logic.
//!
//! Every sandboxed process runs inside a fresh working directory under the
//! workspace root, started through an OS-level wrapper (nsjail or
//! bubblewrap) that removes network access and applies resource limits. The
//! directory is a [`TempDir`], so it is removed on every exit path.

use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;
use tempfile::TempDir;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Mount point of the working directory inside the sandbox.
const SANDBOX_DIR: &str = "/sandbox";

const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Host directories exposed read-only to sandboxed processes.
const RO_BINDS: [&str; 5] = ["/bin", "/lib", "/lib64", "/usr", "/etc"];

/// Syscalls permitted under nsjail; anything else kills the process.
const SECCOMP_ALLOW: &[&str] = &[
    "read", "write", "readv", "writev", "pread64", "pwrite64", "open", "openat", "close",
    "stat", "fstat", "lstat", "newfstatat", "statx", "poll", "ppoll", "lseek", "mmap",
    "mprotect", "munmap", "mremap", "madvise", "brk", "rt_sigaction", "rt_sigprocmask",
    "rt_sigreturn", "sigaltstack", "ioctl", "access", "faccessat", "faccessat2", "pipe",
    "pipe2", "select", "pselect6", "sched_yield", "dup", "dup2", "dup3", "nanosleep",
    "clock_nanosleep", "getpid", "getppid", "getpgrp", "getpgid", "setpgid", "getsid",
    "clone", "clone3", "fork", "vfork", "execve", "exit", "exit_group", "wait4", "waitid",
    "kill", "tgkill", "uname", "fcntl", "flock", "fsync", "fdatasync", "truncate",
    "ftruncate", "getdents", "getdents64", "getcwd", "chdir", "fchdir", "rename",
    "renameat", "renameat2", "mkdir", "mkdirat", "rmdir", "unlink", "unlinkat",
    "readlink", "readlinkat", "chmod", "fchmod", "fchmodat", "umask", "gettimeofday",
    "clock_gettime", "clock_getres", "getrlimit", "prlimit64", "getrusage", "sysinfo",
    "getuid", "geteuid", "getgid", "getegid", "getgroups", "getresuid", "getresgid",
    "arch_prctl", "prctl", "set_tid_address", "set_robust_list", "get_robust_list",
    "futex", "sched_getaffinity", "epoll_create1", "epoll_ctl", "epoll_wait",
    "epoll_pwait", "eventfd2", "getrandom", "rseq", "time", "tkill", "sendfile",
    "copy_file_range", "fadvise64", "utimensat", "membarrier", "rt_sigsuspend",
    "rt_sigtimedwait", "rt_sigqueueinfo", "pause", "alarm", "setitimer", "getitimer",
    "close_range", "getxattr", "lgetxattr", "fgetxattr", "listxattr", "llistxattr",
    "flistxattr", "symlink", "symlinkat", "link", "linkat", "chown", "fchown", "lchown",
    "fchownat", "utime", "utimes", "futimesat", "statfs", "fstatfs", "getpriority",
    "setpriority", "sched_getparam", "sched_getscheduler", "times", "mincore", "msync",
    "pidfd_open", "pidfd_send_signal", "memfd_create", "timerfd_create", "timerfd_settime",
    "timerfd_gettime", "signalfd4", "inotify_init1", "inotify_add_watch", "inotify_rm_watch",
    "epoll_pwait2", "creat", "setsid", "setresuid", "setresgid",
];

/// Extra syscalls for rooms with network access.
const SECCOMP_ALLOW_NET: &[&str] = &[
    "socket", "socketpair", "connect", "bind", "listen", "accept", "accept4", "sendto",
    "recvfrom", "sendmsg", "recvmsg", "sendmmsg", "recvmmsg", "getsockopt", "setsockopt",
    "getsockname", "getpeername", "shutdown",
];

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("failed to prepare sandbox directory: {0}")]
    Workdir(#[source] io::Error),
    #[error("failed to launch sandbox: {0}")]
    Launch(#[source] io::Error),
    #[error("sandbox process error: {0}")]
    Process(#[source] io::Error),
}

/// Which OS-level wrapper confines the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapperKind {
    Nsjail,
    /// Namespaces and mounts only; bubblewrap applies no syscall filter.
    Bwrap,
    /// No wrapper: rlimits and CPU pinning only. Development and tests.
    None,
}

impl WrapperKind {
    /// Whether the wrapper restricts syscalls to an allow-list.
    pub fn filters_syscalls(self) -> bool {
        matches!(self, Self::Nsjail)
    }
}

impl FromStr for WrapperKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nsjail" => Ok(Self::Nsjail),
            "bwrap" => Ok(Self::Bwrap),
            "none" => Ok(Self::None),
            other => Err(format!("unknown sandbox wrapper `{other}` (nsjail, bwrap, none)")),
        }
    }
}

impl fmt::Display for WrapperKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nsjail => f.write_str("nsjail"),
            Self::Bwrap => f.write_str("bwrap"),
            Self::None => f.write_str("none"),
        }
    }
}

/// Limits applied to one sandboxed process.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpus: u32,
    pub nofile: u64,
    pub network: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 128,
            cpus: 1,
            nofile: 64,
            network: false,
        }
    }
}

/// Launcher configuration.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub wrapper: WrapperKind,
    /// Override for the wrapper binary, otherwise looked up on `PATH`.
    pub wrapper_path: Option<PathBuf>,
    pub workspace_root: PathBuf,
    pub limits: ResourceLimits,
    pub exec_timeout: Duration,
    /// The single language accepted by the one-shot path.
    pub language: String,
    pub interpreter: PathBuf,
    pub source_file: String,
    pub shell: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            wrapper: WrapperKind::Nsjail,
            wrapper_path: None,
            workspace_root: std::env::temp_dir().join("roomsandbox"),
            limits: ResourceLimits::default(),
            exec_timeout: Duration::from_secs(5),
            language: "python".to_string(),
            interpreter: PathBuf::from("python3"),
            source_file: "main.py".to_string(),
            shell: PathBuf::from("/bin/sh"),
        }
    }
}

pub enum LaunchKind<'a> {
    /// Run a source file once; stdin is closed.
    Script { payload: &'a str },
    /// Long-lived shell reading commands from stdin.
    Shell,
}

/// A running sandboxed process and the directory it owns.
pub struct SandboxProcess {
    pub child: Child,
    pub workdir: TempDir,
}

/// Raw result of a one-shot run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

/// What the one-shot endpoint reports. The submitted code is echoed back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunOutcome {
    Success { output: String, code: String },
    Failure { error: String, code: String },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

pub struct SandboxLauncher {
    config: SandboxConfig,
}

impl SandboxLauncher {
    pub fn new(config: SandboxConfig) -> Self {
        match config.wrapper {
            WrapperKind::None => {
                warn!("sandbox wrapper disabled; processes run without namespace isolation")
            }
            wrapper if !wrapper.filters_syscalls() => warn!(
                %wrapper,
                "sandbox wrapper applies no syscall filter; use nsjail outside development"
            ),
            _ => {}
        }
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Start one sandboxed process in a fresh working directory.
    pub fn launch(
        &self,
        kind: LaunchKind<'_>,
        limits: &ResourceLimits,
    ) -> Result<SandboxProcess, SandboxError> {
        std::fs::create_dir_all(&self.config.workspace_root).map_err(SandboxError::Workdir)?;
        let prefix = match kind {
            LaunchKind::Script { .. } => "run-",
            LaunchKind::Shell => "room-",
        };
        let workdir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&self.config.workspace_root)
            .map_err(SandboxError::Workdir)?;

        let inner_dir = match self.config.wrapper {
            WrapperKind::None => workdir.path().to_path_buf(),
            _ => PathBuf::from(SANDBOX_DIR),
        };
        let (target, args, time_limit, stdin) = match kind {
            LaunchKind::Script { payload } => {
                let source = workdir.path().join(&self.config.source_file);
                std::fs::write(&source, payload).map_err(SandboxError::Workdir)?;
                let arg = inner_dir.join(&self.config.source_file);
                (
                    self.config.interpreter.clone(),
                    vec![arg.to_string_lossy().into_owned()],
                    Some(self.config.exec_timeout),
                    Stdio::null(),
                )
            }
            LaunchKind::Shell => (self.config.shell.clone(), Vec::new(), None, Stdio::piped()),
        };

        let argv = wrapper_argv(
            self.config.wrapper,
            workdir.path(),
            &target,
            &args,
            limits,
            time_limit,
        );
        let program = match self.config.wrapper {
            WrapperKind::None => target.clone(),
            WrapperKind::Nsjail => self
                .config
                .wrapper_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("nsjail")),
            WrapperKind::Bwrap => self
                .config
                .wrapper_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("bwrap")),
        };

        let mut cmd = Command::new(&program);
        cmd.args(&argv)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", &inner_dir)
            .env("LANG", "C.UTF-8")
            .env("PYTHONUNBUFFERED", "1")
            .current_dir(workdir.path())
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if self.config.wrapper != WrapperKind::Nsjail {
            apply_limits_on_exec(&mut cmd, limits);
        }

        info!(
            wrapper = %self.config.wrapper,
            program = ?target,
            workdir = ?workdir.path(),
            memory_mb = limits.memory_mb,
            cpus = limits.cpus,
            network = limits.network,
            "launching sandboxed process"
        );
        let child = cmd.spawn().map_err(SandboxError::Launch)?;
        info!(pid = ?child.id(), "sandboxed process started");
        Ok(SandboxProcess { child, workdir })
    }

    /// Run `code` once under the configured limits and wall-clock timeout.
    pub async fn run_oneshot(&self, code: &str, language: &str) -> Result<RunOutcome, SandboxError> {
        if language != self.config.language {
            return Err(SandboxError::UnsupportedLanguage(language.to_string()));
        }
        let SandboxProcess { child, workdir } =
            self.launch(LaunchKind::Script { payload: code }, &self.config.limits)?;
        let pid = child.id();

        let waited = tokio::time::timeout(self.config.exec_timeout, child.wait_with_output()).await;
        let outcome = match waited {
            Ok(Ok(output)) => {
                let result = RunResult {
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    exit_code: output.status.code(),
                    signal: std::os::unix::process::ExitStatusExt::signal(&output.status),
                };
                info!(exit_code = ?result.exit_code, signal = ?result.signal, "one-shot run finished");
                Ok(outcome_from_result(result, code))
            }
            Ok(Err(e)) => Err(SandboxError::Process(e)),
            Err(_) => {
                if let Some(pid) = pid {
                    signal_group(pid, Signal::SIGKILL);
                }
                warn!(timeout_secs = self.config.exec_timeout.as_secs_f64(), "one-shot run timed out");
                Ok(RunOutcome::Failure {
                    error: format!(
                        "Execution timed out after {}s",
                        self.config.exec_timeout.as_secs_f64()
                    ),
                    code: code.to_string(),
                })
            }
        };
        cleanup_workdir(workdir);
        outcome
    }
}

fn outcome_from_result(result: RunResult, code: &str) -> RunOutcome {
    if result.exit_code == Some(0) {
        return RunOutcome::Success {
            output: result.stdout,
            code: code.to_string(),
        };
    }
    let error = if !result.stderr.is_empty() {
        result.stderr
    } else if let Some(sig) = result.signal {
        format!("Process terminated by signal {sig}")
    } else {
        format!("Process exited with status {}", result.exit_code.unwrap_or(-1))
    };
    RunOutcome::Failure {
        error,
        code: code.to_string(),
    }
}

/// Remove a working directory, logging instead of failing.
pub fn cleanup_workdir(workdir: TempDir) {
    let path = workdir.path().to_path_buf();
    if let Err(e) = workdir.close() {
        warn!(path = ?path, error = %e, "failed to remove sandbox directory");
    }
}

/// Signal every process in the group led by `pid`.
pub fn signal_group(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!(pid, ?signal, error = %e, "failed to signal process group"),
    }
}

/// Arguments passed to the wrapper binary (or to the target itself when no
/// wrapper is configured).
pub fn wrapper_argv(
    wrapper: WrapperKind,
    workdir: &Path,
    program: &Path,
    args: &[String],
    limits: &ResourceLimits,
    time_limit: Option<Duration>,
) -> Vec<String> {
    let program = program.to_string_lossy().into_owned();
    let mut argv: Vec<String> = Vec::new();
    match wrapper {
        WrapperKind::None => {
            argv.extend(args.iter().cloned());
            return argv;
        }
        WrapperKind::Nsjail => {
            argv.extend(["--mode", "o", "--quiet"].map(String::from));
            for dir in RO_BINDS {
                if Path::new(dir).exists() {
                    argv.push("--bindmount_ro".into());
                    argv.push(dir.into());
                }
            }
            argv.push("--bindmount".into());
            argv.push(format!("{}:{SANDBOX_DIR}", workdir.display()));
            argv.extend(["--tmpfsmount", "/tmp", "--cwd", SANDBOX_DIR].map(String::from));
            argv.extend(["--user", "65534", "--group", "65534"].map(String::from));
            argv.push("--rlimit_as".into());
            argv.push(limits.memory_mb.to_string());
            argv.extend(["--rlimit_core", "0"].map(String::from));
            argv.push("--rlimit_nofile".into());
            argv.push(limits.nofile.to_string());
            argv.push("--max_cpus".into());
            argv.push(limits.cpus.to_string());
            argv.push("--time_limit".into());
            argv.push(time_limit.map_or(0, |t| t.as_secs().max(1)).to_string());
            argv.push("--seccomp_string".into());
            argv.push(seccomp_policy(limits.network));
            if limits.network {
                argv.push("--disable_clone_newnet".into());
            }
            for (key, value) in [("PATH", SANDBOX_PATH), ("HOME", SANDBOX_DIR), ("LANG", "C.UTF-8")] {
                argv.push("--env".into());
                argv.push(format!("{key}={value}"));
            }
        }
        WrapperKind::Bwrap => {
            argv.extend(
                ["--die-with-parent", "--new-session", "--unshare-all"].map(String::from),
            );
            if limits.network {
                argv.push("--share-net".into());
            }
            for dir in RO_BINDS {
                if Path::new(dir).exists() {
                    argv.extend(["--ro-bind", dir, dir].map(String::from));
                }
            }
            argv.extend(["--proc", "/proc", "--dev", "/dev", "--tmpfs", "/tmp"].map(String::from));
            argv.push("--bind".into());
            argv.push(workdir.to_string_lossy().into_owned());
            argv.push(SANDBOX_DIR.into());
            argv.extend(["--chdir", SANDBOX_DIR].map(String::from));
        }
    }
    argv.push("--".into());
    argv.push(program);
    argv.extend(args.iter().cloned());
    argv
}

fn seccomp_policy(network: bool) -> String {
    let mut allowed: Vec<&str> = SECCOMP_ALLOW.to_vec();
    if network {
        allowed.extend_from_slice(SECCOMP_ALLOW_NET);
    }
    format!(
        "POLICY sandbox {{ ALLOW {{ {} }} }} USE sandbox DEFAULT KILL",
        allowed.join(", ")
    )
}

/// Pick the first `count` CPUs this process is allowed to run on.
fn pinned_cpus(count: u32) -> Option<CpuSet> {
    let allowed = sched_getaffinity(Pid::from_raw(0)).ok()?;
    let mut pinned = CpuSet::new();
    let mut taken = 0;
    for cpu in 0..CpuSet::count() {
        if taken >= count.max(1) {
            break;
        }
        if allowed.is_set(cpu).unwrap_or(false) {
            pinned.set(cpu).ok()?;
            taken += 1;
        }
    }
    (taken > 0).then_some(pinned)
}

fn capped(resource: Resource, wanted: u64) -> u64 {
    getrlimit(resource).map_or(wanted, |(_, hard)| wanted.min(hard))
}

fn apply_limits_on_exec(cmd: &mut Command, limits: &ResourceLimits) {
    let mem_bytes = capped(
        Resource::RLIMIT_AS,
        limits.memory_mb.saturating_mul(1024 * 1024),
    );
    let nofile = capped(Resource::RLIMIT_NOFILE, limits.nofile);
    let cpus = pinned_cpus(limits.cpus);
    // SAFETY: the closure only issues setrlimit/sched_setaffinity syscalls and
    // does not allocate.
    unsafe {
        cmd.pre_exec(move || {
            setrlimit(Resource::RLIMIT_AS, mem_bytes, mem_bytes)?;
            setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
            setrlimit(Resource::RLIMIT_NOFILE, nofile, nofile)?;
            if let Some(cpus) = &cpus {
                sched_setaffinity(Pid::from_raw(0), cpus)?;
            }
            Ok(())
        });
    }
}

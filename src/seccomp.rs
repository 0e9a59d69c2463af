//! Seccomp profiles.
//!
//! Tasks opt into seccomp confinement with `seccomp=true`; a custom profile
//! path may replace the default allowlist. Profiles are standard runtime
//! spec seccomp documents.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Seccomp section of an OCI spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinuxSeccomp {
    pub default_action: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub architectures: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub syscalls: Vec<LinuxSyscall>,
}

/// A syscall rule inside a seccomp profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinuxSyscall {
    pub names: Vec<String>,
    pub action: String,
}

/// Loads a custom seccomp profile from a JSON file.
pub fn load_profile(path: &str) -> Result<LinuxSeccomp> {
    let raw = std::fs::read(Path::new(path)).map_err(|e| {
        Error::InvalidTaskConfig(format!("failed to read seccomp profile {path}: {e}"))
    })?;
    let profile: LinuxSeccomp = serde_json::from_slice(&raw)?;
    Ok(profile)
}

/// The default profile: errno for everything, an allowlist of the syscalls
/// ordinary workloads use.
pub fn default_profile() -> LinuxSeccomp {
    LinuxSeccomp {
        default_action: "SCMP_ACT_ERRNO".to_string(),
        architectures: default_architectures(),
        syscalls: vec![LinuxSyscall {
            names: DEFAULT_ALLOWED_SYSCALLS.iter().map(|s| s.to_string()).collect(),
            action: "SCMP_ACT_ALLOW".to_string(),
        }],
    }
}

fn default_architectures() -> Vec<String> {
    match std::env::consts::ARCH {
        "x86_64" => vec![
            "SCMP_ARCH_X86_64".to_string(),
            "SCMP_ARCH_X86".to_string(),
            "SCMP_ARCH_X32".to_string(),
        ],
        "aarch64" => vec!["SCMP_ARCH_AARCH64".to_string(), "SCMP_ARCH_ARM".to_string()],
        _ => Vec::new(),
    }
}

/// Allowed syscalls for the default profile.
const DEFAULT_ALLOWED_SYSCALLS: &[&str] = &[
    "accept", "accept4", "access", "arch_prctl", "bind", "brk", "capget", "capset", "chdir",
    "chmod", "chown", "clock_getres", "clock_gettime", "clock_nanosleep", "clone", "clone3",
    "close", "close_range", "connect", "copy_file_range", "creat", "dup", "dup2", "dup3",
    "epoll_create", "epoll_create1", "epoll_ctl", "epoll_pwait", "epoll_wait", "eventfd",
    "eventfd2", "execve", "execveat", "exit", "exit_group", "faccessat", "faccessat2",
    "fadvise64", "fallocate", "fchdir", "fchmod", "fchmodat", "fchown", "fchownat", "fcntl",
    "fdatasync", "flock", "fork", "fstat", "fstatfs", "fsync", "ftruncate", "futex",
    "getcwd", "getdents", "getdents64", "getegid", "geteuid", "getgid", "getgroups",
    "getitimer", "getpeername", "getpgid", "getpgrp", "getpid", "getppid", "getpriority",
    "getrandom", "getresgid", "getresuid", "getrlimit", "getrusage", "getsid",
    "getsockname", "getsockopt", "gettid", "gettimeofday", "getuid", "getxattr",
    "inotify_add_watch", "inotify_init", "inotify_init1", "inotify_rm_watch", "ioctl",
    "kill", "lchown", "lgetxattr", "link", "linkat", "listen", "listxattr", "lseek",
    "lstat", "madvise", "memfd_create", "mincore", "mkdir", "mkdirat", "mknod", "mknodat",
    "mlock", "mmap", "mprotect", "mremap", "msync", "munlock", "munmap", "nanosleep",
    "newfstatat", "open", "openat", "openat2", "pause", "pipe", "pipe2", "poll", "ppoll",
    "prctl", "pread64", "preadv", "prlimit64", "pselect6", "pwrite64", "pwritev", "read",
    "readahead", "readlink", "readlinkat", "readv", "recvfrom", "recvmmsg", "recvmsg",
    "rename", "renameat", "renameat2", "restart_syscall", "rmdir", "rt_sigaction",
    "rt_sigpending", "rt_sigprocmask", "rt_sigqueueinfo", "rt_sigreturn", "rt_sigsuspend",
    "rt_sigtimedwait", "sched_getaffinity", "sched_getparam", "sched_getscheduler",
    "sched_yield", "select", "sendfile", "sendmmsg", "sendmsg", "sendto", "set_robust_list",
    "set_tid_address", "setgid", "setgroups", "setitimer", "setpgid", "setpriority",
    "setresgid", "setresuid", "setsid", "setsockopt", "setuid", "setxattr", "shutdown",
    "sigaltstack", "socket", "socketpair", "splice", "stat", "statfs", "statx", "symlink",
    "symlinkat", "sync", "sync_file_range", "syncfs", "sysinfo", "tee", "tgkill", "time",
    "timer_create", "timer_delete", "timer_getoverrun", "timer_gettime", "timer_settime",
    "timerfd_create", "timerfd_gettime", "timerfd_settime", "times", "tkill", "truncate",
    "umask", "uname", "unlink", "unlinkat", "utime", "utimensat", "utimes", "vfork",
    "wait4", "waitid", "write", "writev",
];

//! Unified error type hierarchy for the isolation controller.
//!
//! Mirrors the error taxonomy described in the design: transient per-workload
//! failures, group-structural failures that retire a single isolation group,
//! host-structural failures that take down the whole controller, and
//! protocol failures from the metric broker.

use std::io;
use thiserror::Error;

/// Errors that originate from writing to or reading from an OS control
/// surface (`resctrl`, `cpuset`/`cpu` cgroups, `cpufreq` sysfs, NUMA
/// topology files).
#[derive(Error, Debug)]
pub enum OsError {
    /// The workload's process (or its perf agent) exited before or during
    /// the write. Callers treat this as benign: skip the workload, keep
    /// going.
    #[error("process {pid} no longer exists")]
    ProcessGone { pid: i32 },

    /// A required mount point or control file is absent entirely (e.g.
    /// `/sys/fs/resctrl` not mounted). Structural: propagates to `main`.
    #[error("required control surface missing: {0}")]
    MountMissing(String),

    /// Write was rejected for permissions. Structural.
    #[error("permission denied writing {0}")]
    PermissionDenied(String),

    /// Any other I/O failure while touching a path under an OS control
    /// surface.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// A workload's current cores/cgroup data could not be parsed.
    #[error("malformed control-surface data at {0}: {1}")]
    Malformed(String, String),
}

impl OsError {
    /// Build an [`OsError`] from an [`io::Error`] encountered while
    /// touching `path`, classifying process-gone and permission cases.
    pub fn from_io(path: impl Into<String>, source: io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            io::ErrorKind::NotFound => OsError::Io { path, source },
            io::ErrorKind::PermissionDenied => OsError::PermissionDenied(path),
            _ => OsError::Io { path, source },
        }
    }

    /// True if this failure is benign: the workload or its control-group
    /// directory vanished mid-write because the process already exited.
    /// Isolators skip the workload and continue rather than propagating.
    pub fn is_transient(&self) -> bool {
        match self {
            OsError::ProcessGone { .. } => true,
            OsError::Io { source, .. } => {
                source.kind() == io::ErrorKind::NotFound
                    || source.raw_os_error() == Some(libc::ESRCH)
            }
            _ => false,
        }
    }
}

/// Group-structural failures: raised to the controller, which logs and
/// retires the offending group. Never taken down the whole process.
#[derive(Error, Debug)]
pub enum GroupError {
    #[error("solorun profiling requested while already in progress")]
    AlreadyProfiling,

    #[error("solorun profiling ended with no foreground samples collected")]
    NoSamplesForProfile,

    #[error("isolation group has no background workloads left")]
    NoBackgroundWorkloads,

    #[error("stop_solorun_profiling called while not profiling")]
    NotProfiling,
}

/// Malformed input from the metric broker. Acked and discarded at debug
/// level; never propagated past the polling boundary.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed creation message: expected 5 comma-separated fields, got {0}")]
    MalformedCreation(usize),

    #[error("unknown workload kind {0:?}, expected \"fg\" or \"bg\"")]
    UnknownKind(String),

    #[error("malformed workload identifier: {0:?}")]
    MalformedIdentifier(String),

    #[error("non-integer field in creation message: {0:?}")]
    NonIntegerField(String),

    #[error("invalid metric sample JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("metric sample missing field {0}")]
    MissingField(&'static str),
}

/// Top-level error type. `main` maps this to a process exit code: `0` on
/// clean shutdown, non-zero on any [`AppError::Host`].
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Host(#[from] OsError),

    #[error(transparent)]
    Group(#[from] GroupError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

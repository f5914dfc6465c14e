//! File-access policy for the sandboxed media process.
//!
//! Under seccomp, `open`/`openat`/`access`/`faccessat` trap and are replayed
//! by a broker that consults this allowlist. Everything else a brokered
//! syscall could touch is denied.

use std::path::Path;

use bitflags::bitflags;
use tracing::debug;

pub const EPERM: i32 = 1;
pub const ENOSYS: i32 = 38;

/// `open(2)` flag bits the broker looks at.
pub const O_ACCMODE: i32 = 0o3;
pub const O_RDONLY: i32 = 0o0;
pub const O_WRONLY: i32 = 0o1;
pub const O_RDWR: i32 = 0o2;
pub const O_CREAT: i32 = 0o100;

/// `access(2)` mode bits.
pub const F_OK: i32 = 0;
pub const X_OK: i32 = 1;
pub const W_OK: i32 = 2;
pub const R_OK: i32 = 4;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u8 {
        const READ = 0b0001;
        const WRITE = 0b0010;
        const CREATE = 0b0100;
        const UNLINK = 0b1000;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("access to {0} denied")]
    Denied(String),
    #[error("syscall {0} is not brokered")]
    Unsupported(String),
}

impl BrokerError {
    pub fn errno(&self) -> i32 {
        match self {
            BrokerError::Denied(_) => EPERM,
            BrokerError::Unsupported(_) => ENOSYS,
        }
    }
}

/// One allowlist entry. A recursive entry's path ends with `/` and covers
/// everything below it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerPermission {
    pub path: String,
    pub recursive: bool,
    pub access: Access,
}

impl BrokerPermission {
    pub fn read_only(path: impl Into<String>) -> Self {
        Self::new(path, false, Access::READ)
    }

    pub fn read_only_recursive(path: impl Into<String>) -> Self {
        Self::new(path, true, Access::READ)
    }

    pub fn read_write_create(path: impl Into<String>) -> Self {
        Self::new(path, false, Access::READ | Access::WRITE | Access::CREATE)
    }

    pub fn read_write_create_recursive(path: impl Into<String>) -> Self {
        Self::new(path, true, Access::READ | Access::WRITE | Access::CREATE)
    }

    pub fn read_write_create_unlink_recursive(path: impl Into<String>) -> Self {
        Self::new(path, true, Access::all())
    }

    fn new(path: impl Into<String>, recursive: bool, access: Access) -> Self {
        Self {
            path: path.into(),
            recursive,
            access,
        }
    }

    fn covers(&self, path: &str) -> bool {
        if self.recursive {
            path.starts_with(&self.path) && path.len() > self.path.len()
        } else {
            path == self.path
        }
    }
}

/// The syscalls the broker replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokeredSyscall {
    Open,
    Access,
}

/// Map a trapped syscall to what the broker does with it. The `*at`
/// variants are only brokered relative to the current directory.
pub fn classify_syscall(name: &str, dirfd_is_cwd: bool) -> Result<BrokeredSyscall, BrokerError> {
    match name {
        "open" => Ok(BrokeredSyscall::Open),
        "access" => Ok(BrokeredSyscall::Access),
        "openat" | "faccessat" if !dirfd_is_cwd => Err(BrokerError::Denied(format!("{name} with dirfd"))),
        "openat" => Ok(BrokeredSyscall::Open),
        "faccessat" => Ok(BrokeredSyscall::Access),
        other => Err(BrokerError::Unsupported(other.to_string())),
    }
}

#[derive(Debug, Clone, Default)]
pub struct BrokerPolicy {
    permissions: Vec<BrokerPermission>,
}

impl BrokerPolicy {
    pub fn new(permissions: Vec<BrokerPermission>) -> Self {
        Self { permissions }
    }

    /// The media process allowlist: audio server sockets and config,
    /// the GStreamer registry cache, shared libraries and a few system
    /// files.
    pub fn media_default(home: &str, xdg_runtime_dir: &str) -> Self {
        let mut p = vec![
            BrokerPermission::read_write_create_recursive("/dev/shm/"),
            BrokerPermission::read_only_recursive("/usr/lib/pulse-4.0/modules/"),
            BrokerPermission::read_only_recursive("/etc/pulse/"),
            BrokerPermission::read_write_create_unlink_recursive(format!("{xdg_runtime_dir}/pulse/")),
            BrokerPermission::read_write_create(format!("{xdg_runtime_dir}/pulse")),
            BrokerPermission::read_only_recursive(format!("{home}/.pulse/")),
            BrokerPermission::read_only_recursive(format!("{home}/.config/pulse/")),
            BrokerPermission::read_only(format!("{home}/.Xauthority")),
            BrokerPermission::read_write_create_unlink_recursive(format!("{home}/.cache/gstreamer-1.0/")),
            BrokerPermission::read_only(format!("{home}/.cache/gstreamer-1.0/registry.x86_64.bin")),
        ];
        for lib in [
            "/lib/",
            "/lib64/",
            "/usr/lib32/",
            "/usr/lib64/",
            "/usr/local/lib32/",
            "/usr/local/lib64/",
            "/usr/lib/",
            "/usr/local/lib/",
        ] {
            p.push(BrokerPermission::read_only_recursive(lib));
        }
        p.push(BrokerPermission::read_only("/etc/ld.so.cache"));
        p.push(BrokerPermission::read_only_recursive("/usr/share/"));
        p.push(BrokerPermission::read_only_recursive("/usr/local/share/"));
        p.push(BrokerPermission::read_only("/var/lib/dbus/machine-id"));
        Self::new(p)
    }

    /// Add read-only entries for plugin and library search paths taken
    /// from the environment (`GST_REGISTRY`, `GST_PLUGIN_PATH`,
    /// `LD_LIBRARY_PATH`, `GST_PLUGIN_SCANNER`).
    pub fn with_env_paths<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(registry) = lookup("GST_REGISTRY") {
            self.permissions.push(BrokerPermission::read_only(registry));
        }
        for var in ["GST_PLUGIN_PATH", "LD_LIBRARY_PATH", "GST_PLUGIN_SCANNER"] {
            let Some(value) = lookup(var) else { continue };
            for entry in value.split(':').filter(|e| !e.is_empty()) {
                if entry.ends_with('/') {
                    self.permissions.push(BrokerPermission::read_only_recursive(entry));
                } else {
                    self.permissions.push(BrokerPermission::read_only(entry));
                    self.permissions
                        .push(BrokerPermission::read_only_recursive(format!("{entry}/")));
                }
            }
        }
        self
    }

    pub fn permissions(&self) -> &[BrokerPermission] {
        &self.permissions
    }

    pub fn check_open(&self, path: &str, flags: i32) -> Result<(), BrokerError> {
        let mut wanted = match flags & O_ACCMODE {
            O_RDONLY => Access::READ,
            O_WRONLY => Access::WRITE,
            O_RDWR => Access::READ | Access::WRITE,
            _ => return Err(BrokerError::Denied(path.to_string())),
        };
        if flags & O_CREAT != 0 {
            wanted |= Access::CREATE;
        }
        self.check(path, wanted)
    }

    pub fn check_access(&self, path: &str, mode: i32) -> Result<(), BrokerError> {
        if mode & X_OK != 0 {
            return Err(BrokerError::Denied(path.to_string()));
        }
        let mut wanted = Access::empty();
        if mode == F_OK || mode & R_OK != 0 {
            wanted |= Access::READ;
        }
        if mode & W_OK != 0 {
            wanted |= Access::WRITE;
        }
        self.check(path, wanted)
    }

    fn check(&self, path: &str, wanted: Access) -> Result<(), BrokerError> {
        let traverses = Path::new(path)
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir));
        if !path.starts_with('/') || traverses {
            debug!(path, "sandbox: rejected non-canonical path");
            return Err(BrokerError::Denied(path.to_string()));
        }
        let allowed = self
            .permissions
            .iter()
            .any(|p| p.covers(path) && p.access.contains(wanted));
        if allowed {
            Ok(())
        } else {
            debug!(path, ?wanted, "sandbox: denied");
            Err(BrokerError::Denied(path.to_string()))
        }
    }
}

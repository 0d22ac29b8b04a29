//! Host platform detection (§4.A): whether we are running under Android's
//! bionic/Termux userland versus a conventional glibc Linux host, and which
//! kernel we are on. Both facts are expensive enough to probe (reading
//! `/system/build.prop`, `uname(2)`) that callers share a single memoized
//! handle rather than re-probing on every mount or seccomp decision.

use std::path::Path;

use nix::sys::utsname::uname;
use once_cell::sync::OnceCell;

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("uname(2) failed: {0}")]
    Uname(#[source] std::io::Error),
    #[error("could not parse kernel release {release:?}")]
    UnparseableRelease { release: String },
}

type Result<T> = std::result::Result<T, PlatformError>;

/// Paths whose presence is diagnostic of an Android userland. Checked in
/// order; the first hit wins. `/system/bin/app_process` is Android's Zygote
/// launcher and is the most reliable signal on API levels without
/// `ro.build.version.release` readable from an unprivileged process.
const ANDROID_MARKERS: &[&str] = &["/system/bin/app_process", "/system/bin/app_process64", "/system/build.prop"];

#[derive(Debug, Clone, Copy)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct PlatformProbe {
    pub is_android: bool,
    pub kernel: KernelVersion,
}

impl PlatformProbe {
    fn detect() -> Result<Self> {
        let is_android = std::env::var_os("ANDROID_ROOT").is_some()
            || ANDROID_MARKERS.iter().any(|p| Path::new(p).exists());

        let info = uname().map_err(|errno| PlatformError::Uname(std::io::Error::from(errno)))?;
        let release = info.release().to_string_lossy().into_owned();
        let kernel = parse_kernel_release(&release)?;

        Ok(PlatformProbe { is_android, kernel })
    }
}

fn parse_kernel_release(release: &str) -> Result<KernelVersion> {
    let mut parts = release.split(['.', '-']);
    let major = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| PlatformError::UnparseableRelease { release: release.to_string() })?;
    let minor = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| PlatformError::UnparseableRelease { release: release.to_string() })?;
    Ok(KernelVersion { major, minor })
}

static PROBE: OnceCell<PlatformProbe> = OnceCell::new();

/// Returns the memoized platform probe, detecting it on first use. A failed
/// `uname(2)` or an unparseable kernel release yields `(0, 0)`, which every
/// downstream consumer (seccomp arch selection, cgroup version detection)
/// treats as "assume modern (>= 5)" per the platform probe's contract,
/// rather than panicking on a host we can't fully introspect.
pub fn probe() -> PlatformProbe {
    *PROBE.get_or_init(|| {
        PlatformProbe::detect().unwrap_or(PlatformProbe {
            is_android: std::env::var_os("ANDROID_ROOT").is_some()
                || ANDROID_MARKERS.iter().any(|p| Path::new(p).exists()),
            kernel: KernelVersion { major: 0, minor: 0 },
        })
    })
}

/// `kernel_major < 5` downstream checks must special-case the "unknown"
/// sentinel so a probe failure never accidentally triggers the pre-5.0
/// seccomp workaround (§4.F) on a host that is actually modern.
impl KernelVersion {
    pub fn is_unknown(&self) -> bool {
        self.major == 0 && self.minor == 0
    }

    /// True when the kernel is known to be below major version 5. An
    /// unknown version (probe failure) is treated as modern, never as old.
    pub fn is_pre_5(&self) -> bool {
        !self.is_unknown() && self.major < 5
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kernel_release_plain() {
        let v = parse_kernel_release("5.15.0").unwrap();
        assert_eq!(v.major, 5);
        assert_eq!(v.minor, 15);
    }

    #[test]
    fn test_parse_kernel_release_android_suffix() {
        let v = parse_kernel_release("4.19.157-perf+").unwrap();
        assert_eq!(v.major, 4);
        assert_eq!(v.minor, 19);
    }

    #[test]
    fn test_parse_kernel_release_rejects_garbage() {
        assert!(parse_kernel_release("not-a-version").is_err());
    }

    #[test]
    fn test_unknown_kernel_is_treated_as_modern() {
        let unknown = KernelVersion { major: 0, minor: 0 };
        assert!(unknown.is_unknown());
        assert!(!unknown.is_pre_5());
    }

    #[test]
    fn test_known_old_kernel_is_pre_5() {
        let old = KernelVersion { major: 4, minor: 14 };
        assert!(!old.is_unknown());
        assert!(old.is_pre_5());
    }

    #[test]
    fn test_probe_is_memoized() {
        let a = probe();
        let b = probe();
        assert_eq!(a.is_android, b.is_android);
        assert_eq!(a.kernel.major, b.kernel.major);
    }
}

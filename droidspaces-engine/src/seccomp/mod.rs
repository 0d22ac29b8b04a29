//! Seccomp-BPF filter (§4.F). `seccompiler` assembles the program in pure
//! Rust rather than via `libseccomp` FFI, since a confined Android host
//! cannot be assumed to ship `libseccomp.so`. The filter is a fixed,
//! four-rule program, not a configurable allow/deny policy:
//!
//! 1. `reboot` traps (the container must never be able to reboot the host).
//! 2. `keyctl`/`add_key`/`request_key` fail with `ENOSYS` (no kernel keyring
//!    inside the container).
//! 3. On a pre-5.0 kernel, when the init process runs systemd, `unshare`/
//!    `clone` calls that request the namespace bits in `SYSTEMD_NS_DENY_MASK`
//!    fail with `EPERM` — the `grab_super` deadlock workaround (§9, O-c).
//! 4. Everything else is allowed.

use std::collections::BTreeMap;
use std::convert::TryInto;

use seccompiler::{
    BpfProgram, SeccompAction, SeccompCmpArgLen as ArgLen, SeccompCmpOp as Op,
    SeccompCondition as Cond, SeccompFilter, SeccompRule, TargetArch,
};

use crate::platform::PlatformProbe;

#[derive(Debug, thiserror::Error)]
pub enum SeccompError {
    #[error("failed to build seccomp rule: {0}")]
    Rule(#[source] seccompiler::BackendError),
    #[error("failed to build seccomp filter: {0}")]
    Filter(#[source] seccompiler::Error),
    #[error("failed to compile seccomp filter to bpf: {0}")]
    Compile(#[source] seccompiler::Error),
}

type Result<T> = std::result::Result<T, SeccompError>;

/// The exact arg0 mask named in the design note: `CLONE_NEWNS | CLONE_NEWUTS
/// | CLONE_NEWIPC | CLONE_NEWUSER | CLONE_NEWPID | CLONE_NEWNET |
/// CLONE_NEWCGROUP`, kept as a named constant rather than inlined so the
/// deadlock workaround stays traceable to its one call site.
pub const SYSTEMD_NS_DENY_MASK: u64 = 0x7E02_0000;

fn host_arch() -> TargetArch {
    match std::env::consts::ARCH {
        "aarch64" => TargetArch::Aarch64,
        _ => TargetArch::X86_64,
    }
}

fn trap_rule() -> Result<Vec<SeccompRule>> {
    Ok(vec![SeccompRule::new(vec![], SeccompAction::Trap).map_err(SeccompError::Rule)?])
}

fn errno_rule(errno: i32) -> Result<Vec<SeccompRule>> {
    Ok(vec![SeccompRule::new(vec![], SeccompAction::Errno(errno as u32)).map_err(SeccompError::Rule)?])
}

/// Expresses "any bit in `SYSTEMD_NS_DENY_MASK` is set" as one rule per bit
/// rather than a single `MaskedEq(mask, mask)` condition — the latter only
/// matches when *every* masked bit is set simultaneously (an AND), while
/// §4.F rule 3 requires denying `unshare`/`clone` when *any* one of the
/// namespace flags is present (an OR). `seccompiler` has no native OR
/// combinator within one rule's condition list, but a syscall's rules are
/// tried in order and the first whole-rule match wins, so one single-bit
/// rule per flag reproduces OR semantics across the whole set.
fn namespace_deny_rule() -> Result<Vec<SeccompRule>> {
    let mut rules = Vec::new();
    for shift in 0..64 {
        let bit = 1u64 << shift;
        if SYSTEMD_NS_DENY_MASK & bit == 0 {
            continue;
        }
        let condition = Cond::new(0, ArgLen::Qword, Op::MaskedEq(bit), bit).map_err(SeccompError::Rule)?;
        rules.push(
            SeccompRule::new(vec![condition], SeccompAction::Errno(libc::EPERM as u32))
                .map_err(SeccompError::Rule)?,
        );
    }
    Ok(rules)
}

/// Reinterprets a compiled `BpfProgram` (`Vec<sock_filter>`, each record 8
/// bytes: `code: u16, jt: u8, jf: u8, k: u32`) as the raw byte buffer
/// `Syscall::install_seccomp_filter` expects, mirroring the reverse cast
/// `LinuxSyscall::install_seccomp_filter` performs on the way in.
pub fn to_raw_bytes(prog: &BpfProgram) -> Vec<u8> {
    let byte_len = std::mem::size_of_val(prog.as_slice());
    unsafe { std::slice::from_raw_parts(prog.as_ptr() as *const u8, byte_len) }.to_vec()
}

/// Builds the fixed filter for the given platform probe and init mode,
/// compiling it straight to a BPF program ready for
/// `Syscall::install_seccomp_filter`.
pub fn build_filter(probe: &PlatformProbe, is_systemd_init: bool) -> Result<BpfProgram> {
    let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();

    rules.insert(libc::SYS_reboot, trap_rule()?);
    rules.insert(libc::SYS_keyctl, errno_rule(libc::ENOSYS)?);
    rules.insert(libc::SYS_add_key, errno_rule(libc::ENOSYS)?);
    rules.insert(libc::SYS_request_key, errno_rule(libc::ENOSYS)?);

    if is_systemd_init && probe.kernel.is_pre_5() {
        rules.insert(libc::SYS_unshare, namespace_deny_rule()?);
        rules.insert(libc::SYS_clone, namespace_deny_rule()?);
    }

    let filter = SeccompFilter::new(rules, SeccompAction::Allow, SeccompAction::Allow, host_arch())
        .map_err(SeccompError::Filter)?;

    filter.try_into().map_err(SeccompError::Compile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::KernelVersion;

    fn probe(major: u32, minor: u32) -> PlatformProbe {
        PlatformProbe {
            is_android: true,
            kernel: KernelVersion { major, minor },
        }
    }

    #[test]
    fn test_build_filter_with_modern_kernel_and_systemd_compiles() {
        let program = build_filter(&probe(5, 10), true).unwrap();
        assert!(!program.is_empty());
    }

    #[test]
    fn test_build_filter_with_old_kernel_and_shell_init_compiles() {
        // Shell init never triggers the namespace-deny workaround, old
        // kernel or not.
        let program = build_filter(&probe(4, 9), false).unwrap();
        assert!(!program.is_empty());
    }

    #[test]
    fn test_build_filter_with_old_kernel_and_systemd_is_larger_program() {
        let base = build_filter(&probe(4, 9), false).unwrap();
        let with_workaround = build_filter(&probe(4, 9), true).unwrap();
        assert!(with_workaround.len() >= base.len());
    }

    #[test]
    fn test_namespace_deny_rule_is_one_rule_per_mask_bit() {
        // One single-bit rule per flag reproduces OR semantics across the
        // mask: a plain CLONE_NEWNS-only unshare() must match some rule in
        // this set even though it doesn't set every bit in the mask.
        let rules = namespace_deny_rule().unwrap();
        assert_eq!(rules.len(), SYSTEMD_NS_DENY_MASK.count_ones() as usize);
    }

    #[test]
    fn test_namespace_deny_mask_covers_seven_clone_flags() {
        // CLONE_NEWNS | NEWUTS | NEWIPC | NEWUSER | NEWPID | NEWNET | NEWCGROUP.
        assert_eq!(SYSTEMD_NS_DENY_MASK.count_ones(), 7);
    }

    #[test]
    fn test_to_raw_bytes_length_is_multiple_of_filter_size() {
        let program = build_filter(&probe(5, 10), true).unwrap();
        let bytes = to_raw_bytes(&program);
        assert_eq!(bytes.len() % std::mem::size_of::<libc::sock_filter>(), 0);
        assert_eq!(bytes.len() / std::mem::size_of::<libc::sock_filter>(), program.len());
    }

    #[test]
    fn test_build_filter_with_unknown_kernel_never_triggers_workaround() {
        let unknown = probe(0, 0);
        assert!(unknown.kernel.is_unknown());
        let with_systemd = build_filter(&unknown, true).unwrap();
        let without = build_filter(&unknown, false).unwrap();
        // Both compile identically since an unknown kernel is treated as
        // modern and never installs the namespace-deny rule.
        assert_eq!(with_systemd.len(), without.len());
    }
}

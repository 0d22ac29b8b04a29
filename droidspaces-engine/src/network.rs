//! Network bootstrap (§4.D): host-phase IPv4/IPv6 forwarding and NAT
//! masquerade (before `pivot_root`), and rootfs-phase hostname/`/etc/hosts`/
//! `/etc/resolv.conf`/paranoid-network GIDs (after `pivot_root`, per O3).

use std::path::Path;

use crate::host_command::HostCommand;
use crate::platform::PlatformProbe;
use crate::syscall::Syscall;
use crate::utils;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error(transparent)]
    Fs(#[from] crate::utils::FsError),
    #[error(transparent)]
    Syscall(#[from] crate::syscall::SyscallError),
}

type Result<T> = std::result::Result<T, NetworkError>;

const ANDROID_NAT_SUBNET: &str = "10.0.3.0/24";
const PARANOID_NETWORK_GROUPS: &[(&str, u32)] =
    &[("aid_inet", 3003), ("aid_net_raw", 3004), ("aid_net_admin", 3005)];

/// Host phase (before `pivot_root`): enables forwarding and, on Android,
/// installs NAT masquerade for the container's default subnet.
pub fn host_phase(
    host_command: &dyn HostCommand,
    probe: &PlatformProbe,
    enable_ipv6: bool,
) -> Result<()> {
    write_sysctl_best_effort("/proc/sys/net/ipv4/ip_forward", "1");
    if enable_ipv6 {
        write_sysctl_best_effort("/proc/sys/net/ipv6/conf/all/forwarding", "1");
    }

    if probe.is_android {
        let _ = host_command.run(
            "iptables",
            &[
                "-t",
                "nat",
                "-A",
                "POSTROUTING",
                "-s",
                ANDROID_NAT_SUBNET,
                "!",
                "-d",
                ANDROID_NAT_SUBNET,
                "-j",
                "MASQUERADE",
            ],
        );
        let _ = host_command.run("iptables", &["-P", "FORWARD", "ACCEPT"]);
    }

    Ok(())
}

fn write_sysctl_best_effort(path: &str, value: &str) {
    if let Err(err) = utils::write_small(path, value.as_bytes()) {
        tracing::warn!(?err, path, "failed to write sysctl");
    }
}

/// Rootfs phase (after `pivot_root`, O3): hostname, `/etc/hosts`,
/// `/etc/resolv.conf`, and (on Android) the paranoid-network GIDs.
pub fn rootfs_phase(
    syscall: &dyn Syscall,
    host_command: &dyn HostCommand,
    probe: &PlatformProbe,
    hostname: &str,
) -> Result<()> {
    if !hostname.is_empty() {
        syscall.set_hostname(hostname)?;
        utils::write_small("/etc/hostname", format!("{hostname}\n").as_bytes())?;
    }

    write_etc_hosts(hostname)?;
    write_resolv_conf(host_command, probe)?;

    if probe.is_android {
        append_paranoid_network_groups()?;
    }

    Ok(())
}

fn write_etc_hosts(hostname: &str) -> Result<()> {
    let mut contents = String::from("127.0.0.1\tlocalhost\n::1\tlocalhost\n");
    if !hostname.is_empty() {
        contents.push_str(&format!("127.0.1.1\t{hostname}\n"));
    }
    utils::write_small("/etc/hosts", contents.as_bytes())?;
    Ok(())
}

/// Android DNS properties probed in order until the first non-empty value;
/// any non-empty string short-circuits, including the literal `0.0.0.0` —
/// preserved exactly per §9 open question (b).
const DNS_PROPERTIES: &[&str] = &[
    "net.dns1",
    "net.dns2",
    "net.eth0.dns1",
    "net.eth0.dns2",
    "net.wlan0.dns1",
    "net.wlan0.dns2",
];

fn getprop(host_command: &dyn HostCommand, prop: &str) -> Option<String> {
    let output = host_command.output("getprop", &[prop]).ok()?;
    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn probe_android_dns(host_command: &dyn HostCommand) -> Vec<String> {
    let mut servers = Vec::new();
    for prop in DNS_PROPERTIES {
        if let Some(value) = getprop(host_command, prop) {
            servers.push(value);
            if servers.len() == 2 {
                break;
            }
        }
    }
    servers
}

fn write_resolv_conf(host_command: &dyn HostCommand, probe: &PlatformProbe) -> Result<()> {
    let servers = if probe.is_android {
        probe_android_dns(host_command)
    } else {
        Vec::new()
    };

    let servers = if servers.is_empty() {
        vec!["8.8.8.8".to_string(), "8.8.4.4".to_string()]
    } else {
        servers
    };

    let contents: String = servers
        .iter()
        .map(|s| format!("nameserver {s}\n"))
        .collect();
    utils::write_small("/etc/resolv.conf", contents.as_bytes())?;
    Ok(())
}

fn append_paranoid_network_groups() -> Result<()> {
    let group_path = Path::new("/etc/group");
    let existing = match utils::read_small(group_path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => {
            tracing::warn!("/etc/group missing, skipping paranoid-network GID append");
            return Ok(());
        }
    };

    let mut appended = existing.clone();
    for (name, gid) in PARANOID_NETWORK_GROUPS {
        let line_prefix = format!("{name}:x:{gid}:");
        if existing.lines().any(|l| l.starts_with(&line_prefix)) {
            continue;
        }
        if !appended.is_empty() && !appended.ends_with('\n') {
            appended.push('\n');
        }
        appended.push_str(&line_prefix);
        appended.push('\n');
    }

    if appended != existing {
        utils::write_small(group_path, appended.as_bytes())?;
    }

    Ok(())
}

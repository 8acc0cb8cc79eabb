//! Kernel command-line composition for microVM boots.
//!
//! The guest has no agent; everything the workload needs is carried on
//! the kernel command line: interface configuration for the assigned
//! static IP, environment exports, and the exec of the user command,
//! all run by an init shell. User-supplied strings are single-quoted
//! against shell injection.

use crate::domain::{SandboxRequest, VmConfig};

/// Hardening switches every microVM boots with, ahead of anything else.
pub const HARDENING_PREAMBLE: &str = "console=ttyS0 reboot=k panic=1 oops=panic pti=on \
     init_on_alloc=1 init_on_free=1 spec_store_bypass_disable=on mitigations=auto \
     vsyscall=none debugfs=off";

/// Single-quote a string for POSIX sh. Embedded single quotes become
/// `'\''` (end quote, escaped quote, restart quote); the result is
/// always wrapped in `'…'`.
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// The in-guest boot script: interface config (when a static IP is
/// assigned), env exports, then exec of the user command.
pub fn guest_script(req: &SandboxRequest, cfg: &VmConfig) -> String {
    let mut cmds: Vec<String> = Vec::new();

    if let Some(ip) = &cfg.ip {
        cmds.push(format!("ip addr add {}{} dev eth0", ip.ip, ip.cidr));
        cmds.push("ip link set eth0 up".into());
        cmds.push(format!("ip route add default via {} dev eth0", ip.gateway));
    }

    for (key, value) in &req.env {
        cmds.push(format!("export {key}={}", quote(value)));
    }

    let argv = req
        .argv()
        .iter()
        .map(|part| quote(part))
        .collect::<Vec<_>>()
        .join(" ");
    cmds.push(format!("exec {argv}"));

    cmds.join(" && ")
}

/// Full boot args: hardening preamble, then the guest script embedded
/// in `init=/bin/sh -c "…"` with inner double quotes backslash-escaped.
pub fn build_boot_args(req: &SandboxRequest, cfg: &VmConfig) -> String {
    let script = guest_script(req, cfg).replace('"', "\\\"");
    format!("{HARDENING_PREAMBLE} init=/bin/sh -c \"{script}\"")
}

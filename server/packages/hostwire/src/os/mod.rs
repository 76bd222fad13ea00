//! Snapshots of the host: process table, volumes, memory, network.
//!
//! Every function takes a fresh reading from platform tools or `/proc`; nothing
//! is cached, so fields gathered in sequence are not mutually consistent.

mod command;
mod service;

use std::fs;
use std::io;
use std::path::Path;
use std::process::{Command, Stdio};

use serde::Serialize;

pub use command::{run_with_timeout, spawn_detached, CommandOutput, CommandSpec, RunError};
pub use service::{is_valid_service_name, ServiceAction, ServiceManager};

pub const ACCESS_DENIED: &str = "access denied";
pub const UNAVAILABLE: &str = "unavailable";

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub rss_kb: u64,
    pub user: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessDetail {
    #[serde(flatten)]
    pub info: ProcessInfo,
    pub cmdline: String,
    pub exe: String,
    pub cwd: String,
    pub threads: String,
    pub open_files: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiskUsage {
    pub filesystem: String,
    pub mount_point: String,
    pub total_bytes: Option<u64>,
    pub used_bytes: Option<u64>,
    pub available_bytes: Option<u64>,
    pub use_percent: Option<f32>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryInfo {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_bytes: u64,
    pub used_percent: f32,
    pub swap_total_bytes: u64,
    pub swap_free_bytes: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InterfaceInfo {
    pub name: String,
    pub family: Option<String>,
    pub address: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConnectionInfo {
    pub protocol: String,
    pub state: String,
    pub local: String,
    pub peer: String,
}

pub fn processes() -> io::Result<Vec<ProcessInfo>> {
    if cfg!(windows) {
        let stdout = capture("tasklist", &["/FO", "CSV", "/NH"])?;
        return Ok(parse_tasklist_output(&stdout));
    }
    let stdout = capture("ps", &["-eo", "pid=,ppid=,pcpu=,pmem=,rss=,user=,comm="])?;
    Ok(parse_ps_output(&stdout))
}

/// Looks up one process and reads its extended attributes. Attributes the OS
/// refuses to reveal degrade to a placeholder instead of failing the call.
pub fn process_detail(pid: u32) -> io::Result<Option<ProcessDetail>> {
    let Some(info) = processes()?.into_iter().find(|info| info.pid == pid) else {
        return Ok(None);
    };
    let proc_dir = Path::new("/proc").join(pid.to_string());
    let cmdline = proc_attr(&proc_dir, |dir| {
        let raw = fs::read(dir.join("cmdline"))?;
        Ok(String::from_utf8_lossy(&raw)
            .split('\0')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" "))
    });
    let exe = proc_attr(&proc_dir, |dir| {
        Ok(fs::read_link(dir.join("exe"))?.display().to_string())
    });
    let cwd = proc_attr(&proc_dir, |dir| {
        Ok(fs::read_link(dir.join("cwd"))?.display().to_string())
    });
    let threads = proc_attr(&proc_dir, |dir| {
        let status = fs::read_to_string(dir.join("status"))?;
        status
            .lines()
            .find_map(|line| line.strip_prefix("Threads:"))
            .map(|value| value.trim().to_string())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no Threads line"))
    });
    let open_files = proc_attr(&proc_dir, |dir| {
        Ok(fs::read_dir(dir.join("fd"))?.count().to_string())
    });
    Ok(Some(ProcessDetail {
        info,
        cmdline,
        exe,
        cwd,
        threads,
        open_files,
    }))
}

fn proc_attr(dir: &Path, read: impl FnOnce(&Path) -> io::Result<String>) -> String {
    if !cfg!(target_os = "linux") {
        return UNAVAILABLE.to_string();
    }
    match read(dir) {
        Ok(value) => value,
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => ACCESS_DENIED.to_string(),
        Err(_) => UNAVAILABLE.to_string(),
    }
}

#[cfg(unix)]
pub fn process_exists(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        return true;
    }
    matches!(
        io::Error::last_os_error().raw_os_error(),
        Some(code) if code == libc::EPERM
    )
}

#[cfg(windows)]
pub fn process_exists(pid: u32) -> bool {
    capture("tasklist", &["/FI", &format!("PID eq {pid}"), "/FO", "CSV", "/NH"])
        .map(|stdout| !parse_tasklist_output(&stdout).is_empty())
        .unwrap_or(false)
}

/// Asks a process to exit (SIGTERM on unix, `taskkill /F` on Windows).
#[cfg(unix)]
pub fn terminate(pid: u32) -> io::Result<()> {
    let pid = i32::try_from(pid)
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid pid"))?;
    let result = unsafe { libc::kill(pid, libc::SIGTERM) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(windows)]
pub fn terminate(pid: u32) -> io::Result<()> {
    let output = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .stdin(Stdio::null())
        .output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Other,
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
}

pub fn disks() -> io::Result<Vec<DiskUsage>> {
    if cfg!(windows) {
        return Ok(windows_drive_letters());
    }
    let stdout = capture("df", &["-kP"])?;
    Ok(parse_df_output(&stdout))
}

fn windows_drive_letters() -> Vec<DiskUsage> {
    (b'A'..=b'Z')
        .map(|letter| format!("{}:\\", letter as char))
        .filter(|root| Path::new(root).exists())
        .map(|root| DiskUsage {
            filesystem: root.clone(),
            mount_point: root,
            total_bytes: None,
            used_bytes: None,
            available_bytes: None,
            use_percent: None,
        })
        .collect()
}

pub fn memory() -> Option<MemoryInfo> {
    let meminfo = fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo(&meminfo)
}

pub fn load_average() -> Option<LoadAverage> {
    let raw = fs::read_to_string("/proc/loadavg").ok()?;
    let mut parts = raw.split_whitespace().map(|part| part.parse::<f64>().ok());
    Some(LoadAverage {
        one: parts.next()??,
        five: parts.next()??,
        fifteen: parts.next()??,
    })
}

pub fn uptime_secs() -> Option<u64> {
    let raw = fs::read_to_string("/proc/uptime").ok()?;
    let secs: f64 = raw.split_whitespace().next()?.parse().ok()?;
    Some(secs as u64)
}

pub fn hostname() -> String {
    if let Ok(name) = fs::read_to_string("/proc/sys/kernel/hostname") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    if let Ok(name) = std::env::var("COMPUTERNAME") {
        return name;
    }
    capture("hostname", &[])
        .map(|stdout| stdout.trim().to_string())
        .unwrap_or_else(|_| UNAVAILABLE.to_string())
}

pub fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
}

pub fn cpu_model() -> Option<String> {
    let cpuinfo = fs::read_to_string("/proc/cpuinfo").ok()?;
    cpuinfo.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == "model name").then(|| value.trim().to_string())
    })
}

/// Human-readable OS name: `PRETTY_NAME` from os-release when present.
pub fn os_description() -> String {
    fs::read_to_string("/etc/os-release")
        .ok()
        .and_then(|release| {
            release.lines().find_map(|line| {
                line.strip_prefix("PRETTY_NAME=")
                    .map(|value| value.trim_matches('"').to_string())
            })
        })
        .unwrap_or_else(|| std::env::consts::OS.to_string())
}

pub fn kernel_release() -> Option<String> {
    if cfg!(windows) {
        return None;
    }
    capture("uname", &["-r"])
        .ok()
        .map(|stdout| stdout.trim().to_string())
        .filter(|release| !release.is_empty())
}

pub fn interfaces() -> io::Result<Vec<InterfaceInfo>> {
    let mut interfaces = match capture("ip", &["-o", "addr", "show"]) {
        Ok(stdout) => parse_ip_addr_output(&stdout),
        Err(_) => sys_class_net_names()?
            .into_iter()
            .map(|name| InterfaceInfo {
                name,
                family: None,
                address: None,
                state: None,
            })
            .collect(),
    };
    for interface in &mut interfaces {
        if interface.state.is_none() {
            interface.state = fs::read_to_string(
                Path::new("/sys/class/net")
                    .join(&interface.name)
                    .join("operstate"),
            )
            .ok()
            .map(|state| state.trim().to_string());
        }
    }
    Ok(interfaces)
}

fn sys_class_net_names() -> io::Result<Vec<String>> {
    let mut names: Vec<String> = fs::read_dir("/sys/class/net")?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    Ok(names)
}

/// First `limit` non-listening TCP/UDP sockets.
pub fn connections(limit: usize) -> io::Result<Vec<ConnectionInfo>> {
    let mut connections = match capture("ss", &["-tun"]) {
        Ok(stdout) => parse_ss_output(&stdout),
        Err(_) => parse_netstat_output(&capture("netstat", &["-tun"])?),
    };
    connections.truncate(limit);
    Ok(connections)
}

fn capture(program: &str, args: &[&str]) -> io::Result<String> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()?;
    if !output.status.success() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("{program} exited with {}", output.status),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

pub fn parse_ps_output(stdout: &str) -> Vec<ProcessInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 7 {
                return None;
            }
            Some(ProcessInfo {
                pid: fields[0].parse().ok()?,
                ppid: fields[1].parse().ok()?,
                cpu_percent: fields[2].parse().unwrap_or(0.0),
                memory_percent: fields[3].parse().unwrap_or(0.0),
                rss_kb: fields[4].parse().unwrap_or(0),
                user: fields[5].to_string(),
                name: fields[6..].join(" "),
            })
        })
        .collect()
}

fn parse_tasklist_output(stdout: &str) -> Vec<ProcessInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let fields: Vec<String> = line
                .split("\",\"")
                .map(|field| field.trim_matches('"').to_string())
                .collect();
            if fields.len() < 5 {
                return None;
            }
            let rss_kb = fields[4]
                .chars()
                .filter(char::is_ascii_digit)
                .collect::<String>()
                .parse()
                .unwrap_or(0);
            Some(ProcessInfo {
                pid: fields[1].parse().ok()?,
                ppid: 0,
                cpu_percent: 0.0,
                memory_percent: 0.0,
                rss_kb,
                user: String::new(),
                name: fields[0].clone(),
            })
        })
        .collect()
}

pub fn parse_df_output(stdout: &str) -> Vec<DiskUsage> {
    stdout
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 6 {
                return None;
            }
            let total_kb: u64 = fields[1].parse().ok()?;
            if total_kb == 0 {
                return None;
            }
            let used_kb: u64 = fields[2].parse().ok()?;
            let available_kb: u64 = fields[3].parse().ok()?;
            Some(DiskUsage {
                filesystem: fields[0].to_string(),
                mount_point: fields[5..].join(" "),
                total_bytes: Some(total_kb * 1024),
                used_bytes: Some(used_kb * 1024),
                available_bytes: Some(available_kb * 1024),
                use_percent: fields[4].trim_end_matches('%').parse().ok(),
            })
        })
        .collect()
}

pub fn parse_meminfo(meminfo: &str) -> Option<MemoryInfo> {
    let field = |name: &str| -> Option<u64> {
        meminfo.lines().find_map(|line| {
            let rest = line.strip_prefix(name)?.strip_prefix(':')?;
            rest.split_whitespace().next()?.parse::<u64>().ok()
        })
    };
    let total = field("MemTotal")? * 1024;
    let available = field("MemAvailable").or_else(|| field("MemFree"))? * 1024;
    let used = total.saturating_sub(available);
    let used_percent = if total == 0 {
        0.0
    } else {
        (used as f64 / total as f64 * 100.0) as f32
    };
    Some(MemoryInfo {
        total_bytes: total,
        available_bytes: available,
        used_bytes: used,
        used_percent,
        swap_total_bytes: field("SwapTotal").unwrap_or(0) * 1024,
        swap_free_bytes: field("SwapFree").unwrap_or(0) * 1024,
    })
}

pub fn parse_ip_addr_output(stdout: &str) -> Vec<InterfaceInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            let name = fields[1].trim_end_matches(':');
            let name = name.split('@').next().unwrap_or(name);
            Some(InterfaceInfo {
                name: name.to_string(),
                family: Some(fields[2].to_string()),
                address: Some(fields[3].to_string()),
                state: None,
            })
        })
        .collect()
}

pub fn parse_ss_output(stdout: &str) -> Vec<ConnectionInfo> {
    stdout
        .lines()
        .filter(|line| !line.starts_with("Netid"))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 6 || fields[1] == "LISTEN" || fields[1] == "UNCONN" {
                return None;
            }
            Some(ConnectionInfo {
                protocol: fields[0].to_string(),
                state: fields[1].to_string(),
                local: fields[4].to_string(),
                peer: fields[5].to_string(),
            })
        })
        .collect()
}

pub fn parse_netstat_output(stdout: &str) -> Vec<ConnectionInfo> {
    stdout
        .lines()
        .filter(|line| line.starts_with("tcp") || line.starts_with("udp"))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 {
                return None;
            }
            let state = fields.get(5).copied().unwrap_or("-");
            if state == "LISTEN" {
                return None;
            }
            Some(ConnectionInfo {
                protocol: fields[0].to_string(),
                state: state.to_string(),
                local: fields[3].to_string(),
                peer: fields[4].to_string(),
            })
        })
        .collect()
}

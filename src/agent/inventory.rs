use std::path::Path;

use crate::config::ExecutionConfig;
use crate::fleet::{AgentDescriptor, PortDescriptor};

/// Serial-like devices under `dev_dir` matching the configured prefixes,
/// followed by the statically configured ports.
pub fn list_ports(config: &ExecutionConfig, dev_dir: &Path) -> Vec<PortDescriptor> {
    let mut ports: Vec<PortDescriptor> = std::fs::read_dir(dev_dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().into_string().ok())
                .filter(|name| config.port_prefixes.iter().any(|p| name.starts_with(p.as_str())))
                .map(|name| PortDescriptor {
                    device: dev_dir.join(&name).display().to_string(),
                    description: describe(&name),
                    hwid: read_hwid(&name),
                })
                .collect()
        })
        .unwrap_or_default();
    ports.sort_by(|a, b| a.device.cmp(&b.device));

    for port in &config.static_ports {
        if !ports.iter().any(|p| &p.device == port) {
            ports.push(PortDescriptor {
                device: port.clone(),
                description: "static".to_string(),
                hwid: String::new(),
            });
        }
    }
    ports
}

fn describe(name: &str) -> String {
    if name.starts_with("ttyUSB") {
        "USB serial".to_string()
    } else if name.starts_with("ttyACM") {
        "USB CDC ACM".to_string()
    } else {
        "serial".to_string()
    }
}

fn read_hwid(name: &str) -> String {
    let uevent = Path::new("/sys/class/tty").join(name).join("device/uevent");
    std::fs::read_to_string(uevent)
        .ok()
        .and_then(|text| {
            text.lines()
                .find_map(|l| l.strip_prefix("PRODUCT=").map(str::to_string))
        })
        .unwrap_or_default()
}

pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for buf.len() bytes and gethostname NUL-terminates on success.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc == 0 {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        if let Ok(name) = std::str::from_utf8(&buf[..end]) {
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

pub fn host_info(location: Option<&str>, running_runs: usize, total_runs: usize) -> AgentDescriptor {
    let hostname = hostname();
    AgentDescriptor {
        location: Some(
            location
                .map(str::to_string)
                .unwrap_or_else(|| format!("测试机 ({})", hostname)),
        ),
        hostname,
        platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
        running_runs,
        total_runs,
        extra: serde_json::Map::new(),
    }
}

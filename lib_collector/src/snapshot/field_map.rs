//! # Field Mapper
//!
//! Turns a snapshot body into the flat attribute map that is diffed against
//! the cached host. Pure: no I/O, no clock, only debug logging for attributes
//! the agent did not report.
//!
//! ## Core Design Principles:
//! - **Lenient Reads**: agents disagree on number-vs-string encodings, so every
//!   read goes through [`as_i64`] / [`value_to_string`] instead of strict serde types.
//! - **Integer Units**: disk is reported in GB and memory in MB, both truncated.

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::snapshot::decoder::{interface_addrs, interfaces, value_to_string};
use crate::storage::FieldMap;

const GB: i64 = 1024 * 1024 * 1024;
const MB: i64 = 1024 * 1024;

/// Host OS type codes used by the host registry.
pub mod os_type {
    /// Linux.
    pub const LINUX: &str = "1";
    /// Windows.
    pub const WINDOWS: &str = "2";
    /// AIX.
    pub const AIX: &str = "3";
    /// Generic UNIX.
    pub const UNIX: &str = "4";
    /// Solaris.
    pub const SOLARIS: &str = "5";
    /// HP-UX.
    pub const HPUX: &str = "6";
    /// FreeBSD.
    pub const FREEBSD: &str = "7";
    /// macOS.
    pub const MACOS: &str = "8";
}

/// Attributes the collector maintains on a host record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostAttributes {
    /// Total logical cores.
    pub bk_cpu: i64,
    /// Model name of the first CPU.
    pub bk_cpu_module: String,
    /// Clock of the first CPU in MHz.
    pub bk_cpu_mhz: i64,
    /// Total disk capacity in GB.
    pub bk_disk: i64,
    /// Total memory in MB.
    pub bk_mem: i64,
    /// OS type code, see [`os_type`].
    pub bk_os_type: String,
    /// Human OS name.
    pub bk_os_name: String,
    /// OS version with architecture suffixes removed.
    pub bk_os_version: String,
    /// Hostname.
    pub bk_host_name: String,
    /// MAC of the interface carrying the outer IP.
    pub bk_outer_mac: String,
    /// MAC of the interface carrying the inner IP.
    pub bk_mac: String,
    /// Bitness as reported (`64-bit`).
    pub bk_os_bit: String,
    /// Docker client version, empty when docker is absent.
    pub docker_client_version: String,
    /// Docker server version, empty when docker is absent.
    pub docker_server_version: String,
}

impl HostAttributes {
    /// Flattens into a [`FieldMap`] keyed by attribute name.
    pub fn into_field_map(self) -> FieldMap {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map.into_iter().collect(),
            _ => FieldMap::new(),
        }
    }
}

/// # Extract Attributes
///
/// ## Logic:
/// 1. CPU: sum `cores` over `data.cpu.cpuinfo[]`; model and MHz from the first entry.
/// 2. Disk/memory: sum `data.disk.usage[].total`, read `data.mem.meminfo.total`, scale down.
/// 3. OS: classify `data.system.info.os` and normalise name and version.
/// 4. MACs: the interface whose address equals the known inner (or outer) IP.
pub fn extract_attributes(body: &Value, inner_ip: &str, outer_ip: &str) -> HostAttributes {
    let cpus = array_at(body, "/data/cpu/cpuinfo");
    let cores: i64 = cpus.iter().map(|c| c.get("cores").map(as_i64).unwrap_or(0)).sum();
    let first_cpu = cpus.first();
    let cpu_module = first_cpu.and_then(|c| c.get("modelName")).map(value_to_string).unwrap_or_default();
    let cpu_mhz = first_cpu.and_then(|c| c.get("mhz")).map(as_i64).unwrap_or(0);

    let disk: i64 = array_at(body, "/data/disk/usage")
        .iter()
        .map(|d| d.get("total").map(as_i64).unwrap_or(0))
        .sum();
    let mem = int_at(body, "/data/mem/meminfo/total");

    let info = "/data/system/info";
    let (os_type, os_name, os_version) = classify_os(
        &string_at(body, &format!("{info}/os")),
        &string_at(body, &format!("{info}/platform")),
        &string_at(body, &format!("{info}/platformVersion")),
    );

    let (mut inner_mac, mut outer_mac) = (String::new(), String::new());
    for iface in interfaces(body) {
        let hwaddr = iface.get("hardwareaddr").map(value_to_string).unwrap_or_default();
        for addr in interface_addrs(iface) {
            if addr == inner_ip {
                inner_mac = hwaddr.clone();
            } else if !outer_ip.is_empty() && addr == outer_ip {
                outer_mac = hwaddr.clone();
            }
        }
    }

    let attrs = HostAttributes {
        bk_cpu: cores,
        bk_cpu_module: cpu_module,
        bk_cpu_mhz: cpu_mhz,
        bk_disk: disk / GB,
        bk_mem: mem / MB,
        bk_os_type: os_type,
        bk_os_name: os_name,
        bk_os_version: os_version,
        bk_host_name: string_at(body, &format!("{info}/hostname")),
        bk_outer_mac: outer_mac,
        bk_mac: inner_mac,
        bk_os_bit: string_at(body, &format!("{info}/systemtype")),
        docker_client_version: string_at(body, "/data/system/docker/Client/Version"),
        docker_server_version: string_at(body, "/data/system/docker/Server/Version"),
    };
    log_missing(&attrs, inner_ip, outer_ip);
    attrs
}

/// Maps the raw `os` string to `(type code, display name, version)`.
fn classify_os(os: &str, platform: &str, version: &str) -> (String, String, String) {
    let os = os.trim();
    let platform = platform.trim();
    let (code, name, version) = match os.to_lowercase().as_str() {
        "linux" => (
            os_type::LINUX.to_string(),
            format!("{os} {platform}"),
            version.replacen(".x86_64", "", 1).replacen(".i386", "", 1),
        ),
        "windows" => (
            os_type::WINDOWS.to_string(),
            platform.replacen("Microsoft ", "", 1),
            version.replacen("Microsoft ", "", 1),
        ),
        "aix" => (os_type::AIX.to_string(), platform.to_string(), version.to_string()),
        "unix" => (os_type::UNIX.to_string(), platform.to_string(), version.to_string()),
        "solaris" => (os_type::SOLARIS.to_string(), platform.to_string(), version.to_string()),
        "hp-ux" => (os_type::HPUX.to_string(), platform.to_string(), version.to_string()),
        "freebsd" => (os_type::FREEBSD.to_string(), platform.to_string(), version.to_string()),
        "macos" | "darwin" => (os_type::MACOS.to_string(), platform.to_string(), version.to_string()),
        _ => (os.to_string(), platform.to_string(), version.to_string()),
    };
    (code, name.trim().to_string(), version.trim().to_string())
}

fn log_missing(attrs: &HostAttributes, inner_ip: &str, outer_ip: &str) {
    let missing = [
        ("bk_cpu", attrs.bk_cpu <= 0),
        ("bk_cpu_module", attrs.bk_cpu_module.is_empty()),
        ("bk_cpu_mhz", attrs.bk_cpu_mhz <= 0),
        ("bk_disk", attrs.bk_disk <= 0),
        ("bk_mem", attrs.bk_mem <= 0),
        ("bk_os_type", attrs.bk_os_type.is_empty()),
        ("bk_os_name", attrs.bk_os_name.is_empty()),
        ("bk_os_version", attrs.bk_os_version.is_empty()),
        ("bk_host_name", attrs.bk_host_name.is_empty()),
        ("bk_outer_mac", !outer_ip.is_empty() && attrs.bk_outer_mac.is_empty()),
        ("bk_mac", attrs.bk_mac.is_empty()),
    ];
    for (field, absent) in missing {
        if absent {
            debug!(field, inner_ip, "attribute not found in snapshot");
        }
    }
}

fn array_at<'a>(body: &'a Value, pointer: &str) -> &'a [Value] {
    body.pointer(pointer)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn string_at(body: &Value, pointer: &str) -> String {
    body.pointer(pointer).map(value_to_string).unwrap_or_default()
}

fn int_at(body: &Value, pointer: &str) -> i64 {
    body.pointer(pointer).map(as_i64).unwrap_or(0)
}

/// Integer view of a loosely typed scalar; floats truncate, junk reads as 0.
pub(crate) fn as_i64(v: &Value) -> i64 {
    match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().map(|u| i64::try_from(u).unwrap_or(i64::MAX)))
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
                .unwrap_or(0)
        }
        Value::Bool(b) => i64::from(*b),
        _ => 0,
    }
}

/// Compares a freshly extracted value with a stored one, treating numbers by
/// value so that `4` and `4.0` (as some stores return them) are equal.
pub fn values_equal(fresh: &Value, stored: &Value) -> bool {
    match (fresh, stored) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => a.as_f64() == b.as_f64(),
        },
        _ => fresh == stored,
    }
}

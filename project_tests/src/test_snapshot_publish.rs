//! # Snapshot Publish Test
//!
//! Publishes synthetic host snapshots onto the snapshot channel so a running
//! collector can be watched resolving and updating a known host.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use lib_collector::connections::RedisChannel;
use lib_collector::snapshot::encode_envelope;
use serde_json::json;

/// Command line options.
#[derive(Parser, Debug)]
#[command(author, version, about = "Publish synthetic host snapshots")]
struct Args {
    /// Redis carrying the snapshot channel.
    #[arg(long, env = "SNAP_REDIS_URL", default_value = "redis://127.0.0.1:6379/")]
    url: String,
    /// Channel to publish on.
    #[arg(long, default_value = "2_snapshot")]
    channel: String,
    /// Inner IP the snapshot reports.
    #[arg(long, default_value = "192.168.1.7")]
    ip: String,
    /// Cloud id the snapshot reports.
    #[arg(long, default_value_t = 0)]
    cloud_id: i64,
    /// Memory total in bytes.
    #[arg(long, default_value_t = 1_044_832_256)]
    mem_total: u64,
    /// Number of snapshots to publish.
    #[arg(long, default_value_t = 1)]
    count: u32,
    /// Pause between snapshots.
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,
}

/// Builds one agent-style snapshot wrapped in its `data` envelope.
fn snapshot(args: &Args, seq: u32) -> String {
    encode_envelope(&json!({
        "ip": args.ip,
        "cloudid": args.cloud_id,
        "bizid": 0,
        "data": {
            "timezone": 8,
            "cpu": { "cpuinfo": [ { "cores": 1, "modelName": "Intel(R) Xeon(R) CPU E5-26xx v4", "mhz": "2394.446" } ] },
            "disk": { "usage": [ { "path": "/", "total": 52709421056u64 } ] },
            "mem": { "meminfo": { "total": args.mem_total } },
            "net": {
                "interface": [
                    { "hardwareaddr": "52:54:00:19:2e:e8", "addrs": [ { "addr": format!("{}/24", args.ip) } ] }
                ]
            },
            "system": {
                "info": {
                    "hostname": format!("snapshot-test-{seq}"),
                    "os": "linux",
                    "platform": "centos",
                    "platformVersion": "7.2.1511",
                    "systemtype": "64-bit"
                }
            }
        }
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let channel = RedisChannel::connect(&args.url)
        .await
        .context("failed to connect the snapshot redis")?;

    println!("[*] Publishing {} snapshot(s) for {} on {}", args.count, args.ip, args.channel);
    for seq in 0..args.count {
        let receivers = channel
            .publish(&args.channel, &snapshot(&args, seq))
            .await
            .context("publish failed")?;
        println!("[INFO] snapshot {seq} delivered to {receivers} subscriber(s)");
        if seq + 1 < args.count {
            tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
        }
    }

    println!("[SUCCESS] done");
    Ok(())
}

//! Remote host telemetry.
//!
//! One probe command batches CPU, memory, disk, and network reads into a
//! single channel open; marker lines split the output back into sections.
//! Each section parses independently, so a host missing one data source
//! still reports the rest. Rates are computed from counter deltas and are
//! never negative.

use crate::error::{AppError, AppResult};
use crate::ssh::connection::{Connection, ConnectionStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Consecutive probe failures before the collector gives up
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Timeout for a single probe command
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

const CPU_MARKER: &str = "---SEAMUX_CPU---";
const MEM_MARKER: &str = "---SEAMUX_MEM---";
const DISK_MARKER: &str = "---SEAMUX_DISK---";
const NET_MARKER: &str = "---SEAMUX_NET---";

/// The batched probe. Sections that fail on the host print nothing after
/// their marker; the parser treats that as a missing section.
pub(crate) fn probe_command() -> String {
    format!(
        "echo '{cpu}'; head -n1 /proc/stat 2>/dev/null; \
         echo '{mem}'; grep -E '^Mem(Total|Available|Free):' /proc/meminfo 2>/dev/null; \
         echo '{disk}'; df -P / 2>/dev/null | tail -n1; \
         echo '{net}'; cat /proc/net/dev 2>/dev/null | tail -n +3",
        cpu = CPU_MARKER,
        mem = MEM_MARKER,
        disk = DISK_MARKER,
        net = NET_MARKER,
    )
}

/// Latest telemetry of one connection
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    /// CPU utilization percent, 0-100
    pub cpu: f32,
    /// Memory utilization percent, 0-100
    pub memory: f32,
    /// Root filesystem utilization percent, 0-100
    pub disk: f32,
    /// Upload rate in bytes per second
    pub network_up: f64,
    /// Download rate in bytes per second
    pub network_down: f64,
    pub last_update: Option<DateTime<Utc>>,
}

/// Raw counters carried between probes for rate computation
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NetworkHistory {
    pub last_network_up: u64,
    pub last_network_down: u64,
    pub last_update_time: Option<DateTime<Utc>>,
}

/// Aggregate CPU jiffies from one /proc/stat line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CpuCounters {
    pub busy: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NetCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// One probe's worth of parsed sections. A `None` section failed to parse
/// and leaves the previous value in place.
#[derive(Debug, Clone, Default)]
pub(crate) struct ProbeSample {
    pub cpu: Option<CpuCounters>,
    pub memory: Option<f32>,
    pub disk: Option<f32>,
    pub network: Option<NetCounters>,
}

impl ProbeSample {
    fn is_empty(&self) -> bool {
        self.cpu.is_none()
            && self.memory.is_none()
            && self.disk.is_none()
            && self.network.is_none()
    }
}

#[derive(Debug, Default)]
struct MemCounters {
    total: Option<u64>,
    available: Option<u64>,
    free: Option<u64>,
}

/// Split marker-delimited probe output and parse each section independently
pub(crate) fn parse_probe(output: &str) -> ProbeSample {
    let mut sample = ProbeSample::default();
    let mut mem = MemCounters::default();
    let mut section = None;

    for line in output.lines() {
        let line = line.trim();
        match line {
            CPU_MARKER => section = Some(CPU_MARKER),
            MEM_MARKER => section = Some(MEM_MARKER),
            DISK_MARKER => section = Some(DISK_MARKER),
            NET_MARKER => section = Some(NET_MARKER),
            "" => {}
            _ => match section {
                Some(CPU_MARKER) => {
                    if sample.cpu.is_none() {
                        sample.cpu = parse_cpu_line(line);
                    }
                }
                Some(MEM_MARKER) => {
                    if let Some((key, kib)) = parse_meminfo_line(line) {
                        match key {
                            "MemTotal" => mem.total = Some(kib),
                            "MemAvailable" => mem.available = Some(kib),
                            "MemFree" => mem.free = Some(kib),
                            _ => {}
                        }
                    }
                }
                Some(DISK_MARKER) => {
                    if sample.disk.is_none() {
                        sample.disk = parse_disk_line(line);
                    }
                }
                Some(NET_MARKER) => {
                    // interfaces accumulate across lines
                    if let Some(iface) = parse_net_line(line) {
                        let acc = sample.network.get_or_insert(NetCounters {
                            rx_bytes: 0,
                            tx_bytes: 0,
                        });
                        acc.rx_bytes = acc.rx_bytes.saturating_add(iface.rx_bytes);
                        acc.tx_bytes = acc.tx_bytes.saturating_add(iface.tx_bytes);
                    }
                }
                _ => {}
            },
        }
    }

    // MemAvailable is the honest figure; kernels predating it fall back
    // to MemFree
    if let Some(total) = mem.total.filter(|&t| t > 0) {
        if let Some(avail) = mem.available.or(mem.free) {
            let used = total.saturating_sub(avail);
            sample.memory = Some((used as f64 / total as f64 * 100.0) as f32);
        }
    }

    sample
}

/// "cpu  user nice system idle iowait irq softirq steal ..."
fn parse_cpu_line(line: &str) -> Option<CpuCounters> {
    let mut parts = line.split_whitespace();
    if parts.next()? != "cpu" {
        return None;
    }
    let fields: Vec<u64> = parts.filter_map(|p| p.parse().ok()).collect();
    if fields.len() < 4 {
        return None;
    }

    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let total: u64 = fields.iter().sum();
    Some(CpuCounters {
        busy: total.saturating_sub(idle),
        total,
    })
}

/// "MemTotal:       16314480 kB"
fn parse_meminfo_line(line: &str) -> Option<(&str, u64)> {
    let (key, rest) = line.split_once(':')?;
    let value = rest.split_whitespace().next()?.parse().ok()?;
    Some((key.trim(), value))
}

/// "/dev/sda1 blocks used available capacity% mount" (df -P)
fn parse_disk_line(line: &str) -> Option<f32> {
    line.split_whitespace()
        .find(|p| p.ends_with('%'))
        .and_then(|p| p.trim_end_matches('%').parse::<f32>().ok())
}

/// "eth0: rx_bytes packets errs drop fifo frame compressed multicast tx_bytes ..."
fn parse_net_line(line: &str) -> Option<NetCounters> {
    let (iface, rest) = line.split_once(':')?;
    let iface = iface.trim();
    if iface == "lo" {
        return None;
    }
    let fields: Vec<u64> = rest
        .split_whitespace()
        .filter_map(|p| p.parse().ok())
        .collect();
    if fields.len() < 9 {
        return None;
    }
    Some(NetCounters {
        rx_bytes: fields[0],
        tx_bytes: fields[8],
    })
}

/// Turns successive probe samples into [`SystemInfo`] snapshots.
///
/// Holds the previous CPU and network counters; a counter that moved
/// backwards (reboot, counter wrap) yields a zero rate, never a negative
/// one.
#[derive(Debug, Default)]
pub(crate) struct TelemetryComputer {
    prev_cpu: Option<CpuCounters>,
    history: NetworkHistory,
    last_info: SystemInfo,
}

impl TelemetryComputer {
    pub fn apply(&mut self, sample: &ProbeSample, now: DateTime<Utc>) -> (SystemInfo, NetworkHistory) {
        let mut info = self.last_info.clone();

        if let Some(cpu) = sample.cpu {
            if let Some(prev) = self.prev_cpu {
                let busy = cpu.busy.saturating_sub(prev.busy);
                let total = cpu.total.saturating_sub(prev.total);
                if total > 0 {
                    info.cpu = (busy as f64 / total as f64 * 100.0).clamp(0.0, 100.0) as f32;
                }
            }
            self.prev_cpu = Some(cpu);
        }

        if let Some(memory) = sample.memory {
            info.memory = memory.clamp(0.0, 100.0);
        }
        if let Some(disk) = sample.disk {
            info.disk = disk.clamp(0.0, 100.0);
        }

        if let Some(net) = sample.network {
            if let Some(prev_time) = self.history.last_update_time {
                let elapsed = (now - prev_time).num_milliseconds() as f64 / 1000.0;
                if elapsed > 0.0 {
                    info.network_up = net.tx_bytes.saturating_sub(self.history.last_network_up)
                        as f64
                        / elapsed;
                    info.network_down = net
                        .rx_bytes
                        .saturating_sub(self.history.last_network_down)
                        as f64
                        / elapsed;
                }
            }
            self.history = NetworkHistory {
                last_network_up: net.tx_bytes,
                last_network_down: net.rx_bytes,
                last_update_time: Some(now),
            };
        }

        info.last_update = Some(now);
        self.last_info = info.clone();
        (info, self.history)
    }
}

/// Handle used to stop a running collector
pub struct MonitorHandle {
    stop_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl MonitorHandle {
    pub async fn stop(self) {
        let _ = self.stop_tx.send(()).await;
        let _ = self.task.await;
    }
}

/// Spawn a collector loop driven by an injected probe executor.
///
/// Every interval the executor runs the probe command and returns its
/// stdout; parsed samples are applied and published through `publish`.
/// The loop stops on the handle, after too many consecutive failures, or
/// when the executor reports the connection gone.
pub(crate) fn start_collector<E, EFut, P>(
    interval: Duration,
    execute: E,
    mut publish: P,
) -> MonitorHandle
where
    E: Fn(String) -> EFut + Send + Sync + 'static,
    EFut: Future<Output = AppResult<String>> + Send,
    P: FnMut(SystemInfo, NetworkHistory) + Send + 'static,
{
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

    let task = tokio::spawn(async move {
        let mut computer = TelemetryComputer::default();
        let mut failures: u32 = 0;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    tracing::debug!("Telemetry collector stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match execute(probe_command()).await {
                        Ok(output) => {
                            let sample = parse_probe(&output);
                            if sample.is_empty() {
                                failures += 1;
                                tracing::debug!("Probe returned no parsable sections ({}/{})",
                                    failures, MAX_CONSECUTIVE_FAILURES);
                            } else {
                                failures = 0;
                                let (info, history) = computer.apply(&sample, Utc::now());
                                publish(info, history);
                            }
                        }
                        Err(AppError::NotConnected(_)) => {
                            tracing::debug!("Connection gone, telemetry collector exiting");
                            break;
                        }
                        Err(e) => {
                            failures += 1;
                            tracing::debug!("Probe failed ({}/{}): {}",
                                failures, MAX_CONSECUTIVE_FAILURES, e);
                        }
                    }

                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        tracing::warn!("Telemetry collector giving up after {} failures", failures);
                        break;
                    }
                }
            }
        }
    });

    MonitorHandle { stop_tx, task }
}

/// Start telemetry collection for a live connection. Snapshots land on the
/// connection handle; the collector exits on its own once the connection
/// leaves the connected state.
pub fn start_for_connection(conn: Arc<Connection>, interval: Duration) -> MonitorHandle {
    let exec_conn = Arc::clone(&conn);
    start_collector(
        interval,
        move |cmd| {
            let conn = Arc::clone(&exec_conn);
            async move {
                if conn.status() != ConnectionStatus::Connected {
                    return Err(AppError::NotConnected(conn.id.clone()));
                }
                let output = conn.exec(&cmd, PROBE_TIMEOUT).await?;
                Ok(output.stdout)
            }
        },
        move |info, history| {
            conn.set_telemetry(info, history);
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn probe_output(cpu: &str, mem: &str, disk: &str, net: &str) -> String {
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n",
            CPU_MARKER, cpu, MEM_MARKER, mem, DISK_MARKER, disk, NET_MARKER, net
        )
    }

    #[test]
    fn test_parse_full_probe() {
        let output = probe_output(
            "cpu  100 0 50 800 50 0 0 0 0 0",
            "MemTotal: 1000000 kB\nMemAvailable: 600000 kB\nMemFree: 100000 kB",
            "/dev/sda1 100000 42000 58000 42% /",
            "eth0: 5000 10 0 0 0 0 0 0 3000 8 0 0 0 0 0 0",
        );
        let sample = parse_probe(&output);

        let cpu = sample.cpu.unwrap();
        assert_eq!(cpu.total, 1000);
        assert_eq!(cpu.busy, 150); // idle + iowait excluded
        assert!((sample.memory.unwrap() - 40.0).abs() < 0.01);
        assert!((sample.disk.unwrap() - 42.0).abs() < 0.01);
        let net = sample.network.unwrap();
        assert_eq!(net.rx_bytes, 5000);
        assert_eq!(net.tx_bytes, 3000);
    }

    #[test]
    fn test_sections_parse_independently() {
        // Disk section produced garbage; everything else still lands
        let output = probe_output(
            "cpu  100 0 50 800 50 0 0 0",
            "MemTotal: 1000000 kB\nMemAvailable: 600000 kB",
            "df: command not found",
            "eth0: 5000 10 0 0 0 0 0 0 3000 8 0 0 0 0 0 0",
        );
        let sample = parse_probe(&output);
        assert!(sample.cpu.is_some());
        assert!(sample.memory.is_some());
        assert!(sample.disk.is_none());
        assert!(sample.network.is_some());
    }

    #[test]
    fn test_memory_falls_back_to_memfree() {
        let output = format!(
            "{}\nMemTotal: 1000000 kB\nMemFree: 250000 kB\n",
            MEM_MARKER
        );
        let sample = parse_probe(&output);
        assert!((sample.memory.unwrap() - 75.0).abs() < 0.01);

        // total alone is not enough to report anything
        let partial = format!("{}\nMemTotal: 1000000 kB\n", MEM_MARKER);
        assert!(parse_probe(&partial).memory.is_none());
    }

    #[test]
    fn test_net_sums_interfaces_and_skips_loopback() {
        let output = format!(
            "{}\nlo: 999 0 0 0 0 0 0 0 999 0 0 0 0 0 0 0\n\
             eth0: 100 1 0 0 0 0 0 0 200 1 0 0 0 0 0 0\n\
             wlan0: 50 1 0 0 0 0 0 0 25 1 0 0 0 0 0 0\n",
            NET_MARKER
        );
        let sample = parse_probe(&output);
        let net = sample.network.unwrap();
        assert_eq!(net.rx_bytes, 150);
        assert_eq!(net.tx_bytes, 225);
    }

    #[test]
    fn test_empty_output_is_empty_sample() {
        assert!(parse_probe("").is_empty());
        assert!(parse_probe("bash: not found\n").is_empty());
    }

    #[test]
    fn test_cpu_rate_from_deltas() {
        let mut computer = TelemetryComputer::default();
        let t0 = Utc::now();

        let first = ProbeSample {
            cpu: Some(CpuCounters { busy: 100, total: 1000 }),
            ..Default::default()
        };
        let (info, _) = computer.apply(&first, t0);
        // first sample has no delta to rate against
        assert_eq!(info.cpu, 0.0);

        let second = ProbeSample {
            cpu: Some(CpuCounters { busy: 150, total: 1100 }),
            ..Default::default()
        };
        let (info, _) = computer.apply(&second, t0 + chrono::Duration::seconds(5));
        assert!((info.cpu - 50.0).abs() < 0.01);
    }

    #[test]
    fn test_network_rates_and_counter_reset() {
        let mut computer = TelemetryComputer::default();
        let t0 = Utc::now();

        let first = ProbeSample {
            network: Some(NetCounters { rx_bytes: 10_000, tx_bytes: 5_000 }),
            ..Default::default()
        };
        let (info, history) = computer.apply(&first, t0);
        assert_eq!(info.network_down, 0.0);
        assert_eq!(history.last_network_down, 10_000);

        let second = ProbeSample {
            network: Some(NetCounters { rx_bytes: 30_000, tx_bytes: 9_000 }),
            ..Default::default()
        };
        let (info, _) = computer.apply(&second, t0 + chrono::Duration::seconds(2));
        assert!((info.network_down - 10_000.0).abs() < 1.0);
        assert!((info.network_up - 2_000.0).abs() < 1.0);

        // counters moved backwards (host rebooted); rate clamps to zero
        let third = ProbeSample {
            network: Some(NetCounters { rx_bytes: 100, tx_bytes: 50 }),
            ..Default::default()
        };
        let (info, history) = computer.apply(&third, t0 + chrono::Duration::seconds(4));
        assert_eq!(info.network_down, 0.0);
        assert_eq!(info.network_up, 0.0);
        assert_eq!(history.last_network_down, 100);
    }

    #[test]
    fn test_failed_section_keeps_previous_value() {
        let mut computer = TelemetryComputer::default();
        let t0 = Utc::now();

        let full = ProbeSample {
            memory: Some(40.0),
            disk: Some(60.0),
            ..Default::default()
        };
        computer.apply(&full, t0);

        let partial = ProbeSample {
            memory: Some(45.0),
            ..Default::default()
        };
        let (info, _) = computer.apply(&partial, t0 + chrono::Duration::seconds(5));
        assert!((info.memory - 45.0).abs() < 0.01);
        assert!((info.disk - 60.0).abs() < 0.01); // held from last probe
    }

    #[tokio::test(start_paused = true)]
    async fn test_collector_publishes_and_stops() {
        let published = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&published);

        let handle = start_collector(
            Duration::from_secs(1),
            |_cmd| async move {
                Ok(format!(
                    "{}\nMemTotal: 1000 kB\nMemAvailable: 500 kB\n",
                    MEM_MARKER
                ))
            },
            move |info, _| sink.lock().unwrap().push(info),
        );

        tokio::time::sleep(Duration::from_millis(3500)).await;
        handle.stop().await;

        let seen = published.lock().unwrap();
        assert!(!seen.is_empty());
        assert!((seen[0].memory - 50.0).abs() < 0.01);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collector_gives_up_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let handle = start_collector(
            Duration::from_secs(1),
            move |_cmd| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::Timeout("probe".into()))
                }
            },
            |_, _| {},
        );

        tokio::time::sleep(Duration::from_secs(10)).await;
        // loop exited on its own after the failure cutoff
        assert_eq!(calls.load(Ordering::SeqCst), MAX_CONSECUTIVE_FAILURES);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_collector_exits_when_disconnected() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let handle = start_collector(
            Duration::from_secs(1),
            move |_cmd| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::NotConnected("c1".into()))
                }
            },
            |_, _| {},
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        handle.stop().await;
    }
}

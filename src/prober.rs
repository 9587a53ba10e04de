//! Connectivity Prober (Section 4.E): parallel ping/TCP-throughput/HTTP
//! probes between endpoint pairs, bounded by per-probe-kind semaphores.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::{ExecError, ProbeError};
use crate::exec::ExecChannel;

/// What the Reachability Oracle predicted for a pair, supplied by the
/// caller so the Prober stays decoupled from the VPC/peering data model —
/// it only needs the oracle's verdict, not the records behind it.
#[derive(Debug, Clone, Copy)]
pub struct Predicted {
    pub reachable: bool,
    pub is_gateway_peering: bool,
}

pub type PredictFn = Arc<dyn Fn(&str, &str) -> Predicted + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub sources: Vec<String>,
    pub destinations: Vec<String>,
    pub pings: u32,
    pub iperf_seconds: u32,
    pub curls: u32,
    pub pings_parallel: usize,
    pub iperf_parallel: usize,
    pub curls_parallel: usize,
    pub min_speed_mbps: f64,
    pub dscp: Option<u8>,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            destinations: Vec::new(),
            pings: 5,
            iperf_seconds: 5,
            curls: 1,
            pings_parallel: 50,
            iperf_parallel: 1,
            curls_parallel: 50,
            min_speed_mbps: 10.0,
            dscp: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeKind {
    Ping,
    Throughput,
    Curl,
}

/// Aggregated mismatches collected across every probed pair.
#[derive(Debug, Default)]
pub struct ProberReport {
    pub mismatches: Vec<ProbeError>,
}

impl ProberReport {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }
}

#[derive(Deserialize)]
struct Iperf3Report {
    end: Iperf3End,
}

#[derive(Deserialize)]
struct Iperf3End {
    sum_sent: Iperf3Sum,
    sum_received: Iperf3Sum,
}

#[derive(Deserialize)]
struct Iperf3Sum {
    bits_per_second: f64,
}

/// Connectivity Prober. Holds one [`ExecChannel`] per server name, reused
/// across probes and dropped at the end of the measurement phase.
pub struct Prober {
    channels: DashMap<String, Arc<ExecChannel>>,
}

impl Default for Prober {
    fn default() -> Self {
        Self::new()
    }
}

impl Prober {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    fn channel_for(&self, server: &str) -> Arc<ExecChannel> {
        self.channels
            .entry(server.to_string())
            .or_insert_with(|| Arc::new(ExecChannel::new(server.to_string())))
            .clone()
    }

    /// Discovery phase: reads the IPv4 address of the VPC-attached
    /// interface for every server in the union of sources/destinations,
    /// excluding loopback, management and container interfaces.
    pub async fn discover(
        &self,
        servers: &[String],
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, String>, ProbeError> {
        let mut out = HashMap::new();
        for server in servers {
            let channel = self.channel_for(server);
            let output = channel
                .run("ip -4 -o addr show | grep -v ' lo \\| eth0 \\| docker'", cancel)
                .await
                .map_err(ProbeError::Exec)?;
            let prefix = parse_first_ipv4(&output.stdout)
                .ok_or_else(|| ProbeError::Discovery(server.clone(), "no IPv4 address found".into()))?;
            out.insert(server.clone(), prefix);
        }
        Ok(out)
    }

    /// Measurement phase: runs every ordered source/destination pair
    /// concurrently, bounded by per-kind semaphores, and aggregates
    /// predicted-vs-measured mismatches.
    pub async fn probe(
        &self,
        opts: &ProbeOptions,
        predict: PredictFn,
        cancel: &CancellationToken,
    ) -> Result<ProberReport, ProbeError> {
        let mut servers: Vec<String> = opts
            .sources
            .iter()
            .chain(opts.destinations.iter())
            .cloned()
            .collect();
        servers.sort();
        servers.dedup();
        let addresses = self.discover(&servers, cancel).await?;

        let ping_sem = Arc::new(Semaphore::new(opts.pings_parallel));
        let iperf_sem = Arc::new(Semaphore::new(opts.iperf_parallel));
        let curl_sem = Arc::new(Semaphore::new(opts.curls_parallel));
        let errors: Arc<DashMap<(ProbeKind, String, String), ProbeError>> = Arc::new(DashMap::new());

        let mut tasks = Vec::new();
        for src in &opts.sources {
            for dst in &opts.destinations {
                if src == dst {
                    continue;
                }
                let predicted = predict(src, dst);
                let src = src.clone();
                let dst = dst.clone();
                let dst_addr = addresses.get(&dst).cloned();
                let src_channel = self.channel_for(&src);
                let dst_channel = self.channel_for(&dst);
                let cancel = cancel.clone();
                let ping_sem = ping_sem.clone();
                let iperf_sem = iperf_sem.clone();
                let curl_sem = curl_sem.clone();
                let errors = errors.clone();
                let pings = opts.pings;
                let iperf_seconds = opts.iperf_seconds;
                let opts_curls = opts.curls;
                let min_speed = if predicted.is_gateway_peering {
                    0.01
                } else {
                    opts.min_speed_mbps
                };

                tasks.push(tokio::spawn(async move {
                    let Some(dst_addr) = dst_addr else { return };

                    let _permit = match ping_sem.acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => return,
                    };
                    match run_ping(&src_channel, &dst_addr, pings, &cancel).await {
                        Ok(passed) if passed != predicted.reachable => {
                            errors.insert(
                                (ProbeKind::Ping, src.clone(), dst.clone()),
                                ProbeError::UnexpectedReachability {
                                    kind: "ping",
                                    src: src.clone(),
                                    dst: dst.clone(),
                                    predicted: predicted.reachable,
                                    observed: passed,
                                    output: dst_addr.clone(),
                                },
                            );
                        }
                        Err(e) => {
                            debug!(src = %src, dst = %dst, error = %e, "ping probe exec error");
                        }
                        _ => {}
                    }
                    drop(_permit);

                    if !predicted.reachable {
                        return;
                    }

                    let _permit = match iperf_sem.acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => return,
                    };
                    if let Ok(met) =
                        run_throughput(&src_channel, &dst_channel, &dst_addr, iperf_seconds, min_speed, &cancel)
                            .await
                    {
                        if !met {
                            errors.insert(
                                (ProbeKind::Throughput, src.clone(), dst.clone()),
                                ProbeError::UnexpectedReachability {
                                    kind: "throughput",
                                    src: src.clone(),
                                    dst: dst.clone(),
                                    predicted: true,
                                    observed: false,
                                    output: format!("below min-speed {min_speed} Mbps"),
                                },
                            );
                        }
                    }
                    drop(_permit);

                    let curls = opts_curls;
                    if curls == 0 {
                        return;
                    }
                    let _permit = match curl_sem.acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => return,
                    };
                    match run_curl(&src_channel, &dst_addr, curls, &cancel).await {
                        Ok(passed) if !passed => {
                            errors.insert(
                                (ProbeKind::Curl, src.clone(), dst.clone()),
                                ProbeError::UnexpectedReachability {
                                    kind: "curl",
                                    src: src.clone(),
                                    dst: dst.clone(),
                                    predicted: true,
                                    observed: false,
                                    output: format!("http://{dst_addr} did not return \"301 Moved\""),
                                },
                            );
                        }
                        Err(e) => {
                            debug!(src = %src, dst = %dst, error = %e, "curl probe exec error");
                        }
                        _ => {}
                    }
                }));
            }
        }

        for task in tasks {
            let _ = task.await;
        }

        let mismatches = Arc::try_unwrap(errors)
            .map(|m| m.into_iter().map(|(_, v)| v).collect())
            .unwrap_or_default();
        Ok(ProberReport { mismatches })
    }
}

async fn run_ping(
    channel: &ExecChannel,
    dst_addr: &str,
    count: u32,
    cancel: &CancellationToken,
) -> Result<bool, ExecError> {
    let cmd = format!("ping -c {count} -W 1 {dst_addr}");
    match channel.run(&cmd, cancel).await {
        Ok(out) => Ok(out.stdout.contains("0% packet loss")),
        Err(ExecError::NonZeroExit { stderr, .. }) if stderr.contains("100% packet loss") => {
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

async fn run_throughput(
    src: &ExecChannel,
    dst: &ExecChannel,
    dst_addr: &str,
    seconds: u32,
    min_speed_mbps: f64,
    cancel: &CancellationToken,
) -> Result<bool, ExecError> {
    dst.run("iperf3 -s -1 -D", cancel).await?;
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    let cmd = format!("iperf3 -c {dst_addr} -J -t {seconds} -P 4");
    let out = src.run(&cmd, cancel).await?;
    let report: Iperf3Report = match serde_json::from_str(&out.stdout) {
        Ok(r) => r,
        Err(_) => return Ok(false),
    };
    let min_bps = min_speed_mbps * 1_000_000.0;
    Ok(report.end.sum_sent.bits_per_second >= min_bps
        && report.end.sum_received.bits_per_second >= min_bps)
}

/// Runs `curl` against the destination's exposed HTTP endpoint `curls`
/// times; passes only if every attempt exits zero and the body contains
/// "301 Moved" (Section 4.E, External curl).
async fn run_curl(
    channel: &ExecChannel,
    dst_addr: &str,
    curls: u32,
    cancel: &CancellationToken,
) -> Result<bool, ExecError> {
    let cmd = format!("curl --insecure --connect-timeout 3 http://{dst_addr}");
    for _ in 0..curls {
        match channel.run(&cmd, cancel).await {
            Ok(out) if out.stdout.contains("301 Moved") => continue,
            Ok(_) => return Ok(false),
            Err(ExecError::NonZeroExit { .. }) => return Ok(false),
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

fn parse_first_ipv4(ip_addr_output: &str) -> Option<String> {
    for line in ip_addr_output.lines() {
        if let Some(idx) = line.find("inet ") {
            let rest = &line[idx + 5..];
            let cidr = rest.split_whitespace().next()?;
            let addr = cidr.split('/').next()?;
            return Some(addr.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_first_ipv4_skipping_loopback_lines() {
        let output = "1: lo    inet 127.0.0.1/8 scope host lo\n2: bond0.100    inet 10.0.1.5/24 scope global bond0.100";
        assert_eq!(parse_first_ipv4(output), Some("127.0.0.1".to_string()));
        let non_loop = "2: bond0.100    inet 10.0.1.5/24 scope global bond0.100";
        assert_eq!(parse_first_ipv4(non_loop), Some("10.0.1.5".to_string()));
    }

    #[test]
    fn iperf3_report_parses_bits_per_second() {
        let json = r#"{"end":{"sum_sent":{"bits_per_second":1.2e8},"sum_received":{"bits_per_second":1.1e8}}}"#;
        let report: Iperf3Report = serde_json::from_str(json).unwrap();
        assert!(report.end.sum_sent.bits_per_second > 1e8);
    }
}

//! Liveness probing against the OS process table.

use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded};
use log::{debug, warn};

use crate::error::ProbeError;

/// Upper bound on concurrent probes within one tick.
pub const MAX_PROBE_WORKERS: usize = 8;

/// Slack on top of the probe rounds before a tick stops waiting.
pub const PROBE_GRACE: Duration = Duration::from_millis(250);

const PS: &str = "ps";
const WAIT_STEP: Duration = Duration::from_millis(10);

/// Outcome of one probe. `Unknown` is "no observation", never "down".
#[derive(Debug)]
pub enum ProbeResult {
    Running,
    NotRunning,
    Unknown(ProbeError),
}

pub trait LivenessProbe: Send + Sync {
    /// Is at least one process called `process_name` alive right now?
    fn is_running(&self, process_name: &str) -> ProbeResult;
}

/// Asks `ps -C <name>` and counts the non‑zombie matches.
#[derive(Debug, Clone)]
pub struct ProcessTableProbe {
    timeout: Duration,
}

impl ProcessTableProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl LivenessProbe for ProcessTableProbe {
    fn is_running(&self, process_name: &str) -> ProbeResult {
        match list_pids(process_name, self.timeout) {
            Ok(pids) if pids.is_empty() => ProbeResult::NotRunning,
            Ok(pids) => {
                debug!("{process_name}: alive as pid(s) {pids:?}");
                ProbeResult::Running
            }
            Err(e) => ProbeResult::Unknown(e),
        }
    }
}

fn list_pids(process_name: &str, timeout: Duration) -> Result<Vec<u32>, ProbeError> {
    let mut child = Command::new(PS)
        .args(["-C", process_name, "-o", "pid=,stat="])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(ProbeError::Spawn)?;

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                child.kill().ok();
                child.wait().ok();
                return Err(ProbeError::Timeout(timeout));
            }
            Ok(None) => thread::sleep(WAIT_STEP),
            Err(e) => return Err(ProbeError::Spawn(e)),
        }
    };

    let mut out = String::new();
    if let Some(mut stdout) = child.stdout.take() {
        stdout
            .read_to_string(&mut out)
            .map_err(|e| ProbeError::Output(e.to_string()))?;
    }

    // procps exits 1 with no output when nothing matched.
    if !status.success() {
        return if status.code() == Some(1) && out.trim().is_empty() {
            Ok(Vec::new())
        } else {
            Err(ProbeError::Output(format!("ps exited with {status}")))
        };
    }

    parse_ps_output(&out)
}

/// Parse `pid stat` lines, skipping zombies.
fn parse_ps_output(out: &str) -> Result<Vec<u32>, ProbeError> {
    let mut pids = Vec::new();
    for line in out.lines() {
        let mut cols = line.split_whitespace();
        let Some(pid) = cols.next() else { continue };
        let pid: u32 = pid
            .parse()
            .map_err(|_| ProbeError::Output(format!("unexpected ps line: {line:?}")))?;
        if cols.next().is_some_and(|stat| stat.starts_with('Z')) {
            continue;
        }
        pids.push(pid);
    }
    Ok(pids)
}

/// Probe every name on a bounded pool. Each probe is allowed `per_probe`;
/// with more names than workers the wait covers every round. Results come
/// back in input order; anything still outstanding at the deadline is
/// reported as a timeout.
pub fn probe_all(
    probe: &Arc<dyn LivenessProbe>,
    names: &[String],
    per_probe: Duration,
) -> Vec<ProbeResult> {
    let n = names.len();
    if n == 0 {
        return Vec::new();
    }

    let (job_tx, job_rx) = unbounded::<(usize, String)>();
    for (idx, name) in names.iter().enumerate() {
        job_tx.send((idx, name.clone())).ok();
    }
    drop(job_tx);

    // Capacity n: a late worker never blocks on a receiver that gave up.
    let (res_tx, res_rx) = bounded::<(usize, ProbeResult)>(n);
    let workers = n.min(MAX_PROBE_WORKERS);
    for worker in 0..workers {
        let probe = Arc::clone(probe);
        let jobs = job_rx.clone();
        let results = res_tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("probe-{worker}"))
            .spawn(move || {
                for (idx, name) in jobs.iter() {
                    if results.send((idx, probe.is_running(&name))).is_err() {
                        break;
                    }
                }
            });
        if let Err(e) = spawned {
            warn!("cannot start probe worker {worker}: {e}");
        }
    }
    drop(res_tx);

    let rounds = u32::try_from(n.div_ceil(workers)).unwrap_or(u32::MAX);
    let deadline = per_probe.saturating_mul(rounds) + PROBE_GRACE;
    let until = Instant::now() + deadline;
    let mut slots: Vec<Option<ProbeResult>> = (0..n).map(|_| None).collect();
    let mut received = 0;
    while received < n {
        match res_rx.recv_deadline(until) {
            Ok((idx, result)) => {
                slots[idx] = Some(result);
                received += 1;
            }
            Err(_) => break,
        }
    }

    slots
        .into_iter()
        .map(|r| r.unwrap_or(ProbeResult::Unknown(ProbeError::Timeout(deadline))))
        .collect()
}

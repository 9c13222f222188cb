use std::process::Command;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

// ==========================================
// Scoped iptables diversion rules
// ==========================================
// The queue only sees traffic while these rules exist, and the host only
// routes normally again once they are gone. Install before the loop starts,
// remove on every exit path: `Drop` deletes exactly the rules this guard
// inserted, never a blanket flush of the operator's tables.

pub struct RedirectGuard {
    installed: Vec<Vec<String>>,
}

impl RedirectGuard {
    /// Insert NFQUEUE diversion rules for both directions of the target
    /// port. Local mode hooks OUTPUT/INPUT; `forward` hooks the FORWARD
    /// chain instead for gateway deployments.
    pub fn install(port: u16, queue_num: u16, forward: bool) -> Result<RedirectGuard> {
        let specs = if forward {
            vec![
                rule_spec("FORWARD", "--dport", port, queue_num),
                rule_spec("FORWARD", "--sport", port, queue_num),
            ]
        } else {
            vec![
                rule_spec("OUTPUT", "--dport", port, queue_num),
                rule_spec("INPUT", "--sport", port, queue_num),
            ]
        };

        // push each rule as it lands so a partial install still unwinds
        let mut guard = RedirectGuard { installed: Vec::new() };
        for spec in specs {
            iptables("-I", &spec)?;
            info!(rule = %spec.join(" "), "iptables rule installed");
            guard.installed.push(spec);
        }
        Ok(guard)
    }
}

impl Drop for RedirectGuard {
    fn drop(&mut self) {
        for spec in &self.installed {
            match iptables("-D", spec) {
                Ok(()) => info!(rule = %spec.join(" "), "iptables rule removed"),
                Err(err) => warn!(rule = %spec.join(" "), %err, "failed to remove iptables rule"),
            }
        }
    }
}

fn rule_spec(chain: &str, port_flag: &str, port: u16, queue_num: u16) -> Vec<String> {
    [
        chain,
        "-p",
        "tcp",
        port_flag,
        &port.to_string(),
        "-j",
        "NFQUEUE",
        "--queue-num",
        &queue_num.to_string(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn iptables(action: &str, spec: &[String]) -> Result<()> {
    let status = Command::new("iptables")
        .arg(action)
        .args(spec)
        .status()
        .context("running iptables")?;
    if !status.success() {
        bail!("iptables {action} {} exited with {status}", spec.join(" "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_rule_spec_shape() {
        let spec = rule_spec("OUTPUT", "--dport", 80, 0);
        assert_eq!(
            spec,
            vec!["OUTPUT", "-p", "tcp", "--dport", "80", "-j", "NFQUEUE", "--queue-num", "0"]
        );
    }

    #[test]
    fn forward_rule_spec_uses_given_port_and_queue() {
        let spec = rule_spec("FORWARD", "--sport", 8080, 3);
        assert_eq!(spec[0], "FORWARD");
        assert_eq!(spec[3], "--sport");
        assert_eq!(spec[4], "8080");
        assert_eq!(spec[8], "3");
    }
}

//! Firewall rule toggling - one fire-and-forget OS command per call.
//!
//! Failure is reported as a boolean; there is no retry logic. The command
//! usually needs elevation, which is the operator's problem to arrange.

use tokio::process::Command;

/// Open an inbound TCP port under the given rule name.
pub async fn allow_port(port: u16, rule_name: &str) -> bool {
    #[cfg(windows)]
    let result = Command::new("netsh")
        .args([
            "advfirewall",
            "firewall",
            "add",
            "rule",
            &format!("name={}", rule_name),
            "dir=in",
            "action=allow",
            "protocol=TCP",
            &format!("localport={}", port),
        ])
        .output()
        .await;

    #[cfg(not(windows))]
    let result = Command::new("ufw")
        .args(["allow", &format!("{}/tcp", port), "comment", rule_name])
        .output()
        .await;

    report("allow", rule_name, result)
}

/// Delete a previously created rule by name.
pub async fn remove_rule(rule_name: &str) -> bool {
    #[cfg(windows)]
    let result = Command::new("netsh")
        .args([
            "advfirewall",
            "firewall",
            "delete",
            "rule",
            &format!("name={}", rule_name),
        ])
        .output()
        .await;

    #[cfg(not(windows))]
    let result = Command::new("ufw")
        .args(["delete", "allow", rule_name])
        .output()
        .await;

    report("remove", rule_name, result)
}

fn report(action: &str, rule_name: &str, result: std::io::Result<std::process::Output>) -> bool {
    match result {
        Ok(output) if output.status.success() => {
            tracing::info!("Firewall rule '{}' {}ed", rule_name, action);
            true
        }
        Ok(output) => {
            tracing::warn!(
                "Firewall {} for '{}' failed: {}",
                action,
                rule_name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            false
        }
        Err(e) => {
            tracing::warn!("Firewall command unavailable: {}", e);
            false
        }
    }
}

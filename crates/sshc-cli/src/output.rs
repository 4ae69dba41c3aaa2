//! Output formatting for the operator CLI.

use tabled::{settings::Style, Table, Tabled};

use sshc_manager::SessionStatus;
use sshc_tunnels::TunnelStatus;

#[derive(Tabled)]
struct InstanceRow {
    #[tabled(rename = "INSTANCE")]
    instance: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "ENDPOINT")]
    endpoint: String,
    #[tabled(rename = "KEEPALIVE (ok/sent/missed)")]
    keepalive: String,
    #[tabled(rename = "LAST ERROR")]
    last_error: String,
}

pub fn format_instance_list(statuses: &[SessionStatus]) -> String {
    if statuses.is_empty() {
        return "No sessions".to_string();
    }

    let rows: Vec<InstanceRow> = statuses.iter().map(instance_row).collect();
    Table::new(rows).with(Style::rounded()).to_string()
}

fn instance_row(status: &SessionStatus) -> InstanceRow {
    InstanceRow {
        instance: status.instance_id.to_string(),
        state: status.state.as_str().to_string(),
        endpoint: status
            .dial_address
            .as_ref()
            .map(|e| format!("{}:{}", e.host, e.port))
            .unwrap_or_else(|| "-".to_string()),
        keepalive: format!(
            "{}/{}/{}",
            status.keepalive.ok, status.keepalive.sent, status.keepalive.missed
        ),
        last_error: status.last_error.clone().unwrap_or_else(|| "-".to_string()),
    }
}

pub fn format_status_detail(status: &SessionStatus, tunnels: &[TunnelStatus]) -> String {
    let mut out = format_instance_list(std::slice::from_ref(status));
    out.push('\n');
    out.push_str(&format_tunnels(tunnels));
    out
}

#[derive(Tabled)]
struct TunnelRow {
    #[tabled(rename = "LABEL")]
    label: String,
    #[tabled(rename = "LOCAL")]
    local: String,
    #[tabled(rename = "REMOTE")]
    remote: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "HEALTH")]
    health: String,
}

pub fn format_tunnels(tunnels: &[TunnelStatus]) -> String {
    if tunnels.is_empty() {
        return "No tunnels".to_string();
    }

    let rows: Vec<TunnelRow> = tunnels
        .iter()
        .map(|t| TunnelRow {
            label: t.label.clone(),
            local: format!("127.0.0.1:{}", t.local_port),
            remote: format!("{}:{}", t.remote_host, t.remote_port),
            state: format!("{:?}", t.state),
            health: format!("{:?}", t.health),
        })
        .collect();

    Table::new(rows).with(Style::rounded()).to_string()
}

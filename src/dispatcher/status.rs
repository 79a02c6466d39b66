//! Combined host/session view

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::backend::BackendKind;
use crate::remote::ConnectionDescriptor;
use crate::session::Session;

/// Status shown for hosts without a live session
pub const IDLE: &str = "idle";

/// One row of `list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostStatus {
    pub id: String,
    pub name: String,
    pub kind: BackendKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// `idle` or the session state
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl HostStatus {
    pub fn idle(connection: &ConnectionDescriptor) -> Self {
        Self {
            id: connection.id.clone(),
            name: connection.name.clone(),
            kind: connection.kind,
            target: connection.display_target(),
            status: IDLE.to_string(),
            session_id: None,
            started_at: None,
        }
    }

    pub fn with_session(connection: &ConnectionDescriptor, session: &Session) -> Self {
        Self {
            status: session.state.to_string(),
            session_id: Some(session.id.clone()),
            started_at: Some(session.started_at),
            ..Self::idle(connection)
        }
    }

    /// A live session whose host is gone from the remote listing.
    pub fn orphan(session: &Session) -> Self {
        Self {
            id: session.connection_id.clone(),
            name: session.connection_name.clone(),
            kind: session.kind,
            target: None,
            status: session.state.to_string(),
            session_id: Some(session.id.clone()),
            started_at: Some(session.started_at),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.session_id.is_none()
    }

    /// Session age, e.g. `5m 12s`
    pub fn age(&self, now: DateTime<Utc>) -> Option<String> {
        let started = self.started_at?;
        let secs = (now - started).num_seconds().max(0) as u64;
        Some(format_uptime(secs))
    }
}

/// Format seconds as a short human duration.
pub fn format_uptime(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}

/// Render rows as an aligned table.
pub fn render_table(rows: &[HostStatus], now: DateTime<Utc>) -> String {
    let headers = ["NAME", "KIND", "STATUS", "AGE", "TARGET"];
    let cells: Vec<[String; 5]> = rows
        .iter()
        .map(|row| {
            [
                row.name.clone(),
                row.kind.to_string(),
                row.status.clone(),
                row.age(now).unwrap_or_else(|| "-".to_string()),
                row.target.clone().unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();

    let mut widths = headers.map(str::len);
    for row in &cells {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = String::new();
    let mut push_line = |fields: Vec<&str>| {
        let line: Vec<String> = fields
            .iter()
            .zip(widths.iter())
            .map(|(field, width)| format!("{:<width$}", field, width = width))
            .collect();
        out.push_str(line.join("  ").trim_end());
        out.push('\n');
    };

    push_line(headers.to_vec());
    for row in &cells {
        push_line(row.iter().map(String::as_str).collect());
    }
    out
}

//! Terminal rendering of map snapshots.

use colored::Colorize;
use palletmap_central::{LinkState, MapEntry, SystemStatus};
use serde_json::json;

/// Human-readable table of `entries` with a status header.
pub fn table(entries: &[MapEntry], status: &SystemStatus) -> String {
    let mut out = String::new();
    let when = status
        .updated_at
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());
    out.push_str(&format!(
        "{} cycle {} at {}  {} active  {} stale  {} rejected\n",
        "▶".cyan().bold(),
        status.cycle,
        when,
        status.active_tags.to_string().green(),
        status.stale_tags.to_string().yellow(),
        status.last_cycle.rejections(),
    ));

    let links: Vec<String> = status
        .links
        .iter()
        .map(|l| {
            let state = match l.state {
                LinkState::Live => "live".green(),
                LinkState::Idle => "idle".yellow(),
                LinkState::Disconnected => "down".red(),
            };
            format!("{} {} (seq {})", l.edge_node, state, l.last_sequence)
        })
        .collect();
    if !links.is_empty() {
        out.push_str(&format!("  links: {}\n", links.join(", ")));
    }

    if entries.is_empty() {
        out.push_str(&format!("  {}\n", "no active tags".dimmed()));
        return out;
    }

    out.push_str(&format!(
        "  {}\n",
        format!(
            "{:<12} {:<12} {:>7} {:>7} {:>6} {:>6} {:>6}  {:<12} {}",
            "TAG", "PALLET", "X", "Y", "Z", "±M", "M/S", "SOURCE", "SEEN"
        )
        .bold()
    ));
    for e in entries {
        out.push_str(&format!(
            "  {:<12} {:<12} {:>7.2} {:>7.2} {:>6.2} {:>6.2} {:>6.2}  {:<12} {}\n",
            e.tag_id.as_str(),
            e.pallet_id.as_deref().unwrap_or("-"),
            e.position.x,
            e.position.y,
            e.position.z,
            e.uncertainty,
            e.velocity.norm(),
            e.source.as_str(),
            e.last_seen.format("%H:%M:%S%.3f"),
        ));
    }
    out
}

/// One JSON line per snapshot, for piping into other tools.
pub fn json_line(entries: &[MapEntry], status: &SystemStatus) -> Result<String, serde_json::Error> {
    serde_json::to_string(&json!({
        "cycle": status.cycle,
        "updated_at": status.updated_at,
        "links": status.links,
        "active": entries,
    }))
}

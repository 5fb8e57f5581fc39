//! 🍽️ Report tables: what the CLI prints once a command is done.
//!
//! Same comfy-table setup as the progress display, with a header row this time,
//! because these tables outlive the run and end up pasted into tickets.

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};

use crate::aggregate::MergedAggregateMap;
use crate::loader::LoadSummary;
use crate::progress::format_number;
use crate::store::HealthSummary;

fn table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(header.to_vec());
    table
}

fn number(n: u64) -> Cell {
    Cell::new(format_number(n)).set_alignment(CellAlignment::Right)
}

pub fn load_table(collection: &str, summary: &LoadSummary) -> Table {
    let mut t = table(&["collection", "accepted", "failed", "chunks", "chunks lost"]);
    t.add_row(vec![
        Cell::new(collection),
        number(summary.accepted as u64),
        number(summary.failed as u64),
        number(summary.chunks_submitted as u64),
        number(summary.chunks_failed as u64),
    ]);
    t
}

pub fn health_table(health: &HealthSummary) -> Table {
    let mut t = table(&["cluster", "status", "nodes", "active shards", "unassigned shards"]);
    t.add_row(vec![
        Cell::new(&health.cluster_name),
        Cell::new(&health.status),
        number(health.number_of_nodes),
        number(health.active_shards),
        number(health.unassigned_shards),
    ]);
    t
}

pub fn setup_table(created: &[(String, bool)]) -> Table {
    let mut t = table(&["collection", "status"]);
    for (name, fresh) in created {
        t.add_row(vec![name.as_str(), if *fresh { "created" } else { "already there" }]);
    }
    t
}

pub fn count_table(rows: &[(String, u64)]) -> Table {
    let mut t = table(&["what", "documents"]);
    for (what, n) in rows {
        t.add_row(vec![Cell::new(what), number(*n)]);
    }
    t
}

/// 🏆 The `limit` biggest groups by member hits. Ties break on the group id so output is stable.
pub fn top_groups_table(merged: &MergedAggregateMap, limit: usize) -> Table {
    let mut t = table(&["group", "name", "members", "age > cutoff", "born after"]);
    let mut ranked: Vec<_> = merged.iter().collect();
    ranked.sort_by(|(ka, a), (kb, b)| b.total_count.cmp(&a.total_count).then_with(|| ka.cmp(kb)));
    for (key, counts) in ranked.into_iter().take(limit) {
        t.add_row(vec![
            Cell::new(key),
            Cell::new(&counts.group_name),
            number(counts.total_count),
            number(counts.count_age_gt_35),
            number(counts.count_birthday_after_2000),
        ]);
    }
    t
}

//! 📊 progress.rs: "are we there yet?", asked of every loader and aggregator, forever.
//!
//! Tracks units of work (documents for the loader, sub-batches for the aggregator)
//! against a known total, with a terminal bar and a comfy table of rates underneath.
//! indicatif hides the bar on its own when stderr isn't a terminal, so tests and
//! CI logs stay clean. 🦆

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::NOTHING};
use indicatif::{ProgressBar, ProgressStyle};

// -- 🪟 how far back the rate window looks
const RATE_WINDOW: Duration = Duration::from_secs(5);

/// 🔢 "1000000" → "1,000,000". You're welcome, eyes.
pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// ⏱️ MM:SS, or HH:MM:SS if you should probably call your mom.
pub(crate) fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

/// 📊 Units done vs units expected, plus a sliding 5-second rate window so
/// one slow chunk doesn't make the whole run look like it's dying.
pub(crate) struct ProgressMetrics {
    name: String,
    total_units: u64,
    done_units: u64,
    failed_units: u64,
    progress_bar: ProgressBar,
    rate_samples: VecDeque<(Instant, u64)>,
    start_time: Instant,
}

impl std::fmt::Debug for ProgressMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // -- 🎭 ProgressBar is a diva and doesn't derive Debug
        f.debug_struct("ProgressMetrics")
            .field("name", &self.name)
            .field("total_units", &self.total_units)
            .field("done_units", &self.done_units)
            .field("failed_units", &self.failed_units)
            .finish()
    }
}

impl ProgressMetrics {
    pub(crate) fn new(name: String, total_units: u64) -> Self {
        let progress_bar = ProgressBar::new(total_units);
        let style = ProgressStyle::default_bar()
            .template("{msg}\n| [{bar:40.cyan/blue}] {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        progress_bar.set_style(style);

        let start_time = Instant::now();
        // -- 🔄 seed the window with t=0 so we don't divide by zero like animals
        let mut rate_samples = VecDeque::new();
        rate_samples.push_back((start_time, 0u64));

        Self {
            name,
            total_units,
            done_units: 0,
            failed_units: 0,
            progress_bar,
            rate_samples,
            start_time,
        }
    }

    /// 🔄 Record finished work. `failed` is the part of `units` that didn't make it.
    pub(crate) fn update(&mut self, units: u64, failed: u64) {
        self.done_units = self.done_units.saturating_add(units);
        self.failed_units = self.failed_units.saturating_add(failed.min(units));
        let units_per_sec = self.units_per_sec();
        self.render(units_per_sec);
        self.progress_bar.set_position(self.done_units.min(self.total_units));
    }

    pub(crate) fn finish(&self) {
        self.progress_bar.finish();
    }

    #[cfg(test)]
    pub(crate) fn done_units(&self) -> u64 {
        self.done_units
    }

    #[cfg(test)]
    pub(crate) fn failed_units(&self) -> u64 {
        self.failed_units
    }

    fn units_per_sec(&mut self) -> f64 {
        let now = Instant::now();
        while let Some(&(timestamp, _)) = self.rate_samples.front() {
            if now.duration_since(timestamp) > RATE_WINDOW {
                self.rate_samples.pop_front();
            } else {
                break;
            }
        }
        self.rate_samples.push_back((now, self.done_units));

        if let Some(&(oldest_time, oldest_units)) = self.rate_samples.front() {
            let elapsed = now.duration_since(oldest_time).as_secs_f64();
            if elapsed > 0.0 {
                return self.done_units.saturating_sub(oldest_units) as f64 / elapsed;
            }
        }
        0.0
    }

    fn percent(&self) -> f64 {
        if self.total_units == 0 {
            return 100.0;
        }
        (self.done_units as f64 / self.total_units as f64 * 100.0).min(100.0)
    }

    fn remaining(&self) -> String {
        let percent = self.percent();
        if percent <= 0.0 || percent >= 100.0 {
            return "--:--".to_string();
        }
        let elapsed = self.start_time.elapsed().as_secs_f64();
        // 🔮 linear extrapolation: assumes the future looks like the past
        let remaining_secs = elapsed / (percent / 100.0) - elapsed;
        if remaining_secs > 0.0 {
            format_duration(Duration::from_secs_f64(remaining_secs))
        } else {
            "--:--".to_string()
        }
    }

    fn render(&self, units_per_sec: f64) {
        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_content_arrangement(ContentArrangement::Dynamic);

        table.add_row(vec![
            Cell::new(format!("{} /s", format_number(units_per_sec as u64)))
                .set_alignment(CellAlignment::Right),
            Cell::new(format!(
                "{} / {}",
                format_number(self.done_units),
                format_number(self.total_units)
            ))
            .set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!("{} failed", format_number(self.failed_units)))
                .set_alignment(CellAlignment::Right),
            Cell::new(format!("{:.2}%", self.percent())).set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!("{} elapsed", format_duration(self.start_time.elapsed())))
                .set_alignment(CellAlignment::Right),
            Cell::new(format!("{} remaining", self.remaining())).set_alignment(CellAlignment::Right),
        ]);

        self.progress_bar.set_message(format!("{}\n{}", self.name, table));
    }
}

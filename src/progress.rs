//! Terminal progress reporting for bulk submission.

use std::io::IsTerminal;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::warn;

/// Aggregate job state counters.
///
/// Signed on purpose: submission rejections decrement `pending` as a
/// compensating entry and transient negative values are tolerated rather
/// than panicking mid-run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProgressCounters {
    pub pending: i64,
    pub running: i64,
    pub complete: i64,
    pub fail: i64,
}

impl ProgressCounters {
    /// Jobs that have reached a terminal state.
    pub fn terminal(&self) -> i64 {
        self.complete + self.fail
    }
}

/// A live progress bar. `None` is returned from [`ProgressDisplay::start`]
/// when stdout is not a terminal, and callers simply skip updates.
pub struct ProgressDisplay {
    bar: ProgressBar,
    counters_mode: bool,
    width: usize,
}

impl ProgressDisplay {
    /// Start a bar over `total` jobs. In wait mode the message area carries
    /// live state counters; otherwise it is a static submission banner.
    pub fn start(total: u64, wait_mode: bool, jps: bool) -> Option<ProgressDisplay> {
        if !std::io::stdout().is_terminal() {
            warn!("stdout is not a terminal; progress display disabled");
            return None;
        }

        let template = if jps {
            "{msg} [{bar:25.cyan/blue}] {percent:>3}% {per_sec:>10} job/s"
        } else {
            "{msg} [{bar:25.cyan/blue}] {percent:>3}% {elapsed_precise}"
        };
        let style = ProgressStyle::with_template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");

        let bar = ProgressBar::new(total).with_style(style);
        let display = ProgressDisplay {
            bar,
            counters_mode: wait_mode,
            width: total.to_string().len(),
        };
        if !wait_mode {
            display.bar.set_message(format!("Submitting {total} jobs"));
        }
        display.bar.tick();
        Some(display)
    }

    /// Refresh position and, in wait mode, the counter readout.
    pub fn update(&self, counters: &ProgressCounters, done: u64) {
        if self.counters_mode {
            let w = self.width;
            self.bar.set_message(format!(
                "PD:{:<w$} R:{:<w$} CD:{:<w$} F:{:<w$}",
                counters.pending, counters.running, counters.complete, counters.fail,
            ));
        }
        self.bar.set_position(done);
    }

    /// Redraw so the elapsed/rate fields stay live between events.
    pub fn tick(&self) {
        self.bar.tick();
    }

    pub fn finish(&self) {
        self.bar.finish();
    }
}

//! Step progress reporting, with TTY detection so piped output (CI logs,
//! redirected-to-file runs) gets plain lines instead of carriage-return
//! spam.

use std::io::IsTerminal;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};

pub fn is_tty() -> bool {
    std::io::stdout().is_terminal()
}

/// Reports step-by-step progress for a single job run.
pub struct JobProgress {
    is_tty: bool,
    total_steps: usize,
    current_step: usize,
    bar: Option<ProgressBar>,
    start: Instant,
}

impl JobProgress {
    pub fn new(total_steps: usize) -> Self {
        let is_tty = is_tty();
        let bar = if is_tty {
            let pb = ProgressBar::new(total_steps as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            Some(pb)
        } else {
            None
        };

        Self {
            is_tty,
            total_steps,
            current_step: 0,
            bar,
            start: Instant::now(),
        }
    }

    pub fn start_step(&mut self, name: &str) {
        self.current_step += 1;
        let elapsed = self.start.elapsed();
        let msg = format!(
            "[{}/{}] {name} ({elapsed:?})",
            self.current_step, self.total_steps
        );
        if let Some(bar) = &self.bar {
            bar.set_message(msg);
            bar.set_position((self.current_step - 1) as u64);
        } else {
            eprintln!("{msg}");
        }
    }

    pub fn finish(self, state: &str) {
        let elapsed = self.start.elapsed();
        let msg = format!(
            "job {state} after {} step(s) in {elapsed:?}",
            self.total_steps
        );
        if let Some(bar) = self.bar {
            bar.finish_with_message(msg);
        } else {
            eprintln!("{msg}");
        }
    }
}

//! Progress reporting for interactive and CI environments.

use std::borrow::Cow;
use std::time::Instant;

use indicatif::{HumanDuration, ProgressBar, ProgressStyle};

/// A phase progress bar.
///
/// - In interactive terminals, displays a normal progress bar.
/// - In non-interactive environments, emits one log line per phase so CI
///   output stays readable.
pub struct PhaseBar {
    progress: ProgressBar,
    start: Instant,
    interactive: bool,
}

impl PhaseBar {
    /// Creates a progress bar over a fixed number of phases.
    pub fn new(phases: u64, message: impl Into<Cow<'static, str>>) -> Self {
        let interactive = is_interactive();
        let progress = if interactive {
            let bar = ProgressBar::new(phases);
            let style = ProgressStyle::default_bar()
                .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .expect("invalid progress bar template")
                .progress_chars("=> ");
            bar.set_style(style);
            bar
        } else {
            ProgressBar::hidden()
        };
        progress.set_message(message);

        Self {
            progress,
            start: Instant::now(),
            interactive,
        }
    }

    /// Advance one phase and update the message.
    pub fn advance(&self, message: impl Into<Cow<'static, str>>) {
        let message = message.into();
        if !self.interactive {
            let elapsed = HumanDuration(self.start.elapsed());
            println!("[{elapsed}] {message}");
        }
        self.progress.set_message(message);
        self.progress.inc(1);
    }

    /// Finish the bar with a closing message.
    pub fn finish(&self, message: impl Into<Cow<'static, str>>) {
        let message = message.into();
        if !self.interactive {
            let elapsed = HumanDuration(self.start.elapsed());
            println!("[{elapsed}] {message}");
        }
        self.progress.finish_with_message(message);
    }
}

fn is_interactive() -> bool {
    console::Term::stderr().is_term()
}

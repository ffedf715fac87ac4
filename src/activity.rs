//! Activity reporting for long-running extraction work.
//!
//! An [`Activity`] is an opaque progress sink handed to the converters. It
//! either drives an `indicatif` spinner or does nothing, so library code can
//! report progress unconditionally without caring whether a terminal is
//! attached.

use indicatif::{ProgressBar, ProgressStyle};

/// A progress sink for extraction work.
///
/// `update` ticks the spinner, `update_task` replaces the task message.
/// There is no ordering contract; calls are cheap and may be dropped.
#[derive(Debug)]
pub struct Activity {
    bar: Option<ProgressBar>,
}

impl Activity {
    /// Creates an activity that renders a spinner on the terminal.
    pub fn spinner(prefix: &str) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner} {prefix}: {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_prefix(prefix.to_string());
        Self { bar: Some(bar) }
    }

    /// Creates an activity that discards all updates.
    pub fn disabled() -> Self {
        Self { bar: None }
    }

    /// Ticks the spinner.
    #[inline]
    pub fn update(&self) {
        if let Some(bar) = &self.bar {
            bar.tick();
        }
    }

    /// Replaces the current task message and ticks.
    pub fn update_task(&self, task: &str) {
        if let Some(bar) = &self.bar {
            bar.set_message(task.to_string());
            bar.tick();
        }
    }

    /// Finishes and clears the spinner.
    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::disabled()
    }
}

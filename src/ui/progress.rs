use crate::migrate::{Direction, MigrationEvent};
use crate::ui::Icons;
use crossbeam::channel::Sender;
use indicatif::{ProgressBar, ProgressStyle};
use std::thread;
use std::time::Duration;

/// Drives a progress bar from the engine's event stream.
///
/// The listener thread ends once every sender is dropped, i.e. when the
/// engine holding it goes away.
pub struct MigrationProgress {
    bar: ProgressBar,
    handle: Option<thread::JoinHandle<()>>,
}

impl MigrationProgress {
    pub fn new() -> (Self, Sender<MigrationEvent>) {
        let (tx, rx) = crossbeam::channel::unbounded::<MigrationEvent>();

        let bar = if console::Term::stdout().is_term() {
            ProgressBar::new(0)
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) = ProgressStyle::with_template("{prefix} [{bar:30}] {pos}/{len} {msg}") {
            bar.set_style(style.progress_chars("=> "));
        }

        let bar_clone = bar.clone();
        let handle = thread::spawn(move || {
            for event in rx {
                match event {
                    MigrationEvent::Planned { direction, total } => {
                        let icon = match direction {
                            Direction::Up => Icons::UP,
                            Direction::Down => Icons::DOWN,
                        };
                        bar_clone.set_prefix(icon);
                        bar_clone.set_length(total as u64);
                        bar_clone.set_position(0);
                        bar_clone.enable_steady_tick(Duration::from_millis(100));
                    }
                    MigrationEvent::Started { version, description } => {
                        bar_clone.set_message(format!("{} {}", version, description));
                    }
                    MigrationEvent::Finished { .. } => {
                        bar_clone.inc(1);
                    }
                    MigrationEvent::Failed { version, .. } => {
                        bar_clone.abandon_with_message(format!("{} failed", version));
                    }
                    MigrationEvent::Completed { .. } => {
                        if !bar_clone.is_finished() {
                            bar_clone.finish_with_message("Done");
                        }
                    }
                }
            }
        });

        (
            Self {
                bar,
                handle: Some(handle),
            },
            tx,
        )
    }

    /// Wait for the listener to drain, then clear the bar. Call after the
    /// engine (and its sender) has been dropped.
    pub fn finish(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.bar.finish_and_clear();
    }
}

pub struct Spinner {
    pb: ProgressBar,
}

impl Spinner {
    pub fn new(message: &str) -> Self {
        let pb = if console::Term::stdout().is_term() {
            ProgressBar::new_spinner()
        } else {
            ProgressBar::hidden()
        };
        pb.set_message(message.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        Self { pb }
    }

    pub fn finish_and_clear(&self) {
        self.pb.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_drains_and_exits() {
        let (progress, tx) = MigrationProgress::new();
        tx.send(MigrationEvent::Planned {
            direction: Direction::Up,
            total: 1,
        })
        .unwrap();
        tx.send(MigrationEvent::Started {
            version: "001".into(),
            description: "Create base tables".into(),
        })
        .unwrap();
        tx.send(MigrationEvent::Finished {
            version: "001".into(),
            elapsed_ms: 3,
        })
        .unwrap();
        tx.send(MigrationEvent::Completed {
            direction: Direction::Up,
            completed: 1,
        })
        .unwrap();
        drop(tx);

        progress.finish();
    }
}

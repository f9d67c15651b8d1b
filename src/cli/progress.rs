//! Progress display for library runs
//!
//! The pipeline maintains a progress tree (one composite per book, one leaf
//! per download and per decode). This module polls the root of that tree and
//! renders it with indicatif, or as periodic text lines when stderr is not a
//! terminal.
//!
//! # Examples
//!
//! ```rust,no_run
//! use audible_fetcher::app::ProgressComposite;
//! use audible_fetcher::cli::{ProgressConfig, ProgressDisplay};
//!
//! # async fn example() {
//! let library = ProgressComposite::new();
//! let mut display = ProgressDisplay::new(ProgressConfig::default());
//! display.start(library.clone(), 12);
//! // ... run the pipeline ...
//! display.finish().await;
//! # }
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::app::pipeline::RunReport;
use crate::app::progress::{ProgressComposite, ProgressSource};
use crate::constants::progress;

/// Configuration for progress display
#[derive(Debug, Clone)]
pub struct ProgressConfig {
    /// Enable visual progress bars
    pub enable_progress_bars: bool,
    /// How often to redraw
    pub update_interval: Duration,
    /// How often to print in text mode
    pub text_report_interval: Duration,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            enable_progress_bars: true,
            update_interval: Duration::from_millis(progress::UPDATE_FREQUENCY_MS),
            text_report_interval: Duration::from_secs(10),
        }
    }
}

/// Live view of a progress tree
pub struct ProgressDisplay {
    config: ProgressConfig,
    bar: Option<ProgressBar>,
    update_task: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
    is_terminal: bool,
    started: Option<Instant>,
}

/// Bar template showing combined download and decode bytes
const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}";

impl ProgressDisplay {
    pub fn new(config: ProgressConfig) -> Self {
        Self {
            config,
            bar: None,
            update_task: None,
            shutdown: CancellationToken::new(),
            is_terminal: atty::is(atty::Stream::Stderr),
            started: None,
        }
    }

    /// Starts rendering `root` for a run over `books` titles
    pub fn start(&mut self, root: Arc<ProgressComposite>, books: usize) {
        self.started = Some(Instant::now());

        if !self.config.enable_progress_bars || !self.is_terminal {
            eprintln!("Downloading {} titles...", books);
            self.update_task = Some(self.spawn_text_task(root));
            return;
        }

        let bar = ProgressBar::new(0);
        match ProgressStyle::default_bar().template(BAR_TEMPLATE) {
            Ok(style) => bar.set_style(style.progress_chars("##-")),
            Err(e) => debug!("Progress bar template error: {}", e),
        }
        bar.enable_steady_tick(self.config.update_interval);
        bar.set_message(format!("{} titles", books));

        self.update_task = Some(self.spawn_bar_task(root, bar.clone()));
        self.bar = Some(bar);
        debug!("Progress display started for {} titles", books);
    }

    fn spawn_bar_task(&self, root: Arc<ProgressComposite>, bar: ProgressBar) -> JoinHandle<()> {
        let shutdown = self.shutdown.clone();
        let interval = self.config.update_interval;

        tokio::spawn(async move {
            loop {
                let (total, current) = root.totals();
                bar.set_length(total);
                bar.set_position(current);

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        })
    }

    fn spawn_text_task(&self, root: Arc<ProgressComposite>) -> JoinHandle<()> {
        let shutdown = self.shutdown.clone();
        let interval = self.config.text_report_interval;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let (total, current) = root.totals();
                        eprintln!(
                            "Progress: {:.1}% ({} of {} bytes)",
                            root.percent() * 100.0,
                            current,
                            total
                        );
                    }
                }
            }
        })
    }

    /// Stops rendering
    pub async fn finish(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.update_task.take() {
            let _ = task.await;
        }
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
        debug!("Progress display finished");
    }

    /// Prints the run summary and every collected error
    pub fn print_summary(&self, report: &RunReport) {
        let elapsed = self.started.map(|s| s.elapsed()).unwrap_or_default();

        eprintln!();
        eprintln!("Download Summary:");
        eprintln!("   Titles in catalog: {}", report.items_total);
        eprintln!("   Already downloaded: {}", report.items_skipped);
        eprintln!("   Processed: {}", report.items_processed);
        eprintln!("   Files downloaded: {}", report.transfers_completed);
        eprintln!("   Files decoded: {}", report.decoded);
        eprintln!("   Files skipped: {}", report.transfers_aborted);
        eprintln!("   Duration: {:.1?}", elapsed);

        if report.cancelled {
            eprintln!("Run was interrupted; re-run to resume partial downloads.");
        }
        if !report.errors.is_empty() {
            eprintln!();
            eprintln!("{} errors:", report.errors.len());
            for error in &report.errors {
                eprintln!("   {}", error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_text_mode_start_and_finish() {
        let root = ProgressComposite::new();
        let leaf = root.add_leaf();
        leaf.update(10, 5);

        let mut display = ProgressDisplay::new(ProgressConfig {
            enable_progress_bars: false,
            text_report_interval: Duration::from_millis(5),
            ..ProgressConfig::default()
        });
        display.start(root, 1);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let finished = tokio::time::timeout(Duration::from_millis(200), display.finish()).await;
        assert!(finished.is_ok());
        assert!(display.update_task.is_none());
    }

    #[tokio::test]
    async fn test_bar_task_tracks_tree() {
        let root = ProgressComposite::new();
        let leaf = root.add_leaf();
        leaf.update(100, 40);

        let display = ProgressDisplay::new(ProgressConfig {
            update_interval: Duration::from_millis(5),
            ..ProgressConfig::default()
        });
        let bar = ProgressBar::hidden();
        let task = display.spawn_bar_task(root, bar.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(bar.length(), Some(100));
        assert_eq!(bar.position(), 40);

        display.shutdown.cancel();
        assert!(task.await.is_ok());
    }
}

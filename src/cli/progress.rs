//! Per-file transfer progress bars.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use devfleet::transfer::{TransferProgress, TransferProgressCallback};

/// Shows one progress bar for the file currently being transferred.
///
/// A progress event for a different path finishes the current bar and starts
/// a new one.
pub struct FileProgress {
    current: Mutex<Option<(PathBuf, ProgressBar)>>,
    hidden: bool,
}

impl FileProgress {
    /// Create a tracker; `hidden` suppresses drawing (JSON mode)
    pub fn new(hidden: bool) -> Arc<Self> {
        Arc::new(Self {
            current: Mutex::new(None),
            hidden,
        })
    }

    /// Callback feeding this tracker
    pub fn callback(self: &Arc<Self>) -> TransferProgressCallback {
        let this = Arc::clone(self);
        Arc::new(move |progress: &TransferProgress| this.update(progress))
    }

    fn new_bar(&self, path: &Path, total: u64) -> ProgressBar {
        let bar = ProgressBar::new(total);
        if self.hidden {
            bar.set_draw_target(ProgressDrawTarget::hidden());
            return bar;
        }
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})")
        {
            bar.set_style(style.progress_chars("=>-"));
        }
        bar.set_prefix(truncate_path(path, 40));
        bar
    }

    fn update(&self, progress: &TransferProgress) {
        let mut current = self.current.lock();

        let same_file = matches!(&*current, Some((path, _)) if *path == progress.path);
        if !same_file {
            if let Some((_, bar)) = current.take() {
                bar.finish();
            }
            let bar = self.new_bar(&progress.path, progress.total_bytes);
            *current = Some((progress.path.clone(), bar));
        }

        if let Some((_, bar)) = &*current {
            bar.set_position(progress.transferred_bytes);
        }
    }

    /// Finish the last bar
    pub fn finish(&self) {
        if let Some((_, bar)) = self.current.lock().take() {
            bar.finish();
        }
    }

    #[cfg(test)]
    fn current_path(&self) -> Option<PathBuf> {
        self.current.lock().as_ref().map(|(p, _)| p.clone())
    }
}

fn truncate_path(path: &Path, max_len: usize) -> String {
    let text = path.display().to_string();
    let len = text.chars().count();
    if len <= max_len {
        text
    } else {
        let tail: String = text.chars().skip(len - (max_len - 3)).collect();
        format!("...{}", tail)
    }
}

use indicatif::{ProgressBar, ProgressStyle};

/// Bar for long training loops; hidden when `visible` is false (tests, library callers).
pub fn training_progress(len: usize, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

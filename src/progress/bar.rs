use std::io::{self, Write};
use std::time::Duration;

use bytesize::ByteSize;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

const TRANSFER_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] \
     {bytes}/{total_bytes} ({bytes_per_sec}, ETA {eta}) {msg}";

/// Create a progress bar for tracking bytes of a single transfer.
///
/// Renders to stderr (not stdout) so piped output stays clean.
/// Returns a hidden bar if quiet mode is active.
pub fn create_transfer_progress(total_bytes: u64, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(total_bytes);
    pb.set_draw_target(ProgressDrawTarget::stderr());
    let style = ProgressStyle::with_template(TRANSFER_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");
    pb.set_style(style);
    pb
}

/// Wraps a `Write` and sets the bar position from a caller-supplied
/// progress source after every write.
///
/// Used for uploads, where accepted bytes and uploaded bytes differ.
pub struct ProgressWriter<W: Write, F: Fn(&W) -> u64> {
    inner: W,
    progress: ProgressBar,
    position: F,
}

impl<W: Write, F: Fn(&W) -> u64> ProgressWriter<W, F> {
    pub fn new(inner: W, progress: ProgressBar, position: F) -> Self {
        Self {
            inner,
            progress,
            position,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write, F: Fn(&W) -> u64> Write for ProgressWriter<W, F> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.progress.set_position((self.position)(&self.inner));
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// One-line completion summary, e.g. `Completed: report.csv (12.0 MiB) in 3.1s @ 3.9 MiB/s`.
pub fn transfer_summary(name: &str, bytes: u64, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 {
        (bytes as f64 / secs) as u64
    } else {
        0
    };
    format!(
        "Completed: {} ({}) in {:.1}s @ {}/s",
        name,
        ByteSize(bytes),
        secs,
        ByteSize(rate)
    )
}

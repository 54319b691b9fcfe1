//! Download progress reporting.
//!
//! Progress is attached where bytes come off the wire: a [`ProgressWriter`]
//! wraps the sink a response body is streamed into. Bars are only shown for
//! bodies larger than [`PROGRESS_THRESHOLD`], and every bar is either
//! completed or aborted, including when the download future is dropped.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::io::AsyncWrite;

/// Bodies at or below this size get no progress bar.
pub const PROGRESS_THRESHOLD: u64 = 64 * 1024;

/// A single progress indicator.
pub trait ProgressReporter: Send {
    fn advance(&mut self, n: u64);
    fn complete(&mut self);
    fn abort(&mut self);
}

/// Creates a reporter per transfer.
pub trait ProgressFactory: Send + Sync {
    fn start(&self, label: &str, total: u64) -> Box<dyn ProgressReporter>;
}

/// Terminal progress bars on stderr.
pub struct IndicatifProgress {
    multi: MultiProgress,
}

impl IndicatifProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::with_draw_target(ProgressDrawTarget::stderr()),
        }
    }

    pub fn shared() -> Arc<dyn ProgressFactory> {
        Arc::new(Self::new())
    }
}

impl Default for IndicatifProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressFactory for IndicatifProgress {
    fn start(&self, label: &str, total: u64) -> Box<dyn ProgressReporter> {
        let bar = self.multi.add(ProgressBar::new(total));
        if let Ok(style) = ProgressStyle::with_template(
            "{prefix:.bold.dim} {bar:40.green/green.dim} {bytes:.bold}/{total_bytes:.dim} {binary_bytes_per_sec}",
        ) {
            bar.set_style(style.progress_chars("=+-"));
        }
        bar.set_prefix(short_label(label));
        Box::new(IndicatifBar { bar })
    }
}

struct IndicatifBar {
    bar: ProgressBar,
}

impl ProgressReporter for IndicatifBar {
    fn advance(&mut self, n: u64) {
        self.bar.inc(n);
    }

    fn complete(&mut self) {
        self.bar.finish_and_clear();
    }

    fn abort(&mut self) {
        self.bar.abandon_with_message("aborted");
    }
}

/// Shorten `sha256:<hex>` style labels for display.
fn short_label(label: &str) -> String {
    match label.split_once(':') {
        Some((_, hex)) if hex.len() > 12 && hex.chars().all(|c| c.is_ascii_hexdigit()) => {
            hex[..12].to_string()
        }
        _ => label.to_string(),
    }
}

/// A writer that reports bytes written to an optional progress bar.
pub struct ProgressWriter<W> {
    inner: W,
    reporter: Option<Box<dyn ProgressReporter>>,
    finished: bool,
}

impl<W> ProgressWriter<W> {
    /// Wrap `inner`; a bar is attached only when `total` exceeds the threshold.
    pub fn new(inner: W, factory: Option<&dyn ProgressFactory>, label: &str, total: Option<u64>) -> Self {
        let reporter = match (factory, total) {
            (Some(factory), Some(total)) if total > PROGRESS_THRESHOLD => Some(factory.start(label, total)),
            _ => None,
        };
        Self {
            inner,
            reporter,
            finished: false,
        }
    }

    pub fn has_reporter(&self) -> bool {
        self.reporter.is_some()
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Mark the transfer successful and return the inner writer.
    pub fn finish(mut self) -> W
    where
        W: Default,
    {
        self.complete();
        std::mem::take(&mut self.inner)
    }

    /// Signal success without consuming the writer.
    pub fn complete(&mut self) {
        if let Some(ref mut r) = self.reporter {
            r.complete();
        }
        self.finished = true;
    }

    /// Signal failure without consuming the writer.
    pub fn abort(&mut self) {
        if !self.finished {
            if let Some(ref mut r) = self.reporter {
                r.abort();
            }
        }
        self.finished = true;
    }

    fn record(&mut self, n: usize) {
        if let Some(ref mut r) = self.reporter {
            r.advance(n as u64);
        }
    }
}

impl<W> Drop for ProgressWriter<W> {
    fn drop(&mut self) {
        self.abort();
    }
}

impl<W: io::Write> io::Write for ProgressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.record(n);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ProgressWriter<W> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.record(n);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

//! Progress notification collaborators.
//!
//! Sinks are called after every EM iteration with the integer percentage of
//! the iteration budget consumed so far. Delivery is fire-and-forget: each
//! notification runs on a dedicated thread, never on the compute pool, and a
//! sink that errors or panics is logged and otherwise ignored.

use log::warn;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Error type sinks may return; never inspected beyond logging.
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Receives training progress in percent (`0..=100`).
pub trait ProgressSink: Send + Sync {
    fn report_progress(&self, percent: u8) -> Result<(), SinkError>;
}

/// Sink that only writes a log line.
#[derive(Clone, Debug, Default)]
pub struct LogProgress {
    pub label: String,
}

impl ProgressSink for LogProgress {
    fn report_progress(&self, percent: u8) -> Result<(), SinkError> {
        log::info!("{} {}%", self.label, percent);
        Ok(())
    }
}

/// `floor(100 · iteration / max_iter)`, clamped to 100.
pub fn percent_complete(iteration: usize, max_iter: usize) -> u8 {
    if max_iter == 0 {
        return 100;
    }
    ((100 * iteration) / max_iter).min(100) as u8
}

/// Notifies every sink in the background.
pub(crate) fn dispatch(sinks: &[Arc<dyn ProgressSink>], percent: u8) {
    for sink in sinks {
        let sink = Arc::clone(sink);
        spawn_detached(move || notify(sink.as_ref(), percent));
    }
}

fn notify(sink: &dyn ProgressSink, percent: u8) {
    match catch_unwind(AssertUnwindSafe(|| sink.report_progress(percent))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("progress sink failed at {percent}%: {err}"),
        Err(_) => warn!("progress sink panicked at {percent}%"),
    }
}

/// Runs `job` on its own named thread, outside the rayon pool the parallel
/// backend computes on.
fn spawn_detached<F: FnOnce() + Send + 'static>(job: F) {
    if let Err(err) = std::thread::Builder::new()
        .name("cg-progress".into())
        .spawn(job)
    {
        warn!("could not spawn progress thread: {err}");
    }
}

//! `VideoTransform` stubs for driving the scheduler deterministically.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use unmark::transform::{TransformContext, TransformError, VideoTransform};

fn write_output(input: &Path, output: &Path) -> Result<(), TransformError> {
    let data = std::fs::read(input).map_err(|source| TransformError::Io {
        path: input.to_path_buf(),
        source,
    })?;
    std::fs::write(output, data).map_err(|source| TransformError::Io {
        path: output.to_path_buf(),
        source,
    })
}

fn stem(input: &Path) -> String {
    input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Processes `units` units of work, checking for cancellation before each.
///
/// With `pause_after` set, it stops after that many units and waits (up to
/// five seconds) for a cancel request before carrying on.
pub struct ScriptedTransform {
    units: usize,
    unit_delay: Duration,
    pause_after: Option<usize>,
    executed: AtomicUsize,
}

impl ScriptedTransform {
    pub fn new(units: usize) -> Self {
        Self {
            units,
            unit_delay: Duration::from_millis(5),
            pause_after: None,
            executed: AtomicUsize::new(0),
        }
    }

    pub fn pausing_after(mut self, units: usize) -> Self {
        self.pause_after = Some(units);
        self
    }

    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }
}

impl VideoTransform for ScriptedTransform {
    fn run(&self, input: &Path, output: &Path, ctx: &TransformContext) -> Result<(), TransformError> {
        for unit in 0..self.units {
            if Some(unit) == self.pause_after {
                let deadline = Instant::now() + Duration::from_secs(5);
                while !ctx.is_cancelled() && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
            ctx.checkpoint()?;
            std::thread::sleep(self.unit_delay);
            self.executed.fetch_add(1, Ordering::SeqCst);
            ctx.report_progress(((unit + 1) * 100 / self.units) as u8);
        }
        write_output(input, output)
    }
}

/// Blocks every job until released, tracking how many run at once.
#[derive(Default)]
pub struct GatedTransform {
    open: Mutex<bool>,
    signal: Condvar,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    started: AtomicUsize,
}

impl GatedTransform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn release(&self) {
        *self.open.lock().unwrap() = true;
        self.signal.notify_all();
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

impl VideoTransform for GatedTransform {
    fn run(&self, input: &Path, output: &Path, ctx: &TransformContext) -> Result<(), TransformError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.started.fetch_add(1, Ordering::SeqCst);

        let result = (|| {
            let mut open = self.open.lock().unwrap();
            while !*open {
                if ctx.is_cancelled() {
                    return Err(TransformError::Cancelled);
                }
                open = self
                    .signal
                    .wait_timeout(open, Duration::from_millis(10))
                    .unwrap()
                    .0;
            }
            drop(open);
            write_output(input, output)
        })();

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Fails any input whose file name contains `bad`.
pub struct FailingTransform;

impl VideoTransform for FailingTransform {
    fn run(&self, input: &Path, output: &Path, ctx: &TransformContext) -> Result<(), TransformError> {
        ctx.report_progress(40);
        if stem(input).contains("bad") {
            return Err(TransformError::Failed(format!("cannot decode {}", stem(input))));
        }
        std::thread::sleep(Duration::from_millis(5));
        write_output(input, output)
    }
}

/// Counts invocations per input and records dispatch order.
#[derive(Default)]
pub struct CountingTransform {
    calls: Mutex<HashMap<PathBuf, usize>>,
    order: Mutex<Vec<String>>,
}

impl CountingTransform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> HashMap<PathBuf, usize> {
        self.calls.lock().unwrap().clone()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    /// Input file names in the order the transform saw them.
    pub fn order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }
}

impl VideoTransform for CountingTransform {
    fn run(&self, input: &Path, output: &Path, ctx: &TransformContext) -> Result<(), TransformError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(input.to_path_buf())
            .or_insert(0) += 1;
        self.order.lock().unwrap().push(stem(input));
        ctx.report_progress(10);
        ctx.report_progress(60);
        write_output(input, output)
    }
}

/// Runs for a fixed time and never looks at the cancellation predicate.
pub struct PredicateIgnoringTransform {
    pub duration: Duration,
    started: AtomicUsize,
}

impl PredicateIgnoringTransform {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            started: AtomicUsize::new(0),
        }
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

impl VideoTransform for PredicateIgnoringTransform {
    fn run(&self, input: &Path, output: &Path, _ctx: &TransformContext) -> Result<(), TransformError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.duration);
        write_output(input, output)
    }
}

/// Sleeps in short steps until cancelled, recording whether it noticed.
#[derive(Default)]
pub struct HangingTransform {
    observed_cancel: AtomicUsize,
}

impl HangingTransform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observed_cancel(&self) -> usize {
        self.observed_cancel.load(Ordering::SeqCst)
    }
}

impl VideoTransform for HangingTransform {
    fn run(&self, _input: &Path, _output: &Path, ctx: &TransformContext) -> Result<(), TransformError> {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if ctx.is_cancelled() {
                self.observed_cancel.fetch_add(1, Ordering::SeqCst);
                return Err(TransformError::Cancelled);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        Err(TransformError::Failed("never cancelled".to_string()))
    }
}

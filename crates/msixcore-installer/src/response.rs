use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use msixcore_core::E_FAIL;

use crate::errors::error_code;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum InstallationStep {
    #[default]
    Unknown,
    Started,
    GetPackageInformation,
    Extraction,
    Completed,
    Error,
}

impl InstallationStep {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Started => "started",
            Self::GetPackageInformation => "get-package-information",
            Self::Extraction => "extraction",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseError {
    pub code: u32,
    pub text: String,
}

/// Snapshot of an operation's progress. The copy handed to callers is never
/// mutated; new states arrive as new snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    step: InstallationStep,
    percentage: f32,
    error: Option<ResponseError>,
}

impl Response {
    pub fn status(&self) -> InstallationStep {
        self.step
    }

    pub fn percentage(&self) -> f32 {
        self.percentage
    }

    pub fn error(&self) -> Option<&ResponseError> {
        self.error.as_ref()
    }

    pub fn error_code(&self) -> Option<u32> {
        self.error.as_ref().map(|error| error.code)
    }

    pub fn error_text(&self) -> Option<&str> {
        self.error.as_ref().map(|error| error.text.as_str())
    }

    pub fn is_terminal(&self) -> bool {
        self.step.is_terminal()
    }

    pub fn is_success(&self) -> bool {
        self.step == InstallationStep::Completed
    }

    fn failed(code: u32, text: impl Into<String>) -> Self {
        Self {
            step: InstallationStep::Error,
            percentage: 0.0,
            error: Some(ResponseError {
                code,
                text: text.into(),
            }),
        }
    }
}

pub type ProgressCallback = Box<dyn FnMut(&Response) + Send + 'static>;

#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Write side of a [`Response`], owned by whoever drives the operation.
///
/// Percentage never decreases, and once a terminal step is recorded every
/// further update is ignored, so observers see exactly one terminal snapshot
/// and it is always the last one.
pub struct ProgressReporter {
    current: Response,
    callback: Option<ProgressCallback>,
    updates: Option<Sender<Response>>,
    cancellation: CancellationToken,
}

impl ProgressReporter {
    pub fn new(
        callback: Option<ProgressCallback>,
        updates: Option<Sender<Response>>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            current: Response::default(),
            callback,
            updates,
            cancellation,
        }
    }

    /// Reporter with no observers, used by the synchronous operations.
    pub fn detached() -> Self {
        Self::new(None, None, CancellationToken::default())
    }

    pub fn snapshot(&self) -> &Response {
        &self.current
    }

    pub fn is_observed(&self) -> bool {
        self.callback.is_some() || self.updates.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn update(&mut self, step: InstallationStep, percentage: f32) {
        if self.current.is_terminal() || step.is_terminal() {
            return;
        }
        let percentage = percentage.clamp(0.0, 100.0).max(self.current.percentage);
        if step == self.current.step && percentage == self.current.percentage {
            return;
        }
        self.current.step = step;
        self.current.percentage = percentage;
        self.publish();
    }

    pub fn complete(&mut self) {
        if self.current.is_terminal() {
            return;
        }
        self.current.step = InstallationStep::Completed;
        self.current.percentage = 100.0;
        self.publish();
    }

    /// Records `err` as the terminal state, keeping the last percentage.
    pub fn fail(&mut self, err: &anyhow::Error) {
        if self.current.is_terminal() {
            return;
        }
        self.current.step = InstallationStep::Error;
        self.current.error = Some(ResponseError {
            code: error_code(err),
            text: format!("{err:#}"),
        });
        self.publish();
    }

    pub fn finish(self) -> Response {
        self.current
    }

    fn publish(&mut self) {
        let snapshot = self.current.clone();
        if let Some(callback) = self.callback.as_mut() {
            callback(&snapshot);
        }
        if let Some(updates) = &self.updates {
            // A dropped handle only means nobody polls any more.
            let _ = updates.send(snapshot);
        }
    }
}

/// Runs `operation` and records its outcome as the terminal step.
pub fn run_operation<Operation>(reporter: &mut ProgressReporter, operation: Operation) -> Result<()>
where
    Operation: FnOnce(&mut ProgressReporter) -> Result<()>,
{
    match operation(reporter) {
        Ok(()) => {
            reporter.complete();
            Ok(())
        }
        Err(err) => {
            reporter.fail(&err);
            Err(err)
        }
    }
}

/// Caller side of an asynchronous operation. The background thread owns the
/// operation state; this handle only reads snapshots and can request
/// cancellation.
#[derive(Debug)]
pub struct DeploymentHandle {
    latest: Response,
    updates: Receiver<Response>,
    cancellation: CancellationToken,
    worker: Option<JoinHandle<Response>>,
}

impl DeploymentHandle {
    pub fn spawn<Operation>(
        name: &str,
        callback: Option<ProgressCallback>,
        operation: Operation,
    ) -> Result<Self>
    where
        Operation: FnOnce(&mut ProgressReporter) -> Result<()> + Send + 'static,
    {
        let (sender, updates) = crossbeam_channel::unbounded();
        let cancellation = CancellationToken::default();
        let mut reporter = ProgressReporter::new(callback, Some(sender), cancellation.clone());
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _ = run_operation(&mut reporter, operation);
                reporter.finish()
            })
            .with_context(|| format!("failed to spawn deployment task '{name}'"))?;

        Ok(Self {
            latest: Response::default(),
            updates,
            cancellation,
            worker: Some(worker),
        })
    }

    pub fn response(&mut self) -> &Response {
        while let Ok(snapshot) = self.updates.try_recv() {
            self.latest = snapshot;
        }
        &self.latest
    }

    pub fn status(&mut self) -> InstallationStep {
        self.response().status()
    }

    pub fn percentage(&mut self) -> f32 {
        self.response().percentage()
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.worker
            .as_ref()
            .map_or(true, |worker| worker.is_finished())
    }

    /// Blocks until the task ends and returns its terminal snapshot.
    pub fn wait(mut self) -> Response {
        let Some(worker) = self.worker.take() else {
            return self.latest;
        };
        match worker.join() {
            Ok(response) => response,
            Err(_) => Response::failed(E_FAIL, "deployment task panicked"),
        }
    }
}

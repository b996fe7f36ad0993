use std::sync::Mutex;

use tokio::sync::oneshot;

use uplink_protocol::{PromptDescriptor, ResponseEnvelope};

use crate::error::UplinkError;

/// Resolution of an outstanding prompt.
#[derive(Debug, PartialEq, Eq)]
pub enum PromptAnswer {
    /// Operator-provided value, written verbatim (plus newline) to the
    /// subprocess.
    Value(String),
    /// Cancellation sentinel: nothing is written, the session is shutting
    /// down.
    Cancelled,
}

struct GateInner {
    outstanding: Option<PromptDescriptor>,
    tx: Option<oneshot::Sender<PromptAnswer>>,
}

/// Single-slot mediator between a prompt consumer and the subprocess input
/// stream. At most one prompt is outstanding at a time; answers referencing
/// any other prompt id are rejected as stale and discarded.
pub struct ResponseGate {
    inner: Mutex<GateInner>,
}

impl ResponseGate {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GateInner {
                outstanding: None,
                tx: None,
            }),
        }
    }

    /// Publish a new outstanding prompt. Fails if the previous one has not
    /// resolved yet.
    pub fn arm(
        &self,
        descriptor: PromptDescriptor,
    ) -> Result<oneshot::Receiver<PromptAnswer>, UplinkError> {
        let mut inner = self.lock();
        if inner.outstanding.is_some() {
            return Err(UplinkError::PromptOverlap);
        }
        let (tx, rx) = oneshot::channel();
        inner.outstanding = Some(descriptor);
        inner.tx = Some(tx);
        Ok(rx)
    }

    /// The currently outstanding prompt, if any.
    pub fn awaiting(&self) -> Option<PromptDescriptor> {
        self.lock().outstanding.clone()
    }

    /// Accept an operator answer. The envelope must reference the currently
    /// outstanding prompt's id; duplicates and late retries are rejected.
    pub fn submit(&self, envelope: ResponseEnvelope) -> Result<(), UplinkError> {
        let mut inner = self.lock();
        let outstanding_id = match &inner.outstanding {
            Some(descriptor) => descriptor.id,
            None => return Err(UplinkError::NoPromptOutstanding),
        };
        if envelope.prompt_id != outstanding_id {
            return Err(UplinkError::PromptStale {
                submitted: envelope.prompt_id,
                outstanding: outstanding_id,
            });
        }
        inner.outstanding = None;
        if let Some(tx) = inner.tx.take() {
            // Receiver dropped means the session is already tearing down.
            let _ = tx.send(PromptAnswer::Value(envelope.value));
        }
        Ok(())
    }

    /// Forcibly resolve the outstanding prompt with the cancellation
    /// sentinel. Returns the resolved prompt's id, if one was outstanding.
    pub fn cancel(&self) -> Option<u64> {
        let mut inner = self.lock();
        let id = inner.outstanding.take().map(|d| d.id)?;
        if let Some(tx) = inner.tx.take() {
            let _ = tx.send(PromptAnswer::Cancelled);
        }
        Some(id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for ResponseGate {
    fn default() -> Self {
        Self::new()
    }
}

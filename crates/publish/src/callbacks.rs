//! Callback-style front end for [`Publisher::publish`].
//!
//! Hosts that cannot consume an event channel pass closures instead, plus a
//! predicate polled for cancellation.

use std::future::pending;

use deltapush_protocol::RemoteFileRecord;
use tokio::sync::mpsc;
use tracing::debug;

use crate::orchestrator::Publisher;
use crate::types::{PublishEvent, UploadRequest};

type SuccessFn = Box<dyn FnOnce(&RemoteFileRecord, &str) + Send>;
type ErrorFn = Box<dyn FnOnce(&str, &str) + Send>;
type ProgressFn = Box<dyn Fn(&str, f64, &str, &str) + Send + Sync>;
type CancelledFn = Box<dyn FnOnce() + Send>;

/// Callbacks of one [`upload`] call. Exactly one of `on_success`,
/// `on_error` and `on_cancelled` runs.
pub struct UploadCallbacks {
    /// Final record and a human-readable message.
    pub on_success: SuccessFn,
    /// Error headline and details.
    pub on_error: ErrorFn,
    /// Header, fraction, status and sub-status.
    pub on_progress: ProgressFn,
    pub on_cancelled: CancelledFn,
}

impl UploadCallbacks {
    pub fn new(
        on_success: impl FnOnce(&RemoteFileRecord, &str) + Send + 'static,
        on_error: impl FnOnce(&str, &str) + Send + 'static,
    ) -> Self {
        Self {
            on_success: Box::new(on_success),
            on_error: Box::new(on_error),
            on_progress: Box::new(|_, _, _, _| {}),
            on_cancelled: Box::new(|| {}),
        }
    }

    pub fn on_progress(
        mut self,
        on_progress: impl Fn(&str, f64, &str, &str) + Send + Sync + 'static,
    ) -> Self {
        self.on_progress = Box::new(on_progress);
        self
    }

    pub fn on_cancelled(mut self, on_cancelled: impl FnOnce() + Send + 'static) -> Self {
        self.on_cancelled = Box::new(on_cancelled);
        self
    }
}

/// Runs one publish call, reporting through `callbacks`.
///
/// `cancel_requested` is evaluated every
/// [`cancel_poll_interval`](crate::PublishConfig::cancel_poll_interval);
/// once it returns `true` the publisher's token is cancelled. Progress is
/// forwarded only if the publisher's event receiver has not been taken.
pub async fn upload(
    publisher: &mut Publisher,
    request: UploadRequest,
    callbacks: UploadCallbacks,
    cancel_requested: impl Fn() -> bool,
) {
    let UploadCallbacks {
        on_success,
        on_error,
        on_progress,
        on_cancelled,
    } = callbacks;
    let forward = |event: PublishEvent| {
        if let PublishEvent::Progress {
            header,
            fraction,
            status,
            sub_status,
        } = event
        {
            on_progress(&header, fraction, &status, &sub_status);
        }
    };

    let mut events = publisher.take_events();
    let cancel = publisher.cancel_token();
    let mut ticker = tokio::time::interval(publisher.config().cancel_poll_interval());

    let publish = publisher.publish(request);
    tokio::pin!(publish);
    let result = loop {
        tokio::select! {
            result = &mut publish => break result,
            Some(event) = next_event(&mut events) => forward(event),
            _ = ticker.tick(), if !cancel.is_cancelled() => {
                if cancel_requested() {
                    debug!("cancellation requested by caller");
                    cancel.cancel();
                }
            }
        }
    };

    if let Some(rx) = events.as_mut() {
        while let Ok(event) = rx.try_recv() {
            forward(event);
        }
    }

    match result {
        Ok(done) => on_success(&done.record, &done.message),
        Err(e) if e.is_cancelled() => on_cancelled(),
        Err(e) => on_error(e.summary(), &e.to_string()),
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<PublishEvent>>) -> Option<PublishEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

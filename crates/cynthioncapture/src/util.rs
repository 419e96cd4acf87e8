//! Utility code that doesn't belong anywhere specific.

use std::any::Any;
use std::thread::JoinHandle;

use anyhow::{Context, bail};
use futures_channel::oneshot;

use crate::Result;

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    match (panic.downcast_ref::<&str>(), panic.downcast_ref::<String>()) {
        (Some(&s), _) => s,
        (_, Some(s)) => s,
        (None, None) => "<No panic message>",
    }
}

/// Wait for a worker thread, turning a panic into an error.
pub fn join_worker<T>(name: &str, worker: JoinHandle<Result<T>>) -> Result<T> {
    match worker.join() {
        Ok(result) => result.with_context(|| format!("{name} thread failed")),
        Err(panic) => bail!("{name} thread panic: {}", panic_message(panic.as_ref())),
    }
}

/// Whether a worker has been asked to stop, or its stop handle has gone.
pub fn stop_requested(stop_rx: &mut oneshot::Receiver<()>) -> bool {
    !matches!(stop_rx.try_recv(), Ok(None))
}

use std::thread::JoinHandle;

/// Joins a worker thread, downgrading its panic to an error log so
/// shutdown keeps going.
pub(crate) fn join<T>(handle: &mut Option<JoinHandle<T>>) {
    let Some(handle) = handle.take() else {
        return;
    };

    let name = handle
        .thread()
        .name()
        .map(str::to_owned)
        .unwrap_or_default();
    log::trace!("Joining worker thread `{name}`");

    if let Err(cause) = handle.join() {
        let reason = cause
            .downcast_ref::<&'static str>()
            .map(|s| (*s).to_owned())
            .or_else(|| cause.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic payload is not a string".to_owned());
        log::error!("Worker thread `{name}` panicked: {reason}");
    }
}

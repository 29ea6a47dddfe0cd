use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error};
use std::io;
use std::thread::{self, JoinHandle};

/// A named background thread with an explicit stop channel.
///
/// The body receives the stop receiver and is expected to return soon after
/// a message (or disconnect) arrives on it. [`Worker::stop`] sends the stop
/// and joins, so handles are never released while the thread still runs.
pub struct Worker {
    name: String,
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn<F>(name: &str, body: F) -> io::Result<Self>
    where
        F: FnOnce(Receiver<()>) + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded(1);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(stop_rx))?;
        debug!("Started {} worker", name);

        Ok(Self {
            name: name.to_string(),
            stop_tx,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Signal the worker and wait for it to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("{} worker panicked", self.name);
            } else {
                debug!("Stopped {} worker", self.name);
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_stop_joins_loop() {
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = ticks.clone();
        let worker = Worker::spawn("ticker", move |stop| {
            while stop.recv_timeout(Duration::from_millis(1)).is_err() {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        })
        .unwrap();

        thread::sleep(Duration::from_millis(20));
        assert!(!worker.is_finished());
        worker.stop();

        let after = ticks.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(ticks.load(Ordering::Relaxed), after);
    }
}

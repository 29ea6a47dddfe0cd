use super::SyncedCycle;

/// Consumer of synchronized frames.
///
/// Sinks are called synchronously from the frame producer (the acquisition
/// or playback worker), so `on_frame` must not block: copy what is needed
/// into a buffer or hand it to a queue with a non-blocking send.
pub trait FrameSink: Send + Sync {
    /// Identifier used in logs and metrics
    fn name(&self) -> &str;

    fn on_frame(&self, cycle: &SyncedCycle);
}

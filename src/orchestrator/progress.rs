//! Progress reporting and cooperative cancellation (spec.md §4.I, §5).
//!
//! `ProgressSink` replaces the source's per-call injected callback with a
//! capability the orchestrator holds; sinks are freely composable (see
//! SPEC_FULL.md §2.1/§9 "Progress callback").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One progress update, spec.md §3's ProgressEvent.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressEvent {
	pub request_id: String,
	pub algorithm: &'static str,
	pub stage_name: String,
	pub fraction: f32,
	pub eta_seconds: Option<f32>,
}

pub trait ProgressSink: Send + Sync {
	fn emit(&self, event: ProgressEvent);
}

/// Discards every event. The default when the caller does not care.
pub struct DiscardSink;

impl ProgressSink for DiscardSink {
	fn emit(&self, _event: ProgressEvent) {}
}

/// Logs every event at `debug!`.
pub struct StderrSink;

impl ProgressSink for StderrSink {
	fn emit(&self, event: ProgressEvent) {
		log::debug!(
			"progress: request={} algorithm={} stage={} fraction={:.3}",
			event.request_id,
			event.algorithm,
			event.stage_name,
			event.fraction
		);
	}
}

/// Forwards every event to an `mpsc` channel; the receiving end applies
/// whatever backpressure it wants (spec.md §5's sink-backpressure
/// suspension point).
pub struct ChannelSink(pub Sender<ProgressEvent>);

impl ProgressSink for ChannelSink {
	fn emit(&self, event: ProgressEvent) {
		let _ = self.0.send(event);
	}
}

const THROTTLE: Duration = Duration::from_millis(100);

/// Wraps a `ProgressSink`, throttling to at most one event per ~100ms
/// while always letting through 0%, 1.0, and end-of-stage boundary events
/// (spec.md §4.I). Not itself a `ProgressSink` — the orchestrator drives it
/// directly so it can distinguish "boundary" emissions from interpolated
/// ones.
pub(crate) struct ThrottledEmitter<'a> {
	sink: &'a dyn ProgressSink,
	request_id: String,
	algorithm: &'static str,
	last_emit: Option<Instant>,
}

impl<'a> ThrottledEmitter<'a> {
	pub fn new(sink: &'a dyn ProgressSink, request_id: String, algorithm: &'static str) -> Self {
		ThrottledEmitter { sink, request_id, algorithm, last_emit: None }
	}

	/// `force` bypasses the throttle: used for the guaranteed 0.0, 1.0, and
	/// stage-boundary points spec.md §4.I requires regardless of cadence.
	pub fn emit(&mut self, stage_name: &str, fraction: f32, force: bool) {
		let now = Instant::now();
		if !force {
			if let Some(last) = self.last_emit {
				if now.duration_since(last) < THROTTLE {
					return;
				}
			}
		}
		self.last_emit = Some(now);
		self.sink.emit(ProgressEvent {
			request_id: self.request_id.clone(),
			algorithm: self.algorithm,
			stage_name: stage_name.to_string(),
			fraction: fraction.clamp(0.0, 1.0),
			eta_seconds: None,
		});
	}
}

/// Cooperative cancellation token, polled at stage and tile boundaries
/// (spec.md §5). Cloning shares the same underlying flag; `cancel()` from
/// any clone is observed by all.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
	pub fn new() -> Self {
		CancelToken(Arc::new(AtomicBool::new(false)))
	}

	pub fn cancel(&self) {
		self.0.store(true, Ordering::SeqCst);
	}

	pub fn is_cancelled(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Mutex;

	struct RecordingSink(Mutex<Vec<ProgressEvent>>);

	impl ProgressSink for RecordingSink {
		fn emit(&self, event: ProgressEvent) {
			self.0.lock().unwrap().push(event);
		}
	}

	#[test]
	fn boundary_events_bypass_throttle() {
		let sink = RecordingSink(Mutex::new(Vec::new()));
		let mut emitter = ThrottledEmitter::new(&sink, "req-1".into(), "segmentation_3d");
		emitter.emit("a", 0.0, true);
		emitter.emit("a", 0.5, true);
		emitter.emit("a", 1.0, true);
		assert_eq!(sink.0.lock().unwrap().len(), 3);
	}

	#[test]
	fn non_forced_events_are_throttled_when_rapid() {
		let sink = RecordingSink(Mutex::new(Vec::new()));
		let mut emitter = ThrottledEmitter::new(&sink, "req-1".into(), "segmentation_3d");
		emitter.emit("a", 0.0, true);
		emitter.emit("a", 0.1, false);
		emitter.emit("a", 0.2, false);
		assert_eq!(sink.0.lock().unwrap().len(), 1);
	}

	#[test]
	fn cancel_is_observed_across_clones() {
		let token = CancelToken::new();
		let clone = token.clone();
		assert!(!token.is_cancelled());
		clone.cancel();
		assert!(token.is_cancelled());
	}
}

//! The global, arrival-ordered expiration queue (§4.4).
//!
//! Every flow gets the same fixed timeout, so arrival order already equals expiration order: the
//! queue is a plain FIFO rather than a heap or timer wheel, and the head is always the next flow
//! due to expire.

use collections::IntrusiveList;

use crate::source::SourceKey;

/// Identifies a flow by the path needed to reach it: which bucket its source lives in, the
/// source's key within that bucket, and the flow's key within the source's own flow list.
#[derive(Clone, Copy)]
pub struct FlowKey {
	pub source: SourceKey,
	pub flow: usize,
}

struct Entry {
	flow: FlowKey,
	expires_at: u64,
}

#[derive(Default)]
pub struct TimerQueue {
	entries: IntrusiveList<Entry>,
}

/// A handle a `Flow` stores so it can remove its own timer entry in O(1), from any position in
/// the queue, regardless of whether the entry is still at the head.
pub type TimerHandle = usize;

impl TimerQueue {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, flow: FlowKey, expires_at: u64) -> TimerHandle {
		self.entries.push_back(Entry { flow, expires_at })
	}

	pub fn remove(&mut self, handle: TimerHandle) {
		self.entries.remove(handle);
	}

	/// The flow and expiry at the head of the queue, if any — the next candidate for eviction.
	pub fn peek_head(&self) -> Option<(FlowKey, u64)> {
		self.entries.front().map(|entry| (entry.flow, entry.expires_at))
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

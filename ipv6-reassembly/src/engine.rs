//! The public entry point (§4.5–§4.7): eviction policy, `manage_fragment`, and reassembly
//! completion, all running under one mutex guarding the whole engine.

use core::net::Ipv6Addr;
use std::sync::Mutex;

use crate::flow::Flow;
use crate::header;
use crate::source::{Source, SourceKey, SourceTable};
use crate::timer::{FlowKey, TimerQueue};

/// One fragment handed to the engine by the packet-processing pipeline upstream. The header and
/// fragment-header fields it carries are already parsed; this crate never walks IPv6 extension
/// headers itself.
pub struct IncomingFragment<'a> {
	pub src: Ipv6Addr,
	pub dst: Ipv6Addr,
	pub identification: u32,
	pub offset: u16,
	pub more_fragments: bool,
	pub next_header: u8,
	/// Bytes preceding the fragment header: the fixed IPv6 header plus any extension headers.
	pub unfragmentable: &'a [u8],
	/// This fragment's slice of the original datagram's payload, `[offset, offset + len)`.
	pub fragmentable: &'a [u8],
}

#[derive(Clone, Copy)]
pub struct Limits {
	pub per_source_memory: u32,
	pub total_memory: u32,
	pub timeout_seconds: u8,
	/// Whether fragments whose (unfragmentable + fragmentable) length is under 1280 bytes are
	/// rejected outright. Default `true`; see the Open Questions record for why this is a toggle
	/// rather than an always-on check.
	pub enforce_min_mtu: bool,
}

impl Default for Limits {
	fn default() -> Self {
		Self { per_source_memory: 8 * 1024, total_memory: 32 * 1024 * 1024, timeout_seconds: 30, enforce_min_mtu: true }
	}
}

struct Inner {
	table: SourceTable,
	timers: TimerQueue,
	limits: Limits,
	total_used_mem: usize,
}

/// A stateful IPv6 fragment reassembly engine, safe to share across threads behind an `Arc`.
pub struct Engine {
	inner: Mutex<Inner>,
}

impl Engine {
	/// Creates an engine with `table_size` source-table buckets and default limits. `None` if
	/// `table_size` is zero.
	pub fn new(table_size: u16) -> Option<Engine> {
		let table = SourceTable::new(table_size)?;

		Some(Engine {
			inner: Mutex::new(Inner { table, timers: TimerQueue::new(), limits: Limits::default(), total_used_mem: 0 }),
		})
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
		self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	pub fn set_per_host_memory_limit(&self, bytes: u32) {
		self.lock().limits.per_source_memory = bytes;
	}

	pub fn set_total_memory_limit(&self, bytes: u32) {
		self.lock().limits.total_memory = bytes;
	}

	pub fn set_reassembly_timeout(&self, seconds: u8) {
		self.lock().limits.timeout_seconds = seconds;
	}

	pub fn set_enforce_min_mtu(&self, enforce: bool) {
		self.lock().limits.enforce_min_mtu = enforce;
	}

	/// Total memory currently charged across every source, for diagnostics and tests.
	pub fn total_used_mem(&self) -> usize {
		self.lock().total_used_mem
	}

	/// Accepts one fragment, buffering it. Returns the fully reassembled datagram once its last
	/// fragment arrives, `None` otherwise — including for every rejected or malformed input; see
	/// §7 for the full "drop and continue" philosophy this follows.
	pub fn manage_fragment(&self, fragment: IncomingFragment<'_>, current_time: u64) -> Option<Vec<u8>> {
		self.lock().manage_fragment(fragment, current_time)
	}

	/// Consumes the engine, releasing all buffered state. Equivalent to dropping it; kept as an
	/// explicit call for callers that want an auditable teardown point.
	pub fn shutdown(self) {}
}

impl Inner {
	fn manage_fragment(&mut self, fragment: IncomingFragment<'_>, current_time: u64) -> Option<Vec<u8>> {
		if self.limits.enforce_min_mtu && fragment.unfragmentable.len() + fragment.fragmentable.len() < 1280 {
			log::debug!("ipv6 reassembly: dropping undersize fragment");
			return None;
		}

		let end = fragment.offset as u32 + fragment.fragmentable.len() as u32;

		if end > 65535 {
			log::debug!("ipv6 reassembly: dropping fragment with out-of-range end offset {end}");
			return None;
		}

		let end = end as u16;

		let (source_key, created) = self.table.find_or_create(fragment.src);

		if created {
			self.total_used_mem += core::mem::size_of::<Source>();
		}

		if self.apply_eviction(source_key, current_time) {
			return None;
		}

		let flow_key = self.find_or_create_flow(source_key, fragment.identification, fragment.dst, current_time);
		let flow_len = self.table.get(source_key).flows.get(flow_key).len;

		if flow_len != 0 && fragment.offset as u32 > flow_len {
			log::debug!("ipv6 reassembly: dropping fragment past known datagram length");
			return None;
		}

		let charged = {
			let flow = self.table.get_mut(source_key).flows.get_mut(flow_key);
			flow.stash_unfragmentable(fragment.unfragmentable, fragment.next_header)
		};

		self.table.get_mut(source_key).used_mem += charged;
		self.total_used_mem += charged;

		if !fragment.more_fragments {
			let flow = self.table.get_mut(source_key).flows.get_mut(flow_key);

			if flow.len != 0 {
				log::debug!("ipv6 reassembly: dropping redundant terminal fragment");
				return None;
			}

			flow.len = end as u32;
		}

		let (removed, inserted) = {
			let flow = self.table.get_mut(source_key).flows.get_mut(flow_key);
			flow.fragments.insert(fragment.fragmentable, fragment.offset, end)
		};

		self.table.get_mut(source_key).used_mem += inserted;
		self.table.get_mut(source_key).used_mem -= removed;
		self.total_used_mem += inserted;
		self.total_used_mem -= removed;

		if !self.table.get(source_key).flows.get(flow_key).is_complete() {
			return None;
		}

		self.build_complete_datagram(source_key, flow_key)
	}

	/// Evicts flows in the order laid out in §4.5: per-source pressure first (aborting if the
	/// current source empties), then global pressure/expiry. The global loop compares the emptied
	/// source against the *current* one, not against whichever source actually lost a flow — the
	/// original's asymmetry, kept for compatibility (see the Open Questions record).
	fn apply_eviction(&mut self, source_key: SourceKey, current_time: u64) -> bool {
		loop {
			let source = self.table.get(source_key);

			if source.used_mem <= self.limits.per_source_memory as usize {
				break;
			}

			let Some(victim) = source.flows.front_key() else { break };

			if self.evict_flow(source_key, victim) {
				self.destroy_source(source_key);
				return true;
			}
		}

		loop {
			let Some((flow_key, expires_at)) = self.timers.peek_head() else { break };

			let over_budget = self.total_used_mem >= self.limits.total_memory as usize;

			if expires_at >= current_time && !over_budget {
				break;
			}

			let emptied = self.evict_flow(flow_key.source, flow_key.flow);

			if !emptied {
				continue;
			}

			self.destroy_source(flow_key.source);

			if flow_key.source == source_key {
				return true;
			}
		}

		false
	}

	fn find_or_create_flow(&mut self, source_key: SourceKey, identification: u32, dst: Ipv6Addr, current_time: u64) -> usize {
		{
			let source = self.table.get(source_key);

			if let Some((flow_key, _)) = source.flows.iter().find(|&(_, f)| f.matches(identification, dst)) {
				return flow_key;
			}
		}

		let flow_key = {
			let source = self.table.get_mut(source_key);
			let key = source.flows.push_front(Flow::new(identification, dst, 0));
			source.used_mem += core::mem::size_of::<Flow>();
			key
		};

		self.total_used_mem += core::mem::size_of::<Flow>();

		let expires_at = current_time + self.limits.timeout_seconds as u64;
		let timer = self.timers.push(FlowKey { source: source_key, flow: flow_key }, expires_at);
		self.table.get_mut(source_key).flows.get_mut(flow_key).timer = timer;

		flow_key
	}

	/// Unlinks the flow at `(source_key, flow_key)`, unaccounting its memory from both counters
	/// and removing its timer entry. Returns whether its source is now empty.
	fn evict_flow(&mut self, source_key: SourceKey, flow_key: usize) -> bool {
		let source = self.table.get_mut(source_key);
		let flow = source.flows.remove(flow_key);
		let freed = flow.used_mem();

		source.used_mem -= freed;
		let emptied = source.flows.is_empty();

		self.total_used_mem -= freed;
		self.timers.remove(flow.timer);

		emptied
	}

	fn destroy_source(&mut self, source_key: SourceKey) {
		let source = self.table.delete(source_key);
		self.total_used_mem -= source.used_mem;
	}

	fn destroy_flow(&mut self, source_key: SourceKey, flow_key: usize) {
		if self.evict_flow(source_key, flow_key) {
			self.destroy_source(source_key);
		}
	}

	/// §4.7: allocates the reassembled datagram, copies the unfragmentable prefix and the
	/// compacted fragment train into it, patches the payload-length field, and tears down the
	/// flow (and its source, if now empty) regardless of success.
	fn build_complete_datagram(&mut self, source_key: SourceKey, flow_key: usize) -> Option<Vec<u8>> {
		let flow = self.table.get(source_key).flows.get(flow_key);
		let unfragmentable_len = flow.unfragmentable.as_ref().map_or(0, Vec::len);
		let total = unfragmentable_len + flow.len as usize;

		if total > 65535 {
			log::warn!("ipv6 reassembly: reassembled datagram too large ({total} bytes), dropping");
			self.destroy_flow(source_key, flow_key);
			return None;
		}

		let mut buf = vec![0u8; total];

		if let Some(unfragmentable) = &flow.unfragmentable {
			buf[..unfragmentable_len].copy_from_slice(unfragmentable);
		}

		let compacted = flow.fragments.compact(&mut buf[unfragmentable_len..], flow.len as u16);

		if compacted.is_none() {
			log::debug!("ipv6 reassembly: fragment list failed to compact contiguously");
			self.destroy_flow(source_key, flow_key);
			return None;
		}

		if unfragmentable_len >= header::HEADER_LEN {
			let payload_len = (flow.len as usize + unfragmentable_len - header::HEADER_LEN) as u16;
			header::patch_payload_len(&mut buf, payload_len);
		}

		self.destroy_flow(source_key, flow_key);
		Some(buf)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn addr(last: u8) -> Ipv6Addr {
		Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, last as u16)
	}

	fn unfrag() -> Vec<u8> {
		let mut buf = vec![0u8; header::HEADER_LEN];
		buf[0] = 0x60;
		buf
	}

	#[test]
	fn zero_bucket_count_is_rejected() {
		assert!(Engine::new(0).is_none());
	}

	#[test]
	fn undersize_fragment_is_dropped_by_default() {
		let engine = Engine::new(16).unwrap();
		let unfragmentable = unfrag();

		let result = engine.manage_fragment(
			IncomingFragment {
				src: addr(1),
				dst: addr(2),
				identification: 1,
				offset: 0,
				more_fragments: false,
				next_header: 6,
				unfragmentable: &unfragmentable,
				fragmentable: b"AAAA",
			},
			0,
		);

		assert!(result.is_none());
		assert_eq!(engine.total_used_mem(), 0);
	}

	#[test]
	fn oversize_end_offset_is_rejected() {
		let engine = Engine::new(16).unwrap();
		engine.set_enforce_min_mtu(false);

		let result = engine.manage_fragment(
			IncomingFragment {
				src: addr(1),
				dst: addr(2),
				identification: 1,
				offset: 65535,
				more_fragments: false,
				next_header: 6,
				unfragmentable: &[],
				fragmentable: b"AB",
			},
			0,
		);

		assert!(result.is_none());
		assert_eq!(engine.total_used_mem(), 0);
	}

	#[test]
	fn two_fragment_reassembly_returns_the_joined_payload() {
		let engine = Engine::new(16).unwrap();
		engine.set_enforce_min_mtu(false);
		let unfragmentable = unfrag();

		let first = engine.manage_fragment(
			IncomingFragment {
				src: addr(1),
				dst: addr(2),
				identification: 0x1234,
				offset: 0,
				more_fragments: true,
				next_header: 6,
				unfragmentable: &unfragmentable,
				fragmentable: b"AAAA",
			},
			0,
		);
		assert!(first.is_none());

		let second = engine.manage_fragment(
			IncomingFragment {
				src: addr(1),
				dst: addr(2),
				identification: 0x1234,
				offset: 4,
				more_fragments: false,
				next_header: 6,
				unfragmentable: &[],
				fragmentable: b"BBBB",
			},
			0,
		);

		let datagram = second.expect("second fragment should complete the datagram");
		assert_eq!(&datagram[header::HEADER_LEN..], b"AAAABBBB");
		assert_eq!(engine.total_used_mem(), 0);
	}

	#[test]
	fn expired_flow_is_reclaimed_before_the_next_call() {
		let engine = Engine::new(16).unwrap();
		engine.set_enforce_min_mtu(false);
		engine.set_reassembly_timeout(1);
		let unfragmentable = unfrag();

		engine.manage_fragment(
			IncomingFragment {
				src: addr(1),
				dst: addr(2),
				identification: 1,
				offset: 0,
				more_fragments: true,
				next_header: 6,
				unfragmentable: &unfragmentable,
				fragmentable: b"AAAA",
			},
			10,
		);

		assert!(engine.total_used_mem() > 0);

		engine.manage_fragment(
			IncomingFragment {
				src: addr(3),
				dst: addr(4),
				identification: 2,
				offset: 0,
				more_fragments: true,
				next_header: 6,
				unfragmentable: &unfragmentable,
				fragmentable: b"CCCC",
			},
			12,
		);

		let second_flow_only = core::mem::size_of::<Source>() + core::mem::size_of::<Flow>() + unfragmentable.len() + 4;
		assert_eq!(engine.total_used_mem(), second_flow_only);
	}
}

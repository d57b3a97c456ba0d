//! The grouping of all in-progress flows from one IPv6 source address (§4.2), addressed by a
//! fixed-size array of hash buckets, each a doubly linked chain of `Source`s so that one can
//! unlink itself in O(1) on eviction without rescanning its bucket.

use core::net::Ipv6Addr;

use collections::IntrusiveList;

use crate::flow::Flow;

/// Addresses a `Source`: which bucket it hashes to, and its key within that bucket's chain.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SourceKey {
	pub bucket: usize,
	pub source: usize,
}

pub struct Source {
	pub addr: Ipv6Addr,
	pub flows: IntrusiveList<Flow>,
	/// Bytes charged to this source: itself, its flows, their unfragmentable buffers and fragment
	/// payloads. Maintained incrementally by the engine rather than recomputed, so it stays exact
	/// even mid-update (invariant 2).
	pub used_mem: usize,
}

impl Source {
	fn new(addr: Ipv6Addr) -> Self {
		Self { addr, flows: IntrusiveList::new(), used_mem: core::mem::size_of::<Source>() }
	}
}

/// Shift-add-XOR hash over the 16 address bytes, reproduced exactly as specified (§4.2) so that
/// bucket placement is reproducible, including under adversarial collisions: `h := (h<<5) +
/// (h>>2) + b ^ h`, evaluated left-to-right with `^` binding looser than `+`.
fn hash_addr(addr: &Ipv6Addr) -> u32 {
	let mut h: u32 = 0;

	for &b in addr.octets().iter() {
		h = (h.wrapping_shl(5).wrapping_add(h >> 2).wrapping_add(b as u32)) ^ h;
	}

	h
}

pub struct SourceTable {
	buckets: Vec<IntrusiveList<Source>>,
}

impl SourceTable {
	pub fn new(table_size: u16) -> Option<Self> {
		if table_size == 0 {
			return None;
		}

		Some(Self { buckets: (0..table_size).map(|_| IntrusiveList::new()).collect() })
	}

	fn bucket_of(&self, addr: &Ipv6Addr) -> usize {
		hash_addr(addr) as usize % self.buckets.len()
	}

	/// Finds the `Source` for `addr`, creating it if absent. Returns the key and whether a new
	/// `Source` was created, so the caller can charge `sizeof(Source)` to the global counter (the
	/// source's own counter already accounts for it via [`Source::new`]).
	pub fn find_or_create(&mut self, addr: Ipv6Addr) -> (SourceKey, bool) {
		let bucket = self.bucket_of(&addr);

		if let Some((source, _)) = self.buckets[bucket].iter().find(|&(_, s)| s.addr == addr) {
			return (SourceKey { bucket, source }, false);
		}

		let source = self.buckets[bucket].push_front(Source::new(addr));
		(SourceKey { bucket, source }, true)
	}

	pub fn get(&self, key: SourceKey) -> &Source {
		self.buckets[key.bucket].get(key.source)
	}

	pub fn get_mut(&mut self, key: SourceKey) -> &mut Source {
		self.buckets[key.bucket].get_mut(key.source)
	}

	/// Unlinks and returns the `Source` at `key`. The caller must already have destroyed (and
	/// unaccounted) every flow it held; this does not cascade.
	pub fn delete(&mut self, key: SourceKey) -> Source {
		self.buckets[key.bucket].remove(key.source)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn addr(last: u8) -> Ipv6Addr {
		Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, last as u16)
	}

	#[test]
	fn find_or_create_creates_once_and_finds_thereafter() {
		let mut table = SourceTable::new(16).unwrap();

		let (key1, created1) = table.find_or_create(addr(1));
		assert!(created1);

		let (key2, created2) = table.find_or_create(addr(1));
		assert!(!created2);
		assert!(key1.bucket == key2.bucket && key1.source == key2.source);
	}

	#[test]
	fn distinct_addresses_get_distinct_sources() {
		let mut table = SourceTable::new(16).unwrap();
		let (a, _) = table.find_or_create(addr(1));
		let (b, _) = table.find_or_create(addr(2));
		assert!(a.bucket != b.bucket || a.source != b.source);
	}

	#[test]
	fn hash_is_deterministic_across_calls() {
		let a = addr(0xab);
		assert_eq!(hash_addr(&a), hash_addr(&a));
	}

	#[test]
	fn zero_sized_table_is_rejected() {
		assert!(SourceTable::new(0).is_none());
	}

	#[test]
	fn delete_removes_the_source_from_its_bucket() {
		let mut table = SourceTable::new(16).unwrap();
		let (key, _) = table.find_or_create(addr(1));
		table.delete(key);

		let (_, created) = table.find_or_create(addr(1));
		assert!(created, "source should have been gone after delete");
	}
}

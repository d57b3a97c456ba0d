//! The in-flight reassembly state for one original datagram (§3, "Flow"), keyed by `(src, dst,
//! id)` at the `Source` level — this module only knows about the `(id, dst)` half, since the
//! source address is already implied by which `Source` owns the list a `Flow` lives in.

use core::net::Ipv6Addr;

use crate::fragments::FragmentList;
use crate::header;
use crate::timer::TimerHandle;

pub struct Flow {
	pub id: u32,
	pub dst: Ipv6Addr,
	/// The pre-fragment-header bytes, stashed from whichever fragment arrives first; `None` until
	/// then. Its length is `unfragmentable.len()`.
	pub unfragmentable: Option<Vec<u8>>,
	pub fragments: FragmentList,
	/// Total payload length of the final datagram. `0` until the terminal fragment (`more_fragments
	/// = false`) has been seen; invariant 5 then forbids any further update.
	pub len: u32,
	pub timer: TimerHandle,
}

impl Flow {
	pub fn new(id: u32, dst: Ipv6Addr, timer: TimerHandle) -> Self {
		Self { id, dst, unfragmentable: None, fragments: FragmentList::new(), len: 0, timer }
	}

	pub fn matches(&self, id: u32, dst: Ipv6Addr) -> bool {
		self.id == id && self.dst == dst
	}

	/// Stashes the unfragmentable part on first sight and patches in the real next-header byte,
	/// per §4.6 step 7. A no-op (and returns `0`) if it was already stashed by an earlier
	/// fragment of the same flow.
	pub fn stash_unfragmentable(&mut self, bytes: &[u8], next_header: u8) -> usize {
		if self.unfragmentable.is_some() {
			return 0;
		}

		let mut buf = bytes.to_vec();

		if buf.len() >= header::HEADER_LEN {
			header::patch_next_header(&mut buf, next_header);
		}

		let charged = buf.len();
		self.unfragmentable = Some(buf);
		charged
	}

	/// Memory already charged to this flow: its own fixed cost plus the unfragmentable buffer
	/// (once stashed) plus every fragment payload byte held so far.
	pub fn used_mem(&self) -> usize {
		core::mem::size_of::<Flow>() + self.unfragmentable.as_ref().map_or(0, Vec::len) + self.fragments.total_bytes()
	}

	/// True once the terminal fragment has been seen and the fragments received so far fill
	/// `[0, len)` with no holes.
	pub fn is_complete(&self) -> bool {
		self.len != 0 && self.fragments.all_contiguous() && self.fragments.last_end() == Some(self.len as u16)
	}
}

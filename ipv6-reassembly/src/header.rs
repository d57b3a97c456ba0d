//! Patching of the two fields of a stashed IPv6 "unfragmentable part" that must be rewritten once
//! a datagram is fully reassembled: the Next Header byte (which, while fragments were in flight,
//! named the fragment header rather than the real upper-layer protocol) and the Payload Length
//! field (which described only the first fragment, not the reassembled whole).

use core::net::Ipv6Addr;

use utils::bytes::{self, Cast};
use utils::endian::u16be;

/// The fixed 40-byte IPv6 header, as it appears at the front of the unfragmentable part.
///
/// Only the fields this crate actually touches are named; the version/traffic-class/flow-label
/// word is opaque here since the engine never interprets it.
#[derive(Cast)]
#[repr(C)]
pub struct Header {
	_ver_class_flow: [u8; 4],
	payload_len: u16be,
	next_header: u8,
	_hop_limit: u8,
	_src: Ipv6Addr,
	_dst: Ipv6Addr,
}

pub const HEADER_LEN: usize = core::mem::size_of::<Header>();

/// Overwrites the Next Header byte at its canonical position (offset 6) with `next_header`.
///
/// `buf` must contain at least [`HEADER_LEN`] bytes; the caller (`Flow::stash_unfragmentable`)
/// guarantees this by rejecting anything shorter well before this is called.
pub fn patch_next_header(buf: &mut [u8], next_header: u8) {
	let header: &mut Header = bytes::cast_mut(&mut buf[..HEADER_LEN]);
	header.next_header = next_header;
}

/// Overwrites the Payload Length field (offset 4, 2 bytes, network byte order) with `len`.
pub fn patch_payload_len(buf: &mut [u8], len: u16) {
	let header: &mut Header = bytes::cast_mut(&mut buf[..HEADER_LEN]);
	header.payload_len = len.into();
}

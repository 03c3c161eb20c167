//! Byte-to-text decoding of token pieces.
//!
//! Byte-level tokenizers can split one character over several tokens. The
//! decoder keeps the incomplete tail between calls instead of replacing it.

use encoding_rs::{CoderResult, Decoder, UTF_8};

pub struct PieceDecoder {
	decoder: Decoder,
}

impl Default for PieceDecoder {
	fn default() -> Self {
		Self::new()
	}
}

impl PieceDecoder {
	pub fn new() -> Self {
		Self {
			decoder: UTF_8.new_decoder(),
		}
	}

	/// Text completed by `bytes`; empty while a character is still incomplete.
	pub fn push(&mut self, bytes: &[u8]) -> String {
		let capacity = self
			.decoder
			.max_utf8_buffer_length(bytes.len())
			.unwrap_or(bytes.len() + 4);
		let mut out = String::with_capacity(capacity);
		let mut rest = bytes;
		loop {
			let (result, read, _) = self.decoder.decode_to_string(rest, &mut out, false);
			rest = &rest[read..];
			match result {
				CoderResult::InputEmpty => break,
				CoderResult::OutputFull => {
					let more = self.decoder.max_utf8_buffer_length(rest.len()).unwrap_or(rest.len() + 4);
					out.reserve(more);
				}
			}
		}
		out
	}

	/// Drops any buffered partial character.
	pub fn reset(&mut self) {
		self.decoder = UTF_8.new_decoder();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn split_characters_are_held_until_complete() {
		let mut decoder = PieceDecoder::new();
		let pieces: Vec<String> = "é😀".bytes().map(|b| decoder.push(&[b])).collect();
		assert_eq!(pieces, vec!["", "é", "", "", "", "😀"]);
	}

	#[test]
	fn whole_pieces_pass_through() {
		let mut decoder = PieceDecoder::new();
		assert_eq!(decoder.push(b"Hello"), "Hello");
		assert_eq!(decoder.push(" wörld".as_bytes()), " wörld");
	}

	#[test]
	fn reset_discards_a_pending_tail() {
		let mut decoder = PieceDecoder::new();
		assert_eq!(decoder.push(&[0xC3]), "");
		decoder.reset();
		assert_eq!(decoder.push(b"a"), "a");
	}
}

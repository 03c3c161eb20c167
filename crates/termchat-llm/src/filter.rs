//! Classification of decoded fragments before they reach a transcript.

use termchat_core::ChatTemplate;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FragmentClass {
	Emit,
	/// Drop the fragment but keep sampling.
	DiscardContinue,
	/// A template control marker leaked; end the generation.
	StopSequence,
}

/// Stateless fragment policy with a configurable stop-marker list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenFilter {
	stop_markers: Vec<String>,
}

impl Default for TokenFilter {
	fn default() -> Self {
		Self::for_template(ChatTemplate::default())
	}
}

impl TokenFilter {
	/// Empty markers are ignored: they would match every fragment.
	pub fn new<I, S>(stop_markers: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Self {
			stop_markers: stop_markers
				.into_iter()
				.map(Into::into)
				.filter(|m: &String| !m.is_empty())
				.collect(),
		}
	}

	pub fn for_template(template: ChatTemplate) -> Self {
		Self::new(template.default_stop_markers())
	}

	pub fn stop_markers(&self) -> &[String] {
		&self.stop_markers
	}

	pub fn classify(&self, fragment: &str) -> FragmentClass {
		if self.stop_markers.iter().any(|m| fragment.contains(m.as_str())) {
			return FragmentClass::StopSequence;
		}
		if fragment.is_empty() {
			return FragmentClass::DiscardContinue;
		}

		// Runs of bare symbols are degenerate output; a single one is punctuation.
		let informative = fragment
			.chars()
			.any(|c| c.is_alphanumeric() || c.is_whitespace());
		if !informative && fragment.chars().nth(1).is_some() {
			return FragmentClass::DiscardContinue;
		}
		FragmentClass::Emit
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn chatml_markers_stop() {
		let filter = TokenFilter::default();
		for fragment in ["<|im_end|>", "<|", "|>", "im_start", "<|endoftext|>", "foo im_end"] {
			assert_eq!(filter.classify(fragment), FragmentClass::StopSequence, "{fragment:?}");
		}
	}

	#[test]
	fn llama3_markers_stop() {
		let filter = TokenFilter::for_template(ChatTemplate::Llama3);
		assert_eq!(filter.classify("<|eot_id|>"), FragmentClass::StopSequence);
		assert_eq!(filter.classify("eot_id"), FragmentClass::StopSequence);
		assert_eq!(filter.classify("im_end"), FragmentClass::Emit);
	}

	#[test]
	fn empty_and_symbol_runs_are_discarded() {
		let filter = TokenFilter::default();
		assert_eq!(filter.classify(""), FragmentClass::DiscardContinue);
		assert_eq!(filter.classify("!!"), FragmentClass::DiscardContinue);
		assert_eq!(filter.classify("*#*"), FragmentClass::DiscardContinue);
		assert_eq!(filter.classify("……"), FragmentClass::DiscardContinue);
	}

	#[test]
	fn single_symbols_and_words_are_emitted() {
		let filter = TokenFilter::default();
		for fragment in [".", "!", "…", " ", "\n", "Hello", " world", "a.", " ?!", "日本", "42"] {
			assert_eq!(filter.classify(fragment), FragmentClass::Emit, "{fragment:?}");
		}
	}

	#[test]
	fn custom_marker_list_replaces_defaults() {
		let filter = TokenFilter::new(["</s>", ""]);
		assert_eq!(filter.stop_markers(), ["</s>".to_string()]);
		assert_eq!(filter.classify("end</s>"), FragmentClass::StopSequence);
		assert_eq!(filter.classify("<|im_end|>"), FragmentClass::Emit);
	}
}

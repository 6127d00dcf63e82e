#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Once};

use llm_enforce::config::COMPLETE_ALPHABET;
use llm_enforce::enforcer::{TokenEnforcer, TokenEnforcerTokenizerData};
use llm_enforce::parser::ParserHandle;
use llm_enforce::TokenId;

static INIT: Once = Once::new();

pub fn setup() {
	INIT.call_once(|| {
		tracing_subscriber::fmt::init();
	});
}

/// Deterministic stand-in for a real tokenizer: every alphabet character exists as a
/// single-character token, plus a handful of multi-character and quote-terminated
/// tokens so that token boundaries do not line up with parser state boundaries.
pub struct TestVocabulary {
	tokens: Vec<(TokenId, String, bool)>,
	token_strs: HashMap<TokenId, String>,
	pub eos_token_id: TokenId,
}

const MULTI_CHAR_TOKENS: &[&str] = &[
	"true", "false", "null", "{\"", "\"}", "\":", "\",\"", "\":\"", ", ", ": ", "aa", "ab", "abc", "bb", "12", "123", "num", "name",
	"key", "a\"", "b\"", "ab\"",
];

impl TestVocabulary {
	pub fn new() -> TestVocabulary {
		let mut strings: Vec<String> = Vec::new();
		for character in COMPLETE_ALPHABET.chars() {
			strings.push(character.to_string());
		}
		// Newline and backslash are not part of the alphabet but are valid JSON
		// whitespace / escape openers; sigma exercises extended alphabets
		strings.push("\n".to_string());
		strings.push("\\".to_string());
		strings.push("Σ".to_string());
		for token in MULTI_CHAR_TOKENS {
			strings.push((*token).to_string());
		}
		strings.dedup();
		let tokens: Vec<(TokenId, String, bool)> = strings
			.into_iter()
			.enumerate()
			.map(|(idx, decoded)| {
				let is_new_word = decoded.chars().next().map(|c| c.is_whitespace()).unwrap_or(false);
				(idx as TokenId, decoded, is_new_word)
			})
			.collect();
		let token_strs: HashMap<TokenId, String> = tokens.iter().map(|(id, decoded, _)| (*id, decoded.clone())).collect();
		let eos_token_id = tokens.len() as TokenId;
		TestVocabulary {
			tokens,
			token_strs,
			eos_token_id,
		}
	}

	pub fn tokenizer_data(&self) -> Arc<TokenEnforcerTokenizerData> {
		let table = self.token_strs.clone();
		Arc::new(TokenEnforcerTokenizerData::new(
			self.tokens.clone(),
			move |ids: &[TokenId]| ids.iter().filter_map(|id| table.get(id)).cloned().collect::<String>(),
			vec![self.eos_token_id],
		))
	}

	/// Greedy longest-match encoding, the shortest path a language model would take.
	pub fn encode(&self, text: &str) -> Vec<TokenId> {
		let mut encoded = Vec::new();
		let mut rest = text;
		while !rest.is_empty() {
			let mut best: Option<(&str, TokenId)> = None;
			for (id, decoded, _) in &self.tokens {
				if rest.starts_with(decoded.as_str()) && best.map_or(true, |(s, _)| decoded.len() > s.len()) {
					best = Some((decoded.as_str(), *id));
				}
			}
			let (decoded, id) = best.unwrap_or_else(|| panic!("no token covers the start of '{rest}'"));
			encoded.push(id);
			rest = &rest[decoded.len()..];
		}
		encoded
	}

	pub fn decode_one(&self, token_id: TokenId) -> String {
		self.token_strs.get(&token_id).cloned().unwrap_or_else(|| "<eos>".to_string())
	}

	pub fn id_of(&self, decoded: &str) -> TokenId {
		self.tokens
			.iter()
			.find(|(_, s, _)| s == decoded)
			.map(|(id, _, _)| *id)
			.unwrap_or_else(|| panic!("no token '{decoded}' in the test vocabulary"))
	}
}

/// Walk the string through the parser one character at a time.
pub fn assert_parser_with_string_direct(string: &str, parser: ParserHandle, expect_success: bool) {
	let mut parser = parser;
	for (idx, character) in string.chars().enumerate() {
		if parser.allowed_characters().contains(character) {
			parser = parser
				.advance(character)
				.unwrap_or_else(|e| panic!("error advancing '{character}' at index {idx}: {e}"));
		} else if expect_success {
			panic!("parser does not allow '{character}' at index {idx}");
		} else {
			return; // failed where it should
		}
	}
	if parser.can_end() && !expect_success {
		panic!("parser succeeded when it should have failed");
	}
	if !parser.can_end() && expect_success {
		panic!("parser did not reach an end state");
	}
}

/// Drive the token enforcer along the tokenization of `prompt + string` and check that
/// every step of the target is allowed, simulating a model that picks exactly this
/// token sequence.
pub fn assert_parser_with_string_token_enforcer(string: &str, parser: ParserHandle, expect_success: bool) {
	let vocab = TestVocabulary::new();
	let tokenizer_data = vocab.tokenizer_data();
	let prompt = "This is my question:\n\n";
	let initial = vocab.encode(prompt);
	let mut target = initial.clone();
	target.extend(vocab.encode(string));

	let mut enforcer = TokenEnforcer::new(tokenizer_data, parser);
	for prefix_len in initial.len()..=target.len() {
		let prefix = &target[..prefix_len];
		let allowed = enforcer.get_allowed_tokens(prefix).expect("get_allowed_tokens");
		if prefix_len < target.len() {
			let next_token = target[prefix_len];
			if !allowed.contains(&next_token) {
				if expect_success {
					panic!(
						"enforcer does not allow token '{}' at position {}",
						vocab.decode_one(next_token),
						prefix_len - initial.len()
					);
				}
				return; // failed where it should
			}
		} else {
			let can_end = allowed.contains(&vocab.eos_token_id);
			if can_end && !expect_success {
				panic!("enforcer succeeded when it should have failed");
			}
			if !can_end && expect_success {
				panic!("enforcer did not allow the end of sequence");
			}
		}
	}
}

pub fn assert_parser_with_string(string: &str, parser: ParserHandle, expect_success: bool) {
	assert_parser_with_string_direct(string, parser.clone(), expect_success);
	assert_parser_with_string_token_enforcer(string, parser, expect_success);
}

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::TokenId;

#[derive(Debug, Default)]
pub struct TokenizerPrefixTreeNode {
	pub tokens: Vec<TokenId>,
	pub children: HashMap<char, TokenizerPrefixTreeNode>,
}

/// One-time index over the tokenizer vocabulary: a character trie of every decoded
/// token, plus the freetext cache and the set of word-boundary tokens.
#[derive(Debug)]
pub struct TokenizerPrefixTree {
	root: TokenizerPrefixTreeNode,
	json_freetext_tokens: JsonFreetextTokenCache,
	new_word_tokens: HashSet<TokenId>,
}

impl TokenizerPrefixTree {
	pub fn new(regular_tokens: &[(TokenId, String, bool)]) -> TokenizerPrefixTree {
		let mut root = TokenizerPrefixTreeNode::default();
		let mut json_freetext_tokens = JsonFreetextTokenCache::default();
		let mut new_word_tokens = HashSet::new();
		for (token_id, decoded, is_new_word) in regular_tokens {
			if decoded.is_empty() {
				continue;
			}
			let mut node = &mut root;
			for character in decoded.chars() {
				node = node.children.entry(character).or_default();
			}
			node.tokens.push(*token_id);
			json_freetext_tokens.add_token(decoded, *token_id);
			if *is_new_word {
				new_word_tokens.insert(*token_id);
			}
		}
		json_freetext_tokens.freeze();
		TokenizerPrefixTree {
			root,
			json_freetext_tokens,
			new_word_tokens,
		}
	}

	pub fn root(&self) -> &TokenizerPrefixTreeNode {
		&self.root
	}

	pub fn json_freetext_tokens(&self) -> &JsonFreetextTokenCache {
		&self.json_freetext_tokens
	}

	pub fn new_word_tokens(&self) -> &HashSet<TokenId> {
		&self.new_word_tokens
	}
}

/// Precomputed index used while generating an unconstrained JSON string body. Tokens
/// are split into a regular and a quote-terminated bucket, each sorted by length, so
/// that "all tokens that fit the remaining length window" is a pair of slice lookups.
#[derive(Debug, Default)]
pub struct JsonFreetextTokenCache {
	regular_tokens: Vec<(usize, TokenId)>,
	quote_tokens: Vec<(usize, TokenId)>,
	regular_index: Vec<usize>,
	quote_index: Vec<usize>,
	max_token_len: usize,
	frozen: bool,
	lookup_cache: Mutex<HashMap<(usize, usize), Arc<Vec<TokenId>>>>,
}

impl JsonFreetextTokenCache {
	/// Consider one token for the cache. Tokens that cannot appear inside a JSON string
	/// body stay out of the cache (they remain reachable through the prefix tree).
	pub fn add_token(&mut self, token_str: &str, token_id: TokenId) {
		assert!(!self.frozen, "tokens cannot be added after freeze");
		if token_str.is_empty() {
			return;
		}
		let chars: Vec<char> = token_str.chars().collect();
		let interior = &chars[..chars.len() - 1];
		let has_non_trailing_backslash = interior.contains(&'\\');
		let has_quote_before_end = interior.contains(&'"');
		let has_newline = chars.contains(&'\n') || chars.contains(&'\r');
		if has_non_trailing_backslash || has_quote_before_end || has_newline {
			let as_json_string = format!("\"{token_str}\"");
			if serde_json::from_str::<String>(&as_json_string).is_err() {
				return;
			}
		}
		if token_str.ends_with('"') {
			self.quote_tokens.push((chars.len(), token_id));
		} else {
			self.regular_tokens.push((chars.len(), token_id));
		}
	}

	pub fn freeze(&mut self) {
		self.regular_tokens.sort_unstable();
		self.quote_tokens.sort_unstable();
		self.max_token_len = self
			.regular_tokens
			.iter()
			.chain(self.quote_tokens.iter())
			.map(|(len, _)| *len)
			.max()
			.unwrap_or(0);
		self.regular_index = build_length_index(&self.regular_tokens, self.max_token_len);
		self.quote_index = build_length_index(&self.quote_tokens, self.max_token_len);
		self.frozen = true;
	}

	pub fn max_token_len(&self) -> usize {
		self.max_token_len
	}

	/// All tokens whose body fits in the current length window: regular tokens of
	/// length <= max_len, and quote-terminated tokens whose body length lies in
	/// [min_remaining, max_len]. Memoized per window.
	pub fn lookup_allowed_tokens(&self, min_remaining: usize, max_len: usize) -> Arc<Vec<TokenId>> {
		debug_assert!(self.frozen, "lookup before freeze");
		let key = (min_remaining, max_len);
		if let Some(cached) = self.lookup_cache.lock().unwrap().get(&key) {
			return cached.clone();
		}
		let mut allowed: Vec<TokenId> = Vec::new();
		let regular_end = self.first_index_with_length(&self.regular_index, max_len + 1);
		allowed.extend(self.regular_tokens[..regular_end].iter().map(|(_, id)| *id));
		let quote_start = self.first_index_with_length(&self.quote_index, min_remaining + 1);
		let quote_end = self.first_index_with_length(&self.quote_index, max_len + 2);
		if quote_start < quote_end {
			allowed.extend(self.quote_tokens[quote_start..quote_end].iter().map(|(_, id)| *id));
		}
		let allowed = Arc::new(allowed);
		self.lookup_cache.lock().unwrap().insert(key, allowed.clone());
		allowed
	}

	fn first_index_with_length(&self, index: &[usize], length: usize) -> usize {
		match index.get(length) {
			Some(first) => *first,
			// Beyond the longest token, so the whole bucket qualifies
			None => index.last().copied().unwrap_or(0),
		}
	}
}

/// `index[L]` is the smallest position in `sorted` whose token length is >= L.
fn build_length_index(sorted: &[(usize, TokenId)], max_token_len: usize) -> Vec<usize> {
	let mut index = Vec::with_capacity(max_token_len + 2);
	let mut position = 0;
	for length in 0..=max_token_len + 1 {
		while position < sorted.len() && sorted[position].0 < length {
			position += 1;
		}
		index.push(position);
	}
	index
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn freetext_cache_length_windows() {
		let mut token_strs: HashMap<TokenId, String> = HashMap::new();
		let mut cache = JsonFreetextTokenCache::default();
		let test_length = 60;
		let letters = "abcde";
		let num_letters = letters.chars().count();
		let mut register = |cache: &mut JsonFreetextTokenCache, token_str: String| {
			let token_id = token_strs.len() as TokenId;
			cache.add_token(&token_str, token_id);
			token_strs.insert(token_id, token_str);
		};
		register(&mut cache, "\"".to_string());
		for i in 1..test_length {
			for letter in letters.chars() {
				register(&mut cache, letter.to_string().repeat(i));
				register(&mut cache, format!("{}\"", letter.to_string().repeat(i)));
			}
		}
		cache.freeze();

		let assert_allowed = |min_remaining: usize, max_length: usize, num_expected: usize| {
			let allowed = cache.lookup_allowed_tokens(min_remaining, max_length);
			assert_eq!(
				allowed.len(),
				num_expected,
				"min={min_remaining} max={max_length} expected {num_expected} got {}",
				allowed.len()
			);
		};

		for min_remaining in 0..test_length {
			for max_length in min_remaining..test_length {
				let mut num_quote_tokens = num_letters * (max_length - min_remaining + 1);
				if min_remaining == 0 {
					// The only quote-terminated token with an empty body is '"' itself
					num_quote_tokens -= num_letters - 1;
				}
				let num_regular_tokens = max_length * num_letters;
				assert_allowed(min_remaining, max_length, num_quote_tokens + num_regular_tokens);
			}
		}
		assert_allowed(0, test_length + 1, token_strs.len());
		let num_nonquote_tokens = (test_length - 1) * num_letters;
		assert_allowed(test_length + 1, test_length + 1, num_nonquote_tokens);
	}

	#[test]
	fn invalid_string_body_tokens_are_excluded() {
		let mut cache = JsonFreetextTokenCache::default();
		cache.add_token("a\"b", 0);
		cache.add_token("a\nb", 1);
		cache.add_token("\\n", 2);
		cache.add_token("ok", 3);
		cache.add_token("done\"", 4);
		cache.freeze();
		let allowed = cache.lookup_allowed_tokens(0, 100);
		assert!(!allowed.contains(&0));
		assert!(!allowed.contains(&1));
		assert!(allowed.contains(&2), "escaped newline is a legal string body");
		assert!(allowed.contains(&3));
		assert!(allowed.contains(&4));
	}
}

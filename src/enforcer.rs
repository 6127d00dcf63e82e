use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::parser::{CacheKey, ForceStopParser, ParserError, ParserHandle, ShortcutKey};
use crate::prefix_tree::{TokenizerPrefixTree, TokenizerPrefixTreeNode};
use crate::TokenId;

/// Everything the enforcer needs to know about one tokenizer, built once and shared
/// read-only between enforcer instances. Callers provide the `(id, decoded string,
/// is_new_word)` triples, a decode function and the end-of-sequence id(s); nothing
/// else about the tokenizer library leaks in here.
pub struct TokenEnforcerTokenizerData {
	tree: TokenizerPrefixTree,
	decoder: Arc<dyn Fn(&[TokenId]) -> String + Send + Sync>,
	eos_token_ids: Vec<TokenId>,
	token_strs: HashMap<TokenId, String>,
}

impl fmt::Debug for TokenEnforcerTokenizerData {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TokenEnforcerTokenizerData")
			.field("num_tokens", &self.token_strs.len())
			.field("eos_token_ids", &self.eos_token_ids)
			.finish()
	}
}

impl TokenEnforcerTokenizerData {
	pub fn new(
		regular_tokens: Vec<(TokenId, String, bool)>,
		decoder: impl Fn(&[TokenId]) -> String + Send + Sync + 'static,
		eos_token_ids: Vec<TokenId>,
	) -> TokenEnforcerTokenizerData {
		let tree = TokenizerPrefixTree::new(&regular_tokens);
		let token_strs = regular_tokens.into_iter().map(|(token_id, decoded, _)| (token_id, decoded)).collect();
		TokenEnforcerTokenizerData {
			tree,
			decoder: Arc::new(decoder),
			eos_token_ids,
			token_strs,
		}
	}

	pub fn decode(&self, tokens: &[TokenId]) -> String {
		(self.decoder)(tokens)
	}

	pub fn eos_token_ids(&self) -> &[TokenId] {
		&self.eos_token_ids
	}
}

/// Parser state for one seen token prefix.
#[derive(Debug, Clone)]
struct OutputTensorState {
	parser: ParserHandle,
	allowed_tokens: Arc<Vec<TokenId>>,
	current_word_tokens: Vec<TokenId>,
}

/// Per-request driver that turns a character-level parser plus the tokenizer prefix
/// tree into an allowed-token list for every decoding step. Stateful: prefixes seen
/// before are answered from cache, and each new prefix extends the state of its
/// parent prefix, so beams never contaminate each other.
pub struct TokenEnforcer {
	tokenizer_data: Arc<TokenEnforcerTokenizerData>,
	root_parser: ParserHandle,
	prefix_states: HashMap<Vec<TokenId>, OutputTensorState>,
	allowed_token_cache: HashMap<CacheKey, Arc<Vec<TokenId>>>,
}

impl TokenEnforcer {
	pub fn new(tokenizer_data: Arc<TokenEnforcerTokenizerData>, parser: ParserHandle) -> TokenEnforcer {
		TokenEnforcer {
			tokenizer_data,
			root_parser: parser,
			prefix_states: HashMap::new(),
			allowed_token_cache: HashMap::new(),
		}
	}

	/// The set of token ids that keep a valid completion reachable after the given
	/// prefix. Includes the end-of-sequence id(s) iff the parser accepts the output so
	/// far. The first call establishes the prompt; parsing starts after it.
	pub fn get_allowed_tokens(&mut self, token_sequence: &[TokenId]) -> Result<Arc<Vec<TokenId>>, ParserError> {
		if let Some(state) = self.prefix_states.get(token_sequence) {
			return Ok(state.allowed_tokens.clone());
		}
		let parent = token_sequence.len().checked_sub(1).map(|end| &token_sequence[..end]);
		let mut state = match parent.and_then(|parent| self.prefix_states.get(parent)) {
			None => {
				// Unseen prefix with an unseen parent: this is the prompt
				OutputTensorState {
					parser: self.root_parser.clone(),
					allowed_tokens: Arc::new(Vec::new()),
					current_word_tokens: Vec::new(),
				}
			}
			Some(parent_state) => {
				let parent_state = parent_state.clone();
				self.apply_new_token(parent_state, token_sequence)?
			}
		};
		self.compute_allowed_tokens(token_sequence, &mut state)?;
		let allowed = state.allowed_tokens.clone();
		self.prefix_states.insert(token_sequence.to_vec(), state);
		Ok(allowed)
	}

	/// Reconstruct the characters the newest token contributed and advance the parser
	/// through them. A token that starts a new word stands alone; any other token is
	/// decoded together with the current word so that merge-dependent tokenizers still
	/// yield exactly the new characters.
	fn apply_new_token(&self, parent_state: OutputTensorState, token_sequence: &[TokenId]) -> Result<OutputTensorState, ParserError> {
		let new_token = *token_sequence.last().expect("non-empty sequence");
		let (characters, current_word_tokens) = if self.tokenizer_data.tree.new_word_tokens().contains(&new_token) {
			let decoded = self.tokenizer_data.token_strs.get(&new_token).cloned().unwrap_or_default();
			(decoded, vec![new_token])
		} else {
			let decoded_before = self.tokenizer_data.decode(&parent_state.current_word_tokens);
			let mut current_word_tokens = parent_state.current_word_tokens.clone();
			current_word_tokens.push(new_token);
			let decoded_after = self.tokenizer_data.decode(&current_word_tokens);
			let new_characters = decoded_after.strip_prefix(decoded_before.as_str()).unwrap_or(&decoded_after).to_string();
			(new_characters, current_word_tokens)
		};
		tracing::trace!("token {} contributed characters '{}'", new_token, characters);
		let mut parser = parent_state.parser;
		for character in characters.chars() {
			if parser.allowed_characters().contains(character) {
				parser = parser.advance(character)?;
			} else {
				// The sampler emitted something illegal; fail closed instead of
				// propagating undefined parser behaviour
				tracing::debug!("character '{}' is not allowed by the parser, forcing generation to stop", character);
				parser = Arc::new(ForceStopParser::new(false));
				break;
			}
		}
		Ok(OutputTensorState {
			parser,
			allowed_tokens: Arc::new(Vec::new()),
			current_word_tokens,
		})
	}

	fn compute_allowed_tokens(&mut self, token_sequence: &[TokenId], state: &mut OutputTensorState) -> Result<(), ParserError> {
		let cache_key = state.parser.cache_key();
		if let Some(key) = &cache_key {
			if let Some(cached) = self.allowed_token_cache.get(key) {
				state.allowed_tokens = cached.clone();
				return Ok(());
			}
		}
		let mut allowed_tokens: Vec<TokenId> = Vec::new();
		let shortcut_key = state.parser.shortcut_key();
		self.collect_allowed_tokens(&state.parser, self.tokenizer_data.tree.root(), &mut allowed_tokens, shortcut_key.as_ref())?;
		if state.parser.can_end() {
			allowed_tokens.extend_from_slice(&self.tokenizer_data.eos_token_ids);
		}
		if allowed_tokens.is_empty() {
			// The vocabulary is exhausted along this path. Fatal for the request: log
			// the diagnostic and only permit the sequence to end.
			let prefix_text = self.tokenizer_data.decode(token_sequence);
			tracing::error!("parser reached a state with no allowed tokens after '{}'", prefix_text);
			state.allowed_tokens = Arc::new(self.tokenizer_data.eos_token_ids.clone());
			return Ok(());
		}
		tracing::debug!("{} tokens allowed at this step", allowed_tokens.len());
		let allowed_tokens = Arc::new(allowed_tokens);
		state.allowed_tokens = allowed_tokens.clone();
		if let Some(key) = cache_key {
			self.allowed_token_cache.insert(key, allowed_tokens);
		}
		Ok(())
	}

	/// Combined traversal of the parser's state graph and the prefix tree: every trie
	/// node whose path the parser accepts contributes its terminal tokens. A freetext
	/// shortcut replaces the subtree walk with a cache lookup, after which only the
	/// closing-quote edge is still explored.
	fn collect_allowed_tokens(
		&self,
		parser: &ParserHandle,
		node: &TokenizerPrefixTreeNode,
		allowed_tokens: &mut Vec<TokenId>,
		shortcut_key: Option<&ShortcutKey>,
	) -> Result<(), ParserError> {
		allowed_tokens.extend_from_slice(&node.tokens);
		let allowed_characters = parser.allowed_characters();
		let allowed_set: HashSet<char> = allowed_characters.chars().collect();
		let mut characters_to_explore: Vec<char> = node.children.keys().filter(|c| allowed_set.contains(c)).copied().collect();
		if let Some(ShortcutKey::JsonFreetext {
			current_length,
			min_length,
			max_length,
		}) = shortcut_key
		{
			let cache = self.tokenizer_data.tree.json_freetext_tokens();
			let min_remaining = min_length.saturating_sub(*current_length).min(cache.max_token_len());
			let max_allowed_len = max_length.saturating_sub(*current_length).min(cache.max_token_len());
			allowed_tokens.extend_from_slice(&cache.lookup_allowed_tokens(min_remaining, max_allowed_len));
			characters_to_explore.retain(|character| *character == '"');
		}
		characters_to_explore.sort_unstable();
		for character in characters_to_explore {
			let next_parser = parser.advance(character)?;
			let next_node = &node.children[&character];
			self.collect_allowed_tokens(&next_parser, next_node, allowed_tokens, None)?;
		}
		Ok(())
	}
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use regex_automata::dfa::dense;
use regex_automata::dfa::{Automaton, StartKind};
use regex_automata::util::primitives::StateID;
use regex_automata::{Anchored, MatchKind};

use crate::config::{ParserConfig, WHITESPACE_CHARACTERS};
use crate::parser::{CacheKey, CharacterLevelParser, ParserError, ParserHandle};

/// Compiled pattern shared by every state of one regex parse: the automaton plus a
/// per-state cache of allowed-character strings. Interned per pattern so that all
/// string fields using the same pattern share one automaton.
#[derive(Debug)]
pub struct RegexContext {
	pattern: Arc<str>,
	dfa: dense::DFA<Vec<u32>>,
	start_state: StateID,
	allowed_characters_cache: Mutex<HashMap<u32, String>>,
}

impl RegexContext {
	pub fn new(pattern: &str) -> Result<RegexContext, ParserError> {
		let dfa = dense::Builder::new()
			.configure(
				dense::Config::new()
					.start_kind(StartKind::Anchored)
					.match_kind(MatchKind::All)
					.minimize(true),
			)
			.build(pattern)
			.map_err(|e| ParserError::InvalidRegex {
				pattern: pattern.to_string(),
				message: e.to_string(),
			})?;
		let start_state = dfa.universal_start_state(Anchored::Yes).ok_or_else(|| ParserError::InvalidRegex {
			pattern: pattern.to_string(),
			message: "patterns with look-around are not supported".to_string(),
		})?;
		Ok(RegexContext {
			pattern: Arc::from(pattern),
			dfa,
			start_state,
			allowed_characters_cache: Mutex::new(HashMap::new()),
		})
	}

	pub fn pattern(&self) -> &Arc<str> {
		&self.pattern
	}

	/// Walk one character's UTF-8 bytes through the automaton. `None` is the dead state.
	fn step(&self, state: StateID, character: char) -> Option<StateID> {
		let mut buffer = [0u8; 4];
		let mut current = state;
		for &byte in character.encode_utf8(&mut buffer).as_bytes() {
			current = self.dfa.next_state(current, byte);
			if self.dfa.is_dead_state(current) || self.dfa.is_quit_state(current) {
				return None;
			}
		}
		Some(current)
	}

	fn is_match(&self, state: StateID) -> bool {
		self.dfa.is_match_state(self.dfa.next_eoi_state(state))
	}
}

/// Incremental matcher over a compiled pattern. Holds only the current automaton state;
/// a `None` state is the absorbing invalid state that never accepts anything again.
#[derive(Debug, Clone)]
pub struct RegexParser {
	context: Arc<RegexContext>,
	config: Arc<ParserConfig>,
	state: Option<StateID>,
}

impl RegexParser {
	pub fn new(pattern: &str) -> Result<RegexParser, ParserError> {
		Self::with_config(pattern, Arc::new(ParserConfig::default()))
	}

	pub fn with_config(pattern: &str, config: Arc<ParserConfig>) -> Result<RegexParser, ParserError> {
		let context = Arc::new(RegexContext::new(pattern)?);
		Ok(Self::from_context(context, config))
	}

	pub fn from_context(context: Arc<RegexContext>, config: Arc<ParserConfig>) -> RegexParser {
		let state = Some(context.start_state);
		RegexParser { context, config, state }
	}

	/// Same as [`CharacterLevelParser::advance`] but without the handle indirection, for
	/// callers that nest a regex matcher inside their own state.
	pub fn step(&self, character: char) -> RegexParser {
		let state = self.state.and_then(|state| self.context.step(state, character));
		RegexParser {
			context: self.context.clone(),
			config: self.config.clone(),
			state,
		}
	}
}

impl CharacterLevelParser for RegexParser {
	fn advance(&self, character: char) -> Result<ParserHandle, ParserError> {
		Ok(Arc::new(self.step(character)))
	}

	fn allowed_characters(&self) -> String {
		let Some(state) = self.state else {
			return String::new();
		};
		let mut cache = self.context.allowed_characters_cache.lock().unwrap();
		if let Some(allowed) = cache.get(&state.as_u32()) {
			return allowed.clone();
		}
		// Probe every candidate character; byte classes make each probe cheap. The probe
		// set is the configured alphabet plus whitespace, which is what "anything else"
		// expands to.
		let mut allowed = String::new();
		for character in self.config.alphabet.chars().chain(WHITESPACE_CHARACTERS.chars()) {
			if allowed.contains(character) {
				continue;
			}
			if self.context.step(state, character).is_some() {
				allowed.push(character);
			}
		}
		cache.insert(state.as_u32(), allowed.clone());
		allowed
	}

	fn can_end(&self) -> bool {
		self.state.map(|state| self.context.is_match(state)).unwrap_or(false)
	}

	fn cache_key(&self) -> Option<CacheKey> {
		Some(CacheKey::RegexState {
			pattern: self.context.pattern.clone(),
			state: self.state.map(|state| state.as_u32()).unwrap_or(u32::MAX),
		})
	}

	fn config(&self) -> &ParserConfig {
		&self.config
	}
}

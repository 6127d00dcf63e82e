use std::fmt::Debug;
use std::sync::Arc;

use once_cell::sync::Lazy;
use thiserror::Error;

use crate::config::{ParserConfig, WHITESPACE_CHARACTERS};

/// Parsers are immutable; advancing returns a fresh, cheaply cloned handle.
pub type ParserHandle = Arc<dyn CharacterLevelParser>;

#[derive(Error, Debug)]
pub enum ParserError {
	#[error("character '{0}' is not allowed at this point")]
	CharacterNotAllowed(char),

	#[error("schema refers to missing definition '{0}'")]
	MissingDefinition(String),

	#[error("enum mixes unsupported value types: {0}")]
	MixedEnum(String),

	#[error("unsupported schema construct: {0}")]
	UnsupportedSchema(String),

	#[error("string schema combines a pattern with a min/max length, which is not currently supported")]
	PatternWithLengthConstraints,

	#[error("string schema has minLength {min} larger than maxLength {max}")]
	InvalidStringBounds { min: usize, max: usize },

	#[error("invalid regular expression '{pattern}': {message}")]
	InvalidRegex { pattern: String, message: String },

	#[error("invalid number literal: {0}")]
	InvalidNumber(String),

	#[error("schema could not be loaded: {0}")]
	InvalidSchema(String),
}

/// Signals that the enforcer can skip the generic prefix tree walk and use a
/// precomputed token set for the current parser state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ShortcutKey {
	/// Unconstrained JSON string body; the freetext token cache applies.
	JsonFreetext {
		current_length: usize,
		min_length: usize,
		max_length: usize,
	},
}

/// Declares that two parser states yield the same allowed-token list, so the
/// enforcer may reuse a previously computed one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
	RegexState { pattern: Arc<str>, state: u32 },
	MultiChoices { grammar: usize, positions: Vec<(u32, u32)>, finished: bool },
	Union(Vec<CacheKey>),
	Sequence(Vec<CacheKey>),
}

static DEFAULT_PARSER_CONFIG: Lazy<ParserConfig> = Lazy::new(ParserConfig::default);

/// An immutable acceptor that parses strings one character at a time and can report
/// which characters keep a valid completion reachable.
pub trait CharacterLevelParser: Debug + Send + Sync {
	/// Feed a character and return the parser state after it. The receiver is never
	/// modified. Callers must only feed characters from [`Self::allowed_characters`].
	fn advance(&self, character: char) -> Result<ParserHandle, ParserError>;

	/// All characters allowed at the current point of the parse. The string is a set;
	/// callers must not rely on order and should treat duplicates as one.
	fn allowed_characters(&self) -> String;

	/// Whether the parse may stop here.
	fn can_end(&self) -> bool;

	fn shortcut_key(&self) -> Option<ShortcutKey> {
		None
	}

	fn cache_key(&self) -> Option<CacheKey> {
		None
	}

	fn config(&self) -> &ParserConfig {
		&DEFAULT_PARSER_CONFIG
	}
}

/// Allows exactly one literal string. Mostly a building block: escape sequences and
/// fixed wrappers (markdown fences and the like) are assembled from these.
#[derive(Debug, Clone)]
pub struct StringParser {
	target: String,
}

impl StringParser {
	pub fn new(target: impl Into<String>) -> StringParser {
		StringParser { target: target.into() }
	}
}

impl CharacterLevelParser for StringParser {
	fn advance(&self, character: char) -> Result<ParserHandle, ParserError> {
		let mut chars = self.target.chars();
		match chars.next() {
			Some(expected) if expected == character => Ok(Arc::new(StringParser {
				target: chars.as_str().to_string(),
			})),
			_ => Err(ParserError::CharacterNotAllowed(character)),
		}
	}

	fn allowed_characters(&self) -> String {
		self.target.chars().next().map(String::from).unwrap_or_default()
	}

	fn can_end(&self) -> bool {
		self.target.is_empty()
	}
}

/// Forbids every character except the stop token. Used as a safe sink once the
/// sampler has emitted something illegal, or to make an optional alternative endable.
#[derive(Debug, Clone)]
pub struct ForceStopParser {
	allow_whitespace: bool,
}

impl ForceStopParser {
	pub fn new(allow_whitespace: bool) -> ForceStopParser {
		ForceStopParser { allow_whitespace }
	}
}

impl CharacterLevelParser for ForceStopParser {
	fn advance(&self, _character: char) -> Result<ParserHandle, ParserError> {
		Ok(Arc::new(self.clone()))
	}

	fn allowed_characters(&self) -> String {
		if self.allow_whitespace {
			WHITESPACE_CHARACTERS.to_string()
		} else {
			String::new()
		}
	}

	fn can_end(&self) -> bool {
		true
	}
}

/// Accepts any string that one of several child parsers would accept.
#[derive(Debug, Clone)]
pub struct UnionParser {
	parsers: Vec<ParserHandle>,
}

impl UnionParser {
	pub fn new(parsers: Vec<ParserHandle>) -> UnionParser {
		UnionParser { parsers }
	}

	pub fn parsers(&self) -> &[ParserHandle] {
		&self.parsers
	}
}

impl CharacterLevelParser for UnionParser {
	fn advance(&self, character: char) -> Result<ParserHandle, ParserError> {
		let mut next_parsers: Vec<ParserHandle> = Vec::new();
		for parser in &self.parsers {
			if parser.allowed_characters().contains(character) {
				next_parsers.push(parser.advance(character)?);
			}
		}
		if next_parsers.len() == 1 {
			return Ok(next_parsers.pop().unwrap());
		}
		Ok(Arc::new(UnionParser { parsers: next_parsers }))
	}

	fn allowed_characters(&self) -> String {
		let mut allowed = String::new();
		for parser in &self.parsers {
			for character in parser.allowed_characters().chars() {
				if !allowed.contains(character) {
					allowed.push(character);
				}
			}
		}
		allowed
	}

	fn can_end(&self) -> bool {
		self.parsers.iter().any(|parser| parser.can_end())
	}

	fn shortcut_key(&self) -> Option<ShortcutKey> {
		// Only meaningful when every child agrees on the same key
		let mut keys = self.parsers.iter().map(|parser| parser.shortcut_key());
		let first = keys.next()?;
		if keys.all(|key| key == first) {
			first
		} else {
			None
		}
	}

	fn cache_key(&self) -> Option<CacheKey> {
		let keys: Option<Vec<CacheKey>> = self.parsers.iter().map(|parser| parser.cache_key()).collect();
		keys.map(CacheKey::Union)
	}
}

/// Runs several parsers one after the other.
#[derive(Debug, Clone)]
pub struct SequenceParser {
	parsers: Vec<ParserHandle>,
}

impl SequenceParser {
	pub fn new(parsers: Vec<ParserHandle>) -> SequenceParser {
		SequenceParser { parsers }
	}
}

impl CharacterLevelParser for SequenceParser {
	fn advance(&self, character: char) -> Result<ParserHandle, ParserError> {
		// Tricky edge case: if a parser can both end and accept the character, and a
		// later parser can also accept it, we don't know which scenario applies, so we
		// keep every legal fork and union them.
		let mut legal_parsers: Vec<ParserHandle> = Vec::new();
		for (idx, parser) in self.parsers.iter().enumerate() {
			if parser.allowed_characters().contains(character) {
				let updated = parser.advance(character)?;
				let mut next_parsers = vec![updated];
				next_parsers.extend(self.parsers[idx + 1..].iter().cloned());
				if next_parsers.len() == 1 {
					legal_parsers.push(next_parsers.pop().unwrap());
				} else {
					legal_parsers.push(Arc::new(SequenceParser { parsers: next_parsers }));
				}
			}
			if !parser.can_end() {
				break;
			}
		}
		if legal_parsers.len() == 1 {
			return Ok(legal_parsers.pop().unwrap());
		}
		Ok(Arc::new(UnionParser::new(legal_parsers)))
	}

	fn allowed_characters(&self) -> String {
		let mut allowed = String::new();
		for parser in &self.parsers {
			for character in parser.allowed_characters().chars() {
				if !allowed.contains(character) {
					allowed.push(character);
				}
			}
			if !parser.can_end() {
				break;
			}
		}
		allowed
	}

	fn can_end(&self) -> bool {
		self.parsers.iter().all(|parser| parser.can_end())
	}

	fn shortcut_key(&self) -> Option<ShortcutKey> {
		if self.parsers.len() == 1 {
			self.parsers[0].shortcut_key()
		} else {
			None
		}
	}

	fn cache_key(&self) -> Option<CacheKey> {
		let keys: Option<Vec<CacheKey>> = self.parsers.iter().map(|parser| parser.cache_key()).collect();
		keys.map(CacheKey::Sequence)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn string_parser_consumes_literal() {
		let mut parser: ParserHandle = Arc::new(StringParser::new("ab"));
		assert_eq!(parser.allowed_characters(), "a");
		assert!(!parser.can_end());
		parser = parser.advance('a').unwrap();
		parser = parser.advance('b').unwrap();
		assert!(parser.can_end());
		assert_eq!(parser.allowed_characters(), "");
	}

	#[test]
	fn advancing_does_not_mutate_the_original() {
		let parser: ParserHandle = Arc::new(StringParser::new("xy"));
		let _advanced = parser.advance('x').unwrap();
		assert_eq!(parser.allowed_characters(), "x");
		assert!(!parser.can_end());
	}

	#[test]
	fn union_collapses_to_single_survivor() {
		let parser = UnionParser::new(vec![
			Arc::new(StringParser::new("aa")) as ParserHandle,
			Arc::new(StringParser::new("ab")) as ParserHandle,
		]);
		assert_eq!(parser.allowed_characters(), "a");
		let advanced = parser.advance('a').unwrap();
		assert_eq!(advanced.allowed_characters(), "ab");
		let survivor = advanced.advance('b').unwrap();
		assert!(survivor.can_end());
	}

	#[test]
	fn sequence_skips_endable_head() {
		let parser = SequenceParser::new(vec![
			Arc::new(ForceStopParser::new(false)) as ParserHandle,
			Arc::new(StringParser::new("b")) as ParserHandle,
		]);
		assert_eq!(parser.allowed_characters(), "b");
		let advanced = parser.advance('b').unwrap();
		assert!(advanced.can_end());
	}
}

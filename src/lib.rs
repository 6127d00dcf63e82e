//! Constrain language model decoding so that every sampled token sequence stays inside
//! a declared format: a JSON Schema, a regular expression, a multi-choice grammar, or a
//! composition of those. Character-level parsers describe the language; the
//! [`TokenEnforcer`] maps a parser state onto the tokenizer vocabulary and yields, per
//! decoding step, the token ids that keep a valid completion reachable.

pub mod config;
pub mod enforcer;
pub mod json;
pub mod multichoice;
pub mod parser;
pub mod prefix_tree;
pub mod regex;
pub mod schema;

pub use config::ParserConfig;
pub use enforcer::{TokenEnforcer, TokenEnforcerTokenizerData};
pub use json::JsonSchemaParser;
pub use multichoice::MultiChoicesParser;
pub use parser::{
	CacheKey, CharacterLevelParser, ForceStopParser, ParserError, ParserHandle, SequenceParser, ShortcutKey, StringParser, UnionParser,
};
pub use regex::RegexParser;
pub use schema::JsonSchemaObject;

/// A vocabulary element index of the language model.
pub type TokenId = u32;

/// Logit value to indicate a token is allowed to be present in the result
pub const TOKEN_ALLOWED: f32 = 10000.0;

/// Logit value to indicate a token is forbidden to be present in the result
pub const TOKEN_FORBIDDEN: f32 = -10000.0;

/// An object that holds state for producing token biases during inference
pub trait Biaser {
	/// The current set of token biases given the tokens produced so far
	fn bias(&mut self, token_sequence: &[TokenId]) -> Result<Vec<(TokenId, f32)>, ParserError>;
}

/// A biaser that does not bias in any way
pub struct NullBiaser {}

impl Biaser for NullBiaser {
	fn bias(&mut self, _token_sequence: &[TokenId]) -> Result<Vec<(TokenId, f32)>, ParserError> {
		Ok(vec![])
	}
}

/// Adapts a [`TokenEnforcer`] to the biaser seam samplers consume: every allowed token
/// gets [`TOKEN_ALLOWED`]; the caller masks the rest.
pub struct EnforcerBiaser {
	enforcer: TokenEnforcer,
}

impl EnforcerBiaser {
	pub fn new(enforcer: TokenEnforcer) -> EnforcerBiaser {
		EnforcerBiaser { enforcer }
	}
}

impl Biaser for EnforcerBiaser {
	fn bias(&mut self, token_sequence: &[TokenId]) -> Result<Vec<(TokenId, f32)>, ParserError> {
		let allowed = self.enforcer.get_allowed_tokens(token_sequence)?;
		tracing::trace!("next valid tokens: {:?}", allowed);
		Ok(allowed.iter().map(|token_id| (*token_id, TOKEN_ALLOWED)).collect())
	}
}

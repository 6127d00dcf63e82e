use std::env;

/// Characters that may appear at an unconstrained "any character" position.
pub const COMPLETE_ALPHABET: &str =
	"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ!@#$%^&*()_+-=[]{};:,./<>? `'\"";

pub const WHITESPACE_CHARACTERS: &str = " \t\n\r";

pub const BACKSLASH: char = '\\';

/// Characters allowed after an escaping backslash, except unicode escapes
pub const BACKSLASH_ESCAPING_CHARACTERS: &str = "\"\\/bfnrt";

pub const DEFAULT_MAX_CONSECUTIVE_WHITESPACES: usize = 12;
pub const DEFAULT_MAX_JSON_ARRAY_LENGTH: usize = 20;

/// Environment variable overriding the default alphabet. Meant to carry a superset of
/// [`COMPLETE_ALPHABET`], for example to allow non-ASCII output.
pub const ENV_VAR_DEFAULT_ALPHABET: &str = "LMFE_DEFAULT_ALPHABET";

/// Environment variable controlling how many consecutive whitespace characters the JSON
/// parser will allow. Default: 12
pub const ENV_VAR_MAX_CONSECUTIVE_WHITESPACES: &str = "LMFE_MAX_CONSECUTIVE_WHITESPACES";

/// Environment variable controlling whether the JSON parser forces fields to appear in
/// the order of the schema's 'required' list. Default: false
pub const ENV_VAR_STRICT_JSON_FIELD_ORDER: &str = "LMFE_STRICT_JSON_FIELD_ORDER";

/// Environment variable controlling the implicit maximum JSON array length when the
/// schema does not specify one. Default: 20
pub const ENV_VAR_MAX_JSON_ARRAY_LENGTH: &str = "LMFE_MAX_JSON_ARRAY_LENGTH";

#[derive(Debug, Clone)]
pub struct ParserConfig {
	/// Universe of characters for "any character" positions
	pub alphabet: String,

	/// How many consecutive whitespace characters the JSON parser will allow
	pub max_consecutive_whitespaces: usize,

	/// Whether required JSON keys must appear in the order the schema declares them
	pub force_json_field_order: bool,

	/// Implicit upper bound on JSON arrays when the schema omits maxItems. Helps the LM
	/// avoid infinite loops.
	pub max_json_array_length: usize,
}

impl Default for ParserConfig {
	fn default() -> Self {
		ParserConfig {
			alphabet: COMPLETE_ALPHABET.to_string(),
			max_consecutive_whitespaces: DEFAULT_MAX_CONSECUTIVE_WHITESPACES,
			force_json_field_order: false,
			max_json_array_length: DEFAULT_MAX_JSON_ARRAY_LENGTH,
		}
	}
}

impl ParserConfig {
	/// Build a config from the defaults with any `LMFE_*` environment overrides applied.
	/// The environment is read here once; parsers receive the resulting value.
	pub fn from_env() -> ParserConfig {
		let defaults = ParserConfig::default();
		ParserConfig {
			alphabet: env::var(ENV_VAR_DEFAULT_ALPHABET).unwrap_or(defaults.alphabet),
			max_consecutive_whitespaces: env_usize(ENV_VAR_MAX_CONSECUTIVE_WHITESPACES, defaults.max_consecutive_whitespaces),
			force_json_field_order: env_bool(ENV_VAR_STRICT_JSON_FIELD_ORDER, defaults.force_json_field_order),
			max_json_array_length: env_usize(ENV_VAR_MAX_JSON_ARRAY_LENGTH, defaults.max_json_array_length),
		}
	}
}

pub(crate) fn is_whitespace(character: char) -> bool {
	WHITESPACE_CHARACTERS.contains(character)
}

fn env_usize(var: &str, default: usize) -> usize {
	env::var(var).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn env_bool(var: &str, default: bool) -> bool {
	match env::var(var) {
		Ok(s) => matches!(s.trim().to_lowercase().as_str(), "true" | "1"),
		Err(_) => default,
	}
}

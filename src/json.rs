use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use serde_json::Value;

use crate::config::{is_whitespace, ParserConfig, BACKSLASH, BACKSLASH_ESCAPING_CHARACTERS, WHITESPACE_CHARACTERS};
use crate::parser::{
	CharacterLevelParser, ForceStopParser, ParserError, ParserHandle, SequenceParser, ShortcutKey, StringParser, UnionParser,
};
use crate::regex::{RegexContext, RegexParser};
use crate::schema::{merge_object_schemas, resolve_ref, AdditionalProperties, JsonSchemaObject, TypeField};

// No need to include 'integer', it is a subset of 'number'
static ANY_JSON_SCHEMA: Lazy<Arc<JsonSchemaObject>> = Lazy::new(|| {
	let types = ["number", "string", "boolean", "null", "array", "object"];
	Arc::new(JsonSchemaObject {
		any_of: types.iter().map(|t| Arc::new(JsonSchemaObject::with_type(t))).collect(),
		..Default::default()
	})
});

fn any_json_schema() -> Arc<JsonSchemaObject> {
	ANY_JSON_SCHEMA.clone()
}

/// State shared by every frame of one JSON parse: the root schema for `$ref`
/// resolution, the quote-free alphabet, and compiled patterns keyed by pattern text.
#[derive(Debug)]
struct SchemaContext {
	root: Arc<JsonSchemaObject>,
	alphabet_without_quotes: String,
	regex_contexts: Mutex<HashMap<String, Arc<RegexContext>>>,
}

impl SchemaContext {
	fn regex_context(&self, pattern: &str) -> Result<Arc<RegexContext>, ParserError> {
		let mut cache = self.regex_contexts.lock().unwrap();
		if let Some(context) = cache.get(pattern) {
			return Ok(context.clone());
		}
		let context = Arc::new(RegexContext::new(pattern)?);
		cache.insert(pattern.to_string(), context.clone());
		Ok(context)
	}
}

/// Everything a frame may need from its owning parser while computing allowed
/// characters or advancing. Frames never hold a pointer back to the owner; the owner
/// passes this view in instead.
struct FrameCtx<'a> {
	config: &'a Arc<ParserConfig>,
	context: &'a Arc<SchemaContext>,
	is_top: bool,
	last_non_whitespace_character: Option<char>,
	last_parsed_string: &'a str,
}

/// Result of advancing one frame: its successor plus any frames it wants pushed above
/// itself on the owner's stack.
struct FrameStep {
	frame: JsonFrame,
	push: Vec<JsonFrame>,
}

impl FrameStep {
	fn keep(frame: JsonFrame) -> FrameStep {
		FrameStep { frame, push: Vec::new() }
	}
}

#[derive(Debug, Clone)]
enum JsonFrame {
	Object(ObjectState),
	List(ListState),
	Str(StringState),
	Number(NumberState),
	Union(Vec<JsonFrame>),
	Composite(ParserHandle),
}

impl JsonFrame {
	fn allowed_characters(&self, ctx: &FrameCtx) -> String {
		match self {
			JsonFrame::Object(state) => state.allowed_characters(),
			JsonFrame::List(state) => state.allowed_characters(ctx),
			JsonFrame::Str(state) => state.allowed_characters(ctx),
			JsonFrame::Number(state) => state.allowed_characters(),
			JsonFrame::Union(branches) => {
				let mut allowed = String::new();
				for branch in branches {
					for character in branch.allowed_characters(ctx).chars() {
						if !allowed.contains(character) {
							allowed.push(character);
						}
					}
				}
				allowed
			}
			JsonFrame::Composite(parser) => parser.allowed_characters(),
		}
	}

	fn can_end(&self) -> bool {
		match self {
			JsonFrame::Object(state) => matches!(state.stage, ObjectStage::EndObject),
			JsonFrame::List(state) => state.seen_closer,
			JsonFrame::Str(state) => state.can_end(),
			JsonFrame::Number(state) => state.can_end(),
			JsonFrame::Union(branches) => branches.iter().any(|branch| branch.can_end()),
			JsonFrame::Composite(parser) => parser.can_end(),
		}
	}

	fn advance(&self, character: char, ctx: &FrameCtx) -> Result<FrameStep, ParserError> {
		match self {
			JsonFrame::Object(state) => state.advance(character, ctx),
			JsonFrame::List(state) => state.advance(character, ctx),
			JsonFrame::Str(state) => state.advance(character),
			JsonFrame::Number(state) => state.advance(character),
			// Unions are forked by the owning parser before getting here
			JsonFrame::Union(_) => Err(ParserError::CharacterNotAllowed(character)),
			JsonFrame::Composite(parser) => Ok(FrameStep::keep(JsonFrame::Composite(parser.advance(character)?))),
		}
	}
}

#[derive(Debug, Clone)]
enum ObjectStage {
	StartObject,
	ParsingKeyOrEnd,
	ParsingKeyValueSeparator,
	ParsingValue,
	ParsingSeparatorOrEnd,
	EndObject,
}

#[derive(Debug, Clone)]
struct ObjectState {
	schema: Arc<JsonSchemaObject>,
	stage: ObjectStage,
	existing_keys: Vec<String>,
	is_dictionary: bool,
}

impl ObjectState {
	fn new(schema: Arc<JsonSchemaObject>) -> ObjectState {
		// JSON objects represent both structs and dictionaries; without declared
		// properties this is a free map
		let is_dictionary = schema.properties.is_none();
		ObjectState {
			schema,
			stage: ObjectStage::StartObject,
			existing_keys: Vec::new(),
			is_dictionary,
		}
	}

	fn remaining_required_key(&self) -> Option<&String> {
		self.schema.required.iter().find(|key| !self.existing_keys.contains(key))
	}

	fn advance(&self, character: char, ctx: &FrameCtx) -> Result<FrameStep, ParserError> {
		if is_whitespace(character) {
			// Whitespace between object tokens carries no meaning
			return Ok(FrameStep::keep(JsonFrame::Object(self.clone())));
		}
		let mut next = self.clone();
		let mut push: Vec<JsonFrame> = Vec::new();
		match (&self.stage, character) {
			(ObjectStage::StartObject, '{') => next.stage = ObjectStage::ParsingKeyOrEnd,
			(ObjectStage::ParsingKeyOrEnd, '}') => next.stage = ObjectStage::EndObject,
			(ObjectStage::ParsingKeyOrEnd, '"') => {
				let possible_keys = if self.is_dictionary {
					None
				} else if ctx.config.force_json_field_order && self.remaining_required_key().is_some() {
					Some(vec![self.remaining_required_key().unwrap().clone()])
				} else {
					Some(
						self.schema
							.properties
							.as_ref()
							.map(|properties| properties.keys().filter(|key| !self.existing_keys.contains(key)).cloned().collect())
							.unwrap_or_default(),
					)
				};
				// The opening quote has already been consumed on the way in
				let mut key_state = StringState::new(possible_keys, true, true, None, None, None, ctx.context, ctx.config)?;
				key_state.seen_opening_quote = true;
				push.push(JsonFrame::Str(key_state));
				next.stage = ObjectStage::ParsingKeyValueSeparator;
			}
			(ObjectStage::ParsingKeyValueSeparator, ':') => {
				let key = ctx.last_parsed_string.to_string();
				let value_schema = if self.is_dictionary {
					match &self.schema.additional_properties {
						Some(AdditionalProperties::Schema(schema)) => schema.clone(),
						_ => any_json_schema(),
					}
				} else {
					self.schema
						.properties
						.as_ref()
						.and_then(|properties| properties.get(&key))
						.cloned()
						.ok_or_else(|| ParserError::UnsupportedSchema(format!("object has no property '{key}'")))?
				};
				push.push(frame_for_schema(ctx.context, ctx.config, &value_schema)?);
				next.existing_keys.push(key);
				next.stage = ObjectStage::ParsingValue;
			}
			// A character arriving while a value is being parsed is the value's
			// finishing character bubbling up
			(ObjectStage::ParsingValue, '"') => next.stage = ObjectStage::ParsingSeparatorOrEnd,
			(ObjectStage::ParsingValue, ',') | (ObjectStage::ParsingSeparatorOrEnd, ',') => next.stage = ObjectStage::ParsingKeyOrEnd,
			(ObjectStage::ParsingValue, '}') | (ObjectStage::ParsingSeparatorOrEnd, '}') => next.stage = ObjectStage::EndObject,
			_ => {}
		}
		Ok(FrameStep { frame: JsonFrame::Object(next), push })
	}

	fn allowed_characters(&self) -> String {
		let can_end = self.remaining_required_key().is_none();
		let can_parse_key = self.is_dictionary
			|| self
				.schema
				.properties
				.as_ref()
				.map(|properties| properties.keys().any(|key| !self.existing_keys.contains(key)))
				.unwrap_or(false);
		let mut possible = String::from(WHITESPACE_CHARACTERS);
		match self.stage {
			ObjectStage::StartObject => possible.push('{'),
			ObjectStage::ParsingKeyOrEnd => {
				if can_end {
					possible.push('}');
				}
				if can_parse_key {
					possible.push('"');
				}
			}
			ObjectStage::ParsingKeyValueSeparator => possible.push(':'),
			ObjectStage::ParsingValue | ObjectStage::ParsingSeparatorOrEnd => {
				if can_end {
					possible.push('}');
				}
				if can_parse_key {
					possible.push(',');
				}
			}
			ObjectStage::EndObject => {}
		}
		possible
	}
}

#[derive(Debug, Clone)]
struct StringState {
	allowed_strings: Option<Vec<String>>,
	parsed_string: String,
	seen_opening_quote: bool,
	seen_closing_quote: bool,
	require_opening_quote: bool,
	require_closing_quote: bool,
	min_length: Option<usize>,
	max_length: Option<usize>,
	regex: Option<RegexParser>,
}

impl StringState {
	#[allow(clippy::too_many_arguments)]
	fn new(
		allowed_strings: Option<Vec<String>>,
		require_opening_quote: bool,
		require_closing_quote: bool,
		min_length: Option<usize>,
		max_length: Option<usize>,
		pattern: Option<&str>,
		context: &Arc<SchemaContext>,
		config: &Arc<ParserConfig>,
	) -> Result<StringState, ParserError> {
		if pattern.is_some() && (min_length.is_some() || max_length.is_some()) {
			return Err(ParserError::PatternWithLengthConstraints);
		}
		if let (Some(min), Some(max)) = (min_length, max_length) {
			if min > max {
				return Err(ParserError::InvalidStringBounds { min, max });
			}
		}
		let regex = match pattern {
			Some(pattern) => Some(RegexParser::from_context(context.regex_context(pattern)?, config.clone())),
			None => None,
		};
		Ok(StringState {
			allowed_strings,
			parsed_string: String::new(),
			seen_opening_quote: !require_opening_quote,
			seen_closing_quote: false,
			require_opening_quote,
			require_closing_quote,
			min_length,
			max_length,
			regex,
		})
	}

	fn advance(&self, character: char) -> Result<FrameStep, ParserError> {
		if (self.parsed_string.is_empty() || self.seen_closing_quote) && is_whitespace(character) {
			return Ok(FrameStep::keep(JsonFrame::Str(self.clone())));
		}
		let mut next = self.clone();
		next.parsed_string.push(character);
		if character == '"' {
			if !next.seen_opening_quote {
				next.seen_opening_quote = true;
				next.parsed_string.clear();
			} else {
				next.seen_closing_quote = true;
				next.parsed_string.pop();
			}
		}
		if character != '"' && next.seen_opening_quote && !next.seen_closing_quote {
			next.regex = next.regex.take().map(|regex| regex.step(character));
		}
		if character == BACKSLASH {
			return Ok(FrameStep {
				frame: JsonFrame::Str(next),
				push: vec![escape_sequence_frame()],
			});
		}
		Ok(FrameStep::keep(JsonFrame::Str(next)))
	}

	fn allowed_characters(&self, ctx: &FrameCtx) -> String {
		if !self.seen_opening_quote {
			return format!("\"{WHITESPACE_CHARACTERS}");
		}
		if self.seen_closing_quote {
			return WHITESPACE_CHARACTERS.to_string();
		}
		if let Some(regex) = &self.regex {
			// Patterns with quotes or escaping backslashes are not supported, so those
			// characters never reach the nested matcher
			let mut allowed: String = regex.allowed_characters().chars().filter(|c| *c != '"' && *c != BACKSLASH).collect();
			if regex.can_end() {
				allowed.push('"');
			}
			return allowed;
		}
		if let Some(allowed_strings) = &self.allowed_strings {
			let mut allowed = String::new();
			for candidate in allowed_strings {
				if let Some(remainder) = candidate.strip_prefix(self.parsed_string.as_str()) {
					if let Some(first) = remainder.chars().next() {
						if !allowed.contains(first) {
							allowed.push(first);
						}
					}
				}
			}
			if allowed_strings.contains(&self.parsed_string) && self.require_closing_quote {
				allowed.push('"');
			}
			if self.parsed_string.is_empty() && (!self.seen_opening_quote || !self.require_opening_quote) {
				allowed.push_str(WHITESPACE_CHARACTERS);
			}
			return allowed;
		}
		let current_length = self.parsed_string.chars().count();
		if self.min_length.map_or(false, |min| current_length < min) {
			return format!("{}{}", ctx.context.alphabet_without_quotes, BACKSLASH);
		}
		if self.max_length.map_or(false, |max| current_length >= max) {
			return "\"".to_string();
		}
		format!("{}{}", ctx.config.alphabet, BACKSLASH)
	}

	fn can_end(&self) -> bool {
		if self.require_closing_quote {
			self.seen_closing_quote
		} else if let Some(allowed_strings) = &self.allowed_strings {
			allowed_strings.contains(&self.parsed_string)
		} else {
			!self.parsed_string.is_empty()
		}
	}

	fn freetext_shortcut(&self) -> Option<ShortcutKey> {
		if self.allowed_strings.is_none() && self.seen_opening_quote && !self.seen_closing_quote && self.regex.is_none() {
			// Most of the vocabulary is legal here; signal the enforcer to use the
			// freetext token cache instead of walking the prefix tree
			let current_length = self.parsed_string.chars().count();
			let min_length = self.min_length.unwrap_or(0);
			let max_length = self.max_length.unwrap_or(usize::MAX);
			if current_length < max_length {
				return Some(ShortcutKey::JsonFreetext {
					current_length,
					min_length,
					max_length,
				});
			}
		}
		None
	}
}

/// After a backslash: one escaping character, or 'u' followed by four hex digits.
fn escape_sequence_frame() -> JsonFrame {
	let mut alternatives: Vec<ParserHandle> = BACKSLASH_ESCAPING_CHARACTERS
		.chars()
		.map(|c| Arc::new(StringParser::new(c.to_string())) as ParserHandle)
		.collect();
	let hex_digit: ParserHandle = Arc::new(UnionParser::new(
		"0123456789abcdefABCDEF".chars().map(|c| Arc::new(StringParser::new(c.to_string())) as ParserHandle).collect(),
	));
	let mut unicode_components: Vec<ParserHandle> = vec![Arc::new(StringParser::new("u"))];
	for _ in 0..4 {
		unicode_components.push(hex_digit.clone());
	}
	alternatives.push(Arc::new(SequenceParser::new(unicode_components)));
	JsonFrame::Composite(Arc::new(UnionParser::new(alternatives)))
}

#[derive(Debug, Clone)]
struct NumberState {
	parsed_string: String,
	allow_floating_point: bool,
	seen_decimal_point: bool,
	seen_exponent: bool,
	seen_digit: bool,
	seen_whitespace_after_digits: bool,
}

impl NumberState {
	fn new(allow_floating_point: bool) -> NumberState {
		NumberState {
			parsed_string: String::new(),
			allow_floating_point,
			seen_decimal_point: false,
			seen_exponent: false,
			seen_digit: false,
			seen_whitespace_after_digits: false,
		}
	}

	fn advance(&self, character: char) -> Result<FrameStep, ParserError> {
		if self.parsed_string.is_empty() && is_whitespace(character) {
			return Ok(FrameStep::keep(JsonFrame::Number(self.clone())));
		}
		let mut next = self.clone();
		next.parsed_string.push(character);
		if is_whitespace(character) {
			next.seen_whitespace_after_digits = true;
			return Ok(FrameStep::keep(JsonFrame::Number(next)));
		}
		if character == '.' {
			if next.parsed_string.chars().count() <= 1 {
				return Err(ParserError::InvalidNumber("numbers cannot start with a decimal point".to_string()));
			}
			if self.seen_decimal_point {
				return Err(ParserError::InvalidNumber("numbers cannot contain two decimal points".to_string()));
			}
			next.seen_decimal_point = true;
		} else if character == 'e' || character == 'E' {
			if self.seen_exponent || !self.seen_digit {
				return Err(ParserError::InvalidNumber(format!("misplaced exponent in '{}'", next.parsed_string)));
			}
			next.seen_exponent = true;
		} else if character.is_ascii_digit() {
			next.seen_digit = true;
		}
		Ok(FrameStep::keep(JsonFrame::Number(next)))
	}

	fn allowed_characters(&self) -> String {
		if self.seen_whitespace_after_digits {
			return WHITESPACE_CHARACTERS.to_string();
		}
		let mut allowed = String::from("0123456789");
		if self.parsed_string.is_empty() {
			allowed.push('-');
			allowed.push_str(WHITESPACE_CHARACTERS);
		}
		if self.parsed_string == "0" {
			// A leading zero must be the whole integer part
			allowed = WHITESPACE_CHARACTERS.to_string();
		}
		if self.parsed_string == "-0" {
			allowed = format!(".{WHITESPACE_CHARACTERS}");
		}
		let last = self.parsed_string.chars().last();
		if matches!(last, Some('e' | 'E')) {
			allowed.push_str("-+");
		}
		if self.seen_digit && !self.seen_exponent {
			allowed.push_str("eE");
		}
		if self.allow_floating_point && !self.seen_decimal_point && self.seen_digit && !self.seen_exponent {
			allowed.push('.');
		}
		if last.map_or(false, |c| c.is_ascii_digit()) {
			allowed.push_str(WHITESPACE_CHARACTERS);
		}
		allowed
	}

	fn can_end(&self) -> bool {
		let last = self.parsed_string.chars().last();
		if self.seen_exponent && matches!(last, Some('e' | 'E' | '+' | '-')) {
			return false;
		}
		!self.parsed_string.is_empty() && (last.map_or(false, |c| c.is_ascii_digit()) || self.seen_whitespace_after_digits)
	}
}

#[derive(Debug, Clone)]
struct ListState {
	item_schema: Arc<JsonSchemaObject>,
	min_items: Option<usize>,
	max_items: Option<usize>,
	seen_opener: bool,
	seen_closer: bool,
	num_items_seen: usize,
}

impl ListState {
	fn new(item_schema: Arc<JsonSchemaObject>, min_items: Option<usize>, max_items: Option<usize>, config: &ParserConfig) -> ListState {
		let default_max = config.max_json_array_length;
		let max_items = match max_items {
			Some(max) => Some(max),
			None if default_max > 0 && min_items.map_or(true, |min| min < default_max) => Some(default_max),
			None => None,
		};
		ListState {
			item_schema,
			min_items,
			max_items,
			seen_opener: false,
			seen_closer: false,
			num_items_seen: 0,
		}
	}

	fn advance(&self, character: char, ctx: &FrameCtx) -> Result<FrameStep, ParserError> {
		let mut next = self.clone();
		let mut push: Vec<JsonFrame> = Vec::new();
		match character {
			'[' => {
				next.seen_opener = true;
				let item_frame = frame_for_schema(ctx.context, ctx.config, &self.item_schema)?;
				let requires_items = self.min_items.map_or(false, |min| min > 0);
				if requires_items {
					push.push(item_frame);
				} else {
					// The force-stop alternative keeps an immediate ']' reachable, with
					// whitespace still legal before it
					let stop = JsonFrame::Composite(Arc::new(ForceStopParser::new(true)));
					push.push(match item_frame {
						JsonFrame::Union(mut branches) => {
							branches.push(stop);
							JsonFrame::Union(branches)
						}
						other => JsonFrame::Union(vec![other, stop]),
					});
				}
			}
			']' => next.seen_closer = true,
			',' => {
				if !self.seen_closer {
					next.num_items_seen += 1;
					push.push(frame_for_schema(ctx.context, ctx.config, &self.item_schema)?);
				}
			}
			_ => {}
		}
		Ok(FrameStep { frame: JsonFrame::List(next), push })
	}

	fn allowed_characters(&self, ctx: &FrameCtx) -> String {
		if !self.seen_opener {
			format!("[{WHITESPACE_CHARACTERS}")
		} else if !self.seen_closer {
			format!("{}{}", self.allowed_control_characters(ctx), WHITESPACE_CHARACTERS)
		} else {
			String::new()
		}
	}

	fn allowed_control_characters(&self, ctx: &FrameCtx) -> String {
		let mut num_items = self.num_items_seen;
		if !ctx.is_top && ctx.last_non_whitespace_character != Some('[') {
			// There is an item parser above us that we have not counted yet
			num_items += 1;
		}
		let has_enough_items = self.min_items.map_or(true, |min| num_items >= min);
		let can_add_another_item = self.max_items.map_or(true, |max| num_items < max);
		let mut control = String::new();
		if num_items > 0 && can_add_another_item {
			control.push(',');
		}
		if has_enough_items {
			control.push(']');
		}
		control
	}
}

/// Character-level parser for JSON documents conforming to a schema. A stack of
/// sub-parser frames tracks the nesting; the topmost frame that accepts a character
/// receives it, and frames above it are considered complete.
#[derive(Debug, Clone)]
pub struct JsonSchemaParser {
	context: Arc<SchemaContext>,
	config: Arc<ParserConfig>,
	stack: Vec<JsonFrame>,
	num_consecutive_whitespaces: usize,
	last_parsed_string: String,
	last_non_whitespace_character: Option<char>,
}

impl JsonSchemaParser {
	/// Parser for the given schema, or for any JSON value when `schema` is `None`.
	/// Configuration is read from the environment here, once.
	pub fn new(schema: Option<JsonSchemaObject>) -> Result<JsonSchemaParser, ParserError> {
		Self::with_config(schema, Arc::new(ParserConfig::from_env()))
	}

	pub fn with_config(schema: Option<JsonSchemaObject>, config: Arc<ParserConfig>) -> Result<JsonSchemaParser, ParserError> {
		let root = schema.map(Arc::new).unwrap_or_else(any_json_schema);
		let context = Arc::new(SchemaContext {
			alphabet_without_quotes: config.alphabet.replace('"', ""),
			root: root.clone(),
			regex_contexts: Mutex::new(HashMap::new()),
		});
		let first_frame = frame_for_schema(&context, &config, &root)?;
		Ok(JsonSchemaParser {
			context,
			config,
			stack: vec![first_frame],
			num_consecutive_whitespaces: 0,
			last_parsed_string: String::new(),
			last_non_whitespace_character: None,
		})
	}

	pub fn from_value(schema: &Value) -> Result<JsonSchemaParser, ParserError> {
		Self::new(Some(JsonSchemaObject::from_value(schema)?))
	}

	fn frame_ctx(&self, idx: usize) -> FrameCtx<'_> {
		FrameCtx {
			config: &self.config,
			context: &self.context,
			is_top: idx + 1 == self.stack.len(),
			last_non_whitespace_character: self.last_non_whitespace_character,
			last_parsed_string: &self.last_parsed_string,
		}
	}

	fn frame_allows(&self, idx: usize, character: char) -> bool {
		let ctx = self.frame_ctx(idx);
		self.stack[idx].allowed_characters(&ctx).contains(character)
	}

	fn count_whitespace(&mut self, character: char) {
		if is_whitespace(character) {
			self.num_consecutive_whitespaces += 1;
		} else {
			self.num_consecutive_whitespaces = 0;
			self.last_non_whitespace_character = Some(character);
		}
	}

	/// Discard finished frames that can accept nothing more, so that stale entries are
	/// not consulted on the next step. Completed strings hand their value to the owner
	/// and completed items bump the enclosing list's count.
	fn pop_finished_frames(&mut self) {
		loop {
			if self.stack.is_empty() {
				break;
			}
			let idx = self.stack.len() - 1;
			if !self.stack[idx].can_end() {
				break;
			}
			let allowed_empty = {
				let ctx = self.frame_ctx(idx);
				self.stack[idx].allowed_characters(&ctx).is_empty()
			};
			if !allowed_empty {
				break;
			}
			if let JsonFrame::Str(state) = &self.stack[idx] {
				self.last_parsed_string = state.parsed_string.clone();
			}
			self.stack.pop();
			if let Some(JsonFrame::List(list)) = self.stack.last_mut() {
				list.num_items_seen += 1;
			}
		}
	}

	fn advance_at(mut self, idx: usize, character: char) -> Result<ParserHandle, ParserError> {
		if let JsonFrame::Union(branches) = &self.stack[idx] {
			let accepting: Vec<JsonFrame> = {
				let ctx = self.frame_ctx(idx);
				branches
					.iter()
					.filter(|branch| branch.allowed_characters(&ctx).contains(character))
					.cloned()
					.collect()
			};
			if accepting.is_empty() {
				return Err(ParserError::CharacterNotAllowed(character));
			}
			if accepting.len() == 1 {
				self.stack[idx] = accepting.into_iter().next().unwrap();
				return self.advance_at(idx, character);
			}
			// More than one branch accepts, and each may grow its own stack, so fork
			// into independent parsers with separate stacks and union the forks
			let mut options: Vec<ParserHandle> = Vec::new();
			for branch in accepting {
				let mut fork = self.clone();
				fork.stack[idx] = branch;
				options.push(fork.advance_at(idx, character)?);
			}
			return Ok(Arc::new(UnionParser::new(options)));
		}
		let step = {
			let ctx = self.frame_ctx(idx);
			self.stack[idx].advance(character, &ctx)?
		};
		self.stack[idx] = step.frame;
		self.stack.extend(step.push);
		self.count_whitespace(character);
		self.pop_finished_frames();
		Ok(Arc::new(self))
	}
}

impl CharacterLevelParser for JsonSchemaParser {
	fn advance(&self, character: char) -> Result<ParserHandle, ParserError> {
		// The topmost frame that accepts the character receives it; frames above it
		// completed and are discarded, remembering the last parsed string on the way
		let mut receiving_idx = self.stack.len() as isize - 1;
		let mut last_parsed_string = self.last_parsed_string.clone();
		while receiving_idx >= 0 {
			let idx = receiving_idx as usize;
			if self.frame_allows(idx, character) {
				break;
			}
			if let JsonFrame::Str(state) = &self.stack[idx] {
				last_parsed_string = state.parsed_string.clone();
			}
			receiving_idx -= 1;
		}
		let mut updated = self.clone();
		updated.last_parsed_string = last_parsed_string;
		updated.stack.truncate((receiving_idx + 1) as usize);
		if receiving_idx < 0 {
			// Past the end of the document; only trailing whitespace arrives here
			updated.count_whitespace(character);
			return Ok(Arc::new(updated));
		}
		updated.advance_at(receiving_idx as usize, character)
	}

	fn allowed_characters(&self) -> String {
		let mut pieces: Vec<String> = Vec::new();
		for idx in (0..self.stack.len()).rev() {
			let ctx = self.frame_ctx(idx);
			pieces.push(self.stack[idx].allowed_characters(&ctx));
			if !self.stack[idx].can_end() {
				break;
			}
		}
		let mut allowed = if pieces.is_empty() {
			// Beam search can crash when there are fewer legal continuations than
			// beams, so a finished document keeps whitespace legal
			WHITESPACE_CHARACTERS.to_string()
		} else {
			pieces.concat()
		};
		if self.num_consecutive_whitespaces >= self.config.max_consecutive_whitespaces {
			allowed.retain(|c| !is_whitespace(c));
		}
		allowed
	}

	fn can_end(&self) -> bool {
		self.stack.iter().all(|frame| frame.can_end())
	}

	fn shortcut_key(&self) -> Option<ShortcutKey> {
		match self.stack.last() {
			Some(JsonFrame::Str(state)) => state.freetext_shortcut(),
			_ => None,
		}
	}

	fn config(&self) -> &ParserConfig {
		&self.config
	}
}

fn enum_strings(values: &[Value]) -> Result<Vec<String>, ParserError> {
	values
		.iter()
		.map(|value| match value {
			Value::String(s) => Ok(s.clone()),
			other => Err(ParserError::MixedEnum(other.to_string())),
		})
		.collect()
}

/// Translate one schema node into the sub-parser frame that parses it.
fn frame_for_schema(context: &Arc<SchemaContext>, config: &Arc<ParserConfig>, schema: &Arc<JsonSchemaObject>) -> Result<JsonFrame, ParserError> {
	if !schema.any_of.is_empty() {
		let branches = schema
			.any_of
			.iter()
			.map(|option| frame_for_schema(context, config, option))
			.collect::<Result<Vec<_>, _>>()?;
		return Ok(JsonFrame::Union(branches));
	}
	if !schema.all_of.is_empty() {
		let mut merged = (*schema.all_of[0]).clone();
		for option in &schema.all_of[1..] {
			merged = merge_object_schemas(&merged, option);
		}
		return frame_for_schema(context, config, &Arc::new(merged));
	}
	if let Some(const_value) = &schema.const_value {
		let is_string = const_value.is_string();
		let literal = match const_value {
			Value::String(s) => s.clone(),
			other => other.to_string(),
		};
		return Ok(JsonFrame::Str(StringState::new(
			Some(vec![literal]),
			is_string,
			is_string,
			None,
			None,
			None,
			context,
			config,
		)?));
	}
	if schema.type_is("string") {
		let allowed_strings = if schema.enum_values.is_empty() {
			None
		} else {
			Some(enum_strings(&schema.enum_values)?)
		};
		return Ok(JsonFrame::Str(StringState::new(
			allowed_strings,
			true,
			true,
			schema.min_length,
			schema.max_length,
			schema.pattern.as_deref(),
			context,
			config,
		)?));
	}
	if !schema.one_of.is_empty() {
		// Merge the parent's information into each option, then union the options
		let branches = schema
			.one_of
			.iter()
			.map(|option| JsonFrame::Object(ObjectState::new(Arc::new(merge_object_schemas(schema, option)))))
			.collect();
		return Ok(JsonFrame::Union(branches));
	}
	if schema.type_is("object") {
		return Ok(JsonFrame::Object(ObjectState::new(schema.clone())));
	}
	if schema.schema_type.is_none() {
		if let Some(reference) = &schema.reference {
			let resolved = resolve_ref(&context.root, reference)?;
			return frame_for_schema(context, config, &resolved);
		}
	}
	if !schema.enum_values.is_empty() {
		let all_strings = schema.enum_values.iter().all(|value| value.is_string());
		let all_numeric = schema.enum_values.iter().all(|value| value.is_number());
		if all_strings {
			return Ok(JsonFrame::Str(StringState::new(
				Some(enum_strings(&schema.enum_values)?),
				true,
				true,
				None,
				None,
				None,
				context,
				config,
			)?));
		}
		if all_numeric {
			// Numeric enum values appear unquoted
			let literals = schema.enum_values.iter().map(|value| value.to_string()).collect();
			return Ok(JsonFrame::Str(StringState::new(Some(literals), false, false, None, None, None, context, config)?));
		}
		return Err(ParserError::MixedEnum(Value::Array(schema.enum_values.clone()).to_string()));
	}
	if schema.type_is("integer") {
		return Ok(JsonFrame::Number(NumberState::new(false)));
	}
	if schema.type_is("boolean") {
		return Ok(JsonFrame::Str(StringState::new(
			Some(vec!["true".to_string(), "false".to_string()]),
			false,
			false,
			None,
			None,
			None,
			context,
			config,
		)?));
	}
	if schema.type_is("null") {
		return Ok(JsonFrame::Str(StringState::new(
			Some(vec!["null".to_string()]),
			false,
			false,
			None,
			None,
			None,
			context,
			config,
		)?));
	}
	if schema.type_is("number") {
		return Ok(JsonFrame::Number(NumberState::new(true)));
	}
	if schema.type_is("array") {
		let item_schema = match &schema.items {
			Some(items) if !items.is_empty() => items.clone(),
			_ => any_json_schema(),
		};
		return Ok(JsonFrame::List(ListState::new(item_schema, schema.min_items, schema.max_items, config)));
	}
	if let Some(TypeField::Multiple(types)) = &schema.schema_type {
		let branches = types
			.iter()
			.map(|type_name| frame_for_schema(context, config, &Arc::new(JsonSchemaObject::with_type(type_name))))
			.collect::<Result<Vec<_>, _>>()?;
		return Ok(JsonFrame::Union(branches));
	}
	Err(ParserError::UnsupportedSchema(format!("unsupported type {:?}", schema.schema_type)))
}

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::config::ParserConfig;
use crate::parser::{CharacterLevelParser, ParserError};
use crate::regex::{RegexContext, RegexParser};

/// Structured view of the supported JSON Schema subset. Unrecognized keywords are
/// ignored on load; `format` in particular carries no meaning here.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct JsonSchemaObject {
	#[serde(rename = "type")]
	pub schema_type: Option<TypeField>,
	pub properties: Option<HashMap<String, Arc<JsonSchemaObject>>>,
	pub required: Vec<String>,
	#[serde(rename = "additionalProperties")]
	pub additional_properties: Option<AdditionalProperties>,
	pub items: Option<Arc<JsonSchemaObject>>,
	#[serde(rename = "minItems")]
	pub min_items: Option<usize>,
	#[serde(rename = "maxItems")]
	pub max_items: Option<usize>,
	#[serde(rename = "minLength")]
	pub min_length: Option<usize>,
	#[serde(rename = "maxLength")]
	pub max_length: Option<usize>,
	pub pattern: Option<String>,
	#[serde(rename = "enum")]
	pub enum_values: Vec<Value>,
	#[serde(rename = "const")]
	pub const_value: Option<Value>,
	#[serde(rename = "anyOf")]
	pub any_of: Vec<Arc<JsonSchemaObject>>,
	#[serde(rename = "oneOf")]
	pub one_of: Vec<Arc<JsonSchemaObject>>,
	#[serde(rename = "allOf")]
	pub all_of: Vec<Arc<JsonSchemaObject>>,
	#[serde(rename = "$ref")]
	pub reference: Option<String>,
	pub definitions: HashMap<String, Arc<JsonSchemaObject>>,
	#[serde(rename = "$defs")]
	pub defs: HashMap<String, Arc<JsonSchemaObject>>,
}

/// `type` is either a single name or a list of names.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TypeField {
	Single(String),
	Multiple(Vec<String>),
}

/// `additionalProperties` is either a blanket boolean or a schema for the values.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AdditionalProperties {
	Allowed(bool),
	Schema(Arc<JsonSchemaObject>),
}

impl JsonSchemaObject {
	pub fn from_value(value: &Value) -> Result<JsonSchemaObject, ParserError> {
		serde_json::from_value(value.clone()).map_err(|e| ParserError::InvalidSchema(e.to_string()))
	}

	pub fn from_text(text: &str) -> Result<JsonSchemaObject, ParserError> {
		serde_json::from_str(text).map_err(|e| ParserError::InvalidSchema(e.to_string()))
	}

	/// A schema consisting of one bare type name.
	pub fn with_type(type_name: &str) -> JsonSchemaObject {
		JsonSchemaObject {
			schema_type: Some(TypeField::Single(type_name.to_string())),
			..Default::default()
		}
	}

	pub fn type_is(&self, type_name: &str) -> bool {
		matches!(&self.schema_type, Some(TypeField::Single(name)) if name == type_name)
	}

	/// True when no recognized keyword is present. An empty schema in `items` position
	/// means "any value".
	pub fn is_empty(&self) -> bool {
		self.schema_type.is_none()
			&& self.properties.is_none()
			&& self.items.is_none()
			&& self.enum_values.is_empty()
			&& self.const_value.is_none()
			&& self.any_of.is_empty()
			&& self.one_of.is_empty()
			&& self.all_of.is_empty()
			&& self.reference.is_none()
	}

	/// Check a parsed JSON value against this schema. Only the supported keyword subset
	/// participates; `$ref`s resolve against this object's definition tables.
	pub fn is_valid(&self, value: &Value) -> bool {
		self.validate(value, self)
	}

	fn validate(&self, value: &Value, root: &JsonSchemaObject) -> bool {
		if let Some(reference) = &self.reference {
			return match resolve_ref(root, reference) {
				Ok(resolved) => resolved.validate(value, root),
				Err(_) => false,
			};
		}
		if !self.any_of.is_empty() {
			return self.any_of.iter().any(|option| option.validate(value, root));
		}
		if !self.one_of.is_empty() {
			return self.one_of.iter().any(|option| merge_object_schemas(self, option).validate(value, root));
		}
		if !self.all_of.is_empty() {
			let mut merged = (*self.all_of[0]).clone();
			for schema in &self.all_of[1..] {
				merged = merge_object_schemas(&merged, schema);
			}
			return merged.validate(value, root);
		}
		if let Some(const_value) = &self.const_value {
			return value == const_value;
		}
		if !self.enum_values.is_empty() {
			return self.enum_values.contains(value);
		}
		match &self.schema_type {
			Some(TypeField::Multiple(types)) => types.iter().any(|t| JsonSchemaObject::with_type(t).validate(value, root)),
			Some(TypeField::Single(type_name)) => match (type_name.as_str(), value) {
				("boolean", Value::Bool(_)) => true,
				("null", Value::Null) => true,
				("integer", Value::Number(n)) => n.is_i64() || n.is_u64(),
				("number", Value::Number(_)) => true,
				("string", Value::String(s)) => self.validate_string(s),
				("array", Value::Array(items)) => self.validate_array(items, root),
				("object", Value::Object(entries)) => self.validate_object(entries, root),
				_ => false,
			},
			None => false,
		}
	}

	fn validate_string(&self, s: &str) -> bool {
		let length = s.chars().count();
		if self.min_length.map_or(false, |min| length < min) {
			return false;
		}
		if self.max_length.map_or(false, |max| length > max) {
			return false;
		}
		if let Some(pattern) = &self.pattern {
			let Ok(context) = RegexContext::new(pattern) else {
				return false;
			};
			let mut matcher = RegexParser::from_context(Arc::new(context), Arc::new(ParserConfig::default()));
			for character in s.chars() {
				matcher = matcher.step(character);
			}
			return matcher.can_end();
		}
		true
	}

	fn validate_array(&self, items: &[Value], root: &JsonSchemaObject) -> bool {
		if self.min_items.map_or(false, |min| items.len() < min) {
			return false;
		}
		if self.max_items.map_or(false, |max| items.len() > max) {
			return false;
		}
		match &self.items {
			Some(item_schema) if !item_schema.is_empty() => items.iter().all(|item| item_schema.validate(item, root)),
			_ => true,
		}
	}

	fn validate_object(&self, entries: &serde_json::Map<String, Value>, root: &JsonSchemaObject) -> bool {
		if !self.required.iter().all(|key| entries.contains_key(key)) {
			return false;
		}
		match &self.properties {
			Some(properties) => entries.iter().all(|(key, entry)| match properties.get(key) {
				Some(schema) => schema.validate(entry, root),
				None => false,
			}),
			None => match &self.additional_properties {
				Some(AdditionalProperties::Schema(schema)) => entries.values().all(|entry| schema.validate(entry, root)),
				_ => true,
			},
		}
	}
}

/// Fold `base`'s object members into `option`; on a clash the option wins, since it is
/// assumed to be the more specific of the two.
pub(crate) fn merge_object_schemas(base: &JsonSchemaObject, option: &JsonSchemaObject) -> JsonSchemaObject {
	let mut merged = option.clone();
	let mut properties = merged.properties.take().unwrap_or_default();
	if let Some(base_properties) = &base.properties {
		for (name, schema) in base_properties {
			properties.entry(name.clone()).or_insert_with(|| schema.clone());
		}
	}
	merged.properties = Some(properties);
	for required in &base.required {
		if !merged.required.contains(required) {
			merged.required.push(required.clone());
		}
	}
	merged
}

/// Resolve a `#/definitions/...` or `#/$defs/...` reference against the root schema.
pub(crate) fn resolve_ref(root: &JsonSchemaObject, reference: &str) -> Result<Arc<JsonSchemaObject>, ParserError> {
	let name = reference.rsplit('/').next().unwrap_or(reference);
	root.definitions
		.get(name)
		.or_else(|| root.defs.get(name))
		.cloned()
		.ok_or_else(|| ParserError::MissingDefinition(reference.to_string()))
}

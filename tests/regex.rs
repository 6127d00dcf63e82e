mod common;

use std::sync::Arc;

use llm_enforce::config::{ParserConfig, COMPLETE_ALPHABET};
use llm_enforce::parser::ParserHandle;
use llm_enforce::RegexParser;

use common::{assert_parser_with_string, setup};

fn test_regex_parsing_with_string(string: &str, regex: &str, expect_success: bool) {
	test_regex_parsing_with_config(string, regex, expect_success, Arc::new(ParserConfig::default()));
}

fn test_regex_parsing_with_config(string: &str, regex: &str, expect_success: bool, config: Arc<ParserConfig>) {
	setup();
	let parser: ParserHandle = Arc::new(RegexParser::with_config(regex, config).expect("valid pattern"));
	assert_parser_with_string(string, parser, expect_success);
}

#[test]
fn test_parsing_exact_string() {
	test_regex_parsing_with_string("abc123", "abc123", true);
}

#[test]
fn test_parsing_exact_string_failure() {
	test_regex_parsing_with_string("abc124", "abc123", false);
}

#[test]
fn test_parsing_exact_string_not_reaching_end() {
	test_regex_parsing_with_string("abc123", "abc1234", false);
}

#[test]
fn test_parsing_letter_options() {
	for letter in "cdefghif".chars() {
		let expect_success = "cdef".contains(letter);
		test_regex_parsing_with_string(&format!("ab{letter}123"), "ab(c|d|e|f)123", expect_success);
	}
}

#[test]
fn test_parsing_digits() {
	for character in "0123abcd".chars() {
		let expect_success = character.is_ascii_digit();
		test_regex_parsing_with_string(&format!("ab{character}123"), r"ab\d123", expect_success);
	}
}

#[test]
fn test_parsing_repeat() {
	for num_repeats in 0..20 {
		let expect_success = num_repeats > 0;
		test_regex_parsing_with_string(&format!("ab{}123", "c".repeat(num_repeats)), "abc+123", expect_success);
	}
}

#[test]
fn test_any_character() {
	for (num_repeats, character) in "0123456789abcdefghij".chars().enumerate() {
		let expect_success = num_repeats > 0;
		test_regex_parsing_with_string(&format!("ab{}123", character.to_string().repeat(num_repeats)), "ab.+123", expect_success);
	}
}

#[test]
fn test_dates() {
	let date_regex = r"(0?[1-9]|[12][0-9]|3[01])[\/\-](0?[1-9]|1[012])[\/\-]\d{4}";
	test_regex_parsing_with_string("01/01/2020", date_regex, true);
	test_regex_parsing_with_string("29/04/1986", date_regex, true);
	test_regex_parsing_with_string("001/01/2020", date_regex, false);
}

#[test]
fn test_string_choice() {
	let choice_regex = "abc|def|ghi";
	test_regex_parsing_with_string("abc", choice_regex, true);
	test_regex_parsing_with_string("def", choice_regex, true);
	test_regex_parsing_with_string("ghi", choice_regex, true);
	test_regex_parsing_with_string("aei", choice_regex, false);
}

#[test]
fn test_increasing_alphabet() {
	let any_regex = "...";
	test_regex_parsing_with_string("abc", any_regex, true);
	test_regex_parsing_with_string("abΣ", any_regex, false);
	let custom_config = Arc::new(ParserConfig {
		alphabet: format!("{COMPLETE_ALPHABET}Σ"),
		..ParserConfig::default()
	});
	test_regex_parsing_with_config("abΣ", any_regex, true, custom_config);
}

#[test]
fn test_phone_number() {
	let phone_regex = r"\([0-9]{3}\)[0-9]{3}-[0-9]{4}";
	test_regex_parsing_with_string("(312)011-2444", phone_regex, true);
	test_regex_parsing_with_string("312-011-2444", phone_regex, false);
}

#[test]
fn test_negative_matching() {
	let pattern = r"- Keywords: [^;:,/\n\r]+; [^;:,/\n\r]+; [^;:,/\n\r]+";
	let text = "- Keywords: intranasal vaccine, long-lasting immunity, adjuvants";
	test_regex_parsing_with_string(text, pattern, false);
	let correct_text = text.replace(',', ";");
	test_regex_parsing_with_string(&correct_text, pattern, true);
}

use std::collections::HashMap;
use std::sync::Arc;

use crate::parser::{CacheKey, CharacterLevelParser, ParserError, ParserHandle};

#[derive(Debug, Default)]
struct ChoiceTrieNode {
	children: HashMap<char, usize>,
	terminal: bool,
}

/// Arena-indexed trie over one alternation list.
#[derive(Debug, Default)]
struct ChoiceTrie {
	nodes: Vec<ChoiceTrieNode>,
}

impl ChoiceTrie {
	fn new(choices: &[String]) -> ChoiceTrie {
		let mut trie = ChoiceTrie {
			nodes: vec![ChoiceTrieNode::default()],
		};
		for choice in choices {
			let mut node = 0;
			for character in choice.chars() {
				node = match trie.nodes[node].children.get(&character) {
					Some(&child) => child,
					None => {
						trie.nodes.push(ChoiceTrieNode::default());
						let child = trie.nodes.len() - 1;
						trie.nodes[node].children.insert(character, child);
						child
					}
				};
			}
			trie.nodes[node].terminal = true;
		}
		trie
	}
}

/// Accepts strings drawn from the concatenation `L1 · L2 · … · Lk`, where each `Li` is
/// a finite set of literal alternatives, possibly including the empty string. The
/// tracked state is the set of live (list, trie node) positions, which stays small even
/// when the alternation lists hold millions of entries.
#[derive(Debug, Clone)]
pub struct MultiChoicesParser {
	tries: Arc<Vec<ChoiceTrie>>,
	positions: Vec<(u32, u32)>,
	finished: bool,
}

impl MultiChoicesParser {
	pub fn new(list_of_choices: &[Vec<String>]) -> MultiChoicesParser {
		let tries: Arc<Vec<ChoiceTrie>> = Arc::new(list_of_choices.iter().map(|choices| ChoiceTrie::new(choices)).collect());
		let mut positions = Vec::new();
		let mut finished = tries.is_empty();
		if !tries.is_empty() {
			add_position(&tries, 0, 0, &mut positions, &mut finished);
		}
		positions.sort_unstable();
		MultiChoicesParser { tries, positions, finished }
	}
}

/// Record a live position and epsilon-close it: a terminal node lets the parse continue
/// at the root of the next list, and past the last list the whole input is accepted.
fn add_position(tries: &[ChoiceTrie], list: usize, node: usize, positions: &mut Vec<(u32, u32)>, finished: &mut bool) {
	let position = (list as u32, node as u32);
	if positions.contains(&position) {
		return;
	}
	positions.push(position);
	if tries[list].nodes[node].terminal {
		if list + 1 == tries.len() {
			*finished = true;
		} else {
			add_position(tries, list + 1, 0, positions, finished);
		}
	}
}

impl CharacterLevelParser for MultiChoicesParser {
	fn advance(&self, character: char) -> Result<ParserHandle, ParserError> {
		let mut positions = Vec::new();
		let mut finished = false;
		for &(list, node) in &self.positions {
			let trie = &self.tries[list as usize];
			if let Some(&child) = trie.nodes[node as usize].children.get(&character) {
				add_position(&self.tries, list as usize, child, &mut positions, &mut finished);
			}
		}
		positions.sort_unstable();
		Ok(Arc::new(MultiChoicesParser {
			tries: self.tries.clone(),
			positions,
			finished,
		}))
	}

	fn allowed_characters(&self) -> String {
		let mut allowed = String::new();
		for &(list, node) in &self.positions {
			for character in self.tries[list as usize].nodes[node as usize].children.keys() {
				if !allowed.contains(*character) {
					allowed.push(*character);
				}
			}
		}
		allowed
	}

	fn can_end(&self) -> bool {
		self.finished
	}

	fn cache_key(&self) -> Option<CacheKey> {
		Some(CacheKey::MultiChoices {
			grammar: Arc::as_ptr(&self.tries) as usize,
			positions: self.positions.clone(),
			finished: self.finished,
		})
	}
}

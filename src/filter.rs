//! Ignore and protect rule engine
//!
//! A small gitignore-like grammar shared by the tree walker (ignore lists)
//! and the server-side deletion handler (protect lists):
//!
//! - blank lines and `#` comments are skipped
//! - a trailing `/` restricts the rule to directories
//! - a leading `/` anchors the pattern at the workspace root
//! - a leading `!` negates a prior match; later rules override earlier ones
//! - anything else matches anywhere in the tree via `{pat, **/pat}`

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::path::Path;

use crate::error::JanusError;

#[derive(Debug)]
struct Rule {
	negated: bool,
	dir_only: bool,
	matcher: GlobSet,
}

/// An ordered list of compiled rules
///
/// Evaluation walks all rules in order; the last matching rule decides.
#[derive(Debug)]
pub struct RuleSet {
	rules: Vec<Rule>,
}

impl RuleSet {
	/// A rule set that matches nothing
	pub fn empty() -> Self {
		RuleSet { rules: Vec::new() }
	}

	/// Compile a list of pattern lines into a rule set
	pub fn parse<S: AsRef<str>>(lines: &[S]) -> Result<Self, JanusError> {
		let mut rules = Vec::new();

		for line in lines {
			let mut pat = line.as_ref().trim();
			if pat.is_empty() || pat.starts_with('#') {
				continue;
			}

			let negated = pat.starts_with('!');
			if negated {
				pat = &pat[1..];
			}

			let dir_only = pat.ends_with('/');
			if dir_only {
				pat = &pat[..pat.len() - 1];
			}

			let anchored = pat.starts_with('/');
			if anchored {
				pat = &pat[1..];
			}

			if pat.is_empty() {
				continue;
			}

			let mut builder = GlobSetBuilder::new();
			builder.add(
				GlobBuilder::new(pat)
					.literal_separator(true)
					.build()
					.map_err(|e| JanusError::Config {
						message: format!("Bad filter pattern '{}': {}", line.as_ref(), e),
					})?,
			);
			if !anchored {
				// Unanchored patterns also match at any depth
				let recursive = format!("**/{}", pat);
				builder.add(
					GlobBuilder::new(&recursive)
						.literal_separator(true)
						.build()
						.map_err(|e| JanusError::Config {
							message: format!("Bad filter pattern '{}': {}", line.as_ref(), e),
						})?,
				);
			}

			let matcher = builder.build().map_err(|e| JanusError::Config {
				message: format!("Failed to build pattern set: {}", e),
			})?;

			rules.push(Rule { negated, dir_only, matcher });
		}

		Ok(RuleSet { rules })
	}

	pub fn is_empty(&self) -> bool {
		self.rules.is_empty()
	}

	/// Evaluate a workspace-relative path against the rule list
	pub fn matches(&self, rel: &Path, is_dir: bool) -> bool {
		let mut decision = false;
		for rule in &self.rules {
			if rule.dir_only && !is_dir {
				continue;
			}
			if rule.matcher.is_match(rel) {
				decision = !rule.negated;
			}
		}
		decision
	}
}


// vim: ts=4

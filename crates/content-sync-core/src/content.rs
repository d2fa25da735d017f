use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Separator used when qualifying a nested id with its parent's id.
pub const ID_SEPARATOR: &str = "|";

/// A single content object as stored in a version's `.json` files.
///
/// Content forms a tree: pages contain sections, sections contain questions,
/// questions contain hints and choices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentItem {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub children: Vec<ContentItem>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub related_content: Vec<String>,
    #[serde(default)]
    pub published: bool,
    /// Media source path, relative to the file the item was defined in.
    #[serde(default)]
    pub src: Option<String>,
    #[serde(default)]
    pub alt_text: Option<String>,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub require_units: bool,
    /// Symbols offered to users of a symbolic question.
    #[serde(default)]
    pub available_symbols: Vec<String>,
    /// Event start, in epoch milliseconds on the wire.
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub date: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub plain_text_content: Option<String>,
    #[serde(default)]
    pub reply_to_email_address: Option<String>,
    #[serde(default)]
    pub reply_to_name: Option<String>,
    /// Path of the file this item was loaded from; filled in by the indexer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_source_file: Option<String>,
}

fn default_content_type() -> String {
    "content".to_string()
}

/// An answer option of a question.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Choice {
    #[serde(rename = "type", default = "default_choice_type")]
    pub choice_type: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub correct: bool,
    #[serde(default)]
    pub units: Option<String>,
    #[serde(default)]
    pub python_expression: Option<String>,
    #[serde(default)]
    pub mhchem_expression: Option<String>,
}

fn default_choice_type() -> String {
    "choice".to_string()
}

impl Choice {
    pub fn is_quantity(&self) -> bool {
        self.choice_type == "quantity"
    }

    pub fn is_formula(&self) -> bool {
        self.choice_type == "formula"
    }

    pub fn is_chemical_formula(&self) -> bool {
        self.choice_type == "chemicalFormula"
    }
}

impl ContentItem {
    pub fn is_media(&self) -> bool {
        matches!(self.content_type.as_str(), "image" | "figure" | "video")
    }

    pub fn is_question(&self) -> bool {
        self.content_type == "question" || self.content_type.ends_with("Question")
    }

    /// Questions that are marked by matching a choice.
    pub fn is_choice_question(&self) -> bool {
        self.is_question() && self.content_type != "question" && self.content_type != "isaacQuestion"
    }

    pub fn is_numeric_question(&self) -> bool {
        self.content_type == "isaacNumericQuestion"
    }

    pub fn is_symbolic_question(&self) -> bool {
        self.content_type == "isaacSymbolicQuestion"
    }

    pub fn is_chemistry_question(&self) -> bool {
        self.content_type == "isaacSymbolicChemistryQuestion"
    }

    pub fn is_event_page(&self) -> bool {
        self.content_type == "isaacEventPage"
    }

    pub fn is_email_template(&self) -> bool {
        self.content_type == "emailTemplate"
    }

    /// The item and all of its descendants, parent first.
    pub fn flatten(&self) -> Vec<&ContentItem> {
        let mut out = vec![self];
        let mut i = 0;
        while i < out.len() {
            let item = out[i];
            out.extend(item.children.iter());
            i += 1;
        }
        out
    }

    /// Key under which problems with this item are reported.
    pub fn problem_key(&self) -> String {
        self.id
            .clone()
            .or_else(|| self.canonical_source_file.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Structural problems found while indexing one version, keyed by content id
/// (or source file when the item has no id).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentProblemReport {
    problems: BTreeMap<String, Vec<String>>,
}

impl ContentProblemReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a problem against a content item or file.
    pub fn register(&mut self, key: impl Into<String>, message: impl Into<String>) {
        self.problems.entry(key.into()).or_default().push(message.into());
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.problems.get(key).map(Vec::as_slice)
    }

    /// Number of distinct items with problems.
    pub fn len(&self) -> usize {
        self.problems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }

    /// Total number of problem messages across all items.
    pub fn total_problems(&self) -> usize {
        self.problems.values().map(Vec::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.problems.iter()
    }
}

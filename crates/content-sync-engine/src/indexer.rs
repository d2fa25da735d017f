use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use content_sync_core::{
    BackingStore, ContentItem, ContentProblemReport, SyncError, VersionId, ID_SEPARATOR,
};
use tracing::{debug, info, instrument, warn};

use crate::validate::check_for_content_errors;

/// Options controlling what the indexer keeps.
#[derive(Debug, Clone, Copy)]
pub struct IndexerOptions {
    /// Keep top-level content that is not marked as published.
    pub include_unpublished: bool,
}

impl Default for IndexerOptions {
    fn default() -> Self {
        Self {
            include_unpublished: true,
        }
    }
}

/// Parsed content of one version, ready to be served.
#[derive(Debug)]
pub struct VersionIndex {
    version: VersionId,
    items: HashMap<String, ContentItem>,
    tags: BTreeSet<String>,
    units: BTreeMap<String, String>,
}

impl VersionIndex {
    pub fn version(&self) -> &VersionId {
        &self.version
    }

    pub fn get(&self, id: &str) -> Option<&ContentItem> {
        self.items.get(id)
    }

    pub fn with_prefix(&self, prefix: &str) -> Vec<ContentItem> {
        let mut found: Vec<_> = self
            .items
            .iter()
            .filter(|(id, _)| id.starts_with(prefix))
            .map(|(_, item)| item.clone())
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        found
    }

    pub fn with_tags(&self, tags: &[&str]) -> Vec<ContentItem> {
        let mut found: Vec<_> = self
            .items
            .values()
            .filter(|item| tags.iter().all(|t| item.tags.contains(*t)))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        found
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn units(&self) -> &BTreeMap<String, String> {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Result of indexing one version.
#[derive(Debug)]
pub struct IndexOutcome {
    pub index: VersionIndex,
    pub problems: ContentProblemReport,
}

/// Reads every content file of a version, parses and augments it, and
/// collects structural problems along the way.
///
/// Problems in individual files never fail the run; only backing store
/// errors do.
pub struct ContentIndexer {
    store: Arc<dyn BackingStore>,
    options: IndexerOptions,
}

impl ContentIndexer {
    pub fn new(store: Arc<dyn BackingStore>, options: IndexerOptions) -> Self {
        Self { store, options }
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn build(&self, version: &VersionId) -> Result<IndexOutcome, SyncError> {
        let files = self
            .store
            .list_content_files(version)
            .await
            .map_err(|e| SyncError::indexing(version, e.to_string()))?;

        info!(
            "Populating content cache for version {} from {} files",
            version,
            files.len()
        );

        let mut roots = Vec::new();
        let mut items: HashMap<String, ContentItem> = HashMap::new();
        let mut tags = BTreeSet::new();
        let mut units = BTreeMap::new();
        let mut problems = ContentProblemReport::new();

        for path in &files {
            let bytes = self
                .store
                .read_file(version, path)
                .await
                .map_err(|e| SyncError::indexing(version, e.to_string()))?;

            let mut content: ContentItem = match serde_json::from_slice(&bytes) {
                Ok(content) => content,
                Err(e) => {
                    warn!("Unable to parse {} as a content object: {}", path, e);
                    problems.register(
                        path.clone(),
                        format!(
                            "Index failure - Unable to parse json file found - {}. The following error occurred: {}",
                            path, e
                        ),
                    );
                    continue;
                }
            };

            if !self.options.include_unpublished && !content.published {
                debug!("Skipping unpublished content: {:?}", content.id);
                continue;
            }

            augment(&mut content, path, None);

            for item in content.flatten() {
                let Some(id) = item.id.as_deref() else {
                    continue;
                };

                if id.contains('.') {
                    warn!("Resource with invalid ID ({}) detected in {}", id, path);
                    problems.register(
                        id,
                        format!(
                            "Index failure - Invalid ID {} found in file {}. Must not contain restricted characters.",
                            id, path
                        ),
                    );
                    continue;
                }

                match items.get(id) {
                    None => {
                        tags.extend(item.tags.iter().cloned());
                        if item.is_numeric_question() {
                            collect_units(item, &mut units);
                        }
                        items.insert(id.to_string(), item.clone());
                    }
                    Some(existing) if same_content(existing, item) => {
                        debug!("Resource ({}) already seen; skipping {}", id, path);
                    }
                    Some(existing) => {
                        warn!("Resource with duplicate ID ({}) detected in {}", id, path);
                        problems.register(
                            id,
                            format!(
                                "Index failure - Duplicate ID found in file {} and {} only one will be available",
                                path,
                                existing.canonical_source_file.as_deref().unwrap_or("unknown")
                            ),
                        );
                    }
                }
            }

            roots.push(content);
        }

        check_for_content_errors(self.store.as_ref(), version, &roots, &mut problems).await?;

        info!(
            "Content cache population for {} complete: {} items, {} with problems",
            version,
            items.len(),
            problems.len()
        );

        Ok(IndexOutcome {
            index: VersionIndex {
                version: version.clone(),
                items,
                tags,
                units,
            },
            problems,
        })
    }
}

/// Record the source file on every item, normalise tags, qualify nested ids
/// with their parent's id and resolve relative media paths.
fn augment(content: &mut ContentItem, source_file: &str, parent_id: Option<&str>) {
    content.canonical_source_file = Some(source_file.to_string());
    content.tags = std::mem::take(&mut content.tags)
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();

    if content.is_question() && content.id.is_none() {
        warn!(
            "Found question without id {:?} in {}",
            content.title, source_file
        );
    }

    if content.is_media() {
        if let Some(src) = content.src.take() {
            content.src = Some(fix_media_src(source_file, &src));
        }
    }

    let qualified = match (parent_id, content.id.as_deref()) {
        (Some(parent), Some(id)) => Some(format!("{}{}{}", parent, ID_SEPARATOR, id)),
        (None, Some(id)) => Some(id.to_string()),
        (parent, None) => parent.map(str::to_string),
    };

    for child in &mut content.children {
        augment(child, source_file, qualified.as_deref());
    }

    if content.id.is_some() {
        content.id = qualified;
    }
}

/// Resolve `src` against the directory of `source_file`, unless it is a URL.
fn fix_media_src(source_file: &str, src: &str) -> String {
    if src.starts_with("http://") || src.starts_with("https://") {
        return src.to_string();
    }

    // Absolute paths are relative to the version root
    let base = if src.starts_with('/') {
        ""
    } else {
        source_file.rsplit_once('/').map_or("", |(dir, _)| dir)
    };
    let mut parts: Vec<&str> = Vec::new();
    for segment in base.split('/').chain(src.split('/')) {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}

/// Equality ignoring where the items were loaded from.
fn same_content(a: &ContentItem, b: &ContentItem) -> bool {
    fn strip(item: &ContentItem) -> ContentItem {
        let mut item = item.clone();
        item.canonical_source_file = None;
        item.children = item.children.iter().map(strip).collect();
        item
    }
    strip(a) == strip(b)
}

fn collect_units(question: &ContentItem, units: &mut BTreeMap<String, String>) {
    for choice in question.choices.iter().filter(|c| c.is_quantity()) {
        let Some(unit) = choice.units.as_deref().filter(|u| !u.is_empty()) else {
            continue;
        };
        let key: String = unit
            .chars()
            .filter(|c| !matches!(c, ' ' | '\t' | '\n'))
            .collect();
        units.insert(key, unit.to_string());
    }
}

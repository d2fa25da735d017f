use std::collections::{BTreeMap, BTreeSet};

use content_sync_core::{BackingStore, ContentItem, ContentProblemReport, SyncError, VersionId};
use tracing::{error, info, warn};

/// Run structural checks over every indexed item of a version and add what
/// is wrong to `problems`.
///
/// Only a failing backing store aborts the check.
pub async fn check_for_content_errors(
    store: &dyn BackingStore,
    version: &VersionId,
    roots: &[ContentItem],
    problems: &mut ContentProblemReport,
) -> Result<(), SyncError> {
    info!("Starting content validation ({})", version);

    let mut defined = BTreeSet::new();
    // referenced id -> items that referenced it
    let mut expected: BTreeMap<&str, Vec<&ContentItem>> = BTreeMap::new();

    for item in roots.iter().flat_map(ContentItem::flatten) {
        let source = item.canonical_source_file.as_deref().unwrap_or("unknown");

        if let Some(id) = item.id.as_deref() {
            defined.insert(id);
        }
        for related in &item.related_content {
            expected.entry(related.as_str()).or_default().push(item);
        }

        if item.value.is_some() && !item.children.is_empty() {
            let first_line = match item.id.as_deref() {
                Some(id) => format!("Content: {}", id),
                None => "Content".to_string(),
            };
            problems.register(
                item.problem_key(),
                format!(
                    "{} in {} found with both children and a value. Content objects are only allowed to have one or the other.",
                    first_line, source
                ),
            );
            error!(
                "Invalid content item detected: The object with ID ({:?}) has both children and a value.",
                item.id
            );
        }

        if item.is_media() {
            check_media(store, version, item, source, problems).await?;
        }

        if item.is_question() && item.id.is_none() {
            problems.register(
                item.problem_key(),
                format!(
                    "Question: {} in {} found without a unique id. This question cannot be logged correctly.",
                    item.title.as_deref().unwrap_or("untitled"),
                    source
                ),
            );
        }

        if item.is_choice_question() {
            let id = item.id.as_deref().unwrap_or("unknown");
            if item.choices.is_empty() {
                problems.register(
                    item.problem_key(),
                    format!(
                        "Question: {} found without any choice metadata. This question will always be automatically marked as incorrect",
                        id
                    ),
                );
            } else if !item.choices.iter().any(|c| c.correct) {
                problems.register(
                    item.problem_key(),
                    format!(
                        "Question: {} found without a correct answer. This question will always be automatically marked as incorrect",
                        id
                    ),
                );
            }
        }

        if item.is_email_template() {
            if item.plain_text_content.is_none() {
                problems.register(
                    item.problem_key(),
                    "Email template should always have plain text content field",
                );
            }
            if item.reply_to_email_address.is_some() && item.reply_to_name.is_none() {
                problems.register(
                    item.problem_key(),
                    "Email template contains replyToEmailAddress but not replyToName",
                );
            }
        }

        if item.is_event_page() {
            if let (Some(start), Some(end)) = (item.date, item.end_date) {
                if end < start {
                    problems.register(item.problem_key(), "Event has end date before start date");
                }
            }
        }

        if item.is_numeric_question() {
            check_numeric(item, problems);
        }
        if item.is_symbolic_question() {
            check_symbolic(item, problems);
        }
        if item.is_chemistry_question() {
            check_chemistry(item, problems);
        }
    }

    let missing: Vec<_> = expected
        .iter()
        .filter(|(id, _)| !defined.contains(*id))
        .collect();
    for (id, referrers) in &missing {
        for referrer in referrers.iter() {
            problems.register(
                referrer.problem_key(),
                format!(
                    "This id ({}) was referenced by {} but the content with that ID cannot be found.",
                    id,
                    referrer.canonical_source_file.as_deref().unwrap_or("unknown")
                ),
            );
        }
    }
    if !missing.is_empty() {
        warn!(
            "Referential integrity broken for ({}) related content items in {}",
            missing.len(),
            version
        );
    }

    info!(
        "Validation processing ({}) complete. There are {} items with content problems",
        version,
        problems.len()
    );
    Ok(())
}

async fn check_media(
    store: &dyn BackingStore,
    version: &VersionId,
    item: &ContentItem,
    source: &str,
    problems: &mut ContentProblemReport,
) -> Result<(), SyncError> {
    let src = item.src.as_deref();

    if let Some(src) = src.filter(|s| !s.starts_with("http")) {
        let exists = store
            .file_exists(version, src)
            .await
            .map_err(|e| SyncError::indexing(version, e.to_string()))?;
        if !exists {
            problems.register(
                item.problem_key(),
                format!(
                    "Unable to find Image: {} in version {}. Could the reference be incorrect? SourceFile is {}",
                    src, version, source
                ),
            );
        }
    }

    if item.alt_text.as_deref().map_or(true, str::is_empty) {
        problems.register(
            item.problem_key(),
            format!(
                "No altText attribute set for media element: {} in source file {}",
                src.unwrap_or("none"),
                source
            ),
        );
    }
    Ok(())
}

fn check_numeric(question: &ContentItem, problems: &mut ContentProblemReport) {
    let id = question.id.as_deref().unwrap_or("unknown");
    for choice in &question.choices {
        if choice.is_quantity() {
            let parses = choice
                .value
                .as_deref()
                .is_some_and(|v| v.trim().parse::<f64>().is_ok());
            if !parses {
                problems.register(
                    question.problem_key(),
                    format!(
                        "Numeric Question: {} has Quantity ({}) with value that cannot be interpreted as a number. Users will never be able to match this answer.",
                        id,
                        choice.value.as_deref().unwrap_or("")
                    ),
                );
            }
        } else if question.require_units {
            problems.register(
                question.problem_key(),
                format!(
                    "Numeric Question: {} has non-Quantity Choice ({}). It must be deleted and a new Quantity Choice created.",
                    id,
                    choice.value.as_deref().unwrap_or("")
                ),
            );
        }
    }
}

fn check_symbolic(question: &ContentItem, problems: &mut ContentProblemReport) {
    let id = question.id.as_deref().unwrap_or("unknown");
    for symbol in question.available_symbols.iter().filter(|s| s.contains('\\')) {
        problems.register(
            question.problem_key(),
            format!(
                "Symbolic Question: {} has availableSymbol ({}) which contains a '\\' character.",
                id, symbol
            ),
        );
    }

    for choice in &question.choices {
        let value = choice.value.as_deref().unwrap_or("");
        if !choice.is_formula() {
            problems.register(
                question.problem_key(),
                format!(
                    "Symbolic Question: {} has non-Formula Choice ({}). It must be deleted and a new Formula Choice created.",
                    id, value
                ),
            );
            continue;
        }
        match choice.python_expression.as_deref() {
            Some(expr) if expr.contains('\\') => problems.register(
                question.problem_key(),
                format!(
                    "Symbolic Question: {} has Formula ({}) with pythonExpression which contains a '\\' character.",
                    id, value
                ),
            ),
            None | Some("") => problems.register(
                question.problem_key(),
                format!(
                    "Symbolic Question: {} has Formula ({}) with empty pythonExpression!",
                    id, value
                ),
            ),
            Some(_) => {}
        }
    }
}

fn check_chemistry(question: &ContentItem, problems: &mut ContentProblemReport) {
    let id = question.id.as_deref().unwrap_or("unknown");
    for choice in &question.choices {
        if !choice.is_chemical_formula() {
            problems.register(
                question.problem_key(),
                format!(
                    "Chemistry Question: {} has non-ChemicalFormula Choice ({}). It must be deleted and a new ChemicalFormula Choice created.",
                    id,
                    choice.value.as_deref().unwrap_or("")
                ),
            );
        } else if choice.mhchem_expression.as_deref().map_or(true, str::is_empty) {
            problems.register(
                question.problem_key(),
                format!(
                    "Chemistry Question: {} has ChemicalFormula with empty mhchemExpression!",
                    id
                ),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use content_sync_core::MemoryStore;

    fn parse(json: &str, source: &str) -> ContentItem {
        let mut item: ContentItem = serde_json::from_str(json).unwrap();
        fn stamp(item: &mut ContentItem, source: &str) {
            item.canonical_source_file = Some(source.to_string());
            for child in &mut item.children {
                stamp(child, source);
            }
        }
        stamp(&mut item, source);
        item
    }

    async fn problems_for(store: &MemoryStore, roots: &[ContentItem]) -> ContentProblemReport {
        let mut problems = ContentProblemReport::new();
        check_for_content_errors(store, &VersionId::from("v1"), roots, &mut problems)
            .await
            .unwrap();
        problems
    }

    #[tokio::test]
    async fn test_clean_content_has_no_problems() {
        let store = MemoryStore::new().with_version("v1", [("img/a.png", "png")]);
        let roots = vec![
            parse(
                r#"{"id": "page", "relatedContent": ["other"], "children": [
                    {"type": "image", "src": "img/a.png", "altText": "a diagram"},
                    {"id": "q", "type": "isaacMultiChoiceQuestion", "choices": [{"value": "4", "correct": true}]}
                ]}"#,
                "page.json",
            ),
            parse(r#"{"id": "other", "value": "text"}"#, "other.json"),
        ];
        assert!(problems_for(&store, &roots).await.is_empty());
    }

    #[tokio::test]
    async fn test_value_and_children() {
        let store = MemoryStore::new().with_version("v1", [("x.json", "{}")]);
        let roots = vec![parse(r#"{"id": "both", "value": "v", "children": [{"value": "c"}]}"#, "x.json")];
        let problems = problems_for(&store, &roots).await;
        assert!(problems.get("both").unwrap()[0].contains("both children and a value"));
    }

    #[tokio::test]
    async fn test_media_missing_and_without_alt_text() {
        let store = MemoryStore::new().with_version("v1", [("x.json", "{}")]);
        let roots = vec![parse(r#"{"id": "fig", "type": "figure", "src": "img/gone.png"}"#, "x.json")];
        let problems = problems_for(&store, &roots).await;
        let fig = problems.get("fig").unwrap();
        assert_eq!(fig.len(), 2);
        assert!(fig[0].contains("Unable to find Image: img/gone.png"));
        assert!(fig[1].contains("No altText"));
    }

    #[tokio::test]
    async fn test_question_checks() {
        let store = MemoryStore::new().with_version("v1", [("q.json", "{}")]);
        let roots = vec![parse(
            r#"{"id": "page", "children": [
                {"type": "isaacQuestion", "title": "Anonymous"},
                {"id": "nochoice", "type": "isaacMultiChoiceQuestion"},
                {"id": "nocorrect", "type": "isaacMultiChoiceQuestion", "choices": [{"value": "1"}]},
                {"id": "num", "type": "isaacNumericQuestion", "requireUnits": true, "choices": [
                    {"type": "quantity", "value": "abc", "correct": true},
                    {"type": "choice", "value": "5"}
                ]}
            ]}"#,
            "q.json",
        )];
        let problems = problems_for(&store, &roots).await;

        assert!(problems.get("q.json").unwrap()[0].contains("without a unique id"));
        assert!(problems.get("nochoice").unwrap()[0].contains("without any choice metadata"));
        assert!(problems.get("nocorrect").unwrap()[0].contains("without a correct answer"));
        let num = problems.get("num").unwrap();
        assert!(num.iter().any(|p| p.contains("cannot be interpreted as a number")));
        assert!(num.iter().any(|p| p.contains("non-Quantity Choice (5)")));
    }

    #[tokio::test]
    async fn test_dangling_related_content() {
        let store = MemoryStore::new().with_version("v1", [("a.json", "{}")]);
        let roots = vec![parse(r#"{"id": "a", "relatedContent": ["ghost"]}"#, "a.json")];
        let problems = problems_for(&store, &roots).await;
        assert!(problems.get("a").unwrap()[0].contains("This id (ghost) was referenced by a.json"));
    }

    #[tokio::test]
    async fn test_every_referrer_of_a_missing_id_is_reported() {
        let store = MemoryStore::new().with_version("v1", [("a.json", "{}")]);
        let roots = vec![
            parse(r#"{"id": "a", "relatedContent": ["ghost"]}"#, "a.json"),
            parse(r#"{"id": "b", "relatedContent": ["ghost"]}"#, "b.json"),
        ];
        let problems = problems_for(&store, &roots).await;
        assert!(problems.get("a").unwrap()[0].contains("referenced by a.json"));
        assert!(problems.get("b").unwrap()[0].contains("referenced by b.json"));
    }

    #[tokio::test]
    async fn test_event_and_email_checks() {
        let store = MemoryStore::new().with_version("v1", [("x.json", "{}")]);
        let roots = vec![
            parse(
                r#"{"id": "ev", "type": "isaacEventPage", "date": 1700000000000, "endDate": 1600000000000}"#,
                "ev.json",
            ),
            parse(
                r#"{"id": "ok", "type": "isaacEventPage", "date": 1600000000000, "endDate": 1700000000000}"#,
                "ok.json",
            ),
            parse(
                r#"{"id": "mail", "type": "emailTemplate", "replyToEmailAddress": "a@b.c"}"#,
                "mail.json",
            ),
        ];
        let problems = problems_for(&store, &roots).await;

        assert_eq!(problems.get("ev").unwrap(), ["Event has end date before start date"]);
        assert!(problems.get("ok").is_none());
        assert_eq!(problems.get("mail").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_symbolic_and_chemistry_choices() {
        let store = MemoryStore::new().with_version("v1", [("q.json", "{}")]);
        let roots = vec![parse(
            r#"{"id": "page", "children": [
                {"id": "sym", "type": "isaacSymbolicQuestion", "availableSymbols": ["x", "\\alpha"], "choices": [
                    {"type": "formula", "value": "x^2", "pythonExpression": "x**2", "correct": true},
                    {"type": "formula", "value": "y", "pythonExpression": ""},
                    {"type": "choice", "value": "z"}
                ]},
                {"id": "chem", "type": "isaacSymbolicChemistryQuestion", "choices": [
                    {"type": "chemicalFormula", "value": "H2O", "mhchemExpression": "H2O", "correct": true},
                    {"type": "chemicalFormula", "value": "O2"},
                    {"type": "choice", "value": "CO2"}
                ]}
            ]}"#,
            "q.json",
        )];
        let problems = problems_for(&store, &roots).await;

        let sym = problems.get("sym").unwrap();
        assert_eq!(sym.len(), 3);
        assert!(sym.iter().any(|p| p.contains("availableSymbol (\\alpha)")));
        assert!(sym.iter().any(|p| p.contains("Formula (y) with empty pythonExpression")));
        assert!(sym.iter().any(|p| p.contains("non-Formula Choice (z)")));

        let chem = problems.get("chem").unwrap();
        assert_eq!(chem.len(), 2);
        assert!(chem.iter().any(|p| p.contains("empty mhchemExpression")));
        assert!(chem.iter().any(|p| p.contains("non-ChemicalFormula Choice (CO2)")));
    }
}

//! Request builder: (label set, texts) → classification requests.

use crate::models::{ClassificationRequest, CodebookError, LabelMode, LabelSet, Result, TextItem};
use std::collections::HashSet;
use std::sync::Arc;

/// Positional fallback id for the item at `index` (zero-based).
///
/// Closed vocabularies use `quote-00001`, keyword extraction uses `text-00001`.
pub fn positional_id(mode: LabelMode, index: usize) -> String {
    let prefix = match mode {
        LabelMode::Single | LabelMode::Multi => "quote",
        LabelMode::Open => "text",
    };
    format!("{prefix}-{:05}", index + 1)
}

/// Build one request per text item, preserving input order.
///
/// Items without a caller-supplied id get a positional one. Ids must be
/// unique across the whole submission.
pub fn build_requests(
    label_set: Arc<LabelSet>,
    items: &[TextItem],
) -> Result<Vec<ClassificationRequest>> {
    if items.is_empty() {
        return Err(CodebookError::Validation(
            "text collection must not be empty".to_string(),
        ));
    }
    if label_set.mode().is_closed() && label_set.is_empty() {
        return Err(CodebookError::Validation(format!(
            "label set for {} mode must not be empty",
            label_set.mode()
        )));
    }

    let mut seen = HashSet::with_capacity(items.len());
    let mut requests = Vec::with_capacity(items.len());

    for (index, item) in items.iter().enumerate() {
        let external_id = match &item.external_id {
            Some(id) if !id.trim().is_empty() => id.clone(),
            _ => positional_id(label_set.mode(), index),
        };

        if !seen.insert(external_id.clone()) {
            return Err(CodebookError::Validation(format!(
                "duplicate external id '{external_id}' at position {}",
                index + 1
            )));
        }

        requests.push(ClassificationRequest {
            external_id,
            text: item.text.clone(),
            label_set: Arc::clone(&label_set),
        });
    }

    Ok(requests)
}

/// Convenience wrapper for bare texts with positional ids.
pub fn build_requests_from_texts<S: AsRef<str>>(
    label_set: Arc<LabelSet>,
    texts: &[S],
) -> Result<Vec<ClassificationRequest>> {
    let items: Vec<TextItem> = texts.iter().map(|t| TextItem::new(t.as_ref())).collect();
    build_requests(label_set, &items)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentiment() -> Arc<LabelSet> {
        Arc::new(LabelSet::new(LabelMode::Single, ["positive", "negative", "neutral"]).unwrap())
    }

    #[test]
    fn test_one_request_per_item_in_order() {
        let texts = ["first", "second", "third", "fourth"];
        let requests = build_requests_from_texts(sentiment(), &texts).unwrap();

        assert_eq!(requests.len(), texts.len());
        for (request, text) in requests.iter().zip(texts) {
            assert_eq!(request.text, text);
        }
        let ids: HashSet<_> = requests.iter().map(|r| r.external_id.as_str()).collect();
        assert_eq!(ids.len(), texts.len());
        assert_eq!(requests[0].external_id, "quote-00001");
        assert_eq!(requests[3].external_id, "quote-00004");
    }

    #[test]
    fn test_caller_ids_are_kept_and_missing_ones_fall_back() {
        let items = vec![
            TextItem::new("a").with_id("row-17"),
            TextItem::new("b"),
            TextItem::new("c").with_id("row-3"),
        ];
        let requests = build_requests(sentiment(), &items).unwrap();
        let ids: Vec<_> = requests.iter().map(|r| r.external_id.as_str()).collect();
        assert_eq!(ids, ["row-17", "quote-00002", "row-3"]);
    }

    #[test]
    fn test_open_mode_uses_text_prefix() {
        let requests = build_requests_from_texts(Arc::new(LabelSet::open()), &["x"]).unwrap();
        assert_eq!(requests[0].external_id, "text-00001");
    }

    #[test]
    fn test_empty_texts_rejected() {
        let empty: [&str; 0] = [];
        assert!(matches!(
            build_requests_from_texts(sentiment(), &empty),
            Err(CodebookError::Validation(_))
        ));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let items = vec![
            TextItem::new("a").with_id("dup"),
            TextItem::new("b").with_id("dup"),
        ];
        assert!(matches!(
            build_requests(sentiment(), &items),
            Err(CodebookError::Validation(_))
        ));

        // A caller id that collides with a positional fallback is also a duplicate.
        let items = vec![TextItem::new("a"), TextItem::new("b").with_id("quote-00001")];
        assert!(build_requests(sentiment(), &items).is_err());
    }

    #[test]
    fn test_requests_share_label_set() {
        let set = sentiment();
        let requests = build_requests_from_texts(Arc::clone(&set), &["a", "b"]).unwrap();
        assert!(Arc::ptr_eq(&requests[0].label_set, &set));
        assert!(Arc::ptr_eq(&requests[1].label_set, &set));
    }
}

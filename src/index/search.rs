use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::storage::models::IndexedImage;

const MIN_TERM_LEN: usize = 2;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "been", "but", "by", "for", "from", "has", "have",
    "in", "into", "is", "it", "its", "of", "on", "or", "that", "the", "this", "to", "was", "were",
    "will", "with",
];

/// Lowercases, splits on anything that is not a letter or digit, and drops
/// stop words and one-character tokens. Used for both indexing and queries.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|t| t.chars().count() >= MIN_TERM_LEN && !STOP_WORDS.contains(&t.as_str()))
        .collect()
}

/// Every searchable term of an image: file name (without extension), tags,
/// notes and OCR text.
pub fn terms_for(image: &IndexedImage) -> BTreeSet<String> {
    let stem = image
        .file_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| image.file_name.clone());

    let mut terms: BTreeSet<String> = tokenize(&stem).into_iter().collect();
    for tag in &image.tags {
        terms.extend(tokenize(tag));
    }
    if let Some(notes) = &image.notes {
        terms.extend(tokenize(notes));
    }
    if let Some(ocr) = &image.ocr_text {
        terms.extend(tokenize(ocr));
    }
    terms
}

/// term -> ids, plus the reverse map so an image's old terms can be dropped
/// before it is re-indexed.
#[derive(Debug, Default, Clone)]
pub struct InvertedIndex {
    postings: HashMap<String, BTreeSet<String>>,
    terms_by_id: HashMap<String, BTreeSet<String>>,
}

impl InvertedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces whatever was indexed for `id` with `terms`.
    pub fn insert(&mut self, id: &str, terms: BTreeSet<String>) {
        self.remove(id);
        for term in &terms {
            self.postings
                .entry(term.clone())
                .or_default()
                .insert(id.to_string());
        }
        if !terms.is_empty() {
            self.terms_by_id.insert(id.to_string(), terms);
        }
    }

    pub fn remove(&mut self, id: &str) {
        let Some(terms) = self.terms_by_id.remove(id) else {
            return;
        };
        for term in terms {
            if let Some(ids) = self.postings.get_mut(&term) {
                ids.remove(id);
                if ids.is_empty() {
                    self.postings.remove(&term);
                }
            }
        }
    }

    #[cfg(test)]
    fn lookup(&self, term: &str) -> Option<&BTreeSet<String>> {
        self.postings.get(term)
    }

    /// Number of distinct query terms each image matches.
    pub fn score(&self, query_terms: &BTreeSet<String>) -> HashMap<String, usize> {
        let mut scores: HashMap<String, usize> = HashMap::new();
        for term in query_terms {
            if let Some(ids) = self.postings.get(term) {
                for id in ids {
                    *scores.entry(id.clone()).or_default() += 1;
                }
            }
        }
        scores
    }

    pub fn term_count(&self) -> usize {
        self.postings.len()
    }

    pub fn clear(&mut self) {
        self.postings.clear();
        self.terms_by_id.clear();
    }

    pub fn to_persisted(&self) -> BTreeMap<String, Vec<String>> {
        self.postings
            .iter()
            .map(|(term, ids)| (term.clone(), ids.iter().cloned().collect()))
            .collect()
    }

    pub fn from_persisted(map: BTreeMap<String, Vec<String>>) -> Self {
        let mut index = Self::new();
        for (term, ids) in map {
            for id in ids {
                index
                    .terms_by_id
                    .entry(id.clone())
                    .or_default()
                    .insert(term.clone());
                index.postings.entry(term.clone()).or_default().insert(id);
            }
        }
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn image(name: &str, tags: &[&str], notes: Option<&str>, ocr: Option<&str>) -> IndexedImage {
        let now = Utc::now();
        IndexedImage {
            id: name.to_string(),
            file_path: PathBuf::from(format!("/shots/{name}")),
            file_name: name.to_string(),
            timestamp: now,
            file_size: 1,
            dimensions: None,
            tags: set(tags),
            notes: notes.map(String::from),
            ocr_text: ocr.map(String::from),
            last_modified: now,
            last_indexed: now,
        }
    }

    #[test]
    fn test_tokenize_rules() {
        assert_eq!(
            tokenize("The Login-Page of MyApp, v2 x"),
            vec!["login", "page", "myapp", "v2"]
        );
        assert!(tokenize("a I to").is_empty());
    }

    #[test]
    fn test_terms_for_uses_all_sources() {
        let img = image(
            "Screenshot 2024-01-05 error.png",
            &["Bug Report"],
            Some("crash in checkout"),
            Some("NullPointerException"),
        );
        let terms = terms_for(&img);
        for t in ["screenshot", "2024", "01", "05", "error", "bug", "report", "crash", "checkout", "nullpointerexception"] {
            assert!(terms.contains(t), "missing {t}");
        }
        assert!(!terms.contains("png"));
        assert!(!terms.contains("in"));
    }

    #[test]
    fn test_insert_replaces_previous_terms() {
        let mut index = InvertedIndex::new();
        index.insert("a", set(&["alpha", "beta"]));
        index.insert("a", set(&["beta", "gamma"]));
        assert!(index.lookup("alpha").is_none());
        assert_eq!(index.lookup("gamma"), Some(&set(&["a"])));
        assert_eq!(index.term_count(), 2);
    }

    #[test]
    fn test_remove_drops_empty_postings() {
        let mut index = InvertedIndex::new();
        index.insert("a", set(&["shared", "only"]));
        index.insert("b", set(&["shared"]));
        index.remove("a");
        assert!(index.lookup("only").is_none());
        assert_eq!(index.lookup("shared"), Some(&set(&["b"])));
    }

    #[test]
    fn test_score_counts_matched_terms() {
        let mut index = InvertedIndex::new();
        index.insert("a", set(&["bug", "login"]));
        index.insert("b", set(&["bug"]));
        let scores = index.score(&set(&["bug", "login", "missing"]));
        assert_eq!(scores.get("a"), Some(&2));
        assert_eq!(scores.get("b"), Some(&1));
    }

    #[test]
    fn test_persisted_form_round_trips_reverse_map() {
        let mut index = InvertedIndex::new();
        index.insert("a", set(&["bug", "login"]));
        index.insert("b", set(&["bug"]));
        let mut restored = InvertedIndex::from_persisted(index.to_persisted());
        assert_eq!(restored.to_persisted(), index.to_persisted());
        restored.remove("a");
        assert!(restored.lookup("login").is_none());
        assert_eq!(restored.lookup("bug"), Some(&set(&["b"])));
    }
}

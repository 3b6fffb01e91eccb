//! Deterministic keyword inference for classification fields.
//!
//! Migrations that fill in a missing `category` or `topic` do not call the
//! enrichment service. They match free text against this fixed table, so
//! the same input always yields the same label.

/// Label used when no keyword matches.
pub const DEFAULT_CATEGORY: &str = "general";

/// Category → keywords, in priority order. Matching is case-insensitive
/// substring search; the category with the most distinct keyword hits
/// wins and ties go to the earlier row.
pub const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "programming",
        &[
            "programming",
            "software",
            "rust",
            "python",
            "javascript",
            "typescript",
            "algorithm",
            "compiler",
            "database",
        ],
    ),
    (
        "mathematics",
        &[
            "mathematics",
            "algebra",
            "calculus",
            "geometry",
            "statistics",
            "equation",
            "probability",
            "arithmetic",
        ],
    ),
    (
        "science",
        &[
            "physics",
            "chemistry",
            "biology",
            "science",
            "astronomy",
            "molecule",
            "ecosystem",
        ],
    ),
    (
        "language",
        &[
            "grammar",
            "vocabulary",
            "english",
            "spanish",
            "french",
            "german",
            "pronunciation",
        ],
    ),
    (
        "history",
        &[
            "history",
            "historical",
            "empire",
            "revolution",
            "ancient",
            "medieval",
            "dynasty",
        ],
    ),
    (
        "business",
        &[
            "business",
            "marketing",
            "finance",
            "economics",
            "accounting",
            "entrepreneur",
        ],
    ),
    (
        "arts",
        &["painting", "music", "drawing", "sculpture", "photography", "literature"],
    ),
];

/// Pick a category for `text` from [`CATEGORY_KEYWORDS`].
pub fn infer_category(text: &str) -> &'static str {
    let haystack = text.to_lowercase();
    let mut best: Option<(&'static str, usize)> = None;

    for (category, keywords) in CATEGORY_KEYWORDS {
        let hits = keywords.iter().filter(|k| haystack.contains(*k)).count();
        if hits == 0 {
            continue;
        }
        match best {
            Some((_, best_hits)) if best_hits >= hits => {}
            _ => best = Some((category, hits)),
        }
    }

    best.map(|(c, _)| c).unwrap_or(DEFAULT_CATEGORY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_keywords_case_insensitively() {
        assert_eq!(infer_category("Intro to RUST Programming"), "programming");
        assert_eq!(infer_category("Linear Algebra basics"), "mathematics");
    }

    #[test]
    fn most_hits_win() {
        // one programming hit, two mathematics hits
        assert_eq!(
            infer_category("statistics and probability with python"),
            "mathematics"
        );
    }

    #[test]
    fn ties_go_to_earlier_row() {
        assert_eq!(infer_category("python and physics"), "programming");
    }

    #[test]
    fn falls_back_to_default() {
        assert_eq!(infer_category("Welcome to the course"), DEFAULT_CATEGORY);
        assert_eq!(infer_category(""), DEFAULT_CATEGORY);
    }
}

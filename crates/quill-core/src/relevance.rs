//! Keyword-alias file discovery for auto-loading context

use tracing::debug;

use crate::context::extract_date;

/// A known source: names a user might type, and the folder it lives in
struct SourceAlias {
    keywords: &'static [&'static str],
    prefix: &'static str,
}

static ALIASES: &[SourceAlias] = &[
    SourceAlias {
        keywords: &["ethan", "mollick", "one useful thing"],
        prefix: "research/newsletters/ethan",
    },
    SourceAlias {
        keywords: &["simon", "willison"],
        prefix: "research/newsletters/simon",
    },
    SourceAlias {
        keywords: &["stratechery", "ben thompson"],
        prefix: "research/newsletters/stratechery",
    },
    SourceAlias {
        keywords: &["lenny", "rachitsky"],
        prefix: "research/newsletters/lenny",
    },
    SourceAlias {
        keywords: &["latent space", "swyx"],
        prefix: "research/podcasts/latent-space",
    },
    SourceAlias {
        keywords: &["dwarkesh"],
        prefix: "research/podcasts/dwarkesh",
    },
    SourceAlias {
        keywords: &["lex fridman", "lex"],
        prefix: "research/podcasts/lex-fridman",
    },
    SourceAlias {
        keywords: &["karpathy", "andrej"],
        prefix: "research/youtube/karpathy",
    },
];

const RECENCY_WORDS: &[&str] = &["recent", "recently", "latest", "newest", "most recent", "last"];

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Whether `phrase` occurs in `haystack` as whole consecutive words
fn contains_phrase(haystack: &[String], phrase: &str) -> bool {
    let needle = words(phrase);
    if needle.is_empty() || needle.len() > haystack.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|window| window == needle.as_slice())
}

fn under_prefix(path: &str, prefix: &str) -> bool {
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// Files under the folders of every source alias the query mentions.
///
/// Returns nothing when no alias matches. With recency language the
/// newest files come first; otherwise the best keyword matches do.
pub fn find_relevant_files(query: &str, tree: &[String], limit: usize) -> Vec<String> {
    let query_words = words(query);
    let matched: Vec<&SourceAlias> = ALIASES
        .iter()
        .filter(|alias| alias.keywords.iter().any(|k| contains_phrase(&query_words, k)))
        .collect();
    if matched.is_empty() || limit == 0 {
        return Vec::new();
    }

    let recency = RECENCY_WORDS.iter().any(|w| contains_phrase(&query_words, w));

    let mut candidates: Vec<(&String, usize, u32)> = tree
        .iter()
        .filter(|path| matched.iter().any(|alias| under_prefix(path, alias.prefix)))
        .map(|path| {
            let path_words = words(path);
            let score = matched
                .iter()
                .flat_map(|alias| alias.keywords.iter())
                .filter(|k| contains_phrase(&path_words, k))
                .count();
            (path, score, extract_date(path))
        })
        .collect();

    if recency {
        candidates.sort_by(|a, b| b.2.cmp(&a.2).then(b.1.cmp(&a.1)));
    } else {
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then(b.2.cmp(&a.2)));
    }

    debug!(
        "Relevance: {} aliases matched, {} candidates (recency: {})",
        matched.len(),
        candidates.len(),
        recency
    );

    candidates
        .into_iter()
        .take(limit)
        .map(|(path, _, _)| path.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Vec<String> {
        let mut paths: Vec<String> = (1..=7)
            .map(|day| format!("research/newsletters/ethan/2025010{}-issue.md", day))
            .collect();
        paths.extend(
            [
                "research/newsletters/ethan/20240601-mollick-on-agents.md",
                "research/newsletters/ethanol/20250301-fuel.md",
                "research/newsletters/simon/20250309-llm-cli.md",
                "research/podcasts/lex-fridman/20250201-episode.md",
                "inbox.md",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        paths
    }

    #[test]
    fn test_recent_ethan_sorted_by_date() {
        let result = find_relevant_files("What's new from Ethan recently?", &tree(), 5);
        assert_eq!(
            result,
            vec![
                "research/newsletters/ethan/20250107-issue.md",
                "research/newsletters/ethan/20250106-issue.md",
                "research/newsletters/ethan/20250105-issue.md",
                "research/newsletters/ethan/20250104-issue.md",
                "research/newsletters/ethan/20250103-issue.md",
            ]
        );
    }

    #[test]
    fn test_score_first_without_recency() {
        let result = find_relevant_files("What does Mollick think about agents?", &tree(), 2);
        assert_eq!(
            result,
            vec![
                "research/newsletters/ethan/20240601-mollick-on-agents.md",
                "research/newsletters/ethan/20250107-issue.md",
            ]
        );
    }

    #[test]
    fn test_no_alias_returns_empty() {
        assert!(find_relevant_files("Summarise my inbox", &tree(), 5).is_empty());
        // "lex" must be a whole word
        assert!(find_relevant_files("a complex question", &tree(), 5).is_empty());
    }

    #[test]
    fn test_multiple_aliases_and_limit() {
        let result = find_relevant_files("latest from Simon and Lex Fridman", &tree(), 10);
        assert_eq!(
            result,
            vec![
                "research/newsletters/simon/20250309-llm-cli.md",
                "research/podcasts/lex-fridman/20250201-episode.md",
            ]
        );
        assert!(find_relevant_files("latest from Simon", &tree(), 0).is_empty());
    }
}

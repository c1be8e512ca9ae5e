//! System prompt assembly: preamble, loaded files, directory listing, tools

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::LazyLock;

use regex::Regex;

use crate::files::LoadedFile;
use crate::providers::types::ToolOptions;

const EXAMPLES_PER_FOLDER: usize = 3;

const PREAMBLE: &str = "You are a research assistant working inside the user's personal notes \
repository. The repository holds captured articles, newsletters, transcripts and the user's own \
notes, organised into folders by source. Filenames usually start with the capture date as \
YYYYMMDD.\n\nAnswer from the loaded files when they are relevant and say which file you used. \
If the answer is likely in a file that is listed but not loaded, load it before answering \
rather than guessing.";

static DATE_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?:^|\D)(\d{8})(?:\D|$)").ok());

/// Date embedded in a filename as `YYYYMMDD`; files without one sort as 0
pub fn extract_date(path: &str) -> u32 {
    let name = path.rsplit('/').next().unwrap_or(path);
    DATE_PATTERN
        .as_ref()
        .and_then(|re| re.captures(name))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// Folder portion of a path; top-level files belong to `""`
pub fn folder_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Files grouped by folder with counts and the most recent examples
pub fn directory_listing(tree: &[String]) -> String {
    let mut folders: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for path in tree {
        folders.entry(folder_of(path)).or_default().push(path);
    }

    let mut out = String::new();
    for (folder, mut files) in folders {
        files.sort_by(|a, b| extract_date(b).cmp(&extract_date(a)));
        let examples: Vec<&str> = files
            .iter()
            .take(EXAMPLES_PER_FOLDER)
            .map(|p| p.rsplit('/').next().unwrap_or(*p))
            .collect();
        let label = if folder.is_empty() { "(root)" } else { folder };
        let noun = if files.len() == 1 { "file" } else { "files" };
        let _ = writeln!(
            out,
            "- {}/ ({} {}) e.g. {}",
            label,
            files.len(),
            noun,
            examples.join(", ")
        );
    }
    out
}

fn tools_section(tools: &ToolOptions, can_load_files: bool) -> Option<String> {
    let mut lines = Vec::new();
    if can_load_files {
        lines.push(
            "- load_file: load any file from the directory listing by its full path.".to_string(),
        );
    }
    if tools.enable_web_search {
        lines.push("- web_search: search the web for current information.".to_string());
    }
    if tools.enable_web_fetch {
        lines.push("- web_fetch: fetch the contents of a URL the user mentions.".to_string());
    }
    if tools.enable_code_execution {
        lines.push("- code_execution: run Python code for calculations or analysis.".to_string());
    }
    if lines.is_empty() {
        return None;
    }
    Some(format!("## Tools\n\nYou can use these tools:\n{}", lines.join("\n")))
}

/// Assemble the system prompt for one turn.
///
/// Only capabilities that are actually enabled are described.
pub fn build_system_prompt(
    loaded: &[LoadedFile],
    tree: &[String],
    tools: &ToolOptions,
    can_load_files: bool,
) -> String {
    let mut sections = vec![PREAMBLE.to_string()];

    if !loaded.is_empty() {
        let mut section = String::from("## Loaded files\n");
        for file in loaded {
            let _ = write!(section, "\n### {}\n\n{}\n", file.path, file.content.trim_end());
        }
        sections.push(section);
    }

    if !tree.is_empty() {
        sections.push(format!(
            "## Repository structure ({} files)\n\n{}",
            tree.len(),
            directory_listing(tree).trim_end()
        ));
    }

    if let Some(section) = tools_section(tools, can_load_files) {
        sections.push(section);
    }

    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Vec<String> {
        [
            "research/newsletters/ethan/20240105-old.md",
            "research/newsletters/ethan/20250310-newest.md",
            "research/newsletters/ethan/undated.md",
            "research/newsletters/ethan/20250101-new.md",
            "inbox.md",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    #[test]
    fn test_extract_date() {
        assert_eq!(extract_date("notes/20250310-topic.md"), 20250310);
        assert_eq!(extract_date("notes/topic-20250310.md"), 20250310);
        assert_eq!(extract_date("notes/topic.md"), 0);
        // nine digits is not a date
        assert_eq!(extract_date("notes/123456789.md"), 0);
        // folder digits are ignored
        assert_eq!(extract_date("20250101/topic.md"), 0);
    }

    #[test]
    fn test_directory_listing_recent_examples() {
        let listing = directory_listing(&tree());
        assert!(listing.contains("- (root)/ (1 file) e.g. inbox.md"));
        assert!(listing.contains(
            "- research/newsletters/ethan/ (4 files) e.g. 20250310-newest.md, 20250101-new.md, 20240105-old.md"
        ));
        assert!(!listing.contains("undated.md"));
    }

    #[test]
    fn test_prompt_includes_loaded_files_and_enabled_tools_only() {
        let loaded = vec![LoadedFile::new("inbox.md", "buy milk")];
        let tools = ToolOptions {
            enable_web_search: true,
            ..Default::default()
        };
        let prompt = build_system_prompt(&loaded, &tree(), &tools, true);

        assert!(prompt.starts_with(PREAMBLE));
        assert!(prompt.contains("### inbox.md\n\nbuy milk"));
        assert!(prompt.contains("## Repository structure (5 files)"));
        assert!(prompt.contains("web_search"));
        assert!(prompt.contains("load_file"));
        assert!(!prompt.contains("code_execution"));
        assert!(!prompt.contains("web_fetch"));
    }

    #[test]
    fn test_prompt_without_context_or_tools() {
        let prompt = build_system_prompt(&[], &[], &ToolOptions::default(), false);
        assert_eq!(prompt, PREAMBLE);
    }
}

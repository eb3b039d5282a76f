use grep::matcher::Matcher;
use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding the crate's own sources.
const SOURCE_DIRS: [&str; 9] = [
    "src", "shared", "calibrate", "map", "mrp", "frame", "cli", "tests", "benches",
];

// Library modules report through the `log` facade; only the binary prints.
const LIBRARY_DIRS: [&str; 6] = ["src", "shared", "calibrate", "map", "mrp", "frame"];

const CHANGELOG_WORDS: &str =
    "FIXED|CORRECTED|FIXES|FIX|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE";

/// Which part of a matched line a rule cares about.
#[derive(Clone, Copy)]
enum Scope {
    /// Code outside comments and string literals.
    Code,
    /// Any comment, doc comments included.
    Comment,
    /// Plain `//` and `/* */` comments, not `///` or `//!`.
    PlainComment,
    /// Comments whose letters are all uppercase.
    ShoutedComment,
}

struct Rule {
    name: &'static str,
    pattern: String,
    scope: Scope,
    dirs: &'static [&'static str],
    advice: &'static str,
}

fn rules() -> Vec<Rule> {
    vec![
        Rule {
            name: "underscore-prefixed bindings",
            pattern: r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            scope: Scope::Code,
            dirs: &SOURCE_DIRS,
            advice: "Use the binding or remove it; underscore prefixes hide unused values.",
        },
        Rule {
            name: "#[allow(dead_code)] attributes",
            pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
            scope: Scope::Code,
            dirs: &SOURCE_DIRS,
            advice: "Call the item or delete it.",
        },
        Rule {
            name: "print macros in library code",
            pattern: r"\b(e?print(ln)?!)".to_string(),
            scope: Scope::Code,
            dirs: &LIBRARY_DIRS,
            advice: "Report through log::info!/warn!/debug! and leave stdout to the irrimap binary.",
        },
        Rule {
            name: "change-log comments",
            pattern: format!(r"(//|/\*).*\b({CHANGELOG_WORDS})\b"),
            scope: Scope::Comment,
            dirs: &SOURCE_DIRS,
            advice: "Comments describe the code as it is; history belongs in version control.",
        },
        Rule {
            name: "'**' in plain comments",
            pattern: r"(//|/\*).*\*\*".to_string(),
            scope: Scope::PlainComment,
            dirs: &SOURCE_DIRS,
            advice: "Emphasis markup is only rendered in doc comments.",
        },
        Rule {
            name: "all-uppercase comments",
            pattern: r"(//|/\*).*".to_string(),
            scope: Scope::ShoutedComment,
            dirs: &SOURCE_DIRS,
            advice: "Write the comment in sentence case, or delete it.",
        },
    ]
}

/// Collects the lines of one file that violate a rule.
struct LineCollector<'r> {
    scope: Scope,
    matcher: &'r RegexMatcher,
    violations: Vec<String>,
}

impl Sink for LineCollector<'_> {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if violates(self.scope, self.matcher, line) {
            let line_number = mat.line_number().unwrap_or(0);
            self.violations.push(format!("{line_number}:{line}"));
        }
        Ok(true)
    }
}

/// Splits a line into its code, with string literals blanked, and its comment.
fn split_line(line: &str) -> (String, Option<&str>) {
    let mut code = String::with_capacity(line.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut previous = None;
    for (at, c) in line.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
                code.push('"');
            }
            previous = Some(c);
            continue;
        }
        if previous == Some('/') && (c == '/' || c == '*') {
            code.pop();
            return (code, Some(&line[at - 1..]));
        }
        if c == '"' {
            in_string = true;
        }
        code.push(c);
        previous = Some(c);
    }
    (code, None)
}

/// Text of a comment without its opening marker.
fn comment_body(comment: &str) -> &str {
    let body = ["///", "//!", "//", "/*"]
        .iter()
        .find_map(|marker| comment.strip_prefix(marker))
        .unwrap_or(comment);
    body.split("*/").next().unwrap_or(body).trim()
}

fn is_match(matcher: &RegexMatcher, text: &str) -> bool {
    matcher.is_match(text.as_bytes()).unwrap_or(false)
}

fn violates(scope: Scope, matcher: &RegexMatcher, line: &str) -> bool {
    let (code, comment) = split_line(line);
    match (scope, comment) {
        (Scope::Code, _) => is_match(matcher, &code),
        (_, None) => false,
        (Scope::Comment, Some(comment)) => is_match(matcher, comment),
        (Scope::PlainComment, Some(comment)) => {
            !(comment.starts_with("///") || comment.starts_with("//!")) && is_match(matcher, comment)
        }
        (Scope::ShoutedComment, Some(comment)) => {
            let letters: Vec<char> = comment_body(comment).chars().filter(|c| c.is_alphabetic()).collect();
            !letters.is_empty() && letters.iter().all(|c| c.is_uppercase())
        }
    }
}

fn rust_sources(dirs: &[&str]) -> Vec<PathBuf> {
    dirs.iter()
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect()
}

/// Runs one rule over its directories and returns a report of every hit.
fn check(rule: &Rule) -> Result<Option<String>, Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(&rule.pattern)?;
    let mut searcher = Searcher::new();
    let mut report = String::new();
    let mut total = 0;
    for path in rust_sources(rule.dirs) {
        let mut collector = LineCollector {
            scope: rule.scope,
            matcher: &matcher,
            violations: Vec::new(),
        };
        searcher.search_path(&matcher, &path, &mut collector)?;
        if collector.violations.is_empty() {
            continue;
        }
        total += collector.violations.len();
        report.push_str(&format!("  {}\n", display(&path)));
        for violation in &collector.violations {
            report.push_str(&format!("    {violation}\n"));
        }
    }
    Ok((total > 0).then(|| {
        format!(
            "\n❌ ERROR: Found {total} {}:\n{report}\n⚠️ {}\n",
            rule.name, rule.advice
        )
    }))
}

fn display(path: &Path) -> &str {
    path.to_str().unwrap_or("?")
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    let mut failed = false;
    for rule in rules() {
        match check(&rule) {
            Ok(None) => {}
            Ok(Some(report)) => {
                eprintln!("{report}");
                failed = true;
            }
            Err(e) => {
                eprintln!("Source check '{}' could not run: {e}", rule.name);
                failed = true;
            }
        }
    }
    if failed {
        std::process::exit(1);
    }
}

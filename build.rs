use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Only this crate's own sources are policed; vendored or reference trees are not.
const SOURCE_DIRS: [&str; 4] = ["graphnet", "cli", "tests", "benches"];

// Collects every matching line of one file for a single rule.
struct ViolationCollector {
    violations: Vec<String>,
    file_path: PathBuf,
    skip_comments: bool,
}

impl ViolationCollector {
    fn new(file_path: &Path, skip_comments: bool) -> Self {
        Self {
            violations: Vec::new(),
            file_path: file_path.to_path_buf(),
            skip_comments,
        }
    }

    fn error_message(&self, rule: &Rule) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }
        let mut msg = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            rule.description,
            self.file_path.display()
        );
        for violation in &self.violations {
            msg.push_str(&format!("   {violation}\n"));
        }
        msg.push_str(&format!("\n⚠️ {}\n", rule.advice));
        Some(msg)
    }
}

impl Sink for ViolationCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();

        if self.skip_comments {
            let trimmed = line_text.trim_start();
            if trimmed.starts_with("//") || trimmed.starts_with('*') {
                return Ok(true);
            }
            // Identifiers inside string literals are not bindings.
            let outside_strings: String = line_text
                .split('"')
                .enumerate()
                .filter(|(i, _)| i % 2 == 0)
                .map(|(_, part)| part)
                .collect();
            if !outside_strings.contains('_') {
                return Ok(true);
            }
        }

        self.violations.push(format!("{line_number}:{line_text}"));
        Ok(true)
    }
}

struct Rule {
    pattern: &'static str,
    description: &'static str,
    advice: &'static str,
    skip_comments: bool,
}

const RULES: [Rule; 2] = [
    Rule {
        pattern: r"(^|[^A-Za-z0-9_])(_[a-zA-Z0-9_]+)\b",
        description: "underscore-prefixed bindings",
        advice: "Underscore-prefixed names are not allowed. Use the value or remove it.",
        skip_comments: true,
    },
    Rule {
        pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        description: "#[allow(dead_code)] attributes",
        advice: "Dead code must be used or deleted, never silenced.",
        skip_comments: false,
    },
];

fn rust_sources() -> impl Iterator<Item = PathBuf> {
    SOURCE_DIRS.into_iter().flat_map(|dir| {
        WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
            .map(|e| e.into_path())
    })
}

fn scan(rule: &Rule) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(rule.pattern)?;
    let mut searcher = Searcher::new();
    for path in rust_sources() {
        let mut collector = ViolationCollector::new(&path, rule.skip_comments);
        searcher.search_path(&matcher, &path, &mut collector)?;
        if let Some(msg) = collector.error_message(rule) {
            return Err(msg.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    for rule in &RULES {
        if let Err(e) = scan(rule) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

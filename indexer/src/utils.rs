use std::path::Path;

use anyhow::Result;
use tracing::warn;
use tracing_subscriber::{EnvFilter, fmt};

pub fn init_tracing(verbosity: u8) -> Result<()> {
    let default_directive = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let subscriber = fmt().with_env_filter(filter).with_target(true).finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        warn!("tracing subscriber already initialized");
    }

    Ok(())
}

/// Language name used by line statistics, keyed by file extension.
pub fn language_of(path: &str) -> Option<&'static str> {
    match Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|s| s.to_ascii_lowercase())
    {
        Some(ref ext) if ext == "rs" => Some("Rust"),
        Some(ref ext) if matches!(ext.as_str(), "ts" | "tsx") => Some("TypeScript"),
        Some(ref ext) if matches!(ext.as_str(), "js" | "jsx" | "mjs" | "cjs") => Some("JavaScript"),
        Some(ref ext) if ext == "py" => Some("Python"),
        Some(ref ext) if ext == "go" => Some("Go"),
        Some(ref ext) if ext == "java" => Some("Java"),
        Some(ref ext) if matches!(ext.as_str(), "kt" | "kts") => Some("Kotlin"),
        Some(ref ext) if ext == "scala" => Some("Scala"),
        Some(ref ext) if ext == "groovy" => Some("Groovy"),
        Some(ref ext) if ext == "c" => Some("C"),
        Some(ref ext) if matches!(ext.as_str(), "m" | "mm") => Some("Objective-C"),
        Some(ref ext)
            if matches!(
                ext.as_str(),
                "cc" | "inl" | "cpp" | "cxx" | "hpp" | "hh" | "h"
            ) =>
        {
            Some("C++")
        }
        Some(ref ext) if ext == "cs" => Some("C#"),
        Some(ref ext) if ext == "rb" => Some("Ruby"),
        Some(ref ext) if ext == "php" => Some("PHP"),
        Some(ref ext) if ext == "swift" => Some("Swift"),
        Some(ref ext) if ext == "lua" => Some("Lua"),
        Some(ref ext) if matches!(ext.as_str(), "sh" | "bash" | "zsh") => Some("Shell"),
        Some(ref ext) if ext == "sql" => Some("SQL"),
        Some(ref ext) if matches!(ext.as_str(), "html" | "htm") => Some("HTML"),
        Some(ref ext) if matches!(ext.as_str(), "css" | "scss" | "less") => Some("CSS"),
        Some(ref ext) if matches!(ext.as_str(), "md" | "markdown") => Some("Markdown"),
        Some(ref ext) if matches!(ext.as_str(), "txt" | "text") => Some("Text"),
        Some(ref ext) if ext == "xml" => Some("XML"),
        Some(ref ext) if matches!(ext.as_str(), "yml" | "yaml") => Some("YAML"),
        Some(ref ext) if ext == "json" => Some("JSON"),
        Some(ref ext) if ext == "toml" => Some("TOML"),
        Some(ref ext) if ext == "nix" => Some("Nix"),
        Some(ref ext) if ext == "proto" => Some("Protocol Buffers"),
        _ => None,
    }
}

/// The path followed by each of its parent directories, ending with the root `""`.
pub fn path_and_parents(path: &str) -> Vec<&str> {
    let mut chain = vec![path];
    let mut current = path;
    while let Some(idx) = current.rfind('/') {
        current = &current[..idx];
        chain.push(current);
    }
    if !path.is_empty() {
        chain.push("");
    }
    chain
}

/// Orders paths one `/`-segment at a time, so `a/b` sorts before `a.txt`.
pub fn compare_path_segments(a: &str, b: &str) -> std::cmp::Ordering {
    a.split('/').cmp(b.split('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_languages_by_extension() {
        assert_eq!(language_of("src/main.rs"), Some("Rust"));
        assert_eq!(language_of("web/App.TSX"), Some("TypeScript"));
        assert_eq!(language_of("notes.txt"), Some("Text"));
        assert_eq!(language_of("Makefile"), None);
    }

    #[test]
    fn path_chain_ends_at_root() {
        assert_eq!(path_and_parents("a/b/c.rs"), vec!["a/b/c.rs", "a/b", "a", ""]);
        assert_eq!(path_and_parents("top.rs"), vec!["top.rs", ""]);
        assert_eq!(path_and_parents(""), vec![""]);
    }

    #[test]
    fn segment_order_differs_from_byte_order() {
        let mut files = vec!["a.txt", "a/b", "a/a/z"];
        files.sort_by(|a, b| compare_path_segments(a, b));
        assert_eq!(files, vec!["a/a/z", "a/b", "a.txt"]);
    }
}

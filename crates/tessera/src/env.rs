use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;

static TESSERA_PASS_STATS: OnceLock<bool> = OnceLock::new();
static TESSERA_CANONICALIZE_ITERS: OnceLock<usize> = OnceLock::new();
static TESSERA_DEBUG_DIR: OnceLock<PathBuf> = OnceLock::new();
static TESSERA_THREADPOOL_SIZE: OnceLock<usize> = OnceLock::new();

const DEFAULT_CANONICALIZE_ITERS: usize = 4;
const DEFAULT_THREADPOOL_SIZE: usize = 1;

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn parse_usize(name: &str, default: usize) -> usize {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<usize>()
            .ok()
            .filter(|v| *v > 0)
            .unwrap_or(default),
        Err(_) => default,
    }
}

pub(crate) fn pass_stats_enabled() -> bool {
    *TESSERA_PASS_STATS.get_or_init(|| match env::var("TESSERA_PASS_STATS") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

pub(crate) fn canonicalize_iters() -> usize {
    *TESSERA_CANONICALIZE_ITERS
        .get_or_init(|| parse_usize("TESSERA_CANONICALIZE_ITERS", DEFAULT_CANONICALIZE_ITERS))
}

/// Directory that receives Debug layer dumps when `to_file` is set.
pub fn debug_dir() -> PathBuf {
    TESSERA_DEBUG_DIR
        .get_or_init(|| match env::var("TESSERA_DEBUG_DIR") {
            Ok(value) if !value.trim().is_empty() => PathBuf::from(value.trim()),
            _ => env::temp_dir().join("tessera-debug"),
        })
        .clone()
}

pub(crate) fn default_threadpool_size() -> usize {
    *TESSERA_THREADPOOL_SIZE
        .get_or_init(|| parse_usize("TESSERA_THREADPOOL_SIZE", DEFAULT_THREADPOOL_SIZE))
}

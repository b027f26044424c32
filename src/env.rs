use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;

static CACHE_DISABLE: OnceLock<bool> = OnceLock::new();
static DUMP_DIR: OnceLock<Option<PathBuf>> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// `TILEFUSE_PROGRAM_CACHE_DISABLE`: rebuild and recompile on every call
/// instead of reusing cached programs.
pub(crate) fn program_cache_disabled() -> bool {
    *CACHE_DISABLE.get_or_init(|| match env::var("TILEFUSE_PROGRAM_CACHE_DISABLE") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

/// `TILEFUSE_DUMP_DIR`: directory where each generated program's source is
/// written as `<program name>.cl`.
pub(crate) fn dump_dir() -> Option<&'static PathBuf> {
    DUMP_DIR
        .get_or_init(|| match env::var("TILEFUSE_DUMP_DIR") {
            Ok(value) if !value.trim().is_empty() => Some(PathBuf::from(value.trim())),
            _ => None,
        })
        .as_ref()
}

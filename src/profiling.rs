//! Lightweight instrumentation, compiled to no-ops without the `profiler`
//! feature.
//!
//! Scopes time program builds and kernel submissions with exclusive time
//! (child scopes subtracted); cache events count hits and misses. Everything
//! funnels into one process-wide table that [`take_tables`] drains.

use std::collections::HashMap;
#[cfg(feature = "profiler")]
use std::cell::RefCell;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
#[cfg(feature = "profiler")]
use std::time::Instant;

#[cfg(feature = "profiler")]
use serde::Serialize;

#[cfg_attr(not(feature = "profiler"), allow(dead_code))]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum ProfilerKey {
    Compile { name: &'static str },
    Launch { name: &'static str },
    Cache { name: &'static str },
}

#[cfg_attr(not(feature = "profiler"), allow(dead_code))]
#[derive(Default, Clone)]
struct Stat {
    calls: u64,
    exclusive_ns: u128,
    inclusive_ns: u128,
}

#[cfg_attr(not(feature = "profiler"), allow(dead_code))]
struct Profiler {
    stats: Mutex<HashMap<ProfilerKey, Stat>>,
}

impl Profiler {
    #[inline]
    #[cfg_attr(not(feature = "profiler"), allow(dead_code))]
    fn instance() -> &'static Self {
        static INSTANCE: OnceLock<Profiler> = OnceLock::new();
        INSTANCE.get_or_init(|| Profiler {
            stats: Mutex::new(HashMap::new()),
        })
    }

    #[inline]
    #[cfg_attr(not(feature = "profiler"), allow(dead_code))]
    fn record(&self, key: ProfilerKey, exclusive: Duration, inclusive: Duration) {
        #[cfg(feature = "profiler")]
        {
            let mut stats = self.stats.lock().expect("profiler mutex poisoned");
            let entry = stats.entry(key).or_default();
            entry.calls = entry.calls.saturating_add(1);
            entry.exclusive_ns = entry.exclusive_ns.saturating_add(exclusive.as_nanos());
            entry.inclusive_ns = entry.inclusive_ns.saturating_add(inclusive.as_nanos());
        }
        #[cfg(not(feature = "profiler"))]
        {
            let _ = key;
            let _ = exclusive;
            let _ = inclusive;
        }
    }

    #[cfg(feature = "profiler")]
    fn take_stats(&self) -> HashMap<ProfilerKey, Stat> {
        let mut stats = self.stats.lock().expect("profiler mutex poisoned");
        std::mem::take(&mut *stats)
    }
}

#[cfg(feature = "profiler")]
struct GuardFrame {
    key: ProfilerKey,
    start: Instant,
    child_time: Duration,
}

#[cfg(feature = "profiler")]
thread_local! {
    static ACTIVE_GUARDS: RefCell<Vec<GuardFrame>> = const { RefCell::new(Vec::new()) };
}

pub struct ScopeGuard {
    #[cfg(feature = "profiler")]
    key: Option<ProfilerKey>,
}

impl ScopeGuard {
    #[inline(always)]
    fn new(key: ProfilerKey) -> Self {
        #[cfg(feature = "profiler")]
        {
            ACTIVE_GUARDS.with(|stack| {
                stack.borrow_mut().push(GuardFrame {
                    key,
                    start: Instant::now(),
                    child_time: Duration::ZERO,
                });
            });
            ScopeGuard { key: Some(key) }
        }
        #[cfg(not(feature = "profiler"))]
        {
            let _ = key;
            ScopeGuard {}
        }
    }
}

#[cfg(feature = "profiler")]
impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let Some(expected) = self.key else {
            return;
        };
        ACTIVE_GUARDS.with(|stack| {
            let mut stack = stack.borrow_mut();
            let frame = stack.pop().expect("scope guard stack underflow");
            debug_assert!(frame.key == expected, "scope guard stack corrupted");

            let elapsed = frame.start.elapsed();
            let exclusive = elapsed.saturating_sub(frame.child_time);
            Profiler::instance().record(frame.key, exclusive, elapsed);

            if let Some(parent) = stack.last_mut() {
                parent.child_time = parent.child_time.saturating_add(elapsed);
            }
        });
    }
}

/// Times a program build or compile step.
#[inline(always)]
pub fn compile_scope(name: &'static str) -> ScopeGuard {
    ScopeGuard::new(ProfilerKey::Compile { name })
}

/// Times a kernel submission.
#[inline(always)]
pub fn launch_scope(name: &'static str) -> ScopeGuard {
    ScopeGuard::new(ProfilerKey::Launch { name })
}

/// Counts one cache event, such as a hit or a miss.
#[inline(always)]
pub fn cache_event(name: &'static str) {
    #[cfg(feature = "profiler")]
    {
        Profiler::instance().record(
            ProfilerKey::Cache { name },
            Duration::ZERO,
            Duration::ZERO,
        );
    }
    #[cfg(not(feature = "profiler"))]
    {
        let _ = name;
    }
}

#[cfg(feature = "profiler")]
#[derive(Debug, Clone, Serialize)]
pub struct TableRow {
    pub name: String,
    pub calls: u64,
    pub per_ms: f64,
    pub excl_ms: f64,
    pub incl_ms: f64,
    pub percent: f64,
}

#[cfg(not(feature = "profiler"))]
#[derive(Debug, Clone, Default)]
pub struct TableRow {
    _private: (),
}

#[cfg(feature = "profiler")]
#[derive(Debug, Default, Clone, Serialize)]
pub struct ProfilerTables {
    pub compilation: Vec<TableRow>,
    pub launches: Vec<TableRow>,
    pub caches: Vec<TableRow>,
}

#[cfg(not(feature = "profiler"))]
#[derive(Debug, Default, Clone)]
pub struct ProfilerTables {
    _private: (),
}

#[cfg(feature = "profiler")]
fn to_rows(items: Vec<(&'static str, Stat)>) -> Vec<TableRow> {
    let total_ns: f64 = items.iter().map(|(_, stat)| stat.exclusive_ns as f64).sum();
    let mut rows: Vec<TableRow> = items
        .into_iter()
        .map(|(name, stat)| {
            let excl_ms = stat.exclusive_ns as f64 / 1_000_000.0;
            let incl_ms = stat.inclusive_ns as f64 / 1_000_000.0;
            let per_ms = if stat.calls > 0 {
                excl_ms / stat.calls as f64
            } else {
                0.0
            };
            let percent = if total_ns > 0.0 {
                (stat.exclusive_ns as f64 / total_ns) * 100.0
            } else {
                0.0
            };
            TableRow {
                name: name.to_string(),
                calls: stat.calls,
                per_ms,
                excl_ms,
                incl_ms,
                percent,
            }
        })
        .collect();
    rows.sort_by(|a, b| {
        b.percent
            .partial_cmp(&a.percent)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.name.cmp(&b.name))
    });
    rows
}

#[cfg(feature = "profiler")]
fn to_cache_rows(items: Vec<(&'static str, Stat)>) -> Vec<TableRow> {
    let total_calls: f64 = items.iter().map(|(_, stat)| stat.calls as f64).sum();
    let mut rows: Vec<TableRow> = items
        .into_iter()
        .map(|(name, stat)| {
            let percent = if total_calls > 0.0 {
                (stat.calls as f64 / total_calls) * 100.0
            } else {
                0.0
            };
            TableRow {
                name: name.to_string(),
                calls: stat.calls,
                per_ms: 0.0,
                excl_ms: 0.0,
                incl_ms: 0.0,
                percent,
            }
        })
        .collect();
    rows.sort_by(|a, b| b.calls.cmp(&a.calls).then_with(|| a.name.cmp(&b.name)));
    rows
}

/// Drains the accumulated statistics into sorted tables. `None` while
/// nothing was recorded.
#[cfg(feature = "profiler")]
pub fn take_tables() -> Option<ProfilerTables> {
    let stats = Profiler::instance().take_stats();
    if stats.is_empty() {
        return None;
    }

    let mut compilation: Vec<(&'static str, Stat)> = Vec::new();
    let mut launches: Vec<(&'static str, Stat)> = Vec::new();
    let mut caches: Vec<(&'static str, Stat)> = Vec::new();
    for (key, stat) in stats {
        match key {
            ProfilerKey::Compile { name } => compilation.push((name, stat)),
            ProfilerKey::Launch { name } => launches.push((name, stat)),
            ProfilerKey::Cache { name } => caches.push((name, stat)),
        }
    }

    Some(ProfilerTables {
        compilation: to_rows(compilation),
        launches: to_rows(launches),
        caches: to_cache_rows(caches),
    })
}

#[cfg(not(feature = "profiler"))]
pub fn take_tables() -> Option<ProfilerTables> {
    None
}

#[cfg(feature = "profiler")]
pub fn take_tables_json() -> Option<String> {
    let tables = take_tables()?;
    serde_json::to_string(&tables).ok()
}

#[cfg(not(feature = "profiler"))]
pub fn take_tables_json() -> Option<String> {
    None
}

#[cfg(feature = "profiler")]
pub fn format_tables(tables: &ProfilerTables) -> String {
    fn format_table(label: &str, rows: &[TableRow]) -> String {
        let mut output = String::new();
        if rows.is_empty() {
            return output;
        }
        output.push_str(label);
        output.push('\n');
        let name_width = rows
            .iter()
            .map(|row| row.name.len())
            .max()
            .unwrap_or("name".len())
            .max("name".len());
        output.push_str(&format!(
            "| {name:<name_width$} | {calls:>8} | {per:>9} | {excl:>9} | {pct:>6} |\n",
            name = "name",
            calls = "#",
            per = "ms/call",
            excl = "self_ms",
            pct = "%",
        ));
        for row in rows {
            output.push_str(&format!(
                "| {name:<name_width$} | {calls:>8} | {per:>9.3} | {excl:>9.3} | {pct:>6.2} |\n",
                name = row.name,
                calls = row.calls,
                per = row.per_ms,
                excl = row.excl_ms,
                pct = row.percent,
            ));
        }
        output
    }

    let mut output = String::new();
    output.push_str(&format_table("Compilation", &tables.compilation));
    output.push_str(&format_table("Launches", &tables.launches));
    output.push_str(&format_table("Cache events", &tables.caches));
    output
}

#[cfg(all(test, feature = "profiler"))]
mod tests {
    use super::*;

    #[test]
    fn scopes_and_events_land_in_the_tables() {
        {
            let _outer = compile_scope("profiling_test.outer");
            let _inner = compile_scope("profiling_test.inner");
            std::thread::sleep(Duration::from_millis(2));
        }
        cache_event("profiling_test.hit");
        cache_event("profiling_test.hit");
        cache_event("profiling_test.miss");

        let tables = take_tables().expect("stats were recorded");
        let outer = tables
            .compilation
            .iter()
            .find(|row| row.name == "profiling_test.outer")
            .expect("outer scope recorded");
        let inner = tables
            .compilation
            .iter()
            .find(|row| row.name == "profiling_test.inner")
            .expect("inner scope recorded");
        assert_eq!(outer.calls, 1);
        assert_eq!(inner.calls, 1);
        // Exclusive outer time excludes the inner scope.
        assert!(outer.excl_ms <= outer.incl_ms);
        assert!(inner.incl_ms <= outer.incl_ms);

        let hits = tables
            .caches
            .iter()
            .find(|row| row.name == "profiling_test.hit")
            .expect("hit events recorded");
        assert_eq!(hits.calls, 2);

        let formatted = format_tables(&tables);
        assert!(formatted.contains("Cache events"));
        assert!(formatted.contains("profiling_test.hit"));
    }
}

use std::collections::HashMap;
use std::fmt;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use crate::error::{AnvilError, AnvilResult};

/// Accumulated time for one scope path or one operation name
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimingStats {
    pub calls: u64,
    pub total: Duration,
    pub max: Duration,
}

impl TimingStats {
    fn record(&mut self, elapsed: Duration) {
        self.calls += 1;
        self.total += elapsed;
        self.max = self.max.max(elapsed);
    }

    pub fn mean(&self) -> Duration {
        if self.calls == 0 {
            Duration::ZERO
        } else {
            self.total / self.calls as u32
        }
    }
}

/// A `pop_scope` that did not match the innermost open scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeMismatch {
    pub expected: Option<String>,
    pub popped: String,
}

#[derive(Debug, Clone)]
pub struct ProfileReport {
    pub duration: Duration,
    /// Keyed by the `/`-joined scope path, e.g. `forward/attention`
    pub scopes: HashMap<String, TimingStats>,
    pub ops: HashMap<String, TimingStats>,
    pub open_scopes: Vec<String>,
    pub mismatches: Vec<ScopeMismatch>,
}

impl ProfileReport {
    pub fn is_balanced(&self) -> bool {
        self.open_scopes.is_empty() && self.mismatches.is_empty()
    }

    pub fn scope(&self, path: &str) -> Option<&TimingStats> {
        self.scopes.get(path)
    }

    pub fn op(&self, name: &str) -> Option<&TimingStats> {
        self.ops.get(name)
    }
}

impl fmt::Display for ProfileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "profile over {:?}", self.duration)?;
        let mut scopes: Vec<_> = self.scopes.iter().collect();
        scopes.sort_by(|a, b| b.1.total.cmp(&a.1.total));
        for (path, stats) in scopes {
            writeln!(f, "  scope {:<32} calls={:<6} total={:?}", path, stats.calls, stats.total)?;
        }
        let mut ops: Vec<_> = self.ops.iter().collect();
        ops.sort_by(|a, b| b.1.total.cmp(&a.1.total));
        for (name, stats) in ops {
            writeln!(f, "  op    {:<32} calls={:<6} total={:?}", name, stats.calls, stats.total)?;
        }
        if !self.open_scopes.is_empty() {
            writeln!(f, "  unclosed scopes: {}", self.open_scopes.join("/"))?;
        }
        for m in &self.mismatches {
            writeln!(f, "  mismatched pop '{}' (innermost was {:?})", m.popped, m.expected)?;
        }
        Ok(())
    }
}

/// Scope stacks and timing tables owned by the worker.
///
/// Each submitting thread has its own scope stack, so threads that push and
/// pop in balance never disturb each other. An op is attributed to the
/// scopes open on the thread that submitted it. Stacks are maintained
/// whether or not a profile is running so that a profile started inside a
/// scope still attributes correctly.
#[derive(Debug, Default)]
pub struct Profiler {
    started_at: Option<Instant>,
    stacks: HashMap<ThreadId, Vec<String>>,
    scopes: HashMap<String, TimingStats>,
    ops: HashMap<String, TimingStats>,
    mismatches: Vec<ScopeMismatch>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn start(&mut self) -> AnvilResult<()> {
        if self.is_active() {
            return Err(AnvilError::ProfilingError("profile already started".to_string()));
        }
        self.scopes.clear();
        self.ops.clear();
        self.mismatches.clear();
        self.started_at = Some(Instant::now());
        Ok(())
    }

    pub fn stop(&mut self) -> AnvilResult<ProfileReport> {
        let started_at = self
            .started_at
            .take()
            .ok_or_else(|| AnvilError::ProfilingError("profile not started".to_string()))?;
        Ok(ProfileReport {
            duration: started_at.elapsed(),
            scopes: std::mem::take(&mut self.scopes),
            ops: std::mem::take(&mut self.ops),
            open_scopes: self.stacks.values().flatten().cloned().collect(),
            mismatches: std::mem::take(&mut self.mismatches),
        })
    }

    pub fn push_scope(&mut self, origin: ThreadId, name: String) {
        self.stacks.entry(origin).or_default().push(name);
    }

    pub fn pop_scope(&mut self, origin: ThreadId, name: &str) {
        let stack = self.stacks.entry(origin).or_default();
        match stack.last() {
            Some(top) if top == name => {
                stack.pop();
            }
            top => {
                let mismatch = ScopeMismatch {
                    expected: top.cloned(),
                    popped: name.to_string(),
                };
                tracing::warn!(popped = name, expected = ?mismatch.expected, "unbalanced pop_scope");
                // Unwind to the named scope if it is open further down.
                if let Some(pos) = stack.iter().rposition(|s| s == name) {
                    stack.truncate(pos);
                }
                self.mismatches.push(mismatch);
            }
        }
        if stack.is_empty() {
            self.stacks.remove(&origin);
        }
    }

    pub fn depth(&self, origin: ThreadId) -> usize {
        self.stacks.get(&origin).map_or(0, Vec::len)
    }

    /// Attribute `elapsed` to `op` and to every scope path open on `origin`
    pub fn record_op(&mut self, origin: ThreadId, op: &str, elapsed: Duration) {
        if !self.is_active() {
            return;
        }
        self.ops.entry(op.to_string()).or_default().record(elapsed);
        let Some(stack) = self.stacks.get(&origin) else {
            return;
        };
        let mut path = String::new();
        for scope in stack {
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(scope);
            self.scopes.entry(path.clone()).or_default().record(elapsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn other_thread() -> ThreadId {
        thread::spawn(|| thread::current().id()).join().unwrap()
    }

    #[test]
    fn test_nested_scopes_accumulate() {
        let me = thread::current().id();
        let mut profiler = Profiler::new();
        profiler.start().unwrap();
        profiler.push_scope(me, "forward".to_string());
        profiler.record_op(me, "add", Duration::from_millis(2));
        profiler.push_scope(me, "attention".to_string());
        profiler.record_op(me, "mul", Duration::from_millis(3));
        profiler.pop_scope(me, "attention");
        profiler.pop_scope(me, "forward");

        let report = profiler.stop().unwrap();
        assert!(report.is_balanced());
        assert_eq!(report.scope("forward").unwrap().total, Duration::from_millis(5));
        assert_eq!(report.scope("forward/attention").unwrap().calls, 1);
        assert_eq!(report.op("mul").unwrap().max, Duration::from_millis(3));
    }

    #[test]
    fn test_unbalanced_scopes_reported() {
        let me = thread::current().id();
        let mut profiler = Profiler::new();
        profiler.start().unwrap();
        profiler.push_scope(me, "outer".to_string());
        profiler.push_scope(me, "inner".to_string());
        profiler.pop_scope(me, "outer");
        profiler.push_scope(me, "left_open".to_string());

        let report = profiler.stop().unwrap();
        assert!(!report.is_balanced());
        assert_eq!(report.mismatches, vec![ScopeMismatch {
            expected: Some("inner".to_string()),
            popped: "outer".to_string(),
        }]);
        assert_eq!(report.open_scopes, vec!["left_open".to_string()]);
    }

    #[test]
    fn test_threads_keep_separate_stacks() {
        let me = thread::current().id();
        let other = other_thread();
        let mut profiler = Profiler::new();
        profiler.start().unwrap();

        profiler.push_scope(me, "main".to_string());
        profiler.push_scope(other, "side".to_string());
        profiler.record_op(me, "add", Duration::from_millis(1));
        profiler.record_op(other, "mul", Duration::from_millis(2));
        profiler.pop_scope(me, "main");
        profiler.pop_scope(other, "side");

        assert_eq!(profiler.depth(me), 0);
        assert_eq!(profiler.depth(other), 0);
        let report = profiler.stop().unwrap();
        assert!(report.is_balanced());
        assert_eq!(report.scope("main").unwrap().total, Duration::from_millis(1));
        assert_eq!(report.scope("side").unwrap().total, Duration::from_millis(2));
        assert!(report.scope("main/side").is_none());
    }

    #[test]
    fn test_stop_without_start() {
        let mut profiler = Profiler::new();
        assert!(matches!(profiler.stop(), Err(AnvilError::ProfilingError(_))));
        profiler.start().unwrap();
        assert!(profiler.start().is_err());
    }

    #[test]
    fn test_inactive_profiler_ignores_ops() {
        let mut profiler = Profiler::new();
        profiler.record_op(thread::current().id(), "add", Duration::from_millis(1));
        profiler.start().unwrap();
        let report = profiler.stop().unwrap();
        assert!(report.ops.is_empty());
    }
}

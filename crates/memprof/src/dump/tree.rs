use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::frame::Frame;

/// A frame and everything below it, as returned by
/// [`dump_tree`](crate::dump_tree).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameReport {
    /// Bytes allocated directly in this frame and still live.
    pub memory_size: usize,
    pub blocks_count: usize,
    /// Self cost plus the inclusive cost of every callee.
    pub memory_size_inclusive: usize,
    pub blocks_count_inclusive: usize,
    pub calls: u64,
    pub called_functions: BTreeMap<String, FrameReport>,
}

impl FrameReport {
    pub(crate) fn from_frame(frame: &Frame) -> Self {
        let own = frame.self_cost();
        let mut report = FrameReport {
            memory_size: own.bytes,
            blocks_count: own.blocks,
            memory_size_inclusive: own.bytes,
            blocks_count_inclusive: own.blocks,
            calls: frame.calls(),
            called_functions: BTreeMap::new(),
        };

        for child in frame.sorted_children() {
            let child_report = FrameReport::from_frame(child);
            report.memory_size_inclusive += child_report.memory_size_inclusive;
            report.blocks_count_inclusive += child_report.blocks_count_inclusive;
            report
                .called_functions
                .insert(child.name().to_string(), child_report);
        }

        report
    }

    /// Follows `path` through `called_functions`.
    pub fn get(&self, path: &[&str]) -> Option<&FrameReport> {
        path.iter()
            .try_fold(self, |frame, name| frame.called_functions.get(*name))
    }

    /// Visits every frame below this one with its call path, parents first.
    pub fn visit<'a>(&'a self, f: &mut impl FnMut(&[&'a str], &'a FrameReport)) {
        let mut path = Vec::new();
        self.visit_inner(&mut path, f);
    }

    fn visit_inner<'a>(
        &'a self,
        path: &mut Vec<&'a str>,
        f: &mut impl FnMut(&[&'a str], &'a FrameReport),
    ) {
        for (name, child) in &self.called_functions {
            path.push(name);
            f(path, child);
            child.visit_inner(path, f);
            path.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::session::Session;

    fn addr(n: usize) -> *mut u8 {
        (n * 0x10) as *mut u8
    }

    #[test]
    fn test_report_mirrors_tree() {
        let mut session = Session::new(Config::new());
        session.handle_alloc(5, || addr(1));
        let a = session.enter("a").unwrap();
        session.handle_alloc(100, || addr(2));
        let b = session.enter("b").unwrap();
        session.handle_alloc(10, || addr(3));
        session.leave(b);
        session.leave(a);

        let report = FrameReport::from_frame(session.root());
        assert_eq!(report.memory_size, 5);
        assert_eq!(report.memory_size_inclusive, 115);
        assert_eq!(report.blocks_count_inclusive, 3);
        assert_eq!(report.calls, 1);

        let a = report.get(&["a"]).unwrap();
        assert_eq!((a.memory_size, a.blocks_count), (100, 1));
        assert_eq!((a.memory_size_inclusive, a.blocks_count_inclusive), (110, 2));

        let b = report.get(&["a", "b"]).unwrap();
        assert_eq!(b.memory_size, 10);
        assert!(b.called_functions.is_empty());
        assert!(report.get(&["b"]).is_none());
    }

    #[test]
    fn test_json_field_names() {
        let mut session = Session::new(Config::new());
        let a = session.enter("a").unwrap();
        session.handle_alloc(100, || addr(1));
        session.leave(a);

        let value = serde_json::to_value(FrameReport::from_frame(session.root())).unwrap();
        assert_eq!(
            value["called_functions"]["a"],
            serde_json::json!({
                "memory_size": 100,
                "blocks_count": 1,
                "memory_size_inclusive": 100,
                "blocks_count_inclusive": 1,
                "calls": 1,
                "called_functions": {},
            })
        );
    }

    #[test]
    fn test_visit_paths() {
        let mut report = FrameReport::default();
        let mut a = FrameReport::default();
        a.called_functions.insert("b".into(), FrameReport::default());
        report.called_functions.insert("a".into(), a);
        report.called_functions.insert("c".into(), FrameReport::default());

        let mut paths = Vec::new();
        report.visit(&mut |path, _| paths.push(path.join("/")));
        assert_eq!(paths, ["a", "a/b", "c"]);
    }
}

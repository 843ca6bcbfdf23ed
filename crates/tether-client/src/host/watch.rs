//! Path watchers
//!
//! Paths name views relative to a query host: `manager.name` is the `name`
//! view of the entity behind the `manager` reference, `friends.u2.avatar` the
//! `avatar` view of list item `u2`. A watcher fires when the changed path
//! lies under it or it lies under the changed path.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Dotted path to a view below a query host.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatchPath(Vec<String>);

impl WatchPath {
    /// Build a path from its segments.
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Path segments, outermost first.
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// This path below `segments`.
    pub fn under<I, S>(&self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut path: Vec<String> = segments.into_iter().map(Into::into).collect();
        path.extend(self.0.iter().cloned());
        Self(path)
    }

    /// True when one path is a prefix of the other.
    pub fn overlaps(&self, other: &WatchPath) -> bool {
        self.0.iter().zip(other.0.iter()).all(|(a, b)| a == b)
    }
}

impl From<&str> for WatchPath {
    fn from(value: &str) -> Self {
        Self::new(value.split('.').filter(|segment| !segment.is_empty()))
    }
}

impl fmt::Display for WatchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// Callback run with the path that changed.
pub type WatchCallback = Arc<dyn Fn(&WatchPath) + Send + Sync>;

/// Registration handle for a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatchId(u64);

#[derive(Default)]
pub(crate) struct Watchers {
    entries: Mutex<BTreeMap<u64, (WatchPath, WatchCallback)>>,
    next_id: AtomicU64,
}

impl Watchers {
    pub(crate) fn add(&self, path: WatchPath, callback: WatchCallback) -> WatchId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.entries.lock().insert(id, (path, callback));
        WatchId(id)
    }

    pub(crate) fn remove(&self, id: WatchId) -> bool {
        self.entries.lock().remove(&id.0).is_some()
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }

    pub(crate) fn notify(&self, changed: &WatchPath) {
        let matching: Vec<WatchCallback> = self
            .entries
            .lock()
            .values()
            .filter(|(path, _)| path.overlaps(changed))
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in matching {
            callback(changed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_match_works_both_ways() {
        let watched = WatchPath::from("manager");
        assert!(watched.overlaps(&WatchPath::from("manager.name")));
        assert!(WatchPath::from("manager.name").overlaps(&watched));
        assert!(!watched.overlaps(&WatchPath::from("friends.u2")));
        assert!(WatchPath::default().overlaps(&watched));
    }

    #[test]
    fn under_prepends_segments() {
        let path = WatchPath::from("name").under(["friends", "u2"]);
        assert_eq!(path.to_string(), "friends.u2.name");
    }

    #[test]
    fn notify_runs_matching_callbacks_only() {
        let watchers = Watchers::default();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let seen = hits.clone();
        watchers.add(
            WatchPath::from("manager"),
            Arc::new(move |path: &WatchPath| seen.lock().push(path.to_string())),
        );
        let id = watchers.add(WatchPath::from("name"), Arc::new(|_: &WatchPath| {}));

        watchers.notify(&WatchPath::from("manager.name"));
        watchers.notify(&WatchPath::from("visits"));
        assert_eq!(*hits.lock(), vec!["manager.name".to_string()]);
        assert!(watchers.remove(id));
        assert!(!watchers.remove(id));
    }
}

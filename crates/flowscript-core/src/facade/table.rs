//! Static member tables with explicit parent delegation.

use crate::error::AccessorFailure;
use crate::log::ScriptLog;
use crate::value::Value;

/// Reads one named property off a wrapped target.
pub type Accessor<T> = fn(&T) -> Result<Value, AccessorFailure>;

/// One entry of a [`MemberTable`].
pub struct Member<T: 'static> {
    pub name: &'static str,
    pub get: Accessor<T>,
}

/// Name → accessor table of one facade variant.
///
/// Names missing here are looked up in `parent`, then degrade to
/// [`Value::absent`].
pub struct MemberTable<T: 'static> {
    pub type_id: &'static str,
    pub members: &'static [Member<T>],
    pub parent: Option<&'static MemberTable<T>>,
}

impl<T: 'static> MemberTable<T> {
    /// Find the accessor for `name`, walking the parent chain.
    pub fn lookup(&self, name: &str) -> Option<&'static Member<T>> {
        let mut table: Option<&MemberTable<T>> = Some(self);
        while let Some(current) = table {
            if let Some(member) = current.members.iter().find(|m| m.name == name) {
                return Some(member);
            }
            table = current.parent;
        }
        None
    }

    /// All names resolvable through this table, own names first.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = Vec::new();
        let mut table: Option<&MemberTable<T>> = Some(self);
        while let Some(current) = table {
            for member in current.members {
                if !names.contains(&member.name) {
                    names.push(member.name);
                }
            }
            table = current.parent;
        }
        names
    }

    /// Resolve `name` on `target`. Accessor failures are logged once and
    /// yield the absent value.
    pub fn resolve(&self, target: &T, name: &str, log: &dyn ScriptLog) -> Value {
        let Some(member) = self.lookup(name) else {
            return Value::absent();
        };
        match (member.get)(target) {
            Ok(value) => value,
            Err(failure) => {
                log.warn(
                    "facade",
                    &format!("{}.{} could not be read: {failure}", self.type_id, name),
                );
                Value::absent()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::RecordingLog;

    struct Counter {
        n: i64,
    }

    fn n(p: &Counter) -> Result<Value, AccessorFailure> {
        Ok(Value::from(p.n))
    }

    fn doubled(p: &Counter) -> Result<Value, AccessorFailure> {
        Ok(Value::from(p.n * 2))
    }

    fn broken(_: &Counter) -> Result<Value, AccessorFailure> {
        Err(AccessorFailure::Unavailable("store offline".into()))
    }

    static BASE: MemberTable<Counter> = MemberTable {
        type_id: "test.base",
        members: &[Member { name: "n", get: n }, Member { name: "broken", get: broken }],
        parent: None,
    };

    static CHILD: MemberTable<Counter> = MemberTable {
        type_id: "test.child",
        members: &[Member { name: "doubled", get: doubled }, Member { name: "n", get: doubled }],
        parent: Some(&BASE),
    };

    #[test]
    fn test_own_member_shadows_parent() {
        let log = RecordingLog::new();
        assert_eq!(CHILD.resolve(&Counter { n: 3 }, "n", &log), Value::from(6i64));
        assert_eq!(BASE.resolve(&Counter { n: 3 }, "n", &log), Value::from(3i64));
    }

    #[test]
    fn test_parent_delegation_and_absent_fallback() {
        let log = RecordingLog::new();
        assert!(CHILD.lookup("broken").is_some());
        assert!(CHILD.resolve(&Counter { n: 1 }, "nope", &log).is_absent());
        assert!(log.entries().is_empty());
    }

    #[test]
    fn test_failure_logged_once_and_absorbed() {
        let log = RecordingLog::new();
        let value = CHILD.resolve(&Counter { n: 1 }, "broken", &log);
        assert!(value.is_absent());
        assert_eq!(log.warning_count(), 1);
        assert!(log.entries()[0].message.contains("store offline"));
    }

    #[test]
    fn test_names_walk_chain_without_duplicates() {
        assert_eq!(CHILD.names(), vec!["doubled", "n", "broken"]);
    }
}

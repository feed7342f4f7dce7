//! Snapshots of a peer's ring state, for operators and tests.

use serde::Deserialize;
use serde::Serialize;

use crate::dht::ChordState;

/// A serializable view of one peer's ring state. Finger entries are
/// collapsed into `(successor, first_entry, last_entry)` runs, since long
/// stretches of the table point at the same peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingInspect {
    pub id: String,
    pub min_key: String,
    #[serde(default)]
    pub predecessor: Option<String>,
    pub successors: Vec<String>,
    pub finger_table: Vec<(String, usize, usize)>,
}

impl RingInspect {
    /// Take a snapshot of the given ring state.
    pub fn inspect(state: &ChordState) -> Self {
        let predecessor = state
            .predecessor()
            .ok()
            .flatten()
            .map(|p| p.id.to_hex());

        let successors = state
            .successors()
            .entries()
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.id.to_hex())
            .collect();

        let finger_table = state
            .finger()
            .entries()
            .map(|entries| {
                compress_runs(entries.into_iter().map(|f| f.successor.id.to_hex()))
            })
            .unwrap_or_default();

        Self {
            id: state.id().to_hex(),
            min_key: state.min_key().map(|k| k.to_hex()).unwrap_or_default(),
            predecessor,
            successors,
            finger_table,
        }
    }
}

impl std::fmt::Display for RingInspect {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "id:          {}", self.id)?;
        writeln!(f, "range:       {}-{}", self.min_key, self.id)?;
        match &self.predecessor {
            Some(pred) => writeln!(f, "predecessor: {}", pred)?,
            None => writeln!(f, "predecessor: none")?,
        }
        writeln!(f, "successors:  {}", self.successors.join(", "))?;
        writeln!(f, "fingers:")?;
        for (successor, first, last) in &self.finger_table {
            writeln!(f, "  [{:>3}..{:>3}] -> {}", first, last, successor)?;
        }
        Ok(())
    }
}

/// Collapse consecutive equal items into `(item, first_index, last_index)`
/// runs.
fn compress_runs<T: PartialEq>(iter: impl Iterator<Item = T>) -> Vec<(T, usize, usize)> {
    let mut result = Vec::new();
    let mut run: Option<(T, usize, usize)> = None;

    for (i, item) in iter.enumerate() {
        run = match run {
            Some((prev, start, _)) if prev == item => Some((prev, start, i)),
            Some(done) => {
                result.push(done);
                Some((item, i, i))
            }
            None => Some((item, i, i)),
        };
    }
    if let Some(done) = run {
        result.push(done);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_runs() {
        assert_eq!(
            compress_runs(["a", "a", "a", "b", "a"].into_iter()),
            vec![("a", 0, 2), ("b", 3, 3), ("a", 4, 4)]
        );
        assert_eq!(compress_runs(std::iter::empty::<u8>()), vec![]);
        assert_eq!(compress_runs(["x"].into_iter()), vec![("x", 0, 0)]);
    }

    #[test]
    fn test_inspect_fresh_state() {
        use std::sync::Arc;

        use crate::dht::Key;
        use crate::dht::StoreAdapter;
        use crate::error::Result;
        use crate::rpc::KeyMap;

        struct NullStore;
        impl StoreAdapter for NullStore {
            fn transfers_keys(&self) -> bool {
                false
            }
            fn drain_range(&self, _: &Key, _: &Key) -> Result<KeyMap> {
                Ok(KeyMap::new())
            }
            fn export_all(&self) -> Result<KeyMap> {
                Ok(KeyMap::new())
            }
            fn absorb(&self, _: &KeyMap) -> Result<()> {
                Ok(())
            }
        }

        let state = ChordState::new("127.0.0.1", 4900, 3, Arc::new(NullStore));
        let inspect = RingInspect::inspect(&state);

        assert_eq!(inspect.id, state.id().to_hex());
        assert!(inspect.predecessor.is_none());
        assert!(inspect.successors.is_empty());
        assert!(inspect.finger_table.is_empty());

        state.start_chord().unwrap();
        let inspect = RingInspect::inspect(&state);
        assert_eq!(inspect.predecessor.as_deref(), Some(inspect.id.as_str()));
        assert_eq!(inspect.min_key, (state.id() + 1u64).to_hex());

        // The display form mentions every section.
        let rendered = inspect.to_string();
        assert!(rendered.contains("predecessor:"));
        assert!(rendered.contains("successors:"));
    }
}

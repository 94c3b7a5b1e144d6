use crate::endpoints::Endpoint;
use crate::key::Dxyz;
use log::debug;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::Mutex;

/// Max number of nodes stored in a single hierarchy file.
pub const MAX_HIERARCHY_NODES_PER_FILE: u64 = 32_768;

/// Sparse map from chunk identity to persisted point count. Presence with a
/// positive count means exactly that many points are stored in the chunk of
/// that name; absence means the chunk does not exist.
#[derive(Debug, Default)]
pub struct Hierarchy {
    map: Mutex<HashMap<Dxyz, u64>>,
}

impl Hierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: HashMap<Dxyz, u64>) -> Self {
        Self {
            map: Mutex::new(map),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Dxyz, u64>> {
        self.map.lock().expect("hierarchy lock poisoned")
    }

    pub fn get(&self, dxyz: Dxyz) -> Option<u64> {
        self.lock().get(&dxyz).copied()
    }

    pub fn set(&self, dxyz: Dxyz, count: u64) {
        self.lock().insert(dxyz, count);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn total_points(&self) -> u64 {
        self.lock().values().sum()
    }

    /// Sorted copy of the map.
    pub fn snapshot(&self) -> BTreeMap<Dxyz, u64> {
        self.lock().iter().map(|(k, v)| (*k, *v)).collect()
    }

    fn root_anchor() -> Dxyz {
        Dxyz::new(0, 0, 0, 0)
    }

    /// The file a node belongs to under stride `step`.
    fn anchor_of(id: Dxyz, step: u32) -> Dxyz {
        if step == 0 || id.d < step {
            Self::root_anchor()
        } else {
            id.ancestor_at(id.d - id.d % step)
        }
    }

    /// Smallest stride keeping every hierarchy file at or under the node
    /// cap; 0 means a single monolithic file suffices.
    pub fn determine_step(&self) -> u32 {
        let snapshot = self.snapshot();
        if snapshot.len() as u64 <= MAX_HIERARCHY_NODES_PER_FILE {
            return 0;
        }
        let max_depth = snapshot.keys().map(|id| id.d).max().unwrap_or(0);
        for step in 1..=max_depth.max(1) {
            let mut sizes = HashMap::<Dxyz, u64>::new();
            for id in snapshot.keys() {
                *sizes.entry(Self::anchor_of(*id, step)).or_default() += 1;
                // Anchor nodes also appear as links in their parent's file.
                if id.d >= step && id.d % step == 0 {
                    let parent_anchor = Self::anchor_of(id.ancestor_at(id.d - 1), step);
                    *sizes.entry(parent_anchor).or_default() += 1;
                }
            }
            if sizes.values().all(|n| *n <= MAX_HIERARCHY_NODES_PER_FILE) {
                return step;
            }
        }
        max_depth.max(1)
    }

    /// Write the hierarchy as one or more JSON files. With `step == 0`
    /// everything lands in a single root file. Otherwise nodes are grouped
    /// by their anchor ancestor (`floor(d / step) * step`); an anchor node
    /// is written into its parent's file with count `-1` and into its own
    /// file with the real count, so readers can follow links without
    /// listing the store.
    pub fn save(&self, endpoint: &Endpoint, step: u32, postfix: &str) -> io::Result<()> {
        let snapshot = self.snapshot();
        let mut files = BTreeMap::<Dxyz, BTreeMap<String, i64>>::new();
        files.entry(Self::root_anchor()).or_default();

        for (id, count) in &snapshot {
            files
                .entry(Self::anchor_of(*id, step))
                .or_default()
                .insert(id.to_string(), *count as i64);
            if step > 0 && id.d >= step && id.d % step == 0 {
                let parent_anchor = Self::anchor_of(id.ancestor_at(id.d - 1), step);
                files
                    .entry(parent_anchor)
                    .or_default()
                    .insert(id.to_string(), -1);
            }
        }

        debug!(
            "saving hierarchy: {} nodes in {} files (step {step})",
            snapshot.len(),
            files.len()
        );
        for (anchor, nodes) in &files {
            let blob = serde_json::to_vec_pretty(nodes)?;
            endpoint.put(&format!("{anchor}{postfix}.json"), &blob)?;
        }
        Ok(())
    }

    pub fn load(endpoint: &Endpoint, postfix: &str) -> io::Result<Hierarchy> {
        let mut map = HashMap::new();
        let mut queue = vec![Self::root_anchor()];
        while let Some(anchor) = queue.pop() {
            let blob = endpoint.get(&format!("{anchor}{postfix}.json"))?;
            let nodes: BTreeMap<String, i64> = serde_json::from_slice(&blob)?;
            for (key, count) in nodes {
                let id: Dxyz = key
                    .parse()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                if count < 0 {
                    queue.push(id);
                } else {
                    map.insert(id, count as u64);
                }
            }
        }
        Ok(Hierarchy::from_map(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoints::test_support::test_root;

    #[test]
    fn counts_accumulate() {
        let h = Hierarchy::new();
        h.set(Dxyz::new(0, 0, 0, 0), 10);
        h.set(Dxyz::new(1, 1, 0, 1), 4);
        assert_eq!(h.get(Dxyz::new(0, 0, 0, 0)), Some(10));
        assert_eq!(h.get(Dxyz::new(2, 0, 0, 0)), None);
        assert_eq!(h.total_points(), 14);
    }

    #[test]
    fn monolithic_save_round_trips() {
        let root = test_root("hierarchy-monolithic");
        let endpoint = Endpoint::new(root.clone());

        let h = Hierarchy::new();
        h.set(Dxyz::new(0, 0, 0, 0), 8);
        h.set(Dxyz::new(1, 1, 1, 1), 5);
        h.save(&endpoint, 0, "").unwrap();
        assert!(endpoint.try_get_size("0-0-0-0.json").is_some());
        assert!(endpoint.try_get_size("1-1-1-1.json").is_none());

        let loaded = Hierarchy::load(&endpoint, "").unwrap();
        assert_eq!(loaded.snapshot(), h.snapshot());
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn stepped_save_links_and_round_trips() {
        let root = test_root("hierarchy-stepped");
        let endpoint = Endpoint::new(root.clone());

        // A chain down to depth 3 plus a sibling: step 2 splits it into a
        // root file and one file per depth-2 anchor.
        let h = Hierarchy::new();
        h.set(Dxyz::new(0, 0, 0, 0), 100);
        h.set(Dxyz::new(1, 1, 1, 1), 50);
        h.set(Dxyz::new(2, 3, 3, 3), 25);
        h.set(Dxyz::new(2, 2, 2, 2), 7);
        h.set(Dxyz::new(3, 7, 7, 7), 12);
        h.save(&endpoint, 2, "").unwrap();

        let rootfile: BTreeMap<String, i64> =
            serde_json::from_slice(&endpoint.get("0-0-0-0.json").unwrap()).unwrap();
        assert_eq!(rootfile.get("0-0-0-0"), Some(&100));
        assert_eq!(rootfile.get("1-1-1-1"), Some(&50));
        assert_eq!(rootfile.get("2-3-3-3"), Some(&-1));
        assert_eq!(rootfile.get("2-2-2-2"), Some(&-1));
        assert!(rootfile.get("3-7-7-7").is_none());

        let group: BTreeMap<String, i64> =
            serde_json::from_slice(&endpoint.get("2-3-3-3.json").unwrap()).unwrap();
        assert_eq!(group.get("2-3-3-3"), Some(&25));
        assert_eq!(group.get("3-7-7-7"), Some(&12));

        let loaded = Hierarchy::load(&endpoint, "").unwrap();
        assert_eq!(loaded.snapshot(), h.snapshot());
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn saves_are_byte_identical() {
        let root_a = test_root("hierarchy-idempotent-a");
        let root_b = test_root("hierarchy-idempotent-b");
        let h = Hierarchy::new();
        h.set(Dxyz::new(0, 0, 0, 0), 3);
        h.set(Dxyz::new(1, 0, 1, 0), 9);

        h.save(&Endpoint::new(root_a.clone()), 0, "").unwrap();
        h.save(&Endpoint::new(root_b.clone()), 0, "").unwrap();
        assert_eq!(
            std::fs::read(root_a.join("0-0-0-0.json")).unwrap(),
            std::fs::read(root_b.join("0-0-0-0.json")).unwrap()
        );
        let _ = std::fs::remove_dir_all(root_a);
        let _ = std::fs::remove_dir_all(root_b);
    }

    #[test]
    fn small_hierarchies_stay_monolithic() {
        let h = Hierarchy::new();
        h.set(Dxyz::new(0, 0, 0, 0), 1);
        assert_eq!(h.determine_step(), 0);
    }
}

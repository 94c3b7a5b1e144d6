use crate::endpoints::Endpoint;
use crate::schema::Schema;
use crate::spatial::Bounds;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use std::path::Path;

/// What analysis learned about one input source.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SourceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
    #[serde(default)]
    pub points: u64,
    #[serde(default)]
    pub schema: Schema,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pipeline: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srs: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Source {
    pub path: String,
    #[serde(default)]
    pub info: SourceInfo,
}

/// One manifest entry. `inserted` flips exactly once, when the owning worker
/// finishes with the source (successfully or not).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildItem {
    pub source: Source,
    #[serde(default)]
    pub inserted: bool,
}

impl BuildItem {
    pub fn new(source: Source) -> Self {
        Self {
            source,
            inserted: false,
        }
    }
}

/// Overview row of the whole-build `manifest.json`; details live in one file
/// per source.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct OverviewItem {
    path: String,
    inserted: bool,
    points: u64,
    metadata_path: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    pub items: Vec<BuildItem>,
}

impl Manifest {
    pub fn new(items: Vec<BuildItem>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains_path(&self, path: &str) -> bool {
        self.items.iter().any(|item| item.source.path == path)
    }

    /// Total points across all analyzed sources.
    pub fn total_points(&self) -> u64 {
        self.items.iter().map(|item| item.source.info.points).sum()
    }

    /// Points belonging to already-settled sources.
    pub fn inserted_points(&self) -> u64 {
        self.items
            .iter()
            .filter(|item| item.inserted)
            .map(|item| item.source.info.points)
            .sum()
    }

    pub fn is_settled(&self) -> bool {
        self.items.iter().all(|item| item.inserted)
    }

    pub fn all_have_stats(&self) -> bool {
        self.items
            .iter()
            .all(|item| item.source.info.schema.has_stats())
    }

    /// Fold another manifest's progress into this one, pairing by path.
    pub fn merge(&mut self, other: &Manifest) {
        for item in &other.items {
            match self
                .items
                .iter_mut()
                .find(|mine| mine.source.path == item.source.path)
            {
                Some(mine) => {
                    mine.inserted = mine.inserted || item.inserted;
                    for error in &item.source.info.errors {
                        if !mine.source.info.errors.contains(error) {
                            mine.source.info.errors.push(error.clone());
                        }
                    }
                    if !mine.source.info.schema.has_stats()
                        && item.source.info.schema.has_stats()
                    {
                        mine.source.info.schema = item.source.info.schema.clone();
                    }
                }
                None => self.items.push(item.clone()),
            }
        }
    }

    fn detail_filename(origin: usize, path: &str) -> String {
        let stem = Path::new(path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "source".to_string());
        format!("{origin}-{stem}.json")
    }

    /// Whole builds write an overview plus one detailed file per source;
    /// subset builds write everything as one blob since the merge will wake
    /// the whole thing up anyway.
    pub fn save(&self, endpoint: &Endpoint, postfix: &str, aggregate: bool) -> io::Result<()> {
        let manifest_filename = format!("manifest{postfix}.json");
        if aggregate {
            let blob = serde_json::to_vec_pretty(&self.items)?;
            return endpoint.put(&manifest_filename, &blob);
        }

        let mut overview = Vec::with_capacity(self.items.len());
        for (origin, item) in self.items.iter().enumerate() {
            let metadata_path = Self::detail_filename(origin, &item.source.path);
            endpoint.put(&metadata_path, &serde_json::to_vec_pretty(item)?)?;
            overview.push(OverviewItem {
                path: item.source.path.clone(),
                inserted: item.inserted,
                points: item.source.info.points,
                metadata_path,
            });
        }
        endpoint.put(&manifest_filename, &serde_json::to_vec_pretty(&overview)?)
    }

    pub fn load(endpoint: &Endpoint, postfix: &str) -> io::Result<Manifest> {
        let blob = endpoint.get(&format!("manifest{postfix}.json"))?;
        let raw: Vec<Value> = serde_json::from_slice(&blob)?;

        let is_overview = raw
            .first()
            .map(|entry| entry.get("metadata_path").is_some())
            .unwrap_or(false);

        if !is_overview {
            let items: Vec<BuildItem> = serde_json::from_value(Value::Array(raw))?;
            return Ok(Manifest::new(items));
        }

        let mut items = Vec::with_capacity(raw.len());
        for entry in raw {
            let overview: OverviewItem = serde_json::from_value(entry)?;
            let detail = endpoint.get(&overview.metadata_path)?;
            items.push(serde_json::from_slice(&detail)?);
        }
        Ok(Manifest::new(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoints::test_support::test_root;
    use glam::DVec3;

    fn item(path: &str, points: u64, inserted: bool) -> BuildItem {
        BuildItem {
            source: Source {
                path: path.to_string(),
                info: SourceInfo {
                    bounds: Some(Bounds::new(DVec3::ZERO, DVec3::ONE)),
                    points,
                    schema: Schema::xyz(),
                    ..Default::default()
                },
            },
            inserted,
        }
    }

    #[test]
    fn point_totals_split_by_settled() {
        let manifest = Manifest::new(vec![item("a", 10, true), item("b", 5, false)]);
        assert_eq!(manifest.total_points(), 15);
        assert_eq!(manifest.inserted_points(), 10);
        assert!(!manifest.is_settled());
    }

    #[test]
    fn detailed_save_round_trips() {
        let root = test_root("manifest-detailed");
        let endpoint = Endpoint::new(root.clone());

        let manifest = Manifest::new(vec![item("/in/a.xyz", 10, true), item("/in/b.xyz", 5, false)]);
        manifest.save(&endpoint, "", false).unwrap();
        assert!(endpoint.try_get_size("0-a.json").is_some());
        assert!(endpoint.try_get_size("1-b.json").is_some());

        let loaded = Manifest::load(&endpoint, "").unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.items[0].source.path, "/in/a.xyz");
        assert!(loaded.items[0].inserted);
        assert_eq!(loaded.items[1].source.info.points, 5);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn aggregate_save_round_trips() {
        let root = test_root("manifest-aggregate");
        let endpoint = Endpoint::new(root.clone());

        let manifest = Manifest::new(vec![item("/in/a.xyz", 10, false)]);
        manifest.save(&endpoint, "-2", true).unwrap();
        assert!(endpoint.try_get_size("manifest-2.json").is_some());
        assert!(endpoint.try_get_size("0-a.json").is_none());

        let loaded = Manifest::load(&endpoint, "-2").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.items[0].source.info.points, 10);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn merge_pairs_by_path() {
        let mut a = Manifest::new(vec![item("x", 3, true), item("y", 4, false)]);
        let mut with_error = item("y", 4, true);
        with_error.source.info.errors.push("boom".to_string());
        let b = Manifest::new(vec![with_error, item("z", 5, true)]);

        a.merge(&b);
        assert_eq!(a.len(), 3);
        assert!(a.items[1].inserted);
        assert_eq!(a.items[1].source.info.errors, vec!["boom".to_string()]);
    }
}

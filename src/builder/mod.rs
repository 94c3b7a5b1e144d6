pub mod cache;
pub mod chunk;
pub mod clipper;

use crate::config::BuildConfig;
use crate::endpoints::{Arbiter, Endpoints};
use crate::hierarchy::Hierarchy;
use crate::info;
use crate::key::{ChunkKey, Key};
use crate::manifest::{BuildItem, Manifest, Source};
use crate::metadata::{EptBuild, EptInfo, Metadata, Threads};
use crate::pipeline::{self, StatsFilter, STAGE_STATS};
use crate::pool::Pool;
use crate::schema::{Schema, ScaleOffset};
use crate::spatial::Bounds;
use crate::voxel::Voxel;
use cache::{CacheStats, ChunkCache};
use clipper::Clipper;
use glam::DVec3;
use log::info;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

/// Points each worker inserts between clip boundaries.
pub const SLEEP_COUNT: u64 = 65_536 * 32;

/// Orchestrates concurrent per-source ingest into one output dataset.
pub struct Builder {
    pub endpoints: Endpoints,
    pub metadata: Metadata,
    pub manifest: Manifest,
    pub hierarchy: Arc<Hierarchy>,
}

/// What one worker reports back about its source.
struct InsertOutcome {
    origin: usize,
    errors: Vec<String>,
    schema: Option<Schema>,
}

impl Builder {
    pub fn new(
        endpoints: Endpoints,
        metadata: Metadata,
        manifest: Manifest,
        hierarchy: Hierarchy,
    ) -> Builder {
        Builder {
            endpoints,
            metadata,
            manifest,
            hierarchy: Arc::new(hierarchy),
        }
    }

    /// Ingest every pending source, then persist hierarchy, sources and
    /// metadata. Returns the number of points inserted by this run.
    pub fn run(
        &mut self,
        threads: Threads,
        limit: u64,
        progress_interval: u64,
    ) -> io::Result<u64> {
        let counter = Arc::new(AtomicU64::new(0));
        let done = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(CacheStats::default());

        let monitor_handle = {
            let counter = Arc::clone(&counter);
            let done = Arc::clone(&done);
            let stats = Arc::clone(&stats);
            let total = self.manifest.total_points();
            let already = self.manifest.inserted_points();
            thread::spawn(move || {
                monitor(progress_interval, total, already, &counter, &done, &stats)
            })
        };

        let result = self.run_inserts(threads, limit, &counter, &stats);
        done.store(true, Ordering::Relaxed);
        let _ = monitor_handle.join();
        result?;

        Ok(counter.load(Ordering::Relaxed))
    }

    fn run_inserts(
        &mut self,
        threads: Threads,
        limit: u64,
        counter: &Arc<AtomicU64>,
        stats: &Arc<CacheStats>,
    ) -> io::Result<()> {
        let active = match &self.metadata.subset {
            Some(subset) => subset
                .bounds(&self.metadata.bounds)
                .intersection(&self.metadata.bounds_conforming),
            None => self.metadata.bounds_conforming,
        };

        // Work threads beyond the number of sources are lent to the clip
        // pool instead.
        let work = threads.work.min(self.manifest.len()).max(1);
        let clip = threads.clip + threads.work.saturating_sub(work);

        let metadata = Arc::new(self.metadata.clone());
        let cache = Arc::new(ChunkCache::new(
            self.endpoints.clone(),
            Arc::clone(&metadata),
            Arc::clone(&self.hierarchy),
            Arc::clone(stats),
            clip,
        )?);

        let pool = Pool::new(work);
        let (tx, rx) = mpsc::channel::<InsertOutcome>();
        let mut files_inserted = 0u64;

        for (origin, item) in self.manifest.items.iter().enumerate() {
            if limit > 0 && files_inserted >= limit {
                break;
            }
            let info = &item.source.info;
            let overlaps = info.bounds.map_or(false, |b| active.overlaps(&b));
            if item.inserted || info.points == 0 || !overlaps {
                continue;
            }

            info!("adding {origin} - {}", item.source.path);
            let cache = Arc::clone(&cache);
            let counter = Arc::clone(counter);
            let source = item.source.clone();
            let tx = tx.clone();
            pool.add(move || {
                let outcome = try_insert(&cache, origin, &source, &counter);
                info!("\tdone {origin}");
                let _ = tx.send(outcome);
            });
            files_inserted += 1;
        }
        drop(tx);

        info!("joining");
        pool.join();
        for outcome in rx {
            let item = &mut self.manifest.items[outcome.origin];
            item.source.info.errors.extend(outcome.errors);
            if let Some(schema) = outcome.schema {
                item.source.info.schema = schema;
            }
            item.inserted = true;
        }
        cache.join();

        self.save()
    }

    /// Persist hierarchy, per-source manifest, and top-level metadata.
    pub fn save(&mut self) -> io::Result<()> {
        info!("saving");
        self.save_hierarchy()?;
        self.save_sources()?;
        self.save_metadata()
    }

    fn save_hierarchy(&mut self) -> io::Result<()> {
        // Subset or partial builds defer the step decision to the merge and
        // write one monolithic file.
        let stepped = self.metadata.subset.is_none() && self.manifest.is_settled();
        let step = if !stepped {
            0
        } else if self.metadata.hierarchy_step > 0 {
            self.metadata.hierarchy_step
        } else {
            self.hierarchy.determine_step()
        };
        if stepped {
            self.metadata.hierarchy_step = step;
        }
        self.hierarchy
            .save(&self.endpoints.hierarchy, step, &self.metadata.postfix())
    }

    fn save_sources(&self) -> io::Result<()> {
        self.manifest.save(
            &self.endpoints.sources,
            &self.metadata.postfix(),
            self.metadata.subset.is_some(),
        )
    }

    fn save_metadata(&mut self) -> io::Result<()> {
        // Once every source is settled with stats, fold them into the
        // dataset schema.
        if self.metadata.subset.is_none()
            && !self.manifest.is_empty()
            && self.manifest.all_have_stats()
        {
            let mut folded: Option<Schema> = None;
            for item in &self.manifest.items {
                let mut schema = item.source.info.schema.clone();
                if let Some(so) = self.metadata.schema.scale_offset() {
                    schema.set_scale_offset(so);
                }
                folded = Some(match folded {
                    None => schema,
                    Some(combined) => combined.combine(&schema, true),
                });
            }
            if let Some(folded) = folded {
                let mut schema = self.metadata.schema.clear_stats();
                for dim in &mut schema.dims {
                    if let Some(i) = folded.index_of(&dim.name) {
                        dim.stats = folded.dims[i].stats;
                    }
                }
                for dim in &folded.dims {
                    if schema.index_of(&dim.name).is_none() {
                        schema.dims.push(dim.clone());
                    }
                }
                self.metadata.schema = schema;
            }
        }

        let postfix = self.metadata.postfix();
        let points = self.hierarchy.total_points();

        let info = self.metadata.to_ept_info(points);
        self.endpoints.output.put(
            &format!("ept{postfix}.json"),
            &serde_json::to_vec_pretty(&info)?,
        )?;

        let build = self.metadata.to_ept_build();
        self.endpoints.output.put(
            &format!("ept-build{postfix}.json"),
            &serde_json::to_vec_pretty(&build)?,
        )
    }
}

/// Run one source, capturing any failure as a source error. The source is
/// settled either way so it is never retried within this run.
fn try_insert(
    cache: &ChunkCache,
    origin: usize,
    source: &Source,
    counter: &AtomicU64,
) -> InsertOutcome {
    match insert_source(cache, origin, source, counter) {
        Ok(schema) => InsertOutcome {
            origin,
            errors: Vec::new(),
            schema,
        },
        Err(e) => InsertOutcome {
            origin,
            errors: vec![e.to_string()],
            schema: None,
        },
    }
}

/// Stream one source through the shared cache. Returns the source schema
/// with harvested stats when a stats stage ran.
fn insert_source(
    cache: &ChunkCache,
    origin: usize,
    source: &Source,
    counter: &AtomicU64,
) -> io::Result<Option<Schema>> {
    let metadata = Arc::clone(cache.metadata());
    let endpoints = cache.endpoints();
    let handle = endpoints
        .arbiter
        .localize(&source.path, &endpoints.tmp)?;
    let local = handle.local_path().to_string_lossy().into_owned();

    let template = if source.info.pipeline.is_empty() {
        pipeline::default_template()
    } else {
        source.info.pipeline.clone()
    };
    let mut run_pipeline = pipeline::for_file(&template, &local);
    if !source.info.schema.has_stats() {
        pipeline::find_or_append_stage(&mut run_pipeline, STAGE_STATS);
    }
    let wants_stats = pipeline::find_stage(&run_pipeline, STAGE_STATS).is_some();

    let mut reader = pipeline::make_reader(&run_pipeline)?;
    let mut reader_schema = reader.schema().clone();
    let width = reader_schema.dims.len();

    let layout = Arc::clone(cache.layout());
    let missing = |name: &str| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{}: reader schema is missing {name}", source.path),
        )
    };
    let xi = reader_schema
        .index_of(crate::schema::DIM_X)
        .ok_or_else(|| missing("X"))?;
    let yi = reader_schema
        .index_of(crate::schema::DIM_Y)
        .ok_or_else(|| missing("Y"))?;
    let zi = reader_schema
        .index_of(crate::schema::DIM_Z)
        .ok_or_else(|| missing("Z"))?;
    // Map payload dimensions onto the storage layout; positional dims go
    // through set_point instead.
    let field_map: Vec<Option<usize>> = reader_schema
        .dims
        .iter()
        .enumerate()
        .map(|(i, dim)| {
            if i == xi || i == yi || i == zi {
                None
            } else {
                layout.schema.index_of(&dim.name)
            }
        })
        .collect();

    let subset_bounds = metadata.subset.map(|s| s.bounds(&metadata.bounds));
    let start_depth = metadata.start_depth();
    let root_key = ChunkKey::root(metadata.bounds);

    let mut stats = wants_stats.then(|| StatsFilter::new(width));
    let mut clipper = Clipper::new(cache);
    let mut key = Key::new(metadata.bounds);
    let mut record = vec![0u8; layout.point_size];
    let mut point_id = 0u64;
    let mut since_clip = 0u64;

    while let Some(batch) = reader.next_batch()? {
        let mut inserts = 0u64;
        for row in &batch {
            if let Some(stats) = &mut stats {
                stats.update(row);
            }

            record.fill(0);
            for (i, value) in row.iter().enumerate() {
                if let Some(at) = field_map[i] {
                    layout.set_field(&mut record, at, *value);
                }
            }
            let point = layout.set_point(&mut record, DVec3::new(row[xi], row[yi], row[zi]));
            layout.set_origin_id(&mut record, origin as u64);
            layout.set_point_id(&mut record, point_id);
            point_id += 1;

            if !metadata.bounds_conforming.contains_inclusive(point) {
                continue;
            }
            if let Some(subset) = &subset_bounds {
                if !subset.contains(point) {
                    continue;
                }
            }

            let mut voxel = Voxel {
                point,
                data: record.clone(),
            };
            key.init(point, start_depth);
            cache.insert(&mut voxel, &mut key, root_key, &mut clipper);
            inserts += 1;
        }
        counter.fetch_add(inserts, Ordering::Relaxed);

        since_clip += batch.len() as u64;
        if since_clip >= SLEEP_COUNT {
            since_clip = 0;
            clipper.clip();
        }
    }
    drop(clipper);

    Ok(stats.map(|stats| {
        stats.harvest(&mut reader_schema);
        reader_schema
    }))
}

/// Periodic progress reporting: percent complete, cumulative and interval
/// insertion rates, and cache activity.
fn monitor(
    interval: u64,
    total: u64,
    already: u64,
    counter: &AtomicU64,
    done: &AtomicBool,
    stats: &CacheStats,
) {
    if interval == 0 {
        return;
    }
    const MPH: f64 = 3600.0 / 1_000_000.0;
    let start = Instant::now();
    let mut last_tick = 0u64;
    let mut last_inserted = already as f64;

    while !done.load(Ordering::Relaxed) {
        let within_second = start.elapsed().as_millis() % 1000;
        thread::sleep(Duration::from_millis((1000 - within_second) as u64));

        let tick = start.elapsed().as_secs();
        if tick == last_tick || tick % interval != 0 {
            continue;
        }
        last_tick = tick;

        let inserted = already as f64 + counter.load(Ordering::Relaxed) as f64;
        let progress = if total > 0 {
            inserted / total as f64
        } else {
            0.0
        };
        let pace = (inserted / tick as f64 * MPH) as u64;
        let interval_pace = ((inserted - last_inserted) / interval as f64 * MPH) as u64;
        last_inserted = inserted;

        let cache = stats.latch();
        info!(
            "{} - {}% - {} - {} ({}) M/h - {}W - {}R - {}A",
            format_time(tick),
            (progress * 100.0).round() as u64,
            commify(inserted as u64),
            commify(pace),
            commify(interval_pace),
            cache.written,
            cache.read,
            cache.alive
        );
    }
}

pub fn commify(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

pub fn format_time(seconds: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds / 60) % 60,
        seconds % 60
    )
}

/// Build a `Builder` from configuration. When the output already holds a
/// dataset and `force` is not set, the existing build is continued: its
/// metadata wins, settled sources are kept, and only unseen inputs are
/// analyzed.
pub fn create(config: &BuildConfig) -> io::Result<Builder> {
    config.validate()?;
    if !config.pipeline.is_empty() {
        pipeline::validate(&config.pipeline)?;
    }

    let arbiter = Arbiter;
    let output = arbiter.resolve(&config.output)?;
    let tmp = match &config.tmp {
        Some(tmp) => Some(arbiter.resolve(tmp)?),
        None => None,
    };
    let endpoints = Endpoints::new(output, tmp);
    let threads = config.threads();

    let mut manifest = Manifest::default();
    let mut hierarchy = Hierarchy::new();
    let mut existing: Option<Metadata> = None;

    if !config.force && endpoints.output.try_get_size("ept.json").is_some() {
        info!("continuing existing build at {}", config.output);
        let info: EptInfo = serde_json::from_slice(&endpoints.output.get("ept.json")?)?;
        let build: EptBuild =
            serde_json::from_slice(&endpoints.output.get("ept-build.json")?)?;
        existing = Some(Metadata::from_files(info, build));
        manifest = Manifest::load(&endpoints.sources, "")?;
        hierarchy = Hierarchy::load(&endpoints.hierarchy, "")?;
    }

    let mut inputs = Vec::new();
    for input in &config.input {
        for path in endpoints.arbiter.expand(input)? {
            if !inputs.contains(&path) {
                inputs.push(path);
            }
        }
    }
    // Inputs already in the manifest were analyzed by a previous run.
    inputs.retain(|path| !manifest.contains_path(path));

    let template = if config.pipeline.is_empty() {
        pipeline::default_template()
    } else {
        config.pipeline.clone()
    };
    let sources = info::analyze(
        &inputs,
        &template,
        config.deep,
        &endpoints.tmp,
        &endpoints.arbiter,
        threads.total(),
    );
    for source in sources {
        let mut item = BuildItem::new(source);
        if item.source.info.points == 0 {
            // Nothing to insert; settle it now (any analysis error rides
            // along in the source's error list).
            item.inserted = true;
        }
        manifest.items.push(item);
    }

    let metadata = match existing {
        Some(metadata) => metadata,
        None => {
            let mut conforming: Option<Bounds> = None;
            let mut schema = Schema::default();
            for item in &manifest.items {
                let info = &item.source.info;
                if let Some(bounds) = &info.bounds {
                    conforming = Some(match conforming {
                        Some(c) => c.union(bounds),
                        None => *bounds,
                    });
                }
                schema = schema.combine(&info.schema, false);
            }
            let conforming = match (config.bounds, conforming) {
                (_, Some(conforming)) => conforming,
                (Some(bounds), None) => bounds,
                (None, None) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "no points found in the configured inputs",
                    ))
                }
            };
            let bounds = config.bounds.unwrap_or_else(|| Bounds::cubeify(&conforming));
            if config.scale.is_some() || config.offset.is_some() {
                schema.set_scale_offset(ScaleOffset {
                    scale: config.scale.unwrap_or([1.0; 3]),
                    offset: config.offset.unwrap_or([0.0; 3]),
                });
            }
            Metadata {
                bounds,
                bounds_conforming: conforming,
                schema,
                srs: config.srs.clone(),
                span: config.span,
                data_type: config.data_type,
                subset: config.subset,
                min_node_size: config.min_node_size,
                max_node_size: config.max_node_size,
                hierarchy_step: 0,
            }
        }
    };

    Ok(Builder::new(endpoints, metadata, manifest, hierarchy))
}

/// Reconstruct a builder from a saved dataset; `subset_id` 0 means the
/// canonical (non-subset) files.
pub fn load(endpoints: Endpoints, subset_id: u32) -> io::Result<Builder> {
    let postfix = if subset_id > 0 {
        format!("-{subset_id}")
    } else {
        String::new()
    };
    let info: EptInfo =
        serde_json::from_slice(&endpoints.output.get(&format!("ept{postfix}.json"))?)?;
    let build: EptBuild =
        serde_json::from_slice(&endpoints.output.get(&format!("ept-build{postfix}.json"))?)?;
    let metadata = Metadata::from_files(info, build);
    let manifest = Manifest::load(&endpoints.sources, &postfix)?;
    let hierarchy = Hierarchy::load(&endpoints.hierarchy, &postfix)?;
    Ok(Builder::new(endpoints, metadata, manifest, hierarchy))
}

/// Create and run in one step.
pub fn run_from_config(config: &BuildConfig) -> io::Result<u64> {
    let mut builder = create(config)?;
    builder.run(config.threads(), config.limit, config.progress_interval)
}

/// Stitch completed subset builds into one canonical dataset.
pub fn merge(endpoints: Endpoints, threads: Threads, force: bool) -> io::Result<()> {
    if !force && endpoints.output.try_get_size("ept.json").is_some() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "completed dataset already exists here: re-run with force to overwrite it",
        ));
    }
    if endpoints.output.try_get_size("ept-1.json").is_none() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "failed to find first subset",
        ));
    }

    info!("initializing");
    let base = load(endpoints.clone(), 1)?;
    let of = base
        .metadata
        .subset
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "first subset has no subset info")
        })?
        .of;

    let mut metadata = base.metadata.clone();
    metadata.subset = None;
    let mut builder = Builder::new(
        endpoints.clone(),
        metadata,
        base.manifest.clone(),
        Hierarchy::new(),
    );

    let stats = Arc::new(CacheStats::default());
    let cache = ChunkCache::new(
        endpoints.clone(),
        Arc::new(builder.metadata.clone()),
        Arc::clone(&builder.hierarchy),
        stats,
        threads.clip.max(1),
    )?;

    info!("merging");
    for id in 1..=of {
        if endpoints.output.try_get_size(&format!("ept-{id}.json")).is_none() {
            info!("\t{id}/{of}: skipping");
            continue;
        }
        info!("\t{id}/{of}: merging");
        let src = load(endpoints.clone(), id)?;
        merge_one(&builder, &src, &cache)?;
        builder.manifest.merge(&src.manifest);
    }

    cache.join();
    builder.save()?;
    info!("done");
    Ok(())
}

/// Fold one subset into the destination. At and beyond the shared depth the
/// subsets own disjoint subtrees, so their counts (and data files, already
/// canonically named) transfer directly; above it their points stream
/// through the cache exactly like fresh inserts.
fn merge_one(dst: &Builder, src: &Builder, cache: &ChunkCache) -> io::Result<()> {
    let shared_depth = src.metadata.shared_depth();
    let src_postfix = src.metadata.postfix();
    let metadata = cache.metadata();
    let layout = Arc::clone(cache.layout());
    let start_depth = metadata.start_depth();

    let mut clipper = Clipper::new(cache);
    for (id, count) in src.hierarchy.snapshot() {
        if count == 0 {
            continue;
        }
        if id.d >= shared_depth {
            assert!(
                dst.hierarchy.get(id).is_none(),
                "subsets overlap at {id}, which should be disjoint"
            );
            dst.hierarchy.set(id, count);
            continue;
        }

        let filename = format!("{id}{src_postfix}{}", metadata.data_type.extension());
        let bytes = cache.endpoints().data.get(&filename)?;
        let table = crate::codec::decode(metadata.data_type, &layout.schema, &bytes)?;
        if table.len() != count {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "subset chunk {filename} holds {} points, hierarchy says {count}",
                    table.len()
                ),
            ));
        }
        for record in table.iter() {
            let mut voxel = Voxel::from_record(&layout, record);
            let mut key = Key::new(metadata.bounds);
            key.init(voxel.point, start_depth + id.d);
            let ck = ChunkKey::init(metadata.bounds, voxel.point, id.d);
            debug_assert_eq!(ck.dxyz(), id);
            cache.insert(&mut voxel, &mut key, ck, &mut clipper);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, DataType};
    use crate::endpoints::test_support::test_root;
    use crate::key::Dxyz;
    use crate::manifest::SourceInfo;
    use glam::DVec3;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use std::path::Path;

    fn write_source(dir: &Path, name: &str, rows: &[[f64; 3]]) -> String {
        let mut text = String::new();
        for row in rows {
            text.push_str(&format!("{} {} {}\n", row[0], row[1], row[2]));
        }
        let path = dir.join(name);
        std::fs::write(&path, text).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn unit_cube() -> Bounds {
        Bounds::new(DVec3::ZERO, DVec3::splat(8.0))
    }

    fn test_config(out: &Path, input: Vec<String>) -> BuildConfig {
        BuildConfig {
            input,
            output: out.to_string_lossy().into_owned(),
            bounds: Some(unit_cube()),
            span: 8,
            threads: Some(crate::config::ThreadSpec::Split { work: 2, clip: 2 }),
            progress_interval: 0,
            min_node_size: 4_096,
            max_node_size: 1_000_000,
            ..Default::default()
        }
    }

    fn load_hierarchy(out: &Path, postfix: &str) -> Hierarchy {
        let endpoints = Endpoints::new(out.to_path_buf(), None);
        Hierarchy::load(&endpoints.hierarchy, postfix).unwrap()
    }

    fn decode_chunk(out: &Path, name: &str, schema: &Schema) -> crate::voxel::PointTable {
        let endpoints = Endpoints::new(out.to_path_buf(), None);
        let bytes = endpoints.data.get(name).unwrap();
        codec::decode(DataType::Binary, schema, &bytes).unwrap()
    }

    fn octant_midpoints() -> Vec<[f64; 3]> {
        let mut rows = Vec::new();
        for z in [2.0, 6.0] {
            for y in [2.0, 6.0] {
                for x in [2.0, 6.0] {
                    rows.push([x, y, z]);
                }
            }
        }
        rows
    }

    #[test]
    fn scenario_root_fit() {
        let root = test_root("builder-root-fit");
        let out = root.join("out");
        let input = write_source(&root, "cloud.xyz", &octant_midpoints());

        let config = test_config(&out, vec![input]);
        let inserted = run_from_config(&config).unwrap();
        assert_eq!(inserted, 8);

        let hierarchy = load_hierarchy(&out, "");
        let snapshot = hierarchy.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(&Dxyz::new(0, 0, 0, 0)), Some(&8));

        let ept: EptInfo = serde_json::from_slice(
            &Endpoints::new(out.clone(), None).output.get("ept.json").unwrap(),
        )
        .unwrap();
        assert_eq!(ept.points, 8);
        assert_eq!(ept.span, 8);
        assert_eq!(ept.start_depth, 3);

        let table = decode_chunk(&out, "0-0-0-0.bin", &ept.schema.absolute());
        assert_eq!(table.len(), 8);

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn scenario_overflow_and_split() {
        let root = test_root("builder-overflow");
        let out = root.join("out");

        // 20k uniform points confined to the +x+y+z octant.
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let rows: Vec<[f64; 3]> = (0..20_000)
            .map(|_| {
                [
                    rng.gen_range(4.0..8.0),
                    rng.gen_range(4.0..8.0),
                    rng.gen_range(4.0..8.0),
                ]
            })
            .collect();
        let input = write_source(&root, "cloud.xyz", &rows);

        let mut config = test_config(&out, vec![input]);
        config.min_node_size = 4_096;
        config.max_node_size = 8_192;
        let inserted = run_from_config(&config).unwrap();
        assert_eq!(inserted, 20_000);

        let hierarchy = load_hierarchy(&out, "");
        let snapshot = hierarchy.snapshot();
        assert_eq!(snapshot.len(), 2, "expected root plus one split child");

        let root_count = *snapshot.get(&Dxyz::new(0, 0, 0, 0)).unwrap();
        let child_count = *snapshot.get(&Dxyz::new(1, 1, 1, 1)).unwrap();
        assert!(root_count <= 8_192);
        assert_eq!(root_count + child_count, 20_000);

        // Spatial containment: every persisted child point lies in the
        // child's bounds.
        let ept: EptInfo = serde_json::from_slice(
            &Endpoints::new(out.clone(), None).output.get("ept.json").unwrap(),
        )
        .unwrap();
        let abs = ept.schema.absolute();
        let layout = crate::schema::Layout::new(&abs).unwrap();
        let child_bounds = unit_cube().octant(0b111);
        let table = decode_chunk(&out, "1-1-1-1.bin", &abs);
        assert_eq!(table.len(), child_count);
        for record in table.iter() {
            assert!(child_bounds.contains(layout.point(record)));
        }

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn scenario_subset() {
        let root = test_root("builder-subset");
        let out = root.join("out");
        let input = write_source(
            &root,
            "cloud.xyz",
            &[[1.0, 1.0, 1.0], [5.0, 1.0, 1.0], [1.0, 5.0, 1.0], [5.0, 5.0, 5.0]],
        );

        let mut config = test_config(&out, vec![input]);
        config.subset = Some(crate::metadata::Subset { id: 2, of: 4 });
        let inserted = run_from_config(&config).unwrap();
        assert_eq!(inserted, 1, "only the +x -y quadrant point belongs to subset 2");

        let endpoints = Endpoints::new(out.clone(), None);
        assert!(endpoints.output.try_get_size("ept-2.json").is_some());
        assert!(endpoints.output.try_get_size("ept-build-2.json").is_some());
        assert!(endpoints.output.try_get_size("ept.json").is_none());
        // Subset manifests are one aggregate blob.
        assert!(endpoints.sources.try_get_size("manifest-2.json").is_some());
        assert!(endpoints.sources.try_get_size("0-cloud.json").is_none());
        // Chunks above the shared depth carry the subset postfix.
        assert!(endpoints.data.try_get_size("0-0-0-0-2.bin").is_some());

        let hierarchy = load_hierarchy(&out, "-2");
        assert_eq!(hierarchy.total_points(), 1);

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn scenario_resume() {
        let root = test_root("builder-resume");
        let out = root.join("out");
        let first = write_source(&root, "a.xyz", &[[0.5, 0.5, 0.5], [7.0, 7.0, 7.0]]);
        let second = write_source(&root, "b.xyz", &[[3.0, 3.0, 3.0], [4.0, 4.0, 4.0]]);

        let config = test_config(&out, vec![first.clone()]);
        assert_eq!(run_from_config(&config).unwrap(), 2);

        // Second run: same output, one extra input, force off.
        let config = test_config(&out, vec![first, second]);
        let mut builder = create(&config).unwrap();
        assert_eq!(builder.manifest.len(), 2);
        assert!(builder.manifest.items[0].inserted);
        assert!(!builder.manifest.items[1].inserted);

        let inserted = builder
            .run(config.threads(), config.limit, config.progress_interval)
            .unwrap();
        assert_eq!(inserted, 2, "only the new source is ingested");

        let hierarchy = load_hierarchy(&out, "");
        assert_eq!(hierarchy.total_points(), 4);
        let loaded = Manifest::load(&Endpoints::new(out.clone(), None).sources, "").unwrap();
        assert!(loaded.is_settled());
        assert_eq!(loaded.len(), 2);

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn scenario_failing_source() {
        let root = test_root("builder-failing");
        let out = root.join("out");
        let good_a = write_source(&root, "a.xyz", &[[1.0, 1.0, 1.0], [2.0, 2.0, 2.0]]);
        let good_b = write_source(&root, "b.xyz", &[[5.0, 5.0, 5.0], [6.0, 6.0, 6.0]]);
        let missing = root.join("gone.xyz").to_string_lossy().into_owned();

        // The unreadable source claims points so it gets scheduled.
        let item = |path: &str| {
            BuildItem::new(Source {
                path: path.to_string(),
                info: SourceInfo {
                    bounds: Some(unit_cube()),
                    points: 2,
                    schema: Schema::xyz(),
                    ..Default::default()
                },
            })
        };
        let manifest = Manifest::new(vec![item(&good_a), item(&missing), item(&good_b)]);
        let metadata = Metadata {
            bounds: unit_cube(),
            bounds_conforming: unit_cube(),
            schema: Schema::xyz(),
            srs: None,
            span: 8,
            data_type: DataType::Binary,
            subset: None,
            min_node_size: 4_096,
            max_node_size: 1_000_000,
            hierarchy_step: 0,
        };
        let mut builder = Builder::new(
            Endpoints::new(out.clone(), None),
            metadata,
            manifest,
            Hierarchy::new(),
        );

        let inserted = builder
            .run(Threads { work: 2, clip: 2 }, 0, 0)
            .unwrap();
        assert_eq!(inserted, 4, "counter covers only the readable sources");

        assert!(builder.manifest.is_settled());
        assert!(builder.manifest.items[0].source.info.errors.is_empty());
        assert!(!builder.manifest.items[1].source.info.errors.is_empty());
        assert!(builder.manifest.items[2].source.info.errors.is_empty());
        assert_eq!(builder.hierarchy.total_points(), 4);

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn scenario_merge() {
        let root = test_root("builder-merge");
        let out = root.join("out");
        let input = write_source(
            &root,
            "cloud.xyz",
            &[
                [1.0, 1.0, 1.0],
                [2.0, 2.0, 6.0],
                [5.0, 1.0, 1.0],
                [6.0, 2.0, 6.0],
                [1.0, 5.0, 1.0],
                [2.0, 6.0, 6.0],
                [5.0, 5.0, 1.0],
                [6.0, 6.0, 6.0],
            ],
        );

        let mut total = 0;
        for id in 1..=4 {
            let mut config = test_config(&out, vec![input.clone()]);
            config.subset = Some(crate::metadata::Subset { id, of: 4 });
            total += run_from_config(&config).unwrap();
        }
        assert_eq!(total, 8, "subsets partition the input");

        let endpoints = Endpoints::new(out.clone(), None);
        merge(endpoints.clone(), Threads { work: 1, clip: 2 }, false).unwrap();

        let ept: EptInfo =
            serde_json::from_slice(&endpoints.output.get("ept.json").unwrap()).unwrap();
        assert_eq!(ept.points, 8);

        let hierarchy = load_hierarchy(&out, "");
        assert_eq!(hierarchy.total_points(), 8);
        // The merged root chunk is canonically named.
        let table = decode_chunk(&out, "0-0-0-0.bin", &ept.schema.absolute());
        assert_eq!(table.len(), hierarchy.get(Dxyz::new(0, 0, 0, 0)).unwrap());

        let manifest = Manifest::load(&endpoints.sources, "").unwrap();
        assert!(manifest.is_settled());

        // Re-running without force refuses to clobber the finished dataset.
        let err = merge(endpoints, Threads { work: 1, clip: 2 }, false).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn nearest_point_wins_the_voxel() {
        let root = test_root("builder-nearest");
        let out = root.join("out");
        // Same integer voxel at span 8; the second point is closer to the
        // chunk mid and must displace the first into overflow.
        let input = write_source(&root, "cloud.xyz", &[[2.1, 2.1, 2.1], [2.9, 2.9, 2.9]]);

        let config = test_config(&out, vec![input]);
        assert_eq!(run_from_config(&config).unwrap(), 2);

        let hierarchy = load_hierarchy(&out, "");
        assert_eq!(hierarchy.total_points(), 2);

        let ept: EptInfo = serde_json::from_slice(
            &Endpoints::new(out.clone(), None).output.get("ept.json").unwrap(),
        )
        .unwrap();
        let abs = ept.schema.absolute();
        let layout = crate::schema::Layout::new(&abs).unwrap();
        let table = decode_chunk(&out, "0-0-0-0.bin", &abs);
        // Grid points serialize before overflow points.
        let first = layout.point(table.iter().next().unwrap());
        assert_eq!(first, DVec3::new(2.9, 2.9, 2.9));

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn identical_points_cascade_when_min_equals_max() {
        let root = test_root("builder-min-eq-max");
        let out = root.join("out");
        // Ten coincident points: every voxel collides at every depth, so
        // with min == max the first full bucket splits immediately.
        let rows: Vec<[f64; 3]> = (0..10).map(|_| [5.5, 5.5, 5.5]).collect();
        let input = write_source(&root, "cloud.xyz", &rows);

        let mut config = test_config(&out, vec![input]);
        config.min_node_size = 4;
        config.max_node_size = 4;
        assert_eq!(run_from_config(&config).unwrap(), 10);

        let hierarchy = load_hierarchy(&out, "");
        assert_eq!(hierarchy.total_points(), 10, "no duplicates lost or gained");
        assert!(hierarchy.len() > 1, "threshold must force at least one split");

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn limit_bounds_scheduled_files() {
        let root = test_root("builder-limit");
        let out = root.join("out");
        let a = write_source(&root, "a.xyz", &[[1.0, 1.0, 1.0]]);
        let b = write_source(&root, "b.xyz", &[[6.0, 6.0, 6.0]]);

        let mut config = test_config(&out, vec![a, b]);
        config.limit = 1;
        let mut builder = create(&config).unwrap();
        let inserted = builder
            .run(config.threads(), config.limit, config.progress_interval)
            .unwrap();

        assert_eq!(inserted, 1);
        assert_eq!(
            builder.manifest.items.iter().filter(|i| i.inserted).count(),
            1
        );

        // A single-point source produces exactly one root chunk.
        let hierarchy = load_hierarchy(&out, "");
        assert_eq!(hierarchy.snapshot().len(), 1);
        assert_eq!(hierarchy.get(Dxyz::new(0, 0, 0, 0)), Some(1));

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn empty_source_settles_without_error() {
        let root = test_root("builder-empty-source");
        let out = root.join("out");
        let empty = root.join("empty.xyz");
        std::fs::write(&empty, "").unwrap();
        let real = write_source(&root, "a.xyz", &[[1.0, 1.0, 1.0]]);

        let config = test_config(
            &out,
            vec![empty.to_string_lossy().into_owned(), real],
        );
        let mut builder = create(&config).unwrap();
        assert_eq!(builder.manifest.len(), 2);
        let empty_item = &builder.manifest.items[0];
        assert!(empty_item.inserted);
        assert!(empty_item.source.info.errors.is_empty());

        let inserted = builder
            .run(config.threads(), config.limit, config.progress_interval)
            .unwrap();
        assert_eq!(inserted, 1);
        assert!(builder.manifest.is_settled());

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn save_is_idempotent() {
        let root = test_root("builder-idempotent");
        let out = root.join("out");
        let input = write_source(&root, "cloud.xyz", &octant_midpoints());

        let config = test_config(&out, vec![input]);
        let mut builder = create(&config).unwrap();
        builder
            .run(config.threads(), config.limit, config.progress_interval)
            .unwrap();

        let read = |name: &str| std::fs::read(out.join(name)).unwrap();
        let ept = read("ept.json");
        let build = read("ept-build.json");
        let hierarchy = read("ept-hierarchy/0-0-0-0.json");
        let manifest = read("ept-sources/manifest.json");
        let chunk = read("ept-data/0-0-0-0.bin");

        builder.save().unwrap();
        assert_eq!(read("ept.json"), ept);
        assert_eq!(read("ept-build.json"), build);
        assert_eq!(read("ept-hierarchy/0-0-0-0.json"), hierarchy);
        assert_eq!(read("ept-sources/manifest.json"), manifest);
        assert_eq!(read("ept-data/0-0-0-0.bin"), chunk);

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn chunk_round_trip_through_reload() {
        let root = test_root("builder-reload");
        let out = root.join("out");
        let first = write_source(&root, "a.xyz", &octant_midpoints());

        let config = test_config(&out, vec![first.clone()]);
        assert_eq!(run_from_config(&config).unwrap(), 8);

        // A second run touching the same chunk must reload the persisted
        // points and keep them alongside the new one.
        let second = write_source(&root, "b.xyz", &[[3.0, 3.0, 3.0]]);
        let config = test_config(&out, vec![first, second]);
        assert_eq!(run_from_config(&config).unwrap(), 1);

        let hierarchy = load_hierarchy(&out, "");
        assert_eq!(hierarchy.total_points(), 9);

        let ept: EptInfo = serde_json::from_slice(
            &Endpoints::new(out.clone(), None).output.get("ept.json").unwrap(),
        )
        .unwrap();
        let table = decode_chunk(&out, "0-0-0-0.bin", &ept.schema.absolute());
        assert_eq!(table.len(), 9);

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn commify_groups_digits() {
        assert_eq!(commify(0), "0");
        assert_eq!(commify(999), "999");
        assert_eq!(commify(1_000), "1,000");
        assert_eq!(commify(1_234_567), "1,234,567");
    }

    #[test]
    fn format_time_is_hms() {
        assert_eq!(format_time(0), "00:00:00");
        assert_eq!(format_time(61), "00:01:01");
        assert_eq!(format_time(3_725), "01:02:05");
    }


    #[test]
    fn stats_fold_into_dataset_schema() {
        let root = test_root("builder-stats-fold");
        let out = root.join("out");
        let input = write_source(&root, "cloud.xyz", &[[1.0, 2.0, 3.0], [3.0, 4.0, 5.0]]);

        let config = test_config(&out, vec![input]);
        run_from_config(&config).unwrap();

        let ept: EptInfo = serde_json::from_slice(
            &Endpoints::new(out.clone(), None).output.get("ept.json").unwrap(),
        )
        .unwrap();
        assert!(ept.schema.has_stats());
        let x = ept.schema.dims[0].stats.unwrap();
        assert_eq!((x.minimum, x.maximum, x.mean, x.count), (1.0, 3.0, 2.0, 2));

        let _ = std::fs::remove_dir_all(root);
    }
}

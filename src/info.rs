use crate::endpoints::Arbiter;
use crate::manifest::{Source, SourceInfo};
use crate::pipeline::{self, StatsFilter, STAGE_STATS};
use crate::pool::Pool;
use crate::spatial::Bounds;
use glam::DVec3;
use log::{debug, info};
use serde_json::Value;
use std::path::Path;
use std::sync::mpsc;

/// Analyze one input: stream it through its reader pipeline and report
/// bounds, point count and schema. `deep` also accumulates full
/// per-dimension statistics.
pub fn analyze_one(
    path: &str,
    template: &[Value],
    deep: bool,
    tmp: &Path,
    arbiter: &Arbiter,
) -> std::io::Result<SourceInfo> {
    let handle = arbiter.localize(path, tmp)?;
    let local = handle.local_path().to_string_lossy().into_owned();

    let mut run_pipeline = pipeline::for_file(template, &local);
    if deep {
        pipeline::find_or_append_stage(&mut run_pipeline, STAGE_STATS);
    }

    let mut reader = pipeline::make_reader(&run_pipeline)?;
    let mut schema = reader.schema().clone();
    let width = schema.dims.len();
    let (xi, yi, zi) = (
        schema.index_of(crate::schema::DIM_X).unwrap_or(0),
        schema.index_of(crate::schema::DIM_Y).unwrap_or(1),
        schema.index_of(crate::schema::DIM_Z).unwrap_or(2),
    );

    let mut stats = deep.then(|| StatsFilter::new(width));
    let mut bounds = Bounds::everted();
    let mut points = 0u64;
    while let Some(batch) = reader.next_batch()? {
        for row in &batch {
            bounds.grow(DVec3::new(row[xi], row[yi], row[zi]));
            if let Some(stats) = &mut stats {
                stats.update(row);
            }
        }
        points += batch.len() as u64;
    }

    if let Some(stats) = &stats {
        stats.harvest(&mut schema);
    }

    Ok(SourceInfo {
        bounds: (points > 0).then_some(bounds),
        points,
        schema,
        pipeline: template.to_vec(),
        srs: None,
        errors: Vec::new(),
    })
}

/// Analyze inputs in parallel. Per-source failures are captured into that
/// source's error list (with zero points), never propagated.
pub fn analyze(
    inputs: &[String],
    template: &[Value],
    deep: bool,
    tmp: &Path,
    arbiter: &Arbiter,
    threads: usize,
) -> Vec<Source> {
    if inputs.is_empty() {
        return Vec::new();
    }
    info!("analyzing {} inputs", inputs.len());

    let pool = Pool::new(threads.min(inputs.len()).max(1));
    let (tx, rx) = mpsc::channel::<(usize, Source)>();

    for (index, path) in inputs.iter().enumerate() {
        let tx = tx.clone();
        let path = path.clone();
        let template = template.to_vec();
        let tmp = tmp.to_path_buf();
        let arbiter = arbiter.clone();
        pool.add(move || {
            let info = match analyze_one(&path, &template, deep, &tmp, &arbiter) {
                Ok(info) => {
                    debug!("analyzed {path}: {} points", info.points);
                    info
                }
                Err(e) => SourceInfo {
                    pipeline: template,
                    errors: vec![e.to_string()],
                    ..Default::default()
                },
            };
            let _ = tx.send((index, Source { path, info }));
        });
    }
    drop(tx);
    pool.join();

    let mut sources: Vec<Option<Source>> = (0..inputs.len()).map(|_| None).collect();
    for (index, source) in rx {
        sources[index] = Some(source);
    }
    sources
        .into_iter()
        .map(|s| s.expect("every analysis task reports"))
        .collect()
}

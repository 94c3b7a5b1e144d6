use crate::schema::{Dimension, DimensionStats, DimType, Schema};
use log::debug;
use serde_json::{json, Map, Value};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::sync::Mutex;

/// Rows handed out per reader batch.
pub const BATCH_SIZE: usize = 4096;

pub const STAGE_STATS: &str = "filters.stats";
pub const STAGE_REPROJECTION: &str = "filters.reprojection";
pub const READER_TEXT: &str = "readers.text";

// Reader construction funnels through one lock; reader backends are not
// guaranteed to have thread-safe initialization.
static PIPELINE_MUTEX: Mutex<()> = Mutex::new(());

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

pub fn stage_type(stage: &Value) -> Option<&str> {
    stage.get("type").and_then(Value::as_str)
}

pub fn find_stage<'a>(pipeline: &'a [Value], ty: &str) -> Option<&'a Value> {
    pipeline.iter().find(|stage| stage_type(stage) == Some(ty))
}

pub fn find_or_append_stage<'a>(pipeline: &'a mut Vec<Value>, ty: &str) -> &'a mut Value {
    let at = match pipeline
        .iter()
        .position(|stage| stage_type(stage) == Some(ty))
    {
        Some(at) => at,
        None => {
            pipeline.push(json!({ "type": ty }));
            pipeline.len() - 1
        }
    };
    &mut pipeline[at]
}

pub fn omit_stage(mut pipeline: Vec<Value>, ty: &str) -> Vec<Value> {
    pipeline.retain(|stage| stage_type(stage) != Some(ty));
    pipeline
}

/// The default single-stage template: one reader whose type is inferred from
/// the filename.
pub fn default_template() -> Vec<Value> {
    vec![json!({})]
}

/// Reject reader-less, non-linear, or unknown pipelines up front; these are
/// configuration errors, not per-source ones.
pub fn validate(pipeline: &[Value]) -> io::Result<()> {
    if pipeline.is_empty() {
        return Err(invalid("pipeline has no stages".to_string()));
    }
    for (i, stage) in pipeline.iter().enumerate() {
        let Some(object) = stage.as_object() else {
            return Err(invalid(format!("pipeline stage {i} is not an object")));
        };
        if let Some(inputs) = object.get("inputs") {
            if inputs.as_array().map(|a| a.len()).unwrap_or(2) > 1 {
                return Err(invalid("pipeline must be linear".to_string()));
            }
        }
        match stage_type(stage) {
            None if i == 0 => {} // reader inferred from the filename
            None => return Err(invalid(format!("pipeline stage {i} has no type"))),
            Some(ty) if i == 0 => {
                if !ty.starts_with("readers.") {
                    return Err(invalid(format!(
                        "pipeline must start with a reader, got {ty:?}"
                    )));
                }
            }
            Some(ty) => {
                if !ty.starts_with("filters.") {
                    return Err(invalid(format!(
                        "pipeline stage {i} must be a filter, got {ty:?}"
                    )));
                }
                if ty != STAGE_STATS && ty != STAGE_REPROJECTION {
                    return Err(invalid(format!("unsupported filter stage {ty:?}")));
                }
            }
        }
    }
    Ok(())
}

/// Clone the configured template and point its reader at `filename`.
pub fn for_file(template: &[Value], filename: &str) -> Vec<Value> {
    let mut pipeline: Vec<Value> = if template.is_empty() {
        default_template()
    } else {
        template.to_vec()
    };
    if let Some(stage) = pipeline[0].as_object_mut() {
        stage.insert("filename".to_string(), Value::String(filename.to_string()));
    } else {
        let mut stage = Map::new();
        stage.insert("filename".to_string(), Value::String(filename.to_string()));
        pipeline[0] = Value::Object(stage);
    }
    pipeline
}

/// A decoded source: a schema plus batches of rows in schema dimension
/// order.
pub trait PointReader: Send {
    fn schema(&self) -> &Schema;
    fn next_batch(&mut self) -> io::Result<Option<Vec<Vec<f64>>>>;
}

/// Construct the reader described by the pipeline's first stage. Validation
/// and construction happen under the process-wide pipeline lock.
pub fn make_reader(pipeline: &[Value]) -> io::Result<Box<dyn PointReader>> {
    let _guard = PIPELINE_MUTEX.lock().expect("pipeline lock poisoned");
    validate(pipeline)?;

    let first = &pipeline[0];
    let filename = first
        .get("filename")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("reader stage has no filename".to_string()))?;
    let ty = match stage_type(first) {
        Some(ty) => ty.to_string(),
        None => infer_reader(filename)?,
    };

    if find_stage(pipeline, STAGE_REPROJECTION).is_some() {
        debug!("reprojection stage present; handled by the external filter pipeline");
    }

    match ty.as_str() {
        READER_TEXT => Ok(Box::new(TextReader::open(Path::new(filename))?)),
        other => Err(invalid(format!("no reader for stage type {other:?}"))),
    }
}

fn infer_reader(filename: &str) -> io::Result<String> {
    let lower = filename.to_ascii_lowercase();
    if lower.ends_with(".txt") || lower.ends_with(".xyz") || lower.ends_with(".csv") {
        return Ok(READER_TEXT.to_string());
    }
    Err(invalid(format!("cannot infer a reader for {filename:?}")))
}

/// Whitespace/comma separated text. An optional non-numeric first line names
/// the dimensions; otherwise the columns are X Y Z followed by anonymous
/// extras.
pub struct TextReader {
    schema: Schema,
    lines: std::io::Lines<BufReader<File>>,
    pending: Option<Vec<f64>>,
    line_no: u64,
}

impl TextReader {
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut lines = BufReader::new(File::open(path)?).lines();

        let mut pending = None;
        let mut names: Option<Vec<String>> = None;
        let mut line_no = 0u64;
        for line in lines.by_ref() {
            let line = line?;
            line_no += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match parse_row(trimmed) {
                Some(row) => pending = Some(row),
                None => {
                    names = Some(
                        trimmed
                            .split(|c: char| c.is_whitespace() || c == ',')
                            .filter(|t| !t.is_empty())
                            .map(str::to_string)
                            .collect(),
                    )
                }
            }
            break;
        }

        let width = match (&names, &pending) {
            (Some(names), _) => names.len(),
            (None, Some(row)) => row.len(),
            (None, None) => 3, // empty source; shape does not matter
        };
        if width < 3 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: expected at least X Y Z columns", path.display()),
            ));
        }

        let dims = match names {
            Some(names) => names
                .into_iter()
                .map(|name| Dimension::new(&name, DimType::Float64))
                .collect(),
            None => {
                let mut dims = Schema::xyz().dims;
                for extra in 3..width {
                    dims.push(Dimension::new(&format!("Dim{extra}"), DimType::Float64));
                }
                dims
            }
        };

        Ok(Self {
            schema: Schema::new(dims),
            lines,
            pending,
            line_no,
        })
    }
}

fn parse_row(line: &str) -> Option<Vec<f64>> {
    let mut row = Vec::new();
    for token in line.split(|c: char| c.is_whitespace() || c == ',') {
        if token.is_empty() {
            continue;
        }
        row.push(token.parse::<f64>().ok()?);
    }
    if row.is_empty() {
        None
    } else {
        Some(row)
    }
}

impl PointReader for TextReader {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn next_batch(&mut self) -> io::Result<Option<Vec<Vec<f64>>>> {
        let width = self.schema.dims.len();
        let mut batch = Vec::with_capacity(BATCH_SIZE);
        if let Some(row) = self.pending.take() {
            if row.len() != width {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("line {}: expected {width} values", self.line_no),
                ));
            }
            batch.push(row);
        }
        while batch.len() < BATCH_SIZE {
            let Some(line) = self.lines.next() else {
                break;
            };
            let line = line?;
            self.line_no += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let row = parse_row(trimmed).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("line {}: malformed row", self.line_no),
                )
            })?;
            if row.len() != width {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "line {}: expected {width} values, got {}",
                        self.line_no,
                        row.len()
                    ),
                ));
            }
            batch.push(row);
        }
        if batch.is_empty() {
            Ok(None)
        } else {
            Ok(Some(batch))
        }
    }
}

/// Accumulates per-dimension minimum / maximum / mean / count during a scan.
#[derive(Clone, Debug)]
pub struct StatsFilter {
    sums: Vec<f64>,
    mins: Vec<f64>,
    maxs: Vec<f64>,
    count: u64,
}

impl StatsFilter {
    pub fn new(width: usize) -> Self {
        Self {
            sums: vec![0.0; width],
            mins: vec![f64::MAX; width],
            maxs: vec![f64::MIN; width],
            count: 0,
        }
    }

    pub fn update(&mut self, row: &[f64]) {
        for (i, &v) in row.iter().enumerate() {
            self.sums[i] += v;
            self.mins[i] = self.mins[i].min(v);
            self.maxs[i] = self.maxs[i].max(v);
        }
        self.count += 1;
    }

    /// Write the accumulated stats onto the matching dimensions.
    pub fn harvest(&self, schema: &mut Schema) {
        if self.count == 0 {
            return;
        }
        for (i, dim) in schema.dims.iter_mut().enumerate().take(self.sums.len()) {
            dim.stats = Some(DimensionStats {
                minimum: self.mins[i],
                maximum: self.maxs[i],
                mean: self.sums[i] / self.count as f64,
                count: self.count,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoints::test_support::test_root;

    fn write_source(dir: &Path, name: &str, contents: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn text_reader_parses_header_and_rows() {
        let root = test_root("pipeline-text");
        let path = write_source(&root, "cloud.xyz", "X Y Z Intensity\n1 2 3 40\n4,5,6,70\n");

        let mut reader = make_reader(&for_file(&default_template(), &path)).unwrap();
        assert_eq!(reader.schema().dims.len(), 4);
        assert_eq!(reader.schema().dims[3].name, "Intensity");

        let batch = reader.next_batch().unwrap().unwrap();
        assert_eq!(batch, vec![vec![1.0, 2.0, 3.0, 40.0], vec![4.0, 5.0, 6.0, 70.0]]);
        assert!(reader.next_batch().unwrap().is_none());
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn text_reader_defaults_to_xyz_without_header() {
        let root = test_root("pipeline-headerless");
        let path = write_source(&root, "cloud.txt", "1 2 3\n4 5 6\n");
        let mut reader = make_reader(&for_file(&default_template(), &path)).unwrap();
        assert_eq!(reader.schema().dims[0].name, "X");
        assert_eq!(reader.next_batch().unwrap().unwrap().len(), 2);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn text_reader_rejects_ragged_rows() {
        let root = test_root("pipeline-ragged");
        let path = write_source(&root, "cloud.xyz", "1 2 3\n4 5\n");
        let mut reader = make_reader(&for_file(&default_template(), &path)).unwrap();
        assert!(reader.next_batch().is_err());
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn validation_rejects_broken_pipelines() {
        assert!(validate(&[]).is_err());
        assert!(validate(&[json!({"type": "filters.stats"})]).is_err());
        assert!(validate(&[json!({}), json!({"type": "filters.crop"})]).is_err());
        assert!(validate(&[json!({}), json!({"type": "readers.text"})]).is_err());
        assert!(validate(&[json!({}), json!({"type": "filters.stats"})]).is_ok());
    }

    #[test]
    fn find_or_append_stage_is_idempotent() {
        let mut pipeline = default_template();
        find_or_append_stage(&mut pipeline, STAGE_STATS)
            .as_object_mut()
            .unwrap()
            .insert("enumerate".to_string(), json!("Classification"));
        find_or_append_stage(&mut pipeline, STAGE_STATS);
        assert_eq!(pipeline.len(), 2);
        assert!(find_stage(&pipeline, STAGE_STATS)
            .unwrap()
            .get("enumerate")
            .is_some());
        assert_eq!(omit_stage(pipeline, STAGE_STATS).len(), 1);
    }

    #[test]
    fn stats_filter_accumulates() {
        let mut stats = StatsFilter::new(3);
        stats.update(&[0.0, 10.0, -1.0]);
        stats.update(&[2.0, 20.0, 1.0]);
        let mut schema = Schema::xyz();
        stats.harvest(&mut schema);
        let s = schema.dims[0].stats.unwrap();
        assert_eq!((s.minimum, s.maximum, s.mean, s.count), (0.0, 2.0, 1.0, 2));
        assert!(schema.has_stats());
    }
}

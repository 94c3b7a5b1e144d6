use log::warn;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Transient storage failures are retried this many times before surfacing
/// as fatal.
pub const DEFAULT_TRIES: u32 = 8;

static TMP_SERIAL: AtomicU64 = AtomicU64::new(0);

/// Dereferences URI-ish path strings. Only the local filesystem is wired in;
/// remote schemes are rejected here so the rest of the crate stays
/// scheme-agnostic.
#[derive(Clone, Debug, Default)]
pub struct Arbiter;

impl Arbiter {
    pub fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        if let Some(rest) = path.strip_prefix("file://") {
            return Ok(PathBuf::from(rest));
        }
        if path.contains("://") {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported storage scheme in {path:?}"),
            ));
        }
        Ok(PathBuf::from(path))
    }

    /// A local file handle for `path`. Local paths are borrowed in place;
    /// a remote arbiter would download into `tmp` and hand back an owning
    /// handle that cleans up on drop.
    pub fn localize(&self, path: &str, _tmp: &Path) -> io::Result<LocalHandle> {
        let local = self.resolve(path)?;
        if !local.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such file: {}", local.display()),
            ));
        }
        Ok(LocalHandle {
            path: local,
            owned: false,
        })
    }

    /// Expand an input specifier: directories (and `dir/*`) enumerate their
    /// files in sorted order, anything else passes through untouched.
    pub fn expand(&self, input: &str) -> io::Result<Vec<String>> {
        let listed = |dir: PathBuf| -> io::Result<Vec<String>> {
            let mut paths: Vec<String> = fs::read_dir(dir)?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .filter(|entry| entry.path().is_file())
                .map(|entry| entry.path().to_string_lossy().into_owned())
                .collect();
            paths.sort();
            Ok(paths)
        };

        if let Some(dir) = input.strip_suffix("/*") {
            return listed(self.resolve(dir)?);
        }
        let path = self.resolve(input)?;
        if path.is_dir() {
            return listed(path);
        }
        Ok(vec![input.to_string()])
    }
}

/// A readable local path, possibly a temporary copy of remote data.
#[derive(Debug)]
pub struct LocalHandle {
    path: PathBuf,
    owned: bool,
}

impl LocalHandle {
    pub fn local_path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LocalHandle {
    fn drop(&mut self) {
        if self.owned {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// One named prefix on the output store. All access retries with doubling
/// backoff; writes go through a temp file and rename so readers never see a
/// torn file.
#[derive(Clone, Debug)]
pub struct Endpoint {
    root: PathBuf,
}

impl Endpoint {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sub(&self, name: &str) -> Endpoint {
        Endpoint::new(self.root.join(name))
    }

    pub fn full_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn with_retry<T>(
        &self,
        what: &str,
        path: &str,
        mut op: impl FnMut() -> io::Result<T>,
    ) -> io::Result<T> {
        let mut delay = Duration::from_millis(50);
        let mut last = None;
        for attempt in 0..DEFAULT_TRIES {
            match op() {
                Ok(value) => return Ok(value),
                Err(error) if error.kind() == io::ErrorKind::NotFound => return Err(error),
                Err(error) => {
                    if attempt + 1 < DEFAULT_TRIES {
                        warn!("{what} {path:?} failed (attempt {}): {error}", attempt + 1);
                        std::thread::sleep(delay);
                        delay = (delay * 2).min(Duration::from_secs(5));
                    }
                    last = Some(error);
                }
            }
        }
        Err(last.expect("at least one attempt"))
    }

    pub fn get(&self, path: &str) -> io::Result<Vec<u8>> {
        let full = self.full_path(path);
        self.with_retry("get", path, || {
            let mut file = File::open(&full)?;
            let mut out = Vec::new();
            file.read_to_end(&mut out)?;
            Ok(out)
        })
    }

    pub fn get_string(&self, path: &str) -> io::Result<String> {
        let bytes = self.get(path)?;
        String::from_utf8(bytes)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))
    }

    pub fn put(&self, path: &str, data: &[u8]) -> io::Result<()> {
        let full = self.full_path(path);
        self.with_retry("put", path, || {
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)?;
            }
            let serial = TMP_SERIAL.fetch_add(1, Ordering::Relaxed);
            let tmp = full.with_extension(format!("tmp-{}-{serial}", std::process::id()));
            {
                let mut file = File::create(&tmp)?;
                file.write_all(data)?;
                file.sync_all()?;
            }
            fs::rename(&tmp, &full)?;
            Ok(())
        })
    }

    pub fn try_get_size(&self, path: &str) -> Option<u64> {
        fs::metadata(self.full_path(path))
            .ok()
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
    }
}

/// The named prefixes of one dataset plus the arbiter and scratch space.
#[derive(Clone, Debug)]
pub struct Endpoints {
    pub output: Endpoint,
    pub data: Endpoint,
    pub hierarchy: Endpoint,
    pub sources: Endpoint,
    pub tmp: PathBuf,
    pub arbiter: Arbiter,
}

impl Endpoints {
    pub fn new(output: PathBuf, tmp: Option<PathBuf>) -> Self {
        let output = Endpoint::new(output);
        Self {
            data: output.sub("ept-data"),
            hierarchy: output.sub("ept-hierarchy"),
            sources: output.sub("ept-sources"),
            output,
            tmp: tmp.unwrap_or_else(std::env::temp_dir),
            arbiter: Arbiter,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::test_root;
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let root = test_root("endpoint-roundtrip");
        let ep = Endpoint::new(root.clone());
        ep.put("nested/dir/blob.bin", b"payload").unwrap();
        assert_eq!(ep.get("nested/dir/blob.bin").unwrap(), b"payload");
        assert_eq!(ep.try_get_size("nested/dir/blob.bin"), Some(7));
        assert_eq!(ep.try_get_size("missing"), None);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn get_missing_is_not_found_without_retries() {
        let root = test_root("endpoint-missing");
        let ep = Endpoint::new(root.clone());
        let err = ep.get("nope.json").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn arbiter_rejects_remote_schemes_and_expands_dirs() {
        let root = test_root("arbiter");
        std::fs::write(root.join("b.xyz"), "1").unwrap();
        std::fs::write(root.join("a.xyz"), "1").unwrap();

        let arbiter = Arbiter;
        assert!(arbiter.resolve("s3://bucket/cloud.laz").is_err());

        let expanded = arbiter.expand(root.to_str().unwrap()).unwrap();
        assert_eq!(expanded.len(), 2);
        assert!(expanded[0].ends_with("a.xyz"));
        assert!(expanded[1].ends_with("b.xyz"));

        let handle = arbiter.localize(&expanded[0], &root).unwrap();
        assert!(handle.local_path().is_file());
        let _ = fs::remove_dir_all(root);
    }
}

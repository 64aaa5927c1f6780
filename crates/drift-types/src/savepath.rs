use std::path::{Path, PathBuf};

/// Pick a path under `dir` for `requested` that does not collide
/// with anything already on disk.
///
/// `photo.jpg` probes `photo.jpg`, `photo (1).jpg`, `photo (2).jpg`,
/// … in increasing k; names without an extension probe `name (k)`.
/// The probe happens at call time, so callers should invoke this at
/// the moment of the write, not earlier.
pub fn collision_free_path(dir: &Path, requested: &str) -> PathBuf {
    // Strip any directory components a peer may have smuggled in.
    let requested = Path::new(requested)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());

    let candidate = dir.join(&requested);
    if !candidate.exists() {
        return candidate;
    }

    let name = Path::new(&requested);
    let stem = name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| requested.clone());
    let ext = name.extension().map(|e| e.to_string_lossy().into_owned());

    for k in 1u32.. {
        let attempt = match &ext {
            Some(ext) => format!("{stem} ({k}).{ext}"),
            None => format!("{stem} ({k})"),
        };
        let candidate = dir.join(attempt);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("u32 candidate space exhausted");
}

//! ONNX Runtime and CUDA library discovery, run once before any `ort` use.

use std::env;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

const ENV_ORT_DYLIB_PATH: &str = "ORT_DYLIB_PATH";
const ENV_LIB_DIR: &str = "VOLSEG_LIB_DIR";

/// What [`setup_runtime_libs`] resolved, reported once logging is up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeLibs {
    pub ort_dylib: Option<PathBuf>,
    pub ort_dylib_from_env: bool,
    pub preloaded: Vec<PathBuf>,
}

/// Directories searched for runtime libraries, in priority order:
///   1. `$VOLSEG_LIB_DIR`
///   2. `<exe_dir>/` (Windows only)
///   3. `<exe_dir>/lib/`
///   4. `<exe_dir>/../lib/`
///   5. `<cwd>/lib/`
///   6. `/usr/local/lib/`, `/usr/lib/` (Unix only)
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(dir) = env::var_os(ENV_LIB_DIR) {
        dirs.push(PathBuf::from(dir));
    }
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            {
                dirs.push(exe_dir.to_path_buf());
            }
            dirs.push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_lib = cwd.join("lib");
        if !dirs.contains(&cwd_lib) {
            dirs.push(cwd_lib);
        }
    }
    #[cfg(unix)]
    {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Load order for GPU runtime libraries; `None` means "do not preload".
///
/// ORT provider libraries are skipped: they link against `libonnxruntime`,
/// which the `ort` crate loads itself later.
///
///   0: CUDA runtime (cudart, cublas, cublasLt, cufft, curand)
///   1: cuDNN
#[cfg(unix)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if name.starts_with("libcudart")
        || name.starts_with("libcublaslt")
        || name.starts_with("libcublas")
        || name.starts_with("libcufft")
        || name.starts_with("libcurand")
    {
        Some(0)
    } else if name.starts_with("libcudnn") {
        Some(1)
    } else {
        None
    }
}

#[cfg(windows)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if name.starts_with("cudart64_")
        || name.starts_with("cublas64_")
        || name.starts_with("cublaslt64_")
        || name.starts_with("cufft64_")
        || name.starts_with("curand64_")
    {
        Some(0)
    } else if name.starts_with("cudnn64_") || name.starts_with("cudnn_") {
        Some(1)
    } else {
        None
    }
}

/// Collect preloadable libraries from `dirs`, sorted by (priority, name).
///
/// The first directory containing a given file name wins.
fn collect_preload_libs(dirs: &[PathBuf]) -> Vec<PathBuf> {
    use std::collections::HashSet;

    let mut seen_names: HashSet<String> = HashSet::new();
    let mut libs: Vec<(u8, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string();

            if !is_candidate_lib(&name, &path) || !seen_names.insert(name.clone()) {
                continue;
            }
            if let Some(priority) = load_priority(&name) {
                libs.push((priority, name, path));
            }
        }
    }

    libs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    libs.into_iter().map(|(_, _, path)| path).collect()
}

#[cfg(unix)]
fn is_candidate_lib(name: &str, path: &Path) -> bool {
    name.contains(".so") && !path.is_symlink()
}

#[cfg(windows)]
fn is_candidate_lib(_name: &str, path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
}

/// Load with `RTLD_GLOBAL` so ORT's later `dlopen` calls resolve against it.
/// glibc reads `LD_LIBRARY_PATH` only at startup, so absolute paths are used.
#[cfg(unix)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::Library::new(path) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

/// Point `ORT_DYLIB_PATH` at a bundled ONNX Runtime and preload CUDA libraries.
///
/// Call at the very start of `main()`, before tracing and before any ORT use.
pub fn setup_runtime_libs() -> RuntimeLibs {
    let dirs = candidate_lib_dirs();
    let mut resolved = RuntimeLibs::default();

    match env::var_os(ENV_ORT_DYLIB_PATH) {
        Some(path) => {
            resolved.ort_dylib = Some(PathBuf::from(path));
            resolved.ort_dylib_from_env = true;
        }
        None => {
            if let Some(path) = find_ort_dylib_in_dirs(&dirs) {
                env::set_var(ENV_ORT_DYLIB_PATH, &path);
                resolved.ort_dylib = Some(path);
            }
        }
    }

    for lib_path in collect_preload_libs(&dirs) {
        if unsafe { load_library(&lib_path) } {
            resolved.preloaded.push(lib_path);
        }
    }

    resolved
}

/// Log what [`setup_runtime_libs`] found. Call after tracing is initialized.
pub fn log_runtime_lib_status(libs: &RuntimeLibs) {
    match libs.ort_dylib.as_deref() {
        Some(path) if path.is_file() => info!(
            path = %path.display(),
            from_env = libs.ort_dylib_from_env,
            "ORT library resolved"
        ),
        Some(path) => warn!(
            path = %path.display(),
            "ORT_DYLIB_PATH points at a missing file"
        ),
        None => warn!("ORT_DYLIB_PATH not set, ORT will try default search paths"),
    }

    for path in &libs.preloaded {
        debug!(path = %path.display(), "Preloaded runtime library");
    }
}

//! Module path resolution
//!
//! Maps a logical dotted module name (`a.b.c`) onto the filesystem: a
//! `.qn` script, a package directory with an `__init.qn`, or a native
//! shared library declared by the package's `pkg.json` manifest. Search
//! paths are probed in order; the first hit wins.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Script file extension.
pub const SCRIPT_EXT: &str = "qn";
/// Package init script name.
pub const INIT_FILE: &str = "__init.qn";
/// Package manifest file name.
pub const MANIFEST_FILE: &str = "pkg.json";
/// Environment variable holding extra colon-separated search paths.
pub const PATH_ENV_VAR: &str = "QUINCE_PATH";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// A plain script file.
    Script(PathBuf),
    /// A package directory's init script.
    Package(PathBuf),
    /// A shared library declared as a native module by its package.
    NativeLibrary(PathBuf),
}

/// Package manifest (`pkg.json`). Besides metadata it lists which names
/// inside the package resolve as native modules.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PkgManifest {
    pub name: String,
    pub version: String,
    pub description: String,
    pub authors: Vec<String>,
    #[serde(rename = "nativeModules")]
    pub native_modules: Vec<String>,
}

impl PkgManifest {
    pub fn load(dir: &Path) -> Option<PkgManifest> {
        let text = std::fs::read_to_string(dir.join(MANIFEST_FILE)).ok()?;
        serde_json::from_str(&text).ok()
    }
}

pub struct ModuleResolver {
    search_paths: Vec<PathBuf>,
}

impl ModuleResolver {
    /// Build the default search path: current directory, `./modules`, the
    /// nearest ancestor virtual-env `lib`, `QUINCE_PATH` entries, the user
    /// module directory and the system directories.
    pub fn new() -> Self {
        let mut resolver = Self {
            search_paths: Vec::new(),
        };

        if let Ok(cwd) = std::env::current_dir() {
            resolver.add_search_path(cwd.clone());
            resolver.add_search_path(cwd.join("modules"));

            // Walk up looking for a virtual environment.
            let mut dir: Option<&Path> = Some(&cwd);
            while let Some(d) = dir {
                let env_lib = d.join(".quince_env").join("lib");
                if env_lib.is_dir() {
                    resolver.add_search_path(env_lib);
                    break;
                }
                dir = d.parent();
            }
        }

        if let Ok(paths) = std::env::var(PATH_ENV_VAR) {
            for entry in paths.split(':').filter(|p| !p.is_empty()) {
                resolver.add_search_path(PathBuf::from(entry));
            }
        }

        if let Ok(home) = std::env::var("HOME") {
            resolver.add_search_path(PathBuf::from(home).join(".quince").join("modules"));
        }

        resolver.add_search_path(PathBuf::from("/usr/local/lib/quince/modules"));
        resolver.add_search_path(PathBuf::from("/usr/lib/quince/modules"));

        resolver
    }

    /// A resolver with no default paths; callers add their own.
    pub fn empty() -> Self {
        Self {
            search_paths: Vec::new(),
        }
    }

    pub fn add_search_path(&mut self, path: impl Into<PathBuf>) {
        self.search_paths.push(path.into());
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Platform extension for shared libraries.
    pub fn native_extension() -> &'static str {
        if cfg!(target_os = "windows") {
            "dll"
        } else if cfg!(target_os = "macos") {
            "dylib"
        } else {
            "so"
        }
    }

    /// Resolve a logical dotted name to the first matching candidate.
    pub fn resolve(&self, logical: &str) -> Option<Resolution> {
        let rel: PathBuf = logical.split('.').collect();
        let leaf = logical.rsplit('.').next().unwrap_or(logical);
        // The manifest lives in the package root: the parent path for a
        // dotted name, the module directory itself for a bare one.
        let pkg_rel: PathBuf = match logical.rfind('.') {
            Some(idx) => logical[..idx].split('.').collect(),
            None => rel.clone(),
        };

        for base in &self.search_paths {
            let script = base.join(&rel).with_extension(SCRIPT_EXT);
            if script.is_file() {
                return Some(Resolution::Script(script));
            }

            let init = base.join(&rel).join(INIT_FILE);
            if init.is_file() {
                return Some(Resolution::Package(init));
            }

            let pkg_root = base.join(&pkg_rel);
            if let Some(manifest) = PkgManifest::load(&pkg_root) {
                if manifest.native_modules.iter().any(|m| m == leaf) {
                    let lib = pkg_root
                        .join("lib")
                        .join(format!("{}.{}", leaf, Self::native_extension()));
                    if lib.is_file() {
                        return Some(Resolution::NativeLibrary(lib));
                    }
                }
            }
        }
        None
    }
}

impl Default for ModuleResolver {
    fn default() -> Self {
        Self::new()
    }
}

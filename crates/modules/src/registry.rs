//! crates/modules/src/registry.rs
//!
//! Module discovery, alias mapping, and tiered resolution.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

/// Suffix of the sentinel file carrying a module's version.
pub const VERSION_SUFFIX: &str = ".version";
/// Suffix of the empty sentinel file marking a module as blocking.
pub const BLOCKING_SUFFIX: &str = ".blocking";

/// File extensions accepted as module executables.
const VALID_EXTENSIONS: [&str; 4] = ["exe", "py", "sh", "bat"];

/// Canonical client-facing names for the shipped module files. Custom
/// modules are addressed by their literal file name instead.
const ALIASES: [(&str, &str); 10] = [
    // Service management
    ("restart.py", "restart"),
    // Module management
    ("modulemng.py", "modulemng"),
    ("updateModule.py", "updateModule"),
    ("updateSoftware.py", "updateSoftware"),
    // Custom scripts
    ("remove.py", "remove"),
    ("upload.py", "upload"),
    ("exec.py", "exec"),
    // System scripts
    ("netconf.py", "netconf"),
    ("osinfo.py", "osinfo"),
    ("systemstatus.py", "systemstatus"),
];

/// The three module classes, in shadowing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ModuleTier {
    /// Shipped with the agent, never replaced in place.
    Internal,
    /// Shipped with the agent, replaceable through `updateModule`.
    Plugin,
    /// Uploaded by the user.
    Custom,
}

impl ModuleTier {
    /// Resolution order: the first tier holding a name wins.
    pub const ALL: [Self; 3] = [Self::Internal, Self::Plugin, Self::Custom];

    /// Human-readable tier name as reported to the host.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Internal => "Internal",
            Self::Plugin => "Plugin",
            Self::Custom => "Custom",
        }
    }

    /// Directory under the install root holding this tier.
    #[must_use]
    pub const fn directory(self) -> &'static str {
        match self {
            Self::Internal => "internals",
            Self::Plugin => "plugins",
            Self::Custom => "usermodules",
        }
    }

    /// Whether modules of this tier may be replaced on disk.
    #[must_use]
    pub const fn is_upgradable(self) -> bool {
        !matches!(self, Self::Internal)
    }
}

/// One resolved registry entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    tier: ModuleTier,
    alias: String,
    path: PathBuf,
    version: f64,
    blocking: bool,
}

impl Module {
    /// Tier the module was found in.
    #[must_use]
    pub const fn tier(&self) -> ModuleTier {
        self.tier
    }

    /// Canonical name clients use on the command line.
    #[must_use]
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Full path to the executable.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Version from the `.version` sentinel; zero when absent or
    /// malformed.
    #[must_use]
    pub const fn version(&self) -> f64 {
        self.version
    }

    /// Whether a sibling `.blocking` sentinel demands exclusive
    /// execution.
    #[must_use]
    pub const fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Whether the module's tier allows replacement.
    #[must_use]
    pub const fn is_upgradable(&self) -> bool {
        self.tier.is_upgradable()
    }
}

/// Filesystem-backed registry rooted at the install directory.
#[derive(Debug, Clone)]
pub struct ModuleRegistry {
    root: PathBuf,
}

impl ModuleRegistry {
    /// Creates a registry over `root` (the agent install directory).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The install root this registry scans.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding `tier`.
    #[must_use]
    pub fn tier_dir(&self, tier: ModuleTier) -> PathBuf {
        self.root.join(tier.directory())
    }

    /// Resolves a client-facing name to at most one module, searching
    /// Internal, then Plugin, then Custom. The name is inverse-aliased
    /// to its on-disk file name when the alias map knows it.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<Module> {
        let file_name = file_for_alias(name).unwrap_or(name);
        for tier in ModuleTier::ALL {
            let candidate = self.tier_dir(tier).join(file_name);
            if let Some(module) = module_from_path(&candidate, tier) {
                trace!(name, tier = tier.label(), path = %module.path.display(), "resolved module");
                return Some(module);
            }
        }
        debug!(name, "module not found in any tier");
        None
    }

    /// Lists every module, grouped by tier and sorted by alias. The
    /// listing is a snapshot: files vanishing mid-scan are skipped.
    #[must_use]
    pub fn enumerate(&self) -> BTreeMap<ModuleTier, Vec<Module>> {
        let mut inventory = BTreeMap::new();
        for tier in ModuleTier::ALL {
            inventory.insert(tier, self.scan_tier(tier));
        }
        inventory
    }

    fn scan_tier(&self, tier: ModuleTier) -> Vec<Module> {
        let dir = self.tier_dir(tier);
        let Ok(entries) = fs::read_dir(&dir) else {
            trace!(dir = %dir.display(), "tier directory unreadable, treating as empty");
            return Vec::new();
        };
        // Later duplicates of an alias replace earlier ones, so keep
        // the map keyed by alias while scanning.
        let mut found: BTreeMap<String, Module> = BTreeMap::new();
        for entry in entries.flatten() {
            if let Some(module) = module_from_path(&entry.path(), tier) {
                found.insert(module.alias.clone(), module);
            }
        }
        found.into_values().collect()
    }
}

/// Builds a module from a concrete path, verifying it is a regular
/// file with a candidate extension. Returns `None` for sentinel
/// files, directories, and paths that vanished since listing.
fn module_from_path(path: &Path, tier: ModuleTier) -> Option<Module> {
    if !has_valid_extension(path) {
        return None;
    }
    // The file may disappear between readdir and stat while an
    // update command rewrites the tier; skip it silently.
    let metadata = fs::metadata(path).ok()?;
    if !metadata.is_file() {
        return None;
    }
    let file_name = path.file_name()?.to_str()?.to_string();
    let alias = alias_for_file(&file_name).unwrap_or(&file_name).to_string();
    Some(Module {
        tier,
        alias,
        version: read_version_file(&sibling(path, VERSION_SUFFIX)),
        blocking: sibling(path, BLOCKING_SUFFIX).exists(),
        path: path.to_path_buf(),
    })
}

fn has_valid_extension(path: &Path) -> bool {
    match path.extension().and_then(OsStr::to_str) {
        None => true,
        Some(ext) => VALID_EXTENSIONS.contains(&ext),
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(OsStr::to_os_string).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

fn alias_for_file(file_name: &str) -> Option<&'static str> {
    ALIASES
        .iter()
        .find(|(file, _)| *file == file_name)
        .map(|(_, alias)| *alias)
}

fn file_for_alias(alias: &str) -> Option<&'static str> {
    ALIASES
        .iter()
        .find(|(_, known)| *known == alias)
        .map(|(file, _)| *file)
}

/// Reads a one-line ASCII decimal version file; anything missing or
/// unparseable reads as zero.
#[must_use]
pub fn read_version_file(path: &Path) -> f64 {
    fs::read_to_string(path)
        .ok()
        .and_then(|text| text.lines().next().map(str::trim).map(str::to_owned))
        .and_then(|line| line.parse().ok())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn install_root() -> TempDir {
        let root = TempDir::new().expect("tempdir");
        for tier in ModuleTier::ALL {
            fs::create_dir(root.path().join(tier.directory())).expect("tier dir");
        }
        root
    }

    fn write_module(root: &TempDir, tier: ModuleTier, file_name: &str) -> PathBuf {
        let path = root.path().join(tier.directory()).join(file_name);
        fs::write(&path, "#!/bin/sh\nexit 0\n").expect("module file");
        path
    }

    #[test]
    fn tier_order_and_labels() {
        assert_eq!(
            ModuleTier::ALL,
            [ModuleTier::Internal, ModuleTier::Plugin, ModuleTier::Custom]
        );
        assert_eq!(ModuleTier::Internal.label(), "Internal");
        assert!(!ModuleTier::Internal.is_upgradable());
        assert!(ModuleTier::Plugin.is_upgradable());
        assert!(ModuleTier::Custom.is_upgradable());
    }

    #[test]
    fn resolves_known_alias_to_file() {
        let root = install_root();
        write_module(&root, ModuleTier::Internal, "modulemng.py");
        let registry = ModuleRegistry::new(root.path());

        let module = registry.resolve("modulemng").expect("resolved");
        assert_eq!(module.alias(), "modulemng");
        assert_eq!(module.tier(), ModuleTier::Internal);
        assert!(module.path().ends_with("internals/modulemng.py"));
    }

    #[test]
    fn resolves_custom_module_by_literal_name() {
        let root = install_root();
        write_module(&root, ModuleTier::Custom, "healthcheck.sh");
        let registry = ModuleRegistry::new(root.path());

        let module = registry.resolve("healthcheck.sh").expect("resolved");
        assert_eq!(module.alias(), "healthcheck.sh");
        assert_eq!(module.tier(), ModuleTier::Custom);
    }

    #[test]
    fn unknown_name_resolves_to_none() {
        let root = install_root();
        let registry = ModuleRegistry::new(root.path());
        assert!(registry.resolve("no-such-module").is_none());
    }

    #[test]
    fn internal_shadows_plugin_shadows_custom() {
        let root = install_root();
        write_module(&root, ModuleTier::Custom, "probe");
        write_module(&root, ModuleTier::Plugin, "probe");
        let registry = ModuleRegistry::new(root.path());
        assert_eq!(registry.resolve("probe").expect("resolved").tier(), ModuleTier::Plugin);

        write_module(&root, ModuleTier::Internal, "probe");
        assert_eq!(
            registry.resolve("probe").expect("resolved").tier(),
            ModuleTier::Internal
        );
    }

    #[test]
    fn version_sentinel_is_parsed_with_zero_fallback() {
        let root = install_root();
        let path = write_module(&root, ModuleTier::Plugin, "netconf.py");
        fs::write(sibling(&path, VERSION_SUFFIX), "2.5\n").expect("version");
        let registry = ModuleRegistry::new(root.path());
        assert!((registry.resolve("netconf").expect("resolved").version() - 2.5).abs() < f64::EPSILON);

        fs::write(sibling(&path, VERSION_SUFFIX), "not a number\n").expect("version");
        assert!(registry.resolve("netconf").expect("resolved").version().abs() < f64::EPSILON);

        fs::remove_file(sibling(&path, VERSION_SUFFIX)).expect("remove");
        assert!(registry.resolve("netconf").expect("resolved").version().abs() < f64::EPSILON);
    }

    #[test]
    fn blocking_sentinel_marks_module() {
        let root = install_root();
        let path = write_module(&root, ModuleTier::Plugin, "updateModule.py");
        let registry = ModuleRegistry::new(root.path());
        assert!(!registry.resolve("updateModule").expect("resolved").is_blocking());

        File::create(sibling(&path, BLOCKING_SUFFIX)).expect("sentinel");
        assert!(registry.resolve("updateModule").expect("resolved").is_blocking());
    }

    #[test]
    fn sentinel_files_are_not_modules() {
        let root = install_root();
        let path = write_module(&root, ModuleTier::Custom, "job.sh");
        fs::write(sibling(&path, VERSION_SUFFIX), "1\n").expect("version");
        File::create(sibling(&path, BLOCKING_SUFFIX)).expect("sentinel");
        let registry = ModuleRegistry::new(root.path());

        let inventory = registry.enumerate();
        let customs = &inventory[&ModuleTier::Custom];
        assert_eq!(customs.len(), 1);
        assert_eq!(customs[0].alias(), "job.sh");
    }

    #[test]
    fn enumerate_groups_by_tier_sorted_by_alias() {
        let root = install_root();
        write_module(&root, ModuleTier::Internal, "restart.py");
        write_module(&root, ModuleTier::Internal, "modulemng.py");
        write_module(&root, ModuleTier::Plugin, "osinfo.py");
        write_module(&root, ModuleTier::Custom, "zz.sh");
        write_module(&root, ModuleTier::Custom, "aa.sh");
        let registry = ModuleRegistry::new(root.path());

        let inventory = registry.enumerate();
        let aliases: Vec<&str> = inventory[&ModuleTier::Internal]
            .iter()
            .map(Module::alias)
            .collect();
        assert_eq!(aliases, ["modulemng", "restart"]);
        assert_eq!(inventory[&ModuleTier::Plugin].len(), 1);
        let customs: Vec<&str> = inventory[&ModuleTier::Custom]
            .iter()
            .map(Module::alias)
            .collect();
        assert_eq!(customs, ["aa.sh", "zz.sh"]);
    }

    #[test]
    fn missing_tier_directory_is_empty_not_fatal() {
        let root = TempDir::new().expect("tempdir");
        let registry = ModuleRegistry::new(root.path());
        assert!(registry.resolve("anything").is_none());
        let inventory = registry.enumerate();
        assert!(inventory.values().all(Vec::is_empty));
    }

    #[test]
    fn directories_are_not_modules() {
        let root = install_root();
        fs::create_dir(root.path().join("usermodules").join("nested")).expect("dir");
        let registry = ModuleRegistry::new(root.path());
        assert!(registry.resolve("nested").is_none());
    }

    #[test]
    fn version_file_reader_takes_first_line() {
        let root = install_root();
        let path = root.path().join("serclient.version");
        fs::write(&path, "3.1\ntrailing junk\n").expect("write");
        assert!((read_version_file(&path) - 3.1).abs() < f64::EPSILON);
        assert!(read_version_file(&root.path().join("absent")).abs() < f64::EPSILON);
    }
}

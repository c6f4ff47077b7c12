use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

use crate::execution::{CommandError, CommandRunner, CommandSpec, LIST_TIMEOUT};
use crate::models::{CoreError, CoreErrorKind, CoreResult, Manager, PackageRecord};

/// The three Uninstall roots: native HKLM, the WOW6432Node mirror, and
/// per-user HKCU.
pub const UNINSTALL_ROOTS: [&str; 3] = [
    r"HKLM\SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall",
    r"HKLM\SOFTWARE\WOW6432Node\Microsoft\Windows\CurrentVersion\Uninstall",
    r"HKCU\Software\Microsoft\Windows\CurrentVersion\Uninstall",
];

/// One Uninstall subkey, values as the registry spells them.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RawUninstallEntry {
    /// Full subkey path, e.g.
    /// `HKEY_LOCAL_MACHINE\...\Uninstall\Microsoft.VisualStudioCode`.
    pub registry_key: String,
    pub display_name: String,
    pub display_version: Option<String>,
    pub publisher: Option<String>,
    pub install_location: Option<String>,
    pub install_path: Option<String>,
    pub install_source: Option<String>,
    pub install_date: Option<String>,
    pub uninstall_string: Option<String>,
    pub install_string: Option<String>,
}

impl RawUninstallEntry {
    /// Last path segment of the registry key: the subkey name, which for
    /// winget installs is usually the package id.
    pub fn subkey_name(&self) -> &str {
        self.registry_key
            .rsplit('\\')
            .next()
            .unwrap_or(&self.registry_key)
    }
}

/// Source of raw Uninstall entries. Production shells out to `reg query`;
/// tests feed captured dumps.
#[async_trait]
pub trait RegistryView: Send + Sync {
    async fn query_uninstall_root(&self, root: &str) -> CoreResult<Vec<RawUninstallEntry>>;
}

/// Reads the registry by spawning `reg query <root> /s` and parsing the
/// text dump. A root that does not exist (or a host without `reg.exe`)
/// yields an empty list, not an error.
pub struct RegCommandView {
    runner: Arc<dyn CommandRunner>,
}

impl RegCommandView {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl RegistryView for RegCommandView {
    async fn query_uninstall_root(&self, root: &str) -> CoreResult<Vec<RawUninstallEntry>> {
        let spec = CommandSpec::new("reg")
            .args(["query", root, "/s"])
            .timeout(LIST_TIMEOUT);

        match self.runner.run(spec).await {
            Ok(output) if output.success() => Ok(parse_reg_dump(&output.stdout)),
            Ok(output) => {
                debug!(root, code = output.code, "reg query returned nothing");
                Ok(Vec::new())
            }
            Err(CommandError::NotFound { .. }) => Ok(Vec::new()),
            Err(error) => Err(CoreError::new(
                CoreErrorKind::ProviderUnavailable,
                format!("failed to enumerate '{root}': {error}"),
            )),
        }
    }
}

/// Parse the `reg query /s` dump: subkey header lines start at column 0
/// with `HKEY_`, value lines are indented `NAME  REG_TYPE  DATA`.
pub fn parse_reg_dump(stdout: &str) -> Vec<RawUninstallEntry> {
    let mut entries = Vec::new();
    let mut current_key: Option<String> = None;
    let mut values: HashMap<String, String> = HashMap::new();

    let mut flush = |current_key: &Option<String>, values: &mut HashMap<String, String>| {
        if let Some(key) = current_key
            && let Some(entry) = entry_from_values(key, values)
        {
            entries.push(entry);
        }
        values.clear();
    };

    for raw_line in stdout.lines() {
        let line = raw_line.trim_end();
        if line.trim().is_empty() {
            continue;
        }

        if !raw_line.starts_with(' ') && line.starts_with("HKEY_") {
            flush(&current_key, &mut values);
            current_key = Some(line.trim().to_string());
            continue;
        }

        if current_key.is_none() {
            continue;
        }
        if let Some((name, value)) = parse_reg_value_line(line.trim_start()) {
            values.insert(name, value);
        }
    }
    flush(&current_key, &mut values);

    entries
}

/// Entries without a DisplayName are not applications; skip them.
fn entry_from_values(key: &str, values: &HashMap<String, String>) -> Option<RawUninstallEntry> {
    let display_name = values
        .get("DisplayName")
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())?;

    let take = |name: &str| {
        values
            .get(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    Some(RawUninstallEntry {
        registry_key: key.to_string(),
        display_name: display_name.to_string(),
        display_version: take("DisplayVersion"),
        publisher: take("Publisher"),
        install_location: take("InstallLocation"),
        install_path: take("InstallPath"),
        install_source: take("InstallSource"),
        install_date: take("InstallDate"),
        uninstall_string: take("UninstallString"),
        install_string: take("InstallString"),
    })
}

pub fn parse_reg_value_line(line: &str) -> Option<(String, String)> {
    let mut parts = line.split_whitespace();
    let name = parts.next()?;
    let type_name = parts.next()?;
    if !type_name.starts_with("REG_") {
        return None;
    }
    let start = line.find(type_name)? + type_name.len();
    let value = line[start..].trim().to_string();
    Some((name.to_string(), value))
}

/// Existence probe behind the path heuristics so tests can model a Windows
/// filesystem anywhere.
pub trait PathProbe: Send + Sync {
    fn dir_exists(&self, path: &Path) -> bool;
}

pub struct FsProbe;

impl PathProbe for FsProbe {
    fn dir_exists(&self, path: &Path) -> bool {
        path.is_dir()
    }
}

lazy_static! {
    /// Directory extracted from an uninstall/install command line: leading
    /// optional quote, drive letter, everything up to the last backslash
    /// before a trailing executable name.
    static ref COMMAND_DIR_RE: Regex =
        Regex::new(r#"(?i)^\s*"?([a-z]:\\.+)\\[^\\]+\.exe"#).expect("static regex compiles");

    /// Version or architecture subdirectory tokens that mean "one level
    /// below the app root": vim91 lives under Vim, bin under the product
    /// directory, and so on. Trailing-digit names (vim91, gtk3) count as
    /// version subdirectories.
    static ref VERSION_SUBDIR_RE: Regex =
        Regex::new(r"(?i)^(v?\d+(\.\d+)*|[a-z]+\d+(\.\d+)*|bin|app|x\d{2,3}|win\d+|install|uninstall)$")
            .expect("static regex compiles");

    static ref VERSION_ONLY_ID_RE: Regex =
        Regex::new(r"^v?\d+(\.\d+)*$").expect("static regex compiles");
}

/// Best-effort installation directory for an Uninstall entry.
///
/// InstallLocation, then InstallPath, are trusted as-is when they exist on
/// disk. Failing those, a directory is parsed out of UninstallString and
/// InstallString; a parsed directory whose final segment looks like a
/// version/arch subdirectory is replaced by its parent, exactly one level
/// up. Registry paths are handled as backslash-separated text, never
/// through the host's path semantics.
pub fn extract_install_dir(entry: &RawUninstallEntry, probe: &dyn PathProbe) -> Option<PathBuf> {
    for direct in [&entry.install_location, &entry.install_path] {
        if let Some(raw) = direct.as_deref() {
            let trimmed = raw.trim().trim_matches('"');
            if !trimmed.is_empty() && probe.dir_exists(Path::new(trimmed)) {
                return Some(PathBuf::from(trimmed));
            }
        }
    }

    for command in [&entry.uninstall_string, &entry.install_string] {
        let Some(command) = command.as_deref() else {
            continue;
        };
        let Some(captures) = COMMAND_DIR_RE.captures(command) else {
            continue;
        };
        let dir = captures[1].to_string();
        if !probe.dir_exists(Path::new(&dir)) {
            continue;
        }
        return Some(PathBuf::from(smart_parent(dir, probe)));
    }

    None
}

/// Walk up one level when the final segment is a version/arch
/// subdirectory. Only ever one level: `...\Vim\vim91` becomes `...\Vim`,
/// never `C:\Program Files`.
fn smart_parent(dir: String, probe: &dyn PathProbe) -> String {
    let trimmed = dir.trim_end_matches('\\');
    let Some(split_at) = trimmed.rfind('\\') else {
        return dir;
    };
    let (parent, last_segment) = (&trimmed[..split_at], &trimmed[split_at + 1..]);
    if !VERSION_SUBDIR_RE.is_match(last_segment) {
        return dir;
    }
    if !parent.contains('\\') {
        // Never collapse down to a bare drive root.
        return dir;
    }
    if probe.dir_exists(Path::new(parent)) {
        parent.to_string()
    } else {
        dir
    }
}

/// Confidence-scored lookup: which install path belongs to this package
/// id? Returns the best-scoring entry's directory, or nothing when no
/// candidate clears the acceptance floor.
pub fn find_install_path(
    package_id: &str,
    entries: &[RawUninstallEntry],
    probe: &dyn PathProbe,
) -> Option<PathBuf> {
    // Ids like "4.7.1" match half the registry; refuse them outright.
    if VERSION_ONLY_ID_RE.is_match(package_id.trim()) {
        return None;
    }

    const MIN_ACCEPT: i32 = 70;

    let mut best: Option<(i32, &RawUninstallEntry)> = None;
    for entry in entries {
        let score = score_candidate(package_id, entry);
        if score < MIN_ACCEPT {
            continue;
        }
        if best.map(|(top, _)| score > top).unwrap_or(true) {
            best = Some((score, entry));
        }
    }

    let (score, entry) = best?;
    debug!(package_id, score, subkey = entry.subkey_name(), "matched install path candidate");
    extract_install_dir(entry, probe)
}

pub(crate) fn score_candidate(package_id: &str, entry: &RawUninstallEntry) -> i32 {
    let id = package_id.trim();
    let id_lower = id.to_lowercase();
    let id_tail = id.rsplit('.').next().unwrap_or(id);
    let id_tail_lower = id_tail.to_lowercase();
    let display = entry.display_name.trim();
    let display_lower = display.to_lowercase();
    let subkey = entry.subkey_name();

    let mut score = 0;

    if subkey == id {
        score = 150;
    } else if display == id {
        score = 145;
    } else if normalize(subkey) == normalize(id) {
        score = 135;
    } else if normalize(display) == normalize(id) {
        score = 125;
    } else if !id_tail.is_empty() && normalize(display) == normalize(id_tail) {
        score = 115;
    } else if id_tail_lower.len() >= 3 && display_lower.contains(&id_tail_lower) {
        score = 110;
    } else if display_lower.len() >= 3 && id_lower.contains(&display_lower) {
        score = 95;
    } else if id_tail_lower.len() >= 3 && id_tail_lower.contains(&display_lower) && !display_lower.is_empty()
    {
        score = 80;
    }

    if score == 0 {
        return 0;
    }

    // Small boost when the install location itself names the package.
    if let Some(location) = entry.install_location.as_deref() {
        let location_lower = location.to_lowercase();
        if !id_tail_lower.is_empty() && location_lower.contains(&id_tail_lower) {
            score += 10;
        } else if location_lower.contains(&normalize(id_tail)) {
            score += 5;
        }
    }

    score
}

fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}

/// Fingerprint an entry to its likely manager from path substrings.
pub fn fingerprint(entry: &RawUninstallEntry) -> Manager {
    let source = entry
        .install_source
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();
    let location = entry
        .install_location
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();

    if source.contains("winget") || source.contains("appinstaller") {
        return Manager::Winget;
    }
    if location.contains("chocolatey") || source.contains("chocolatey") || source.contains("choco")
    {
        return Manager::Chocolatey;
    }
    if location.contains("scoop") || source.contains("scoop") {
        return Manager::Scoop;
    }
    if location.contains("windowsapps") {
        return Manager::MsStore;
    }
    Manager::Unknown
}

/// Shape an Uninstall entry into an installed-inventory record. The
/// registry has no stable package ids, so the display name stands in until
/// the resolver rewrites it against the catalog.
pub fn to_package_record(entry: &RawUninstallEntry, probe: &dyn PathProbe) -> PackageRecord {
    let manager = fingerprint(entry);
    let version = entry
        .display_version
        .clone()
        .unwrap_or_else(|| "unknown".to_string());

    let mut record = PackageRecord::new(
        manager,
        entry.display_name.clone(),
        entry.display_name.clone(),
        version.clone(),
    );
    record.publisher = entry.publisher.clone();
    record.is_installed = true;
    record.installed_version = Some(version);
    record.install_date = entry.install_date.clone();
    record.install_source = Some(manager);
    record.install_location = extract_install_dir(entry, probe)
        .map(|path| path.to_string_lossy().into_owned());
    record.regenerate_search_tokens();
    record
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::path::{Path, PathBuf};

    use super::{
        FsProbe, PathProbe, RawUninstallEntry, extract_install_dir, find_install_path,
        fingerprint, parse_reg_dump, parse_reg_value_line, score_candidate, to_package_record,
    };
    use crate::models::Manager;

    const REG_DUMP: &str = include_str!("../../tests/fixtures/registry/uninstall_dump.txt");

    struct StubProbe {
        existing: HashSet<PathBuf>,
    }

    impl StubProbe {
        fn with(paths: &[&str]) -> Self {
            Self {
                existing: paths.iter().map(PathBuf::from).collect(),
            }
        }
    }

    impl PathProbe for StubProbe {
        fn dir_exists(&self, path: &Path) -> bool {
            self.existing.contains(path)
        }
    }

    fn entry(display_name: &str) -> RawUninstallEntry {
        RawUninstallEntry {
            registry_key: format!(
                r"HKEY_LOCAL_MACHINE\SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall\{display_name}"
            ),
            display_name: display_name.to_string(),
            ..RawUninstallEntry::default()
        }
    }

    #[test]
    fn parses_value_lines_with_embedded_spaces() {
        let parsed = parse_reg_value_line(
            "DisplayName    REG_SZ    Visual Studio Code",
        );
        assert_eq!(
            parsed,
            Some(("DisplayName".to_string(), "Visual Studio Code".to_string()))
        );
        assert_eq!(parse_reg_value_line("not a value line"), None);
    }

    #[test]
    fn parses_the_dump_and_skips_nameless_entries() {
        let entries = parse_reg_dump(REG_DUMP);
        // The fixture holds four subkeys; one has no DisplayName.
        assert_eq!(entries.len(), 3);

        let vim = entries
            .iter()
            .find(|entry| entry.display_name == "Vim 9.1")
            .expect("vim entry");
        assert_eq!(vim.display_version.as_deref(), Some("9.1"));
        assert_eq!(
            vim.uninstall_string.as_deref(),
            Some(r"C:\Program Files\Vim\vim91\uninstall.exe")
        );

        let cowsay = entries
            .iter()
            .find(|entry| entry.display_name == "Neo Cowsay")
            .expect("cowsay entry");
        assert_eq!(cowsay.install_date.as_deref(), Some("20240915"));
        assert_eq!(cowsay.publisher.as_deref(), Some("Charmbracelet"));
    }

    #[test]
    fn empty_dump_yields_an_empty_list() {
        assert!(parse_reg_dump("").is_empty());
        assert!(parse_reg_dump("\r\n\r\n").is_empty());
    }

    #[test]
    fn install_location_wins_when_it_exists() {
        let mut e = entry("Vim 9.1");
        e.install_location = Some(r"C:\Program Files\Vim\vim91".to_string());
        let probe = StubProbe::with(&[r"C:\Program Files\Vim\vim91"]);
        assert_eq!(
            extract_install_dir(&e, &probe),
            Some(PathBuf::from(r"C:\Program Files\Vim\vim91"))
        );
    }

    #[test]
    fn smart_parent_steps_up_exactly_one_level() {
        let mut e = entry("Vim 9.1");
        e.uninstall_string = Some(r"C:\Program Files\Vim\vim91\uninstall.exe".to_string());
        let probe = StubProbe::with(&[
            r"C:\Program Files",
            r"C:\Program Files\Vim",
            r"C:\Program Files\Vim\vim91",
        ]);
        // vim91 matches the version-subdir pattern, so the parent is the
        // answer; Program Files is never reached.
        assert_eq!(
            extract_install_dir(&e, &probe),
            Some(PathBuf::from(r"C:\Program Files\Vim"))
        );
    }

    #[test]
    fn non_version_segments_are_left_alone() {
        let mut e = entry("Some Tool");
        e.uninstall_string = Some(r"C:\Tools\SomeTool\remove.exe".to_string());
        let probe = StubProbe::with(&[r"C:\Tools", r"C:\Tools\SomeTool"]);
        assert_eq!(
            extract_install_dir(&e, &probe),
            Some(PathBuf::from(r"C:\Tools\SomeTool"))
        );
    }

    #[test]
    fn quoted_uninstall_strings_parse_too() {
        let mut e = entry("Quoted App");
        e.uninstall_string =
            Some(r#""C:\Program Files\Quoted App\bin\unins000.exe" /SILENT"#.to_string());
        let probe = StubProbe::with(&[
            r"C:\Program Files\Quoted App",
            r"C:\Program Files\Quoted App\bin",
        ]);
        // `bin` is a version/arch-style segment: step up to the app root.
        assert_eq!(
            extract_install_dir(&e, &probe),
            Some(PathBuf::from(r"C:\Program Files\Quoted App"))
        );
    }

    #[test]
    fn missing_everything_extracts_nothing() {
        let e = entry("Ghost App");
        assert_eq!(extract_install_dir(&e, &FsProbe), None);
    }

    #[test]
    fn scoring_prefers_exact_subkey_then_display_name() {
        let mut by_subkey = entry("Visual Studio Code");
        by_subkey.registry_key = r"HKEY_LOCAL_MACHINE\...\Uninstall\Microsoft.VisualStudioCode".to_string();
        assert_eq!(
            score_candidate("Microsoft.VisualStudioCode", &by_subkey),
            150
        );

        let by_name = entry("Microsoft.VisualStudioCode");
        assert_eq!(score_candidate("Microsoft.VisualStudioCode", &by_name), 145);

        let substring = entry("Visual Studio Code Insiders (VisualStudioCode build)");
        let score = score_candidate("Microsoft.VisualStudioCode", &substring);
        assert!((80..=120).contains(&score), "substring tier, got {score}");
    }

    #[test]
    fn location_bonus_is_applied() {
        let mut candidate = entry("Neo Cowsay");
        candidate.registry_key = r"HKEY_CURRENT_USER\...\Uninstall\neo-cowsay".to_string();
        let base = score_candidate("Charmbracelet.neo-cowsay", &candidate);
        candidate.install_location =
            Some(r"C:\Users\dev\AppData\Local\Programs\neo-cowsay".to_string());
        let boosted = score_candidate("Charmbracelet.neo-cowsay", &candidate);
        assert!(boosted > base);
        assert!(boosted - base <= 10);
    }

    #[test]
    fn version_only_ids_are_rejected() {
        let entries = vec![entry("4.7.1")];
        assert_eq!(find_install_path("4.7.1", &entries, &FsProbe), None);
        assert_eq!(find_install_path("v2.0", &entries, &FsProbe), None);
    }

    #[test]
    fn weak_candidates_fall_below_the_floor() {
        let entries = vec![entry("Completely Unrelated Thing")];
        assert_eq!(
            find_install_path("Microsoft.VisualStudioCode", &entries, &FsProbe),
            None
        );
    }

    #[test]
    fn fingerprints_follow_the_path_substrings() {
        let mut e = entry("App");
        e.install_source = Some(r"C:\Users\dev\AppData\Local\Temp\WinGet\cache".to_string());
        assert_eq!(fingerprint(&e), Manager::Winget);

        let mut e = entry("App");
        e.install_location = Some(r"C:\ProgramData\chocolatey\lib\app".to_string());
        assert_eq!(fingerprint(&e), Manager::Chocolatey);

        let mut e = entry("App");
        e.install_location = Some(r"C:\Users\dev\scoop\apps\app\current".to_string());
        assert_eq!(fingerprint(&e), Manager::Scoop);

        let mut e = entry("App");
        e.install_location = Some(r"C:\Program Files\WindowsApps\app_1.0".to_string());
        assert_eq!(fingerprint(&e), Manager::MsStore);

        assert_eq!(fingerprint(&entry("App")), Manager::Unknown);
    }

    #[test]
    fn record_shape_carries_installed_state() {
        let mut e = entry("Neo Cowsay");
        e.display_version = Some("1.0.2".to_string());
        e.install_source = Some(r"C:\WinGet\packages".to_string());
        let record = to_package_record(&e, &FsProbe);
        assert_eq!(record.package_id, "Neo Cowsay");
        assert!(record.is_installed);
        assert_eq!(record.installed_version.as_deref(), Some("1.0.2"));
        assert_eq!(record.manager, Manager::Winget);
        assert_eq!(record.install_source, Some(Manager::Winget));
    }
}

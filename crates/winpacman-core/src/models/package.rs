use serde::{Deserialize, Serialize};

use crate::models::Manager;

/// The canonical normalized record every provider emits and the cache
/// stores. `(manager, package_id)` is unique across the cache.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub package_id: String,
    pub name: String,
    pub version: String,
    pub manager: Manager,

    pub description: Option<String>,
    pub publisher: Option<String>,
    pub homepage: Option<String>,
    pub license: Option<String>,
    pub tags: Vec<String>,

    /// Derived, regenerated on every upsert. Always contains the lowercased
    /// `package_id` and `name`.
    pub search_tokens: String,

    /// Unix seconds of the last provider confirmation.
    pub last_seen_at: Option<i64>,

    pub is_installed: bool,
    pub installed_version: Option<String>,
    pub install_date: Option<String>,
    /// Attribution of an installed record; may differ from `manager` for
    /// manual installs.
    pub install_source: Option<Manager>,
    pub install_location: Option<String>,
}

impl PackageRecord {
    pub fn new(
        manager: Manager,
        package_id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        let package_id = package_id.into();
        let name = name.into();
        let mut record = Self {
            package_id,
            name,
            version: version.into(),
            manager,
            description: None,
            publisher: None,
            homepage: None,
            license: None,
            tags: Vec::new(),
            search_tokens: String::new(),
            last_seen_at: None,
            is_installed: false,
            installed_version: None,
            install_date: None,
            install_source: None,
            install_location: None,
        };
        record.regenerate_search_tokens();
        record
    }

    pub fn regenerate_search_tokens(&mut self) {
        self.search_tokens = derive_search_tokens(
            &self.package_id,
            &self.name,
            self.description.as_deref(),
            &self.tags,
        );
    }

    /// Null out every installed-state field. Used at the start of each
    /// inventory scan.
    pub fn clear_installed_state(&mut self) {
        self.is_installed = false;
        self.installed_version = None;
        self.install_date = None;
        self.install_source = None;
        self.install_location = None;
    }
}

/// One known version of a package, kept for install targeting.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PackageVersion {
    pub package_id: String,
    pub manager: Manager,
    pub version: String,
}

/// Lowercased whitespace-split union of id, name, description and tags,
/// de-duplicated in first-seen order.
pub fn derive_search_tokens(
    package_id: &str,
    name: &str,
    description: Option<&str>,
    tags: &[String],
) -> String {
    let mut seen = std::collections::HashSet::new();
    let mut tokens = Vec::new();

    let mut push_all = |text: &str| {
        for token in text.to_lowercase().split_whitespace() {
            if seen.insert(token.to_string()) {
                tokens.push(token.to_string());
            }
        }
    };

    push_all(package_id);
    push_all(name);
    if let Some(description) = description {
        push_all(description);
    }
    for tag in tags {
        push_all(tag);
    }

    tokens.join(" ")
}

#[cfg(test)]
mod tests {
    use super::{PackageRecord, derive_search_tokens};
    use crate::models::Manager;

    #[test]
    fn search_tokens_contain_lowercased_id_and_name() {
        let tokens = derive_search_tokens(
            "Microsoft.VisualStudioCode",
            "Visual Studio Code",
            Some("Code editing. Redefined."),
            &["editor".to_string(), "IDE".to_string()],
        );
        assert!(tokens.contains("microsoft.visualstudiocode"));
        assert!(tokens.contains("visual"));
        assert!(tokens.contains("studio"));
        assert!(tokens.contains("code"));
        assert!(tokens.contains("ide"));
    }

    #[test]
    fn search_tokens_deduplicate_across_fields() {
        let tokens = derive_search_tokens("vlc", "vlc", Some("vlc media player"), &[]);
        assert_eq!(tokens, "vlc media player");
    }

    #[test]
    fn new_record_has_tokens_and_no_installed_state() {
        let record = PackageRecord::new(Manager::Cargo, "serde", "serde", "1.0.210");
        assert!(record.search_tokens.contains("serde"));
        assert!(!record.is_installed);
        assert!(record.installed_version.is_none());
        assert!(record.install_source.is_none());
    }

    #[test]
    fn clearing_installed_state_nulls_every_field() {
        let mut record = PackageRecord::new(Manager::Winget, "vim.vim", "Vim", "9.1");
        record.is_installed = true;
        record.installed_version = Some("9.0".to_string());
        record.install_source = Some(Manager::Winget);
        record.install_location = Some(r"C:\Program Files\Vim".to_string());
        record.clear_installed_state();
        assert!(!record.is_installed);
        assert!(record.installed_version.is_none());
        assert!(record.install_source.is_none());
        assert!(record.install_location.is_none());
    }
}

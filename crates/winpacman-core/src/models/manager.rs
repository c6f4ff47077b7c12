use serde::{Deserialize, Serialize};

/// A package ecosystem, or the attribution of an installed application.
///
/// `MsStore` and `Unknown` only ever appear as attribution on installed
/// records; they never supply a catalog.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Manager {
    Winget,
    Chocolatey,
    Scoop,
    Npm,
    Cargo,
    MsStore,
    Unknown,
}

impl Manager {
    pub const CATALOG: [Manager; 5] = [
        Manager::Winget,
        Manager::Chocolatey,
        Manager::Scoop,
        Manager::Npm,
        Manager::Cargo,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Manager::Winget => "winget",
            Manager::Chocolatey => "chocolatey",
            Manager::Scoop => "scoop",
            Manager::Npm => "npm",
            Manager::Cargo => "cargo",
            Manager::MsStore => "msstore",
            Manager::Unknown => "unknown",
        }
    }

    pub fn from_str(raw: &str) -> Option<Manager> {
        match raw {
            "winget" => Some(Manager::Winget),
            "chocolatey" => Some(Manager::Chocolatey),
            "scoop" => Some(Manager::Scoop),
            "npm" => Some(Manager::Npm),
            "cargo" => Some(Manager::Cargo),
            "msstore" => Some(Manager::MsStore),
            "unknown" => Some(Manager::Unknown),
            _ => None,
        }
    }

    /// Whether this manager supplies a catalog (as opposed to being an
    /// attribution-only label on installed records).
    pub fn has_catalog(self) -> bool {
        Manager::CATALOG.contains(&self)
    }
}

impl std::fmt::Display for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

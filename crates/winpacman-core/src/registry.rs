use std::time::Duration;

use crate::models::Manager;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// How a manager participates in the aggregated catalog.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CatalogKind {
    /// Full catalog sync on a freshness schedule.
    Scheduled,
    /// Catalog refreshed only on explicit request.
    OnRequest,
    /// Bulk fetch only on demand; details fetched lazily per package.
    OnDemand,
    /// Never supplies a catalog; appears only as installed-record
    /// attribution.
    AttributionOnly,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ManagerDescriptor {
    pub id: Manager,
    pub display_name: &'static str,
    /// Program name the operations engine invokes, when one exists.
    pub cli_program: Option<&'static str>,
    /// Windows quirk: the CLI is a `.cmd`/`.bat` wrapper and must be
    /// spawned through the platform shell.
    pub cli_via_shell: bool,
    pub catalog: CatalogKind,
    /// Freshness budget for `Scheduled` catalogs.
    pub default_max_age: Option<Duration>,
}

const ALL_MANAGERS: [ManagerDescriptor; 7] = [
    ManagerDescriptor {
        id: Manager::Winget,
        display_name: "WinGet",
        cli_program: Some("winget"),
        cli_via_shell: false,
        catalog: CatalogKind::Scheduled,
        default_max_age: Some(DAY),
    },
    ManagerDescriptor {
        id: Manager::Chocolatey,
        display_name: "Chocolatey",
        cli_program: Some("choco"),
        cli_via_shell: false,
        catalog: CatalogKind::Scheduled,
        default_max_age: Some(Duration::from_secs(7 * 24 * 60 * 60)),
    },
    ManagerDescriptor {
        id: Manager::Scoop,
        display_name: "Scoop",
        cli_program: Some("scoop"),
        cli_via_shell: true,
        catalog: CatalogKind::OnRequest,
        default_max_age: None,
    },
    ManagerDescriptor {
        id: Manager::Npm,
        display_name: "npm",
        cli_program: Some("npm"),
        cli_via_shell: true,
        catalog: CatalogKind::OnDemand,
        default_max_age: None,
    },
    ManagerDescriptor {
        id: Manager::Cargo,
        display_name: "Cargo",
        cli_program: Some("cargo"),
        cli_via_shell: false,
        catalog: CatalogKind::OnDemand,
        default_max_age: None,
    },
    ManagerDescriptor {
        id: Manager::MsStore,
        display_name: "Microsoft Store",
        cli_program: None,
        cli_via_shell: false,
        catalog: CatalogKind::AttributionOnly,
        default_max_age: None,
    },
    ManagerDescriptor {
        id: Manager::Unknown,
        display_name: "Unknown",
        cli_program: None,
        cli_via_shell: false,
        catalog: CatalogKind::AttributionOnly,
        default_max_age: None,
    },
];

pub fn managers() -> &'static [ManagerDescriptor] {
    &ALL_MANAGERS
}

pub fn descriptor(id: Manager) -> &'static ManagerDescriptor {
    ALL_MANAGERS
        .iter()
        .find(|descriptor| descriptor.id == id)
        .expect("every manager variant has a descriptor")
}

#[cfg(test)]
mod tests {
    use super::{CatalogKind, descriptor, managers};
    use crate::models::Manager;

    #[test]
    fn every_manager_has_exactly_one_descriptor() {
        assert_eq!(managers().len(), 7);
        for entry in managers() {
            assert_eq!(descriptor(entry.id).id, entry.id);
        }
    }

    #[test]
    fn attribution_only_managers_have_no_cli() {
        assert!(descriptor(Manager::MsStore).cli_program.is_none());
        assert!(descriptor(Manager::Unknown).cli_program.is_none());
        assert_eq!(
            descriptor(Manager::Unknown).catalog,
            CatalogKind::AttributionOnly
        );
    }

    #[test]
    fn shell_wrapped_clis_are_flagged() {
        assert!(descriptor(Manager::Npm).cli_via_shell);
        assert!(descriptor(Manager::Scoop).cli_via_shell);
        assert!(!descriptor(Manager::Winget).cli_via_shell);
    }
}

use crate::core::model::InstallRequest;
use parking_lot::RwLock;
use std::collections::BTreeSet;

#[derive(Debug, Default)]
struct Installed {
    modules: BTreeSet<String>,
    languages: BTreeSet<String>,
}

/// Which modules the app declares and which splits are live in this process.
#[derive(Debug, Default)]
pub struct SplitCatalog {
    install_time: BTreeSet<String>,
    on_demand: BTreeSet<String>,
    installed: RwLock<Installed>,
}

impl SplitCatalog {
    /// Install-time modules ship with the base and start out installed.
    pub fn new<I, J, S, T>(install_time: I, on_demand: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        let install_time: BTreeSet<String> = install_time.into_iter().map(Into::into).collect();
        let installed = Installed { modules: install_time.clone(), languages: BTreeSet::new() };
        Self {
            install_time,
            on_demand: on_demand.into_iter().map(Into::into).collect(),
            installed: RwLock::new(installed),
        }
    }

    pub fn with_installed_modules<I, S>(self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.installed.write().modules.extend(modules.into_iter().map(Into::into));
        self
    }

    pub fn with_installed_languages<'a, I>(self, languages: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        {
            let mut installed = self.installed.write();
            for l in languages {
                if let Some(tag) = crate::core::model::language_tag(l) {
                    installed.languages.insert(tag);
                }
            }
        }
        self
    }

    pub fn is_known(&self, module: &str) -> bool {
        self.install_time.contains(module) || self.on_demand.contains(module)
    }

    /// First requested module the app does not declare, if any.
    pub fn first_unknown<'a>(&self, request: &'a InstallRequest) -> Option<&'a str> {
        request
            .modules()
            .iter()
            .find(|m| !self.is_known(m))
            .map(|m| m.as_str())
    }

    pub fn installed_modules(&self) -> BTreeSet<String> {
        self.installed.read().modules.clone()
    }

    pub fn installed_languages(&self) -> BTreeSet<String> {
        self.installed.read().languages.clone()
    }

    /// Everything an install request names is already live.
    pub fn satisfies(&self, request: &InstallRequest) -> bool {
        let installed = self.installed.read();
        installed.modules.is_superset(request.modules())
            && installed.languages.is_superset(request.languages())
    }

    /// Nothing an uninstall request names is live.
    pub fn lacks_all(&self, request: &InstallRequest) -> bool {
        let installed = self.installed.read();
        installed.modules.is_disjoint(request.modules())
            && installed.languages.is_disjoint(request.languages())
    }

    pub fn mark_installed(&self, modules: &BTreeSet<String>, languages: &BTreeSet<String>) {
        let mut installed = self.installed.write();
        installed.modules.extend(modules.iter().cloned());
        installed.languages.extend(languages.iter().cloned());
    }

    pub fn mark_uninstalled(&self, modules: &BTreeSet<String>, languages: &BTreeSet<String>) {
        let mut installed = self.installed.write();
        installed.modules.retain(|m| !modules.contains(m));
        installed.languages.retain(|l| !languages.contains(l));
    }
}

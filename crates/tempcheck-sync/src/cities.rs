use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tempcheck_core::CityTarget;
use tracing::info;

/// Size of the `--fast` subset.
pub const FAST_SUBSET_LEN: usize = 3;

const BUILTIN_CITIES: &[(&str, &str)] = &[
    ("New York", "usa/new-york"),
    ("London", "uk/london"),
    ("Tokyo", "japan/tokyo"),
    ("Sydney", "australia/sydney"),
    ("Paris", "france/paris"),
    ("Berlin", "germany/berlin"),
    ("Mumbai", "india/mumbai"),
    ("Toronto", "canada/toronto"),
    ("Moscow", "russia/moscow"),
    ("Cairo", "egypt/cairo"),
    ("Bangkok", "thailand/bangkok"),
    ("Rio de Janeiro", "brazil/rio-de-janeiro"),
    ("Mexico City", "mexico/mexico-city"),
    ("Lagos", "nigeria/lagos"),
    ("Istanbul", "turkey/istanbul"),
    ("Seoul", "south-korea/seoul"),
    ("Buenos Aires", "argentina/buenos-aires"),
    ("Jakarta", "indonesia/jakarta"),
    ("Johannesburg", "south-africa/johannesburg"),
    ("Dubai", "united-arab-emirates/dubai"),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityRegistry {
    pub cities: Vec<CityTarget>,
}

impl CityRegistry {
    pub fn builtin() -> Self {
        Self {
            cities: BUILTIN_CITIES
                .iter()
                .map(|(name, page)| CityTarget::new(*name, *page))
                .collect(),
        }
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(raw).context("parsing city registry yaml")?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading city registry {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("loading {}", path.display()))
    }

    /// The registry at `path`, or the built-in list when the file does not exist.
    pub fn load_or_builtin(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            info!(path = %path.display(), "city registry not found; using built-in list");
            Ok(Self::builtin())
        }
    }

    fn validate(&self) -> Result<()> {
        if self.cities.is_empty() {
            bail!("city registry is empty");
        }
        let mut seen = HashSet::new();
        for city in &self.cities {
            let name = city.name.trim();
            if name.is_empty() {
                bail!("city registry contains an entry without a name");
            }
            if !seen.insert(name.to_string()) {
                bail!("city `{name}` is listed more than once");
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.cities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cities.is_empty()
    }

    pub fn fast(&self) -> Vec<CityTarget> {
        self.cities.iter().take(FAST_SUBSET_LEN).cloned().collect()
    }

    /// Cities for one run: the fast subset when asked, then capped at `limit`.
    pub fn select(&self, fast: bool, limit: Option<usize>) -> Vec<CityTarget> {
        let cities = if fast { self.fast() } else { self.cities.clone() };
        match limit {
            Some(limit) => cities.into_iter().take(limit).collect(),
            None => cities,
        }
    }
}

//! Station catalog: the `Name|StreamURL[|LogoFileRef]` list format, grouping of
//! regional variants, and favorites annotation.
//!
//! ```text
//! # comment
//! News (North)|https://example.com/north.mp3|news.png
//! News (South)|https://example.com/south.mp3
//! Jazz|https://example.com/jazz.mp3
//! ```
//!
//! Grouping strips a trailing `(...)` qualifier to get a base name; two or more
//! stations with the same base name become one [`StationGroup`].

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use tracing::{info, warn};

use crate::error::PlaybackError;
use crate::protocol::{CatalogEntry, Station, StationGroup};

/// Description given to every station parsed from the list file.
pub const DEFAULT_DESCRIPTION: &str = "Internet Radio";

const FIELD_SEPARATOR: char = '|';

/// Parse the list format into flat stations.  Ids are `station_<n>` where `n`
/// counts non-blank, non-comment lines, so a malformed line still consumes its
/// index and ids stay stable when one line is fixed.
pub fn parse_catalog_str(content: &str, logo_dir: &Path) -> Vec<Station> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .enumerate()
        .filter_map(|(index, line)| {
            let parts: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
            if parts.len() < 2 {
                return None;
            }
            let logo = parts
                .get(2)
                .map(|r| r.trim())
                .filter(|r| !r.is_empty())
                .map(|r| logo_dir.join(r).display().to_string());
            Some(Station {
                id: format!("station_{}", index),
                name: parts[0].trim().to_string(),
                stream_url: parts[1].trim().to_string(),
                description: DEFAULT_DESCRIPTION.to_string(),
                logo,
                is_favorite: false,
            })
        })
        .collect()
}

/// Read and parse the list file.
pub fn load_catalog(path: &Path, logo_dir: &Path) -> Result<Vec<Station>, PlaybackError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| PlaybackError::ResourceLoadFailure(format!("{}: {}", path.display(), e)))?;
    let stations = parse_catalog_str(&content, logo_dir);
    if stations.is_empty() {
        return Err(PlaybackError::ResourceLoadFailure(format!(
            "{} contains no stations",
            path.display()
        )));
    }
    Ok(stations)
}

/// Load the list file, degrading to [`fallback_stations`] so a session never
/// starts with an empty catalog.
pub fn load_catalog_or_fallback(path: &Path, logo_dir: &Path) -> Vec<Station> {
    match load_catalog(path, logo_dir) {
        Ok(stations) => {
            info!("Loaded {} stations from {}", stations.len(), path.display());
            stations
        }
        Err(e) => {
            warn!("{}, using built-in stations", e);
            fallback_stations()
        }
    }
}

pub fn fallback_stations() -> Vec<Station> {
    vec![
        Station::new("1", "Rock FM", "https://example.com/rock.mp3", "Rock classics"),
        Station::new("2", "Jazz Radio", "https://example.com/jazz.mp3", "Smooth jazz"),
        Station::new("3", "News 24", "https://example.com/news.mp3", "Global news"),
        Station::new("4", "Pop Hits", "https://example.com/pop.mp3", "Top charts"),
        Station::new("5", "LoFi Beats", "https://example.com/lofi.mp3", "Chill study"),
    ]
}

/// `"News (Region)"` → `"News"`.  Names without a trailing qualifier, or that
/// are nothing but a qualifier, are returned trimmed and otherwise unchanged.
pub fn base_name(name: &str) -> &str {
    let name = name.trim();
    if !name.ends_with(')') {
        return name;
    }
    match name.rfind('(') {
        Some(open) => {
            let base = name[..open].trim_end();
            if base.is_empty() {
                name
            } else {
                base
            }
        }
        None => name,
    }
}

/// Bucket stations by base name.  Buckets keep the order in which their first
/// member appears; single-member buckets stay plain stations.
pub fn group_stations(stations: Vec<Station>) -> Vec<CatalogEntry> {
    let mut buckets: Vec<(String, Vec<Station>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for station in stations {
        let base = base_name(&station.name).to_string();
        match index.get(&base) {
            Some(&i) => buckets[i].1.push(station),
            None => {
                index.insert(base.clone(), buckets.len());
                buckets.push((base, vec![station]));
            }
        }
    }

    buckets
        .into_iter()
        .map(|(base, mut members)| {
            if members.len() == 1 {
                return CatalogEntry::Station(members.remove(0));
            }
            // Bare base-name station first, the rest alphabetical.
            members.sort_by(|a, b| {
                let a_qualified = a.name.trim() != base;
                let b_qualified = b.name.trim() != base;
                a_qualified
                    .cmp(&b_qualified)
                    .then_with(|| a.name.cmp(&b.name))
            });
            let logo = members.first().and_then(|s| s.logo.clone());
            CatalogEntry::Group(StationGroup {
                id: format!("group_{}", base),
                name: base,
                stations: members,
                logo,
                expanded: false,
            })
        })
        .collect()
}

/// Groups expanded into their members, in catalog order.
pub fn flatten(entries: &[CatalogEntry]) -> Vec<&Station> {
    entries
        .iter()
        .flat_map(|entry| match entry {
            CatalogEntry::Station(s) => std::slice::from_ref(s).iter(),
            CatalogEntry::Group(g) => g.stations.iter(),
        })
        .collect()
}

/// Copy of `entries` with every favorite flag set from `favorites`, stably
/// sorted so entries holding a favorite come first.
pub fn apply_favorites(entries: &[CatalogEntry], favorites: &BTreeSet<String>) -> Vec<CatalogEntry> {
    let annotate = |s: &Station| Station {
        is_favorite: favorites.contains(&s.id),
        ..s.clone()
    };

    let mut annotated: Vec<CatalogEntry> = entries
        .iter()
        .map(|entry| match entry {
            CatalogEntry::Station(s) => CatalogEntry::Station(annotate(s)),
            CatalogEntry::Group(g) => CatalogEntry::Group(StationGroup {
                stations: g.stations.iter().map(annotate).collect(),
                ..g.clone()
            }),
        })
        .collect();

    annotated.sort_by_key(|entry| !entry.is_favorite());
    annotated
}

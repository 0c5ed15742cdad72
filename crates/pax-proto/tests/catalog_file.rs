use std::collections::BTreeSet;
use std::path::Path;

use pax_proto::catalog::{
    apply_favorites, fallback_stations, flatten, group_stations, load_catalog_or_fallback,
};
use pax_proto::favorites::FavoritesStore;
use pax_proto::protocol::CatalogEntry;

const LIST: &str = "\
# paxradio station list
# Name|StreamURL|Logo
Radio (North)|https://radio.example/north|radio.png
Radio (South)|https://radio.example/south
Jazz|https://jazz.example/live|jazz.png
Broken line without separator
Talk|
Radio|http://radio.example/main|radio-main.png
";

#[test]
fn list_file_groups_and_resolves_logos() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("radio.list");
    std::fs::write(&path, LIST).unwrap();
    let logos = dir.path().join("logos");

    let entries = group_stations(load_catalog_or_fallback(&path, &logos));
    assert_eq!(entries.len(), 3);

    let CatalogEntry::Group(radio) = &entries[0] else {
        panic!("expected the Radio group first, got {:?}", entries[0]);
    };
    let members: Vec<&str> = radio.stations.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(members, vec!["Radio", "Radio (North)", "Radio (South)"]);
    assert_eq!(
        radio.logo.as_deref(),
        Some(logos.join("radio-main.png").display().to_string().as_str())
    );

    // "Talk|" has two fields, so it parses, but has no playable stream.
    let flat = flatten(&entries);
    let talk = flat.iter().find(|s| s.name == "Talk").unwrap();
    assert!(!talk.is_valid_url());
    assert_eq!(talk.id, "station_4");
    assert!(flat.iter().all(|s| s.name != "Broken line without separator"));
}

#[test]
fn unreadable_list_yields_exactly_the_builtin_stations() {
    let dir = tempfile::tempdir().unwrap();
    // A directory cannot be read as a file.
    let stations = load_catalog_or_fallback(dir.path(), Path::new("logos"));
    assert_eq!(stations.len(), 5);
    assert_eq!(stations, fallback_stations());
    assert!(stations.iter().all(|s| s.is_valid_url()));
}

#[tokio::test]
async fn favorite_toggle_reflected_in_next_snapshot_and_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let store = FavoritesStore::load(dir.path().join("favorites.toml"));
    let mut rx = store.observe();
    let base = group_stations(fallback_stations());

    store.toggle("4").await.unwrap();
    rx.changed().await.unwrap();
    let snapshot: BTreeSet<String> = rx.borrow_and_update().clone();
    assert!(snapshot.contains("4"));

    let catalog = apply_favorites(&base, &snapshot);
    assert_eq!(catalog[0].id(), "4");
    assert!(catalog[0].is_favorite());
    assert_eq!(flatten(&catalog).iter().filter(|s| s.is_favorite).count(), 1);
}

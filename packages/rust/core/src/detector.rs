//! Change detection between the live listing and the stored catalog.

use coursewatch_shared::{Catalog, ChangeEvent, ChangeKind, ContentItem, ContentKind};

/// Events for `current` against `catalog`, in listing order.
///
/// An id the catalog has never seen is `New`. An item stored as Text that is
/// now Video is `Upgraded`. Every other transition, including title changes
/// and Video back to Text, is silent.
pub fn diff(current: &[ContentItem], catalog: &Catalog) -> Vec<ChangeEvent> {
    current
        .iter()
        .filter_map(|item| {
            let kind = match catalog.get(&item.id) {
                None => ChangeKind::New,
                Some(stored)
                    if stored.content_kind == ContentKind::Text
                        && item.content_kind == ContentKind::Video =>
                {
                    ChangeKind::Upgraded
                }
                Some(_) => return None,
            };
            Some(ChangeEvent {
                kind,
                item: item.clone(),
            })
        })
        .collect()
}

/// The catalog that replaces the stored one after a successful cycle.
/// Ids missing from `current` are dropped.
pub fn derive_snapshot(current: &[ContentItem]) -> Catalog {
    let mut catalog = Catalog::new();
    for item in current {
        // First occurrence wins, matching the listing parser.
        if !catalog.contains(&item.id) {
            catalog.insert(item.id.clone(), item.to_record());
        }
    }
    catalog
}

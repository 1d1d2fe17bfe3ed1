//! Store commands, answered on the surface that asked.
//!
//! These never go through the core loop: the store has its own lock and the
//! reply belongs to one client, not to every subscriber.

use stream_proto::protocol::{Broadcast, Command, Entry, EntryKey, TableKind};
use tracing::{error, info};

use crate::store::{SharedDatabase, StoreError};

/// Run a store command and build the reply.  `None` for anything else.
///
/// Mutations reply with the table's contents after the change.
pub fn apply(store: &SharedDatabase, cmd: &Command) -> Option<Broadcast> {
    let result = match cmd {
        Command::ListEntries { table } => list(store, *table),
        Command::AddFavorite { url, name } => add_favorite(store, url, name),
        Command::UpdateFavorite {
            id,
            url,
            name,
            count,
        } => update_favorite(store, *id, url, name, *count),
        Command::DeleteEntry { table, key } => delete(store, *table, key),
        _ => return None,
    };

    Some(match result {
        Ok((table, entries)) => Broadcast::Entries { table, entries },
        Err(e) => rejection(&e),
    })
}

type Listing = (TableKind, Vec<Entry>);

fn list(store: &SharedDatabase, table: TableKind) -> Result<Listing, StoreError> {
    let entries = store.lock().table(table).get_all()?;
    Ok((table, entries))
}

fn add_favorite(store: &SharedDatabase, url: &str, name: &str) -> Result<Listing, StoreError> {
    let db = store.lock();
    let favorites = db.favorites();
    let outcome = favorites.insert(url, Some(name))?;
    info!("entries: favorite {} saved as id {}", name, outcome.id());
    let entries = favorites.get_all()?;
    Ok((TableKind::Favorites, entries))
}

fn update_favorite(
    store: &SharedDatabase,
    id: i64,
    url: &str,
    name: &str,
    count: Option<i64>,
) -> Result<Listing, StoreError> {
    let db = store.lock();
    let favorites = db.favorites();
    favorites.update(id, url, Some(name), count)?;
    let entries = favorites.get_all()?;
    Ok((TableKind::Favorites, entries))
}

fn delete(store: &SharedDatabase, table: TableKind, key: &EntryKey) -> Result<Listing, StoreError> {
    let db = store.lock();
    let rows = db.table(table);
    rows.delete(key)?;
    let entries = rows.get_all()?;
    Ok((table, entries))
}

/// Validation failures become `Rejected`; database failures become `Error`.
pub fn rejection(e: &StoreError) -> Broadcast {
    match e.kind() {
        Some(kind) => Broadcast::Rejected {
            kind,
            message: kind.to_string(),
        },
        None => {
            error!("entries: {}", e);
            Broadcast::Error {
                message: e.to_string(),
            }
        }
    }
}

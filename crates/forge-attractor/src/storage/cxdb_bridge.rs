//! Wires a CXDB binary/HTTP client pair into the
//! [`SharedAttractorStorageWriter`]/[`SharedAttractorArtifactWriter`]
//! `forge-cli` hands to a run. `forge_turnstore_cxdb::CxdbTurnStore`
//! implements `forge_turnstore::{TurnStore, ArtifactStore}` directly, so it
//! satisfies this module's blanket impls with no conversion layer.
use crate::storage::{SharedAttractorArtifactWriter, SharedAttractorStorageWriter};
use forge_turnstore_cxdb::{CxdbBinaryClient, CxdbHttpClient, CxdbTurnStore};
use std::sync::Arc;

type DynCxdbTurnStore = CxdbTurnStore<Arc<dyn CxdbBinaryClient>, Arc<dyn CxdbHttpClient>>;

/// Builds the CXDB-backed [`SharedAttractorStorageWriter`] `forge-cli` wires
/// up when run persistence is enabled.
pub fn cxdb_storage_writer(
    binary: Arc<dyn CxdbBinaryClient>,
    http: Arc<dyn CxdbHttpClient>,
) -> SharedAttractorStorageWriter {
    let store: DynCxdbTurnStore = CxdbTurnStore::new(binary, http);
    Arc::new(store)
}

/// Builds the CXDB-backed [`SharedAttractorArtifactWriter`] counterpart.
pub fn cxdb_artifact_writer(
    binary: Arc<dyn CxdbBinaryClient>,
    http: Arc<dyn CxdbHttpClient>,
) -> SharedAttractorArtifactWriter {
    let store: DynCxdbTurnStore = CxdbTurnStore::new(binary, http);
    Arc::new(store)
}

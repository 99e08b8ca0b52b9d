//! Poke assembly and per-client projection.
//!
//! A [`Poker`] collects one CVR advancement's patches, then projects them
//! per client relative to that client's `baseCookie`:
//!
//! * clients whose schema version is out of range get a terminal
//!   `SchemaVersionNotSupported` error;
//! * a poke that would not move a client past its base cookie produces no
//!   frames at all (no-op pokes and canceled pokes are elided);
//! * otherwise the client receives `pokeStart`, patch-batched `pokePart`
//!   frames and a `pokeEnd` carrying the new cookie.
//!
//! Within one client's stream, frames are strictly ordered and cookies
//! monotonic; nothing is promised across clients.

use crate::client::ClientConnection;
use crate::cvr::{Patch, PatchToVersion};
use std::collections::BTreeMap;
use tracing::debug;
use zync_core::models::version::CvrVersion;
use zync_core::models::schema::SchemaVersions;
use zync_core::protocol::{
    Downstream, ErrorBody, ErrorKind, PokeEndBody, PokePartBody, PokeStartBody, QueriesPatch,
    RowsPatch,
};
use zync_core::ClientId;

/// Patches per `pokePart` frame.
const PATCHES_PER_PART: usize = 128;

pub struct Poker {
    schema_versions: SchemaVersions,
    patches: Vec<PatchToVersion>,
    lmid_changes: BTreeMap<ClientId, i64>,
}

impl Poker {
    /// Opens a poke toward `pokeVersion`; patches are added as the CVR
    /// transaction produces them.
    pub fn start(schema_versions: SchemaVersions) -> Self {
        Self { schema_versions, patches: Vec::new(), lmid_changes: BTreeMap::new() }
    }

    pub fn add_patch(&mut self, patch: PatchToVersion) {
        self.patches.push(patch);
    }

    pub fn add_patches(&mut self, patches: impl IntoIterator<Item = PatchToVersion>) {
        self.patches.extend(patches);
    }

    pub fn record_lmid_change(&mut self, client_id: ClientId, lmid: i64) {
        self.lmid_changes.insert(client_id, lmid);
    }

    /// Discards the poke; no client sees any frame.
    pub fn cancel(self) {
        debug!(patches = self.patches.len(), "canceled poke");
    }

    /// Completes the poke at `final_version`, sending each connected
    /// client its projection and advancing its base cookie.
    pub async fn end(self, final_version: &CvrVersion, clients: &mut Vec<ClientConnection>) {
        for client in clients.iter_mut() {
            if !client.is_open() {
                continue;
            }
            match project_poke(
                client.schema_version(),
                client.base_cookie(),
                &self.schema_versions,
                &self.patches,
                &self.lmid_changes,
                final_version,
            ) {
                Ok(frames) => {
                    if frames.is_empty() {
                        continue;
                    }
                    for frame in frames {
                        if !client.send(frame).await {
                            break;
                        }
                    }
                    if client.is_open() {
                        client.set_base_cookie(final_version.clone());
                    }
                }
                Err(error) => client.fail(error).await,
            }
        }
        clients.retain(|c| c.is_open());
    }
}

/// Builds the frame sequence for one client, or a terminal error.
pub fn project_poke(
    client_schema_version: u32,
    base_cookie: Option<&CvrVersion>,
    schema_versions: &SchemaVersions,
    patches: &[PatchToVersion],
    lmid_changes: &BTreeMap<ClientId, i64>,
    final_version: &CvrVersion,
) -> Result<Vec<Downstream>, ErrorBody> {
    if !schema_versions.supports(client_schema_version) {
        return Err(ErrorBody::new(
            ErrorKind::SchemaVersionNotSupported,
            format!(
                "client schema version {} is not in the supported range [{}, {}]",
                client_schema_version,
                schema_versions.min_supported_version,
                schema_versions.max_supported_version
            ),
        ));
    }

    // A poke that does not move the client forward is elided entirely.
    if let Some(base) = base_cookie {
        if final_version <= base {
            return Ok(Vec::new());
        }
    }

    let applicable: Vec<&PatchToVersion> = patches
        .iter()
        .filter(|p| match base_cookie {
            Some(base) => p.to_version > *base,
            None => true,
        })
        .collect();

    let poke_id = final_version.cookie();
    let mut frames = vec![Downstream::PokeStart(PokeStartBody {
        poke_id: poke_id.clone(),
        base_cookie: base_cookie.map(CvrVersion::cookie),
        schema_versions: *schema_versions,
    })];

    let mut lmids = lmid_changes.clone();
    for chunk in applicable.chunks(PATCHES_PER_PART) {
        let mut part = PokePartBody::new(poke_id.clone());
        for entry in chunk {
            match &entry.patch {
                Patch::DesiredQuery { client_id, patch } => {
                    push_desired(&mut part, client_id, patch.clone());
                }
                Patch::GotQuery(patch) => push_got(&mut part, patch.clone()),
                Patch::Row(patch) => push_row(&mut part, patch.clone()),
            }
        }
        if !lmids.is_empty() {
            part.last_mutation_id_changes = Some(std::mem::take(&mut lmids));
        }
        if !part.is_empty() {
            frames.push(Downstream::PokePart(part));
        }
    }
    if !lmids.is_empty() {
        let mut part = PokePartBody::new(poke_id.clone());
        part.last_mutation_id_changes = Some(lmids);
        frames.push(Downstream::PokePart(part));
    }

    frames.push(Downstream::PokeEnd(PokeEndBody {
        poke_id,
        cookie: final_version.cookie(),
    }));
    Ok(frames)
}

fn push_desired(part: &mut PokePartBody, client_id: &ClientId, patch: QueriesPatch) {
    part.desired_queries_patches
        .get_or_insert_with(BTreeMap::new)
        .entry(client_id.clone())
        .or_default()
        .push(patch);
}

fn push_got(part: &mut PokePartBody, patch: QueriesPatch) {
    part.got_queries_patch
        .get_or_insert_with(Vec::new)
        .push(patch);
}

fn push_row(part: &mut PokePartBody, patch: RowsPatch) {
    part.rows_patch
        .get_or_insert_with(Vec::new)
        .push(patch);
}

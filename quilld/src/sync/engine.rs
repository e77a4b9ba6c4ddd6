use std::collections::{HashMap, HashSet};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use quill_core::{
    ActivityFields, ActivityTypeFields, AttachmentFields, Change, FilterFields, NoteFields,
    PushRequest, QuillClient, QuillError, Resource, SpaceFields, TagFields, format_timestamp_ms,
};
use thiserror::Error;

use super::record::RecordMeta;
use super::store::{RecordStore, StoreError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("api error: {0}")]
    Api(#[from] QuillError),
}

/// Shared re-authentication flag. Once any component observes a 401/403
/// every sync and transfer path suspends until the user logs back in.
#[derive(Clone, Default)]
pub struct AuthState {
    required: Arc<AtomicBool>,
}

impl AuthState {
    pub fn is_required(&self) -> bool {
        self.required.load(Ordering::SeqCst)
    }

    pub fn set_required(&self) {
        self.required.store(true, Ordering::SeqCst);
    }

    pub fn acknowledge_login(&self) {
        self.required.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CyclePhase {
    Idle,
    Pushing,
    Pulling,
}

struct CycleState {
    phase: CyclePhase,
    queued: bool,
}

/// What one `run_sync_cycle` call accomplished. `ran` is false when the
/// call coalesced into a cycle already in flight.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleOutcome {
    pub ran: bool,
    pub pushed: usize,
    pub pulled: usize,
    pub errors: usize,
}

/// Push-then-pull reconciler over the record store.
///
/// Exactly one cycle runs at a time; requests that arrive mid-cycle set a
/// queued flag and the running cycle loops once more, so any burst of
/// change signals costs at most one extra cycle.
pub struct SyncEngine {
    client: QuillClient,
    store: RecordStore,
    auth: AuthState,
    state: Mutex<CycleState>,
}

impl SyncEngine {
    pub fn new(client: QuillClient, store: RecordStore, auth: AuthState) -> Self {
        Self {
            client,
            store,
            auth,
            state: Mutex::new(CycleState {
                phase: CyclePhase::Idle,
                queued: false,
            }),
        }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn auth(&self) -> &AuthState {
        &self.auth
    }

    pub fn is_syncing(&self) -> bool {
        self.lock_state().phase != CyclePhase::Idle
    }

    /// Fail-soft: a push failure is logged and the pull still runs, so
    /// local state keeps converging even when one direction is broken.
    pub async fn run_sync_cycle(&self) -> CycleOutcome {
        let mut outcome = CycleOutcome::default();
        if !self.begin_cycle() {
            return outcome;
        }
        outcome.ran = true;

        loop {
            if self.auth.is_required() {
                tracing::debug!("sync suspended: re-authentication required");
            } else {
                match self.push_phase().await {
                    Ok(pushed) => outcome.pushed += pushed,
                    Err(err) => {
                        self.observe_error(&err);
                        outcome.errors += 1;
                        tracing::warn!(error = %err, "push phase failed");
                    }
                }
                self.enter_pulling();
                if !self.auth.is_required() {
                    match self.pull_phase().await {
                        Ok(pulled) => outcome.pulled += pulled,
                        Err(err) => {
                            self.observe_error(&err);
                            outcome.errors += 1;
                            tracing::warn!(error = %err, "pull phase failed");
                        }
                    }
                }
            }
            if !self.finish_cycle() {
                break;
            }
            tracing::debug!("queued sync request, running another cycle");
        }
        outcome
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CycleState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn begin_cycle(&self) -> bool {
        let mut state = self.lock_state();
        if state.phase != CyclePhase::Idle {
            state.queued = true;
            return false;
        }
        state.phase = CyclePhase::Pushing;
        true
    }

    fn enter_pulling(&self) {
        self.lock_state().phase = CyclePhase::Pulling;
    }

    /// Returns true when a queued request means the loop should go again.
    fn finish_cycle(&self) -> bool {
        let mut state = self.lock_state();
        if state.queued {
            state.queued = false;
            state.phase = CyclePhase::Pushing;
            true
        } else {
            state.phase = CyclePhase::Idle;
            false
        }
    }

    fn observe_error(&self, err: &EngineError) {
        if let EngineError::Api(api) = err
            && api.is_auth()
        {
            self.auth.set_required();
        }
    }

    async fn push_phase(&self) -> Result<usize, EngineError> {
        let batch = self.store.dirty_batch().await?;
        if batch.is_empty() {
            return Ok(0);
        }
        let mut pushed = 0usize;
        let mut deferred = 0usize;

        // identified note deletions take the cheap dedicated endpoint
        let mut fast_deleted: HashSet<i64> = HashSet::new();
        for note in &batch.notes {
            let Some(server_id) = note.meta.server_id else {
                continue;
            };
            if !note.meta.is_tombstone() {
                continue;
            }
            match self.client.delete_note(server_id).await {
                Ok(()) => {
                    self.store.clear_dirty(Resource::Note, note.meta.local_id).await?;
                    fast_deleted.insert(note.meta.local_id);
                    pushed += 1;
                }
                Err(err) if err.is_auth() => return Err(err.into()),
                Err(err) => {
                    tracing::debug!(
                        note = note.meta.local_id,
                        error = %err,
                        "delete fast path failed, falling back to bulk push"
                    );
                }
            }
        }

        let mut provisioned: HashMap<i64, i64> = HashMap::new();
        let mut request = PushRequest::default();
        let mut pushed_refs: Vec<(Resource, i64)> = Vec::new();

        for space in &batch.spaces {
            if space.meta.server_id.is_none() {
                if space.meta.is_tombstone() {
                    // deleted before it ever reached the server
                    self.store
                        .clear_dirty(Resource::Space, space.meta.local_id)
                        .await?;
                    continue;
                }
                // provisioned synchronously so every child in this batch
                // can reference the space by server id
                if self
                    .space_wire_id(space.meta.local_id, &mut provisioned)
                    .await?
                    .is_some()
                {
                    pushed += 1;
                }
                continue;
            }
            request.spaces.push(change(
                &space.meta,
                SpaceFields {
                    name: space.name.clone(),
                },
            )?);
            pushed_refs.push((Resource::Space, space.meta.local_id));
        }

        for note in &batch.notes {
            if fast_deleted.contains(&note.meta.local_id) {
                continue;
            }
            let Some(space_id) = self.space_wire_id(note.space_id, &mut provisioned).await? else {
                deferred += 1;
                continue;
            };
            let parent_id = match note.parent_id {
                Some(parent) => self.store.server_id_of(Resource::Note, parent).await?,
                None => None,
            };
            request.notes.push(change(
                &note.meta,
                NoteFields {
                    text: note.text.clone(),
                    tags: note.tags.clone(),
                    parent_id,
                    space_id: Some(space_id),
                },
            )?);
            pushed_refs.push((Resource::Note, note.meta.local_id));
        }

        for tag in &batch.tags {
            let Some(space_id) = self.space_wire_id(tag.space_id, &mut provisioned).await? else {
                deferred += 1;
                continue;
            };
            request.tags.push(change(
                &tag.meta,
                TagFields {
                    name: tag.name.clone(),
                    space_id: Some(space_id),
                },
            )?);
            pushed_refs.push((Resource::Tag, tag.meta.local_id));
        }

        for filter in &batch.filters {
            let Some(space_id) = self.space_wire_id(filter.space_id, &mut provisioned).await?
            else {
                deferred += 1;
                continue;
            };
            let parent_id = match filter.parent_id {
                Some(parent) => self.store.server_id_of(Resource::Filter, parent).await?,
                None => None,
            };
            request.filters.push(change(
                &filter.meta,
                FilterFields {
                    query: filter.query.clone(),
                    parent_id,
                    space_id: Some(space_id),
                },
            )?);
            pushed_refs.push((Resource::Filter, filter.meta.local_id));
        }

        for activity_type in &batch.activity_types {
            request.activity_types.push(change(
                &activity_type.meta,
                ActivityTypeFields {
                    name: activity_type.name.clone(),
                    value_kind: activity_type.value_kind.clone(),
                    min_value: activity_type.min_value,
                    max_value: activity_type.max_value,
                },
            )?);
            pushed_refs.push((Resource::ActivityType, activity_type.meta.local_id));
        }

        for activity in &batch.activities {
            // the owning note must be identified first; until then the
            // activity stays dirty and rides the next cycle
            let Some(note_id) = self.store.server_id_of(Resource::Note, activity.note_id).await?
            else {
                deferred += 1;
                continue;
            };
            let type_id = match activity.type_id {
                Some(t) => self.store.server_id_of(Resource::ActivityType, t).await?,
                None => None,
            };
            request.activities.push(change(
                &activity.meta,
                ActivityFields {
                    note_id: Some(note_id),
                    type_id,
                    value: activity.value,
                },
            )?);
            pushed_refs.push((Resource::Activity, activity.meta.local_id));
        }

        for attachment in &batch.attachments {
            let Some(note_id) = self
                .store
                .server_id_of(Resource::Note, attachment.note_id)
                .await?
            else {
                deferred += 1;
                continue;
            };
            request.attachments.push(change(
                &attachment.meta,
                AttachmentFields {
                    note_id: Some(note_id),
                    file_name: attachment.file_name.clone(),
                    mime_type: attachment.mime_type.clone(),
                    size: attachment.size,
                },
            )?);
            pushed_refs.push((Resource::Attachment, attachment.meta.local_id));
        }

        if !request.is_empty() {
            let response = self.client.push(&request).await?;
            self.store
                .apply_push_results(&pushed_refs, &response.mappings)
                .await?;
            pushed += pushed_refs.len();
        }
        if pushed > 0 || deferred > 0 {
            tracing::info!(pushed, deferred, "push phase complete");
        }
        Ok(pushed)
    }

    async fn pull_phase(&self) -> Result<usize, EngineError> {
        let since = self.store.checkpoint().await?;
        let response = self.client.pull(since).await?;
        let applied = self.store.apply_pull(&response).await?;
        if let Some(candidate) = applied.checkpoint_candidate_ms {
            // one millisecond back so a row stamped exactly at the
            // checkpoint is never skipped by the next pull
            self.store.advance_checkpoint(candidate - 1).await?;
        }
        if applied.applied > 0 {
            tracing::info!(
                pulled = applied.applied,
                spaces = applied.changed_spaces.len(),
                "pull phase complete"
            );
        }
        Ok(applied.applied)
    }

    /// Server id for a space, provisioning it on the spot when the space
    /// has never been pushed. The map memoizes lookups for the batch.
    async fn space_wire_id(
        &self,
        space_local_id: i64,
        provisioned: &mut HashMap<i64, i64>,
    ) -> Result<Option<i64>, EngineError> {
        if let Some(server_id) = provisioned.get(&space_local_id) {
            return Ok(Some(*server_id));
        }
        if let Some(server_id) = self
            .store
            .server_id_of(Resource::Space, space_local_id)
            .await?
        {
            provisioned.insert(space_local_id, server_id);
            return Ok(Some(server_id));
        }
        let Some(space) = self.store.get_space(space_local_id).await? else {
            return Ok(None);
        };
        if space.meta.is_tombstone() {
            // a deleted, never-pushed space must not be created server-side;
            // its children defer instead
            return Ok(None);
        }
        let Some(client_id) = space.meta.client_id.clone() else {
            return Ok(None);
        };
        let created = self.client.create_space(&space.name, &client_id).await?;
        self.store
            .apply_mapping(Resource::Space, &client_id, created.id)
            .await?;
        self.store
            .clear_dirty(Resource::Space, space_local_id)
            .await?;
        provisioned.insert(space_local_id, created.id);
        tracing::debug!(space = space_local_id, server_id = created.id, "provisioned space");
        Ok(Some(created.id))
    }
}

fn change<T>(meta: &RecordMeta, fields: T) -> Result<Change<T>, EngineError> {
    Ok(Change {
        id: meta.server_id,
        client_id: if meta.server_id.is_some() {
            None
        } else {
            meta.client_id.clone()
        },
        modified_at: format_timestamp_ms(meta.modified_at)?,
        deleted_at: meta.deleted_at.map(format_timestamp_ms).transpose()?,
        fields,
    })
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;

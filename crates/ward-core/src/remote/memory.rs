//! In-process remote backend.
//!
//! Holds one aggregate per account and enforces the remote write rules:
//! every successful write bumps the account revision by exactly one, stale
//! saves are rejected as conflicts, empty-patient saves against a populated
//! account need `confirm_wipe`, and pushes are de-duplicated by idempotency
//! key. Rejections never partially apply.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, mpsc, Notify};

use super::{
    AcceptInboxResponse, CheckInboxResponse, DeclineInboxResponse, EmptyTrashRequest,
    EmptyTrashResponse, HeartbeatRequest, HeartbeatResponse, InboxActionRequest, LoadRequest,
    LoadResponse, MoveToTrashRequest, MoveToTrashResponse, PushAck, PushRequest, RejectCode,
    RemoteApi, RemoteChange, RemoteError, RemoteResult, RestoreFromTrashRequest,
    RestoreFromTrashResponse, SaveOutcome, SaveRequest, SendPatientRequest, SendPatientResponse,
    Subscription,
};
use crate::models::{
    Aggregate, DeviceSession, InboxItem, InboxStatus, Operation, Record, RecordId, RecordKind,
    TrashItem,
};
use crate::util::now_ms;

/// Revision gap beyond which a heartbeat asks the device for a full resync
pub const FORCE_FULL_SYNC_REV_GAP: u64 = 25;

const CHANGE_CHANNEL_CAPACITY: usize = 256;
const SUBSCRIPTION_BUFFER: usize = 32;

#[derive(Debug, Clone)]
struct BackendChange {
    user: String,
    kind: RecordKind,
    records: Vec<Record>,
    rev: u64,
}

#[derive(Debug, Default)]
struct Account {
    rev: u64,
    data: Aggregate,
    /// Idempotency keys already applied, with the revision they produced
    applied: HashMap<String, u64>,
    trash: Vec<TrashItem>,
    sessions: HashMap<String, DeviceSession>,
    read_only: bool,
}

impl Account {
    fn bump(&mut self) -> u64 {
        self.rev += 1;
        self.rev
    }
}

#[derive(Debug, Default)]
struct BackendState {
    accounts: HashMap<String, Account>,
    inboxes: HashMap<String, Vec<InboxItem>>,
    push_log: Vec<PushRequest>,
}

impl BackendState {
    fn account(&mut self, user: &str) -> &mut Account {
        self.accounts.entry(user.to_string()).or_default()
    }
}

/// A push parked by [`MemoryBackend::hold_next_push`]
#[derive(Debug, Clone, Default)]
pub struct HeldPush {
    arrived: Arc<Notify>,
    release: Arc<Notify>,
}

impl HeldPush {
    /// Wait until the held push has reached the backend
    pub async fn arrived(&self) {
        self.arrived.notified().await;
    }

    /// Let the held push continue
    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// Shared state of the in-process remote, one aggregate per account
pub struct MemoryBackend {
    state: Mutex<BackendState>,
    changes: broadcast::Sender<BackendChange>,
    faults: Mutex<VecDeque<RemoteError>>,
    held_push: Mutex<Option<HeldPush>>,
    lose_next_ack: AtomicBool,
    reachable: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(BackendState::default()),
            changes,
            faults: Mutex::new(VecDeque::new()),
            held_push: Mutex::new(None),
            lose_next_ack: AtomicBool::new(false),
            reachable: AtomicBool::new(true),
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Client handle acting as `user`
    pub fn client(self: &Arc<Self>, user: impl Into<String>) -> MemoryRemote {
        MemoryRemote {
            backend: Arc::clone(self),
            user: user.into(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -- fault injection ---------------------------------------------------

    /// Fail the next RPC (any kind) with `error` before it reaches the state
    pub fn fail_next(&self, error: RemoteError) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
    }

    /// Park the next push before it is processed, until released
    pub fn hold_next_push(&self) -> HeldPush {
        let held = HeldPush::default();
        *self
            .held_push
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(held.clone());
        held
    }

    fn take_held_push(&self) -> Option<HeldPush> {
        self.held_push
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Apply the next push but report a network failure to the caller
    pub fn lose_next_ack(&self) {
        self.lose_next_ack.store(true, Ordering::SeqCst);
    }

    /// Simulate the network being down (`false`) or back (`true`)
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make an account refuse every write with `permission-denied`
    pub fn set_read_only(&self, user: &str, read_only: bool) {
        self.lock().account(user).read_only = read_only;
    }

    fn check_fault(&self) -> RemoteResult<()> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("remote unreachable".to_string()));
        }
        let fault = self
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        fault.map_or(Ok(()), Err)
    }

    // -- inspection ---------------------------------------------------------

    pub fn rev(&self, user: &str) -> u64 {
        self.lock().accounts.get(user).map_or(0, |account| account.rev)
    }

    pub fn data(&self, user: &str) -> Aggregate {
        self.lock()
            .accounts
            .get(user)
            .map(|account| account.data.clone())
            .unwrap_or_default()
    }

    pub fn trash(&self, user: &str) -> Vec<TrashItem> {
        self.lock()
            .accounts
            .get(user)
            .map(|account| account.trash.clone())
            .unwrap_or_default()
    }

    /// Every push that reached the backend, in arrival order
    pub fn push_log(&self) -> Vec<PushRequest> {
        self.lock().push_log.clone()
    }

    /// Seed an account without going through the write rules
    pub fn seed(&self, user: &str, rev: u64, data: Aggregate) {
        let mut state = self.lock();
        let account = state.account(user);
        account.rev = rev;
        account.data = data;
    }

    fn publish(&self, user: &str, kinds: &[RecordKind], account: &Account) {
        for kind in kinds {
            let change = BackendChange {
                user: user.to_string(),
                kind: *kind,
                records: account.data.records(*kind),
                rev: account.rev,
            };
            if self.changes.send(change).is_err() {
                tracing::trace!("no subscribers for backend change");
            }
        }
    }

    // -- RPC handlers ---------------------------------------------------------

    pub fn load_data(&self, user: &str, request: &LoadRequest) -> LoadResponse {
        let mut state = self.lock();
        let account = state.account(user);
        if request.client_rev >= account.rev {
            LoadResponse {
                data: None,
                rev: account.rev,
                up_to_date: true,
            }
        } else {
            LoadResponse {
                data: Some(account.data.clone()),
                rev: account.rev,
                up_to_date: false,
            }
        }
    }

    pub fn save_data(&self, user: &str, request: SaveRequest) -> RemoteResult<SaveOutcome> {
        let mut state = self.lock();
        let account = state.account(user);
        if account.read_only {
            return Err(RemoteError::rejected(
                RejectCode::PermissionDenied,
                "account is read-only",
            ));
        }

        if request.base_rev < account.rev && !request.force {
            tracing::warn!(
                base_rev = request.base_rev,
                server_rev = account.rev,
                device = %request.device_id,
                "Rejected stale save"
            );
            return Ok(SaveOutcome::Conflict {
                server_rev: account.rev,
                server_data: account.data.clone(),
            });
        }

        let server_patient_count = account.data.patient_count();
        if request.payload.patient_count() == 0 && server_patient_count > 0 && !request.confirm_wipe
        {
            tracing::warn!(
                server_patient_count,
                device = %request.device_id,
                "Rejected save that would wipe all patients"
            );
            return Ok(SaveOutcome::Safeguard {
                server_patient_count,
            });
        }

        account.data = request.payload;
        let rev = account.bump();
        self.publish(user, &RecordKind::ALL, account);
        Ok(SaveOutcome::Saved { rev })
    }

    pub fn push_mutation(&self, user: &str, request: PushRequest) -> RemoteResult<PushAck> {
        let mut state = self.lock();
        state.push_log.push(request.clone());
        let account = state.account(user);
        if account.read_only {
            return Err(RemoteError::rejected(
                RejectCode::PermissionDenied,
                "account is read-only",
            ));
        }

        if account.applied.contains_key(&request.idempotency_key) {
            return Ok(PushAck {
                rev: account.rev,
                duplicate: true,
            });
        }

        validate_push(&request)?;
        let trashed = account
            .trash
            .iter()
            .any(|item| item.item_type == request.collection && item.id == request.doc_id);
        if trashed {
            return Err(RemoteError::rejected(
                RejectCode::FailedPrecondition,
                format!("{} {} is in trash", request.collection, request.doc_id),
            ));
        }

        match (request.operation, request.payload) {
            (Operation::Add | Operation::Update, Some(mut record)) => {
                if record.is_deleted() {
                    record.clear_deleted(record.updated_at());
                }
                account.data.upsert(record);
            }
            (Operation::Delete, _) => {
                account.data.remove(request.collection, &request.doc_id);
            }
            (_, None) => unreachable_payload()?,
        }

        let rev = account.bump();
        account.applied.insert(request.idempotency_key, rev);
        self.publish(user, &[request.collection], account);
        Ok(PushAck {
            rev,
            duplicate: false,
        })
    }

    pub fn move_to_trash(
        &self,
        user: &str,
        request: &MoveToTrashRequest,
        now: i64,
    ) -> RemoteResult<MoveToTrashResponse> {
        let mut state = self.lock();
        let account = state.account(user);
        if account.read_only {
            return Err(RemoteError::rejected(
                RejectCode::PermissionDenied,
                "account is read-only",
            ));
        }

        let mut trashed_count = 0;
        for id in &request.item_ids {
            if let Some(mut record) = account.data.remove(request.item_type, id) {
                record.mark_deleted(now);
                account.trash.retain(|item| &item.id != id);
                account.trash.push(TrashItem::new(record, user, now));
                trashed_count += 1;
            }
        }
        if trashed_count > 0 {
            account.bump();
            self.publish(user, &[request.item_type], account);
        }
        Ok(MoveToTrashResponse { trashed_count })
    }

    pub fn restore_from_trash(
        &self,
        user: &str,
        request: &RestoreFromTrashRequest,
        now: i64,
    ) -> RemoteResult<RestoreFromTrashResponse> {
        let mut state = self.lock();
        let account = state.account(user);
        if account.read_only {
            return Err(RemoteError::rejected(
                RejectCode::PermissionDenied,
                "account is read-only",
            ));
        }

        let wanted: HashSet<&RecordId> = request.item_ids.iter().collect();
        let (restorable, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut account.trash)
            .into_iter()
            .partition(|item| wanted.contains(&item.id) && !item.is_expired(now));
        account.trash = kept;

        let mut kinds = Vec::new();
        for item in &restorable {
            let mut record = item.record.clone();
            record.clear_deleted(now);
            account.data.upsert(record);
            if !kinds.contains(&item.item_type) {
                kinds.push(item.item_type);
            }
        }
        if !restorable.is_empty() {
            account.bump();
            self.publish(user, &kinds, account);
        }
        Ok(RestoreFromTrashResponse {
            restored_count: restorable.len(),
        })
    }

    pub fn empty_trash(&self, user: &str, request: &EmptyTrashRequest) -> EmptyTrashResponse {
        let mut state = self.lock();
        let account = state.account(user);
        let before = account.trash.len();
        match &request.item_ids {
            Some(ids) => account.trash.retain(|item| !ids.contains(&item.id)),
            None => account.trash.clear(),
        }
        EmptyTrashResponse {
            deleted_count: before - account.trash.len(),
        }
    }

    /// Permanently remove expired trash across all accounts
    pub fn sweep_expired_trash(&self, now: i64) -> usize {
        let mut state = self.lock();
        let mut removed = 0;
        for account in state.accounts.values_mut() {
            let before = account.trash.len();
            account.trash.retain(|item| !item.is_expired(now));
            removed += before - account.trash.len();
        }
        if removed > 0 {
            tracing::info!(removed, "Swept expired trash");
        }
        removed
    }

    pub fn send_patient(
        &self,
        user: &str,
        request: SendPatientRequest,
        now: i64,
    ) -> RemoteResult<SendPatientResponse> {
        if request.to_user.trim().is_empty() {
            return Err(RemoteError::rejected(
                RejectCode::InvalidArgument,
                "recipient must not be empty",
            ));
        }
        let item = InboxItem {
            id: RecordId::new(),
            from_user: user.to_string(),
            to_user: request.to_user.clone(),
            patient: request.patient,
            note: request.note,
            status: InboxStatus::Pending,
            sent_at: now,
        };
        let inbox_id = item.id.clone();
        self.lock()
            .inboxes
            .entry(request.to_user)
            .or_default()
            .push(item);
        Ok(SendPatientResponse { inbox_id })
    }

    pub fn check_inbox(&self, user: &str) -> CheckInboxResponse {
        let state = self.lock();
        let items = state
            .inboxes
            .get(user)
            .map(|items| {
                items
                    .iter()
                    .filter(|item| item.status == InboxStatus::Pending)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        CheckInboxResponse { items }
    }

    pub fn accept_inbox_patient(
        &self,
        user: &str,
        request: &InboxActionRequest,
    ) -> RemoteResult<AcceptInboxResponse> {
        let mut state = self.lock();
        let patient = {
            let item = pending_inbox_item(&mut state, user, &request.inbox_id)?;
            item.status = InboxStatus::Accepted;
            item.patient.clone()
        };
        let account = state.account(user);
        account.data.upsert(patient.clone().into());
        let rev = account.bump();
        self.publish(user, &[RecordKind::Patient], account);
        Ok(AcceptInboxResponse { patient, rev })
    }

    pub fn decline_inbox_patient(
        &self,
        user: &str,
        request: &InboxActionRequest,
    ) -> RemoteResult<DeclineInboxResponse> {
        let mut state = self.lock();
        let item = pending_inbox_item(&mut state, user, &request.inbox_id)?;
        item.status = InboxStatus::Declined;
        Ok(DeclineInboxResponse { declined: true })
    }

    pub fn heartbeat(&self, user: &str, request: HeartbeatRequest, now: i64) -> HeartbeatResponse {
        let mut state = self.lock();
        let account = state.account(user);
        account.sessions.retain(|_, session| session.is_active(now));
        account.sessions.insert(
            request.device_id.clone(),
            DeviceSession {
                device_id: request.device_id,
                device_info: request.device_info,
                last_seen: now,
                client_rev: request.client_rev,
            },
        );

        let rev_gap = account.rev.saturating_sub(request.client_rev);
        HeartbeatResponse {
            rev: account.rev,
            force_full_sync: request.client_rev > account.rev || rev_gap > FORCE_FULL_SYNC_REV_GAP,
            rev_gap,
            active_devices: account.sessions.len(),
        }
    }

    fn subscribe(
        &self,
        user: &str,
        kind: RecordKind,
        client_rev: u64,
    ) -> RemoteResult<Subscription> {
        let mut changes = self.changes.subscribe();
        let initial = {
            let mut state = self.lock();
            let account = state.account(user);
            (account.rev > client_rev).then(|| RemoteChange::Snapshot {
                kind,
                records: account.data.records(kind),
                rev: account.rev,
            })
        };

        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let user = user.to_string();
        let task = tokio::spawn(async move {
            if let Some(initial) = initial {
                if sender.send(initial).await.is_err() {
                    return;
                }
            }
            loop {
                match changes.recv().await {
                    Ok(change) if change.user == user && change.kind == kind => {
                        let snapshot = RemoteChange::Snapshot {
                            kind,
                            records: change.records,
                            rev: change.rev,
                        };
                        if sender.send(snapshot).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Subscription lagged behind backend changes");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription::new(kind, receiver, task))
    }
}

fn validate_push(request: &PushRequest) -> RemoteResult<()> {
    match (&request.operation, &request.payload) {
        (Operation::Delete, _) => Ok(()),
        (_, None) => Err(RemoteError::rejected(
            RejectCode::InvalidArgument,
            format!("{} without payload", request.operation),
        )),
        (_, Some(record)) if record.kind() != request.collection => {
            Err(RemoteError::rejected(
                RejectCode::InvalidArgument,
                format!(
                    "payload kind {} does not match collection {}",
                    record.kind().as_str(),
                    request.collection
                ),
            ))
        }
        (_, Some(record)) if record.id() != &request.doc_id => Err(RemoteError::rejected(
            RejectCode::InvalidArgument,
            format!(
                "payload id {} does not match document {}",
                record.id(),
                request.doc_id
            ),
        )),
        (_, Some(_)) => Ok(()),
    }
}

fn unreachable_payload() -> RemoteResult<()> {
    Err(RemoteError::rejected(
        RejectCode::InvalidArgument,
        "write without payload",
    ))
}

fn pending_inbox_item<'a>(
    state: &'a mut BackendState,
    user: &str,
    inbox_id: &RecordId,
) -> RemoteResult<&'a mut InboxItem> {
    state
        .inboxes
        .get_mut(user)
        .and_then(|items| {
            items
                .iter_mut()
                .find(|item| &item.id == inbox_id && item.status == InboxStatus::Pending)
        })
        .ok_or_else(|| {
            RemoteError::rejected(
                RejectCode::NotFound,
                format!("no pending inbox item {inbox_id}"),
            )
        })
}

/// [`RemoteApi`] handle bound to one account of a [`MemoryBackend`]
#[derive(Clone)]
pub struct MemoryRemote {
    backend: Arc<MemoryBackend>,
    user: String,
}

impl MemoryRemote {
    pub fn user(&self) -> &str {
        &self.user
    }

    pub const fn backend(&self) -> &Arc<MemoryBackend> {
        &self.backend
    }
}

impl RemoteApi for MemoryRemote {
    async fn load_data(&self, request: LoadRequest) -> RemoteResult<LoadResponse> {
        self.backend.check_fault()?;
        Ok(self.backend.load_data(&self.user, &request))
    }

    async fn save_data(&self, request: SaveRequest) -> RemoteResult<SaveOutcome> {
        self.backend.check_fault()?;
        self.backend.save_data(&self.user, request)
    }

    async fn push_mutation(&self, request: PushRequest) -> RemoteResult<PushAck> {
        if let Some(held) = self.backend.take_held_push() {
            held.arrived.notify_one();
            held.release.notified().await;
        }
        self.backend.check_fault()?;
        let ack = self.backend.push_mutation(&self.user, request)?;
        if self.backend.lose_next_ack.swap(false, Ordering::SeqCst) {
            return Err(RemoteError::Network("connection reset".to_string()));
        }
        Ok(ack)
    }

    async fn move_to_trash(&self, request: MoveToTrashRequest) -> RemoteResult<MoveToTrashResponse> {
        self.backend.check_fault()?;
        self.backend.move_to_trash(&self.user, &request, now_ms())
    }

    async fn restore_from_trash(
        &self,
        request: RestoreFromTrashRequest,
    ) -> RemoteResult<RestoreFromTrashResponse> {
        self.backend.check_fault()?;
        self.backend.restore_from_trash(&self.user, &request, now_ms())
    }

    async fn empty_trash(&self, request: EmptyTrashRequest) -> RemoteResult<EmptyTrashResponse> {
        self.backend.check_fault()?;
        Ok(self.backend.empty_trash(&self.user, &request))
    }

    async fn send_patient(&self, request: SendPatientRequest) -> RemoteResult<SendPatientResponse> {
        self.backend.check_fault()?;
        self.backend.send_patient(&self.user, request, now_ms())
    }

    async fn check_inbox(&self) -> RemoteResult<CheckInboxResponse> {
        self.backend.check_fault()?;
        Ok(self.backend.check_inbox(&self.user))
    }

    async fn accept_inbox_patient(
        &self,
        request: InboxActionRequest,
    ) -> RemoteResult<AcceptInboxResponse> {
        self.backend.check_fault()?;
        self.backend.accept_inbox_patient(&self.user, &request)
    }

    async fn decline_inbox_patient(
        &self,
        request: InboxActionRequest,
    ) -> RemoteResult<DeclineInboxResponse> {
        self.backend.check_fault()?;
        self.backend.decline_inbox_patient(&self.user, &request)
    }

    async fn heartbeat(&self, request: HeartbeatRequest) -> RemoteResult<HeartbeatResponse> {
        self.backend.check_fault()?;
        Ok(self.backend.heartbeat(&self.user, request, now_ms()))
    }

    fn subscribe(&self, kind: RecordKind, client_rev: u64) -> RemoteResult<Subscription> {
        self.backend.check_fault()?;
        self.backend.subscribe(&self.user, kind, client_rev)
    }
}

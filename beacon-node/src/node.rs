//! The node: follows the chain, starts sessions and keeps group state.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use beacon_core::{
    clock::relay_entry_deadlines,
    keys::dkg::DkgState,
    operator::OperatorKey,
    selection::select_group,
    signing::SigningKind,
    Group, GroupId, GroupState, MemberIndex, OperatorId, ProtocolTimings, Seed, SessionId,
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    cancel::{cancel_pair, CancelSource, CancelToken},
    chain::{ChainEvent, ChainEventKind, ChainView, GroupCreationState},
    config::NodeConfig,
    metrics::{Metrics, MetricsSnapshot},
    retry::with_backoff,
    session::{
        dkg::{DkgReport, DkgTask, GroupKeys},
        signing::{SigningEnd, SigningReport, SigningTask},
        GroupStatus, SessionContext, SessionStatus, StatusBoard,
    },
    submitter::TransactionQueue,
    subscription::EventSubscription,
    supervisor::{Supervisor, Timer},
    transport::RoundTransport,
    NodeError,
};

enum Command {
    StartIfEligible {
        seed: Seed,
        reply: oneshot::Sender<Result<Option<SessionId>, NodeError>>,
    },
}

enum TaskOutcome {
    Dkg(DkgReport),
    Signing(SigningReport),
    HardTimeout(GroupId),
    /// A hard timeout watcher was cancelled.
    Released,
}

struct DkgEntry {
    events: mpsc::Sender<ChainEvent>,
    cancel: CancelSource,
    session: SessionId,
    timings: ProtocolTimings,
}

struct GroupRecord {
    group: Group,
    index: MemberIndex,
    keys: Option<GroupKeys>,
    timings: ProtocolTimings,
}

impl GroupRecord {
    fn status(&self) -> GroupStatus {
        GroupStatus {
            group_id: *self.group.group_id(),
            state: *self.group.state(),
            member_index: self.index,
            has_key_share: self
                .keys
                .as_ref()
                .is_some_and(|keys| keys.key_package.is_some()),
        }
    }
}

/// A random beacon node.
///
/// Created together with its [`NodeHandle`]; [`Node::run`] drives it until
/// the handle asks it to shut down.
pub struct Node {
    ctx: SessionContext,
    commands: mpsc::Receiver<Command>,
    shutdown: watch::Receiver<bool>,
    queue_worker: JoinHandle<()>,
    tasks: JoinSet<TaskOutcome>,
    dkg: HashMap<Seed, DkgEntry>,
    groups: HashMap<Seed, GroupRecord>,
    group_ids: HashMap<GroupId, Seed>,
    /// Signing sessions and hard timeout watchers per group.
    signing: HashMap<GroupId, Vec<CancelSource>>,
}

/// Control and observation of a running [`Node`]. Cheap to clone.
#[derive(Clone)]
pub struct NodeHandle {
    commands: mpsc::Sender<Command>,
    board: Arc<StatusBoard>,
    metrics: Arc<Metrics>,
    shutdown: Arc<watch::Sender<bool>>,
    operator_id: OperatorId,
}

impl Node {
    /// Create a node operated by `operator`.
    ///
    /// Spawns the transaction worker, so this must be called from within a
    /// Tokio runtime.
    pub fn new(
        config: NodeConfig,
        operator: OperatorKey,
        chain: Arc<dyn ChainView>,
        transport: Arc<dyn RoundTransport>,
    ) -> (Node, NodeHandle) {
        let (queue, queue_worker) = TransactionQueue::spawn(
            chain.clone(),
            config.retry.clone(),
            config.session.transaction_capacity,
        );
        let (commands, inbox) = mpsc::channel(config.session.command_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let operator_id = operator.operator_id();
        let ctx = SessionContext {
            operator: Arc::new(operator),
            chain,
            transport,
            queue,
            supervisor: Supervisor::new(0),
            metrics: Arc::new(Metrics::default()),
            board: Arc::new(StatusBoard::default()),
            config: Arc::new(config),
        };
        let handle = NodeHandle {
            commands,
            board: ctx.board.clone(),
            metrics: ctx.metrics.clone(),
            shutdown: Arc::new(shutdown),
            operator_id,
        };
        let node = Node {
            ctx,
            commands: inbox,
            shutdown: shutdown_rx,
            queue_worker,
            tasks: JoinSet::new(),
            dkg: HashMap::new(),
            groups: HashMap::new(),
            group_ids: HashMap::new(),
            signing: HashMap::new(),
        };
        (node, handle)
    }

    /// Run until shutdown is requested. Every running session is cancelled
    /// on the way out.
    pub async fn run(mut self) -> Result<(), NodeError> {
        let span = info_span!("node", operator = %self.ctx.operator.operator_id());
        let result = self.run_inner().instrument(span).await;

        for entry in self.dkg.values() {
            entry.cancel.cancel();
        }
        for sources in self.signing.values() {
            sources.iter().for_each(CancelSource::cancel);
        }
        while self.tasks.join_next().await.is_some() {}
        self.queue_worker.abort();
        result
    }

    async fn run_inner(&mut self) -> Result<(), NodeError> {
        let chain = self.ctx.chain.clone();
        let policy = self.ctx.config.retry.clone();
        let block = with_backoff(&policy, "current_block", || chain.current_block()).await?;
        self.ctx.supervisor.tick(block);
        info!(block, "node started");

        let supervisor = tokio::spawn(self.ctx.supervisor.clone().run(
            chain.clone(),
            policy.clone(),
            self.shutdown.clone(),
        ));
        let mut blocks = self.ctx.supervisor.blocks();
        let mut events = EventSubscription::new(
            chain,
            policy,
            block,
            self.ctx.config.session.dedup_horizon_blocks,
        );

        let result = loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!("shutting down");
                        break Ok(());
                    }
                }
                Some(command) = self.commands.recv() => self.on_command(command).await,
                event = events.next() => match event {
                    Ok(event) => self.on_event(event).await,
                    Err(error) => error!(%error, "lost the chain event stream"),
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => match joined {
                    Ok(outcome) => self.on_task(outcome),
                    Err(error) => error!(%error, "session task panicked or was aborted"),
                },
                changed = blocks.changed() => {
                    if changed.is_err() {
                        break Err(NodeError::Cancelled);
                    }
                    let block = *blocks.borrow_and_update();
                    self.on_block(block);
                }
            }
        };
        supervisor.abort();
        result
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::StartIfEligible { seed, reply } => {
                let result = self.start_if_eligible(seed).await;
                // The caller may have given up waiting.
                let _ = reply.send(result);
            }
        }
    }

    /// Start the DKG for `seed` if the local operator was selected. Asking
    /// again for a running or finished session returns its id.
    async fn start_if_eligible(&mut self, seed: Seed) -> Result<Option<SessionId>, NodeError> {
        if let Some(entry) = self.dkg.get(&seed) {
            return Ok(Some(entry.session));
        }
        if self.groups.contains_key(&seed) {
            return Ok(Some(DkgTask::status_id(&seed)));
        }

        let chain = self.ctx.chain.clone();
        let policy = &self.ctx.config.retry;
        let start_block = match with_backoff(policy, "group_creation_state", || {
            chain.group_creation_state()
        })
        .await?
        {
            GroupCreationState::AwaitingResult {
                seed: awaited,
                start_block,
            } if awaited == seed => start_block,
            state => {
                debug!(?state, "seed is not awaiting a result");
                return Err(NodeError::SeedUnavailable);
            }
        };
        let params = with_backoff(policy, "chain_parameters", || chain.chain_parameters()).await?;
        let pool = with_backoff(policy, "pool_snapshot", || chain.pool_snapshot(&seed)).await?;
        let members = select_group(&seed, &pool, *params.group().group_size())?;

        // Selection draws without replacement: an operator holds one seat at most.
        let operator = self.ctx.operator.operator_id();
        let Some(index) = Group::new(members.clone(), start_block)
            .indices_of(&operator)
            .first()
            .copied()
        else {
            debug!(%seed, "not selected");
            return Ok(None);
        };

        let session = DkgTask::status_id(&seed);
        let (events, inbox) = mpsc::channel(self.ctx.config.session.event_capacity.max(1));
        let (cancel, token) = cancel_pair();
        self.ctx.board.set_session(
            session,
            SessionStatus::Dkg {
                attempt: 0,
                state: DkgState::AwaitingSeed,
            },
        );
        self.ctx.board.set_group(
            seed,
            GroupStatus {
                group_id: None,
                state: GroupState::DkgInProgress,
                member_index: index,
                has_key_share: false,
            },
        );
        let timings = *params.timings();
        let task = DkgTask {
            ctx: self.ctx.clone(),
            seed,
            start_block,
            members,
            index,
            params,
            events: inbox,
            cancel: token,
        };
        self.tasks
            .spawn(async move { TaskOutcome::Dkg(task.run().await) });
        self.dkg.insert(
            seed,
            DkgEntry {
                events,
                cancel,
                session,
                timings,
            },
        );
        info!(%seed, member = %index, start_block, "selected, DKG started");
        Ok(Some(session))
    }

    async fn on_event(&mut self, event: ChainEvent) {
        debug!(block = event.block, log_index = event.log_index, "chain event");
        match &event.kind {
            ChainEventKind::DkgStarted { seed } => {
                let seed = *seed;
                if let Err(error) = self.start_if_eligible(seed).await {
                    warn!(%seed, %error, "could not start DKG");
                }
            }
            ChainEventKind::DkgResultSubmitted { seed, .. }
            | ChainEventKind::DkgResultChallenged { seed, .. }
            | ChainEventKind::DkgResultApproved { seed, .. }
            | ChainEventKind::DkgTimedOut { seed } => {
                if let Some(entry) = self.dkg.get(seed) {
                    if entry.events.try_send(event.clone()).is_err() {
                        warn!(%seed, "DKG session is not keeping up with chain events");
                    }
                }
            }
            ChainEventKind::GroupRegistered {
                seed, group_id, ..
            } => match self.groups.get(seed) {
                Some(record) if record.group.group_id().as_ref() == Some(group_id) => {
                    info!(%group_id, "group registered")
                }
                Some(_) => warn!(%group_id, "registered group differs from the local one"),
                None => {}
            },
            ChainEventKind::RelayEntryRequested {
                group_id,
                previous_entry,
            } => self.on_relay_request(*group_id, previous_entry.clone(), event.block),
            ChainEventKind::RelayEntrySubmitted { group_id, .. } => {
                if let Some(sources) = self.signing.remove(group_id) {
                    debug!(%group_id, "relay entry submitted");
                    sources.iter().for_each(CancelSource::cancel);
                }
            }
            ChainEventKind::RelayEntryTimedOut { group_id } => self.terminate_group(group_id),
        }
    }

    fn on_relay_request(&mut self, group_id: GroupId, previous_entry: Vec<u8>, block: u64) {
        let Some(seed) = self.group_ids.get(&group_id).copied() else {
            return;
        };
        let Some(record) = self.groups.get(&seed) else {
            return;
        };
        let Some(keys) = record
            .keys
            .as_ref()
            .filter(|_| *record.group.state() == GroupState::Active)
        else {
            debug!(%group_id, "group cannot sign");
            return;
        };

        let (cancel, token) = cancel_pair();
        let task = SigningTask {
            ctx: self.ctx.clone(),
            group_id,
            members: record.group.members().clone(),
            index: record.index,
            kind: SigningKind::RelayEntry { previous_entry },
            requested_at_block: block,
            key_package: keys.key_package.clone(),
            public_key_package: keys.public_key_package.clone(),
            timings: record.timings,
            cancel: token,
        };
        let session = SigningTask::session_id(&group_id, &task.kind);
        self.tasks
            .spawn(async move { TaskOutcome::Signing(task.run().await) });

        let (watch_cancel, watch_token) = cancel_pair();
        let (_, hard) = relay_entry_deadlines(block, &record.timings);
        let timer = self.ctx.supervisor.schedule(session, hard);
        self.tasks
            .spawn(hard_timeout_watch(group_id, timer, watch_token));

        self.signing
            .entry(group_id)
            .or_default()
            .extend([cancel, watch_cancel]);
        info!(%group_id, block, "relay entry requested");
    }

    fn on_task(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Dkg(report) => self.on_dkg_report(report),
            TaskOutcome::Signing(report) => self.on_signing_report(report),
            TaskOutcome::HardTimeout(group_id) => {
                warn!(%group_id, "relay entry hard timeout");
                self.ctx.metrics.signing_timeouts();
                self.terminate_group(&group_id);
            }
            TaskOutcome::Released => {}
        }
    }

    fn on_dkg_report(&mut self, report: DkgReport) {
        let DkgReport {
            seed,
            index,
            group,
            outcome,
        } = report;
        let Some(DkgEntry { timings, .. }) = self.dkg.remove(&seed) else {
            return;
        };
        let keys = match outcome {
            Ok(keys) => {
                info!(%seed, state = group.state().name(), "DKG finished");
                keys
            }
            Err(error) => {
                warn!(%seed, %error, "DKG ended without a group");
                None
            }
        };
        if let Some(group_id) = *group.group_id() {
            self.group_ids.insert(group_id, seed);
        }
        let record = GroupRecord {
            group,
            index,
            keys,
            timings,
        };
        self.ctx.board.set_group(seed, record.status());
        self.groups.insert(seed, record);
    }

    fn on_signing_report(&mut self, report: SigningReport) {
        let SigningReport {
            group_id,
            kind,
            result,
        } = report;
        match (kind, result) {
            (_, Ok(SigningEnd::Signed(_))) => debug!(%group_id, "signing finished"),
            (SigningKind::RelayEntry { .. }, Ok(SigningEnd::SoftTimeout { accused })) => {
                self.start_inactivity_claim(group_id, accused)
            }
            (SigningKind::InactivityClaim { .. }, Ok(SigningEnd::SoftTimeout { .. })) => {
                warn!(%group_id, "inactivity claim was not signed in time")
            }
            (_, Err(NodeError::Cancelled)) => {}
            (_, Err(error)) => warn!(%group_id, %error, "signing failed"),
        }
    }

    /// Have the group sign a claim that `accused` did not take part.
    fn start_inactivity_claim(
        &mut self,
        group_id: GroupId,
        accused: BTreeSet<MemberIndex>,
    ) {
        if accused.is_empty() {
            return;
        }
        let Some(record) = self
            .group_ids
            .get(&group_id)
            .and_then(|seed| self.groups.get(seed))
        else {
            return;
        };
        let Some(keys) = record.keys.as_ref() else {
            return;
        };

        let (cancel, token) = cancel_pair();
        let ctx = self.ctx.clone();
        let members = record.group.members().clone();
        let index = record.index;
        let key_package = keys.key_package.clone();
        let public_key_package = keys.public_key_package.clone();
        let timings = record.timings;
        info!(%group_id, ?accused, "claiming inactivity");
        self.tasks.spawn(async move {
            let chain = ctx.chain.clone();
            let nonce = with_backoff(&ctx.config.retry, "inactivity_nonce", || {
                chain.inactivity_nonce(&group_id)
            })
            .await;
            let kind = match nonce {
                Ok(nonce) => SigningKind::InactivityClaim { nonce, accused },
                Err(error) => {
                    return TaskOutcome::Signing(SigningReport {
                        group_id,
                        kind: SigningKind::InactivityClaim { nonce: 0, accused },
                        result: Err(error),
                    })
                }
            };
            let task = SigningTask {
                requested_at_block: ctx.supervisor.current_block(),
                ctx,
                group_id,
                members,
                index,
                kind,
                key_package,
                public_key_package,
                timings,
                cancel: token,
            };
            TaskOutcome::Signing(task.run().await)
        });
        self.signing.entry(group_id).or_default().push(cancel);
    }

    fn terminate_group(&mut self, group_id: &GroupId) {
        if let Some(sources) = self.signing.remove(group_id) {
            sources.iter().for_each(CancelSource::cancel);
        }
        let Some(seed) = self.group_ids.get(group_id).copied() else {
            return;
        };
        let Some(record) = self.groups.get_mut(&seed) else {
            return;
        };
        if *record.group.state() == GroupState::Terminated {
            return;
        }
        match record.group.terminate() {
            Ok(()) => {
                warn!(%group_id, "group terminated");
                record.keys = None;
                self.ctx.board.set_group(seed, record.status());
            }
            Err(error) => debug!(%group_id, %error, "group not terminated"),
        }
    }

    /// Expire groups whose lifetime ended.
    fn on_block(&mut self, block: u64) {
        for (seed, record) in self.groups.iter_mut() {
            match record.group.expire_if_due(block) {
                Ok(true) => {
                    info!(%seed, block, "group expired");
                    record.keys = None;
                    self.ctx.board.set_group(*seed, record.status());
                }
                Ok(false) => {}
                Err(error) => warn!(%seed, %error, "could not expire group"),
            }
        }
    }
}

async fn hard_timeout_watch(
    group_id: GroupId,
    timer: Timer,
    mut cancel: CancelToken,
) -> TaskOutcome {
    tokio::select! {
        _ = cancel.cancelled() => TaskOutcome::Released,
        fired = timer => match fired {
            Ok(_) => TaskOutcome::HardTimeout(group_id),
            Err(_) => TaskOutcome::Released,
        },
    }
}

impl NodeHandle {
    /// Start the DKG for `seed` if this node's operator was selected for
    /// its group. Returns the session id, or `None` if not selected.
    pub async fn start_if_eligible(&self, seed: Seed) -> Result<Option<SessionId>, NodeError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::StartIfEligible { seed, reply })
            .await
            .map_err(|_| NodeError::Cancelled)?;
        response.await.map_err(|_| NodeError::Cancelled)?
    }

    /// The latest status of a session.
    pub fn session_status(&self, session: &SessionId) -> Option<SessionStatus> {
        self.board.session(session)
    }

    /// The status of the group formed for `seed`, if this node is a member.
    pub fn group_status(&self, seed: &Seed) -> Option<GroupStatus> {
        self.board.group(seed)
    }

    /// Every group this node is a member of.
    pub fn groups(&self) -> Vec<(Seed, GroupStatus)> {
        self.board.groups()
    }

    /// Current counter values.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// The local operator.
    pub fn operator_id(&self) -> OperatorId {
        self.operator_id
    }

    /// Ask the node to cancel its sessions and stop.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

//! Service facade: glues the store, state engine, virtual-channel manager,
//! tunnel, chain watcher, dispute pipeline and peer protocol together, and
//! exposes the node's public operations.
//!
//! Every cross-peer workflow is decomposed into durable tasks in the
//! `channel-ops` pool, queued per channel address so counterparty validation
//! always sees contiguous seqnos. Handlers are idempotent around natural
//! keys (seqno, resolve amount, task id), which makes the at-least-once
//! execution of the queue safe.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use paynet_crypto::{sha256, Ed25519Keypair};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::chain::{
    ChainClient, ChannelEventPayload, ContractStatus, Wallet, KIND_CHANNEL_EVENT, POOL_CHAIN_EVENTS,
};
use crate::clock;
use crate::config::{ChannelConfig, CoinConfig};
use crate::dispute::{
    self, DisputePayload, KIND_CHALLENGE, KIND_FINALIZE, KIND_SETTLE_CONDITIONALS,
    KIND_UNCOOPERATIVE_CLOSE,
};
use crate::engine::{AppliedAction, ChannelAction, StateEngine};
use crate::error::NodeError;
use crate::peer::{PeerEnvelope, PeerRequest, PeerResponse, PeerTransport, ProposalEnvelope};
use crate::queue::{process_one, TaskHandler, TaskPool, TaskPoolHandle};
use crate::semichannel::{SignedSemiChannel, VirtualChannelState};
use crate::store::{KvExecutor, KvStore, PaymentsDb, Task};
use crate::tunnel::{
    generate_tunnel, unwrap_instruction, HopInstruction, TunnelChainPart, TUNNEL_PAD_LAYERS,
};
use crate::types::{
    Asset, Channel, ChannelHistoryEvent, ChannelHistoryItem, ChannelStatus, OnchainState, Side,
    VirtualChannelEventType, VirtualChannelMeta, VirtualChannelStatus,
};
use crate::vchan::{
    OpenVirtualPayload, VirtualChannelManager, VirtualKeyPayload, KIND_CLOSE_VIRTUAL,
    KIND_OPEN_VIRTUAL, KIND_PROPOSE_ACTION, KIND_REMOVE_VIRTUAL, POOL_CHANNEL_OPS,
};
use crate::webhook::{
    sign_body, VirtualChannelEvent, WebhookSink, KIND_VIRTUAL_CHANNEL_EVENT, POOL_WEBHOOKS,
};

/// Payload of a `propose-action` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeActionPayload {
    pub channel: String,
    pub action: ChannelAction,
}

/// One hop requested by the caller of [`Service::open_virtual_channel`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelHop {
    pub key: [u8; 32],
    pub fee: u128,
    /// Extra lifetime this hop's incoming condition gets on top of its
    /// successor's deadline.
    pub deadline_gap_seconds: i64,
}

/// Result of initiating a virtual channel.
#[derive(Debug, Clone)]
pub struct OpenedVirtual {
    pub public_key: [u8; 32],
    pub private_key_seed: [u8; 32],
    pub deadline: i64,
    pub channel_address: String,
}

/// The node core.
pub struct Service<S: KvStore> {
    engine: StateEngine,
    db: Arc<PaymentsDb<S>>,
    vchan: VirtualChannelManager<S>,
    chain: Arc<dyn ChainClient>,
    wallet: Arc<dyn Wallet>,
    peers: Arc<dyn PeerTransport>,
    webhooks: Arc<dyn WebhookSink>,
    cfg: ChannelConfig,

    channel_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    outbound_nonces: StdMutex<HashMap<[u8; 32], u64>>,
    inbound_nonces: StdMutex<HashMap<[u8; 32], u64>>,
    learned_tokens: StdMutex<HashMap<String, CoinConfig>>,
}

impl<S: KvStore> Service<S> {
    pub fn new(
        key: Ed25519Keypair,
        db: Arc<PaymentsDb<S>>,
        chain: Arc<dyn ChainClient>,
        wallet: Arc<dyn Wallet>,
        peers: Arc<dyn PeerTransport>,
        webhooks: Arc<dyn WebhookSink>,
        cfg: ChannelConfig,
    ) -> Result<Self, NodeError> {
        db.migrate()?;
        Ok(Self {
            engine: StateEngine::new(key),
            vchan: VirtualChannelManager::new(db.clone(), cfg.clone()),
            db,
            chain,
            wallet,
            peers,
            webhooks,
            cfg,
            channel_locks: Mutex::new(HashMap::new()),
            outbound_nonces: StdMutex::new(HashMap::new()),
            inbound_nonces: StdMutex::new(HashMap::new()),
            learned_tokens: StdMutex::new(HashMap::new()),
        })
    }

    pub fn public_key(&self) -> &[u8; 32] {
        self.engine.public_key()
    }

    pub fn database(&self) -> &Arc<PaymentsDb<S>> {
        &self.db
    }

    pub fn wallet_address(&self) -> String {
        self.wallet.address()
    }

    /// Spawn the worker pools. The service itself is the handler for all of
    /// them.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<TaskPoolHandle> {
        let handler: Arc<dyn TaskHandler> = self.clone();
        vec![
            TaskPool::new(self.db.clone(), POOL_CHANNEL_OPS, 8).spawn(handler.clone()),
            TaskPool::new(self.db.clone(), POOL_CHAIN_EVENTS, 2).spawn(handler.clone()),
            TaskPool::new(self.db.clone(), POOL_WEBHOOKS, 2).spawn(handler),
        ]
    }

    /// Run at most one pending task of `pool`. Embedders and tests drive
    /// the queue deterministically with this instead of spawning workers.
    pub async fn process_one_task(&self, pool: &str) -> Result<bool, NodeError> {
        process_one(&self.db, pool, self).await
    }

    async fn lock_channel(&self, address: &str) -> Arc<Mutex<()>> {
        let mut locks = self.channel_locks.lock().await;
        locks
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn load_channel(&self, address: &str) -> Result<Channel, NodeError> {
        self.db.get_channel(self.db.store().executor().as_ref(), address)
    }

    fn next_nonce(&self, peer: &[u8; 32]) -> u64 {
        let mut nonces = self.outbound_nonces.lock().expect("nonce lock");
        let nonce = nonces.entry(*peer).or_insert(0);
        *nonce += 1;
        *nonce
    }

    fn check_inbound_nonce(&self, peer: &[u8; 32], nonce: u64) -> Result<(), NodeError> {
        let mut nonces = self.inbound_nonces.lock().expect("nonce lock");
        let last = nonces.entry(*peer).or_insert(0);
        if nonce <= *last {
            return Err(NodeError::ProtocolViolation(format!(
                "stale nonce {nonce}, last {last}"
            )));
        }
        *last = nonce;
        Ok(())
    }

    async fn send_request(
        &self,
        peer: [u8; 32],
        request: PeerRequest,
    ) -> Result<PeerResponse, NodeError> {
        let envelope = PeerEnvelope {
            nonce: self.next_nonce(&peer),
            request,
        };
        self.peers.request(peer, envelope).await
    }

    /// Active channel whose counterparty is `peer`, matching `asset`.
    fn channel_with_peer(&self, peer: &[u8; 32], asset: &Asset) -> Result<Channel, NodeError> {
        let exec = self.db.store().executor();
        self.db
            .list_channels(exec.as_ref(), Some(ChannelStatus::Active))?
            .into_iter()
            .find(|ch| ch.their_onchain.key == *peer && ch.asset == *asset)
            .ok_or(NodeError::NotFound)
    }

    fn push_virtual_event(
        &self,
        exec: &dyn KvExecutor,
        event_type: VirtualChannelEventType,
        meta: &VirtualChannelMeta,
    ) -> Result<(), NodeError> {
        let event = VirtualChannelEvent::from_meta(event_type, meta);
        self.db.create_task(
            exec,
            POOL_WEBHOOKS,
            KIND_VIRTUAL_CHANNEL_EVENT,
            "events",
            &event.task_id(),
            &event,
            None,
            None,
        )
    }
}

// ---------------------------------------------------------------------------
// Outbound: proposing actions to peers
// ---------------------------------------------------------------------------

impl<S: KvStore> Service<S> {
    /// Apply `action` to our side, send it to the channel peer, and persist
    /// on acknowledgement. A peer-side idempotency signal counts as
    /// acknowledged.
    async fn propose_to_peer(
        &self,
        address: &str,
        action: &ChannelAction,
        instruction_blob: Option<Vec<u8>>,
    ) -> Result<AppliedAction, NodeError> {
        let lock = self.lock_channel(address).await;
        let _guard = lock.lock().await;

        let channel = self.load_channel(address)?;
        if channel.status != ChannelStatus::Active {
            return Err(NodeError::ProtocolViolation(format!(
                "channel is {}",
                channel.status
            )));
        }
        if !channel.accepting_actions {
            return Err(NodeError::ChannelBusy);
        }

        let mut work = channel.clone();
        let applied = self
            .engine
            .apply_our_action(&mut work, action, clock::now_unix())?;

        let proposal = ProposalEnvelope {
            channel: address.to_string(),
            action: action.clone(),
            signed_state: applied.signed_state.to_boc()?,
            proof: applied.proof.as_ref().map(paynet_cell::boc::serialize),
        };
        let request = match instruction_blob {
            Some(blob) => PeerRequest::RequestOpenVirtual {
                proposal,
                instruction_blob: blob,
            },
            None => PeerRequest::ProposeAction(proposal),
        };

        let response = self.send_request(work.their_onchain.key, request).await?;
        match response {
            PeerResponse::Ack => {}
            PeerResponse::Error { code, message } => {
                let err = PeerResponse::error_to_node(&code, &message);
                if !err.is_idempotent_success() {
                    return Err(err);
                }
            }
            other => {
                return Err(NodeError::ProtocolViolation(format!(
                    "unexpected response {other:?} to proposal"
                )))
            }
        }

        let mut work = work;
        self.db.transaction(|exec| self.db.put_channel(exec, &mut work))?;
        debug!(channel = %address, action = action.name(), "proposal acknowledged and persisted");
        Ok(applied)
    }
}

// ---------------------------------------------------------------------------
// Inbound: the peer protocol dispatcher
// ---------------------------------------------------------------------------

impl<S: KvStore> Service<S> {
    /// Entry point for the transport collaborator: handle one authenticated
    /// request from `peer`. Never fails; failures map to error responses.
    pub async fn handle(&self, peer: [u8; 32], envelope: PeerEnvelope) -> PeerResponse {
        if let Err(err) = self.check_inbound_nonce(&peer, envelope.nonce) {
            return PeerResponse::from_error(&err);
        }
        let name = envelope.request.name();
        let result = match envelope.request {
            PeerRequest::ProposeAction(proposal) => self.on_propose_action(peer, proposal).await,
            PeerRequest::RequestOpenVirtual {
                proposal,
                instruction_blob,
            } => self.on_request_open_virtual(peer, proposal, instruction_blob).await,
            PeerRequest::RequestCloseVirtual { key, resolve } => {
                self.on_request_close_virtual(peer, key, resolve).await
            }
            PeerRequest::RequestRemoveVirtual { key } => {
                self.on_request_remove_virtual(peer, key).await
            }
            PeerRequest::IsChannelUnlocked { channel } => self.on_is_channel_unlocked(&channel),
        };
        match result {
            Ok(response) => response,
            Err(err) => {
                warn!(request = name, error = %err, "peer request failed");
                PeerResponse::from_error(&err)
            }
        }
    }

    /// Validate and persist a counterparty-proposed state.
    async fn accept_their_proposal(
        &self,
        peer: [u8; 32],
        proposal: &ProposalEnvelope,
    ) -> Result<(Channel, AppliedAction), NodeError> {
        let lock = self.lock_channel(&proposal.channel).await;
        let _guard = lock.lock().await;

        let channel = self.load_channel(&proposal.channel)?;
        if channel.their_onchain.key != peer {
            return Err(NodeError::ProtocolViolation(
                "proposal from a non-party peer".into(),
            ));
        }
        if channel.status != ChannelStatus::Active {
            return Err(NodeError::ProtocolViolation(format!(
                "channel is {}",
                channel.status
            )));
        }
        if !channel.accepting_actions {
            return Err(NodeError::ChannelBusy);
        }

        let signed = SignedSemiChannel::from_boc(&proposal.signed_state)?;
        let proof = proposal
            .proof
            .as_ref()
            .map(|bytes| paynet_cell::boc::parse(bytes))
            .transpose()?;

        let mut work = channel.clone();
        let applied = self.engine.apply_their_action(
            &mut work,
            &signed,
            proof.as_ref(),
            &proposal.action,
            clock::now_unix(),
        )?;

        if !applied.idempotent {
            self.db.transaction(|exec| self.db.put_channel(exec, &mut work))?;
        }
        Ok((work, applied))
    }

    async fn on_propose_action(
        &self,
        peer: [u8; 32],
        proposal: ProposalEnvelope,
    ) -> Result<PeerResponse, NodeError> {
        if matches!(proposal.action, ChannelAction::OpenVirtual(_)) {
            return Err(NodeError::ProtocolViolation(
                "open_virtual requires request_open_virtual".into(),
            ));
        }
        let (channel, applied) = self.accept_their_proposal(peer, &proposal).await?;
        if applied.idempotent {
            return Ok(PeerResponse::Ack);
        }

        // Side effects of accepted counterparty actions.
        match &proposal.action {
            ChannelAction::ConfirmClose { key, .. } => {
                self.after_incoming_condition_settled(
                    &channel,
                    key,
                    applied.transferred,
                    VirtualChannelStatus::Closed,
                )?;
            }
            ChannelAction::RemoveVirtual { key } => {
                self.after_incoming_condition_settled(&channel, key, 0, VirtualChannelStatus::Removed)?;
            }
            ChannelAction::CommitVirtual { .. } if applied.transferred > 0 => {
                self.db.transaction(|exec| {
                    self.db.add_history(
                        exec,
                        &channel.address,
                        &ChannelHistoryItem {
                            at: clock::now_unix_nanos(),
                            event: ChannelHistoryEvent::TransferIn {
                                amount: applied.transferred,
                                from: peer,
                            },
                        },
                    )
                })?;
            }
            _ => {}
        }
        Ok(PeerResponse::Ack)
    }

    /// Meta and history updates after the peer settled a condition that was
    /// on *their* side toward us.
    fn after_incoming_condition_settled(
        &self,
        channel: &Channel,
        key: &[u8; 32],
        transferred: u128,
        status: VirtualChannelStatus,
    ) -> Result<(), NodeError> {
        let now = clock::now_unix();
        self.db.transaction(|exec| {
            if transferred > 0 {
                self.db.add_history(
                    exec,
                    &channel.address,
                    &ChannelHistoryItem {
                        at: clock::now_unix_nanos(),
                        event: ChannelHistoryEvent::TransferIn {
                            amount: transferred,
                            from: channel.their_onchain.key,
                        },
                    },
                )?;
            }
            match self.db.get_virtual_meta(exec, key) {
                Ok(mut meta) => {
                    meta.advance_status(status, now);
                    self.db.put_virtual_meta(exec, &meta)?;
                    let event = match status {
                        VirtualChannelStatus::Removed => VirtualChannelEventType::Remove,
                        _ => VirtualChannelEventType::Close,
                    };
                    self.push_virtual_event(exec, event, &meta)?;
                }
                Err(NodeError::NotFound) => {}
                Err(err) => return Err(err),
            }
            Ok(())
        })
    }

    async fn on_request_open_virtual(
        &self,
        peer: [u8; 32],
        proposal: ProposalEnvelope,
        instruction_blob: Vec<u8>,
    ) -> Result<PeerResponse, NodeError> {
        let ChannelAction::OpenVirtual(condition) = proposal.action.clone() else {
            return Err(NodeError::ProtocolViolation(
                "request_open_virtual without an open action".into(),
            ));
        };

        let instruction = unwrap_instruction(self.engine.keypair(), &instruction_blob)?;
        if instruction.incoming_condition() != condition {
            return Err(NodeError::ProtocolViolation(
                "onion instruction does not match the proposed condition".into(),
            ));
        }
        let now = clock::now_unix();
        if self.cfg.safe_deadline(condition.deadline) <= now {
            return Err(NodeError::DeadlineExpired);
        }
        if let Some(forward) = &instruction.forward {
            if forward.deadline > condition.deadline - self.cfg.min_safe_virtual_timeout {
                return Err(NodeError::ProtocolViolation(
                    "forward deadline leaves no safety margin".into(),
                ));
            }
            if forward.capacity > condition.capacity {
                return Err(NodeError::ProtocolViolation(
                    "forward capacity exceeds incoming capacity".into(),
                ));
            }
        }

        let (channel, _applied) = self.accept_their_proposal(peer, &proposal).await?;

        // Runs on re-delivery too: the peer may retry after we accepted the
        // state but failed before registering the meta and follow-up tasks.
        // Every step in here is idempotent.
        self.register_accepted_open(&channel, peer, &condition.key, &instruction, now)
            .await?;
        info!(
            key = %hex::encode(&condition.key[..8]),
            channel = %channel.address,
            forward = instruction.forward.is_some(),
            "virtual channel hop opened"
        );
        Ok(PeerResponse::Ack)
    }

    /// Persist meta, guards and follow-up work for an accepted incoming
    /// virtual-channel open.
    async fn register_accepted_open(
        &self,
        channel: &Channel,
        peer: [u8; 32],
        key: &[u8; 32],
        instruction: &HopInstruction,
        now: i64,
    ) -> Result<(), NodeError> {
        // Outgoing leg, when we are an intermediary.
        let outgoing = match instruction.outgoing_condition() {
            Some(out_condition) => {
                let forward = instruction.forward.as_ref().expect("forward implies outgoing");
                let out_channel = self.channel_with_peer(&forward.target, &channel.asset)?;
                Some((out_channel, out_condition))
            }
            None => None,
        };

        // The payee of an instant-close tunnel resolves the full capacity
        // itself and closes right away.
        let instant_resolve = match (&instruction.virtual_seed, instruction.instant_close) {
            (Some(seed), true) => {
                let virtual_key = Ed25519Keypair::from_private_key(*seed);
                if virtual_key.public_key != *key {
                    return Err(NodeError::ProtocolViolation(
                        "virtual seed does not match the condition key".into(),
                    ));
                }
                Some(VirtualChannelState::sign(
                    instruction.expected_incoming.capacity,
                    &virtual_key,
                )?)
            }
            _ => None,
        };

        let incoming_side =
            self.vchan
                .side_for(&channel.address, &instruction.incoming_condition(), Some(peer));
        let outgoing_side = outgoing.as_ref().map(|(out_channel, out_condition)| {
            self.vchan.side_for(&out_channel.address, out_condition, None)
        });

        self.db.transaction(|exec| {
            let meta = self.db.create_or_update_virtual_meta(
                exec,
                key,
                || VirtualChannelMeta::new(*key, VirtualChannelStatus::Active, now),
                |meta| {
                    meta.incoming = Some(incoming_side.clone());
                    if let Some(side) = &outgoing_side {
                        meta.outgoing = Some(side.clone());
                    }
                    if let Some(resolve) = &instant_resolve {
                        meta.add_known_resolve(resolve, now)?;
                    }
                    Ok(())
                },
            )?;
            self.vchan.schedule_safety_guard(exec, &meta)?;

            match (&outgoing, instruction.final_recipient) {
                (Some((out_channel, out_condition)), _) => {
                    self.db.create_task(
                        exec,
                        POOL_CHANNEL_OPS,
                        KIND_OPEN_VIRTUAL,
                        &out_channel.address,
                        &format!("open-virtual-{}-{}", hex::encode(key), out_channel.address),
                        &OpenVirtualPayload {
                            channel: out_channel.address.clone(),
                            condition: out_condition.clone(),
                            instruction_blob: instruction.next_blob.clone(),
                        },
                        None,
                        Some(self.cfg.safe_deadline(out_condition.deadline) * 1_000_000_000),
                    )?;
                }
                (None, true) if instant_resolve.is_some() => {
                    self.db.create_task(
                        exec,
                        POOL_CHANNEL_OPS,
                        KIND_CLOSE_VIRTUAL,
                        &channel.address,
                        &format!("close-virtual-{}", hex::encode(key)),
                        &VirtualKeyPayload {
                            key: *key,
                            transfer: true,
                        },
                        None,
                        Some(incoming_side.safe_deadline * 1_000_000_000),
                    )?;
                }
                _ => {
                    self.push_virtual_event(exec, VirtualChannelEventType::Open, &meta)?;
                }
            }
            Ok(())
        })
    }

    /// The counterparty on our outgoing side asks us to settle a condition
    /// with a resolve: apply `ConfirmClose` on our side, respond with the
    /// countersigned state, and propagate the close upstream if this hop
    /// also has an incoming leg.
    async fn on_request_close_virtual(
        &self,
        peer: [u8; 32],
        key: [u8; 32],
        resolve: Vec<u8>,
    ) -> Result<PeerResponse, NodeError> {
        let resolve = VirtualChannelState::from_boc(&resolve)?;
        let now = clock::now_unix();

        let outgoing = {
            let exec = self.db.store().executor();
            let meta = self.db.get_virtual_meta(exec.as_ref(), &key)?;
            meta.outgoing.clone().ok_or_else(|| {
                NodeError::ProtocolViolation("no outgoing side for this key".into())
            })?
        };

        // Accumulate; a weaker resolve than the known one is fine, we close
        // with the strongest.
        let meta = match self.vchan.add_resolve(&key, &resolve, now) {
            Ok(meta) => meta,
            Err(NodeError::NewerStateIsKnown) => {
                let exec = self.db.store().executor();
                self.db.get_virtual_meta(exec.as_ref(), &key)?
            }
            Err(err) => return Err(err),
        };
        let strongest = meta.known_resolve().ok_or(NodeError::InvalidSignature)?;

        let lock = self.lock_channel(&outgoing.channel_address).await;
        let _guard = lock.lock().await;
        let channel = self.load_channel(&outgoing.channel_address)?;
        if channel.their_onchain.key != peer {
            return Err(NodeError::ProtocolViolation(
                "close requested by a non-party peer".into(),
            ));
        }

        let mut work = channel.clone();
        let action = ChannelAction::ConfirmClose {
            key,
            resolve: strongest.clone(),
        };
        let applied = self.engine.apply_our_action(&mut work, &action, now)?;

        let incoming = meta.incoming.clone();
        self.db.transaction(|exec| {
            if !applied.idempotent {
                self.db.put_channel(exec, &mut work)?;
                if applied.transferred > 0 {
                    self.db.add_history(
                        exec,
                        &work.address,
                        &ChannelHistoryItem {
                            at: clock::now_unix_nanos(),
                            event: ChannelHistoryEvent::TransferOut {
                                amount: applied.transferred,
                                to: peer,
                            },
                        },
                    )?;
                }
            }
            let meta = self.db.create_or_update_virtual_meta(
                exec,
                &key,
                || VirtualChannelMeta::new(key, VirtualChannelStatus::WantClose, now),
                |meta| {
                    let target = if incoming.is_some() {
                        VirtualChannelStatus::WantClose
                    } else {
                        VirtualChannelStatus::Closed
                    };
                    meta.advance_status(target, now);
                    Ok(())
                },
            )?;
            if let Some(incoming) = &incoming {
                // Intermediary: collect from our predecessor next.
                self.db.create_task(
                    exec,
                    POOL_CHANNEL_OPS,
                    KIND_CLOSE_VIRTUAL,
                    &incoming.channel_address,
                    &format!("close-virtual-{}", hex::encode(key)),
                    &VirtualKeyPayload {
                        key,
                        transfer: false,
                    },
                    None,
                    Some(incoming.uncooperative_deadline * 1_000_000_000),
                )?;
            } else {
                self.push_virtual_event(exec, VirtualChannelEventType::Close, &meta)?;
            }
            Ok(())
        })?;

        info!(
            key = %hex::encode(&key[..8]),
            amount = strongest.amount,
            channel = %outgoing.channel_address,
            "confirmed virtual channel close"
        );
        Ok(PeerResponse::Agreement {
            signed_state: applied.signed_state.to_boc()?,
            proof: applied.proof.as_ref().map(paynet_cell::boc::serialize),
        })
    }

    /// The counterparty gives up an unresolved condition: apply
    /// `RemoveVirtual` on our side and propagate upstream.
    async fn on_request_remove_virtual(
        &self,
        peer: [u8; 32],
        key: [u8; 32],
    ) -> Result<PeerResponse, NodeError> {
        let now = clock::now_unix();
        let meta = {
            let exec = self.db.store().executor();
            self.db.get_virtual_meta(exec.as_ref(), &key)?
        };
        let outgoing = meta
            .outgoing
            .clone()
            .ok_or_else(|| NodeError::ProtocolViolation("no outgoing side for this key".into()))?;

        let lock = self.lock_channel(&outgoing.channel_address).await;
        let _guard = lock.lock().await;
        let channel = self.load_channel(&outgoing.channel_address)?;
        if channel.their_onchain.key != peer {
            return Err(NodeError::ProtocolViolation(
                "removal requested by a non-party peer".into(),
            ));
        }

        let mut work = channel.clone();
        let action = ChannelAction::RemoveVirtual { key };
        let applied = self.engine.apply_our_action(&mut work, &action, now)?;

        let incoming = meta.incoming.clone();
        self.db.transaction(|exec| {
            if !applied.idempotent {
                self.db.put_channel(exec, &mut work)?;
            }
            let meta = self.db.create_or_update_virtual_meta(
                exec,
                &key,
                || VirtualChannelMeta::new(key, VirtualChannelStatus::WantRemove, now),
                |meta| {
                    let target = if incoming.is_some() {
                        VirtualChannelStatus::WantRemove
                    } else {
                        VirtualChannelStatus::Removed
                    };
                    meta.advance_status(target, now);
                    Ok(())
                },
            )?;
            if let Some(incoming) = &incoming {
                self.db.create_task(
                    exec,
                    POOL_CHANNEL_OPS,
                    KIND_REMOVE_VIRTUAL,
                    &incoming.channel_address,
                    &format!("remove-virtual-{}", hex::encode(key)),
                    &VirtualKeyPayload {
                        key,
                        transfer: false,
                    },
                    None,
                    Some(incoming.uncooperative_deadline * 1_000_000_000),
                )?;
            } else {
                self.push_virtual_event(exec, VirtualChannelEventType::Remove, &meta)?;
            }
            Ok(())
        })?;

        info!(key = %hex::encode(&key[..8]), "virtual channel removed");
        Ok(PeerResponse::Agreement {
            signed_state: applied.signed_state.to_boc()?,
            proof: applied.proof.as_ref().map(paynet_cell::boc::serialize),
        })
    }

    fn on_is_channel_unlocked(&self, address: &str) -> Result<PeerResponse, NodeError> {
        let unlocked = match self.load_channel(address) {
            Ok(channel) => channel.status == ChannelStatus::Active && channel.accepting_actions,
            Err(NodeError::NotFound) => false,
            Err(err) => return Err(err),
        };
        Ok(PeerResponse::Unlocked { unlocked })
    }
}

// ---------------------------------------------------------------------------
// Task handlers: the durable workflow steps
// ---------------------------------------------------------------------------

#[async_trait]
impl<S: KvStore> TaskHandler for Service<S> {
    async fn handle(&self, task: &Task) -> Result<(), NodeError> {
        match task.kind.as_str() {
            KIND_PROPOSE_ACTION => {
                let payload: ProposeActionPayload = serde_json::from_slice(&task.data)?;
                self.propose_to_peer(&payload.channel, &payload.action, None)
                    .await?;
                Ok(())
            }
            KIND_OPEN_VIRTUAL => self.run_open_virtual(task).await,
            KIND_CLOSE_VIRTUAL => self.run_close_virtual(task).await,
            KIND_REMOVE_VIRTUAL => self.run_remove_virtual(task).await,
            KIND_CHANNEL_EVENT => self.run_channel_event(task).await,
            KIND_UNCOOPERATIVE_CLOSE => self.run_uncooperative_close(task).await,
            KIND_CHALLENGE => self.run_challenge(task).await,
            KIND_SETTLE_CONDITIONALS => self.run_settle_conditionals(task).await,
            KIND_FINALIZE => self.run_finalize(task).await,
            KIND_VIRTUAL_CHANNEL_EVENT => self.run_webhook(task).await,
            other => Err(NodeError::ProtocolViolation(format!(
                "unknown task kind {other}"
            ))),
        }
    }
}

impl<S: KvStore> Service<S> {
    async fn run_open_virtual(&self, task: &Task) -> Result<(), NodeError> {
        let payload: OpenVirtualPayload = serde_json::from_slice(&task.data)?;
        let action = ChannelAction::OpenVirtual(payload.condition.clone());
        self.propose_to_peer(&payload.channel, &action, Some(payload.instruction_blob))
            .await?;

        let now = clock::now_unix();
        self.db.transaction(|exec| {
            let meta = self.db.create_or_update_virtual_meta(
                exec,
                &payload.condition.key,
                || VirtualChannelMeta::new(payload.condition.key, VirtualChannelStatus::Active, now),
                |meta| {
                    meta.advance_status(VirtualChannelStatus::Active, now);
                    Ok(())
                },
            )?;
            if meta.final_destination.is_some() {
                self.push_virtual_event(exec, VirtualChannelEventType::Open, &meta)?;
            }
            Ok(())
        })
    }

    /// Ask the payer on our incoming side to settle; apply their
    /// countersigned close.
    async fn run_close_virtual(&self, task: &Task) -> Result<(), NodeError> {
        let payload: VirtualKeyPayload = serde_json::from_slice(&task.data)?;
        let key = payload.key;
        let now = clock::now_unix();

        let meta = {
            let exec = self.db.store().executor();
            self.db.get_virtual_meta(exec.as_ref(), &key)?
        };
        if matches!(
            meta.status,
            VirtualChannelStatus::Closed | VirtualChannelStatus::Removed
        ) {
            return Ok(());
        }
        let incoming = meta.incoming.clone().ok_or_else(|| {
            NodeError::ProtocolViolation("close task on a key without incoming side".into())
        })?;
        let resolve = meta
            .known_resolve()
            .ok_or_else(|| NodeError::ProtocolViolation("no resolve to close with".into()))?;

        let channel = self.load_channel(&incoming.channel_address)?;
        let response = self
            .send_request(
                channel.their_onchain.key,
                PeerRequest::RequestCloseVirtual {
                    key,
                    resolve: resolve.to_boc()?,
                },
            )
            .await?;

        let (signed_state, proof) = match response {
            PeerResponse::Agreement { signed_state, proof } => (signed_state, proof),
            PeerResponse::Error { code, message } => {
                return Err(PeerResponse::error_to_node(&code, &message))
            }
            other => {
                return Err(NodeError::ProtocolViolation(format!(
                    "unexpected close response {other:?}"
                )))
            }
        };

        let lock = self.lock_channel(&incoming.channel_address).await;
        let _guard = lock.lock().await;
        let channel = self.load_channel(&incoming.channel_address)?;
        let signed = SignedSemiChannel::from_boc(&signed_state)?;
        let proof = proof.as_ref().map(|b| paynet_cell::boc::parse(b)).transpose()?;

        let mut work = channel.clone();
        let action = ChannelAction::ConfirmClose {
            key,
            resolve: resolve.clone(),
        };
        let applied =
            self.engine
                .apply_their_action(&mut work, &signed, proof.as_ref(), &action, now)?;

        self.db.transaction(|exec| {
            if !applied.idempotent {
                self.db.put_channel(exec, &mut work)?;
                if applied.transferred > 0 {
                    self.db.add_history(
                        exec,
                        &work.address,
                        &ChannelHistoryItem {
                            at: clock::now_unix_nanos(),
                            event: ChannelHistoryEvent::TransferIn {
                                amount: applied.transferred,
                                from: work.their_onchain.key,
                            },
                        },
                    )?;
                }
            }
            let meta = self.db.create_or_update_virtual_meta(
                exec,
                &key,
                || VirtualChannelMeta::new(key, VirtualChannelStatus::Closed, now),
                |meta| {
                    meta.advance_status(VirtualChannelStatus::Closed, now);
                    Ok(())
                },
            )?;
            let event = if payload.transfer {
                VirtualChannelEventType::Transfer
            } else {
                VirtualChannelEventType::Close
            };
            self.push_virtual_event(exec, event, &meta)?;
            Ok(())
        })?;

        info!(
            key = %hex::encode(&key[..8]),
            amount = resolve.amount,
            "virtual channel closed upstream"
        );
        Ok(())
    }

    /// Deadline guard or explicit removal: ask the payer on our incoming
    /// side to drop the condition.
    async fn run_remove_virtual(&self, task: &Task) -> Result<(), NodeError> {
        let payload: VirtualKeyPayload = serde_json::from_slice(&task.data)?;
        let key = payload.key;
        let now = clock::now_unix();

        let meta = {
            let exec = self.db.store().executor();
            self.db.get_virtual_meta(exec.as_ref(), &key)?
        };
        if !self.vchan.should_remove(&meta) {
            // A resolve arrived in the meantime; the close path owns this
            // channel now.
            return Ok(());
        }
        let incoming = meta.incoming.clone().ok_or_else(|| {
            NodeError::ProtocolViolation("remove task on a key without incoming side".into())
        })?;

        let channel = self.load_channel(&incoming.channel_address)?;
        let response = self
            .send_request(
                channel.their_onchain.key,
                PeerRequest::RequestRemoveVirtual { key },
            )
            .await?;

        let (signed_state, proof) = match response {
            PeerResponse::Agreement { signed_state, proof } => (signed_state, proof),
            PeerResponse::Error { code, message } => {
                return Err(PeerResponse::error_to_node(&code, &message))
            }
            other => {
                return Err(NodeError::ProtocolViolation(format!(
                    "unexpected remove response {other:?}"
                )))
            }
        };

        let lock = self.lock_channel(&incoming.channel_address).await;
        let _guard = lock.lock().await;
        let channel = self.load_channel(&incoming.channel_address)?;
        let signed = SignedSemiChannel::from_boc(&signed_state)?;
        let proof = proof.as_ref().map(|b| paynet_cell::boc::parse(b)).transpose()?;

        let mut work = channel.clone();
        let action = ChannelAction::RemoveVirtual { key };
        let applied =
            self.engine
                .apply_their_action(&mut work, &signed, proof.as_ref(), &action, now)?;

        self.db.transaction(|exec| {
            if !applied.idempotent {
                self.db.put_channel(exec, &mut work)?;
            }
            let meta = self.db.create_or_update_virtual_meta(
                exec,
                &key,
                || VirtualChannelMeta::new(key, VirtualChannelStatus::Removed, now),
                |meta| {
                    meta.advance_status(VirtualChannelStatus::Removed, now);
                    Ok(())
                },
            )?;
            self.push_virtual_event(exec, VirtualChannelEventType::Remove, &meta)?;
            Ok(())
        })?;

        info!(key = %hex::encode(&key[..8]), "virtual channel removed upstream");
        Ok(())
    }

    /// Fold one on-chain transaction into the channel record.
    async fn run_channel_event(&self, task: &Task) -> Result<(), NodeError> {
        let payload: ChannelEventPayload = serde_json::from_slice(&task.data)?;
        let state = self
            .chain
            .get_channel_contract_state(&payload.address)
            .await?;

        let lock = self.lock_channel(&payload.address).await;
        let _guard = lock.lock().await;
        let now = clock::now_unix();

        let mut channel = match self.load_channel(&payload.address) {
            Ok(channel) => channel,
            Err(NodeError::NotFound) => {
                let Some(channel) = self.channel_from_contract(&payload.address, &state, now)
                else {
                    // A contract we are not a party of; nothing to track.
                    return Ok(());
                };
                info!(address = %payload.address, "tracking new channel contract");
                channel
            }
            Err(err) => return Err(err),
        };

        if payload.lt <= channel.last_processed_lt {
            return Ok(());
        }

        let mut history = Vec::new();
        let (our_dep, their_dep, our_wd, their_wd) = if channel.we_left {
            (
                state.left_deposited,
                state.right_deposited,
                state.left_withdrawn,
                state.right_withdrawn,
            )
        } else {
            (
                state.right_deposited,
                state.left_deposited,
                state.right_withdrawn,
                state.left_withdrawn,
            )
        };
        if our_dep > channel.our_onchain.deposited {
            history.push(ChannelHistoryEvent::Topup {
                amount: our_dep - channel.our_onchain.deposited,
            });
        }
        if their_dep > channel.their_onchain.deposited {
            history.push(ChannelHistoryEvent::TopupCapacity {
                amount: their_dep - channel.their_onchain.deposited,
            });
        }
        if our_wd > channel.our_onchain.withdrawn {
            history.push(ChannelHistoryEvent::Withdraw {
                amount: our_wd - channel.our_onchain.withdrawn,
            });
        }
        if their_wd > channel.their_onchain.withdrawn {
            history.push(ChannelHistoryEvent::WithdrawCapacity {
                amount: their_wd - channel.their_onchain.withdrawn,
            });
        }
        channel.our_onchain.deposited = our_dep;
        channel.their_onchain.deposited = their_dep;
        channel.our_onchain.withdrawn = our_wd;
        channel.their_onchain.withdrawn = their_wd;
        channel.last_processed_lt = payload.lt;

        let mut dispute_follow_ups = false;
        match state.status {
            ContractStatus::Uninitialized => {}
            ContractStatus::Open => {
                if channel.status == ChannelStatus::Inactive {
                    channel.status = ChannelStatus::Active;
                    channel.accepting_actions = true;
                    channel.init_at = now;
                    info!(address = %channel.address, "channel active");
                }
            }
            ContractStatus::ClosureStarted | ContractStatus::Quarantine => {
                if channel.status != ChannelStatus::Closing {
                    channel.status = ChannelStatus::Closing;
                    channel.accepting_actions = false;
                    history.push(ChannelHistoryEvent::UncooperativeCloseStarted);
                    dispute_follow_ups = true;
                }
            }
            ContractStatus::Settled => {
                let address = channel.address.clone();
                self.db.transaction(|exec| {
                    self.db.add_history(
                        exec,
                        &address,
                        &ChannelHistoryItem {
                            at: clock::now_unix_nanos(),
                            event: ChannelHistoryEvent::Closed,
                        },
                    )?;
                    self.db.delete_channel(exec, &address)
                })?;
                info!(address = %address, "channel settled and dropped");
                return Ok(());
            }
        }

        self.db.transaction(|exec| {
            self.db.put_channel(exec, &mut channel)?;
            for event in &history {
                self.db.add_history(
                    exec,
                    &channel.address,
                    &ChannelHistoryItem {
                        at: clock::now_unix_nanos(),
                        event: event.clone(),
                    },
                )?;
            }
            if dispute_follow_ups {
                self.schedule_dispute_follow_ups(exec, &channel.address, now)?;
            }
            Ok(())
        })
    }

    fn channel_from_contract(
        &self,
        address: &str,
        state: &crate::chain::ContractState,
        now: i64,
    ) -> Option<Channel> {
        let our_key = *self.public_key();
        let we_left = state.left_key == our_key;
        if !we_left && state.right_key != our_key {
            return None;
        }
        let (our_k, our_w, their_k, their_w) = if we_left {
            (
                state.left_key,
                state.left_wallet.clone(),
                state.right_key,
                state.right_wallet.clone(),
            )
        } else {
            (
                state.right_key,
                state.right_wallet.clone(),
                state.left_key,
                state.left_wallet.clone(),
            )
        };
        let mut id = [0u8; 16];
        id.copy_from_slice(&sha256(address.as_bytes())[..16]);
        Some(Channel {
            id,
            address: address.to_string(),
            asset: state.asset.clone(),
            status: ChannelStatus::Inactive,
            we_left,
            accepting_actions: false,
            our_onchain: OnchainState::new(our_k, our_w),
            their_onchain: OnchainState::new(their_k, their_w),
            our: Side::new(id),
            their: Side::new(id),
            init_at: 0,
            created_at: now,
            last_processed_lt: 0,
            safe_onchain_close_period: self.cfg.quarantine_duration
                + self.cfg.conditional_close_duration
                + self.cfg.buffer_to_commit,
            db_version: 0,
        })
    }

    fn schedule_dispute_follow_ups(
        &self,
        exec: &dyn KvExecutor,
        address: &str,
        started_at: i64,
    ) -> Result<(), NodeError> {
        for step in dispute::follow_up_steps(&self.cfg, started_at) {
            self.db.create_task(
                exec,
                POOL_CHANNEL_OPS,
                step.kind,
                address,
                &format!("{}-{}", step.kind, address),
                &DisputePayload {
                    channel: address.to_string(),
                },
                Some(step.execute_after),
                Some(step.execute_till),
            )?;
        }
        Ok(())
    }

    async fn run_uncooperative_close(&self, task: &Task) -> Result<(), NodeError> {
        let payload: DisputePayload = serde_json::from_slice(&task.data)?;
        let lock = self.lock_channel(&payload.channel).await;
        let _guard = lock.lock().await;
        let mut channel = self.load_channel(&payload.channel)?;
        let now = clock::now_unix();

        let body = dispute::build_start_uncooperative_close_body(
            channel.we_left,
            &channel.our.signed,
            &channel.their.signed,
        )?;
        self.chain
            .submit(&channel.address, dispute::body_boc(&body))
            .await?;

        channel.status = ChannelStatus::Closing;
        channel.accepting_actions = false;
        self.db.transaction(|exec| {
            self.db.put_channel(exec, &mut channel)?;
            self.db.add_history(
                exec,
                &channel.address,
                &ChannelHistoryItem {
                    at: clock::now_unix_nanos(),
                    event: ChannelHistoryEvent::UncooperativeCloseStarted,
                },
            )?;
            self.schedule_dispute_follow_ups(exec, &channel.address, now)?;
            Ok(())
        })?;
        info!(address = %channel.address, "uncooperative close submitted");
        Ok(())
    }

    /// During quarantine: override the committed state if we hold a newer
    /// signed state from the counterparty.
    async fn run_challenge(&self, task: &Task) -> Result<(), NodeError> {
        let payload: DisputePayload = serde_json::from_slice(&task.data)?;
        let channel = self.load_channel(&payload.channel)?;
        let state = self
            .chain
            .get_channel_contract_state(&channel.address)
            .await?;

        let committed_their_seqno = if channel.we_left {
            state.right_seqno
        } else {
            state.left_seqno
        };
        if channel.their.signed.state.data.seqno <= committed_their_seqno {
            return Ok(());
        }

        let body = dispute::build_challenge_body(channel.we_left, &channel.their.signed)?;
        self.chain
            .submit(&channel.address, dispute::body_boc(&body))
            .await?;
        info!(
            address = %channel.address,
            ours = channel.their.signed.state.data.seqno,
            committed = committed_their_seqno,
            "challenged quarantined state"
        );
        Ok(())
    }

    /// After quarantine: enforce the strongest resolve we hold for each of
    /// their conditionals.
    async fn run_settle_conditionals(&self, task: &Task) -> Result<(), NodeError> {
        let payload: DisputePayload = serde_json::from_slice(&task.data)?;
        let channel = self.load_channel(&payload.channel)?;

        let mut resolves = Vec::new();
        {
            let exec = self.db.store().executor();
            for condition in channel.their.conditions()? {
                match self.db.get_virtual_meta(exec.as_ref(), &condition.key) {
                    Ok(meta) => {
                        if let Some(resolve) = meta.known_resolve() {
                            resolves.push((condition.dict_key(), resolve));
                        }
                    }
                    Err(NodeError::NotFound) => {}
                    Err(err) => return Err(err),
                }
            }
        }
        if resolves.is_empty() && channel.their.conditionals.is_empty() {
            return Ok(());
        }

        let keys: Vec<u32> = resolves.iter().map(|(k, _)| *k).collect();
        let proof = if channel.their.conditionals.is_empty() {
            None
        } else {
            Some(channel.their.conditionals.make_proof(&keys)?)
        };
        let body =
            dispute::build_settle_conditionals_body(channel.we_left, proof.as_ref(), &resolves)?;
        self.chain
            .submit(&channel.address, dispute::body_boc(&body))
            .await?;
        info!(
            address = %channel.address,
            resolves = resolves.len(),
            "conditionals settlement submitted"
        );
        Ok(())
    }

    async fn run_finalize(&self, task: &Task) -> Result<(), NodeError> {
        let payload: DisputePayload = serde_json::from_slice(&task.data)?;
        let channel = self.load_channel(&payload.channel)?;
        let body = dispute::build_finalize_body()?;
        self.chain
            .submit(&channel.address, dispute::body_boc(&body))
            .await?;
        info!(address = %channel.address, "finalize submitted");
        Ok(())
    }

    async fn run_webhook(&self, task: &Task) -> Result<(), NodeError> {
        let event: VirtualChannelEvent = serde_json::from_slice(&task.data)?;
        let body = serde_json::to_vec(&event)?;
        let signature = sign_body(&self.cfg.webhook_key, &body);
        self.webhooks.deliver(&body, &signature).await
    }
}

// ---------------------------------------------------------------------------
// Public operations
// ---------------------------------------------------------------------------

impl<S: KvStore> Service<S> {
    /// Open a multi-hop virtual channel through `hops` (first element is our
    /// direct peer, last is the payee). With `instant_close` the payee
    /// settles the full capacity on receipt, making this a transfer.
    pub async fn open_virtual_channel(
        &self,
        asset: Asset,
        capacity: u128,
        ttl_seconds: i64,
        hops: &[TunnelHop],
        instant_close: bool,
    ) -> Result<OpenedVirtual, NodeError> {
        if hops.is_empty() {
            return Err(NodeError::ProtocolViolation("no hops given".into()));
        }
        self.resolve_coin_config(&asset, true)?;
        let now = clock::now_unix();

        // The payee's deadline is now + ttl; each hop toward us adds its
        // own gap so upstream conditions always outlive downstream ones.
        let mut deadlines = vec![0i64; hops.len()];
        let mut deadline = now + ttl_seconds;
        for (i, hop) in hops.iter().enumerate().rev() {
            deadlines[i] = deadline;
            deadline += hop.deadline_gap_seconds.max(0);
        }

        let mut chain = Vec::with_capacity(hops.len());
        for (i, hop) in hops.iter().enumerate() {
            chain.push(TunnelChainPart {
                target: hop.key,
                capacity,
                fee: hop.fee,
                deadline: deadlines[i],
            });
        }

        let virtual_key = Ed25519Keypair::generate();
        let tunnel = generate_tunnel(&virtual_key, &chain, TUNNEL_PAD_LAYERS, instant_close)?;
        if self.cfg.safe_deadline(tunnel.first_condition.deadline) <= now {
            return Err(NodeError::DeadlineExpired);
        }

        let channel = self.channel_with_peer(&hops[0].key, &asset)?;
        let outgoing_side = self
            .vchan
            .side_for(&channel.address, &tunnel.first_condition, None);
        let final_destination = hops.last().expect("non-empty").key;

        self.db.transaction(|exec| {
            self.db.create_or_update_virtual_meta(
                exec,
                &virtual_key.public_key,
                || VirtualChannelMeta::new(virtual_key.public_key, VirtualChannelStatus::Pending, now),
                |meta| {
                    meta.outgoing = Some(outgoing_side.clone());
                    meta.final_destination = Some(final_destination);
                    Ok(())
                },
            )?;
            self.db.create_task(
                exec,
                POOL_CHANNEL_OPS,
                KIND_OPEN_VIRTUAL,
                &channel.address,
                &format!(
                    "open-virtual-{}-{}",
                    hex::encode(virtual_key.public_key),
                    channel.address
                ),
                &OpenVirtualPayload {
                    channel: channel.address.clone(),
                    condition: tunnel.first_condition.clone(),
                    instruction_blob: tunnel.first_blob.clone(),
                },
                None,
                Some(self.cfg.safe_deadline(tunnel.first_condition.deadline) * 1_000_000_000),
            )?;
            Ok(())
        })?;

        info!(
            key = %hex::encode(&virtual_key.public_key[..8]),
            capacity,
            hops = hops.len(),
            "virtual channel open scheduled"
        );
        Ok(OpenedVirtual {
            public_key: virtual_key.public_key,
            private_key_seed: *virtual_key.private_key_bytes(),
            deadline: deadlines[hops.len() - 1],
            channel_address: channel.address,
        })
    }

    /// Store a resolve and drive the close toward the payer.
    pub async fn close_virtual_channel(
        &self,
        key: &[u8; 32],
        resolve: Option<&VirtualChannelState>,
    ) -> Result<(), NodeError> {
        let now = clock::now_unix();
        if let Some(resolve) = resolve {
            match self.vchan.add_resolve(key, resolve, now) {
                Ok(_) | Err(NodeError::NewerStateIsKnown) => {}
                Err(err) => return Err(err),
            }
        }
        let meta = {
            let exec = self.db.store().executor();
            self.db.get_virtual_meta(exec.as_ref(), key)?
        };
        if meta.known_resolve().is_none() {
            return Err(NodeError::ProtocolViolation("no resolve to close with".into()));
        }
        let incoming = meta
            .incoming
            .clone()
            .ok_or_else(|| NodeError::ProtocolViolation("not the receiving side".into()))?;

        self.db.transaction(|exec| {
            self.db.create_or_update_virtual_meta(
                exec,
                key,
                || VirtualChannelMeta::new(*key, VirtualChannelStatus::WantClose, now),
                |meta| {
                    meta.advance_status(VirtualChannelStatus::WantClose, now);
                    Ok(())
                },
            )?;
            self.db.create_task(
                exec,
                POOL_CHANNEL_OPS,
                KIND_CLOSE_VIRTUAL,
                &incoming.channel_address,
                &format!("close-virtual-{}", hex::encode(key)),
                &VirtualKeyPayload {
                    key: *key,
                    transfer: false,
                },
                None,
                Some(incoming.uncooperative_deadline * 1_000_000_000),
            )?;
            Ok(())
        })
    }

    /// Accept a resolve from the outside (e.g. handed over by the payee).
    pub fn add_virtual_channel_resolve(
        &self,
        key: &[u8; 32],
        state: &VirtualChannelState,
    ) -> Result<(), NodeError> {
        self.vchan.add_resolve(key, state, clock::now_unix()).map(|_| ())
    }

    /// Give up an unresolved incoming virtual channel early.
    pub async fn request_remove_virtual(&self, key: &[u8; 32]) -> Result<(), NodeError> {
        let now = clock::now_unix();
        let meta = {
            let exec = self.db.store().executor();
            self.db.get_virtual_meta(exec.as_ref(), key)?
        };
        let incoming = meta
            .incoming
            .clone()
            .ok_or_else(|| NodeError::ProtocolViolation("not the receiving side".into()))?;

        self.db.transaction(|exec| {
            self.db.create_or_update_virtual_meta(
                exec,
                key,
                || VirtualChannelMeta::new(*key, VirtualChannelStatus::WantRemove, now),
                |meta| {
                    meta.advance_status(VirtualChannelStatus::WantRemove, now);
                    Ok(())
                },
            )?;
            self.db.create_task(
                exec,
                POOL_CHANNEL_OPS,
                KIND_REMOVE_VIRTUAL,
                &incoming.channel_address,
                &format!("remove-virtual-{}", hex::encode(key)),
                &VirtualKeyPayload {
                    key: *key,
                    transfer: false,
                },
                None,
                Some(incoming.uncooperative_deadline * 1_000_000_000),
            )?;
            Ok(())
        })
    }

    /// Deploy a channel contract with `peer`, funding our side with
    /// `initial_deposit`, and start tracking it. The watcher activates the
    /// record once the deploy confirms.
    pub async fn deploy_channel_with_node(
        &self,
        peer: [u8; 32],
        asset: Asset,
        initial_deposit: u128,
    ) -> Result<String, NodeError> {
        self.resolve_coin_config(&asset, true)?;
        if self.wallet.balance().await? < initial_deposit {
            return Err(NodeError::InsufficientBalance);
        }

        let mut seed = Vec::with_capacity(64 + 16);
        seed.extend_from_slice(self.public_key());
        seed.extend_from_slice(&peer);
        seed.extend_from_slice(&serde_json::to_vec(&asset)?);
        let digest = sha256(&seed);
        let address = format!("0:{}", hex::encode(digest));

        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        let mut channel = Channel {
            id,
            address: address.clone(),
            asset,
            status: ChannelStatus::Inactive,
            we_left: true,
            accepting_actions: false,
            our_onchain: OnchainState::new(*self.public_key(), self.wallet.address()),
            their_onchain: OnchainState::new(peer, String::new()),
            our: Side::new(id),
            their: Side::new(id),
            init_at: 0,
            created_at: clock::now_unix(),
            last_processed_lt: 0,
            safe_onchain_close_period: self.cfg.quarantine_duration
                + self.cfg.conditional_close_duration
                + self.cfg.buffer_to_commit,
            db_version: 0,
        };

        self.wallet
            .send_external(dispute::body_boc(&dispute::build_topup_body(
                true,
                initial_deposit,
            )?))
            .await?;
        self.db
            .transaction(|exec| self.db.put_channel(exec, &mut channel))?;
        info!(address = %address, peer = %hex::encode(&peer[..8]), "channel deploy submitted");
        Ok(address)
    }

    /// Add `amount` to our side of the channel contract.
    pub async fn topup_channel(&self, address: &str, amount: u128) -> Result<(), NodeError> {
        let channel = self.load_channel(address)?;
        if self.wallet.balance().await? < amount {
            return Err(NodeError::InsufficientBalance);
        }
        let body = dispute::build_topup_body(channel.we_left, amount)?;
        self.chain.submit(address, dispute::body_boc(&body)).await
    }

    /// Reserve part of our balance for an on-chain withdrawal. The pending
    /// amount is locked off-chain immediately; the peer learns about it at
    /// the next settlement point.
    pub async fn request_withdraw(&self, address: &str, amount: u128) -> Result<(), NodeError> {
        let lock = self.lock_channel(address).await;
        let _guard = lock.lock().await;
        let mut channel = self.load_channel(address)?;

        let (balance, _) = channel.balance(false)?;
        let already_pending = channel.our.pending_withdraw;
        if balance < amount.saturating_sub(already_pending) as i128 {
            return Err(NodeError::InsufficientBalance);
        }
        channel.our.pending_withdraw = channel.our.pending_withdraw.max(amount);
        self.db
            .transaction(|exec| self.db.put_channel(exec, &mut channel))?;

        self.db.transaction(|exec| {
            self.db.create_task(
                exec,
                POOL_CHANNEL_OPS,
                KIND_PROPOSE_ACTION,
                address,
                &format!("withdraw-sync-{address}-{amount}"),
                &ProposeActionPayload {
                    channel: address.to_string(),
                    action: ChannelAction::IncrementStates,
                },
                None,
                None,
            )
        })
    }

    /// Close cooperatively: probe the peer, then submit the jointly signed
    /// state.
    pub async fn request_cooperative_close(&self, address: &str) -> Result<(), NodeError> {
        let channel = self.load_channel(address)?;
        let response = self
            .send_request(
                channel.their_onchain.key,
                PeerRequest::IsChannelUnlocked {
                    channel: address.to_string(),
                },
            )
            .await?;
        match response {
            PeerResponse::Unlocked { unlocked: true } => {}
            PeerResponse::Unlocked { unlocked: false } => return Err(NodeError::ChannelBusy),
            other => {
                return Err(NodeError::ProtocolViolation(format!(
                    "unexpected probe response {other:?}"
                )))
            }
        }

        let lock = self.lock_channel(address).await;
        let _guard = lock.lock().await;
        let mut channel = self.load_channel(address)?;
        let body = dispute::build_cooperative_close_body(&channel)?;
        self.chain.submit(address, dispute::body_boc(&body)).await?;

        channel.status = ChannelStatus::Closing;
        channel.accepting_actions = false;
        self.db
            .transaction(|exec| self.db.put_channel(exec, &mut channel))?;
        info!(address = %address, "cooperative close submitted");
        Ok(())
    }

    /// Force-close unilaterally: schedules the dispute pipeline.
    pub async fn request_uncooperative_close(&self, address: &str) -> Result<(), NodeError> {
        self.load_channel(address)?;
        self.db.transaction(|exec| {
            self.db.create_task(
                exec,
                POOL_CHANNEL_OPS,
                KIND_UNCOOPERATIVE_CLOSE,
                address,
                &format!("{KIND_UNCOOPERATIVE_CLOSE}-{address}"),
                &DisputePayload {
                    channel: address.to_string(),
                },
                None,
                None,
            )
        })
    }

    /// Schedule a settlement-point heartbeat with the peer.
    pub async fn increment_states(&self, address: &str) -> Result<(), NodeError> {
        self.load_channel(address)?;
        let now = clock::now_unix_nanos();
        self.db.transaction(|exec| {
            self.db.create_task(
                exec,
                POOL_CHANNEL_OPS,
                KIND_PROPOSE_ACTION,
                address,
                &format!("increment-{address}-{now}"),
                &ProposeActionPayload {
                    channel: address.to_string(),
                    action: ChannelAction::IncrementStates,
                },
                None,
                None,
            )
        })
    }

    /// Prepay every outgoing virtual channel up to its strongest known
    /// resolve and wait for the proposals to complete.
    pub async fn commit_all_our_virtual_channels_and_wait(
        &self,
        timeout: Duration,
    ) -> Result<(), NodeError> {
        let exec = self.db.store().executor();
        let channels = self.db.list_channels(exec.as_ref(), Some(ChannelStatus::Active))?;

        let mut task_ids = Vec::new();
        for channel in &channels {
            for condition in channel.our.conditions()? {
                let meta = match self.db.get_virtual_meta(exec.as_ref(), &condition.key) {
                    Ok(meta) => meta,
                    Err(NodeError::NotFound) => continue,
                    Err(err) => return Err(err),
                };
                let Some(resolve) = meta.known_resolve() else {
                    continue;
                };
                if resolve.amount <= condition.prepay {
                    continue;
                }
                let id = format!(
                    "commit-{}-{}",
                    hex::encode(condition.key),
                    resolve.amount
                );
                self.db.transaction(|tx| {
                    self.db.create_task(
                        tx,
                        POOL_CHANNEL_OPS,
                        KIND_PROPOSE_ACTION,
                        &channel.address,
                        &id,
                        &ProposeActionPayload {
                            channel: channel.address.clone(),
                            action: ChannelAction::CommitVirtual {
                                key: condition.key,
                                prepay: resolve.amount,
                            },
                        },
                        None,
                        None,
                    )
                })?;
                task_ids.push(id);
            }
        }
        drop(exec);

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Leaving the active index is not success by itself: a task that
            // failed terminally is completed with its error recorded.
            let mut all_done = true;
            for id in &task_ids {
                let task = self.db.get_task(id)?;
                if !task.is_completed() {
                    all_done = false;
                    continue;
                }
                if !task.last_error.is_empty() {
                    return Err(NodeError::ProtocolViolation(format!(
                        "commit task {id} failed: {}",
                        task.last_error
                    )));
                }
            }
            if all_done {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(NodeError::Transient("commit wait timed out".into()));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub fn get_virtual_channel_meta(&self, key: &[u8; 32]) -> Result<VirtualChannelMeta, NodeError> {
        self.db
            .get_virtual_meta(self.db.store().executor().as_ref(), key)
    }

    pub fn get_channel(&self, address: &str) -> Result<Channel, NodeError> {
        self.load_channel(address)
    }

    pub fn list_channels(&self, status: Option<ChannelStatus>) -> Result<Vec<Channel>, NodeError> {
        self.db.list_channels(self.db.store().executor().as_ref(), status)
    }

    /// Resolve display parameters for an asset. With `writable`, an unknown
    /// token is registered with default parameters instead of failing, so
    /// new channels can be accepted before the registry is curated.
    pub fn resolve_coin_config(&self, asset: &Asset, writable: bool) -> Result<CoinConfig, NodeError> {
        if let Some(config) = self.cfg.coin_config(asset) {
            return Ok(config);
        }
        if let Asset::Token(master) = asset {
            let mut learned = self.learned_tokens.lock().expect("coin lock");
            if let Some(config) = learned.get(master) {
                return Ok(config.clone());
            }
            if writable {
                let config = CoinConfig {
                    decimals: 9,
                    symbol: "TOKEN".into(),
                };
                learned.insert(master.clone(), config.clone());
                return Ok(config);
            }
        }
        Err(NodeError::NotFound)
    }
}

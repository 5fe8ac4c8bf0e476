//! In-process harness: services wired together with loopback transport and
//! mock chain/wallet/webhook collaborators.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use paynet_crypto::{sha256, Ed25519Keypair};
use paynet_node::chain::{ChainClient, ChainEvent, ContractState, MasterchainInfo, Wallet};
use paynet_node::config::ChannelConfig;
use paynet_node::error::NodeError;
use paynet_node::peer::{PeerEnvelope, PeerResponse, PeerTransport};
use paynet_node::service::Service;
use paynet_node::store::{MemoryStore, PaymentsDb};
use paynet_node::types::{Asset, Channel, ChannelStatus, OnchainState, Side};
use paynet_node::webhook::WebhookSink;

pub type TestService = Service<MemoryStore>;

/// Config with windows small enough for short-lived test conditions.
pub fn test_config() -> ChannelConfig {
    ChannelConfig {
        quarantine_duration: 60,
        buffer_to_commit: 5,
        conditional_close_duration: 5,
        min_safe_virtual_timeout: 5,
        webhook_key: b"test-webhook-key".to_vec(),
        ..ChannelConfig::default()
    }
}

/// Routes peer requests between registered services in process.
#[derive(Default)]
pub struct Registry {
    services: Mutex<HashMap<[u8; 32], Arc<TestService>>>,
}

impl Registry {
    pub fn register(&self, service: Arc<TestService>) {
        self.services
            .lock()
            .unwrap()
            .insert(*service.public_key(), service);
    }

    fn get(&self, peer: &[u8; 32]) -> Option<Arc<TestService>> {
        self.services.lock().unwrap().get(peer).cloned()
    }
}

pub struct LoopbackTransport {
    pub from: [u8; 32],
    pub registry: Arc<Registry>,
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn request(
        &self,
        peer: [u8; 32],
        envelope: PeerEnvelope,
    ) -> Result<PeerResponse, NodeError> {
        let target = self
            .registry
            .get(&peer)
            .ok_or_else(|| NodeError::Transient("peer unreachable".into()))?;
        Ok(target.handle(self.from, envelope).await)
    }
}

/// Chain mock: contract states are test-settable, submissions are recorded.
#[derive(Default)]
pub struct MockChain {
    pub states: Mutex<HashMap<String, ContractState>>,
    pub submitted: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MockChain {
    pub fn set_state(&self, address: &str, state: ContractState) {
        self.states.lock().unwrap().insert(address.into(), state);
    }

    pub fn submissions(&self, address: &str) -> Vec<Vec<u8>> {
        self.submitted
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _)| a == address)
            .map(|(_, b)| b.clone())
            .collect()
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn get_channel_contract_state(&self, address: &str) -> Result<ContractState, NodeError> {
        self.states
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or(NodeError::NotFound)
    }

    async fn submit(&self, address: &str, body: Vec<u8>) -> Result<(), NodeError> {
        self.submitted
            .lock()
            .unwrap()
            .push((address.to_string(), body));
        Ok(())
    }

    async fn subscribe_events(
        &self,
        _addresses: Vec<String>,
    ) -> Result<mpsc::Receiver<ChainEvent>, NodeError> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }

    async fn current_mc_info(&self) -> Result<MasterchainInfo, NodeError> {
        Ok(MasterchainInfo {
            seqno: 1,
            gen_utime: paynet_node::clock::now_unix(),
        })
    }
}

pub struct MockWallet;

#[async_trait]
impl Wallet for MockWallet {
    async fn send_external(&self, _payload: Vec<u8>) -> Result<(), NodeError> {
        Ok(())
    }

    async fn balance(&self) -> Result<u128, NodeError> {
        Ok(10_000_000_000)
    }

    fn address(&self) -> String {
        "0:wallet".into()
    }
}

#[derive(Default)]
pub struct RecordingWebhook {
    pub delivered: Mutex<Vec<(Vec<u8>, String)>>,
}

#[async_trait]
impl WebhookSink for RecordingWebhook {
    async fn deliver(&self, body: &[u8], signature_hex: &str) -> Result<(), NodeError> {
        self.delivered
            .lock()
            .unwrap()
            .push((body.to_vec(), signature_hex.to_string()));
        Ok(())
    }
}

pub struct TestNode {
    pub service: Arc<TestService>,
    pub chain: Arc<MockChain>,
    pub webhooks: Arc<RecordingWebhook>,
}

/// Build a node wired into `registry`.
pub fn make_node(registry: &Arc<Registry>) -> TestNode {
    let key = Ed25519Keypair::generate();
    let chain = Arc::new(MockChain::default());
    let webhooks = Arc::new(RecordingWebhook::default());
    let transport = Arc::new(LoopbackTransport {
        from: key.public_key,
        registry: registry.clone(),
    });
    let db = Arc::new(PaymentsDb::new(Arc::new(MemoryStore::new())));
    let service = Arc::new(
        Service::new(
            key,
            db,
            chain.clone(),
            Arc::new(MockWallet),
            transport,
            webhooks.clone(),
            test_config(),
        )
        .unwrap(),
    );
    registry.register(service.clone());
    TestNode {
        service,
        chain,
        webhooks,
    }
}

/// Seed matching active channel records on both nodes, each party funded
/// with `deposit`.
pub fn seed_channel(left: &TestNode, right: &TestNode, address: &str, deposit: u128) {
    let mut id = [0u8; 16];
    id.copy_from_slice(&sha256(address.as_bytes())[..16]);

    let build = |ours: &TestService, theirs: &TestService, we_left: bool| Channel {
        id,
        address: address.to_string(),
        asset: Asset::Native,
        status: ChannelStatus::Active,
        we_left,
        accepting_actions: true,
        our_onchain: {
            let mut st = OnchainState::new(*ours.public_key(), ours.wallet_address());
            st.deposited = deposit;
            st
        },
        their_onchain: {
            let mut st = OnchainState::new(*theirs.public_key(), theirs.wallet_address());
            st.deposited = deposit;
            st
        },
        our: Side::new(id),
        their: Side::new(id),
        init_at: 0,
        created_at: 0,
        last_processed_lt: 0,
        safe_onchain_close_period: 70,
        db_version: 0,
    };

    for (node, we_left) in [(left, true), (right, false)] {
        let other = if we_left { right } else { left };
        let mut channel = build(&node.service, &other.service, we_left);
        node.service
            .database()
            .transaction(|exec| node.service.database().put_channel(exec, &mut channel))
            .unwrap();
    }
}

/// Drain the channel-ops pools of all nodes until nothing moves, bounded.
pub async fn pump(nodes: &[&TestNode]) {
    for _ in 0..50 {
        let mut moved = false;
        for node in nodes {
            while node
                .service
                .process_one_task(paynet_node::vchan::POOL_CHANNEL_OPS)
                .await
                .unwrap()
            {
                moved = true;
            }
            while node
                .service
                .process_one_task(paynet_node::chain::POOL_CHAIN_EVENTS)
                .await
                .unwrap()
            {
                moved = true;
            }
            while node
                .service
                .process_one_task(paynet_node::webhook::POOL_WEBHOOKS)
                .await
                .unwrap()
            {
                moved = true;
            }
        }
        if !moved {
            return;
        }
    }
    panic!("task pools did not settle");
}

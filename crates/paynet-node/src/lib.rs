//! Off-chain payment-channel network node core.
//!
//! A node maintains bilateral on-chain payment channels with peers and uses
//! them to route multi-hop, privacy-preserving virtual payments through a
//! chain of intermediaries. This crate is the core: the channel state
//! engine, the virtual-channel lifecycle, the onion tunnel, the durable
//! task queue driving all cross-peer workflows, and the dispute pipeline
//! that enforces the strongest known state on chain.
//!
//! # Architecture
//!
//! - [`store`] — transactional KV contract (sled in production, in-memory
//!   for tests), the channel repository and the durable task queue.
//! - [`engine`] — applies signed-state actions and validates counterparty
//!   proposals, with Merkle proofs of every conditionals change.
//! - [`vchan`] / [`tunnel`] — virtual-channel bookkeeping and the layered
//!   per-hop instructions that keep each hop blind beyond its neighbors.
//! - [`chain`] / [`dispute`] — chain watcher and the uncooperative-close
//!   pipeline (start, challenge, settle, finalize).
//! - [`peer`] — request/response protocol between channel parties.
//! - [`service`] — the facade gluing everything together.
//!
//! External collaborators (chain RPC, wallet, peer transport, webhook
//! delivery) are injected as async traits; the core never talks to the
//! network directly.
//!
//! # Example: wiring a node
//!
//! ```no_run
//! use std::sync::Arc;
//! use paynet_crypto::Ed25519Keypair;
//! use paynet_node::config::ChannelConfig;
//! use paynet_node::service::Service;
//! use paynet_node::store::{PaymentsDb, SledStore};
//!
//! # fn collaborators() -> (Arc<dyn paynet_node::chain::ChainClient>, Arc<dyn paynet_node::chain::Wallet>, Arc<dyn paynet_node::peer::PeerTransport>, Arc<dyn paynet_node::webhook::WebhookSink>) { unimplemented!() }
//! # async fn run() -> Result<(), paynet_node::error::NodeError> {
//! let (store, _is_new) = SledStore::open("payments-db")?;
//! let db = Arc::new(PaymentsDb::new(Arc::new(store)));
//! let (chain, wallet, peers, webhooks) = collaborators();
//!
//! let service = Arc::new(Service::new(
//!     Ed25519Keypair::generate(),
//!     db,
//!     chain,
//!     wallet,
//!     peers,
//!     webhooks,
//!     ChannelConfig::default(),
//! )?);
//! let workers = service.spawn_workers();
//! # drop(workers);
//! # Ok(())
//! # }
//! ```

pub mod chain;
pub mod clock;
pub mod config;
pub mod dispute;
pub mod engine;
pub mod error;
pub mod peer;
pub mod queue;
pub mod semichannel;
pub mod service;
pub mod store;
pub mod tunnel;
pub mod types;
pub mod vchan;
pub mod webhook;

pub use engine::{AppliedAction, ChannelAction, StateEngine};
pub use error::NodeError;
pub use semichannel::{
    SemiChannel, SemiChannelBody, SignedSemiChannel, VirtualChannelCondition, VirtualChannelState,
};
pub use service::{OpenedVirtual, Service, TunnelHop};
pub use types::{
    Asset, Channel, ChannelStatus, OnchainState, Side, VirtualChannelMeta, VirtualChannelStatus,
};

//! Two-party end-to-end flows: open a virtual channel, settle it with a
//! resolve, and observe balances on both nodes.

mod common;

use std::sync::Arc;

use common::{make_node, pump, seed_channel, Registry};
use paynet_crypto::Ed25519Keypair;
use paynet_node::semichannel::VirtualChannelState;
use paynet_node::service::TunnelHop;
use paynet_node::types::{Asset, VirtualChannelStatus};
use paynet_node::NodeError;

const DEPOSIT: u128 = 1_000_000_000;

#[tokio::test]
async fn open_and_close_direct_virtual_channel() {
    let registry = Arc::new(Registry::default());
    let alice = make_node(&registry);
    let bob = make_node(&registry);
    seed_channel(&alice, &bob, "chan-ab", DEPOSIT);

    // Alice opens a 100-capacity virtual channel straight to Bob.
    let opened = alice
        .service
        .open_virtual_channel(
            Asset::Native,
            100,
            300,
            &[TunnelHop {
                key: *bob.service.public_key(),
                fee: 0,
                deadline_gap_seconds: 60,
            }],
            false,
        )
        .await
        .unwrap();
    pump(&[&alice, &bob]).await;

    // The condition is live on both records; Alice's balance reflects it.
    let alice_channel = alice.service.get_channel("chan-ab").unwrap();
    let bob_channel = bob.service.get_channel("chan-ab").unwrap();
    assert_eq!(alice_channel.our.conditionals.len(), 1);
    assert_eq!(bob_channel.their.conditionals.len(), 1);
    let (alice_balance, alice_locked) = alice_channel.balance(false).unwrap();
    assert_eq!(alice_balance, (DEPOSIT - 100) as i128);
    assert_eq!(alice_locked, 100);

    let alice_meta = alice.service.get_virtual_channel_meta(&opened.public_key).unwrap();
    assert_eq!(alice_meta.status, VirtualChannelStatus::Active);
    assert!(alice_meta.final_destination.is_some());
    let bob_meta = bob.service.get_virtual_channel_meta(&opened.public_key).unwrap();
    assert_eq!(bob_meta.status, VirtualChannelStatus::Active);
    assert!(bob_meta.incoming.is_some());

    // Alice hands Bob a resolve for 80; Bob drives the close.
    let virtual_key = Ed25519Keypair::from_private_key(opened.private_key_seed);
    let resolve = VirtualChannelState::sign(80, &virtual_key).unwrap();
    bob.service
        .close_virtual_channel(&opened.public_key, Some(&resolve))
        .await
        .unwrap();
    pump(&[&alice, &bob]).await;

    // Both sides settled: dictionaries empty, 80 moved from Alice to Bob.
    let alice_channel = alice.service.get_channel("chan-ab").unwrap();
    let bob_channel = bob.service.get_channel("chan-ab").unwrap();
    assert!(alice_channel.our.conditionals.is_empty());
    assert!(bob_channel.their.conditionals.is_empty());
    assert_eq!(alice_channel.our.signed.state.data.sent, 80);
    assert_eq!(bob_channel.their.signed.state.data.sent, 80);
    assert_eq!(bob_channel.our.signed.state.data.sent, 0);

    let (alice_balance, _) = alice_channel.balance(false).unwrap();
    let (bob_balance, _) = bob_channel.balance(false).unwrap();
    assert_eq!(alice_balance, (DEPOSIT - 80) as i128);
    assert_eq!(bob_balance, (DEPOSIT + 80) as i128);

    // Lifecycle reached `closed` on both nodes.
    assert_eq!(
        alice.service.get_virtual_channel_meta(&opened.public_key).unwrap().status,
        VirtualChannelStatus::Closed
    );
    assert_eq!(
        bob.service.get_virtual_channel_meta(&opened.public_key).unwrap().status,
        VirtualChannelStatus::Closed
    );

    // Webhooks fired with valid signatures.
    let delivered = bob.webhooks.delivered.lock().unwrap();
    assert!(!delivered.is_empty());
    for (body, signature) in delivered.iter() {
        assert_eq!(
            *signature,
            paynet_node::webhook::sign_body(b"test-webhook-key", body)
        );
    }
}

#[tokio::test]
async fn resolve_monotonicity_via_service() {
    let registry = Arc::new(Registry::default());
    let alice = make_node(&registry);
    let bob = make_node(&registry);
    seed_channel(&alice, &bob, "chan-ab", DEPOSIT);

    let opened = alice
        .service
        .open_virtual_channel(
            Asset::Native,
            100,
            300,
            &[TunnelHop {
                key: *bob.service.public_key(),
                fee: 0,
                deadline_gap_seconds: 60,
            }],
            false,
        )
        .await
        .unwrap();
    pump(&[&alice, &bob]).await;

    let virtual_key = Ed25519Keypair::from_private_key(opened.private_key_seed);
    let ten = VirtualChannelState::sign(10, &virtual_key).unwrap();
    bob.service
        .add_virtual_channel_resolve(&opened.public_key, &ten)
        .unwrap();

    let eight = VirtualChannelState::sign(8, &virtual_key).unwrap();
    let err = bob
        .service
        .add_virtual_channel_resolve(&opened.public_key, &eight)
        .unwrap_err();
    assert!(matches!(err, NodeError::NewerStateIsKnown));
    assert_eq!(
        bob.service
            .get_virtual_channel_meta(&opened.public_key)
            .unwrap()
            .known_resolve()
            .unwrap()
            .amount,
        10
    );

    let fifteen = VirtualChannelState::sign(15, &virtual_key).unwrap();
    bob.service
        .add_virtual_channel_resolve(&opened.public_key, &fifteen)
        .unwrap();
    assert_eq!(
        bob.service
            .get_virtual_channel_meta(&opened.public_key)
            .unwrap()
            .known_resolve()
            .unwrap()
            .amount,
        15
    );
}

#[tokio::test]
async fn commit_prepays_up_to_the_known_resolve() {
    let registry = Arc::new(Registry::default());
    let alice = make_node(&registry);
    let bob = make_node(&registry);
    seed_channel(&alice, &bob, "chan-ab", DEPOSIT);

    let opened = alice
        .service
        .open_virtual_channel(
            Asset::Native,
            100,
            300,
            &[TunnelHop {
                key: *bob.service.public_key(),
                fee: 0,
                deadline_gap_seconds: 60,
            }],
            false,
        )
        .await
        .unwrap();
    pump(&[&alice, &bob]).await;

    // Alice learns about a resolve of 40 and prepays it.
    let virtual_key = Ed25519Keypair::from_private_key(opened.private_key_seed);
    let resolve = VirtualChannelState::sign(40, &virtual_key).unwrap();
    alice
        .service
        .add_virtual_channel_resolve(&opened.public_key, &resolve)
        .unwrap();

    let commit = alice
        .service
        .commit_all_our_virtual_channels_and_wait(std::time::Duration::from_secs(2));
    // The queue is driven manually here, so run both concurrently.
    let peers = [&alice, &bob];
    let (commit_result, ()) = tokio::join!(commit, pump(&peers));
    commit_result.unwrap();

    let alice_channel = alice.service.get_channel("chan-ab").unwrap();
    assert_eq!(alice_channel.our.signed.state.data.sent, 40);
    let condition = alice_channel
        .our
        .condition(paynet_node::semichannel::dict_key_for(&opened.public_key))
        .unwrap()
        .unwrap();
    assert_eq!(condition.prepay, 40);

    // Bob's mirror agrees.
    let bob_channel = bob.service.get_channel("chan-ab").unwrap();
    assert_eq!(bob_channel.their.signed.state.data.sent, 40);
}

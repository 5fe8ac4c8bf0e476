//! Three-hop tunnel: payer → intermediary → payee, with an instant-close
//! transfer. The intermediary learns only its neighbors and earns its fee.

mod common;

use std::sync::Arc;

use common::{make_node, pump, seed_channel, Registry};
use paynet_node::service::TunnelHop;
use paynet_node::types::{Asset, VirtualChannelStatus};

const DEPOSIT: u128 = 1_000_000_000;

#[tokio::test]
async fn three_hop_transfer_settles_every_leg() {
    let registry = Arc::new(Registry::default());
    let alice = make_node(&registry);
    let ivan = make_node(&registry);
    let bob = make_node(&registry);
    seed_channel(&alice, &ivan, "chan-ai", DEPOSIT);
    seed_channel(&ivan, &bob, "chan-ib", DEPOSIT);

    // Alice sends 50 to Bob through Ivan, who charges a fee of 1.
    let opened = alice
        .service
        .open_virtual_channel(
            Asset::Native,
            50,
            300,
            &[
                TunnelHop {
                    key: *ivan.service.public_key(),
                    fee: 1,
                    deadline_gap_seconds: 60,
                },
                TunnelHop {
                    key: *bob.service.public_key(),
                    fee: 0,
                    deadline_gap_seconds: 60,
                },
            ],
            true,
        )
        .await
        .unwrap();

    pump(&[&alice, &ivan, &bob]).await;

    // Every leg settled: conditions gone, fees where they belong.
    let alice_ai = alice.service.get_channel("chan-ai").unwrap();
    let ivan_ai = ivan.service.get_channel("chan-ai").unwrap();
    let ivan_ib = ivan.service.get_channel("chan-ib").unwrap();
    let bob_ib = bob.service.get_channel("chan-ib").unwrap();

    assert!(alice_ai.our.conditionals.is_empty());
    assert!(ivan_ai.their.conditionals.is_empty());
    assert!(ivan_ib.our.conditionals.is_empty());
    assert!(bob_ib.their.conditionals.is_empty());

    // Alice paid 50 + 1 fee toward Ivan; Ivan paid 50 toward Bob.
    assert_eq!(alice_ai.our.signed.state.data.sent, 51);
    assert_eq!(ivan_ai.their.signed.state.data.sent, 51);
    assert_eq!(ivan_ib.our.signed.state.data.sent, 50);
    assert_eq!(bob_ib.their.signed.state.data.sent, 50);

    let (alice_balance, _) = alice_ai.balance(false).unwrap();
    let (ivan_ai_balance, _) = ivan_ai.balance(false).unwrap();
    let (ivan_ib_balance, _) = ivan_ib.balance(false).unwrap();
    let (bob_balance, _) = bob_ib.balance(false).unwrap();
    assert_eq!(alice_balance, (DEPOSIT - 51) as i128);
    assert_eq!(ivan_ai_balance, (DEPOSIT + 51) as i128);
    assert_eq!(ivan_ib_balance, (DEPOSIT - 50) as i128);
    assert_eq!(bob_balance, (DEPOSIT + 50) as i128);

    // All hops converged on `closed`.
    for node in [&alice, &ivan, &bob] {
        assert_eq!(
            node.service
                .get_virtual_channel_meta(&opened.public_key)
                .unwrap()
                .status,
            VirtualChannelStatus::Closed,
        );
    }

    // Ivan tracked both legs; Alice has no incoming, Bob no outgoing.
    let ivan_meta = ivan.service.get_virtual_channel_meta(&opened.public_key).unwrap();
    assert!(ivan_meta.incoming.is_some());
    assert!(ivan_meta.outgoing.is_some());
    assert_eq!(ivan_meta.incoming.unwrap().fee, 1);
    let alice_meta = alice.service.get_virtual_channel_meta(&opened.public_key).unwrap();
    assert!(alice_meta.incoming.is_none());
    assert_eq!(alice_meta.final_destination, Some(*bob.service.public_key()));
    let bob_meta = bob.service.get_virtual_channel_meta(&opened.public_key).unwrap();
    assert!(bob_meta.outgoing.is_none());

    // Only the initiator knows the final destination.
    assert!(ivan_meta.final_destination.is_none());
    assert!(bob_meta.final_destination.is_none());
}

#[tokio::test]
async fn intermediary_deadlines_shrink_downstream() {
    let registry = Arc::new(Registry::default());
    let alice = make_node(&registry);
    let ivan = make_node(&registry);
    let bob = make_node(&registry);
    seed_channel(&alice, &ivan, "chan-ai", DEPOSIT);
    seed_channel(&ivan, &bob, "chan-ib", DEPOSIT);

    let opened = alice
        .service
        .open_virtual_channel(
            Asset::Native,
            50,
            300,
            &[
                TunnelHop {
                    key: *ivan.service.public_key(),
                    fee: 1,
                    deadline_gap_seconds: 60,
                },
                TunnelHop {
                    key: *bob.service.public_key(),
                    fee: 0,
                    deadline_gap_seconds: 60,
                },
            ],
            false,
        )
        .await
        .unwrap();
    pump(&[&alice, &ivan, &bob]).await;

    // Upstream condition (toward Ivan) outlives the downstream one (toward
    // Bob), so closes can propagate back with margin.
    let ivan_meta = ivan.service.get_virtual_channel_meta(&opened.public_key).unwrap();
    let incoming = ivan_meta.incoming.unwrap();
    let outgoing = ivan_meta.outgoing.unwrap();
    assert!(incoming.uncooperative_deadline > outgoing.uncooperative_deadline);
    assert_eq!(
        incoming.uncooperative_deadline - outgoing.uncooperative_deadline,
        60
    );
    assert!(incoming.safe_deadline < incoming.uncooperative_deadline);

    // The payee's overall deadline is what the initiator reported.
    let bob_meta = bob.service.get_virtual_channel_meta(&opened.public_key).unwrap();
    assert_eq!(
        bob_meta.incoming.unwrap().uncooperative_deadline,
        opened.deadline
    );
}

//! End-to-end ceremony scenarios run entirely against in-memory
//! collaborators (see `common/mod.rs`), covering the lettered attack and
//! happy-path scenarios a real deployment's threat model calls out.

mod common;

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use common::{participants_map, InMemoryHsm, InMemoryMailbox, InMemoryStateStore};
use mpc_core::protocol::{self, IdentityMessage};
use mpc_core::state::DkgPhase;
use mpc_core::traits::{Hsm, HsmMode, Mailbox, StateStore};
use mpc_core::{signer, MpcError, Orchestrator};

const ROUND_ID: &str = "round-1";
const THRESHOLD: usize = 2;

struct NodeHandles {
    id: String,
    hsm: InMemoryHsm,
    store: InMemoryStateStore,
}

fn make_nodes() -> Vec<NodeHandles> {
    participants_map()
        .into_iter()
        .map(|(id, index)| NodeHandles {
            hsm: InMemoryHsm::new(&id, HsmMode::Demo),
            store: InMemoryStateStore::new(&id, index),
            id,
        })
        .collect()
}

fn orchestrator_for<'a>(
    node: &'a NodeHandles,
    mailbox: &'a InMemoryMailbox,
    participants: &BTreeMap<String, u32>,
) -> Orchestrator<'a, InMemoryMailbox, InMemoryHsm, InMemoryStateStore> {
    Orchestrator::new(node.id.clone(), participants.clone(), mailbox, &node.hsm, &node.store)
}

/// Post an identity record and initialize nonce derivation for every node,
/// the way `cmd_init` does in the binary.
fn init_all(nodes: &[NodeHandles], mailbox: &InMemoryMailbox) {
    for node in nodes {
        node.hsm.initialize_nonce_derivation().unwrap();
        let pubkey_pem = node.hsm.identity_public_key_pem().unwrap();
        let msg = IdentityMessage { node_id: node.id.clone(), pubkey_pem, timestamp: 0.0 };
        mailbox
            .post(&protocol::identity_path(&node.id), &serde_json::to_vec(&msg).unwrap())
            .unwrap();
    }
}

fn dkg_start_all(nodes: &[NodeHandles], mailbox: &InMemoryMailbox, participants: &BTreeMap<String, u32>) {
    for node in nodes {
        orchestrator_for(node, mailbox, participants).dkg_start(ROUND_ID, THRESHOLD).unwrap();
    }
}

fn dkg_distribute_all(
    nodes: &[NodeHandles],
    mailbox: &InMemoryMailbox,
    participants: &BTreeMap<String, u32>,
) {
    for node in nodes {
        orchestrator_for(node, mailbox, participants).dkg_distribute(ROUND_ID).unwrap();
    }
}

fn dkg_finalize_all(nodes: &[NodeHandles], mailbox: &InMemoryMailbox, participants: &BTreeMap<String, u32>) {
    for node in nodes {
        orchestrator_for(node, mailbox, participants).dkg_finalize(ROUND_ID).unwrap();
    }
}

fn message_hash(message: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(message);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

#[test]
fn happy_dkg_2_of_3() {
    let nodes = make_nodes();
    let participants = participants_map();
    let mailbox = InMemoryMailbox::new();

    init_all(&nodes, &mailbox);
    dkg_start_all(&nodes, &mailbox, &participants);
    dkg_distribute_all(&nodes, &mailbox, &participants);
    dkg_finalize_all(&nodes, &mailbox, &participants);

    let mut group_keys = Vec::new();
    for node in &nodes {
        let state = node.store.load().unwrap();
        let dkg = state.dkg.expect("dkg session recorded");
        assert_eq!(dkg.phase, DkgPhase::Finalized);
        group_keys.push(dkg.group_public_key_hex.expect("group key set"));
    }
    assert!(group_keys.windows(2).all(|w| w[0] == w[1]), "every node must agree on the group key");
}

#[test]
fn happy_sign_2_of_3() {
    let nodes = make_nodes();
    let participants = participants_map();
    let mailbox = InMemoryMailbox::new();

    init_all(&nodes, &mailbox);
    dkg_start_all(&nodes, &mailbox, &participants);
    dkg_distribute_all(&nodes, &mailbox, &participants);
    dkg_finalize_all(&nodes, &mailbox, &participants);

    let n1 = &nodes[0];
    let n2 = &nodes[1];
    let request_id = "tx-1";
    let hash = message_hash(b"hello");

    orchestrator_for(n1, &mailbox, &participants).sign_request(request_id, hash, "hello").unwrap();
    orchestrator_for(n1, &mailbox, &participants).sign_approve(request_id).unwrap();
    orchestrator_for(n2, &mailbox, &participants).sign_approve(request_id).unwrap();

    let first = orchestrator_for(n1, &mailbox, &participants).sign_finalize(request_id).unwrap();
    assert!(first.is_none(), "only one of two required partials posted so far");
    let second = orchestrator_for(n2, &mailbox, &participants).sign_finalize(request_id).unwrap();
    let (r_hex, s_hex) = second.expect("second partial completes the threshold");

    let group_public_key_hex =
        n1.store.load().unwrap().dkg.unwrap().group_public_key_hex.unwrap();
    let group_public_key = mpc_core::curve::deserialize_point(&group_public_key_hex).unwrap();
    assert!(signer::verify(&r_hex, &s_hex, &group_public_key, &hash));
}

#[test]
fn dishonest_dealer_share_fails_verification() {
    let nodes = make_nodes();
    let participants = participants_map();
    let mailbox = InMemoryMailbox::new();

    init_all(&nodes, &mailbox);
    dkg_start_all(&nodes, &mailbox, &participants);
    dkg_distribute_all(&nodes, &mailbox, &participants);

    // n2 (the dishonest dealer) had already posted a correctly-encrypted
    // share to n1; clobber it with an encryption of unrelated bytes so it
    // decrypts cleanly but fails Feldman verification.
    let bogus_share = [0x42u8; 32];
    let tampered = nodes[1].hsm.encrypt_for_recipient("n1", &bogus_share).unwrap();
    mailbox.overwrite(&protocol::dkg_share_path(ROUND_ID, "n2", "n1"), tampered);

    let err = orchestrator_for(&nodes[0], &mailbox, &participants)
        .dkg_finalize(ROUND_ID)
        .expect_err("tampered share must not finalize");
    match err {
        MpcError::ShareVerificationFailed(detail) => {
            assert!(detail.contains("n2"), "failure report must name the dishonest dealer: {detail}")
        },
        other => panic!("expected ShareVerificationFailed, got {other:?}"),
    }

    let state = nodes[0].store.load().unwrap();
    assert_eq!(
        state.dkg.unwrap().phase,
        DkgPhase::Distributed,
        "a failed finalize must not advance the phase"
    );
}

#[test]
fn state_rewind_attack_fails_with_nonce_reuse() {
    let nodes = make_nodes();
    let participants = participants_map();
    let mailbox = InMemoryMailbox::new();

    init_all(&nodes, &mailbox);
    dkg_start_all(&nodes, &mailbox, &participants);
    dkg_distribute_all(&nodes, &mailbox, &participants);
    dkg_finalize_all(&nodes, &mailbox, &participants);

    let n1 = &nodes[0];
    let request_id = "tx-rewind";
    let hash = message_hash(b"pay the attacker");
    orchestrator_for(n1, &mailbox, &participants).sign_request(request_id, hash, "rewind").unwrap();
    orchestrator_for(n1, &mailbox, &participants).sign_approve(request_id).unwrap();

    // Simulate restoring n1's state directory from a stale backup: the
    // local nonce witness is lost, but the HSM and the board still
    // remember the commitment.
    n1.store.wipe_used_nonces();

    let err = orchestrator_for(n1, &mailbox, &participants)
        .sign_approve(request_id)
        .expect_err("a rewound local state must not allow a second nonce for the same request");
    assert!(matches!(err, MpcError::NonceReuse));
}

#[test]
fn board_rewind_attack_fails_with_nonce_reuse() {
    let nodes = make_nodes();
    let participants = participants_map();
    let mailbox = InMemoryMailbox::new();

    init_all(&nodes, &mailbox);
    dkg_start_all(&nodes, &mailbox, &participants);
    dkg_distribute_all(&nodes, &mailbox, &participants);
    dkg_finalize_all(&nodes, &mailbox, &participants);

    let n1 = &nodes[0];
    let request_id = "tx-board-rewind";
    let hash = message_hash(b"pay the attacker again");
    orchestrator_for(n1, &mailbox, &participants).sign_request(request_id, hash, "board rewind").unwrap();
    orchestrator_for(n1, &mailbox, &participants).sign_approve(request_id).unwrap();

    // Simulate an attacker force-pushing a rewound mailbox clone: the
    // board entry disappears, but n1's own local state and HSM records
    // are untouched.
    mailbox.delete(&protocol::signing_commitment_path(request_id, "n1"));

    let err = orchestrator_for(n1, &mailbox, &participants)
        .sign_approve(request_id)
        .expect_err("a rewound board must not allow a second nonce for the same request");
    assert!(matches!(err, MpcError::NonceReuse));
}

#[test]
fn participant_split_converges_to_one_locked_set() {
    let nodes = make_nodes();
    let participants = participants_map();
    let mailbox = InMemoryMailbox::new();

    init_all(&nodes, &mailbox);
    dkg_start_all(&nodes, &mailbox, &participants);
    dkg_distribute_all(&nodes, &mailbox, &participants);
    dkg_finalize_all(&nodes, &mailbox, &participants);

    let request_id = "tx-split";
    let hash = message_hash(b"quorum race");
    orchestrator_for(&nodes[0], &mailbox, &participants)
        .sign_request(request_id, hash, "quorum race")
        .unwrap();

    // All three approve, even though only two will end up in the locked set.
    for node in &nodes {
        orchestrator_for(node, &mailbox, &participants).sign_approve(request_id).unwrap();
    }

    let first = orchestrator_for(&nodes[0], &mailbox, &participants).sign_finalize(request_id).unwrap();
    assert!(first.is_none());
    let second = orchestrator_for(&nodes[1], &mailbox, &participants).sign_finalize(request_id).unwrap();
    let (r_hex, s_hex) = second.expect("n1 and n2 together reach the threshold");

    let lock_data = mailbox.read(&protocol::signing_session_path(request_id)).unwrap().unwrap();
    let lock: mpc_core::protocol::SessionLock = serde_json::from_slice(&lock_data).unwrap();
    assert_eq!(lock.participants, vec!["n1".to_string(), "n2".to_string()]);

    let group_public_key_hex =
        nodes[0].store.load().unwrap().dkg.unwrap().group_public_key_hex.unwrap();
    let group_public_key = mpc_core::curve::deserialize_point(&group_public_key_hex).unwrap();
    assert!(signer::verify(&r_hex, &s_hex, &group_public_key, &hash));

    let left_out = orchestrator_for(&nodes[2], &mailbox, &participants).sign_finalize(request_id);
    assert!(matches!(left_out, Err(MpcError::NotInLockedSet)));
}

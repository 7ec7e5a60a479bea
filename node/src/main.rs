//! `mpc-node`: the CLI binary wiring `mpc_core::Orchestrator` to concrete
//! PKCS#11/Git/JSON collaborators. One subcommand per ceremony step, run
//! as a single process invocation — this binary holds no long-lived
//! ceremony state in memory between invocations; everything crosses
//! process boundaries through the `StateStore` and the mailbox.

mod config;
mod error;
mod hsm;
mod logging;
mod mailbox;
mod store;

use clap::{Parser, Subcommand};
use mpc_core::protocol::{self, IdentityMessage, SigningRequest};
use mpc_core::traits::{Hsm, HsmMode, Mailbox, StateStore};
use mpc_core::Orchestrator;
use sha2::{Digest, Sha256};
use tracing::info;

use config::{CliOverrides, NodeConfig};
use hsm::Pkcs11Hsm;
use mailbox::GitMailbox;
use store::FileStateStore;

#[derive(Parser)]
#[command(name = "mpc-node", about = "Asynchronous threshold-custody node")]
struct Cli {
    #[command(flatten)]
    overrides: CliOverrides,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Verify HSM connectivity, set up nonce derivation, post identity.
    Init,
    /// Show local DKG/signing state plus the triple-guard consistency audit.
    Status,
    /// DKG phase 1: generate a polynomial and broadcast its commitments.
    DkgStart {
        #[arg(long)]
        round_id: String,
    },
    /// Show commitment/share counts for a DKG round.
    DkgStatus {
        #[arg(long)]
        round_id: String,
    },
    /// DKG phase 2: encrypt and post a share for every other participant.
    DkgDistribute {
        #[arg(long)]
        round_id: String,
    },
    /// DKG phase 3: verify incoming shares and assemble the final share.
    DkgFinalize {
        #[arg(long)]
        round_id: String,
    },
    /// Disaster-recovery listing of HSM nonce-derivation audit records
    /// (demo mode only).
    DkgListRecoveryRecords,
    /// Post a signing request for `message` (its SHA-256 hash is signed).
    SignRequest {
        #[arg(long)]
        message: String,
    },
    /// List open signing requests and their phase.
    SignList,
    /// Run the triple-layer nonce guard, derive a nonce, post a commitment.
    SignApprove {
        #[arg(long)]
        request_id: String,
    },
    /// Lock the participant set, post a partial signature, combine if ready.
    SignFinalize {
        #[arg(long)]
        request_id: String,
    },
}

fn main() -> anyhow::Result<()> {
    logging::init();
    let cli = Cli::parse();
    let config = NodeConfig::load(&cli.overrides)?;

    let own_index = *config
        .participants
        .get(&config.node_id)
        .ok_or_else(|| anyhow::anyhow!("node_id {:?} missing from participants", config.node_id))?;

    let hsm_mode: HsmMode = config.mode.into();
    let hsm = Pkcs11Hsm::open(&config.pkcs11_module_path, config.pkcs11_slot, &config.hsm_pin, hsm_mode)?;

    let state_dir = format!("{}/state", config.data_dir);
    let store = FileStateStore::open(&state_dir, &config.node_id, own_index)?;

    let board_dir = format!("{}/board", config.data_dir);
    let mailbox = GitMailbox::open(&config.mailbox_url, &board_dir, &config.node_id)?;

    let orchestrator =
        Orchestrator::new(config.node_id.clone(), config.participants.clone(), &mailbox, &hsm, &store);

    match cli.command {
        Command::Init => cmd_init(&config, &hsm, &mailbox),
        Command::Status => cmd_status(&config, &hsm, &store, &mailbox),
        Command::DkgStart { round_id } => cmd_dkg_start(&orchestrator, &round_id, config.threshold),
        Command::DkgStatus { round_id } => cmd_dkg_status(&config, &mailbox, &round_id),
        Command::DkgDistribute { round_id } => cmd_dkg_distribute(&orchestrator, &round_id),
        Command::DkgFinalize { round_id } => cmd_dkg_finalize(&orchestrator, &round_id),
        Command::DkgListRecoveryRecords => cmd_recovery_records(&hsm),
        Command::SignRequest { message } => cmd_sign_request(&orchestrator, &message),
        Command::SignList => cmd_sign_list(&mailbox),
        Command::SignApprove { request_id } => cmd_sign_approve(&orchestrator, &request_id),
        Command::SignFinalize { request_id } => cmd_sign_finalize(&orchestrator, &request_id),
    }
}

fn cmd_init(config: &NodeConfig, hsm: &Pkcs11Hsm, mailbox: &GitMailbox) -> anyhow::Result<()> {
    if hsm.mode() == HsmMode::Demo {
        tracing::warn!("running with HSM_MODE=demo: secrets are extractable, do not use in production");
    }

    let pubkey_pem = hsm.identity_public_key_pem()?;
    info!(bytes = pubkey_pem.len(), "identity key found");

    if hsm.initialize_nonce_derivation()? {
        info!("nonce master seed created, counter initialized at 0");
    } else {
        info!("nonce derivation already initialized");
    }

    let identity_path = protocol::identity_path(&config.node_id);
    if mailbox.read(&identity_path)?.is_some() {
        info!("identity already posted to the board");
        return Ok(())
    }

    let msg = IdentityMessage {
        node_id: config.node_id.clone(),
        pubkey_pem,
        timestamp: current_timestamp(),
    };
    mailbox.post(&identity_path, &serde_json::to_vec(&msg)?)?;
    info!("identity posted to the board");
    Ok(())
}

fn cmd_status(
    config: &NodeConfig,
    hsm: &Pkcs11Hsm,
    store: &FileStateStore,
    mailbox: &GitMailbox,
) -> anyhow::Result<()> {
    let state = store.load()?;

    println!("Node: {}", config.node_id);
    println!("HSM mode: {:?}", hsm.mode());
    match &state.dkg {
        Some(dkg) => {
            println!("DKG round: {} (phase: {:?})", dkg.round_id, dkg.phase);
            if let Some(pk) = &dkg.group_public_key_hex {
                println!("Group public key: {pk}");
            }
        },
        None => println!("DKG: not started"),
    }

    println!("Local nonce records: {}", state.used_nonces.len());
    if hsm.mode() == HsmMode::Demo {
        let hsm_nonces = hsm.list_used_nonces()?;
        let local: std::collections::BTreeSet<&String> = state.used_nonces.keys().collect();
        let remote: std::collections::BTreeSet<&String> = hsm_nonces.iter().collect();
        if local == remote {
            println!("Triple-guard audit: MATCHED ({} entries)", local.len());
        } else {
            println!(
                "Triple-guard audit: MISMATCH (local only: {:?}, HSM only: {:?})",
                local.difference(&remote).collect::<Vec<_>>(),
                remote.difference(&local).collect::<Vec<_>>()
            );
        }
    } else {
        println!("Triple-guard audit: unavailable in production mode (HSM values non-extractable)");
    }

    let identities = mailbox.list("identity")?;
    println!("Board identities: {}", identities.len());
    Ok(())
}

fn cmd_dkg_start<MB: Mailbox, H: Hsm, S: StateStore>(
    orchestrator: &Orchestrator<'_, MB, H, S>,
    round_id: &str,
    threshold: usize,
) -> anyhow::Result<()> {
    let commitments = orchestrator.dkg_start(round_id, threshold)?;
    println!("Posted {} commitments for round {round_id}", commitments.len());
    Ok(())
}

fn cmd_dkg_status(config: &NodeConfig, mailbox: &GitMailbox, round_id: &str) -> anyhow::Result<()> {
    let commits = mailbox.list(&format!("dkg/{round_id}/commitments"))?;
    println!("Commitments ({}/{}):", commits.len(), config.participants.len());
    for c in &commits {
        println!("  {}", c.trim_end_matches(".json"));
    }

    let shares = mailbox.list(&format!("dkg/{round_id}/shares"))?;
    let suffix = format!("_to_{}.enc", config.node_id);
    let incoming: Vec<&String> = shares.iter().filter(|f| f.ends_with(&suffix)).collect();
    println!("Shares received: {}", incoming.len());
    for s in incoming {
        println!("  from {}", s.trim_end_matches(&suffix));
    }
    Ok(())
}

fn cmd_dkg_distribute<MB: Mailbox, H: Hsm, S: StateStore>(
    orchestrator: &Orchestrator<'_, MB, H, S>,
    round_id: &str,
) -> anyhow::Result<()> {
    let outcomes = orchestrator.dkg_distribute(round_id)?;
    for (peer, outcome) in outcomes {
        match outcome {
            mpc_core::orchestrator::DistributeOutcome::Posted => println!("sent share to {peer}"),
            mpc_core::orchestrator::DistributeOutcome::NoIdentity => {
                println!("no identity for {peer}, skipped")
            },
        }
    }
    Ok(())
}

fn cmd_dkg_finalize<MB: Mailbox, H: Hsm, S: StateStore>(
    orchestrator: &Orchestrator<'_, MB, H, S>,
    round_id: &str,
) -> anyhow::Result<()> {
    orchestrator.dkg_finalize(round_id)?;
    println!("DKG round {round_id} finalized");
    Ok(())
}

fn cmd_recovery_records(hsm: &Pkcs11Hsm) -> anyhow::Result<()> {
    let records = hsm.list_derivation_records()?;
    if records.is_empty() && hsm.mode() == HsmMode::Production {
        println!("production mode: derivation records are non-extractable");
        return Ok(())
    }
    for r in records {
        println!("counter={} request_id={} R={}", r.counter, r.request_id, r.r_hex);
    }
    Ok(())
}

fn cmd_sign_request<MB: Mailbox, H: Hsm, S: StateStore>(
    orchestrator: &Orchestrator<'_, MB, H, S>,
    message: &str,
) -> anyhow::Result<()> {
    let request_id = format!("tx_{:08x}", rand::random::<u32>());
    let mut hasher = Sha256::new();
    hasher.update(message.as_bytes());
    let mut message_hash = [0u8; 32];
    message_hash.copy_from_slice(&hasher.finalize());

    let preview: String = message.chars().take(50).collect();
    orchestrator.sign_request(&request_id, message_hash, &preview)?;
    println!("Request created: {request_id}");
    println!("  message_hash: {}", hex::encode(message_hash));
    Ok(())
}

fn cmd_sign_list(mailbox: &GitMailbox) -> anyhow::Result<()> {
    let request_ids = mailbox.list("signing")?;
    if request_ids.is_empty() {
        println!("No signing requests.");
        return Ok(())
    }
    for request_id in request_ids {
        let req_data = mailbox.read(&protocol::signing_request_path(&request_id))?;
        let Some(req_data) = req_data else { continue };
        let req: SigningRequest = serde_json::from_slice(&req_data)?;

        let commits = mailbox.list(&format!("signing/{request_id}/commitments")).unwrap_or_default();
        let partials = mailbox.list(&format!("signing/{request_id}/partials")).unwrap_or_default();
        let has_result = mailbox.read(&protocol::signing_result_path(&request_id))?.is_some();

        let phase = if has_result {
            "finalized".to_string()
        } else {
            format!("{}c/{}p", commits.len(), partials.len())
        };
        println!("{request_id}: {phase} (from {}, {:?})", req.requester, req.message_preview);
    }
    Ok(())
}

fn cmd_sign_approve<MB: Mailbox, H: Hsm, S: StateStore>(
    orchestrator: &Orchestrator<'_, MB, H, S>,
    request_id: &str,
) -> anyhow::Result<()> {
    match orchestrator.sign_approve(request_id) {
        Ok(()) => {
            println!("Approved {request_id} with triple-layer nonce protection.");
            Ok(())
        },
        Err(mpc_core::MpcError::AlreadyCommitted) => {
            println!("Recovered a pre-existing board commitment for {request_id}; not re-approving.");
            Ok(())
        },
        Err(e) => Err(e.into()),
    }
}

fn cmd_sign_finalize<MB: Mailbox, H: Hsm, S: StateStore>(
    orchestrator: &Orchestrator<'_, MB, H, S>,
    request_id: &str,
) -> anyhow::Result<()> {
    match orchestrator.sign_finalize(request_id)? {
        Some((r_hex, s_hex)) => {
            println!("VALID SIGNATURE for {request_id}");
            println!("  R: {r_hex}");
            println!("  s: {s_hex}");
        },
        None => println!("partial signature posted; awaiting more partials"),
    }
    Ok(())
}

fn current_timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

//! Integration tests for a recipient that never heard about an abort.
//!
//! The donor's abort message to the recipient is dropped, leaving the
//! recipient attached to a dead session. These validate that:
//! - a new migration is refused while the dead session looks recent,
//! - once it has been idle long enough a new migration displaces it,
//! - late calls carrying the dead session id are rejected and change nothing.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use chunkmove::{
    u64_key, Checkpoint, CloneBatch, Document, KeyRange, MigrationConfig, MigrationError,
    MigrationState, RecipientEndpoint, RecipientState, SessionId, XferBatch, XferEntry, XferOp,
};
use common::{body, seeded_cluster, test_config, FaultyEndpoint};

fn stale_clone(session_id: &SessionId) -> CloneBatch {
    CloneBatch {
        session_id: session_id.clone(),
        clone_epoch: 1,
        docs: vec![Document::new(u64_key(7), b"stale".to_vec())],
    }
}

fn stale_mods(session_id: &SessionId) -> XferBatch {
    XferBatch {
        entries: vec![XferEntry {
            session_id: session_id.clone(),
            seq: 1,
            op: XferOp::Upsert {
                key: u64_key(7),
                body: b"stale".to_vec(),
            },
        }],
        remaining: 0,
    }
}

fn assert_stale(result: Result<impl std::fmt::Debug, MigrationError>, dead: &SessionId) {
    match result {
        Err(MigrationError::StaleMigrationSession { received, .. }) => {
            assert_eq!(&received, dead);
        }
        other => panic!("expected stale session rejection, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn dead_session_is_displaced_and_its_calls_rejected() {
    let cfg = MigrationConfig {
        recipient_idle_timeout: Duration::from_secs(1),
        ..test_config()
    };
    let cluster = seeded_cluster(&[1, 2], "collA", 1, 40, cfg).await;
    let faults = FaultyEndpoint::install(&cluster, 2);
    faults.drop_aborts.store(true, Ordering::SeqCst);
    let recipient = cluster.node(2).expect("recipient");
    let range = KeyRange::u64s(0, 30);

    // First attempt dies after one clone batch; the recipient never learns.
    let pause = cluster.checkpoints.arm(Checkpoint::AfterCloneBatch);
    let dead = cluster
        .request_migration("collA", range.clone(), 2)
        .await
        .expect("accepted");
    let dead_id = pause.wait_reached().await;
    cluster.interrupt(&dead_id).expect("interrupt");
    pause.release();
    let status = dead.wait().await.expect("join");
    assert_eq!(status.state, MigrationState::Aborted);
    assert_eq!(recipient.recipient.active_session(), Some(dead_id.clone()));
    assert_eq!(recipient.recipient.state(), RecipientState::Cloning);
    faults.drop_aborts.store(false, Ordering::SeqCst);

    // Too recent to displace.
    let err = cluster
        .run_migration("collA", range.clone(), 2)
        .await
        .err()
        .expect("recipient still busy");
    match err {
        MigrationError::RecipientBusy { shard, active } => {
            assert_eq!(shard, 2);
            assert_eq!(active, dead_id);
        }
        other => panic!("expected RecipientBusy, got {other:?}"),
    }
    assert_eq!(cluster.catalog.epoch("collA"), Some(1));

    tokio::time::advance(Duration::from_secs(2)).await;

    let pause = cluster.checkpoints.arm(Checkpoint::AfterCloneBatch);
    let live = cluster
        .request_migration("collA", range.clone(), 2)
        .await
        .expect("accepted");
    let live_id = pause.wait_reached().await;
    assert_ne!(live_id, dead_id);
    assert_eq!(recipient.recipient.active_session(), Some(live_id.clone()));
    let cloned = recipient.store.orphan_count("collA");

    // Late traffic from the dead session while the new one is live.
    assert_stale(recipient.recipient.clone_batch(stale_clone(&dead_id)).await, &dead_id);
    assert_stale(
        recipient
            .recipient
            .transfer_mods(&dead_id, stale_mods(&dead_id))
            .await,
        &dead_id,
    );
    assert_stale(recipient.recipient.commit(&dead_id).await, &dead_id);
    assert_stale(recipient.recipient.abort(&dead_id).await, &dead_id);
    assert_eq!(recipient.store.orphan_count("collA"), cloned);
    assert_eq!(recipient.recipient.active_session(), Some(live_id.clone()));

    pause.release();
    let status = live.wait().await.expect("join");
    assert_eq!(status.state, MigrationState::Committed);
    assert_eq!(status.cloned_docs, 30);

    // And after the new session committed.
    assert_stale(recipient.recipient.clone_batch(stale_clone(&dead_id)).await, &dead_id);
    assert_stale(
        recipient
            .recipient
            .transfer_mods(&dead_id, stale_mods(&dead_id))
            .await,
        &dead_id,
    );
    assert_stale(recipient.recipient.commit(&dead_id).await, &dead_id);
    recipient
        .recipient
        .abort(&dead_id)
        .await
        .expect("abort of a finished foreign session is a no-op");

    assert_eq!(recipient.recipient.state(), RecipientState::Steady);
    assert_eq!(
        recipient.store.get("collA", &u64_key(7)).expect("owned"),
        Some(body(7, 0))
    );
    assert!(cluster
        .catalog
        .routing("collA")
        .expect("routing")
        .owned_by(2, &range));
    cluster.verify_ownership("collA").expect("ownership consistent");
}

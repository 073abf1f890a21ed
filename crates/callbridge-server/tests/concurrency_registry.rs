//! Concurrency tests for the session registry and the per-call tasks.
//!
//! These verify that many calls can register, serve and tear down at the
//! same time without losing entries, leaking entries or blocking each other.

mod common;

use callbridge_server::coordinator::CloseReason;
use callbridge_server::registry::SessionRegistry;
use common::{
    coordinator, media_frame, next_text, settings, spawn_serve, start_frame, Script,
    ScriptedSource,
};
use std::time::Duration;

#[tokio::test]
async fn concurrent_register_remove_leaves_no_orphans() {
    let registry = SessionRegistry::new();
    let mut handles = Vec::new();

    for i in 0..200 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            let ticket = registry.register(&format!("CA{}", i), None);
            tokio::task::yield_now().await;
            assert!(registry.remove(&ticket.call_id, ticket.connection_id));
        }));
    }

    for handle in handles {
        handle.await.expect("task should not panic");
    }
    assert!(registry.is_empty());
}

#[tokio::test]
async fn racing_registrations_keep_exactly_one_owner() {
    let registry = SessionRegistry::new();
    let mut handles = Vec::new();

    for _ in 0..50 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move { registry.register("CA-dup", None) }));
    }

    let mut tickets = Vec::new();
    for handle in handles {
        tickets.push(handle.await.expect("task should not panic"));
    }
    assert_eq!(registry.len(), 1);

    // Only the surviving ticket can remove the entry.
    let removed = tickets
        .iter()
        .filter(|t| registry.remove("CA-dup", t.connection_id))
        .count();
    assert_eq!(removed, 1);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn many_calls_run_in_parallel() {
    // Every other call stalls its generation; the rest must still get replies.
    let scripts = (0..20)
        .map(|i| {
            if i % 2 == 0 {
                Script::Stall
            } else {
                Script::Tokens(vec!["reply"])
            }
        })
        .collect();
    let source = ScriptedSource::new(scripts);
    let (coordinator, registry, metrics) = coordinator(source, settings());

    let mut peers = Vec::new();
    for i in 0..20 {
        let (mut peer, handle) = spawn_serve(&coordinator);
        peer.tx.send(start_frame(&format!("CA{}", i))).unwrap();
        next_text(&mut peer.out, 2).await;
        // Generations are handed out in the order media arrives.
        peer.tx.send(media_frame("hi")).unwrap();
        if i % 2 == 1 {
            assert_eq!(next_text(&mut peer.out, 2).await, "reply");
        } else {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        peers.push((peer, handle));
    }
    assert_eq!(registry.len(), 20);

    for (peer, handle) in peers {
        drop(peer.tx);
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.reason, CloseReason::PeerClosed);
    }
    assert!(registry.is_empty());
    assert_eq!(metrics.snapshot(0).calls_connected, 20);
}

//! High concurrency tests for request pairing
//!
//! Many users ask to be matched at once, against one in-memory store and
//! against several independent SQLite connections sharing one database file.
//! Whatever the interleaving, every user ends up in at most one session and
//! every session pairs exactly two users who name each other. A candidate
//! whose claimer was itself claimed mid-attempt is expired, never re-pooled.

mod fixtures;

use futures::future::join_all;
use heart_link::lifecycle::RequestLifecycleManager;
use heart_link::store::SessionStore;
use heart_link::types::{MatchStatus, SessionId, SessionStatus, StatusReport};
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use fixtures::{memory_system, sqlite_manager};

/// Final tally of one run
struct Tally {
    sessions: usize,
    waiting: usize,
    released: usize,
}

/// Check the pairing invariants over every user's final status and the
/// stored session rows behind them
fn assert_consistent_pairings(
    store: &dyn SessionStore,
    reports: &HashMap<String, StatusReport>,
) -> Tally {
    let mut members: HashMap<SessionId, Vec<&str>> = HashMap::new();
    let mut waiting = 0;
    let mut released = 0;

    for (user, report) in reports {
        match report.status {
            MatchStatus::Matched => {
                let session_id = report.session_id.expect("matched without session");
                let peer_id = report.peer_id.as_deref().expect("matched without peer");
                assert_ne!(peer_id, user, "{} paired with itself", user);

                let peer = &reports[peer_id];
                assert_eq!(peer.status, MatchStatus::Matched);
                assert_eq!(peer.session_id, Some(session_id));
                assert_eq!(peer.peer_id.as_deref(), Some(user.as_str()));

                let session = store
                    .get_session(session_id)
                    .unwrap()
                    .expect("matched session row missing");
                assert_eq!(session.status, SessionStatus::Active);
                let participants: BTreeSet<&str> =
                    session.participants().map(String::as_str).collect();
                assert_eq!(
                    participants,
                    BTreeSet::from([user.as_str(), peer_id]),
                    "session {} holds the wrong users",
                    session_id
                );

                members.entry(session_id).or_default().push(user);
            }
            MatchStatus::Pending => waiting += 1,
            MatchStatus::Expired => released += 1,
            other => panic!("{} ended in unexpected status {:?}", user, other),
        }
    }

    for (session_id, users) in &members {
        assert_eq!(users.len(), 2, "session {} holds {:?}", session_id, users);
    }
    Tally {
        sessions: members.len(),
        waiting,
        released,
    }
}

async fn final_reports(
    manager: &RequestLifecycleManager,
    users: &[String],
) -> HashMap<String, StatusReport> {
    let mut reports = HashMap::new();
    for user in users {
        reports.insert(user.clone(), manager.get_status(user).await.unwrap());
    }
    reports
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_100_concurrent_requests_in_memory() {
    let (manager, store, _feed) = memory_system();
    let users: Vec<String> = (0..100).map(|i| format!("load_user_{}", i)).collect();

    let start_time = Instant::now();
    let results = join_all(users.iter().map(|user| {
        let manager = manager.clone();
        let user = user.clone();
        tokio::spawn(async move { manager.create_request(&user).await })
    }))
    .await;
    let elapsed = start_time.elapsed();

    for result in results {
        result.expect("task panicked").expect("create_request failed");
    }

    let reports = final_reports(&manager, &users).await;
    let tally = assert_consistent_pairings(&*store, &reports);
    assert_eq!(
        tally.sessions * 2 + tally.waiting + tally.released,
        users.len()
    );
    assert!(tally.sessions > 0);
    assert_eq!(
        store
            .all_sessions()
            .unwrap()
            .iter()
            .filter(|s| s.status == SessionStatus::Active)
            .count(),
        tally.sessions
    );

    println!(
        "100 concurrent requests in {:.2}ms: {} sessions, {} waiting, {} released",
        elapsed.as_secs_f64() * 1000.0,
        tally.sessions,
        tally.waiting,
        tally.released
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_across_sqlite_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("concurrent.db");

    // One manager per connection, like separate worker processes
    let (managers, stores): (Vec<_>, Vec<_>) = (0..4).map(|_| sqlite_manager(&path)).unzip();
    let users: Vec<String> = (0..40).map(|i| format!("sqlite_user_{}", i)).collect();

    let results = join_all(users.iter().enumerate().map(|(i, user)| {
        let manager = managers[i % managers.len()].clone();
        let user = user.clone();
        tokio::spawn(async move { manager.create_request(&user).await })
    }))
    .await;

    for result in results {
        result.expect("task panicked").expect("create_request failed");
    }

    let reports = final_reports(&managers[0], &users).await;
    // Read the rows back through a connection other than the reporting one
    let tally = assert_consistent_pairings(&*stores[1], &reports);
    assert_eq!(
        tally.sessions * 2 + tally.waiting + tally.released,
        users.len()
    );
    let stats = managers[0].stats().await.unwrap();
    assert_eq!(stats.active_sessions as usize, tally.sessions);
    assert_eq!(stats.counts.matched as usize, tally.sessions * 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repeated_requests_from_same_user_open_one_request() {
    let (manager, store, _feed) = memory_system();

    let results = join_all((0..20).map(|_| {
        let manager = manager.clone();
        tokio::spawn(async move { manager.create_request("alice").await })
    }))
    .await;

    for result in results {
        result.expect("task panicked").expect("create_request failed");
    }

    let requests = store.all_requests().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        manager.get_status("alice").await.unwrap().status,
        MatchStatus::Pending
    );
}

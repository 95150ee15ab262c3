//! Shared fixtures and the store contract every backend must pass.

use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

use crate::error::LeaseError;
use crate::identity::ResourceId;

use super::models::{
    AcquireOutcome, LeaseState, ReleaseOutcome, ResourceDomain, ResourceEnv, ResourceRecord,
};
use super::repository::ResourceRepository;

pub(crate) fn record(login: &str, created_at: DateTime<Utc>) -> ResourceRecord {
    ResourceRecord {
        id: ResourceId::new(),
        created_at,
        login: login.to_string(),
        password_hash: "sha256$1$00$00".to_string(),
        project_id: Uuid::new_v4(),
        env: ResourceEnv::Prod,
        domain: ResourceDomain::Regular,
        lease_expiry: None,
    }
}

pub(crate) fn seed_resource<R: ResourceRepository + ?Sized>(
    repo: &R,
    login: &str,
    created_at: DateTime<Utc>,
) -> ResourceId {
    let row = record(login, created_at);
    repo.insert_resource(&row).expect("seed resource");
    row.id
}

/// Exercises the full lease contract against one store instance. The store
/// must be empty.
pub(crate) fn assert_repository_contract<R: ResourceRepository + ?Sized>(repo: &R) {
    let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();
    repo.ping().expect("ping");

    let a = seed_resource(repo, "a@example.com", t0);
    let b = seed_resource(repo, "b@example.com", t0 + Duration::seconds(1));

    let dup = record("a@example.com", t0 + Duration::seconds(2));
    assert_eq!(
        repo.insert_resource(&dup),
        Err(LeaseError::DuplicateLogin("a@example.com".into()))
    );

    let ids = |rows: Vec<ResourceRecord>| rows.into_iter().map(|r| r.id).collect::<Vec<_>>();

    let listed = ids(repo.list_resources().expect("list"));
    assert_eq!(listed, vec![b, a]);
    assert_eq!(
        repo.find_by_login("b@example.com").expect("find").map(|r| r.id),
        Some(b)
    );
    assert!(repo.find_by_login("nobody@example.com").expect("find").is_none());

    let free = ids(repo.list_free_resources(10).expect("free"));
    assert_eq!(free, vec![a, b]);
    assert_eq!(repo.list_free_resources(1).expect("free").len(), 1);

    let leased_at = t0 + Duration::seconds(5);
    match repo.try_acquire(&a, leased_at).expect("acquire") {
        AcquireOutcome::Acquired(row) => {
            assert_eq!(row.id, a);
            assert_eq!(row.lease_expiry, Some(leased_at));
        }
        other => panic!("expected acquired, got {other:?}"),
    }
    assert_eq!(
        repo.try_acquire(&a, leased_at).expect("second acquire"),
        AcquireOutcome::AlreadyLocked
    );
    assert_eq!(
        repo.try_acquire(&ResourceId::new(), leased_at).expect("missing acquire"),
        AcquireOutcome::Missing
    );
    let free = ids(repo.list_free_resources(10).expect("free"));
    assert_eq!(free, vec![b]);

    assert_eq!(repo.clear_stale_leases(leased_at - Duration::seconds(1)).expect("reap"), 0);
    assert_eq!(
        repo.get_resource(&a).expect("get").map(|r| r.state()),
        Some(LeaseState::Leased)
    );
    assert_eq!(repo.clear_stale_leases(leased_at).expect("reap"), 1);
    assert_eq!(
        repo.get_resource(&a).expect("get").map(|r| r.state()),
        Some(LeaseState::Free)
    );

    let taken = repo
        .acquire_oldest_free(leased_at)
        .expect("acquire oldest")
        .expect("a is free again");
    assert_eq!(taken.id, a);
    let taken = repo
        .acquire_oldest_free(leased_at)
        .expect("acquire oldest")
        .expect("b is free");
    assert_eq!(taken.id, b);
    assert!(repo.acquire_oldest_free(leased_at).expect("acquire oldest").is_none());

    assert!(matches!(
        repo.release(&a).expect("release"),
        ReleaseOutcome::Released(row) if row.lease_expiry.is_none()
    ));
    assert!(matches!(
        repo.release(&a).expect("release again"),
        ReleaseOutcome::NotLocked(_)
    ));
    assert_eq!(
        repo.release(&ResourceId::new()).expect("release missing"),
        ReleaseOutcome::Missing
    );

    let stored = repo.get_resource(&b).expect("get").expect("b exists");
    assert_eq!(stored.created_at, t0 + Duration::seconds(1));
    assert_eq!(stored.login, "b@example.com");
}

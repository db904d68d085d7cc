//! End-to-end scenarios against the engine facade.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Barrier;
use std::thread;

use quarry_placement::*;
use quarry_state::{
    Allocation, EntityRef, GroupPolicy, InventoryRecord, ResourceProvider, ServerGroup, StateError,
    StateStore,
};

fn test_engine() -> Engine {
    Engine::new(StateStore::open_in_memory().unwrap(), EngineSettings::default()).unwrap()
}

/// Create a root provider with `vcpus` VCPU. Returns its generation.
fn add_host(engine: &Engine, id: &str, vcpus: u64) -> u64 {
    engine
        .create_provider(NewProvider {
            id: Some(id.to_string()),
            name: id.to_string(),
            parent_id: None,
        })
        .unwrap();
    engine
        .set_inventory(
            id,
            0,
            BTreeMap::from([("VCPU".to_string(), InventoryRecord::new(vcpus))]),
        )
        .unwrap()
}

fn vcpu_write(provider: &str, used: u64) -> AllocationWrite {
    AllocationWrite {
        allocations: vec![AllocationItem::new(provider, "VCPU", used)],
        ..AllocationWrite::default()
    }
}

fn vcpu_request(amount: u64) -> AllocationRequest {
    AllocationRequest::new().group(RequestGroup::new("").resource("VCPU", amount))
}

fn roots(candidates: &[Candidate]) -> Vec<&str> {
    candidates.iter().map(|c| c.root_id.as_str()).collect()
}

/// Global generation, provider record and allocations, for before/after
/// comparisons.
fn provider_state(engine: &Engine, id: &str) -> (u64, ResourceProvider, Vec<Allocation>) {
    engine
        .store()
        .read(|graph| -> Result<_, StateError> {
            Ok((
                graph.global_generation()?,
                graph.require_provider(id)?,
                graph.provider_allocations(id)?,
            ))
        })
        .unwrap()
}

// ── Scenario A: capacity ───────────────────────────────────────────

#[test]
fn over_capacity_write_fails_and_exact_fit_succeeds() {
    let engine = test_engine();
    add_host(&engine, "P", 8);
    engine
        .replace_allocations("C1", None, vcpu_write("P", 5))
        .unwrap();

    let err = engine
        .replace_allocations("C2", None, vcpu_write("P", 4))
        .unwrap_err();
    match err {
        EngineError::CapacityExceeded {
            provider_id,
            resource_class,
            requested,
            capacity,
            shortfall,
            ..
        } => {
            assert_eq!(provider_id, "P");
            assert_eq!(resource_class, "VCPU");
            assert_eq!(requested, 4);
            assert_eq!(capacity, 8);
            assert_eq!(shortfall, 1);
        }
        other => panic!("expected CapacityExceeded, got {other:?}"),
    }

    engine
        .replace_allocations("C2", None, vcpu_write("P", 3))
        .unwrap();
    let summary = engine
        .compute_usage(&UsageScope::Provider {
            provider_id: "P".into(),
        })
        .unwrap();
    assert_eq!(summary.usages["VCPU"], 8);
    assert_eq!(summary.consumer_count, 2);
}

// ── Scenario B: missing trait ──────────────────────────────────────

#[test]
fn missing_required_trait_yields_empty_candidates() {
    let engine = test_engine();
    engine.create_trait("HW_CPU_X86_AVX2").unwrap();
    add_host(&engine, "R", 8);

    let request = AllocationRequest::new().group(
        RequestGroup::new("")
            .resource("VCPU", 1)
            .required("HW_CPU_X86_AVX2"),
    );
    let candidates = engine.get_allocation_candidates(&request, 10).unwrap();
    assert!(candidates.is_empty());

    engine
        .set_traits("R", 1, BTreeSet::from(["HW_CPU_X86_AVX2".to_string()]))
        .unwrap();
    let candidates = engine.get_allocation_candidates(&request, 10).unwrap();
    assert_eq!(roots(&candidates), vec!["R"]);
}

// ── Scenario C: stale session ──────────────────────────────────────

#[test]
fn stale_session_commit_conflicts_without_side_effects() {
    let engine = test_engine();
    let mut generation = add_host(&engine, "P", 8);
    while generation < 10 {
        generation = engine
            .set_traits("P", generation, BTreeSet::new())
            .unwrap();
    }

    let session = engine.create_simulation_session(None).unwrap();
    engine
        .record_delta(
            &session.session_id,
            Delta::Allocate {
                consumer_id: "vm-1".into(),
                provider_id: "P".into(),
                resource_class: "VCPU".into(),
                amount: 2,
                project_id: None,
                user_id: None,
            },
        )
        .unwrap();

    // Someone else writes to P.
    assert_eq!(engine.set_traits("P", 10, BTreeSet::new()).unwrap(), 11);

    let before = provider_state(&engine, "P");

    let err = engine.commit_session(&session.session_id).unwrap_err();
    match &err {
        EngineError::Conflict { stale } => {
            assert_eq!(stale.len(), 1);
            assert_eq!(stale[0].entity, EntityRef::provider("P"));
            assert_eq!(stale[0].expected, Some(10));
            assert_eq!(stale[0].actual, Some(11));
        }
        other => panic!("expected Conflict, got {other:?}"),
    }

    assert_eq!(provider_state(&engine, "P"), before);
    assert!(engine.get_allocations("vm-1").unwrap().allocations.is_empty());
    assert_eq!(
        engine.session_info(&session.session_id).unwrap().state,
        SessionState::Active
    );
}

// ── Scenario D: anti-affinity ──────────────────────────────────────

#[test]
fn anti_affinity_excludes_occupied_host() {
    let engine = test_engine();
    add_host(&engine, "H1", 16);
    add_host(&engine, "H2", 16);
    engine
        .create_server_group(ServerGroup {
            id: "G".into(),
            policy: GroupPolicy::AntiAffinity,
            max_server_per_host: None,
        })
        .unwrap();
    for member in ["m1", "m2"] {
        engine
            .replace_allocations(member, None, vcpu_write("H1", 1))
            .unwrap();
        engine.add_group_member("G", member).unwrap();
    }

    let request = vcpu_request(1).server_group("G", "m3");
    let candidates = engine.get_allocation_candidates(&request, 10).unwrap();
    assert_eq!(roots(&candidates), vec!["H2"]);

    // Without the group both hosts qualify.
    let candidates = engine.get_allocation_candidates(&vcpu_request(1), 10).unwrap();
    assert_eq!(roots(&candidates), vec!["H1", "H2"]);
}

// ── Sessions ───────────────────────────────────────────────────────

#[test]
fn sessions_never_see_each_other() {
    let engine = test_engine();
    add_host(&engine, "cn1", 4);
    let a = engine.create_simulation_session(None).unwrap().session_id;
    let b = engine.create_simulation_session(None).unwrap().session_id;
    let before = provider_state(&engine, "cn1");
    engine
        .record_delta(
            &a,
            Delta::Allocate {
                consumer_id: "vm-a".into(),
                provider_id: "cn1".into(),
                resource_class: "VCPU".into(),
                amount: 4,
                project_id: None,
                user_id: None,
            },
        )
        .unwrap();

    assert!(engine
        .session_candidates(&a, &vcpu_request(1), 10)
        .unwrap()
        .is_empty());
    assert_eq!(
        roots(&engine.session_candidates(&b, &vcpu_request(1), 10).unwrap()),
        vec!["cn1"]
    );

    let view = engine
        .query_virtual_state(&b, &StateScope::Provider("cn1".into()))
        .unwrap();
    assert_eq!(view.usages[0].resources["VCPU"].effective, 0);

    // Committed state is untouched until a session commits.
    assert_eq!(provider_state(&engine, "cn1"), before);
    assert_eq!(
        roots(&engine.get_allocation_candidates(&vcpu_request(4), 10).unwrap()),
        vec!["cn1"]
    );
    let usage = engine
        .compute_usage(&UsageScope::Provider {
            provider_id: "cn1".into(),
        })
        .unwrap();
    assert_eq!(usage.usages.get("VCPU").copied().unwrap_or(0), 0);
    assert_eq!(usage.consumer_count, 0);
    assert_eq!(engine.get_allocations("vm-a").unwrap().generation, None);
}

#[test]
fn committed_session_is_visible_to_everyone() {
    let engine = test_engine();
    add_host(&engine, "cn1", 8);
    let session = engine.create_simulation_session(None).unwrap().session_id;
    engine
        .record_delta(
            &session,
            Delta::Allocate {
                consumer_id: "vm-1".into(),
                provider_id: "cn1".into(),
                resource_class: "VCPU".into(),
                amount: 6,
                project_id: Some("proj".into()),
                user_id: Some("alice".into()),
            },
        )
        .unwrap();
    engine.commit_session(&session).unwrap();

    let candidates = engine.get_allocation_candidates(&vcpu_request(4), 10).unwrap();
    assert!(candidates.is_empty());
    let summary = engine
        .compute_usage(&UsageScope::Project {
            project_id: "proj".into(),
            user_id: None,
        })
        .unwrap();
    assert_eq!(summary.usages["VCPU"], 6);
}

// ── Idempotence ────────────────────────────────────────────────────

#[test]
fn re_replacing_same_allocations_keeps_usage() {
    let engine = test_engine();
    add_host(&engine, "cn1", 8);
    let first = engine
        .replace_allocations("vm-1", None, vcpu_write("cn1", 3))
        .unwrap();
    let provider_generation = engine.get_provider("cn1").unwrap().generation;

    engine
        .replace_allocations("vm-1", first, vcpu_write("cn1", 3))
        .unwrap();
    let summary = engine
        .compute_usage(&UsageScope::Provider {
            provider_id: "cn1".into(),
        })
        .unwrap();
    assert_eq!(summary.usages["VCPU"], 3);
    assert_eq!(summary.provider_generation, Some(provider_generation));
}

// ── Query strings ──────────────────────────────────────────────────

#[test]
fn query_string_drives_candidate_search() {
    let engine = test_engine();
    add_host(&engine, "cn1", 2);
    add_host(&engine, "cn2", 8);
    let (request, limit) = AllocationRequest::parse_query("resources=VCPU:4&limit=5").unwrap();
    assert_eq!(limit, Some(5));
    let candidates = engine
        .get_allocation_candidates(&request, limit.unwrap_or(10))
        .unwrap();
    assert_eq!(roots(&candidates), vec!["cn2"]);
}

// ── Racing writers ────────────────────────────────────────────────

/// Start `writers` threads together, each placing 5 VCPU on an 8 VCPU host
/// under its own consumer. Returns every thread's result.
fn race(expect_provider: bool, writers: usize) -> (Engine, u64, Vec<EngineResult<Option<u64>>>) {
    let engine = test_engine();
    let generation = add_host(&engine, "P", 8);
    let barrier = Barrier::new(writers);
    let results: Vec<EngineResult<Option<u64>>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..writers)
            .map(|i| {
                let engine = engine.clone();
                let barrier = &barrier;
                scope.spawn(move || {
                    let mut write = vcpu_write("P", 5);
                    if expect_provider {
                        write.provider_expectations.insert("P".to_string(), generation);
                    }
                    barrier.wait();
                    engine.replace_allocations(&format!("vm-{i}"), None, write)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    });
    (engine, generation, results)
}

fn assert_single_winner(engine: &Engine, generation: u64, results: &[EngineResult<Option<u64>>]) {
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert!(
            matches!(err.kind(), ErrorKind::Conflict | ErrorKind::CapacityExceeded),
            "unexpected loser error: {err}"
        );
    }
    let usage = engine
        .compute_usage(&UsageScope::Provider {
            provider_id: "P".into(),
        })
        .unwrap();
    assert_eq!(usage.usages["VCPU"], 5);
    assert_eq!(usage.consumer_count, 1);
    assert_eq!(engine.get_provider("P").unwrap().generation, generation + 1);
}

#[test]
fn racing_writers_on_a_read_generation_yield_one_winner() {
    let (engine, generation, results) = race(true, 8);
    assert_single_winner(&engine, generation, &results);
    // Every loser read the provider before the winner bumped it.
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }
}

#[test]
fn racing_writers_without_expectations_never_overcommit() {
    let (engine, generation, results) = race(false, 8);
    assert_single_winner(&engine, generation, &results);
}

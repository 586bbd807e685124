use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

use lingualab_core::config::CapacityConfig;
use lingualab_core::services::capacity::{AdmissionReason, CapacityGate};
use lingualab_core::services::presence::{Beacon, HeartbeatTask, PresenceRegistry};
use lingualab_core::{LanguageCode, SessionStatus};

const BUSY: Duration = Duration::from_secs(5);
const TIMEOUT: Duration = Duration::from_secs(60);

fn registry() -> (TempDir, PresenceRegistry) {
    let dir = tempfile::tempdir().unwrap();
    let reg = PresenceRegistry::open(&dir.path().join("registry/presence.db"), BUSY).unwrap();
    (dir, reg)
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 5, 2, 10, 0, 0).unwrap()
}

fn at(secs: i64) -> DateTime<Utc> {
    t0() + ChronoDuration::seconds(secs)
}

fn cap(max: usize) -> CapacityConfig {
    CapacityConfig {
        enabled: true,
        max_concurrent: max,
        avg_learning_minutes: 30,
    }
}

fn beat(reg: &PresenceRegistry, id: &str, page: &str, now: DateTime<Utc>) -> bool {
    reg.heartbeat(&Beacon::new(id, LanguageCode::En, page), now).unwrap()
}

// ---- Tests ----

#[test]
fn third_session_waits_until_a_slot_goes_stale() {
    let (_d, reg) = registry();
    for id in ["a", "b", "c"] {
        reg.mark_started(id, LanguageCode::En, t0()).unwrap();
    }
    let gate = CapacityGate::new(&reg, &cap(2), TIMEOUT);

    let a = gate.try_enter_at("a", t0());
    assert!(a.admitted);
    assert_eq!(a.in_phase, 1);
    let b = gate.try_enter_at("b", t0());
    assert!(b.admitted);
    assert_eq!(b.in_phase, 2);

    let c = gate.try_enter_at("c", t0());
    assert!(!c.admitted);
    assert_eq!(c.reason, AdmissionReason::AtCapacity);
    assert_eq!(c.in_phase, 2);

    // Re-entry does not take a second slot.
    let again = gate.try_enter_at("a", t0());
    assert!(again.admitted);
    assert_eq!(again.reason, AdmissionReason::AlreadyInPhase);
    assert_eq!(again.in_phase, 2);

    let full = gate.status_at(t0());
    assert_eq!(full.slots_available, 0);
    assert_eq!(full.estimated_wait_minutes, 15);

    // "a" goes silent; "b" and "c" keep beating.
    assert!(beat(&reg, "b", "learning", at(80)));
    assert!(beat(&reg, "c", "waiting", at(80)));
    let c = gate.try_enter_at("c", at(90));
    assert!(c.admitted, "{:?}", c);
    assert_eq!(c.reason, AdmissionReason::Admitted);
    assert_eq!(c.in_phase, 2);
}

#[test]
fn completed_and_departed_sessions_free_their_slot() {
    let (_d, reg) = registry();
    for id in ["a", "b"] {
        reg.mark_started(id, LanguageCode::Tr, t0()).unwrap();
    }
    let gate = CapacityGate::new(&reg, &cap(1), TIMEOUT);
    assert!(gate.try_enter_at("a", t0()).admitted);
    assert!(!gate.try_enter_at("b", at(1)).admitted);

    assert!(reg.mark_completed("a", at(2)).unwrap());
    assert!(!reg.mark_completed("a", at(3)).unwrap());
    let rec = reg.get("a").unwrap().unwrap();
    assert_eq!(rec.status, SessionStatus::Completed);
    assert!(rec.is_in_phase, "flag is kept as history");
    assert_eq!(gate.status_at(at(4)).in_phase, 0);

    assert!(gate.try_enter_at("b", at(5)).admitted);
    assert!(gate.leave_limited_phase("b"));
    assert_eq!(gate.status_at(at(6)).in_phase, 0);
}

#[test]
fn swept_sessions_stay_abandoned() {
    let (_d, reg) = registry();
    reg.mark_started("s", LanguageCode::Hi, t0()).unwrap();
    assert!(beat(&reg, "s", "learning", at(10)));

    // Exactly at the boundary the row is no longer live, but not stale enough to sweep.
    assert!(!reg.get("s").unwrap().unwrap().is_live(at(70), TIMEOUT));
    assert!(reg.get("s").unwrap().unwrap().is_live(at(69), TIMEOUT));
    assert_eq!(reg.sweep(TIMEOUT, at(70)).unwrap(), 0);
    assert_eq!(reg.sweep(TIMEOUT, at(71)).unwrap(), 1);

    assert!(!beat(&reg, "s", "ueq", at(72)));
    reg.mark_started("s", LanguageCode::Hi, at(73)).unwrap();
    let rec = reg.get("s").unwrap().unwrap();
    assert_eq!(rec.status, SessionStatus::Abandoned);
    assert_eq!(rec.current_page, "learning");
    assert!(!rec.is_live(at(73), TIMEOUT));
    assert!(!reg.mark_completed("s", at(74)).unwrap());

    let gate = CapacityGate::new(&reg, &cap(2), TIMEOUT);
    let a = gate.try_enter_at("s", at(75));
    assert!(!a.admitted);
    assert_eq!(a.reason, AdmissionReason::SessionClosed);
}

#[test]
fn counts_only_see_live_active_rows() {
    let (_d, reg) = registry();
    reg.mark_started("live", LanguageCode::Nl, t0()).unwrap();
    reg.mark_started("stale", LanguageCode::Nl, t0()).unwrap();
    reg.mark_started("done", LanguageCode::Nl, t0()).unwrap();
    assert!(beat(&reg, "live", "learning", at(50)));
    reg.mark_completed("done", at(50)).unwrap();

    assert_eq!(reg.count_active(at(100), TIMEOUT).unwrap(), 1);
    assert_eq!(reg.list().unwrap().len(), 3);
}

#[test]
fn heartbeats_from_many_threads_all_land() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("presence.db");
    // Schema first, then every worker holds its own connection.
    PresenceRegistry::open(&path, BUSY).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let path = path.clone();
            std::thread::spawn(move || {
                let reg = PresenceRegistry::open(&path, BUSY).unwrap();
                let id = format!("worker-{i}");
                reg.mark_started(&id, LanguageCode::De, Utc::now()).unwrap();
                // Odd count of beats, so the last page sent is "test".
                for n in 0..26 {
                    let page = if n % 2 == 0 { "learning" } else { "test" };
                    assert!(reg
                        .heartbeat(&Beacon::new(&id, LanguageCode::De, page), Utc::now())
                        .unwrap());
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let reg = PresenceRegistry::open(&path, BUSY).unwrap();
    let rows = reg.list().unwrap();
    assert_eq!(rows.len(), 4);
    assert!(rows.iter().all(|r| r.status == SessionStatus::Active));
    assert!(rows.iter().all(|r| r.current_page == "test"));
}

#[test]
fn background_heartbeat_reports_page_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("presence.db");
    let handle = HeartbeatTask::spawn(
        Path::new(&path),
        BUSY,
        Beacon::new("bg", LanguageCode::Sq, "login"),
        Duration::from_secs(30),
    );
    handle.set_page("learning");
    assert_eq!(handle.stop(), 2);

    let reg = PresenceRegistry::open(&path, BUSY).unwrap();
    let rec = reg.get("bg").unwrap().unwrap();
    assert_eq!(rec.current_page, "learning");
    assert_eq!(rec.language_code, "sq");
}

#[test]
fn serialized_admissions_admit_exactly_the_cap() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("presence.db");
    let setup = PresenceRegistry::open(&path, BUSY).unwrap();
    let entrants = 8;
    for i in 0..entrants {
        setup.mark_started(&format!("s{i}"), LanguageCode::En, Utc::now()).unwrap();
    }

    // Separate connections, one admission at a time.
    let turn = std::sync::Arc::new(std::sync::Mutex::new(()));
    let handles: Vec<_> = (0..entrants)
        .map(|i| {
            let path = path.clone();
            let turn = turn.clone();
            std::thread::spawn(move || {
                let reg = PresenceRegistry::open(&path, BUSY).unwrap();
                let gate = CapacityGate::new(&reg, &cap(3), TIMEOUT);
                let _guard = turn.lock().unwrap();
                gate.try_enter_limited_phase(&format!("s{i}"))
            })
        })
        .collect();
    let decisions: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let admitted = decisions.iter().filter(|d| d.admitted).count();
    assert_eq!(admitted, 3);
    for d in decisions.iter().filter(|d| !d.admitted) {
        assert_eq!(d.reason, AdmissionReason::AtCapacity);
        assert_eq!(d.in_phase, 3);
    }
    let gate = CapacityGate::new(&setup, &cap(3), TIMEOUT);
    assert_eq!(gate.status().in_phase, 3);
}

#[test]
fn racing_admissions_never_compound_past_the_cap() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("presence.db");
    let setup = PresenceRegistry::open(&path, BUSY).unwrap();
    let racers = 6;
    let stragglers = 4;
    for i in 0..racers {
        setup.mark_started(&format!("r{i}"), LanguageCode::En, Utc::now()).unwrap();
    }
    for i in 0..stragglers {
        setup.mark_started(&format!("late{i}"), LanguageCode::En, Utc::now()).unwrap();
    }

    let barrier = std::sync::Arc::new(std::sync::Barrier::new(racers));
    let handles: Vec<_> = (0..racers)
        .map(|i| {
            let path = path.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                let reg = PresenceRegistry::open(&path, BUSY).unwrap();
                let gate = CapacityGate::new(&reg, &cap(2), TIMEOUT);
                barrier.wait();
                gate.try_enter_limited_phase(&format!("r{i}"))
            })
        })
        .collect();
    let decisions: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let admitted = decisions.iter().filter(|d| d.admitted).count();

    assert!(admitted >= 2, "admitted {admitted}");
    // Every admission saw room at the moment it counted.
    for d in decisions.iter().filter(|d| d.admitted) {
        assert_eq!(d.reason, AdmissionReason::Admitted);
        assert!(d.in_phase <= 2, "{d:?}");
    }

    // Once the race settles, nobody else gets in and the count stays put.
    let gate = CapacityGate::new(&setup, &cap(2), TIMEOUT);
    for i in 0..stragglers {
        let late = gate.try_enter_limited_phase(&format!("late{i}"));
        assert!(!late.admitted);
        assert_eq!(late.reason, AdmissionReason::AtCapacity);
        assert_eq!(late.in_phase, admitted);
    }
    assert_eq!(gate.status().in_phase, admitted);
}

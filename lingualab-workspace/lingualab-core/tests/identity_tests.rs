use chrono::{TimeZone, Utc};
use std::collections::BTreeSet;
use tempfile::TempDir;

use lingualab_core::commands::ensure_layout;
use lingualab_core::config::LabConfig;
use lingualab_core::services::artifacts::SessionLayout;
use lingualab_core::services::{Allocator, Session};
use lingualab_core::session::{Pseudonym, SessionHeader};
use lingualab_core::{Condition, LabContext, LabError, LanguageCode};

fn workspace() -> (TempDir, LabContext) {
    let dir = tempfile::tempdir().unwrap();
    ensure_layout(dir.path()).unwrap();
    let cfg = LabConfig::load(dir.path()).unwrap();
    let ctx = LabContext::from_config(dir.path(), cfg);
    (dir, ctx)
}

#[test]
fn allocation_claims_namespace_and_writes_header_first() {
    let (_d, ctx) = workspace();
    let now = Utc.with_ymd_and_hms(2025, 5, 2, 9, 15, 0).unwrap();
    let session = Allocator::new(&ctx)
        .allocate_with(LanguageCode::De, Condition::Personalized, &mut rand::thread_rng(), now)
        .unwrap();

    let id = session.id().to_string();
    assert!(id.starts_with("20250502_091500_"));
    let p = Pseudonym::parse(&id).unwrap();
    assert_eq!(session.pseudonym(), &p);

    let dir = session.layout().dir();
    assert!(dir.starts_with(ctx.sessions_dir().join("german_cohort")));
    for sub in ["profile", "knowledge_test", "learning_logs", "ueq", "analytics", "meta"] {
        assert!(dir.join(sub).is_dir(), "{sub} missing");
    }

    let text = std::fs::read_to_string(session.layout().header_path()).unwrap();
    let header: SessionHeader = serde_json::from_str(&text).unwrap();
    assert_eq!(header.session_id, id);
    assert_eq!(header.pseudonym, p.fake_name());
    assert_eq!(header.language_code, LanguageCode::De);
    assert_eq!(header.condition, Condition::Personalized);
    assert_eq!(header.created_at, now);
}

#[test]
fn same_second_allocations_never_share_a_namespace() {
    let (_d, ctx) = workspace();
    let now = Utc.with_ymd_and_hms(2025, 5, 2, 9, 15, 0).unwrap();

    let ids: Vec<String> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ctx = &ctx;
                s.spawn(move || {
                    let lang = LanguageCode::ALL[i % LanguageCode::ALL.len()];
                    (0..5)
                        .map(|_| {
                            Allocator::new(ctx)
                                .allocate_with(lang, Condition::Generic, &mut rand::thread_rng(), now)
                                .unwrap()
                                .id()
                                .to_string()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });

    let unique: BTreeSet<&String> = ids.iter().collect();
    assert_eq!(ids.len(), 40);
    assert_eq!(unique.len(), 40);
    assert_eq!(SessionLayout::discover(ctx.sessions_dir()).len(), 40);
}

#[test]
fn exhausted_pools_fail_cleanly() {
    let (_d, ctx) = workspace();
    let now = Utc.with_ymd_and_hms(2025, 5, 2, 9, 15, 0).unwrap();
    let first = ["Alex"];
    let last = ["Chen"];
    let alloc = Allocator::new(&ctx)
        .with_name_pools(&first, &last)
        .with_max_attempts(3);

    alloc
        .allocate_with(LanguageCode::En, Condition::Generic, &mut rand::thread_rng(), now)
        .unwrap();
    // Same second, same only-possible name, different cohort: still a collision.
    let err = alloc
        .allocate_with(LanguageCode::Nl, Condition::Generic, &mut rand::thread_rng(), now)
        .unwrap_err();
    assert!(matches!(err, LabError::NamespaceExhausted(3)));
}

#[test]
fn reopen_reads_the_header_and_requires_it() {
    let (_d, ctx) = workspace();
    let session = Allocator::new(&ctx)
        .allocate(LanguageCode::Sq, Condition::Generic)
        .unwrap();
    let again = Session::open(&ctx, session.id()).unwrap();
    assert_eq!(again.header(), session.header());

    std::fs::remove_file(session.layout().header_path()).unwrap();
    let err = Session::open(&ctx, session.id()).unwrap_err();
    assert!(matches!(err, LabError::MissingHeader { .. }));

    assert!(matches!(
        Session::open(&ctx, "20990101_000000_Nobody_Here"),
        Err(LabError::SessionNotFound(_))
    ));
}

#[test]
fn header_cannot_be_overwritten_through_meta_writes() {
    let (_d, ctx) = workspace();
    let session = Allocator::new(&ctx)
        .allocate(LanguageCode::Hi, Condition::Personalized)
        .unwrap();
    let before = std::fs::read(session.layout().header_path()).unwrap();

    assert!(session
        .write_meta_json("session.json", &serde_json::json!({"hijack": true}))
        .is_err());
    assert!(session
        .write_meta_json("../escape.json", &serde_json::json!({}))
        .is_err());

    let mut fields = serde_json::Map::new();
    fields.insert("model".into(), serde_json::json!("tutor-v2"));
    session.update_experiment_meta(&fields).unwrap();
    assert_eq!(session.experiment_meta().unwrap()["model"], "tutor-v2");

    assert_eq!(std::fs::read(session.layout().header_path()).unwrap(), before);
}

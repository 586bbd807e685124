use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

use lingualab_core::commands::ensure_layout;
use lingualab_core::config::LabConfig;
use lingualab_core::services::learning_log::LearningLogArtifact;
use lingualab_core::services::{
    Allocator, ArtifactKind, Interaction, InteractionKind, LearningLogger, MirrorRow, MirrorStore, ProfileIntake,
    Session,
};
use lingualab_core::{Condition, LabContext, LanguageCode};

// ---- Test stubs ----

struct OfflineMirror;

impl MirrorStore for OfflineMirror {
    fn upsert(&self, _row: &MirrorRow) -> anyhow::Result<()> {
        anyhow::bail!("mirror offline")
    }

    fn name(&self) -> &str {
        "offline"
    }
}

fn workspace() -> (TempDir, LabContext) {
    let dir = tempfile::tempdir().unwrap();
    ensure_layout(dir.path()).unwrap();
    let cfg = LabConfig::load(dir.path()).unwrap();
    let ctx = LabContext::from_config(dir.path(), cfg);
    (dir, ctx)
}

fn session(ctx: &LabContext) -> Session {
    Allocator::new(ctx)
        .allocate(LanguageCode::En, Condition::Personalized)
        .unwrap()
}

fn read_log(logger: &LearningLogger) -> LearningLogArtifact {
    serde_json::from_slice(&std::fs::read(logger.path()).unwrap()).unwrap()
}

// ---- Tests ----

#[test]
fn buffered_events_flush_on_threshold_and_on_demand() {
    let (_d, ctx) = workspace();
    let s = session(&ctx);
    let mut log = LearningLogger::open(&s, 3);

    for n in 1..=3 {
        log.record(
            Interaction::new(InteractionKind::SlideExplanation)
                .slide(n)
                .response("explanation"),
        );
    }
    assert_eq!(log.pending(), 0);
    assert_eq!(read_log(&log).events.len(), 3);

    log.record(Interaction::labeled("manual_chat").input("why?"));
    log.record(Interaction::new(InteractionKind::PrimeContext));
    assert_eq!(log.pending(), 2);
    assert!(log.flush().is_some());

    let bytes = std::fs::read(log.path()).unwrap();
    assert!(log.flush().is_none(), "nothing new to write");
    assert_eq!(std::fs::read(log.path()).unwrap(), bytes);

    let artifact = read_log(&log);
    let seqs: Vec<u64> = artifact.events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    assert_eq!(artifact.session_id, s.id());

    let c = log.counts();
    assert_eq!(c.total_events, 5);
    assert_eq!(c.user_interactions, 4);
    assert_eq!(c.slide_explanations, 3);
    assert_eq!(c.manual_chat, 1);
    assert_eq!(c.prime_context, 1);

    let first = &artifact.events[0];
    assert_eq!(first.metadata.slide_number, Some(1));
    assert_eq!(first.metadata.language_code, Some(LanguageCode::En));
    assert_eq!(first.metadata.extra["condition"], json!("personalized"));
}

#[test]
fn reopening_continues_the_sequence() {
    let (_d, ctx) = workspace();
    let s = session(&ctx);
    {
        let mut log = LearningLogger::open(&s, 100);
        log.record(Interaction::labeled("chat").input("one"));
        log.record(Interaction::labeled("chat").input("two"));
        // dropped with a non-empty buffer
    }

    let mut log = LearningLogger::open(&s, 100);
    assert_eq!(log.counts().total_events, 2);
    assert_eq!(log.record(Interaction::labeled("chat").input("three")), 3);
    log.flush();
    let inputs: Vec<String> = read_log(&log).events.into_iter().map(|e| e.user_input).collect();
    assert_eq!(inputs, vec!["one", "two", "three"]);
}

#[test]
fn legacy_labels_are_folded_into_current_kinds() {
    let (_d, ctx) = workspace();
    let s = session(&ctx);
    let path = s.layout().artifact_path(ArtifactKind::LearningLogs);
    let legacy = json!({
        "session_id": s.id(),
        "events": [
            {"seq": 1, "timestamp": "2025-05-02T10:00:00Z", "kind": "personalized_explanation"},
            {"seq": 2, "timestamp": "2025-05-02T10:01:00Z", "kind": "chat", "user_input": "hi"},
            {"seq": 3, "timestamp": "2025-05-02T10:02:00Z", "kind": "something_else"}
        ]
    });
    std::fs::write(&path, serde_json::to_vec(&legacy).unwrap()).unwrap();

    let log = LearningLogger::open(&s, 10);
    let c = log.counts();
    assert_eq!(c.slide_explanations, 1);
    assert_eq!(c.manual_chat, 1);
    assert_eq!(c.other, 1);
    assert_eq!(c.user_interactions, 3);
}

#[test]
fn real_name_never_reaches_the_log() {
    let (_d, ctx) = workspace();
    let mut s = session(&ctx);
    let mut answers = serde_json::Map::new();
    answers.insert("age".into(), json!(27));
    s.save_profile(&ProfileIntake {
        real_name: Some("Marguerite Okonkwo".into()),
        answers,
    })
    .unwrap();

    let mut log = LearningLogger::open(&s, 1);
    log.record(
        Interaction::labeled("manual_chat")
            .input("Hi, I'm Marguerite Okonkwo")
            .response("Welcome Marguerite!")
            .extra("note", json!({ "greeting": "okonkwo family" })),
    );

    let text = std::fs::read_to_string(log.path()).unwrap();
    assert!(!text.contains("Marguerite"));
    assert!(!text.to_lowercase().contains("okonkwo"));
    assert!(text.contains(&s.pseudonym().fake_name()));
}

#[test]
fn name_learned_after_open_is_scrubbed_from_earlier_events_too() {
    let (_d, ctx) = workspace();
    let s = session(&ctx);
    let fake = s.pseudonym().fake_name();
    let mut log = LearningLogger::open(&s, 1);
    // Already on disk before the name is known.
    log.record(Interaction::labeled("chat").input("before: Ingrid"));
    log.redact_name("Ingrid Halvorsen");
    log.record(Interaction::labeled("chat").input("after: Ingrid Halvorsen"));

    let events = read_log(&log).events;
    assert_eq!(events[0].user_input, format!("before: {fake}"));
    assert_eq!(events[1].user_input, format!("after: {fake}"));
}

#[test]
fn reopened_session_still_scrubs_the_real_name() {
    let (_d, ctx) = workspace();
    let mut s = session(&ctx);
    s.save_profile(&ProfileIntake {
        real_name: Some("Rosalind Achterberg".into()),
        answers: serde_json::Map::new(),
    })
    .unwrap();
    let id = s.id().to_string();
    drop(s);

    let reopened = Session::open(&ctx, &id).unwrap();
    assert_eq!(reopened.real_name(), Some("Rosalind Achterberg"));

    let mut log = LearningLogger::open(&reopened, 1);
    log.record(Interaction::labeled("chat").input("I am Rosalind Achterberg"));
    let text = std::fs::read_to_string(log.path()).unwrap().to_lowercase();
    assert!(!text.contains("rosalind"));
    assert!(!text.contains("achterberg"));
}

#[test]
fn two_loggers_on_one_session_lose_nothing() {
    let (_d, ctx) = workspace();
    let s = session(&ctx);
    let mut a = LearningLogger::open(&s, 100);
    a.record(Interaction::labeled("chat").input("a1"));
    a.record(Interaction::labeled("chat").input("a2"));

    let mut b = LearningLogger::open(&s, 100);
    b.record(Interaction::labeled("chat").input("b1"));
    assert!(b.flush().is_some());
    assert!(a.flush().is_some());

    let events = read_log(&a).events;
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    let inputs: Vec<&str> = events.iter().map(|e| e.user_input.as_str()).collect();
    assert_eq!(inputs, vec!["b1", "a1", "a2"]);
    assert_eq!(a.counts().total_events, 3);

    // The renumbered writer keeps going past the shared maximum.
    assert_eq!(a.record(Interaction::labeled("chat").input("a3")), 4);
}

#[test]
fn unreadable_log_is_set_aside_not_lost() {
    let (_d, ctx) = workspace();
    let s = session(&ctx);
    let path = s.layout().artifact_path(ArtifactKind::LearningLogs);
    std::fs::write(&path, b"{ half a document").unwrap();

    let mut log = LearningLogger::open(&s, 10);
    log.record(Interaction::labeled("chat").input("after"));
    assert!(log.flush().is_some());
    assert_eq!(read_log(&log).events.len(), 1);

    let aside: Vec<_> = std::fs::read_dir(path.parent().unwrap())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains("corrupt"))
        .collect();
    assert_eq!(aside.len(), 1);
    assert_eq!(std::fs::read(aside[0].path()).unwrap(), b"{ half a document");
}

#[test]
fn mirror_outage_does_not_block_local_writes() {
    let (_d, ctx) = workspace();
    let ctx = ctx.with_mirror(Arc::new(OfflineMirror));
    let s = session(&ctx);
    let mut log = LearningLogger::open(&s, 10);
    log.record(Interaction::labeled("chat").input("still works"));
    assert!(log.flush().is_some());
    assert_eq!(log.failed_flushes(), 0);
    assert_eq!(read_log(&log).events.len(), 1);
}

mod helpers;

use helpers::{
    harness, harness_with, harness_with_config, test_config, Extras, ScriptedModel,
    StuckTranscriber, SYSTEM_PROMPT,
};
use std::sync::Arc;
use std::time::Duration;

use femtobot::error::{ModelError, ValidationError};
use femtobot::lights::LightAction;
use femtobot::schedule::{ScheduleSpec, Scheduler};
use femtobot::session::Role;

#[tokio::test]
async fn memory_command_is_stripped_and_stored() {
    let h = harness(ScriptedModel::replying(&["Hola! :::memory El usuario ama las manzanas:::"]));

    let reply = h.assistant.handle_message("42", "me encantan las manzanas").await;

    assert_eq!(reply.reply, "Hola!");
    assert_eq!(reply.notices, vec!["Saved to memory: El usuario ama las manzanas"]);

    let facts = h.memory.list().await.unwrap();
    assert_eq!(facts.len(), 1);
    assert_eq!(facts[0].content, "El usuario ama las manzanas");

    // history keeps the display text, never the raw token
    let history = h.assistant.sessions().history("42").await;
    let last = history.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert_eq!(last.content, "Hola!");
    assert!(history.iter().all(|m| !m.content.contains(":::")));
}

#[tokio::test]
async fn cron_delete_runs_before_cron_in_the_same_turn() {
    let h = harness(ScriptedModel::replying(&[
        "Listo. :::cron_delete \"Regar plantas\"::: :::cron recurrente 0 18 * * Regar plantas tarde:::",
    ]));
    let existing = ScheduleSpec {
        minute: "0".into(),
        hour: "9".into(),
        day: "*".into(),
        month: "*".into(),
        recurring: true,
        label: "Regar plantas".into(),
    };
    h.scheduler
        .create(&existing, "notify-send \"Regar plantas\"")
        .await
        .unwrap();

    let reply = h.assistant.handle_message("7", "cambia el recordatorio a la tarde").await;

    assert_eq!(reply.reply, "Listo.");
    assert_eq!(
        h.scheduler.operations(),
        vec![
            "create:Regar plantas",
            "delete:Regar plantas",
            "create:Regar plantas tarde"
        ]
    );
    let commands = h.scheduler.commands();
    assert_eq!(commands.len(), 1, "the new reminder survives the delete");
    assert!(commands[0].contains("Regar plantas tarde"));
    assert_eq!(reply.notices.len(), 2);
    assert_eq!(reply.notices[0], "Reminder removed: Regar plantas");
    assert!(reply.notices[1].starts_with("Reminder scheduled (recurring, 0 18 * * *)"));
}

#[tokio::test]
async fn unknown_command_leaves_no_trace() {
    let h = harness(ScriptedModel::replying(&["Ok :::foobar xyz:::"]));

    let reply = h.assistant.handle_message("1", "hola").await;

    assert_eq!(reply.reply, "Ok");
    assert!(reply.notices.is_empty());
    assert_eq!(h.model.calls(), 1);
    let history = h.assistant.sessions().history("1").await;
    assert!(history.iter().all(|m| !m.content.contains("foobar")));
    assert_eq!(history.len(), 3, "system, user, assistant");
}

#[tokio::test]
async fn search_results_trigger_one_follow_up() {
    let h = harness(ScriptedModel::replying(&[
        "Let me check. :::search weather Madrid:::",
        "It's sunny, 24°C.",
    ]));

    let reply = h.assistant.handle_message("5", "what's the weather in Madrid?").await;

    assert_eq!(h.model.calls(), 2);
    assert_eq!(reply.reply, "Let me check.\n\nIt's sunny, 24°C.");
    assert_eq!(reply.notices, vec!["Searching: weather Madrid"]);

    let follow_up = h.model.context(1);
    let results = follow_up
        .iter()
        .find(|m| m.role == Role::User && m.content.starts_with("[Search results for 'weather Madrid']"))
        .expect("search results in follow-up context");
    assert!(results.content.contains("Sunny, 24°C"));
    assert_eq!(h.search.queries.lock().unwrap().as_slice(), ["weather Madrid"]);
}

#[tokio::test]
async fn follow_ups_are_bounded() {
    let h = harness(ScriptedModel::replying(&[
        ":::search first:::",
        ":::search second:::",
        ":::search third:::",
    ]));

    h.assistant.handle_message("5", "keep searching").await;

    assert_eq!(h.model.calls(), 2);
}

#[tokio::test]
async fn model_outage_shows_fallback_message() {
    let config = test_config();
    let h = harness_with_config(
        ScriptedModel::new(vec![Err(ModelError::Unavailable("connection refused".into()))]),
        &config,
    );

    let reply = h.assistant.handle_message("9", "hola").await;

    assert_eq!(reply.reply, config.assistant.fallback_message);
    assert!(!reply.reply.contains("connection refused"));
    let history = h.assistant.sessions().history("9").await;
    assert_eq!(history.last().unwrap().role, Role::User);
}

#[tokio::test]
async fn rejected_command_becomes_feedback_without_follow_up() {
    let h = harness(ScriptedModel::replying(&["Hecho :::cron unico 99 18 1 1 Algo:::"]));

    let reply = h.assistant.handle_message("3", "recordame algo").await;

    assert_eq!(reply.reply, "Hecho");
    assert!(reply.notices.is_empty());
    assert_eq!(h.model.calls(), 1);
    assert!(h.scheduler.operations().is_empty());

    let history = h.assistant.sessions().history("3").await;
    let feedback = history.last().unwrap();
    assert_eq!(feedback.role, Role::System);
    assert!(feedback.content.starts_with("[command cron was not run"));
}

#[tokio::test]
async fn context_starts_with_prompt_and_ends_with_note() {
    let h = harness(ScriptedModel::replying(&["hi"]));

    h.assistant.handle_message("8", "hello").await;

    let context = h.model.context(0);
    assert_eq!(context[0].role, Role::System);
    assert_eq!(context[0].content, SYSTEM_PROMPT);
    let note = context.last().unwrap();
    assert_eq!(note.role, Role::System);
    assert!(note.content.starts_with("[System: the current time is"));

    // the note is never stored
    let history = h.assistant.sessions().history("8").await;
    assert!(history.iter().all(|m| !m.content.starts_with("[System:")));
}

#[tokio::test]
async fn recalled_facts_reach_the_context_note() {
    let h = harness(ScriptedModel::replying(&["Sí, te gustan."]));
    use femtobot::memory::MemoryStore;
    h.memory.add("Le gustan las manzanas", None).await.unwrap();

    h.assistant.handle_message("2", "manzanas").await;

    let note = h.model.context(0).last().unwrap().content.clone();
    assert!(note.contains("Relevant memories:\n- Le gustan las manzanas"));
}

#[tokio::test]
async fn light_command_reaches_controller() {
    let h = harness(ScriptedModel::replying(&["Apagando. :::luz salon apagar:::"]));

    let reply = h.assistant.handle_message("4", "apaga el salón").await;

    assert_eq!(
        h.lights.calls.lock().unwrap().as_slice(),
        [("salon".to_string(), LightAction::Off)]
    );
    assert_eq!(reply.notices, vec!["light salon: off"]);
}

#[tokio::test]
async fn audio_is_transcribed_then_answered() {
    let h = harness(ScriptedModel::replying(&["Claro."]));

    let reply = h
        .assistant
        .handle_audio("6", std::path::Path::new("/tmp/voice.ogg"))
        .await
        .unwrap();

    assert_eq!(reply.transcript.as_deref(), Some("recordame regar las plantas"));
    assert_eq!(reply.reply, "Claro.");
    let history = h.assistant.sessions().history("6").await;
    assert_eq!(history[1].content, "recordame regar las plantas");
}

#[tokio::test]
async fn documents_become_framed_user_turns() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("upload.bin");
    std::fs::write(&path, "Shopping list: bread, milk").unwrap();
    let h = harness(ScriptedModel::replying(&["You need bread and milk."]));

    let reply = h
        .assistant
        .handle_document("6", path, "list.txt", Some("what do I need?"))
        .await
        .unwrap();

    assert_eq!(reply.reply, "You need bread and milk.");
    let history = h.assistant.sessions().history("6").await;
    let framed = &history[1].content;
    assert!(framed.contains("'list.txt'"));
    assert!(framed.contains("what do I need?"));
    assert!(framed.contains("Shopping list: bread, milk"));
}

#[tokio::test]
async fn unsupported_documents_are_rejected_before_the_model() {
    let h = harness(ScriptedModel::replying(&["unused"]));

    let err = h
        .assistant
        .handle_document("6", "/tmp/setup.exe".into(), "setup.exe", None)
        .await
        .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<ValidationError>(),
        Some(ValidationError::UnsupportedDocument(_))
    ));
    assert_eq!(h.model.calls(), 0);
}

#[tokio::test]
async fn idle_unload_only_after_use() {
    let h = harness(ScriptedModel::replying(&["hi"]));

    assert!(!h.assistant.unload_if_idle(std::time::Duration::ZERO).await);
    h.assistant.handle_message("1", "hello").await;
    assert!(h.assistant.unload_if_idle(std::time::Duration::ZERO).await);
    assert_eq!(*h.model.unloads.lock().unwrap(), 1);
    // already unloaded
    assert!(!h.assistant.unload_if_idle(std::time::Duration::ZERO).await);
}

#[tokio::test]
async fn reset_keeps_only_the_system_prompt() {
    let h = harness(ScriptedModel::replying(&["one", "two"]));
    h.assistant.handle_message("1", "a").await;
    h.assistant.handle_message("1", "b").await;

    h.assistant.reset("1").await;

    let history = h.assistant.sessions().history("1").await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content, SYSTEM_PROMPT);
}

#[tokio::test]
async fn math_questions_go_to_the_math_model() {
    let math = Arc::new(ScriptedModel::replying(&["2x = 8, so x = 4."]));
    let h = harness_with(
        ScriptedModel::replying(&["Let me work it out :::matematicas:::"]),
        &test_config(),
        Extras {
            math: Some(math.clone()),
            ..Extras::default()
        },
    );

    let reply = h.assistant.handle_message("m", "solve 2x = 8").await;

    assert_eq!(reply.reply, "2x = 8, so x = 4.");
    assert_eq!(h.model.calls(), 1);
    assert_eq!(math.calls(), 1);
    let asked = math.context(0);
    assert!(asked.iter().all(|m| m.role != Role::System));
    assert_eq!(asked.last().unwrap().content, "solve 2x = 8");
    assert_eq!(math.unload_count(), 1);

    let history = h.assistant.sessions().history("m").await;
    assert_eq!(history.last().unwrap().content, "2x = 8, so x = 4.");
    assert!(history.iter().all(|m| !m.content.contains("work it out")));
}

#[tokio::test]
async fn math_token_without_math_model_keeps_the_chat_reply() {
    let h = harness(ScriptedModel::replying(&["x = 4 :::matematicas:::"]));

    let reply = h.assistant.handle_message("m", "solve 2x = 8").await;

    assert_eq!(reply.reply, "x = 4");
    assert!(reply.notices.is_empty());
    assert_eq!(h.model.calls(), 1);
}

#[tokio::test]
async fn images_are_described_then_answered() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bike.jpg");
    std::fs::write(&path, b"jpeg bytes").unwrap();
    let vision = Arc::new(ScriptedModel::replying(&[]).describing("A red bicycle against a wall."));
    let h = harness_with(
        ScriptedModel::replying(&["Nice bike!"]),
        &test_config(),
        Extras {
            vision: Some(vision.clone()),
            ..Extras::default()
        },
    );

    let reply = h
        .assistant
        .handle_image("img", &path, Some("what is this?"))
        .await
        .unwrap();

    assert_eq!(reply.reply, "Nice bike!");
    let prompts = vision.image_prompts.lock().unwrap().clone();
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0].0, b"jpeg bytes");
    assert!(prompts[0].1.contains("what is this?"));
    assert_eq!(vision.unload_count(), 1);

    let user_turn = h
        .model
        .context(0)
        .into_iter()
        .rev()
        .find(|m| m.role == Role::User)
        .unwrap();
    assert!(user_turn.content.contains("[Image description: A red bicycle against a wall.]"));
    assert!(user_turn.content.contains("what is this?"));

    // the idle unload releases the vision model too
    h.assistant.unload_model().await.unwrap();
    assert_eq!(vision.unload_count(), 2);
    assert_eq!(h.model.unload_count(), 1);
}

#[tokio::test]
async fn stuck_transcription_times_out_with_a_plain_reply() {
    let mut config = test_config();
    config.ingest.timeout_secs = 1;
    let h = harness_with(
        ScriptedModel::replying(&["unused"]),
        &config,
        Extras {
            transcriber: Some(Arc::new(StuckTranscriber)),
            ..Extras::default()
        },
    );

    let reply = tokio::time::timeout(
        Duration::from_secs(5),
        h.assistant.handle_audio("a", std::path::Path::new("/tmp/voice.ogg")),
    )
    .await
    .expect("timeout should stop the transcriber")
    .unwrap();

    assert!(reply.reply.contains("took too long"));
    assert!(reply.transcript.is_none());
    assert_eq!(h.model.calls(), 0);
    assert!(h.assistant.sessions().history("a").await.is_empty());
}

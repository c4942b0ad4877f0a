//! Conversation state machine tests: send flow, upload resolution, source
//! dedup and rollback, preferences, and history persistence.

mod common;

use serde_json::{Value, json};

use common::{authenticate, chat_response, harness};
use nightjar::chat::{ChatService, SEND_FAILURE_TEXT};
use nightjar::storage::{KeyValueStore, keys};
use nightjar::types::{FileStatus, Message, PreferencesPatch, Role};

mod send_flow {
    use super::*;

    #[tokio::test]
    async fn test_successful_send_appends_user_then_assistant() {
        let h = harness();
        authenticate(&h).await;
        h.backend.stub(
            "POST /v1/chat/query",
            200,
            chat_response("Your documents cover three topics.", 0.82, 450),
        );

        h.chat.send_message("Summarize my uploaded documents").await;

        let state = h.chat.snapshot();
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[0].role, Role::User);
        assert_eq!(state.messages[0].content, "Summarize my uploaded documents");
        assert_eq!(state.messages[1].role, Role::Assistant);
        assert_eq!(
            state.messages[1].content,
            "Your documents cover three topics."
        );
        assert!(!state.is_loading);

        let metadata = state.messages[1].metadata.as_ref().unwrap();
        assert_eq!(metadata.confidence, 0.82);
        assert_eq!(metadata.latency_ms, 450);
        assert_eq!(metadata.citations, vec!["doc-1"]);
        assert_eq!(metadata.retrieval_trace, json!({"hops": 2}));
    }

    #[tokio::test]
    async fn test_log_grows_by_two_per_send_in_call_order() {
        let h = harness();
        authenticate(&h).await;
        h.backend
            .stub("POST /v1/chat/query", 200, chat_response("first", 0.9, 100));
        h.backend
            .stub("POST /v1/chat/query", 200, chat_response("second", 0.9, 100));

        h.chat.send_message("one").await;
        h.chat.send_message("two").await;

        let contents: Vec<String> = h
            .chat
            .snapshot()
            .messages
            .iter()
            .map(|m| m.content.clone())
            .collect();
        assert_eq!(contents, vec!["one", "first", "two", "second"]);
    }

    #[tokio::test]
    async fn test_failed_send_substitutes_synthetic_assistant_message() {
        let h = harness();
        authenticate(&h).await;
        h.backend.stub_fail("POST /v1/chat/query");

        h.chat.send_message("anyone there?").await;

        let state = h.chat.snapshot();
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[1].role, Role::Assistant);
        assert_eq!(state.messages[1].content, SEND_FAILURE_TEXT);
        assert!(state.messages[1].metadata.is_none());
        assert!(!state.is_loading);
    }

    #[tokio::test]
    async fn test_request_carries_session_preferences_and_history() {
        let h = harness();
        authenticate(&h).await;
        h.backend
            .stub("POST /v1/chat/query", 200, chat_response("first answer", 0.9, 100));

        h.chat.update_preferences(PreferencesPatch {
            domain: Some("biology".to_string()),
            ..Default::default()
        });
        h.chat.send_message("first question").await;
        h.chat.send_message("second question").await;

        let body = h.backend.last_body("POST /v1/chat/query").unwrap();
        assert_eq!(body["query"], "second question");
        assert_eq!(body["user_id"], "user-1");
        assert_eq!(body["session_id"], "sess-123");
        assert_eq!(body["preferences"]["domain"], "biology");
        // history is the assistant-only subset of prior contents
        assert_eq!(body["conversation_history"], json!(["first answer"]));
    }

    #[tokio::test]
    async fn test_empty_query_is_a_local_noop() {
        let h = harness();
        authenticate(&h).await;

        h.chat.send_message("   ").await;
        assert!(h.chat.snapshot().messages.is_empty());
        assert_eq!(h.backend.calls_to("POST /v1/chat/query"), 0);
    }

    #[tokio::test]
    async fn test_send_without_session_is_a_local_noop() {
        let h = harness();
        // logged out, no session
        h.chat.send_message("hello").await;
        assert!(h.chat.snapshot().messages.is_empty());
        assert_eq!(h.backend.calls_to("POST /v1/chat/query"), 0);
    }
}

mod uploads {
    use super::*;

    #[tokio::test]
    async fn test_confirmed_upload_replaces_temp_entry() {
        let h = harness();
        authenticate(&h).await;
        h.backend.stub(
            "POST /ingest/file",
            200,
            json!({
                "status": "processing",
                "message": "queued",
                "document_id": "doc-42",
                "chunks_count": 5
            }),
        );

        h.chat.add_file("notes.pdf", b"content".to_vec()).await;

        let files = h.chat.snapshot().files;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].id, "doc-42");
        assert_eq!(files[0].name, "notes.pdf");
        assert_eq!(files[0].status, FileStatus::Complete);
    }

    #[tokio::test]
    async fn test_failed_upload_is_marked_error_not_dropped() {
        let h = harness();
        authenticate(&h).await;
        h.backend.stub("POST /ingest/file", 500, Value::Null);

        h.chat.add_file("notes.pdf", b"content".to_vec()).await;

        let files = h.chat.snapshot().files;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].status, FileStatus::Error);
        // never left uploading forever
        assert!(files.iter().all(|f| f.status != FileStatus::Uploading));
    }

    #[tokio::test]
    async fn test_upload_sends_multipart_with_user_id() {
        let h = harness();
        authenticate(&h).await;
        h.backend.stub(
            "POST /ingest/file",
            200,
            json!({
                "status": "processing",
                "message": "queued",
                "document_id": "doc-1",
                "chunks_count": 1
            }),
        );

        h.chat.add_file("notes.pdf", b"abcdef".to_vec()).await;

        let body = h.backend.last_body("POST /ingest/file").unwrap();
        assert_eq!(body["file_name"], "notes.pdf");
        assert_eq!(body["size"], 6);
        assert_eq!(body["fields"]["user_id"], "user-1");
    }

    #[tokio::test]
    async fn test_upload_requires_authentication() {
        let h = harness();
        h.chat.add_file("notes.pdf", b"content".to_vec()).await;
        assert!(h.chat.snapshot().files.is_empty());
        assert_eq!(h.backend.calls_to("POST /ingest/file"), 0);
    }
}

mod sources {
    use super::*;

    fn stub_ingest_ok(h: &common::Harness) {
        h.backend.stub(
            "POST /ingest/url",
            200,
            json!({
                "status": "processing",
                "message": "queued",
                "document_id": "doc-7",
                "chunks_count": 3
            }),
        );
    }

    #[tokio::test]
    async fn test_web_source_added_and_registered() {
        let h = harness();
        authenticate(&h).await;
        stub_ingest_ok(&h);

        h.chat.add_web_source("https://example.com/notes").await;

        assert_eq!(
            h.chat.snapshot().web_sources,
            vec!["https://example.com/notes"]
        );
        let body = h.backend.last_body("POST /ingest/url").unwrap();
        assert_eq!(body["type"], "web");
        assert_eq!(body["user_id"], "user-1");
    }

    #[tokio::test]
    async fn test_duplicate_source_is_a_noop() {
        let h = harness();
        authenticate(&h).await;
        stub_ingest_ok(&h);

        h.chat.add_web_source("https://example.com/notes").await;
        h.chat.add_web_source("https://example.com/notes").await;

        assert_eq!(h.chat.snapshot().web_sources.len(), 1);
        assert_eq!(h.backend.calls_to("POST /ingest/url"), 1);
    }

    #[tokio::test]
    async fn test_failed_registration_rolls_back() {
        let h = harness();
        authenticate(&h).await;
        h.backend.stub("POST /ingest/url", 500, Value::Null);

        h.chat.add_youtube_source("https://youtu.be/abc").await;

        assert!(h.chat.snapshot().youtube_sources.is_empty());
    }

    #[tokio::test]
    async fn test_youtube_registration_sends_video_type() {
        let h = harness();
        authenticate(&h).await;
        stub_ingest_ok(&h);

        h.chat.add_youtube_source("https://youtu.be/abc").await;

        let body = h.backend.last_body("POST /ingest/url").unwrap();
        assert_eq!(body["type"], "youtube");
        assert_eq!(
            h.chat.snapshot().youtube_sources,
            vec!["https://youtu.be/abc"]
        );
    }
}

mod preferences {
    use super::*;

    #[tokio::test]
    async fn test_update_merges_and_persists_immediately() {
        let h = harness();
        let before = h.chat.snapshot().preferences.clone();

        h.chat.update_preferences(PreferencesPatch {
            max_length: Some(800),
            allow_agentic: Some(true),
            ..Default::default()
        });

        let after = h.chat.snapshot().preferences;
        assert_eq!(after.max_length, 800);
        assert!(after.allow_agentic);
        assert_eq!(after.response_style, before.response_style);
        assert_eq!(after.domain, before.domain);

        // persisted record equals the in-memory one
        let raw = h.store.get(keys::PREFERENCES).unwrap();
        let stored: nightjar::types::ChatPreferences = serde_json::from_str(&raw).unwrap();
        assert_eq!(stored, after);
        // no server round-trip
        assert_eq!(h.backend.calls_to("POST /v1/chat/query"), 0);
    }

    #[tokio::test]
    async fn test_preferences_restore_on_construction() {
        let h = harness();
        h.chat.update_preferences(PreferencesPatch {
            domain: Some("history".to_string()),
            ..Default::default()
        });

        let rebuilt = ChatService::new(
            h.gateway.clone(),
            h.auth.clone(),
            h.session.clone(),
            h.store.clone(),
            h.clock.clone(),
        );
        assert_eq!(rebuilt.snapshot().preferences.domain, "history");
    }
}

mod history {
    use super::*;

    #[tokio::test]
    async fn test_clear_history_archives_and_empties_transcript() {
        let h = harness();
        authenticate(&h).await;
        h.backend
            .stub("POST /v1/chat/query", 200, chat_response("answer", 0.9, 50));

        h.chat.send_message("question").await;
        h.chat.clear_history();

        let state = h.chat.snapshot();
        assert!(state.messages.is_empty());
        assert_eq!(h.store.get(keys::MESSAGE_HISTORY), None);

        let archive: Vec<Vec<Message>> =
            serde_json::from_str(&h.store.get(keys::CONVERSATION_ARCHIVE).unwrap()).unwrap();
        assert_eq!(archive.len(), 1);
        assert_eq!(archive[0].len(), 2);

        // session and preferences untouched
        assert!(h.session.session().is_some());
        assert_eq!(state.preferences, nightjar::types::ChatPreferences::default());
    }

    #[tokio::test]
    async fn test_history_survives_reconstruction() {
        let h = harness();
        authenticate(&h).await;
        h.backend
            .stub("POST /v1/chat/query", 200, chat_response("answer", 0.9, 50));
        h.chat.send_message("question").await;

        let rebuilt = ChatService::new(
            h.gateway.clone(),
            h.auth.clone(),
            h.session.clone(),
            h.store.clone(),
            h.clock.clone(),
        );
        let messages = rebuilt.snapshot().messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "question");
        assert_eq!(messages[1].content, "answer");
    }

    #[tokio::test]
    async fn test_subscribers_observe_snapshots() {
        let h = harness();
        authenticate(&h).await;
        h.backend
            .stub("POST /v1/chat/query", 200, chat_response("answer", 0.9, 50));
        let mut observer = h.chat.subscribe();

        h.chat.send_message("question").await;

        observer.changed().await.unwrap();
        let observed = observer.borrow_and_update().clone();
        assert_eq!(observed.messages.len(), 2);
        assert!(!observed.is_loading);
    }
}

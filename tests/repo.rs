mod common;

use cx_container::access::Caller;
use cx_container::dto::*;
use cx_container::error::CxError;
use cx_container::models::{
    ContentType, FeedbackType, MessageType, Role, SourceDocumentStatus,
};
use cx_container::repo::{messages, nodes, profiles, projects, source_documents, threads};

use common::test_app;

fn alice() -> Caller {
    Caller::new("alice", vec![Role::User])
}

fn bob() -> Caller {
    Caller::new("bob", vec![Role::User])
}

fn admin() -> Caller {
    Caller::new("root", vec![Role::SuperAdmin])
}

fn kind(err: &anyhow::Error) -> &'static str {
    match CxError::find(err) {
        Some(CxError::Validation(_)) => "validation",
        Some(CxError::Forbidden(_)) => "forbidden",
        Some(CxError::NotFound { .. }) => "not_found",
        Some(CxError::Conflict(_)) => "conflict",
        Some(CxError::Disabled(_)) => "disabled",
        None => "other",
    }
}

#[tokio::test]
async fn one_profile_per_user() {
    let (_tmp, app) = test_app().await;
    let input = ProfileForCreation {
        name: "Alice".into(),
        city: Some("Lyon".into()),
        ..Default::default()
    };

    let profile = profiles::add(&app.pool, &alice(), &input).await.unwrap();
    assert_eq!(profile.user_id, "alice");
    assert_eq!(profiles::by_user(&app.pool, &alice()).await.unwrap().id, profile.id);

    let err = profiles::add(&app.pool, &alice(), &input).await.unwrap_err();
    assert_eq!(kind(&err), "conflict");

    let err = profiles::get(&app.pool, &bob(), &profile.id).await.unwrap_err();
    assert_eq!(kind(&err), "forbidden");
    assert!(profiles::get(&app.pool, &admin(), &profile.id).await.is_ok());

    let err = profiles::list(&app.pool, &alice(), Page::default()).await.unwrap_err();
    assert_eq!(kind(&err), "forbidden");
}

#[tokio::test]
async fn projects_need_permission_and_a_name() {
    let (_tmp, app) = test_app().await;
    let input = ProjectForCreation {
        name: "Handbook".into(),
        description: None,
    };

    let err = projects::add(&app.pool, &alice(), &input).await.unwrap_err();
    assert_eq!(kind(&err), "forbidden");

    let blank = ProjectForCreation {
        name: "  ".into(),
        description: None,
    };
    let err = projects::add(&app.pool, &admin(), &blank).await.unwrap_err();
    assert_eq!(kind(&err), "validation");

    let project = projects::add(&app.pool, &admin(), &input).await.unwrap();
    projects::delete(&app.pool, &admin(), &project.id).await.unwrap();
    let err = projects::get(&app.pool, &project.id).await.unwrap_err();
    assert_eq!(kind(&err), "not_found");
}

#[tokio::test]
async fn threads_belong_to_their_creator() {
    let (_tmp, app) = test_app().await;
    let thread = threads::create(
        &app.pool,
        &alice(),
        &ThreadForCreation {
            name: "Onboarding".into(),
        },
    )
    .await
    .unwrap();

    let err = threads::get(&app.pool, &bob(), &thread.id).await.unwrap_err();
    assert_eq!(kind(&err), "forbidden");
    assert!(threads::get(&app.pool, &admin(), &thread.id).await.is_ok());

    assert_eq!(
        threads::list_for_caller(&app.pool, &alice(), Page::default())
            .await
            .unwrap()
            .len(),
        1
    );
    assert!(threads::list_for_caller(&app.pool, &bob(), Page::default())
        .await
        .unwrap()
        .is_empty());
    let err = threads::list_all(&app.pool, &bob(), Page::default()).await.unwrap_err();
    assert_eq!(kind(&err), "forbidden");

    let msg = messages::add(&app.pool, &alice(), &thread.id, &MessageForCreation::user("hi"))
        .await
        .unwrap();
    threads::delete(&app.pool, &alice(), &thread.id).await.unwrap();

    let err = threads::get(&app.pool, &alice(), &thread.id).await.unwrap_err();
    assert_eq!(kind(&err), "not_found");
    let err = messages::get(&app.pool, &alice(), &msg.id).await.unwrap_err();
    assert_eq!(kind(&err), "not_found");
}

#[tokio::test]
async fn pinning_updates_the_thread_flag() {
    let (_tmp, app) = test_app().await;
    let thread = threads::create(
        &app.pool,
        &alice(),
        &ThreadForCreation { name: "Notes".into() },
    )
    .await
    .unwrap();
    let msg = messages::add(
        &app.pool,
        &alice(),
        &thread.id,
        &MessageForCreation::user("remember this"),
    )
    .await
    .unwrap();
    assert_eq!(msg.feedback, FeedbackType::None);
    assert!(!threads::get(&app.pool, &alice(), &thread.id)
        .await
        .unwrap()
        .has_pinned_messages);

    let pin = MessageForUpdate {
        content: "remember this".into(),
        content_type: ContentType::PlainText,
        message_type: MessageType::User,
        feedback: FeedbackType::Positive,
        is_flagged: false,
        is_pinned: true,
    };
    let updated = messages::update(&app.pool, &alice(), &msg.id, &pin).await.unwrap();
    assert!(updated.is_pinned);
    assert_eq!(updated.feedback, FeedbackType::Positive);
    assert!(threads::get(&app.pool, &alice(), &thread.id)
        .await
        .unwrap()
        .has_pinned_messages);

    let err = messages::update(&app.pool, &bob(), &msg.id, &pin).await.unwrap_err();
    assert_eq!(kind(&err), "forbidden");

    messages::delete(&app.pool, &alice(), &msg.id).await.unwrap();
    assert!(!threads::get(&app.pool, &alice(), &thread.id)
        .await
        .unwrap()
        .has_pinned_messages);
}

#[tokio::test]
async fn message_summary_covers_six_months() {
    let (_tmp, app) = test_app().await;
    let thread = threads::create(&app.pool, &alice(), &ThreadForCreation { name: "t".into() })
        .await
        .unwrap();
    for text in ["one", "two"] {
        messages::add(&app.pool, &alice(), &thread.id, &MessageForCreation::user(text))
            .await
            .unwrap();
    }

    let err = messages::summary(&app.pool, &alice()).await.unwrap_err();
    assert_eq!(kind(&err), "forbidden");

    let summary = messages::summary(&app.pool, &admin()).await.unwrap();
    assert_eq!(summary.len(), 6);
    assert_eq!(summary.last().unwrap().count, 2);
    assert!(summary[..5].iter().all(|m| m.count == 0));
}

#[tokio::test]
async fn nodes_form_a_tree_without_cycles() {
    let (_tmp, app) = test_app().await;
    let project = projects::add(
        &app.pool,
        &admin(),
        &ProjectForCreation {
            name: "Docs".into(),
            description: None,
        },
    )
    .await
    .unwrap();

    let parent = nodes::add(
        &app.pool,
        &admin(),
        &project.id,
        &NodeForCreation {
            name: "guides".into(),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let child = nodes::add(
        &app.pool,
        &admin(),
        &project.id,
        &NodeForCreation {
            name: "setup".into(),
            parent_id: Some(parent.id.clone()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(child.parent_id.as_deref(), Some(parent.id.as_str()));

    let err = nodes::update_parent(&app.pool, &admin(), &parent.id, Some(&child.id))
        .await
        .unwrap_err();
    assert_eq!(kind(&err), "validation");
    let err = nodes::update_parent(&app.pool, &admin(), &parent.id, Some(&parent.id))
        .await
        .unwrap_err();
    assert_eq!(kind(&err), "validation");

    let moved = nodes::update_parent(&app.pool, &admin(), &child.id, None)
        .await
        .unwrap();
    assert!(moved.parent_id.is_none());
    nodes::update_parent(&app.pool, &admin(), &child.id, Some(&parent.id))
        .await
        .unwrap();

    let err = nodes::add(
        &app.pool,
        &alice(),
        &project.id,
        &NodeForCreation {
            name: "x".into(),
            ..Default::default()
        },
    )
    .await
    .unwrap_err();
    assert_eq!(kind(&err), "forbidden");

    let removed = nodes::delete(&app.pool, &admin(), &parent.id).await.unwrap();
    assert_eq!(removed, 2);
    let err = nodes::get(&app.pool, &child.id).await.unwrap_err();
    assert_eq!(kind(&err), "not_found");
    assert!(nodes::list_for_project(&app.pool, &project.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn source_document_lifecycle() {
    let (_tmp, app) = test_app().await;
    let input = SourceDocumentForCreation {
        description: Some("Safety rules".into()),
        ..SourceDocumentForCreation::named("rules.txt")
    };

    let err = source_documents::add(&app.pool, &alice(), &input).await.unwrap_err();
    assert_eq!(kind(&err), "forbidden");

    let doc = source_documents::add(&app.pool, &admin(), &input).await.unwrap();
    assert_eq!(doc.status, SourceDocumentStatus::PrivateBucket);
    assert!(!doc.is_trained);

    let updated = source_documents::update(
        &app.pool,
        &admin(),
        &doc.id,
        &SourceDocumentForUpdate {
            name: Some(String::new()),
            tags: Some("safety".into()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(updated.name, "rules.txt");
    assert_eq!(updated.tags.as_deref(), Some("safety"));
    assert_eq!(updated.description.as_deref(), Some("Safety rules"));

    let reset = source_documents::reset(&app.pool, &admin(), &doc.id).await.unwrap();
    assert_eq!(reset.status, SourceDocumentStatus::QueuedForRetrain);

    let filter = SourceDocumentFilter {
        status: Some(SourceDocumentStatus::QueuedForRetrain),
        node_id: None,
    };
    assert_eq!(source_documents::list(&app.pool, &filter).await.unwrap().len(), 1);

    source_documents::delete(&app.pool, &admin(), &doc.id).await.unwrap();
    let err = source_documents::get(&app.pool, &doc.id).await.unwrap_err();
    assert_eq!(kind(&err), "not_found");
    assert!(source_documents::get_any(&app.pool, &doc.id)
        .await
        .unwrap()
        .is_some());

    source_documents::destroy(&app.pool, &admin(), &doc.id).await.unwrap();
    assert!(source_documents::get_any(&app.pool, &doc.id)
        .await
        .unwrap()
        .is_none());
    let err = source_documents::destroy(&app.pool, &admin(), &doc.id)
        .await
        .unwrap_err();
    assert_eq!(kind(&err), "not_found");
}

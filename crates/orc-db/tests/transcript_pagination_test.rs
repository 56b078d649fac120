//! Cursor pagination contract over a 150-row transcript set.

use orc_core::types::{Transcript, TranscriptKind};
use orc_db::transcript_store::{PageDirection, PageOpts, TranscriptStore};
use orc_db::ProjectDb;

async fn seeded_store(n: i64) -> TranscriptStore {
    let store = TranscriptStore::new(ProjectDb::open_in_memory().await.unwrap());
    let batch: Vec<Transcript> = (0..n)
        .map(|i| {
            let mut t = Transcript::new(
                "TASK-001",
                if i % 2 == 0 { "implement" } else { "review" },
                "sess-1",
                TranscriptKind::Assistant,
                format!("{{\"text\": \"line {i}\"}}"),
            );
            t.timestamp_ms = 1_700_000_000_000 + i;
            t
        })
        .collect();
    store.add_batch(batch).await.unwrap();
    store
}

#[tokio::test]
async fn first_page_ascending() {
    let store = seeded_store(150).await;

    let page = store
        .get_transcripts_paginated("TASK-001", PageOpts::default())
        .await
        .unwrap();

    assert_eq!(page.transcripts.len(), 50);
    assert!(page.has_more);
    assert_eq!(page.total_count, 150);
    assert_eq!(page.prev_cursor, None);
    assert_eq!(page.next_cursor, Some(page.transcripts[49].id));
    // Default limit is 50; the page starts at the first inserted row.
    assert_eq!(page.transcripts[0].id + 49, page.transcripts[49].id);
}

#[tokio::test]
async fn following_the_cursor_yields_next_page() {
    let store = seeded_store(150).await;

    let first = store
        .get_transcripts_paginated("TASK-001", PageOpts::default())
        .await
        .unwrap();
    let second = store
        .get_transcripts_paginated(
            "TASK-001",
            PageOpts {
                cursor: first.next_cursor,
                ..PageOpts::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(second.transcripts.len(), 50);
    assert!(second.has_more);
    assert_eq!(second.total_count, 150);
    assert_eq!(
        second.transcripts[0].id,
        first.transcripts[49].id + 1,
        "second page starts right after the cursor"
    );
    assert_eq!(second.prev_cursor, Some(second.transcripts[0].id));

    let third = store
        .get_transcripts_paginated(
            "TASK-001",
            PageOpts {
                cursor: second.next_cursor,
                ..PageOpts::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(third.transcripts.len(), 50);
    assert!(!third.has_more);
    assert_eq!(third.next_cursor, None);
}

#[tokio::test]
async fn descending_walks_backwards() {
    let store = seeded_store(120).await;

    let page = store
        .get_transcripts_paginated(
            "TASK-001",
            PageOpts {
                direction: PageDirection::Desc,
                ..PageOpts::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(page.transcripts.len(), 50);
    assert!(page.has_more);
    // Highest ids first.
    assert!(page.transcripts[0].id > page.transcripts[49].id);

    let next = store
        .get_transcripts_paginated(
            "TASK-001",
            PageOpts {
                direction: PageDirection::Desc,
                cursor: page.next_cursor,
                ..PageOpts::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(next.transcripts[0].id, page.transcripts[49].id - 1);
}

#[tokio::test]
async fn phase_filter_restricts_total_count() {
    let store = seeded_store(100).await;

    let page = store
        .get_transcripts_paginated(
            "TASK-001",
            PageOpts {
                phase: Some("implement".into()),
                ..PageOpts::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(page.total_count, 50);
    assert!(page.transcripts.iter().all(|t| t.phase == "implement"));
}

#[tokio::test]
async fn limit_is_capped_at_200() {
    let store = seeded_store(250).await;

    let page = store
        .get_transcripts_paginated(
            "TASK-001",
            PageOpts {
                limit: Some(1000),
                ..PageOpts::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(page.transcripts.len(), 200);
    assert!(page.has_more);
}

mod common;

use std::sync::Arc;

use recap_core::{Actor, ChunkReceipt, RecordingStatus, ServiceError};
use tokio::task::JoinSet;

use common::harness;

async fn finalize(receipt: ChunkReceipt) -> (Vec<u8>, usize) {
    match receipt {
        ChunkReceipt::Finalized { merge, pipeline } => {
            let bytes = std::fs::read(&merge.path).unwrap();
            pipeline.wait().await.unwrap();
            (bytes, merge.chunk_count)
        }
        ChunkReceipt::Accepted { index } => panic!("chunk {index} was not treated as terminal"),
    }
}

#[tokio::test]
async fn merge_is_independent_of_arrival_order() {
    let h = harness(None);
    let actor = Actor::new("alice").unwrap();
    let id = h.service.start_session(&actor).unwrap();
    let parts: Vec<Vec<u8>> = (0..6u8).map(|i| vec![b'a' + i; 3 + i as usize]).collect();

    for index in [5u32, 3, 0, 4, 1] {
        let receipt = h
            .service
            .submit_chunk(&actor, &id, index, &parts[index as usize], false)
            .await
            .unwrap();
        assert!(matches!(receipt, ChunkReceipt::Accepted { index: i } if i == index));
    }
    let receipt = h
        .service
        .submit_chunk(&actor, &id, 2, &parts[2], true)
        .await
        .unwrap();
    let (merged, count) = finalize(receipt).await;

    assert_eq!(merged, parts.concat());
    assert_eq!(count, 6);
}

#[tokio::test]
async fn redelivered_index_keeps_last_payload() {
    let h = harness(None);
    let actor = Actor::new("alice").unwrap();
    let id = h.service.start_session(&actor).unwrap();

    h.service.submit_chunk(&actor, &id, 0, b"first", false).await.unwrap();
    h.service.submit_chunk(&actor, &id, 0, b"second", false).await.unwrap();
    assert_eq!(h.service.staged_indices(&id).await.unwrap(), vec![0]);

    let receipt = h
        .service
        .submit_chunk(&actor, &id, 1, b"-tail", true)
        .await
        .unwrap();
    let (merged, count) = finalize(receipt).await;
    assert_eq!(merged, b"second-tail");
    assert_eq!(count, 2);
}

#[tokio::test]
async fn twelve_chunks_merge_in_numeric_order() {
    let h = harness(None);
    let actor = Actor::new("alice").unwrap();
    let id = h.service.start_session(&actor).unwrap();

    for index in (0..11u32).rev() {
        h.service
            .submit_chunk(&actor, &id, index, format!("[{index}]").as_bytes(), false)
            .await
            .unwrap();
    }
    let receipt = h
        .service
        .submit_chunk(&actor, &id, 11, b"[11]", true)
        .await
        .unwrap();
    let (merged, _) = finalize(receipt).await;

    let expected: String = (0..12).map(|i| format!("[{i}]")).collect();
    assert_eq!(String::from_utf8(merged).unwrap(), expected);
}

#[tokio::test]
async fn concurrent_writes_all_land_before_merge() {
    let h = harness(None);
    let service = Arc::new(h.service);
    let actor = Actor::new("alice").unwrap();
    let id = service.start_session(&actor).unwrap();

    let mut writers = JoinSet::new();
    for index in 0..16u32 {
        let service = Arc::clone(&service);
        let actor = actor.clone();
        let id = id.clone();
        writers.spawn(async move {
            service
                .submit_chunk(&actor, &id, index, &[index as u8; 64], false)
                .await
                .map(|_| ())
        });
    }
    while let Some(joined) = writers.join_next().await {
        joined.unwrap().unwrap();
    }

    let receipt = service
        .submit_chunk(&actor, &id, 16, &[16u8; 64], true)
        .await
        .unwrap();
    let (merged, count) = finalize(receipt).await;
    assert_eq!(count, 17);
    let expected: Vec<u8> = (0..17u8).flat_map(|i| [i; 64]).collect();
    assert_eq!(merged, expected);
}

#[tokio::test]
async fn terminal_marker_with_nothing_staged_is_empty_merge() {
    let h = harness(None);
    let actor = Actor::new("alice").unwrap();
    let id = h.service.start_session(&actor).unwrap();

    let err = h
        .service
        .submit_chunk(&actor, &id, 0, b"", true)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::EmptyMerge { .. }));

    let recording = h.service.get_recording(&id).unwrap();
    assert_eq!(recording.status, RecordingStatus::Processing);
    assert!(recording.original_location.is_none());

    // the upload can still continue afterwards
    let receipt = h
        .service
        .submit_chunk(&actor, &id, 0, b"late", false)
        .await
        .unwrap();
    assert!(matches!(receipt, ChunkReceipt::Accepted { index: 0 }));
}

#[tokio::test]
async fn empty_non_terminal_chunk_is_rejected() {
    let h = harness(None);
    let actor = Actor::new("alice").unwrap();
    let id = h.service.start_session(&actor).unwrap();
    let err = h
        .service
        .submit_chunk(&actor, &id, 3, b"", false)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidChunk(_)));
    assert!(h.service.staged_indices(&id).await.unwrap().is_empty());
}

#[tokio::test]
async fn chunks_for_foreign_or_unknown_recordings_are_refused() {
    let h = harness(None);
    let alice = Actor::new("alice").unwrap();
    let bob = Actor::new("bob").unwrap();
    let id = h.service.start_session(&alice).unwrap();

    let err = h
        .service
        .submit_chunk(&bob, &id, 0, b"x", false)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound { .. }));

    let err = h
        .service
        .submit_chunk(&alice, "missing0000", 0, b"x", false)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound { .. }));

    let err = h
        .service
        .submit_chunk(&alice, "../escape", 0, b"x", false)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidRecordingId(_)));
}

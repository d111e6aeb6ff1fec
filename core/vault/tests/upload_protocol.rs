mod common;

use std::sync::Arc;

use common::{audio, Vault};
use soundvault_common::{Error, ErrorCode, RemotePath};
use soundvault_storage::{InjectedFailure, MemoryStorage, StorageCall, StorageOp};
use soundvault_vault::config::DEFAULT_CHUNK_SIZE;
use soundvault_vault::{ChunkedUploader, NoCheckpoint, TrackStore, UploadPhase};

const MIB: usize = 1024 * 1024;

fn uploader() -> (MemoryStorage, ChunkedUploader) {
    let storage = MemoryStorage::new();
    let uploader = ChunkedUploader::new(Arc::new(storage.clone()), DEFAULT_CHUNK_SIZE).unwrap();
    (storage, uploader)
}

fn appends(storage: &MemoryStorage) -> Vec<(u64, u64)> {
    storage
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            StorageCall::Append { offset, len, .. } => Some((offset, len)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_twenty_mib_blob_appends_twice() {
    let (storage, uploader) = uploader();
    let blob = vec![0xA5u8; 20 * MIB];
    let dest = RemotePath::parse("/big.flac").unwrap();

    let mut phases = Vec::new();
    uploader
        .upload(&blob, &dest, &NoCheckpoint, |p| phases.push(p))
        .await
        .unwrap();

    let calls = storage.calls();
    assert_eq!(calls.first(), Some(&StorageCall::Start { len: 8 * MIB as u64 }));
    assert_eq!(
        appends(&storage),
        vec![(8 * MIB as u64, 8 * MIB as u64), (16 * MIB as u64, 4 * MIB as u64)]
    );
    assert!(matches!(
        calls.last(),
        Some(StorageCall::Finish { offset, len: 0, .. }) if *offset == 20 * MIB as u64
    ));
    assert_eq!(storage.object(&dest).unwrap().len(), 20 * MIB);

    let phase_order: Vec<UploadPhase> = phases.iter().map(|p| p.phase).collect();
    assert_eq!(
        phase_order,
        vec![
            UploadPhase::Start,
            UploadPhase::Append,
            UploadPhase::Append,
            UploadPhase::Finish
        ]
    );
}

#[tokio::test]
async fn test_append_count_for_whole_and_partial_chunks() {
    // (blob length, expected appends)
    let cases = [
        (1, 0),
        (DEFAULT_CHUNK_SIZE - 1, 0),
        (DEFAULT_CHUNK_SIZE, 0),
        (DEFAULT_CHUNK_SIZE + 1, 1),
        (2 * DEFAULT_CHUNK_SIZE, 1),
        (2 * DEFAULT_CHUNK_SIZE + 12_345, 2),
        (3 * DEFAULT_CHUNK_SIZE + 1, 3),
    ];

    for (len, expected) in cases {
        let (storage, uploader) = uploader();
        let dest = RemotePath::parse("/case.mp3").unwrap();
        uploader
            .upload(&vec![1u8; len], &dest, &NoCheckpoint, |_| {})
            .await
            .unwrap();

        assert_eq!(storage.count(StorageOp::Start), 1, "len {}", len);
        assert_eq!(storage.count(StorageOp::Append), expected, "len {}", len);
        assert_eq!(storage.count(StorageOp::Finish), 1, "len {}", len);

        // Offsets are the cumulative bytes already sent
        let mut sent = DEFAULT_CHUNK_SIZE.min(len) as u64;
        for (offset, chunk) in appends(&storage) {
            assert_eq!(offset, sent);
            sent += chunk;
        }
        assert_eq!(sent, len as u64);
    }
}

#[tokio::test]
async fn test_track_recorded_only_after_finish() {
    let vault = Vault::signed_up().await;
    vault
        .storage
        .fail_on(StorageOp::Finish, 1, InjectedFailure::AuthExpired);

    let err = vault
        .operations()
        .upload_track("Song.m4a", audio(9, 2048), None, |_| {})
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::AuthExpired);
    assert!(vault.tracks.list_tracks(&vault.user).await.unwrap().is_empty());

    // The staged upload survives and completes on resume
    let recorded = vault.operations().resume_pending().await.unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].mime_type, "audio/mp4");
    assert_eq!(vault.tracks.list_tracks(&vault.user).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_backend_offset_mismatch_is_protocol_error() {
    let (storage, uploader) = uploader();
    let dest = RemotePath::parse("/x.mp3").unwrap();
    let blob = vec![3u8; DEFAULT_CHUNK_SIZE + 10];
    uploader
        .upload(&blob, &dest, &NoCheckpoint, |_| {})
        .await
        .unwrap();

    // Reusing a finished session is rejected by the backend
    let session_id = storage
        .calls()
        .into_iter()
        .find_map(|c| match c {
            StorageCall::Append { session_id, .. } => Some(session_id),
            _ => None,
        })
        .unwrap();
    let stale = soundvault_vault::UploadCheckpoint {
        cursor: soundvault_storage::UploadCursor::new(session_id, DEFAULT_CHUNK_SIZE as u64),
        dest,
        total_size: blob.len() as u64,
    };
    let err = uploader
        .resume(&blob, &stale, &NoCheckpoint, |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
    assert_eq!(err.code(), ErrorCode::ProtocolError);
}

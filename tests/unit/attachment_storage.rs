use mailbridge::prelude::{AttachmentError, AttachmentStore};

#[tokio::test]
async fn round_trips_and_deletes_a_blob() {
    let dir = tempfile::tempdir().unwrap();
    let store = AttachmentStore::new(dir.path());

    store.write("invoice-key", b"pdf bytes").await.unwrap();
    assert_eq!(store.read("invoice-key").await.unwrap(), b"pdf bytes");

    store.delete("invoice-key").await.unwrap();
    let err = store.read("invoice-key").await.unwrap_err();
    assert!(matches!(err, AttachmentError::NotFound(_)));
}

#[tokio::test]
async fn rejects_keys_that_traverse_out_of_the_root() {
    let dir = tempfile::tempdir().unwrap();
    let store = AttachmentStore::new(dir.path());

    let err = store.write("../escape", b"x").await.unwrap_err();
    assert!(matches!(err, AttachmentError::PathTraversal));
}

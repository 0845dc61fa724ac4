use std::time::Duration;

use mailbridge::prelude::HotCache;

#[tokio::test]
async fn entries_expire_after_their_ttl() {
    let cache = HotCache::new();
    cache.set("k", &"v".to_string(), Duration::from_millis(20));
    assert_eq!(cache.get::<String>("k"), Some("v".to_string()));

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(cache.get::<String>("k"), None);
}

#[test]
fn message_invalidation_clears_both_object_and_list_keys() {
    let cache = HotCache::new();
    let obj_key = HotCache::mail_obj_key("alice", "uid-1-Inbox");
    let list_key = HotCache::list_key("alice", "Inbox", "primary");

    cache.set_no_ttl(obj_key.clone(), &"cached".to_string());
    cache.set_no_ttl(list_key.clone(), &vec!["uid-1-Inbox".to_string()]);

    cache.invalidate_message("alice", "uid-1-Inbox", "Inbox");

    assert!(!cache.contains(&obj_key));
    assert!(!cache.contains(&list_key));
}

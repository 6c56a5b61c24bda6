//! Consumer acquisition against a relay and a live publisher.

use std::sync::Arc;
use std::time::Duration;

use blogmesh_client::{AcquireOptions, BlogClient, BlogState};
use blogmesh_metrics::SyncMetrics;
use blogmesh_store::{BlobStore, LogStore, MemoryNetwork, MemoryNode};
use blogmesh_sync::{ContentPinner, ReplicationTracker, RetryPolicy};
use blogmesh_types::LogAddress;
use bytes::Bytes;
use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

fn consumer(node: &MemoryNode, options: AcquireOptions) -> Arc<BlogClient> {
    let client = BlogClient::new(options, Arc::new(SyncMetrics::new()));
    client.initialize(Arc::new(node.clone()), Arc::new(node.clone()));
    Arc::new(client)
}

fn quick() -> AcquireOptions {
    AcquireOptions {
        poll_interval: Duration::from_millis(20),
        max_wait: Some(Duration::from_secs(5)),
    }
}

async fn wait_for(
    rx: &mut watch::Receiver<Option<BlogState>>,
    mut done: impl FnMut(&BlogState) -> bool,
) -> BlogState {
    let state = tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|s| s.as_ref().is_some_and(&mut done)),
    )
    .await
    .expect("state never arrived")
    .expect("observers dropped");
    state.clone().unwrap()
}

#[tokio::test]
async fn consumer_reads_blog_through_relay() {
    let net = MemoryNetwork::new();
    let publisher = net.join();
    let settings = publisher.create("settings").await.unwrap();
    let posts = publisher.create("posts").await.unwrap();
    settings.put("blogName", json!("B")).await.unwrap();
    settings.put("blogDescription", json!("D")).await.unwrap();
    settings
        .put("postsDBAddress", json!(posts.address().to_string()))
        .await
        .unwrap();
    posts
        .put("p1", json!({"_id": "p1", "title": "T"}))
        .await
        .unwrap();

    let relay = net.join();
    let metrics = Arc::new(SyncMetrics::new());
    let pinner = ContentPinner::new(Arc::new(relay.clone()), metrics.clone(), RetryPolicy::default());
    let tracker = ReplicationTracker::new(Arc::new(relay.clone()), pinner, metrics, None);
    tracker.open(settings.address(), None).await.unwrap();
    for _ in 0..200 {
        if tracker.state(posts.address()).is_some_and(|s| s.is_active()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    publisher.set_online(false);

    let client = consumer(&net.join(), quick());
    let state = client.switch_to_remote(settings.address(), None).await.unwrap();
    assert_eq!(state.settings.name, "B");
    assert_eq!(state.settings.description, "D");
    let post = state.post("p1").unwrap();
    assert_eq!(post.title(), Some("T"));
    assert!(state.comments.is_empty());
    assert_eq!(client.observers().current(), Some(state));
}

#[tokio::test(start_paused = true)]
async fn blog_is_published_only_when_complete() {
    let net = MemoryNetwork::new();
    let publisher = net.join();
    let settings = publisher.create("settings").await.unwrap();
    settings.put("blogName", json!("B")).await.unwrap();

    let client = consumer(&net.join(), AcquireOptions::default());
    let mut rx = client.subscribe();
    let task = {
        let client = client.clone();
        let address = settings.address().clone();
        tokio::spawn(async move { client.switch_to_remote(&address, None).await })
    };

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!task.is_finished());
    settings.put("blogDescription", json!("D")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!task.is_finished());
    assert!(rx.borrow_and_update().is_none());

    let posts = publisher.create("posts").await.unwrap();
    posts
        .put("p1", json!({"_id": "p1", "title": "T"}))
        .await
        .unwrap();
    settings
        .put("postsDBAddress", json!(posts.address().to_string()))
        .await
        .unwrap();

    let state = task.await.unwrap().unwrap();
    assert_eq!(state.settings.posts_address, *posts.address());
    assert_eq!(state.posts.len(), 1);
    rx.changed().await.unwrap();
    let published = rx.borrow().clone().unwrap();
    assert_eq!(published.settings.name, "B");
    assert_eq!(published.settings.description, "D");
}

#[tokio::test]
async fn follow_republishes_updates() {
    let net = MemoryNetwork::new();
    let publisher = net.join();
    let settings = publisher.create("settings").await.unwrap();
    let posts = publisher.create("posts").await.unwrap();
    settings.put("blogName", json!("B")).await.unwrap();
    settings.put("blogDescription", json!("D")).await.unwrap();
    settings
        .put("postsDBAddress", json!(posts.address().to_string()))
        .await
        .unwrap();

    let client = consumer(&net.join(), quick());
    let mut rx = client.subscribe();
    let cancel = CancellationToken::new();
    let follower = {
        let client = client.clone();
        let address = settings.address().clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { client.follow(&address, &cancel).await })
    };
    wait_for(&mut rx, |s| s.posts.is_empty()).await;

    posts
        .put("p1", json!({"_id": "p1", "title": "T"}))
        .await
        .unwrap();
    let state = wait_for(&mut rx, |s| s.posts.len() == 1).await;
    assert_eq!(state.posts[0].id, "p1");

    // A media log added later is picked up and watched too.
    let media = publisher.create("media").await.unwrap();
    let cid = publisher.add(Bytes::from_static(b"pic")).await.unwrap();
    settings
        .put("mediaDBAddress", json!(media.address().to_string()))
        .await
        .unwrap();
    wait_for(&mut rx, |s| s.settings.media_address.is_some()).await;
    media
        .put(
            "m1",
            json!({"id": "m1", "cid": cid.to_string(), "name": "pic", "size": 3, "type": "image/png"}),
        )
        .await
        .unwrap();
    let state = wait_for(&mut rx, |s| s.media.len() == 1).await;
    assert_eq!(state.media[0].cid, cid.to_string());
    assert_eq!(
        client.fetch_media(&cid).await.unwrap(),
        Bytes::from_static(b"pic")
    );

    cancel.cancel();
    follower.await.unwrap().unwrap();
}

#[tokio::test]
async fn switching_blogs_clears_previous_state() {
    let net = MemoryNetwork::new();
    let publisher = net.join();
    let first = publisher.create("settings").await.unwrap();
    let posts = publisher.create("posts").await.unwrap();
    for (key, value) in [
        ("blogName", json!("First")),
        ("blogDescription", json!("D")),
        ("postsDBAddress", json!(posts.address().to_string())),
    ] {
        first.put(key, value).await.unwrap();
    }

    let client = consumer(&net.join(), quick());
    client.switch_to_remote(first.address(), None).await.unwrap();
    assert!(client.observers().current().is_some());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let missing = LogAddress::mint("blogmesh", b"elsewhere");
    assert!(client.switch_to_remote(&missing, Some(&cancel)).await.is_err());
    assert!(client.observers().current().is_none());
}

#[tokio::test]
async fn unreachable_optional_logs_do_not_block() {
    let net = MemoryNetwork::new();
    let publisher = net.join();
    let other = net.join();
    let settings = publisher.create("settings").await.unwrap();
    let posts = publisher.create("posts").await.unwrap();
    let comments = other.create("comments").await.unwrap();
    other.set_online(false);
    for (key, value) in [
        ("blogName", json!("B")),
        ("blogDescription", json!("D")),
        ("postsDBAddress", json!(posts.address().to_string())),
        ("commentsDBAddress", json!(comments.address().to_string())),
    ] {
        settings.put(key, value).await.unwrap();
    }

    let node = net.join();
    let client = consumer(&node, quick());
    let state = client.switch_to_remote(settings.address(), None).await.unwrap();
    assert!(state.comments.is_empty());
    assert_eq!(state.settings.comments_address, Some(comments.address().clone()));
    assert!(node.open(comments.address()).await.is_err());
    assert!(node.fetch(&blogmesh_types::Cid::for_bytes(b"none")).await.is_err());
}

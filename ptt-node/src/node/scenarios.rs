//! Multi-node runs inside one process: every node listens on loopback with
//! its own store and talks to the others over real peer links.
use std::future::Future;
use std::time::Duration;

use ptt_protocol::oplog::cbor_decode;
use ptt_protocol::{JoinKind, PttID, Status};

use super::Node;
use crate::config::Config;
use crate::entity::{EntityHandle, EntityType};
use crate::me::WEIGHT_DESKTOP;
use crate::service::board::{article_block_list, article_list, ArticleBlock, CommentType, DEFAULT_DELETED_COMMENT};
use crate::service::friend::FriendBody;
use crate::service::me_domain::my_node_list;

const PATIENCE: Duration = Duration::from_secs(30);

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + PATIENCE;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn start(name: &str) -> Node {
    Node::start(Config::ephemeral(name)).await.unwrap()
}

fn board_on(node: &Node, id: &PttID) -> Option<EntityHandle> {
    node.entity_of(id, EntityType::Board).ok()
}

async fn blocks_of(board: &EntityHandle, article_id: PttID) -> Option<Vec<ArticleBlock>> {
    board
        .query(move |engine| article_block_list(&*engine, &article_id).ok())
        .await
        .ok()
        .flatten()
}

async fn alive_nodes(node: &Node) -> usize {
    match node.me() {
        Ok(me) => me
            .query(|engine| my_node_list(&*engine).iter().filter(|n| n.status.is_alive()).count())
            .await
            .unwrap_or(0),
        Err(_) => 0,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_node_profile() {
    let t0 = start("t0").await;
    let me = t0.me().unwrap();
    let record = me.query(|engine| engine.record().clone()).await.unwrap();
    assert_eq!(record.status, Status::Alive);
    assert_eq!(t0.raft().status().conf.total_weight(), WEIGHT_DESKTOP);
    assert_eq!(me.query(|engine| engine.opkey_infos()).await.unwrap().len(), 1);

    let boards = t0.entities(EntityType::Board);
    assert_eq!(boards.len(), 1);
    let board = boards[0].query(|engine| engine.record().clone()).await.unwrap();
    assert_eq!(board.status, Status::Alive);
    assert_eq!(board.id, t0.me_body().await.unwrap().board_id);
    t0.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_node_friendship() {
    let t0 = start("t0").await;
    let t1 = start("t1").await;
    let url = t1.join_url(JoinKind::Friend, t1.me_id(), "t1".into()).unwrap();
    let outcome = t0.join_friend(&url.encode().unwrap()).await.unwrap();

    for (node, other) in [(&t0, &t1), (&t1, &t0)] {
        let friends = node.entities(EntityType::Friend);
        assert_eq!(friends.len(), 1);
        assert_eq!(friends[0].id(), outcome.entity_id);
        let record = friends[0].query(|engine| engine.record().clone()).await.unwrap();
        assert_eq!(record.status, Status::Alive);
        let body: FriendBody = cbor_decode(&record.body).unwrap();
        assert_eq!(body.other(&node.keys().user_id()), Some(other.keys().user_id()));
    }

    // t0's personal board is readable on t1
    let board_id = t0.me_body().await.unwrap().board_id;
    let article = t0
        .create_article(&board_id, "hi".into(), vec![b"first".to_vec(), b"second".to_vec()], vec![])
        .await
        .unwrap();
    let local = blocks_of(&board_on(&t0, &board_id).unwrap(), article.obj_id).await.unwrap();
    eventually("the article on t1", || async {
        let Some(board) = board_on(&t1, &board_id) else {
            return false;
        };
        match blocks_of(&board, article.obj_id).await {
            Some(remote) => remote.iter().map(|b| &b.buf).eq(local.iter().map(|b| &b.buf)),
            None => false,
        }
    })
    .await;

    // and messages flow both ways
    let message = t1.create_message(&outcome.entity_id, vec![b"hello".to_vec()]).await.unwrap();
    let friend = t0.entity_of(&outcome.entity_id, EntityType::Friend).unwrap();
    eventually("the message on t0", || async {
        let id = message.obj_id;
        friend
            .query(move |engine| engine.object_list().any(|o| o.id == id))
            .await
            .unwrap_or(false)
    })
    .await;

    t0.shutdown().await;
    t1.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_node_board_join() {
    let t0 = start("t0").await;
    let t1 = start("t1").await;
    let t2 = start("t2").await;
    let board_id = t0.create_board("標題1".into(), true).await.unwrap();
    let url = t0
        .join_url(JoinKind::Board, board_id, "標題1".into())
        .unwrap()
        .encode()
        .unwrap();
    t1.join_board(&url).await.unwrap();
    t2.join_board(&url).await.unwrap();

    let nodes = [&t0, &t1, &t2];
    for (node, want) in [(&t0, 2), (&t1, 1), (&t2, 1)] {
        let board = board_on(node, &board_id).unwrap();
        eventually("peer counts", || async {
            board.count_peers().await.map(|c| c.total() == want).unwrap_or(false)
        })
        .await;
    }

    let members = |node: &Node| {
        let board = board_on(node, &board_id).unwrap();
        async move {
            board
                .query(|engine| {
                    let mut ids: Vec<PttID> = engine.membership().members().iter().map(|m| m.id).collect();
                    ids.sort();
                    ids
                })
                .await
                .unwrap_or_default()
        }
    };
    eventually("an agreed member list", || async {
        let a = members(&t0).await;
        a.len() == 3 && a == members(&t1).await && a == members(&t2).await
    })
    .await;

    // a member's article reaches everyone once a master co-signed it
    let article = t1
        .create_article(&board_id, "from t1".into(), vec![b"x".to_vec()], vec![])
        .await
        .unwrap();
    eventually("the article everywhere", || async {
        for node in nodes {
            let board = board_on(node, &board_id).unwrap();
            match blocks_of(&board, article.obj_id).await {
                Some(blocks) if blocks.first().map(|b| b.buf.clone()) == Some(vec![b"x".to_vec()]) => {}
                _ => return false,
            }
        }
        true
    })
    .await;

    for node in nodes {
        node.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_comment_keeps_slot() {
    let t0 = start("t0").await;
    let board_id = t0.me_body().await.unwrap().board_id;
    let article = t0
        .create_article(&board_id, "a".into(), vec![b"body".to_vec()], vec![])
        .await
        .unwrap();
    let article_id = article.obj_id;
    let push = t0
        .create_comment(&board_id, article_id, CommentType::Push, b"+".to_vec(), None)
        .await
        .unwrap();
    t0.create_comment(&board_id, article_id, CommentType::Boo, b"-".to_vec(), None)
        .await
        .unwrap();
    t0.delete_comment(&board_id, push.obj_id).await.unwrap();

    let board = board_on(&t0, &board_id).unwrap();
    let blocks = blocks_of(&board, article_id).await.unwrap();
    assert_eq!(blocks.len(), 3);
    let slot = blocks.iter().find(|b| b.ref_id == push.obj_id).unwrap();
    assert_eq!(slot.status, Status::Deleted);
    assert_eq!(slot.comment_type, CommentType::Push);
    assert_eq!(slot.buf, vec![DEFAULT_DELETED_COMMENT.to_vec()]);

    let view = board.query(|engine| article_list(&*engine)).await.unwrap();
    assert_eq!((view[0].n_push, view[0].n_boo), (0, 1));
    t0.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_opkey_expiry_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        data_dir: Some(dir.path().to_path_buf()),
        expire_oplog_secs: 300,
        ..Config::ephemeral("t0")
    };
    let t0 = Node::start(config.clone()).await.unwrap();
    let me_id = t0.me_id();
    let keys = t0.me().unwrap().query(|engine| engine.opkey_infos()).await.unwrap();
    assert_eq!(keys.len(), 1);
    t0.shutdown().await;
    drop(t0);

    let later = Config {
        offset_second: 8 * 86_400,
        ..config
    };
    let t0 = Node::start(later).await.unwrap();
    assert_eq!(t0.me_id(), me_id);
    let me = t0.me().unwrap();
    eventually("the expired key to be deleted", || async {
        let history = me.query(|engine| engine.opkey_history()).await.unwrap_or_default();
        history.iter().any(|k| k.id == keys[0].id && k.status == Status::Deleted)
    })
    .await;
    assert!(me.query(|engine| engine.opkey_infos()).await.unwrap().is_empty());
    t0.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multi_device_join_me() {
    let t0 = start("t0").await;
    let t1 = start("t1").await;
    let legacy = t0.me_id();
    let me_id = t1.me_id();
    let url = t1.join_url(JoinKind::Me, me_id, "t1".into()).unwrap().encode().unwrap();
    let my_key = t1.keys().user().my_key();
    let outcome = t0.join_me(&url, &my_key).await.unwrap();
    assert_eq!(outcome.entity_id, me_id);
    assert_eq!(t0.me_id(), me_id);

    for node in [&t0, &t1] {
        eventually("two alive devices", || async { alive_nodes(node).await == 2 }).await;
    }
    let old = t0.entity_of(&legacy, EntityType::Me).unwrap();
    let record = old.query(|engine| engine.record().clone()).await.unwrap();
    assert_eq!(record.status, Status::Migrated);
    assert_eq!(record.owner_ids, vec![me_id, legacy]);

    eventually("a two-voter group", || async {
        t1.raft().status().conf.len() == 2 && t0.raft().status().lead.is_some()
    })
    .await;
    let status = t0.request_raft_lead().await.unwrap();
    assert_eq!(status.conf_view().lead, t0.node_id().raft_id());
    eventually("t0 to lead", || async { t0.is_leader() && !t1.is_leader() }).await;

    let status = t1.request_raft_lead().await.unwrap();
    assert_eq!(status.conf_view().lead, t1.node_id().raft_id());

    t0.shutdown().await;
    t1.shutdown().await;
}

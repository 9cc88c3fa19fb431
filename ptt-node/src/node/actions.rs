//! Writes issued by the RPC surface.
//!
//! Each action resolves the entity it writes to, submits one domain oplog on
//! its worker and, where the action creates something a user would look for
//! later, records a PttOplog event on the Me.
use ptt_protocol::oplog::{cbor_encode, Category, DeleteMemberData, MemberOp, Oplog};
use ptt_protocol::PttID;

use super::{Node, NodeError, Result};
use crate::entity::{EntityError, EntityType};
use crate::me::RaftStatus;
use crate::service;
use crate::service::board::{
    self, ArticleData, BoardBody, BoardOp, BoardType, CommentData, CommentType, MediaData, TitleData,
};
use crate::service::friend::{FriendOp, MessageData};
use crate::service::profile::{self, ImgType, UserImgData, UserNameData, UserOp};
use crate::service::ptt_oplog::PttOp;

/// `(type, width, height)` read from the image header; unknown formats
/// keep a zero size.
fn sniff_image(img: &[u8]) -> (ImgType, u16, u16) {
    let be16 = |at: usize| img.get(at..at + 2).map(|b| u16::from_be_bytes([b[0], b[1]]));
    let le16 = |at: usize| img.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]));
    if img.starts_with(&[0x89, b'P', b'N', b'G']) {
        // IHDR width and height are u32 BE at 16 and 20
        let w = img.get(16..20).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]));
        let h = img.get(20..24).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]));
        let clamp = |v: Option<u32>| v.map(|v| v.min(u16::MAX as u32) as u16).unwrap_or(0);
        return (ImgType::Png, clamp(w), clamp(h));
    }
    if img.starts_with(b"GIF8") {
        return (ImgType::Gif, le16(6).unwrap_or(0), le16(8).unwrap_or(0));
    }
    if img.starts_with(&[0xff, 0xd8]) {
        // walk segments up to the first start-of-frame
        let mut at = 2;
        while let (Some(&0xff), Some(&marker)) = (img.get(at), img.get(at + 1)) {
            if (0xc0..=0xc3).contains(&marker) {
                return (ImgType::Jpeg, be16(at + 7).unwrap_or(0), be16(at + 5).unwrap_or(0));
            }
            let Some(len) = be16(at + 2) else { break };
            at += 2 + len as usize;
        }
        return (ImgType::Jpeg, 0, 0);
    }
    (ImgType::Unknown, 0, 0)
}

impl Node {
    // ─── Boards ──────────────────────────────────────────────────────────────

    /// `content_createBoard`: a new board with this user as its master.
    ///
    /// Private boards are joined by invitation; personal ones are open to
    /// reading but only masters post.
    pub async fn create_board(&self, title: String, private: bool) -> Result<PttID> {
        let board_type = if private { BoardType::Private } else { BoardType::Personal };
        let user = self.keys().user();
        let board_id = PttID::new_under(&user.id);
        let mut engine = self.open_engine(board_id, EntityType::Board)?;
        engine.bootstrap(
            &user,
            vec![user.id],
            service::encode_body(&BoardBody {
                title: title.clone(),
                board_type,
            })?,
        )?;
        engine.submit(
            Category::Board,
            BoardOp::SetTitle as u32,
            board::title_id(&board_id),
            cbor_encode(&TitleData { title })?,
        )?;
        self.host(engine, None)?;
        self.record_event(PttOp::CreateBoard, board_id, None).await;
        Ok(board_id)
    }

    pub async fn set_title(&self, board_id: &PttID, title: String) -> Result<Oplog> {
        let handle = self.entity_of(board_id, EntityType::Board)?;
        Ok(handle
            .submit(
                Category::Board,
                BoardOp::SetTitle as u32,
                board::title_id(board_id),
                cbor_encode(&TitleData { title })?,
            )
            .await?)
    }

    pub async fn create_article(
        &self,
        board_id: &PttID,
        title: String,
        lines: Vec<Vec<u8>>,
        media_ids: Vec<PttID>,
    ) -> Result<Oplog> {
        let handle = self.entity_of(board_id, EntityType::Board)?;
        let article_id = PttID::new_under(board_id);
        let data = cbor_encode(&ArticleData { title, lines, media_ids })?;
        let oplog = handle
            .submit(Category::Board, BoardOp::CreateArticle as u32, article_id, data)
            .await?;
        self.record_event(PttOp::CreateArticle, *board_id, Some(article_id)).await;
        Ok(oplog)
    }

    pub async fn update_article(
        &self,
        board_id: &PttID,
        article_id: PttID,
        title: String,
        lines: Vec<Vec<u8>>,
        media_ids: Vec<PttID>,
    ) -> Result<Oplog> {
        let handle = self.entity_of(board_id, EntityType::Board)?;
        let data = cbor_encode(&ArticleData { title, lines, media_ids })?;
        Ok(handle
            .submit(Category::Board, BoardOp::UpdateArticle as u32, article_id, data)
            .await?)
    }

    pub async fn delete_article(&self, board_id: &PttID, article_id: PttID) -> Result<Oplog> {
        let handle = self.entity_of(board_id, EntityType::Board)?;
        Ok(handle
            .submit(Category::Board, BoardOp::DeleteArticle as u32, article_id, Vec::new())
            .await?)
    }

    pub async fn create_comment(
        &self,
        board_id: &PttID,
        article_id: PttID,
        comment_type: CommentType,
        line: Vec<u8>,
        media_id: Option<PttID>,
    ) -> Result<Oplog> {
        let handle = self.entity_of(board_id, EntityType::Board)?;
        let comment_id = PttID::new_under(board_id);
        let data = cbor_encode(&CommentData {
            article_id,
            comment_type,
            line,
            media_id,
        })?;
        let oplog = handle
            .submit(Category::Board, BoardOp::CreateComment as u32, comment_id, data)
            .await?;
        self.record_event(PttOp::CreateComment, *board_id, Some(comment_id)).await;
        Ok(oplog)
    }

    pub async fn delete_comment(&self, board_id: &PttID, comment_id: PttID) -> Result<Oplog> {
        let handle = self.entity_of(board_id, EntityType::Board)?;
        Ok(handle
            .submit(Category::Board, BoardOp::DeleteComment as u32, comment_id, Vec::new())
            .await?)
    }

    /// `content_uploadFile`.
    pub async fn upload_media(&self, board_id: &PttID, media_type: String, data: Vec<u8>) -> Result<Oplog> {
        let handle = self.entity_of(board_id, EntityType::Board)?;
        let media_id = PttID::new_under(board_id);
        let data = cbor_encode(&MediaData { media_type, data })?;
        Ok(handle
            .submit(Category::Board, BoardOp::CreateMedia as u32, media_id, data)
            .await?)
    }

    // ─── Friends ─────────────────────────────────────────────────────────────

    pub async fn create_message(&self, friend_id: &PttID, lines: Vec<Vec<u8>>) -> Result<Oplog> {
        let handle = self.entity_of(friend_id, EntityType::Friend)?;
        let message_id = PttID::new_under(friend_id);
        let oplog = handle
            .submit(
                Category::Friend,
                FriendOp::CreateMessage as u32,
                message_id,
                cbor_encode(&MessageData { lines })?,
            )
            .await?;
        self.record_event(PttOp::CreateMessage, *friend_id, Some(message_id)).await;
        Ok(oplog)
    }

    // ─── Profile ─────────────────────────────────────────────────────────────

    pub async fn set_my_name(&self, name: Vec<u8>) -> Result<Oplog> {
        let handle = self.profile().await?;
        let profile_id = handle.id();
        Ok(handle
            .submit(
                Category::User,
                UserOp::SetUserName as u32,
                profile::user_name_id(&profile_id),
                cbor_encode(&UserNameData { name })?,
            )
            .await?)
    }

    pub async fn set_my_image(&self, img: Vec<u8>) -> Result<Oplog> {
        let (img_type, width, height) = sniff_image(&img);
        let handle = self.profile().await?;
        let profile_id = handle.id();
        Ok(handle
            .submit(
                Category::User,
                UserOp::SetUserImg as u32,
                profile::user_img_id(&profile_id),
                cbor_encode(&UserImgData {
                    img_type,
                    width,
                    height,
                    img,
                })?,
            )
            .await?)
    }

    // ─── Membership and keys ─────────────────────────────────────────────────

    /// `content_deleteMember` / `account_deleteMember`.
    ///
    /// Masters delete anyone; a member only deletes itself.
    pub async fn delete_member(&self, entity_id: &PttID, member_id: PttID) -> Result<Oplog> {
        let handle = self.entity(entity_id)?;
        let allowed = handle
            .query(move |engine| {
                engine.local_master().is_some() || engine.local_member().is_some_and(|k| k.id == member_id)
            })
            .await?;
        if !allowed {
            return Err(EntityError::NotMaster.into());
        }
        Ok(handle
            .submit(
                Category::Member,
                MemberOp::DeleteMember as u32,
                member_id,
                cbor_encode(&DeleteMemberData { member_id })?,
            )
            .await?)
    }

    /// `me_revokeOpKey`: end our OpKey `hash` on whichever entity holds it.
    pub async fn revoke_opkey(&self, hash: [u8; 32]) -> Result<Vec<Oplog>> {
        let wanted = hex::encode(hash);
        let mut revoked = Vec::new();
        for handle in self.registry().handles() {
            let wanted = wanted.clone();
            let holds = handle
                .query(move |engine| engine.opkey_infos().iter().any(|k| k.hash == wanted))
                .await?;
            if holds {
                revoked.push(handle.write(move |engine| engine.revoke_opkey(&hash)).await?);
            }
        }
        if revoked.is_empty() {
            return Err(NodeError::NotFound(format!("opkey {wanted}")));
        }
        Ok(revoked)
    }

    /// `me_requestRaftLead`.
    pub async fn request_raft_lead(&self) -> Result<RaftStatus> {
        Ok(self.raft().request_lead().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::service::board::{article_block_list, article_list};
    use ptt_protocol::Status;

    #[test]
    fn test_sniff_image() {
        let mut png = vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
        png.extend_from_slice(&[0, 0, 0, 13]);
        png.extend_from_slice(b"IHDR");
        png.extend_from_slice(&64u32.to_be_bytes());
        png.extend_from_slice(&32u32.to_be_bytes());
        assert_eq!(sniff_image(&png), (ImgType::Png, 64, 32));

        let mut gif = b"GIF89a".to_vec();
        gif.extend_from_slice(&[10, 0, 20, 0]);
        assert_eq!(sniff_image(&gif), (ImgType::Gif, 10, 20));

        // SOI, APP0 of 4 bytes, SOF0 with height 7 and width 9
        let jpeg = [0xff, 0xd8, 0xff, 0xe0, 0, 4, 0, 0, 0xff, 0xc0, 0, 11, 8, 0, 7, 0, 9];
        assert_eq!(sniff_image(&jpeg), (ImgType::Jpeg, 9, 7));

        assert_eq!(sniff_image(b"plain"), (ImgType::Unknown, 0, 0));
    }

    #[tokio::test]
    async fn test_board_round() {
        let node = Node::start(Config::ephemeral("t0")).await.unwrap();
        let board_id = node.create_board("title".into(), true).await.unwrap();
        let created = node
            .create_article(&board_id, "a".into(), vec![b"line 1".to_vec(), b"line 2".to_vec()], vec![])
            .await
            .unwrap();
        let article_id = created.obj_id;
        let comment = node
            .create_comment(&board_id, article_id, CommentType::Push, b"+1".to_vec(), None)
            .await
            .unwrap();

        let board = node.entity_of(&board_id, EntityType::Board).unwrap();
        let blocks = board
            .query(move |engine| article_block_list(&*engine, &article_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].buf, vec![b"line 1".to_vec(), b"line 2".to_vec()]);
        assert_eq!(blocks[1].buf, vec![b"+1".to_vec()]);

        node.delete_comment(&board_id, comment.obj_id).await.unwrap();
        node.delete_article(&board_id, article_id).await.unwrap();
        let articles = board.query(|engine| article_list(&*engine)).await.unwrap();
        assert!(articles.is_empty());
        let status = board
            .query(move |engine| engine.object_list().find(|o| o.id == article_id).map(|o| o.status))
            .await
            .unwrap();
        assert_eq!(status, Some(Status::Deleted));

        assert!(matches!(
            node.set_title(&PttID::random(), "x".into()).await,
            Err(NodeError::NotFound(_))
        ));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_revoke_unknown_opkey() {
        let node = Node::start(Config::ephemeral("t0")).await.unwrap();
        assert!(matches!(node.revoke_opkey([7u8; 32]).await, Err(NodeError::NotFound(_))));
        node.set_my_name(b"alice".to_vec()).await.unwrap();
        node.shutdown().await;
    }
}

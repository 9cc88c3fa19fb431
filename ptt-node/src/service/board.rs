/// Board: title, articles, comments and media.
///
/// Articles and comments are separate objects; a comment points at its
/// article through `parent_id`. An article's block list is the article's own
/// lines followed by one slot per comment, in comment creation order. Push
/// and boo counts are computed from live comments at query time.
use serde::{Deserialize, Serialize};

use ptt_protocol::oplog::{Category, Oplog};
use ptt_protocol::{PttID, Status, Timestamp};

use super::blocks::{make_blocks, split_bytes};
use super::{
    apply_delete, encode_body, require_alive, Applied, DecodeEntry, Object, ObjectKind,
    ObjectSource, Result, ServiceError,
};

/// Buffer shown in place of a deleted comment.
pub const DEFAULT_DELETED_COMMENT: &[u8] = b"(this comment has been deleted)";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BoardOp {
    SetTitle = 1,
    CreateArticle = 2,
    UpdateArticle = 3,
    DeleteArticle = 4,
    CreateComment = 5,
    DeleteComment = 6,
    CreateMedia = 7,
    DeleteMedia = 8,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BoardType {
    Personal = 1,
    Private = 2,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommentType {
    None = 0,
    Push = 1,
    Boo = 2,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ContentType {
    Article = 0,
    Comment = 1,
}

// ---------------------------------------------------------------------------
// Payloads and bodies
// ---------------------------------------------------------------------------

/// Creation payload carried in the board's `CreateEntity`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BoardBody {
    pub title: String,
    pub board_type: BoardType,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TitleData {
    pub title: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ArticleData {
    pub title: String,
    pub lines: Vec<Vec<u8>>,
    pub media_ids: Vec<PttID>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ArticleBody {
    pub title: String,
    pub media_ids: Vec<PttID>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CommentData {
    pub article_id: PttID,
    pub comment_type: CommentType,
    pub line: Vec<u8>,
    pub media_id: Option<PttID>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CommentBody {
    pub comment_type: CommentType,
    pub media_id: Option<PttID>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MediaData {
    pub media_type: String,
    pub data: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MediaBody {
    pub media_type: String,
    pub size: u64,
}

/// Title object of a board.
pub fn title_id(board_id: &PttID) -> PttID {
    let hash = blake3::hash(&[b"ptt-board-title".as_slice(), board_id.as_bytes()].concat());
    let mut postfix = [0u8; 16];
    postfix.copy_from_slice(&hash.as_bytes()[..16]);
    PttID::from_parts(board_id.addr(), postfix)
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

fn apply_set_title(prev: Option<&Object>, oplog: &Oplog) -> Result<Applied> {
    let data: TitleData = oplog.decode_data()?;
    let body = encode_body(&data)?;
    let object = match prev {
        Some(prev) => {
            let mut next = require_alive(Some(prev))?.updated(oplog);
            next.body = body;
            next
        }
        None => Object::created(oplog, ObjectKind::Title, body),
    };
    Ok(Applied::object(object))
}

fn apply_create_article(_prev: Option<&Object>, oplog: &Oplog) -> Result<Applied> {
    let data: ArticleData = oplog.decode_data()?;
    let blocks = make_blocks(&oplog.obj_id, &oplog.id, &data.lines)?;
    let mut object = Object::created(
        oplog,
        ObjectKind::Article,
        encode_body(&ArticleBody {
            title: data.title,
            media_ids: data.media_ids,
        })?,
    );
    object.blocks = blocks.iter().map(|b| b.to_ref()).collect();
    Ok(Applied { object, blocks })
}

fn apply_update_article(prev: Option<&Object>, oplog: &Oplog) -> Result<Applied> {
    let prev = require_alive(prev)?;
    if prev.creator_id != oplog.creator_id {
        return Err(ServiceError::Payload("only the author updates an article".into()));
    }
    let data: ArticleData = oplog.decode_data()?;
    let blocks = make_blocks(&oplog.obj_id, &oplog.id, &data.lines)?;
    let mut object = prev.updated(oplog);
    object.body = encode_body(&ArticleBody {
        title: data.title,
        media_ids: data.media_ids,
    })?;
    object.blocks = blocks.iter().map(|b| b.to_ref()).collect();
    Ok(Applied { object, blocks })
}

fn apply_create_comment(_prev: Option<&Object>, oplog: &Oplog) -> Result<Applied> {
    let data: CommentData = oplog.decode_data()?;
    let blocks = make_blocks(&oplog.obj_id, &oplog.id, &[data.line])?;
    let mut object = Object::created(
        oplog,
        ObjectKind::Comment,
        encode_body(&CommentBody {
            comment_type: data.comment_type,
            media_id: data.media_id,
        })?,
    );
    object.parent_id = Some(data.article_id);
    object.blocks = blocks.iter().map(|b| b.to_ref()).collect();
    Ok(Applied { object, blocks })
}

fn apply_create_media(_prev: Option<&Object>, oplog: &Oplog) -> Result<Applied> {
    let data: MediaData = oplog.decode_data()?;
    let blocks = make_blocks(&oplog.obj_id, &oplog.id, &split_bytes(&data.data))?;
    let mut object = Object::created(
        oplog,
        ObjectKind::Media,
        encode_body(&MediaBody {
            media_type: data.media_type,
            size: data.data.len() as u64,
        })?,
    );
    object.blocks = blocks.iter().map(|b| b.to_ref()).collect();
    Ok(Applied { object, blocks })
}

fn apply_delete_own(prev: Option<&Object>, oplog: &Oplog) -> Result<Applied> {
    if let Some(prev) = prev {
        if prev.creator_id != oplog.creator_id {
            return Err(ServiceError::Payload("only the author deletes".into()));
        }
    }
    apply_delete(prev, oplog)
}

pub static TABLE: &[DecodeEntry] = &[
    DecodeEntry {
        category: Category::Board,
        op: BoardOp::SetTitle as u32,
        name: "SetTitle",
        creates: true,
        apply: apply_set_title,
    },
    DecodeEntry {
        category: Category::Board,
        op: BoardOp::CreateArticle as u32,
        name: "CreateArticle",
        creates: true,
        apply: apply_create_article,
    },
    DecodeEntry {
        category: Category::Board,
        op: BoardOp::UpdateArticle as u32,
        name: "UpdateArticle",
        creates: false,
        apply: apply_update_article,
    },
    DecodeEntry {
        category: Category::Board,
        op: BoardOp::DeleteArticle as u32,
        name: "DeleteArticle",
        creates: false,
        apply: apply_delete_own,
    },
    DecodeEntry {
        category: Category::Board,
        op: BoardOp::CreateComment as u32,
        name: "CreateComment",
        creates: true,
        apply: apply_create_comment,
    },
    DecodeEntry {
        category: Category::Board,
        op: BoardOp::DeleteComment as u32,
        name: "DeleteComment",
        creates: false,
        apply: apply_delete_own,
    },
    DecodeEntry {
        category: Category::Board,
        op: BoardOp::CreateMedia as u32,
        name: "CreateMedia",
        creates: true,
        apply: apply_create_media,
    },
    DecodeEntry {
        category: Category::Board,
        op: BoardOp::DeleteMedia as u32,
        name: "DeleteMedia",
        creates: false,
        apply: apply_delete_own,
    },
];

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ArticleView {
    #[serde(rename = "ID")]
    pub id: PttID,
    #[serde(rename = "CreateTS")]
    pub create_ts: Timestamp,
    #[serde(rename = "UpdateTS")]
    pub update_ts: Timestamp,
    #[serde(rename = "CreatorID")]
    pub creator_id: PttID,
    #[serde(rename = "BoardID")]
    pub board_id: PttID,
    #[serde(rename = "ContentBlockID")]
    pub content_block_id: Option<PttID>,
    #[serde(rename = "NBlock")]
    pub n_block: usize,
    #[serde(rename = "NP")]
    pub n_push: usize,
    #[serde(rename = "NB")]
    pub n_boo: usize,
    pub title: String,
    #[serde(rename = "c")]
    pub comment_create_ts: Timestamp,
    #[serde(rename = "S")]
    pub status: Status,
}

/// One slot of an article's block list.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ArticleBlock {
    #[serde(rename = "ArticleID")]
    pub article_id: PttID,
    /// The article for content slots, the comment for comment slots.
    #[serde(rename = "RefID")]
    pub ref_id: PttID,
    pub content_type: ContentType,
    pub comment_type: CommentType,
    #[serde(rename = "BlockID")]
    pub block_id: u32,
    pub status: Status,
    #[serde(rename = "CreateTS")]
    pub create_ts: Timestamp,
    #[serde(rename = "UpdateTS")]
    pub update_ts: Timestamp,
    #[serde(rename = "CreatorID")]
    pub creator_id: PttID,
    pub buf: Vec<Vec<u8>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct MediaView {
    #[serde(rename = "ID")]
    pub id: PttID,
    #[serde(rename = "BoardID")]
    pub board_id: PttID,
    #[serde(rename = "T")]
    pub media_type: String,
    pub size: u64,
}

fn comments_of(src: &dyn ObjectSource, article_id: &PttID) -> Vec<Object> {
    let mut comments: Vec<Object> = src
        .objects(ObjectKind::Comment)
        .into_iter()
        .filter(|c| c.parent_id.as_ref() == Some(article_id))
        .collect();
    comments.sort_by(|a, b| (a.create_ts, a.id).cmp(&(b.create_ts, b.id)));
    comments
}

fn comment_type(comment: &Object) -> CommentType {
    comment
        .decode_body::<CommentBody>()
        .map(|b| b.comment_type)
        .unwrap_or(CommentType::None)
}

pub fn article_view(src: &dyn ObjectSource, article: &Object) -> ArticleView {
    let comments = comments_of(src, &article.id);
    let live = comments.iter().filter(|c| c.is_alive());
    let (mut n_push, mut n_boo) = (0, 0);
    for comment in live {
        match comment_type(comment) {
            CommentType::Push => n_push += 1,
            CommentType::Boo => n_boo += 1,
            CommentType::None => {}
        }
    }
    let comment_create_ts = comments
        .iter()
        .map(|c| c.create_ts)
        .max()
        .unwrap_or(article.update_ts)
        .max(article.update_ts);
    let title = article
        .decode_body::<ArticleBody>()
        .map(|b| b.title)
        .unwrap_or_default();
    ArticleView {
        id: article.id,
        create_ts: article.create_ts,
        update_ts: article.update_ts,
        creator_id: article.creator_id,
        board_id: article.entity_id,
        content_block_id: article.blocks.first().map(|b| b.id),
        n_block: article.blocks.len(),
        n_push,
        n_boo,
        title,
        comment_create_ts,
        status: article.status,
    }
}

/// Articles, oldest first; deleted ones are left out.
pub fn article_list(src: &dyn ObjectSource) -> Vec<ArticleView> {
    let mut articles: Vec<Object> = src
        .objects(ObjectKind::Article)
        .into_iter()
        .filter(|a| a.is_alive())
        .collect();
    articles.sort_by(|a, b| (a.create_ts, a.id).cmp(&(b.create_ts, b.id)));
    articles.iter().map(|a| article_view(src, a)).collect()
}

/// Article lines then one slot per comment.
pub fn article_block_list(src: &dyn ObjectSource, article_id: &PttID) -> Result<Vec<ArticleBlock>> {
    let article = src
        .object(article_id)
        .filter(|a| a.kind == ObjectKind::Article)
        .ok_or_else(|| ServiceError::NotFound(article_id.to_string()))?;

    let mut out = Vec::new();
    for (i, block) in article.blocks.iter().enumerate() {
        out.push(ArticleBlock {
            article_id: article.id,
            ref_id: article.id,
            content_type: ContentType::Article,
            comment_type: CommentType::None,
            block_id: i as u32,
            status: article.status,
            create_ts: article.create_ts,
            update_ts: article.update_ts,
            creator_id: article.creator_id,
            buf: src.block_lines(&article.id, block)?,
        });
    }
    for (i, comment) in comments_of(src, &article.id).iter().enumerate() {
        let buf = if comment.is_alive() {
            match comment.blocks.first() {
                Some(block) => src.block_lines(&comment.id, block)?,
                None => Vec::new(),
            }
        } else {
            vec![DEFAULT_DELETED_COMMENT.to_vec()]
        };
        out.push(ArticleBlock {
            article_id: article.id,
            ref_id: comment.id,
            content_type: ContentType::Comment,
            comment_type: comment_type(comment),
            block_id: i as u32,
            status: comment.status,
            create_ts: comment.create_ts,
            update_ts: comment.update_ts,
            creator_id: comment.creator_id,
            buf,
        });
    }
    Ok(out)
}

/// Window of a block list starting at `(content_type, block_id)`.
///
/// `descending` walks backwards from the start slot.
pub fn page_blocks(
    blocks: Vec<ArticleBlock>,
    content_type: ContentType,
    block_id: u32,
    limit: usize,
    descending: bool,
) -> Vec<ArticleBlock> {
    let start = blocks
        .iter()
        .position(|b| b.content_type == content_type && b.block_id == block_id)
        .unwrap_or(0);
    let limit = if limit == 0 { blocks.len() } else { limit };
    if descending {
        let end = (start + 1).min(blocks.len());
        blocks[..end].iter().rev().take(limit).cloned().collect()
    } else {
        blocks.into_iter().skip(start).take(limit).collect()
    }
}

pub fn media_view(media: &Object) -> Option<MediaView> {
    let body: MediaBody = media.decode_body().ok()?;
    Some(MediaView {
        id: media.id,
        board_id: media.entity_id,
        media_type: body.media_type,
        size: body.size,
    })
}

use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::str::FromStr;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum VoteDirection {
    Up,
    Down,
}

impl VoteDirection {
    pub fn value(self) -> i64 {
        match self {
            Self::Up => 1,
            Self::Down => -1,
        }
    }
}

impl From<VoteDirection> for i64 {
    fn from(direction: VoteDirection) -> Self {
        direction.value()
    }
}

impl TryFrom<i64> for VoteDirection {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Up),
            -1 => Ok(Self::Down),
            other => Err(format!("vote direction must be 1 or -1, got {}", other)),
        }
    }
}

/// 某个用户在某个帖子上的一票
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    #[serde(rename = "user")]
    pub author_id: String,
    #[serde(rename = "vote")]
    pub direction: VoteDirection,
}

impl Vote {
    pub fn new(author_id: impl Into<String>, direction: VoteDirection) -> Self {
        Self {
            author_id: author_id.into(),
            direction,
        }
    }

    pub fn up(author_id: impl Into<String>) -> Self {
        Self::new(author_id, VoteDirection::Up)
    }

    pub fn down(author_id: impl Into<String>) -> Self {
        Self::new(author_id, VoteDirection::Down)
    }
}

/// 投票接口上的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteAction {
    Upvote,
    Downvote,
    Unvote,
}

impl FromStr for VoteAction {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upvote" => Ok(Self::Upvote),
            "downvote" => Ok(Self::Downvote),
            "unvote" => Ok(Self::Unvote),
            other => Err(AppError::UnsupportedVoteAction(other.to_string())),
        }
    }
}

impl VoteAction {
    /// `Unvote` 没有方向
    pub fn direction(self) -> Option<VoteDirection> {
        match self {
            Self::Upvote => Some(VoteDirection::Up),
            Self::Downvote => Some(VoteDirection::Down),
            Self::Unvote => None,
        }
    }
}

/// 从投票集合推导出的统计结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub upvotes: i64,
    pub downvotes: i64,
    pub score: i64,
    pub upvote_percentage: u8,
}

impl Tally {
    pub fn total(&self) -> i64 {
        self.upvotes + self.downvotes
    }
}

/// 单个帖子的投票账本，按用户 ID 唯一
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoteLedger {
    votes: Vec<Vote>,
}

impl VoteLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 重复投票覆盖原方向，不累加。账本有变化时返回 true
    pub fn cast(&mut self, vote: Vote) -> bool {
        match self.votes.iter_mut().find(|v| v.author_id == vote.author_id) {
            Some(existing) if existing.direction == vote.direction => false,
            Some(existing) => {
                existing.direction = vote.direction;
                true
            }
            None => {
                self.votes.push(vote);
                true
            }
        }
    }

    /// 该用户没有投过票时什么都不做
    pub fn retract(&mut self, author_id: &str) -> Option<Vote> {
        let idx = self.votes.iter().position(|v| v.author_id == author_id)?;
        Some(self.votes.remove(idx))
    }

    pub fn direction_of(&self, author_id: &str) -> Option<VoteDirection> {
        self.votes
            .iter()
            .find(|v| v.author_id == author_id)
            .map(|v| v.direction)
    }

    pub fn tally(&self) -> Tally {
        let upvotes = self
            .votes
            .iter()
            .filter(|v| v.direction == VoteDirection::Up)
            .count() as i64;
        let downvotes = self.votes.len() as i64 - upvotes;

        let mut tally = Tally {
            upvotes,
            downvotes,
            score: upvotes - downvotes,
            upvote_percentage: 0,
        };
        tally.upvote_percentage = upvote_percentage(upvotes, tally.total());
        tally
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    pub fn as_slice(&self) -> &[Vote] {
        &self.votes
    }

    pub fn to_vec(&self) -> Vec<Vote> {
        self.votes.clone()
    }
}

impl From<Vec<Vote>> for VoteLedger {
    fn from(votes: Vec<Vote>) -> Self {
        // 存储里读出来的数据也要保证每个用户只有一票，后出现的覆盖先出现的
        let mut ledger = Self::new();
        for vote in votes {
            ledger.cast(vote);
        }
        ledger
    }
}

/// 四舍五入的好评率；没有投票时为 0
pub fn upvote_percentage(upvotes: i64, total: i64) -> u8 {
    if total <= 0 {
        return 0;
    }
    let pct = (200 * upvotes + total) / (2 * total);
    pct.clamp(0, 100) as u8
}

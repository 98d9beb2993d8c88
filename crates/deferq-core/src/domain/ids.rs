//! ドメイン識別子
//!
//! # ジョブ ID とリース ID
//! - **JobId**: `"{job_type}:{entity_id}"` という決定的な文字列。同じエンティティに対する
//!   スケジュールは必ず同じ ID になるため、ストア側で重複排除（冪等な enqueue）ができる。
//! - **LeaseId**: ワーカーが 1 回の attempt のためにジョブを claim したときに払い出される ULID。
//!   ack / nack / discard はリース ID が一致する場合のみ受け付けられる。
//!
//! ## Phantom Type パターン
//! `Id<T>` は ULID を包むジェネリック型で、`T` は実行時には使わないマーカー型。
//! 別種の ID を取り違えるとコンパイルエラーになる。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

use super::JobType;

/// 各 ULID ベース ID のマーカー trait
pub trait IdMarker: Send + Sync + 'static {
    /// Display で使うプレフィックス（例: "lease-"）
    fn prefix() -> &'static str;
}

/// ULID ベースのジェネリック ID 型
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Lease のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Lease {}

impl IdMarker for Lease {
    fn prefix() -> &'static str {
        "lease-"
    }
}

pub type LeaseId = Id<Lease>;

/// 決定的なジョブ ID
///
/// 1 エンティティにつき 1 ジョブ種別あたり高々 1 つの未完了ジョブ、という不変条件を
/// ストアの一意キーで担保するためのもの。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn for_entity(job_type: JobType, entity_id: &str) -> Self {
        Self(format!("{}:{}", job_type.as_str(), entity_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

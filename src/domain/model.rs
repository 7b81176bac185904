use serde::{Deserialize, Serialize};
use std::fmt;

/// 訊息識別碼。同一個 runtime 內可能被重複使用，不保證在傳遞中唯一
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 一則輸出所承接的輸入
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub id: MessageId,
    /// 為 false 時，同一個輸入之後還會有其他輸出
    pub last: bool,
}

impl Claim {
    pub fn new(id: MessageId, last: bool) -> Self {
        Self { id, last }
    }
}

/// 輸出訊息與產生它的輸入之間的關係
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provenance {
    /// 一進一出，沿用輸入的識別碼
    Direct,
    /// 一個輸入產生多個輸出之一；`last` 標示最後一個
    Split { last: bool },
    /// 明確列出承接的輸入；訊息本身的識別碼不參與對應
    Merged(Vec<Claim>),
}

impl Provenance {
    /// 展開成 claim 列表，`id` 為訊息本身的識別碼
    pub fn claims(&self, id: MessageId) -> Vec<Claim> {
        match self {
            Self::Direct => vec![Claim::new(id, true)],
            Self::Split { last } => vec![Claim::new(id, *last)],
            Self::Merged(claims) => claims.clone(),
        }
    }

    /// 同一個輸入拆成多個輸出時，各輸出的 provenance
    pub fn split(&self, last: bool) -> Self {
        match self {
            Self::Direct => Self::Split { last },
            Self::Split { last: inherited } => Self::Split {
                last: *inherited && last,
            },
            Self::Merged(claims) if last => Self::Merged(claims.clone()),
            Self::Merged(claims) => Self::Merged(
                claims.iter().map(|c| Claim::new(c.id, false)).collect(),
            ),
        }
    }
}

/// 在 stage 之間傳遞的訊息
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    id: MessageId,
    provenance: Provenance,
    payload: T,
}

impl<T> Envelope<T> {
    pub fn new(id: MessageId, payload: T) -> Self {
        Self::with_provenance(id, Provenance::Direct, payload)
    }

    pub fn with_provenance(id: MessageId, provenance: Provenance, payload: T) -> Self {
        Self {
            id,
            provenance,
            payload,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }

    pub fn into_parts(self) -> (MessageId, Provenance, T) {
        (self.id, self.provenance, self.payload)
    }

    /// 替換識別碼，其餘不變
    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self
    }
}

/// `offer` 的結果；未被接受的訊息會交還給呼叫端
#[derive(Debug)]
pub enum OfferStatus<T> {
    Accepted,
    Declined(Envelope<T>),
    Postponed(Envelope<T>),
}

impl<T> OfferStatus<T> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkOptions {
    pub propagate_completion: bool,
}

impl LinkOptions {
    pub fn propagate() -> Self {
        Self {
            propagate_completion: true,
        }
    }
}

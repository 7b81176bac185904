use crate::domain::model::{MessageId, Provenance};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// 一則正在被計時的訊息
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub started: Instant,
    /// 進入計時範圍前的識別碼
    pub origin: MessageId,
    /// 進入計時範圍前的 provenance
    pub provenance: Provenance,
}

impl LedgerEntry {
    /// 離開計時範圍時應帶回的 provenance；`last` 為 false 表示同一輸入還有後續輸出
    pub fn restored(&self, last: bool) -> Provenance {
        if last {
            self.provenance.clone()
        } else {
            self.provenance.split(false)
        }
    }
}

/// 進入計時範圍的訊息依序取得唯一的序號，離開時以序號找回開始時間
///
/// 可同時由多個 task 存取。序號重複或查無序號都代表訊息身分在中途被破壞，
/// 屬於程式錯誤，直接 panic。
#[derive(Debug, Default)]
pub struct CorrelationLedger {
    sequence: AtomicU64,
    entries: DashMap<MessageId, LedgerEntry>,
}

impl CorrelationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登記一則訊息並回傳新的序號（從 1 開始）
    pub fn admit(&self, origin: MessageId, provenance: Provenance) -> MessageId {
        let seq = MessageId(self.sequence.fetch_add(1, Ordering::Relaxed) + 1);
        let entry = LedgerEntry {
            started: Instant::now(),
            origin,
            provenance,
        };
        if self.entries.insert(seq, entry).is_some() {
            panic!("correlation ledger: sequence {} issued twice", seq);
        }
        seq
    }

    /// 查詢但不移除
    pub fn peek(&self, seq: MessageId) -> LedgerEntry {
        match self.entries.get(&seq) {
            Some(entry) => entry.clone(),
            None => panic!("correlation ledger: unknown sequence {}", seq),
        }
    }

    /// 移除並回傳
    pub fn settle(&self, seq: MessageId) -> LedgerEntry {
        match self.try_settle(seq) {
            Some(entry) => entry,
            None => panic!("correlation ledger: unknown sequence {}", seq),
        }
    }

    pub fn try_settle(&self, seq: MessageId) -> Option<LedgerEntry> {
        self.entries.remove(&seq).map(|(_, entry)| entry)
    }

    /// 目前仍在計時範圍內的訊息數
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 至今發出的序號數
    pub fn issued(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_admit_and_settle() {
        let ledger = CorrelationLedger::new();
        let seq = ledger.admit(MessageId(42), Provenance::Direct);
        assert_eq!(seq, MessageId(1));
        assert_eq!(ledger.peek(seq).origin, MessageId(42));
        assert_eq!(ledger.len(), 1);

        let entry = ledger.settle(seq);
        assert_eq!(entry.origin, MessageId(42));
        assert!(ledger.is_empty());
        assert_eq!(ledger.issued(), 1);
    }

    #[test]
    fn test_restored_provenance_keeps_pending_split() {
        let ledger = CorrelationLedger::new();
        let seq = ledger.admit(MessageId(7), Provenance::Split { last: true });
        let entry = ledger.settle(seq);
        assert_eq!(entry.restored(true), Provenance::Split { last: true });
        assert_eq!(entry.restored(false), Provenance::Split { last: false });

        let seq = ledger.admit(MessageId(8), Provenance::Direct);
        assert_eq!(ledger.peek(seq).restored(false), Provenance::Split { last: false });
    }

    #[test]
    #[should_panic(expected = "unknown sequence")]
    fn test_settle_unknown_panics() {
        let ledger = CorrelationLedger::new();
        ledger.settle(MessageId(5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admissions_are_unique() {
        let ledger = Arc::new(CorrelationLedger::new());
        let mut handles = Vec::new();
        for task in 0..8u64 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                (0..100u64)
                    .map(|i| ledger.admit(MessageId(task * 100 + i), Provenance::Direct))
                    .collect::<Vec<_>>()
            }));
        }

        let mut all = HashSet::new();
        for handle in handles {
            for seq in handle.await.unwrap() {
                assert!(all.insert(seq));
            }
        }
        assert_eq!(all.len(), 800);
        assert_eq!(ledger.len(), 800);
    }
}

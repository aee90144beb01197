/// Cache of query results held by outer layers; discarded on logout.
pub trait QueryCache: Send + Sync {
    fn get(&self, key: &str) -> Option<serde_json::Value>;
    fn put(&self, key: &str, value: serde_json::Value);
    /// Advanced by every `clear`.
    fn epoch(&self) -> u64;
    /// Stores `value` only if the cache has not been cleared since `epoch`
    /// was read. Returns whether it was stored.
    fn put_in_epoch(&self, key: &str, value: serde_json::Value, epoch: u64) -> bool;
    fn invalidate(&self, key: &str);
    fn clear(&self);
}

use rand::Rng;

pub type TaskId = String;
pub type BlobId = String;

/// Correlates a request with its response on one connection.
pub type RpcId = i64;

/// A fresh random identifier (32 lowercase hex digits) for tasks and blobs.
pub fn new_id() -> String {
    let mut rng = ::rand::thread_rng();
    let bits: u128 = rng.gen();
    format!("{:032x}", bits)
}

/// Identifiers become directory names on workers, so they must be a single path component.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id != "deleting"
        && id.len() <= 255
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ids_are_valid_and_distinct() {
        let a = new_id();
        let b = new_id();
        assert_eq!(a.len(), 32);
        assert!(is_valid_id(&a));
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_path_like_ids() {
        assert!(is_valid_id("abc123"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id(".."));
        assert!(!is_valid_id("deleting"));
        assert!(!is_valid_id("a/b"));
        assert!(!is_valid_id("x y"));
    }
}

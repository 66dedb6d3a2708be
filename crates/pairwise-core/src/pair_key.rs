//! Canonical, order-independent keys for candidate duplicate pairs.

/// Separator between the two members of a pair key.
pub const PAIR_KEY_SEPARATOR: char = '|';

/// Build the canonical key for the unordered pair `(a, b)`.
///
/// Members are trimmed and ordered lexically, so `pair_key(a, b) ==
/// pair_key(b, a)` for every input.
pub fn pair_key(a: &str, b: &str) -> String {
    let a = a.trim();
    let b = b.trim();
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}{PAIR_KEY_SEPARATOR}{hi}")
}

/// Split a pair key back into its ordered members.
pub fn split_pair_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(PAIR_KEY_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_key_is_symmetric() {
        let ids = ["", "a", "b", "0b6f", "f-1", "f-10", "F-1", "ä", " x "];
        for a in ids {
            for b in ids {
                assert_eq!(pair_key(a, b), pair_key(b, a), "a={a:?} b={b:?}");
            }
        }
    }

    #[test]
    fn test_pair_key_orders_lexically() {
        assert_eq!(pair_key("b", "a"), "a|b");
        assert_eq!(pair_key("f-2", "f-10"), "f-10|f-2");
    }

    #[test]
    fn test_pair_key_trims_members() {
        assert_eq!(pair_key(" a ", "b"), pair_key("a", " b"));
    }

    #[test]
    fn test_split_pair_key() {
        let key = pair_key("z", "y");
        assert_eq!(split_pair_key(&key), Some(("y", "z")));
        assert_eq!(split_pair_key("nokey"), None);
    }
}

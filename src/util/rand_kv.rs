use bytes::Bytes;
use rand::{distr::Alphanumeric, Rng};

pub fn get_test_key(i: usize) -> Bytes {
  Bytes::from(std::format!("logkv-key-{:09}", i))
}

/// A value tagged with `i` plus a random tail.
pub fn get_test_value(i: usize) -> Bytes {
  let tail: String = rand::rng()
    .sample_iter(&Alphanumeric)
    .take(48)
    .map(char::from)
    .collect();
  Bytes::from(std::format!("logkv-value-{:09}-{}", i, tail))
}

#[test]
fn test_get_test_key_value() {
  for i in 0..=10 {
    assert!(!get_test_key(i).is_empty());
    assert!(get_test_value(i).len() > 48);
  }
  assert_eq!(get_test_key(7), Bytes::from("logkv-key-000000007"));
  assert_ne!(get_test_value(7), get_test_value(7));
}

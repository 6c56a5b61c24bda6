use std::collections::BTreeMap;

use blogmesh_types::{LogRecord, Op};
use serde_json::Value;

/// Materialize records into a key -> value view.
///
/// Records are applied in `(clock, identity)` order so every replica holding
/// the same set of records produces the same view, regardless of the order
/// in which they arrived.
pub fn materialize(records: &[LogRecord]) -> BTreeMap<String, Value> {
    let mut ordered: Vec<&LogRecord> = records.iter().collect();
    ordered.sort_by(|a, b| (a.clock, &a.identity).cmp(&(b.clock, &b.identity)));

    let mut view = BTreeMap::new();
    for record in ordered {
        match record.op {
            Op::Put => {
                view.insert(record.key.clone(), record.value.clone());
            }
            Op::Del => {
                view.remove(&record.key);
            }
        }
    }
    view
}

#[cfg(test)]
mod tests {
    use super::*;
    use blogmesh_types::PublicKeyRef;
    use serde_json::json;

    fn rec(key: &str, value: Value, op: Op, clock: u64, author: u8) -> LogRecord {
        LogRecord {
            key: key.into(),
            value,
            op,
            identity: PublicKeyRef::from_bytes(&[author; 32]),
            clock,
            signature: String::new(),
        }
    }

    #[test]
    fn later_clock_wins() {
        let records = vec![
            rec("k", json!("new"), Op::Put, 2, 1),
            rec("k", json!("old"), Op::Put, 1, 1),
        ];
        assert_eq!(materialize(&records)["k"], json!("new"));
    }

    #[test]
    fn delete_removes_key() {
        let records = vec![
            rec("k", json!("v"), Op::Put, 1, 1),
            rec("k", Value::Null, Op::Del, 2, 1),
        ];
        assert!(materialize(&records).is_empty());
    }

    #[test]
    fn order_of_arrival_does_not_matter() {
        let a = rec("k", json!("a"), Op::Put, 3, 1);
        let b = rec("k", json!("b"), Op::Put, 3, 2);
        let one = materialize(&[a.clone(), b.clone()]);
        let two = materialize(&[b, a]);
        assert_eq!(one, two);
        assert_eq!(one["k"], json!("b"));
    }
}

//! RFC 7386 merge-patch computation.

use serde_json::{Map, Value};

/// Merge patch turning `base` into `target`.
///
/// Keys missing from `target` become `null` (removal), objects recurse, and
/// arrays or scalars that differ are replaced wholesale. Returns `None` when
/// the two documents are equal.
pub fn diff(base: &Value, target: &Value) -> Option<Value> {
    if base == target {
        return None;
    }
    match (base, target) {
        (Value::Object(bo), Value::Object(to)) => {
            let mut patch = Map::new();
            for (k, tv) in to.iter() {
                match bo.get(k) {
                    Some(bv) => {
                        if let Some(p) = diff(bv, tv) {
                            patch.insert(k.clone(), p);
                        }
                    }
                    None => {
                        patch.insert(k.clone(), tv.clone());
                    }
                }
            }
            for k in bo.keys() {
                if !to.contains_key(k) {
                    patch.insert(k.clone(), Value::Null);
                }
            }
            if patch.is_empty() { None } else { Some(Value::Object(patch)) }
        }
        (_, tv) => Some(tv.clone()),
    }
}

/// Apply a merge patch in place.
pub fn apply(doc: &mut Value, patch: &Value) { json_patch::merge(doc, patch) }

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equal_documents_have_no_patch() {
        let v = json!({"phase": "Ready", "conditions": [{"type": "A"}]});
        assert_eq!(diff(&v, &v), None);
    }

    #[test]
    fn diff_covers_adds_updates_removes() {
        let base = json!({
            "phase": "Initialization",
            "image": "old",
            "nested": {"x": 1, "y": 2},
            "list": [1, 2, 3]
        });
        let target = json!({
            "phase": "Ready",
            "nested": {"x": 1, "y": 3},
            "list": [1, 9],
            "digest": "vabc"
        });
        let p = diff(&base, &target).unwrap();
        assert_eq!(
            p,
            json!({
                "phase": "Ready",
                "image": null,
                "nested": {"y": 3},
                "list": [1, 9],
                "digest": "vabc"
            })
        );
        let mut applied = base.clone();
        apply(&mut applied, &p);
        assert_eq!(applied, target);
    }

    #[test]
    fn null_base_yields_whole_target() {
        let target = json!({"phase": ""});
        assert_eq!(diff(&Value::Null, &target), Some(target));
    }
}

//! JSON merge patches (RFC 7386).

use serde_json::Value;

/// Apply a merge patch to `target` in place.
///
/// Object members merge recursively and `null` removes a member; any other
/// patch value replaces the target outright.
pub fn merge(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    let Value::Object(target_map) = target else {
        return;
    };

    for (key, value) in patch_map {
        if value.is_null() {
            target_map.remove(key);
        } else {
            merge(target_map.entry(key.clone()).or_insert(Value::Null), value);
        }
    }
}

/// Fold `next` into `first`, producing one patch with the effect of
/// applying `first` then `next`.
///
/// Unlike [`merge`], `null` members of `next` are kept so they still delete
/// when the combined patch is applied.
pub fn compose(first: &mut Value, next: &Value) {
    let Value::Object(next_map) = next else {
        *first = next.clone();
        return;
    };
    let Value::Object(first_map) = first else {
        merge(first, next);
        return;
    };

    for (key, value) in next_map {
        match first_map.get_mut(key) {
            Some(existing) if value.is_object() => compose(existing, value),
            _ => {
                first_map.insert(key.clone(), value.clone());
            }
        }
    }
}

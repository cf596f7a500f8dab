use std::fmt::Write;

use crate::wal::record::LabelSet;

/// Label carrying a per-entry tenant override. Never sent as a stream label.
pub const RESERVED_LABEL_TENANT_ID: &str = "__tenant_id__";

/// Stable string form of a label set, e.g. `{app="api", env="prod"}`.
///
/// Used as the stream key inside a batch. Reserved labels are left out so
/// they never split streams or leak into the payload.
pub fn labels_key(labels: &LabelSet) -> String {
    let mut out = String::with_capacity(labels.len() * 16 + 2);
    out.push('{');
    let mut first = true;
    for (name, value) in labels {
        if name == RESERVED_LABEL_TENANT_ID {
            continue;
        }
        if !first {
            out.push_str(", ");
        }
        first = false;
        let _ = write!(out, "{}=\"{}\"", name, escape(value));
    }
    out.push('}');
    out
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Adds `external` labels the entry doesn't already carry. Entry labels win.
pub fn merge_external(external: &LabelSet, labels: &LabelSet) -> LabelSet {
    let mut merged = external.clone();
    merged.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Tenant for an entry: the reserved label if present, else `default`.
pub fn tenant_id<'a>(labels: &'a LabelSet, default: &'a str) -> &'a str {
    labels
        .get(RESERVED_LABEL_TENANT_ID)
        .map(String::as_str)
        .unwrap_or(default)
}

/// Labels as sent on the wire, without reserved labels.
pub fn without_reserved(labels: &LabelSet) -> LabelSet {
    labels
        .iter()
        .filter(|(name, _)| name.as_str() != RESERVED_LABEL_TENANT_ID)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_labels_key_is_sorted_and_stable() {
        let a = labels(&[("env", "prod"), ("app", "api")]);
        let b = labels(&[("app", "api"), ("env", "prod")]);
        assert_eq!(labels_key(&a), r#"{app="api", env="prod"}"#);
        assert_eq!(labels_key(&a), labels_key(&b));
        assert_eq!(labels_key(&LabelSet::new()), "{}");
    }

    #[test]
    fn test_labels_key_escapes_values() {
        let l = labels(&[("msg", "say \"hi\"\\\n")]);
        assert_eq!(labels_key(&l), r#"{msg="say \"hi\"\\\n"}"#);
    }

    #[test]
    fn test_labels_key_skips_tenant() {
        let with_tenant = labels(&[("app", "api"), (RESERVED_LABEL_TENANT_ID, "t1")]);
        let without = labels(&[("app", "api")]);
        assert_eq!(labels_key(&with_tenant), labels_key(&without));
    }

    #[test]
    fn test_merge_external_entry_wins() {
        let external = labels(&[("cluster", "eu-1"), ("app", "external")]);
        let entry = labels(&[("app", "api")]);
        let merged = merge_external(&external, &entry);
        assert_eq!(merged, labels(&[("app", "api"), ("cluster", "eu-1")]));
    }

    #[test]
    fn test_tenant_resolution() {
        let with_tenant = labels(&[(RESERVED_LABEL_TENANT_ID, "team-a")]);
        assert_eq!(tenant_id(&with_tenant, "fallback"), "team-a");
        assert_eq!(tenant_id(&LabelSet::new(), "fallback"), "fallback");
        assert_eq!(tenant_id(&LabelSet::new(), ""), "");
    }

    #[test]
    fn test_without_reserved() {
        let l = labels(&[("app", "api"), (RESERVED_LABEL_TENANT_ID, "t1")]);
        assert_eq!(without_reserved(&l), labels(&[("app", "api")]));
    }
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::PatchError;

pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LabelSetError {
    #[error("desired label set must contain at least one label")]
    Empty,
    #[error("label key cannot be empty")]
    EmptyKey,
}

/// Labels the controller enforces. Built once at startup, read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DesiredLabels(Labels);

impl DesiredLabels {
    pub fn new(labels: Labels) -> Result<Self, LabelSetError> {
        if labels.is_empty() {
            return Err(LabelSetError::Empty);
        }
        if labels.keys().any(|k| k.is_empty()) {
            return Err(LabelSetError::EmptyKey);
        }
        Ok(Self(labels))
    }

    pub fn get(&self, key: &str) -> Option<&str> { self.0.get(key).map(|s| s.as_str()) }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> { self.0.iter() }
    pub fn as_map(&self) -> &Labels { &self.0 }
}

/// Subset of the desired labels that differ from what a resource carries. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelPatch(Labels);

#[derive(Serialize)]
struct MergeBody<'a> {
    metadata: MetadataPatch<'a>,
}

#[derive(Serialize)]
struct MetadataPatch<'a> {
    labels: &'a Labels,
}

impl LabelPatch {
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn get(&self, key: &str) -> Option<&str> { self.0.get(key).map(|s| s.as_str()) }
    pub fn as_map(&self) -> &Labels { &self.0 }
    pub fn into_inner(self) -> Labels { self.0 }

    /// JSON merge-patch body touching only `metadata.labels` entries in this patch.
    pub fn merge_body(&self) -> Result<serde_json::Value, PatchError> {
        Ok(serde_json::to_value(MergeBody { metadata: MetadataPatch { labels: &self.0 } })?)
    }
}

/// Entries of `desired` that are missing from `existing` or hold another value.
///
/// Labels present only in `existing` are left alone. Returns `None` when the
/// resource already carries every desired label, so callers can skip the remote
/// call entirely.
pub fn compute_label_patch(existing: Option<&Labels>, desired: &DesiredLabels) -> Option<LabelPatch> {
    let patch: Labels = desired
        .iter()
        .filter(|(k, v)| existing.and_then(|e| e.get(*k)) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if patch.is_empty() { None } else { Some(LabelPatch(patch)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn desired(pairs: &[(&str, &str)]) -> DesiredLabels {
        DesiredLabels::new(labels(pairs)).unwrap()
    }

    #[test]
    fn label_patch_cases() {
        let want = desired(&[("example.com/managed-by", "pod-labeller"), ("test-label", "test-value")]);
        let cases: Vec<(&str, Option<Labels>, Option<Labels>)> = vec![
            ("in-sync", Some(want.as_map().clone()), None),
            (
                "missing_label",
                Some(labels(&[("example.com/managed-by", "pod-labeller")])),
                Some(labels(&[("test-label", "test-value")])),
            ),
            (
                "incorrect_value",
                Some(labels(&[("example.com/managed-by", "pod-labeller"), ("test-label", "incorrect-value")])),
                Some(labels(&[("test-label", "test-value")])),
            ),
            ("nil_labels", None, Some(want.as_map().clone())),
            ("empty_labels", Some(Labels::new()), Some(want.as_map().clone())),
            (
                "multi_incorrect_value",
                Some(labels(&[("example.com/managed-by", "incorrect-value"), ("test-label", "incorrect-value")])),
                Some(want.as_map().clone()),
            ),
        ];
        for (name, existing, expected) in cases {
            let got = compute_label_patch(existing.as_ref(), &want).map(LabelPatch::into_inner);
            assert_eq!(got, expected, "case {name}");
        }
    }

    #[test]
    fn missing_labels_are_added() {
        let patch = compute_label_patch(None, &desired(&[("team", "a")])).unwrap();
        assert_eq!(patch.as_map(), &labels(&[("team", "a")]));
    }

    #[test]
    fn matching_labels_need_no_patch() {
        let d = desired(&[("team", "a"), ("env", "prod")]);
        let existing = labels(&[("team", "a"), ("env", "prod")]);
        assert_eq!(compute_label_patch(Some(&existing), &d), None);
    }

    #[test]
    fn unrelated_labels_are_never_in_the_patch() {
        let d = desired(&[("team", "a")]);
        let existing = labels(&[("team", "b"), ("app", "web"), ("tier", "front")]);
        let patch = compute_label_patch(Some(&existing), &d).unwrap();
        assert_eq!(patch.as_map(), &labels(&[("team", "a")]));
        assert!(patch.get("app").is_none());
    }

    #[test]
    fn diffing_a_set_against_itself_is_empty() {
        for pairs in [vec![("a", "")], vec![("a", "1"), ("b", "2"), ("c", "3")]] {
            let d = desired(&pairs);
            assert_eq!(compute_label_patch(Some(d.as_map()), &d), None);
        }
    }

    #[test]
    fn growing_desired_never_shrinks_the_patch() {
        let existing = labels(&[("team", "b"), ("env", "prod")]);
        let small = compute_label_patch(Some(&existing), &desired(&[("team", "a")])).unwrap();
        let big = compute_label_patch(Some(&existing), &desired(&[("team", "a"), ("env", "prod"), ("cost", "x")]))
            .unwrap();
        for (k, v) in small.as_map() {
            assert_eq!(big.get(k), Some(v.as_str()));
        }
        assert_eq!(big.len(), 2);
    }

    #[test]
    fn empty_value_is_distinct_from_absent() {
        let d = desired(&[("flag", "")]);
        assert!(compute_label_patch(Some(&Labels::new()), &d).is_some());
        assert!(compute_label_patch(Some(&labels(&[("flag", "")])), &d).is_none());
    }

    #[test]
    fn merge_body_only_names_patched_labels() {
        let patch = compute_label_patch(Some(&labels(&[("team", "a")])), &desired(&[("team", "a"), ("env", "prod")]))
            .unwrap();
        let body = patch.merge_body().unwrap();
        assert_eq!(body, serde_json::json!({ "metadata": { "labels": { "env": "prod" } } }));
    }

    #[test]
    fn desired_set_validation() {
        assert_eq!(DesiredLabels::new(Labels::new()).unwrap_err(), LabelSetError::Empty);
        assert_eq!(DesiredLabels::new(labels(&[("", "x")])).unwrap_err(), LabelSetError::EmptyKey);
    }
}

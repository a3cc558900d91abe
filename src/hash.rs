//! Stable content hash used as the policy identity.
//!
//! The hash is a 64-bit FNV-1a over a canonical byte encoding of the policy
//! document. The encoding goes through the policy's own serialization (which
//! omits the `$schema` annotation), so the YAML and JSON renderings of the
//! same logical policy hash identically. Object keys are written in sorted
//! order and all integers little-endian, keeping the digest independent of
//! source formatting and platform.

use std::hash::Hasher;

use fnv::FnvHasher;

use crate::policy::Policy;

pub fn policy_hash(policy: &Policy) -> u64 {
    let canonical =
        serde_json::to_value(policy).expect("policy serialization is infallible");
    let mut hasher = FnvHasher::default();
    write_value(&mut hasher, &canonical);
    hasher.finish()
}

fn write_value(h: &mut FnvHasher, v: &serde_json::Value) {
    match v {
        serde_json::Value::Null => h.write(&[0]),
        serde_json::Value::Bool(b) => {
            h.write(&[1, u8::from(*b)]);
        }
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                h.write(&[2]);
                h.write(&i.to_le_bytes());
            } else if let Some(u) = n.as_u64() {
                h.write(&[3]);
                h.write(&u.to_le_bytes());
            } else {
                h.write(&[4]);
                h.write(&n.as_f64().unwrap_or(f64::NAN).to_bits().to_le_bytes());
            }
        }
        serde_json::Value::String(s) => {
            h.write(&[5]);
            h.write(&(s.len() as u64).to_le_bytes());
            h.write(s.as_bytes());
        }
        serde_json::Value::Array(items) => {
            h.write(&[6]);
            h.write(&(items.len() as u64).to_le_bytes());
            for item in items {
                write_value(h, item);
            }
        }
        serde_json::Value::Object(fields) => {
            // serde_json::Map iterates in sorted key order
            h.write(&[7]);
            h.write(&(fields.len() as u64).to_le_bytes());
            for (key, value) in fields {
                h.write(&(key.len() as u64).to_le_bytes());
                h.write(key.as_bytes());
                write_value(h, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
apiVersion: api.cerbos.dev/v1
resourcePolicy:
  resource: album
  version: default
  rules:
    - actions: [view]
      effect: EFFECT_ALLOW
      roles: [owner]
"#;

    #[test]
    fn test_hash_is_stable() {
        let p: Policy = serde_yaml::from_str(YAML).unwrap();
        assert_eq!(policy_hash(&p), policy_hash(&p));
    }

    #[test]
    fn test_annotation_does_not_affect_hash() {
        let plain: Policy = serde_yaml::from_str(YAML).unwrap();
        let annotated: Policy = serde_yaml::from_str(&format!(
            "$schema: https://example.com/policy.schema.json\n{YAML}"
        ))
        .unwrap();
        assert_eq!(policy_hash(&plain), policy_hash(&annotated));
    }

    #[test]
    fn test_content_change_changes_hash() {
        let p1: Policy = serde_yaml::from_str(YAML).unwrap();
        let p2: Policy = serde_yaml::from_str(&YAML.replace("view", "edit")).unwrap();
        assert_ne!(policy_hash(&p1), policy_hash(&p2));
    }
}

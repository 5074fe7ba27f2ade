//! Proto <-> ChangeSet conversion.

use ocap_kernel::hashing::crank_hash;
use ocap_kernel::ChangeSet;

use crate::proto_types::{ProtoChange, ProtoCommit};

/// Wraps one commit's changes into a journal frame.
pub fn changes_to_proto(sequence: u64, changes: &ChangeSet) -> ProtoCommit {
    ProtoCommit {
        sequence,
        digest: crank_hash(changes),
        changes: changes
            .iter()
            .map(|(key, value)| ProtoChange { key: key.clone(), value: value.clone() })
            .collect(),
    }
}

/// Rebuilds the change set carried by a frame. Later duplicates of a key win.
pub fn proto_to_changes(proto: &ProtoCommit) -> ChangeSet {
    proto
        .changes
        .iter()
        .map(|c| (c.key.clone(), c.value.clone()))
        .collect()
}

/// True when the frame's digest matches its contents.
pub fn digest_matches(proto: &ProtoCommit) -> bool {
    crank_hash(&proto_to_changes(proto)) == proto.digest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_carries_deletions_and_digest() {
        let mut changes = ChangeSet::new();
        changes.insert("ko.1".into(), Some(b"{}".to_vec()));
        changes.insert("kp.2".into(), None);
        let proto = changes_to_proto(7, &changes);
        assert_eq!(proto.sequence, 7);
        assert_eq!(proto.changes[1].value, None);
        assert_eq!(proto_to_changes(&proto), changes);
        assert!(digest_matches(&proto));

        let mut tampered = proto.clone();
        tampered.changes[0].value = Some(b"[]".to_vec());
        assert!(!digest_matches(&tampered));
    }

    #[test]
    fn test_empty_value_is_not_a_deletion() {
        let mut changes = ChangeSet::new();
        changes.insert("vat.v1.vs.k".into(), Some(Vec::new()));
        let proto = changes_to_proto(1, &changes);
        let decoded = <ProtoCommit as prost::Message>::decode(prost::Message::encode_to_vec(&proto).as_slice()).unwrap();
        assert_eq!(proto_to_changes(&decoded), changes);
    }
}

use orderproof_core::B256;
use orderproof_verifier::{verify_proof_bundle, ProofBundleJson};
use std::path::PathBuf;

fn committed_vectors() -> (PathBuf, serde_json::Value) {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../docs/test_vectors.json");
    let bytes = std::fs::read(&path).expect("read committed vectors file");
    let committed = serde_json::from_slice(&bytes).expect("parse committed vectors JSON");
    (path, committed)
}

#[test]
fn vectors_match_committed_file() {
    let generated = orderproof_verifier::generate_vectors().expect("generate vectors");
    let (path, committed) = committed_vectors();

    assert_eq!(
        generated,
        committed,
        "Generated vectors differ from {}",
        path.display()
    );
}

#[test]
fn committed_proofs_verify_against_committed_root() {
    let (_, committed) = committed_vectors();
    let root: B256 = committed["tree"]["root"].as_str().unwrap().parse().unwrap();

    let proofs = committed["tree"]["proofs"].as_array().unwrap();
    assert_eq!(proofs.len(), 3);

    for proof in proofs {
        let bundle = ProofBundleJson {
            order_id: proof["orderId"].as_u64().unwrap(),
            digest: proof["digest"].as_str().unwrap().to_string(),
            merkle_root: root.to_string(),
            proof: serde_json::from_value(proof["siblings"].clone()).unwrap(),
            leaf_index: proof["leafIndex"].as_u64().unwrap() as usize,
        };
        assert_eq!(verify_proof_bundle(&bundle, Some(root)).unwrap(), root);
    }
}

//! Fuzz tests for the custody store
//!
//! Property-based testing of round trips, corruption detection and owner id
//! handling. Uses proptest for generating random inputs.

use keyshare_custody_core::{
    CustodyConfig, EncryptionKey, Error, KeyShareCustody, MemoryBackend, OwnerId, RecordBackend,
};
use proptest::prelude::*;
use serde_json::{Value, json};

// ============================================================================
// Strategies for generating test data
// ============================================================================

/// Generate a valid owner identifier
fn owner_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9_:/.@-]{1,64}").unwrap()
}

/// Generate an arbitrary JSON share payload
fn share_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[ -~]{0,32}".prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 32, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,8}", inner, 0..6)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn setup() -> KeyShareCustody<MemoryBackend> {
    KeyShareCustody::new(
        MemoryBackend::new(),
        CustodyConfig::new(EncryptionKey::generate()),
    )
    .unwrap()
}

// ============================================================================
// Round Trip Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any share comes back exactly as stored
    #[test]
    fn create_then_get_returns_share(id in owner_strategy(), share in share_strategy()) {
        let result: Option<Value> = runtime().block_on(async {
            let custody = setup();
            let owner = OwnerId::new(id).unwrap();
            custody.create(&owner, &share).await.unwrap();
            custody.get(&owner).await.unwrap()
        });
        prop_assert_eq!(result, Some(share));
    }

    /// The last update wins, and never a mixture of the two
    #[test]
    fn update_returns_latest(
        id in owner_strategy(),
        first in share_strategy(),
        second in share_strategy(),
    ) {
        let result: Option<Value> = runtime().block_on(async {
            let custody = setup();
            let owner = OwnerId::new(id).unwrap();
            custody.create(&owner, &first).await.unwrap();
            custody.update(&owner, &second).await.unwrap();
            custody.get(&owner).await.unwrap()
        });
        prop_assert_eq!(result, Some(second));
    }
}

// ============================================================================
// Corruption Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Flipping any bit of the stored envelope is detected on read
    #[test]
    fn any_flipped_bit_is_decryption_failure(
        share in share_strategy(),
        position in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let err = runtime().block_on(async {
            let custody = setup();
            let owner = OwnerId::new("profile-1").unwrap();
            custody.create(&owner, &share).await.unwrap();

            let stored = custody.backend().get(&owner).await.unwrap().unwrap();
            let mut corrupted = stored.ciphertext.clone();
            let i = position.index(corrupted.len());
            corrupted[i] ^= 1 << bit;
            custody
                .backend()
                .replace_if_unchanged(&owner, &stored.ciphertext, corrupted)
                .await
                .unwrap();

            custody.get::<Value>(&owner).await.unwrap_err()
        });
        let is_decryption_failure = matches!(err, Error::DecryptionFailure { .. });
        prop_assert!(is_decryption_failure, "unexpected error: {:?}", err);
    }

    /// Truncated envelopes never decrypt
    #[test]
    fn truncated_envelope_is_decryption_failure(cut in 0usize..64) {
        let err = runtime().block_on(async {
            let custody = setup();
            let owner = OwnerId::new("profile-1").unwrap();
            custody.create(&owner, &json!({ "x": 1 })).await.unwrap();

            let stored = custody.backend().get(&owner).await.unwrap().unwrap();
            let keep = cut.min(stored.ciphertext.len() - 1);
            let truncated = stored.ciphertext[..keep].to_vec();
            custody
                .backend()
                .replace_if_unchanged(&owner, &stored.ciphertext, truncated)
                .await
                .unwrap();

            custody.get::<Value>(&owner).await.unwrap_err()
        });
        let is_decryption_failure = matches!(err, Error::DecryptionFailure { .. });
        prop_assert!(is_decryption_failure);
    }
}

// ============================================================================
// Owner Id Properties
// ============================================================================

proptest! {
    /// Owner id parsing never panics and accepts exactly the documented set
    #[test]
    fn owner_id_never_panics(id in ".{0,300}") {
        let valid = !id.is_empty()
            && id.len() <= keyshare_custody_core::types::MAX_OWNER_ID_LEN
            && !id.chars().any(char::is_control);
        prop_assert_eq!(OwnerId::new(id).is_ok(), valid);
    }
}

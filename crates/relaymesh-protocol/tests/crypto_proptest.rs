use proptest::prelude::*;
use relaymesh_protocol::crypto;
use relaymesh_protocol::ProtocolError;

proptest! {
    /// Any payload survives the broadcast-key layer; ciphertext adds nonce and tag.
    #[test]
    fn anonymous_roundtrip(payload in prop::collection::vec(any::<u8>(), 0..20000)) {
        let key = crypto::generate_symmetric_key();
        let sealed = crypto::encrypt_anonymously(&payload, &key).expect("encrypt");
        prop_assert_eq!(sealed.len(), payload.len() + 24 + 16);
        let opened = crypto::decrypt_anonymously(&sealed, &key).expect("decrypt");
        prop_assert_eq!(opened, payload);
    }

    /// Sealed payloads open for the recipient and nobody else.
    #[test]
    fn sealed_roundtrip(payload in prop::collection::vec(any::<u8>(), 0..5000)) {
        let (private, public) = crypto::generate_encryption_keys();
        let (other_private, other_public) = crypto::generate_encryption_keys();
        let sealed = crypto::seal(&payload, &public).expect("seal");
        prop_assert_eq!(crypto::open_sealed(&sealed, &public, &private).expect("open"), payload);
        prop_assert!(crypto::open_sealed(&sealed, &other_public, &other_private).is_err());
    }

    /// Flipping any byte of a sealed payload is an integrity failure.
    #[test]
    fn sealed_tamper_detected(
        payload in prop::collection::vec(any::<u8>(), 1..512),
        position in any::<prop::sample::Index>(),
    ) {
        let (private, public) = crypto::generate_encryption_keys();
        let mut sealed = crypto::seal(&payload, &public).expect("seal");
        let i = position.index(sealed.len());
        sealed[i] ^= 0x01;
        let result = crypto::open_sealed(&sealed, &public, &private);
        prop_assert!(matches!(result, Err(ProtocolError::Integrity(_))));
    }

    /// Signatures validate and strip; a different key rejects them.
    #[test]
    fn signature_roundtrip(message in prop::collection::vec(any::<u8>(), 0..5000)) {
        let (private, public) = crypto::generate_signature_keys();
        let (_, other) = crypto::generate_signature_keys();
        let signed = crypto::sign_message(&message, &private);
        prop_assert_eq!(crypto::verify_message(&signed, &public).expect("verify"), message);
        prop_assert!(crypto::verify_message(&signed, &other).is_err());
    }

    /// Any truncation below the fixed overhead fails cleanly.
    #[test]
    fn undersized_inputs_fail(len in 0usize..40) {
        let key = crypto::generate_symmetric_key();
        let (private, public) = crypto::generate_encryption_keys();
        let (_, signature) = crypto::generate_signature_keys();
        let junk = vec![0x5a; len];
        prop_assert!(crypto::decrypt_anonymously(&junk, &key).is_err());
        prop_assert!(crypto::open_sealed(&junk, &public, &private).is_err());
        if len < 64 {
            prop_assert!(crypto::verify_message(&junk, &signature).is_err());
        }
    }
}

use groop_e2ee::crypto::{unwrap_group_key, wrap_associated_data, wrap_group_key};
use groop_e2ee::{E2eeError, GroupKey, KeyEnvelope, PrivateKey, WrappedKeyEnvelope};
use proptest::prelude::*;

proptest! {
    /// Any group key survives wrap→unwrap for its recipient.
    #[test]
    fn wrap_roundtrip(
        key_bytes in any::<[u8; 32]>(),
        group in "[a-z0-9-]{1,40}",
        epoch in any::<u32>(),
        recipient in "[a-z0-9]{1,20}",
    ) {
        let bob = PrivateKey::generate();
        let key = GroupKey::from_bytes(key_bytes);
        let context = wrap_associated_data(&group.as_str().into(), epoch, &recipient.as_str().into());

        let wrapped = wrap_group_key(&key, &bob.public_key(), &context).expect("wrap");
        let unwrapped = unwrap_group_key(&wrapped, &bob, &context).expect("unwrap");
        prop_assert_eq!(unwrapped, key);
    }

    /// A different keypair never unwraps.
    #[test]
    fn mismatched_keypair_rejected(key_bytes in any::<[u8; 32]>()) {
        let bob = PrivateKey::generate();
        let mallory = PrivateKey::generate();
        let context = wrap_associated_data(&"G1".into(), 0, &"bob".into());

        let wrapped = wrap_group_key(&GroupKey::from_bytes(key_bytes), &bob.public_key(), &context)
            .expect("wrap");
        prop_assert!(matches!(
            unwrap_group_key(&wrapped, &mallory, &context),
            Err(E2eeError::Authentication)
        ));
    }

    /// An envelope relabelled to another recipient does not open, even for
    /// the original recipient.
    #[test]
    fn relabelled_recipient_rejected(other in "[a-z]{1,12}") {
        prop_assume!(other != "bob");
        let bob = PrivateKey::generate();
        let mut envelope = WrappedKeyEnvelope::seal_for(
            &GroupKey::generate(),
            &"G1".into(),
            0,
            &"bob".into(),
            &bob.public_key(),
            &"alice".into(),
        )
        .expect("seal");
        envelope.recipient_id = other.as_str().into();
        prop_assert!(envelope.open(&bob).is_err());
    }

    /// Envelopes survive the store's MessagePack encoding.
    #[test]
    fn envelope_bytes_roundtrip(epoch in any::<u32>()) {
        let bob = PrivateKey::generate();
        let key = GroupKey::generate();
        let envelope = KeyEnvelope::Wrapped(
            WrappedKeyEnvelope::seal_for(
                &key,
                &"G1".into(),
                epoch,
                &"bob".into(),
                &bob.public_key(),
                &"alice".into(),
            )
            .expect("seal"),
        );

        let decoded = KeyEnvelope::from_bytes(&envelope.to_bytes().expect("encode")).expect("decode");
        let KeyEnvelope::Wrapped(wrapped) = &decoded;
        prop_assert_eq!(wrapped.open(&bob).expect("open"), key);
        prop_assert_eq!(decoded, envelope);
    }
}

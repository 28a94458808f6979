//! Integration tests for the signed records and wire framing exposed by
//! the public API: router contacts, introsets, ONS records, link frames.

use std::time::{SystemTime, UNIX_EPOCH};

use umbra::config::BootstrapPeer;
use umbra::identity::Keypair;
use umbra::keys::DhtKey;
use umbra::messages::{decode_frame, encode_frame, DhtMessage, LinkFrame};
use umbra::path::HopId;
use umbra::service::{
    is_valid_ons, EncryptedIntroSet, EncryptedOnsRecord, IntroSet, Introduction, NetworkAddress,
};

fn wall_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

fn service_address() -> NetworkAddress {
    NetworkAddress::from_bytes(*Keypair::generate().router_id().as_bytes())
}

#[test]
fn router_contact_survives_the_wire() {
    let keypair = Keypair::generate();
    let rc = keypair.create_contact(vec!["192.0.2.1:7000".into()], [3u8; 32], true);
    assert!(rc.verify().is_ok());

    let frame = LinkFrame::Dht(DhtMessage::GotRouter {
        txid: 7,
        rcs: vec![rc.clone()],
        nearest: vec![],
    });
    let bytes = encode_frame(&frame).expect("encodes");
    let decoded = decode_frame(&bytes).expect("decodes");
    match decoded {
        LinkFrame::Dht(DhtMessage::GotRouter { rcs, .. }) => {
            assert_eq!(rcs[0], rc);
            assert!(rcs[0].verify().is_ok(), "signature survives round trip");
        }
        other => panic!("unexpected frame {other:?}"),
    }
}

#[test]
fn tampered_contact_fails_after_decode() {
    let keypair = Keypair::generate();
    let mut rc = keypair.create_contact(vec!["192.0.2.1:7000".into()], [3u8; 32], false);
    rc.expires_at += 1;
    assert!(rc.verify().is_err());
}

#[test]
fn bootstrap_peer_syntax() {
    let rid = Keypair::generate().router_id();
    let peer: BootstrapPeer = format!("203.0.113.9:9090/{}", rid.to_hex()).parse().unwrap();
    assert_eq!(peer.rid, rid);
    assert!("203.0.113.9:9090".parse::<BootstrapPeer>().is_err());
}

#[test]
fn introset_round_trip_through_the_wire() {
    let address = service_address();
    let introset = IntroSet {
        address,
        intros: vec![Introduction {
            pivot: Keypair::generate().router_id(),
            path_id: HopId::random(),
            expires_at: wall_now_ms() + 60_000,
        }],
    };
    let sealed = EncryptedIntroSet::seal(&introset, wall_now_ms()).expect("seals");
    assert!(sealed.verify(wall_now_ms()));

    let frame = LinkFrame::Dht(DhtMessage::PublishIntroSet {
        txid: 9,
        introset: sealed.clone(),
        relayed: true,
        relay_order: 1,
    });
    let decoded = decode_frame(&encode_frame(&frame).unwrap()).unwrap();
    let LinkFrame::Dht(DhtMessage::PublishIntroSet {
        introset: received, ..
    }) = decoded
    else {
        panic!("unexpected frame");
    };
    assert!(received.verify(wall_now_ms()));
    assert_eq!(received.decrypt(&address), Some(introset));
    // The wrong address never sees the plaintext.
    assert_eq!(received.decrypt(&service_address()), None);
}

#[test]
fn ons_record_binds_to_its_name() {
    let address = service_address();
    let record = EncryptedOnsRecord::seal(&address, "alice.loki").expect("seals");
    assert_eq!(record.decrypt("alice.loki"), Some(address));
    assert_eq!(record.decrypt("mallory.loki"), None);
}

#[test]
fn ons_names_and_addresses_parse() {
    assert!(is_valid_ons("example.loki"));
    assert!(!is_valid_ons("Example.loki"));

    let address = service_address();
    let text = address.to_string();
    assert!(text.ends_with(".loki"));
    assert_eq!(text.parse::<NetworkAddress>().unwrap(), address);
}

#[test]
fn dht_keys_have_stable_text_form() {
    let key = DhtKey::random();
    assert_eq!(DhtKey::from_hex(&key.to_hex()).unwrap(), key);
}

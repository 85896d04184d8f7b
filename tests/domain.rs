use assert_matches::assert_matches;

use myriget::domain::LinkType;
use myriget::error::MyrigetError;
use myriget::sanitize::sanitize;
use myriget::scheduler::is_processable_url;

#[test]
fn parse_link_type() {
    assert_eq!("iso".parse::<LinkType>().unwrap(), LinkType::Iso);
    assert_eq!("XBLA Addons".parse::<LinkType>().unwrap(), LinkType::XblaAddons);
    let err = "dlc".parse::<LinkType>().unwrap_err();
    assert_matches!(err, MyrigetError::InvalidValue(_));
}

#[test]
fn names_are_derived_from_urls() {
    assert_eq!(
        sanitize("https://cdn.example/roms/Forza_Motorsport-2%20(USA).zip?token=abc"),
        "Forza Motorsport 2 Usa"
    );
    assert_eq!(sanitize("http://x/GAME.tar.gz"), "Game");
}

#[test]
fn only_archive_urls_are_processed() {
    assert!(is_processable_url("https://cdn.example/Halo%203.zip?dl=1"));
    assert!(is_processable_url("HTTP://cdn.example/pack.TGZ"));
    assert!(!is_processable_url("https://cdn.example/"));
    assert!(!is_processable_url("magnet:?xt=urn:btih:abc"));
}

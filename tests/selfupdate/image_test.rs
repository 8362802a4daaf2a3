//! Image reference parsing and repo-digest selection.

use guildsync::selfupdate::engine::digest_from_repo_digests;
use guildsync::selfupdate::{ImageReference, DEFAULT_TAG};

use crate::fakes::image;

#[test]
fn parses_host_repository_and_tag() {
    let image: ImageReference = "ghcr.io/owner/app:v2".parse().expect("valid");
    assert_eq!(image.registry, "ghcr.io");
    assert_eq!(image.repository, "owner/app");
    assert_eq!(image.tag, "v2");
    assert_eq!(image.name(), "ghcr.io/owner/app");
    assert_eq!(image.fully_qualified(), "ghcr.io/owner/app:v2");
    assert_eq!(image.registry_base_url(), "https://ghcr.io");
}

#[test]
fn missing_tag_defaults_to_latest() {
    let image: ImageReference = "ghcr.io/owner/app".parse().expect("valid");
    assert_eq!(image.tag, DEFAULT_TAG);
}

#[test]
fn registry_with_port_is_not_mistaken_for_tag() {
    let image: ImageReference = "localhost:5000/app".parse().expect("valid");
    assert_eq!(image.registry, "localhost:5000");
    assert_eq!(image.repository, "app");
    assert_eq!(image.tag, "latest");
}

#[test]
fn rejects_references_without_registry_host() {
    assert!("owner/app:latest".parse::<ImageReference>().is_err());
    assert!("app".parse::<ImageReference>().is_err());
}

#[test]
fn rejects_empty_parts_and_digests() {
    assert!("ghcr.io/".parse::<ImageReference>().is_err());
    assert!("ghcr.io/owner//app".parse::<ImageReference>().is_err());
    assert!("ghcr.io/owner/app:".parse::<ImageReference>().is_err());
    assert!("ghcr.io/owner/app@sha256:abc".parse::<ImageReference>().is_err());
}

#[test]
fn repo_digest_matching_image_name_is_selected() {
    let digests = vec![
        "docker.io/library/other@sha256:111".to_owned(),
        "ghcr.io/guildsync/guildsync@sha256:222".to_owned(),
    ];

    let digest = digest_from_repo_digests(&image(), &digests).expect("digest present");
    assert_eq!(digest.as_str(), "sha256:222");
}

#[test]
fn no_matching_repo_digest_means_absent() {
    let digests = vec!["ghcr.io/guildsync/guildsync-dev@sha256:333".to_owned()];
    assert!(digest_from_repo_digests(&image(), &digests).is_none());
    assert!(digest_from_repo_digests(&image(), &[]).is_none());
}

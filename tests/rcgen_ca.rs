use interpose::{
    certificate_authority::{CertificateAuthority, RcgenAuthority},
    rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, Issuer, KeyPair},
    rustls::crypto::aws_lc_rs,
};
use std::sync::Arc;
use x509_parser::{extensions::GeneralName, parse_x509_certificate};

mod common;

fn custom_ca() -> RcgenAuthority {
    let key_pair = KeyPair::generate().unwrap();
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(DnType::CommonName, "Custom Test Root");

    RcgenAuthority::new(
        Issuer::new(params, key_pair),
        1_000,
        aws_lc_rs::default_provider(),
    )
}

#[tokio::test]
async fn signs_with_existing_root() {
    let ca = custom_ca();
    assert!(ca.ca_cert_pem().is_none());

    let issued = ca.issue_for("Example.COM").await.unwrap();
    let (_, cert) = parse_x509_certificate(issued.certificate()).unwrap();

    assert_eq!(issued.host(), "example.com");
    assert_eq!(
        cert.issuer()
            .iter_common_name()
            .next()
            .unwrap()
            .as_str()
            .unwrap(),
        "Custom Test Root"
    );
    let san = cert.subject_alternative_name().unwrap().unwrap();
    assert!(matches!(
        san.value.general_names.as_slice(),
        [GeneralName::DNSName("example.com")]
    ));
}

#[tokio::test]
async fn server_configs_are_shared_per_host() {
    let ca = common::build_ca();

    let first = ca.gen_server_config("localhost").await.unwrap();
    let second = ca.gen_server_config("LOCALHOST").await.unwrap();
    let other = ca.gen_server_config("127.0.0.1").await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert!(!Arc::ptr_eq(&first, &other));
    assert_eq!(first.alpn_protocols, [b"http/1.1".to_vec()]);
}

#[tokio::test]
async fn generated_root_is_trusted_for_interception() {
    let ca = common::build_ca();
    let roots = common::roots_for(&ca);

    assert_eq!(roots.len(), 1);
}

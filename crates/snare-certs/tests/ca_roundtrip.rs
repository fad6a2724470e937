//! CA generate/write/load round trips against the public API.

use std::time::Duration;

use snare_certs::{CertStore, CERT_ORG};
use snare_core::ErrorKind;
use x509_parser::parse_x509_certificate;

const ONE_HOUR: Duration = Duration::from_secs(60 * 60);

fn write_test_ca(dir: &tempfile::TempDir, key_age: Duration) -> (CertStore, String, String) {
    let store = CertStore::new(2048);
    store.generate_ca(key_age).expect("generate ca");

    let cert_path = dir.path().join("t1.crt").display().to_string();
    let key_path = dir.path().join("t1.key").display().to_string();
    store.write_ca(&cert_path, &key_path).expect("write ca");
    (store, cert_path, key_path)
}

#[test]
fn generated_ca_round_trips_through_pem_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (original, cert_path, key_path) = write_test_ca(&dir, ONE_HOUR);

    let reloaded = CertStore::new(2048);
    reloaded.load_ca(&key_path, &cert_path).expect("load ca");

    let original_der = original.ca_cert_der().expect("original der");
    let reloaded_der = reloaded.ca_cert_der().expect("reloaded der");

    let (_, original_cert) = parse_x509_certificate(original_der.as_ref()).expect("parse");
    let (_, reloaded_cert) = parse_x509_certificate(reloaded_der.as_ref()).expect("parse");
    assert_eq!(original_cert.raw_serial(), reloaded_cert.raw_serial());

    let organization = reloaded_cert
        .subject()
        .iter_organization()
        .next()
        .expect("organization")
        .as_str()
        .expect("utf8 organization");
    assert_eq!(organization, CERT_ORG);
    assert!(reloaded_cert.is_ca());

    let validity = reloaded_cert.validity();
    let width = validity.not_after.timestamp() - validity.not_before.timestamp();
    assert_eq!(width, ONE_HOUR.as_secs() as i64);
}

#[test]
fn loaded_ca_key_age_is_the_residual_validity() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_, cert_path, key_path) = write_test_ca(&dir, ONE_HOUR);

    let reloaded = CertStore::new(2048);
    reloaded.load_ca(&key_path, &cert_path).expect("load ca");

    let key_age = reloaded.key_age();
    assert!(key_age <= ONE_HOUR);
    assert!(key_age >= ONE_HOUR - Duration::from_secs(1), "{key_age:?}");
}

#[test]
fn reloaded_ca_signs_leaves_the_original_issued() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_, cert_path, key_path) = write_test_ca(&dir, ONE_HOUR);

    let reloaded = CertStore::new(2048);
    reloaded.load_ca(&key_path, &cert_path).expect("load ca");
    let leaf = reloaded.get("victim.test").expect("get").expect("leaf");

    let ca_der = reloaded.ca_cert_der().expect("ca der");
    let (_, ca_cert) = parse_x509_certificate(ca_der.as_ref()).expect("parse ca");
    let (_, leaf_cert) = parse_x509_certificate(leaf.cert[0].as_ref()).expect("parse leaf");
    assert_eq!(leaf_cert.issuer(), ca_cert.subject());
}

#[test]
fn load_ca_reports_missing_files_as_read_errors() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CertStore::new(2048);
    let error = store
        .load_ca(
            &dir.path().join("absent.key").display().to_string(),
            &dir.path().join("absent.crt").display().to_string(),
        )
        .expect_err("missing files");
    assert!(error.is(ErrorKind::CaRead));
}

#[test]
fn write_ca_without_a_ca_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CertStore::new(2048);
    let error = store
        .write_ca(
            &dir.path().join("ca.crt").display().to_string(),
            &dir.path().join("ca.key").display().to_string(),
        )
        .expect_err("no ca yet");
    assert!(error.is(ErrorKind::NoCa));
}

#[cfg(unix)]
#[test]
fn ca_files_are_written_mode_0600() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("tempdir");
    let (_, cert_path, key_path) = write_test_ca(&dir, ONE_HOUR);

    for path in [cert_path, key_path] {
        let mode = std::fs::metadata(&path)
            .expect("metadata")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600, "{path}");
    }
}

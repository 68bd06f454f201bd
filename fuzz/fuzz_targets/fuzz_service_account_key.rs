#![no_main]

use cloudsql_connector::auth::ServiceAccountKey;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Must never panic, whatever the input
    if let Ok(key) = ServiceAccountKey::from_json(data) {
        assert_eq!(key.key_type, "service_account");
        assert!(!key.client_email.is_empty());
    }
});

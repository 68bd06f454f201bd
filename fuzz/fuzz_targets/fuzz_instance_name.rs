#![no_main]

use cloudsql_connector::InstanceName;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    if let Ok(name) = InstanceName::parse(data) {
        // Anything accepted must print back to a name that parses to itself
        let printed = name.to_string();
        let reparsed = InstanceName::parse(&printed).expect("printed name must parse");
        assert_eq!(name, reparsed);
        assert!(!name.region().contains(':'));
        assert!(!name.name().contains(':'));
    }
});

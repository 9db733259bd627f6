#![no_main]

use libfuzzer_sys::fuzz_target;
use mqnic_core::AdapterConfig;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(config) = AdapterConfig::from_toml_str(text) else {
        return;
    };

    // Anything that validated must survive a round trip
    let rendered = config.to_toml_string().expect("valid config serializes");
    let reparsed = AdapterConfig::from_toml_str(&rendered).expect("rendered config parses");
    assert_eq!(config, reparsed);
});
